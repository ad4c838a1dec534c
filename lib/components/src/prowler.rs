use std::sync::Arc;

use engine::{
  dispatch::{ResolvedRunner, run_component_with_runner},
  docker::{ContainerSpec, IsolatedVolume},
};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use studio_types::{
  JsonObject,
  component::{
    ComponentCategory, ComponentDefinition, DockerRunnerConfig,
    ResolvedNode, RetryPolicy, RunnerConfig,
  },
  context::ExecutionContext,
  errors::{ErrorKind, ExecuteError, ExecuteResult},
  schema::{PortMap, Schema, contracts},
};

use crate::common::{self, Finding};

const IMAGE: &str = "toniblyx/prowler:latest";

/// Prowler exits 3 when any check failed, meaning findings are
/// present. That is the result we came for.
const FINDINGS_PRESENT_EXIT: i64 = 3;

fn runner() -> DockerRunnerConfig {
  DockerRunnerConfig {
    image: IMAGE.into(),
    platform: Some(String::from("linux/amd64")),
    timeout_seconds: 3600,
    expected_exit_codes: vec![FINDINGS_PRESENT_EXIT],
    ..Default::default()
  }
}

pub fn definition() -> ComponentDefinition {
  ComponentDefinition {
    id: "studio.cloud.prowler".into(),
    label: "Prowler AWS".into(),
    category: ComponentCategory::Cloud,
    version: "1.4.0".into(),
    description:
      "Run the Prowler posture scanner against an AWS account and normalize the ASFF findings."
        .into(),
    inputs: PortMap::new().port(
      "credentials",
      Schema::contract(contracts::AWS_CREDENTIAL)
        .label("AWS Credentials")
        .required(),
    ),
    parameters: PortMap::new().port(
      "regions",
      Schema::text()
        .label("Regions")
        .description(
          "Comma separated region list. Empty scans every enabled region.",
        ),
    ),
    outputs: PortMap::new()
      .port("findings", Schema::list(Schema::json()).required())
      .port("summary", Schema::json().required())
      .port("stderr", Schema::text().with_default(""))
      .port("errors", Schema::list(Schema::text())),
    runner: RunnerConfig::Docker(runner()),
    retry: RetryPolicy::default(),
    execute: Arc::new(|node, ctx| Box::pin(execute(node, ctx))),
  }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProwlerSummary {
  total_findings: usize,
  by_severity: IndexMap<String, usize>,
  report_files: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProwlerOutput {
  findings: Vec<Finding>,
  summary: ProwlerSummary,
  stderr: String,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  errors: Vec<String>,
}

async fn execute(
  node: ResolvedNode,
  ctx: ExecutionContext,
) -> ExecuteResult<JsonObject> {
  let credentials = node
    .inputs
    .get("credentials")
    .and_then(Value::as_object)
    .cloned()
    .ok_or_else(|| {
      ExecuteError::configuration("aws credentials not wired")
    })?;
  let regions = parse_regions(&node.params);

  let mut volume = IsolatedVolume::new(&ctx)?;
  let result =
    scan(&mut volume, &credentials, &regions, &ctx).await;
  volume.cleanup().await;
  result
}

fn parse_regions(params: &JsonObject) -> Vec<String> {
  common::get_str(params, "regions")
    .map(|raw| {
      raw
        .split(',')
        .map(str::trim)
        .filter(|region| !region.is_empty())
        .map(String::from)
        .collect()
    })
    .unwrap_or_default()
}

async fn scan(
  volume: &mut IsolatedVolume,
  credentials: &JsonObject,
  regions: &[String],
  ctx: &ExecutionContext,
) -> ExecuteResult<JsonObject> {
  // Output staging only; prowler writes its reports here.
  volume.initialize(&IndexMap::new()).await?;
  if regions.is_empty() {
    ctx.info("scanning all enabled regions");
  } else {
    ctx.info(format!("scanning regions {}", regions.join(", ")));
  }

  let mut spec = ContainerSpec::from_runner(&runner());
  spec.command = vec![
    String::from("aws"),
    String::from("-M"),
    String::from("json-asff"),
    String::from("-o"),
    String::from("/output"),
  ];
  if !regions.is_empty() {
    spec.command.push(String::from("-f"));
    spec.command.extend(regions.iter().cloned());
  }
  // Credentials travel as environment only: never argv, never
  // logs, never error details.
  for (key, env_var) in [
    ("accessKeyId", "AWS_ACCESS_KEY_ID"),
    ("secretAccessKey", "AWS_SECRET_ACCESS_KEY"),
    ("sessionToken", "AWS_SESSION_TOKEN"),
  ] {
    if let Some(value) = common::get_str(credentials, key) {
      spec.env.insert(String::from(env_var), value.to_string());
    }
  }
  spec.volumes.push(volume.volume_config("/output", false)?);

  let exit = run_component_with_runner(
    ResolvedRunner::Docker(spec),
    common::not_inline,
    ctx,
  )
  .await
  .map_err(reclassify_auth_failure)?
  .container()?;
  if exit.expected_exit {
    ctx.info("prowler reported findings present (exit 3)");
  }

  let mut errors = Vec::new();
  let report_files = volume
    .list_files()
    .await?
    .into_iter()
    .filter(|name| name.ends_with(".json"))
    .collect::<Vec<_>>();
  let reports = volume.read_files(&report_files).await?;

  let mut findings = Vec::new();
  for (name, content) in &reports {
    match parse_asff(content) {
      Ok(parsed) => findings.extend(parsed),
      Err(e) => {
        ctx.warn(format!("failed to parse report '{name}': {e}"));
        errors.push(format!("unparseable report '{name}'"));
      }
    }
  }
  if findings.is_empty() && exit.expected_exit {
    return Err(
      ExecuteError::service(
        "prowler signaled findings but no report parsed",
      )
      .with_detail("reportFiles", report_files.len()),
    );
  }

  let mut by_severity: IndexMap<String, usize> = IndexMap::new();
  for finding in &findings {
    *by_severity
      .entry(finding.severity.to_lowercase())
      .or_default() += 1;
  }
  ctx.info(format!(
    "{} findings across {} report files",
    findings.len(),
    reports.len()
  ));
  common::to_output(&ProwlerOutput {
    summary: ProwlerSummary {
      total_findings: findings.len(),
      by_severity,
      report_files: reports.len(),
    },
    findings,
    stderr: exit.stderr,
    errors,
  })
}

/// Prowler signals bad credentials through stderr while the
/// container itself ran fine. That is an upstream failure, not a
/// container one.
fn reclassify_auth_failure(e: ExecuteError) -> ExecuteError {
  if e.kind != ErrorKind::Container {
    return e;
  }
  let stderr = e
    .details
    .get("stderr")
    .and_then(Value::as_str)
    .unwrap_or_default();
  let auth_markers = [
    "InvalidClientTokenId",
    "SignatureDoesNotMatch",
    "ExpiredToken",
    "AccessDenied",
    "AuthFailure",
  ];
  if auth_markers.iter().any(|marker| stderr.contains(marker)) {
    let mut e = e;
    e.kind = ErrorKind::Service;
    e.message =
      String::from("aws rejected the provided credentials");
    e
  } else {
    e
  }
}

/// An ASFF report is a json array of findings.
fn parse_asff(content: &str) -> anyhow::Result<Vec<Finding>> {
  let records: Vec<Value> = serde_json::from_str(content)?;
  Ok(records.iter().map(normalize_finding).collect())
}

fn normalize_finding(record: &Value) -> Finding {
  Finding {
    id: record["Id"].as_str().unwrap_or_default().to_string(),
    title: record["Title"]
      .as_str()
      .unwrap_or_default()
      .to_string(),
    severity: record["Severity"]["Label"]
      .as_str()
      .unwrap_or("INFORMATIONAL")
      .to_string(),
    status: record["Compliance"]["Status"]
      .as_str()
      .unwrap_or_default()
      .to_string(),
    resource_id: record["Resources"][0]["Id"]
      .as_str()
      .unwrap_or_default()
      .to_string(),
    region: record["Region"].as_str().map(String::from),
    description: record["Description"]
      .as_str()
      .map(String::from),
    remediation: record["Remediation"]["Recommendation"]["Text"]
      .as_str()
      .map(String::from),
  }
}

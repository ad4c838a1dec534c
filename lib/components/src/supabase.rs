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
  errors::{ExecuteError, ExecuteResult},
  schema::{PortMap, Schema, contracts},
};

use crate::common::{self, Finding};

const IMAGE: &str = "ghcr.io/studio-sec/supabase-scanner:latest";
const REPORT_FILE: &str = "report.json";

fn runner() -> DockerRunnerConfig {
  DockerRunnerConfig {
    image: IMAGE.into(),
    timeout_seconds: 900,
    ..Default::default()
  }
}

pub fn definition() -> ComponentDefinition {
  ComponentDefinition {
    id: "studio.cloud.supabase-scanner".into(),
    label: "Supabase Scanner".into(),
    category: ComponentCategory::Cloud,
    version: "1.0.1".into(),
    description:
      "Audit a Supabase project for exposed tables, storage buckets and weak policies."
        .into(),
    inputs: PortMap::new().port(
      "credentials",
      Schema::contract(contracts::SUPABASE_CREDENTIAL)
        .label("Supabase Credentials")
        .required(),
    ),
    parameters: PortMap::new().port(
      "includeStorage",
      Schema::boolean()
        .label("Include Storage Buckets")
        .with_default(true),
    ),
    outputs: PortMap::new()
      .port("findings", Schema::list(Schema::json()).required())
      .port("findingCount", Schema::number().required())
      .port("rawOutput", Schema::text().with_default(""))
      .port("errors", Schema::list(Schema::text())),
    runner: RunnerConfig::Docker(runner()),
    retry: RetryPolicy::default(),
    execute: Arc::new(|node, ctx| Box::pin(execute(node, ctx))),
  }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SupabaseOutput {
  findings: Vec<Finding>,
  finding_count: usize,
  raw_output: String,
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
      ExecuteError::configuration(
        "supabase credentials not wired",
      )
    })?;
  let include_storage =
    common::get_bool(&node.params, "includeStorage")
      .unwrap_or(true);

  // The scan config (including the service role key) only ever
  // exists inside the per-run sandbox volume.
  let scan_config = serde_json::json!({
    "projectUrl": credentials["projectUrl"],
    "serviceRoleKey": credentials["serviceRoleKey"],
    "includeStorage": include_storage,
    "output": format!("/data/{REPORT_FILE}"),
  });
  let files = [(
    String::from("config.json"),
    scan_config.to_string(),
  )]
  .into_iter()
  .collect::<IndexMap<_, _>>();

  let mut volume = IsolatedVolume::new(&ctx)?;
  let result = scan(&mut volume, &files, &ctx).await;
  volume.cleanup().await;
  result
}

async fn scan(
  volume: &mut IsolatedVolume,
  files: &IndexMap<String, String>,
  ctx: &ExecutionContext,
) -> ExecuteResult<JsonObject> {
  volume.initialize(files).await?;
  ctx.info("scanning supabase project");

  let mut spec = ContainerSpec::from_runner(&runner());
  spec.command = vec![
    String::from("--config"),
    String::from("/data/config.json"),
    String::from("--output"),
    format!("/data/{REPORT_FILE}"),
  ];
  spec.volumes.push(volume.volume_config("/data", false)?);

  let exit = run_component_with_runner(
    ResolvedRunner::Docker(spec),
    common::not_inline,
    ctx,
  )
  .await?
  .container()?;

  let reports = volume
    .read_files(&[String::from(REPORT_FILE)])
    .await?;
  let Some(report) = reports.get(REPORT_FILE) else {
    return Err(
      ExecuteError::service("scanner produced no report")
        .with_detail("exitCode", exit.exit_code),
    );
  };
  let (findings, errors) = parse_report(report).map_err(|e| {
    ExecuteError::service("scanner report is not valid json")
      .with_cause(e)
  })?;

  ctx.info(format!("{} findings reported", findings.len()));
  common::to_output(&SupabaseOutput {
    finding_count: findings.len(),
    raw_output: exit.stdout,
    findings,
    errors,
  })
}

/// Report shape: `{ findings: [...], errors?: [...] }`.
fn parse_report(
  report: &str,
) -> anyhow::Result<(Vec<Finding>, Vec<String>)> {
  let report: Value = serde_json::from_str(report)?;
  let findings = report["findings"]
    .as_array()
    .map(|records| {
      records.iter().map(normalize_finding).collect()
    })
    .unwrap_or_default();
  let errors = report["errors"]
    .as_array()
    .map(|errors| {
      errors
        .iter()
        .filter_map(Value::as_str)
        .map(String::from)
        .collect()
    })
    .unwrap_or_default();
  Ok((findings, errors))
}

fn normalize_finding(record: &Value) -> Finding {
  Finding {
    id: record["id"].as_str().unwrap_or_default().to_string(),
    title: record["title"]
      .as_str()
      .unwrap_or_default()
      .to_string(),
    severity: record["severity"]
      .as_str()
      .unwrap_or("info")
      .to_string(),
    status: record["status"]
      .as_str()
      .unwrap_or("open")
      .to_string(),
    resource_id: record["resource"]
      .as_str()
      .unwrap_or_default()
      .to_string(),
    region: None,
    description: record["description"]
      .as_str()
      .map(String::from),
    remediation: record["remediation"]
      .as_str()
      .map(String::from),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const REPORT: &str = r#"{
    "findings": [
      {
        "id": "rls-disabled-public-users",
        "title": "Row level security disabled",
        "severity": "critical",
        "resource": "public.users",
        "remediation": "Enable RLS and add policies."
      }
    ],
    "errors": ["storage: listing buckets timed out"]
  }"#;

  #[test]
  fn report_parses_findings_and_errors() {
    let (findings, errors) = parse_report(REPORT).unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].severity, "critical");
    assert_eq!(findings[0].resource_id, "public.users");
    assert_eq!(findings[0].status, "open");
    assert_eq!(errors.len(), 1);
  }

  #[test]
  fn empty_report_is_valid() {
    let (findings, errors) =
      parse_report(r#"{"findings":[]}"#).unwrap();
    assert!(findings.is_empty());
    assert!(errors.is_empty());
  }

  #[test]
  fn definition_passes_self_check() {
    definition().self_check().unwrap();
  }
}

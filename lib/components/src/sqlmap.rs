use std::sync::{Arc, OnceLock};

use engine::{
  dispatch::{ResolvedRunner, run_component_with_runner},
  docker::{ContainerSpec, IsolatedVolume},
};
use indexmap::IndexMap;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use studio_types::{
  JsonObject,
  component::{
    ComponentCategory, ComponentDefinition, DockerRunnerConfig,
    ResolvedNode, RetryPolicy, RunnerConfig,
  },
  context::ExecutionContext,
  errors::ExecuteResult,
  schema::{PortMap, Schema},
};

use crate::common;

const IMAGE: &str = "parrotsec/sqlmap:latest";

fn runner() -> DockerRunnerConfig {
  DockerRunnerConfig {
    image: IMAGE.into(),
    // No ARM build published for the sqlmap image.
    platform: Some(String::from("linux/amd64")),
    timeout_seconds: 3600,
    ..Default::default()
  }
}

pub fn definition() -> ComponentDefinition {
  ComponentDefinition {
    id: "studio.dast.sqlmap".into(),
    label: "SQLMap".into(),
    category: ComponentCategory::Dast,
    version: "1.1.0".into(),
    description:
      "Test urls for SQL injection with sqlmap in batch mode."
        .into(),
    inputs: PortMap::new().port(
      "targetUrls",
      Schema::list(Schema::text())
        .label("Target URLs")
        .required(),
    ),
    parameters: PortMap::new()
      .port(
        "level",
        Schema::number().label("Level").with_default(1),
      )
      .port(
        "risk",
        Schema::number().label("Risk").with_default(1),
      ),
    outputs: PortMap::new()
      .port("vulnerable", Schema::boolean().required())
      .port("findings", Schema::list(Schema::json()).required())
      .port("findingCount", Schema::number().required())
      .port("rawOutput", Schema::text().with_default("")),
    runner: RunnerConfig::Docker(runner()),
    retry: RetryPolicy::default(),
    execute: Arc::new(|node, ctx| Box::pin(execute(node, ctx))),
  }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SqlmapOutput {
  vulnerable: bool,
  findings: Vec<Value>,
  finding_count: usize,
  raw_output: String,
}

async fn execute(
  node: ResolvedNode,
  ctx: ExecutionContext,
) -> ExecuteResult<JsonObject> {
  let targets = common::string_list(&node.inputs, "targetUrls");
  if targets.is_empty() {
    ctx.info("no target urls provided, skipping injection test");
    return common::to_output(&SqlmapOutput {
      vulnerable: false,
      findings: Vec::new(),
      finding_count: 0,
      raw_output: String::new(),
    });
  }

  let files = [(String::from("targets.txt"), targets.join("\n"))]
    .into_iter()
    .collect::<IndexMap<_, _>>();
  let mut volume = IsolatedVolume::new(&ctx)?;
  let result = test(&mut volume, &files, &targets, &node, &ctx)
    .await;
  volume.cleanup().await;
  result
}

async fn test(
  volume: &mut IsolatedVolume,
  files: &IndexMap<String, String>,
  targets: &[String],
  node: &ResolvedNode,
  ctx: &ExecutionContext,
) -> ExecuteResult<JsonObject> {
  volume.initialize(files).await?;
  let level = common::get_u64(&node.params, "level")
    .unwrap_or(1)
    .clamp(1, 5);
  let risk = common::get_u64(&node.params, "risk")
    .unwrap_or(1)
    .clamp(1, 3);
  ctx.info(format!(
    "testing {} urls (level {level}, risk {risk})",
    targets.len()
  ));

  let mut spec = ContainerSpec::from_runner(&runner());
  spec.command = vec![
    String::from("-m"),
    String::from("/inputs/targets.txt"),
    String::from("--batch"),
    String::from("--level"),
    level.to_string(),
    String::from("--risk"),
    risk.to_string(),
  ];
  spec.volumes.push(volume.volume_config("/inputs", true)?);

  let exit = run_component_with_runner(
    ResolvedRunner::Docker(spec),
    common::not_inline,
    ctx,
  )
  .await?
  .container()?;

  let findings = parse_findings(&exit.stdout);
  ctx.info(format!(
    "{} injection points identified",
    findings.len()
  ));
  common::to_output(&SqlmapOutput {
    vulnerable: !findings.is_empty(),
    finding_count: findings.len(),
    raw_output: exit.stdout,
    findings,
  })
}

fn parameter_pattern() -> &'static Regex {
  static PATTERN: OnceLock<Regex> = OnceLock::new();
  PATTERN.get_or_init(|| {
    Regex::new(r"^Parameter:\s+(?<parameter>\S+)\s+\((?<place>[^)]+)\)")
      .expect("invalid parameter pattern")
  })
}

/// Parse the injection point blocks sqlmap prints:
///
/// ```text
/// Parameter: id (GET)
///     Type: boolean-based blind
///     Title: AND boolean-based blind - WHERE or HAVING clause
///     Payload: id=1 AND 1=1
/// ```
fn parse_findings(stdout: &str) -> Vec<Value> {
  let mut findings = Vec::new();
  let mut parameter: Option<(String, String)> = None;
  let mut technique: Option<String> = None;
  let mut title: Option<String> = None;
  for line in stdout.lines() {
    let trimmed = line.trim();
    if let Some(captures) = parameter_pattern().captures(trimmed)
    {
      parameter = Some((
        captures["parameter"].to_string(),
        captures["place"].to_string(),
      ));
      technique = None;
      title = None;
      continue;
    }
    let Some((name, place)) = &parameter else {
      continue;
    };
    if let Some(value) = trimmed.strip_prefix("Type: ") {
      technique = Some(value.to_string());
    } else if let Some(value) = trimmed.strip_prefix("Title: ") {
      title = Some(value.to_string());
    } else if let Some(value) = trimmed.strip_prefix("Payload: ")
    {
      findings.push(serde_json::json!({
        "parameter": name,
        "place": place,
        "technique": technique.take(),
        "title": title.take(),
        "payload": value,
      }));
    }
  }
  findings
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  const STDOUT: &str = "\
sqlmap identified the following injection point(s) with a total of 46 HTTP(s) requests:
---
Parameter: id (GET)
    Type: boolean-based blind
    Title: AND boolean-based blind - WHERE or HAVING clause
    Payload: id=1 AND 5915=5915

    Type: time-based blind
    Title: MySQL >= 5.0.12 AND time-based blind (query SLEEP)
    Payload: id=1 AND (SELECT 8167 FROM (SELECT(SLEEP(5)))x)
---
[12:00:01] [INFO] the back-end DBMS is MySQL";

  #[test]
  fn parser_extracts_every_technique_block() {
    let findings = parse_findings(STDOUT);
    assert_eq!(findings.len(), 2);
    assert_eq!(findings[0]["parameter"], json!("id"));
    assert_eq!(findings[0]["place"], json!("GET"));
    assert_eq!(
      findings[0]["technique"],
      json!("boolean-based blind")
    );
    assert_eq!(findings[1]["technique"], json!("time-based blind"));
    assert!(
      findings[1]["payload"]
        .as_str()
        .unwrap()
        .contains("SLEEP")
    );
  }

  #[test]
  fn clean_scans_produce_no_findings() {
    let findings = parse_findings(
      "[12:00:01] [WARNING] GET parameter 'id' does not seem to be injectable",
    );
    assert!(findings.is_empty());
  }

  #[test]
  fn definition_passes_self_check() {
    definition().self_check().unwrap();
  }
}

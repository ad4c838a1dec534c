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
  errors::ExecuteResult,
  schema::{PortMap, Schema},
};

use crate::common;

const IMAGE: &str = "projectdiscovery/katana:latest";
const DEFAULT_TIMEOUT_SECONDS: u64 = 600;

fn runner() -> DockerRunnerConfig {
  DockerRunnerConfig {
    image: IMAGE.into(),
    timeout_seconds: common::env_timeout_seconds(
      "KATANA_TIMEOUT_SECONDS",
      DEFAULT_TIMEOUT_SECONDS,
    ),
    ..Default::default()
  }
}

pub fn definition() -> ComponentDefinition {
  ComponentDefinition {
    id: "studio.recon.katana".into(),
    label: "Katana".into(),
    category: ComponentCategory::Recon,
    version: "1.1.0".into(),
    description: "Crawl target sites and map their endpoints."
      .into(),
    inputs: PortMap::new().port(
      "targets",
      Schema::list(Schema::text()).label("Targets").required(),
    ),
    parameters: PortMap::new()
      .port(
        "depth",
        Schema::number().label("Crawl Depth").with_default(3),
      )
      .port(
        "jsCrawl",
        Schema::boolean()
          .label("Crawl Javascript")
          .description("Parse endpoints out of script files as well.")
          .with_default(false),
      ),
    outputs: PortMap::new()
      .port("endpoints", Schema::list(Schema::json()).required())
      .port("endpointCount", Schema::number().required())
      .port("targetCount", Schema::number().required())
      .port("rawOutput", Schema::text().with_default("")),
    runner: RunnerConfig::Docker(runner()),
    retry: RetryPolicy::default(),
    execute: Arc::new(|node, ctx| Box::pin(execute(node, ctx))),
  }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KatanaOutput {
  endpoints: Vec<Value>,
  endpoint_count: usize,
  target_count: usize,
  raw_output: String,
}

async fn execute(
  node: ResolvedNode,
  ctx: ExecutionContext,
) -> ExecuteResult<JsonObject> {
  let targets = common::string_list(&node.inputs, "targets");
  if targets.is_empty() {
    ctx.info("no targets provided, skipping crawl");
    return common::to_output(&KatanaOutput {
      endpoints: Vec::new(),
      endpoint_count: 0,
      target_count: 0,
      raw_output: String::new(),
    });
  }

  let files = [(String::from("targets.txt"), targets.join("\n"))]
    .into_iter()
    .collect::<IndexMap<_, _>>();
  let mut volume = IsolatedVolume::new(&ctx)?;
  let result = crawl(&mut volume, &files, &targets, &node, &ctx)
    .await;
  volume.cleanup().await;
  result
}

async fn crawl(
  volume: &mut IsolatedVolume,
  files: &IndexMap<String, String>,
  targets: &[String],
  node: &ResolvedNode,
  ctx: &ExecutionContext,
) -> ExecuteResult<JsonObject> {
  volume.initialize(files).await?;
  let depth = common::get_u64(&node.params, "depth").unwrap_or(3);
  ctx.info(format!(
    "crawling {} targets at depth {depth}",
    targets.len()
  ));

  let mut spec = ContainerSpec::from_runner(&runner());
  spec.command = vec![
    String::from("-silent"),
    String::from("-jsonl"),
    String::from("-list"),
    String::from("/inputs/targets.txt"),
    String::from("-d"),
    depth.to_string(),
  ];
  if common::get_bool(&node.params, "jsCrawl").unwrap_or(false) {
    spec.command.push(String::from("-jc"));
  }
  spec.volumes.push(volume.volume_config("/inputs", true)?);

  let exit = run_component_with_runner(
    ResolvedRunner::Docker(spec),
    common::not_inline,
    ctx,
  )
  .await?
  .container()?;

  let (endpoints, skipped) = parse_endpoints(&exit.stdout);
  if skipped > 0 {
    ctx.warn(format!(
      "{skipped} katana output lines were not parseable json"
    ));
  }
  ctx.info(format!("mapped {} endpoints", endpoints.len()));
  common::to_output(&KatanaOutput {
    endpoint_count: endpoints.len(),
    target_count: targets.len(),
    raw_output: exit.stdout,
    endpoints,
  })
}

/// Normalize katana jsonl records, deduplicating by endpoint url.
fn parse_endpoints(stdout: &str) -> (Vec<Value>, usize) {
  let (records, skipped) = common::parse_ndjson(stdout);
  let mut seen = indexmap::IndexSet::new();
  let mut endpoints = Vec::new();
  for record in records {
    let url = record["request"]["endpoint"]
      .as_str()
      .unwrap_or_default()
      .to_string();
    if url.is_empty() || !seen.insert(url.clone()) {
      continue;
    }
    endpoints.push(serde_json::json!({
      "url": url,
      "method": record["request"]["method"],
      "statusCode": record["response"]["status_code"],
    }));
  }
  (endpoints, skipped)
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn parser_dedupes_endpoints_by_url() {
    let stdout = concat!(
      r#"{"request":{"endpoint":"https://a/x","method":"GET"},"response":{"status_code":200}}"#,
      "\n",
      r#"{"request":{"endpoint":"https://a/x","method":"GET"},"response":{"status_code":200}}"#,
      "\n",
      r#"{"request":{"endpoint":"https://a/y","method":"POST"}}"#,
    );
    let (endpoints, skipped) = parse_endpoints(stdout);
    assert_eq!(skipped, 0);
    assert_eq!(endpoints.len(), 2);
    assert_eq!(endpoints[0]["url"], json!("https://a/x"));
    assert_eq!(endpoints[1]["method"], json!("POST"));
  }

  #[test]
  fn records_without_an_endpoint_are_dropped() {
    let (endpoints, _) =
      parse_endpoints(r#"{"request":{"method":"GET"}}"#);
    assert!(endpoints.is_empty());
  }

  #[test]
  fn definition_passes_self_check() {
    definition().self_check().unwrap();
  }
}

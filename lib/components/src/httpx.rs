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

const IMAGE: &str = "projectdiscovery/httpx:latest";
const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

fn runner() -> DockerRunnerConfig {
  DockerRunnerConfig {
    image: IMAGE.into(),
    timeout_seconds: common::env_timeout_seconds(
      "HTTPX_TIMEOUT_SECONDS",
      DEFAULT_TIMEOUT_SECONDS,
    ),
    ..Default::default()
  }
}

pub fn definition() -> ComponentDefinition {
  ComponentDefinition {
    id: "studio.recon.httpx".into(),
    label: "httpx".into(),
    category: ComponentCategory::Recon,
    version: "1.3.0".into(),
    description:
      "Probe a list of hosts / urls for live HTTP services."
        .into(),
    inputs: PortMap::new().port(
      "targets",
      Schema::list(Schema::text()).label("Targets").required(),
    ),
    parameters: PortMap::new()
      .port(
        "threads",
        Schema::number().label("Threads").with_default(50),
      )
      .port(
        "timeout",
        Schema::number()
          .label("Per-request Timeout Seconds")
          .with_default(10),
      )
      .port(
        "followRedirects",
        Schema::boolean()
          .label("Follow Redirects")
          .with_default(true),
      )
      .port(
        "techDetect",
        Schema::boolean()
          .label("Technology Detection")
          .with_default(true),
      ),
    outputs: PortMap::new()
      .port("results", Schema::list(Schema::json()).required())
      .port("rawOutput", Schema::text().with_default(""))
      .port("targetCount", Schema::number().required())
      .port("resultCount", Schema::number().required())
      .port("options", Schema::json().required()),
    runner: RunnerConfig::Docker(runner()),
    retry: RetryPolicy::default(),
    execute: Arc::new(|node, ctx| Box::pin(execute(node, ctx))),
  }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
struct HttpxOptions {
  threads: u64,
  timeout: u64,
  follow_redirects: bool,
  tech_detect: bool,
}

impl HttpxOptions {
  fn from_params(params: &JsonObject) -> HttpxOptions {
    HttpxOptions {
      threads: common::get_u64(params, "threads").unwrap_or(50),
      timeout: common::get_u64(params, "timeout").unwrap_or(10),
      follow_redirects: common::get_bool(
        params,
        "followRedirects",
      )
      .unwrap_or(true),
      tech_detect: common::get_bool(params, "techDetect")
        .unwrap_or(true),
    }
  }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HttpxOutput {
  results: Vec<Value>,
  raw_output: String,
  target_count: usize,
  result_count: usize,
  options: HttpxOptions,
}

async fn execute(
  node: ResolvedNode,
  ctx: ExecutionContext,
) -> ExecuteResult<JsonObject> {
  let targets = common::string_list(&node.inputs, "targets");
  let options = HttpxOptions::from_params(&node.params);
  if targets.is_empty() {
    ctx.info("no targets provided, skipping probe");
    return common::to_output(&HttpxOutput {
      results: Vec::new(),
      raw_output: String::new(),
      target_count: 0,
      result_count: 0,
      options,
    });
  }

  let files = [(String::from("targets.txt"), targets.join("\n"))]
    .into_iter()
    .collect::<IndexMap<_, _>>();
  let mut volume = IsolatedVolume::new(&ctx)?;
  let result =
    probe(&mut volume, &files, &targets, options, &ctx).await;
  volume.cleanup().await;
  result
}

async fn probe(
  volume: &mut IsolatedVolume,
  files: &IndexMap<String, String>,
  targets: &[String],
  options: HttpxOptions,
  ctx: &ExecutionContext,
) -> ExecuteResult<JsonObject> {
  volume.initialize(files).await?;
  ctx.info(format!("probing {} targets", targets.len()));

  let mut spec = ContainerSpec::from_runner(&runner());
  spec.command = vec![
    String::from("-silent"),
    String::from("-json"),
    String::from("-list"),
    String::from("/inputs/targets.txt"),
    String::from("-threads"),
    options.threads.to_string(),
    String::from("-timeout"),
    options.timeout.to_string(),
  ];
  if options.follow_redirects {
    spec.command.push(String::from("-follow-redirects"));
  }
  if options.tech_detect {
    spec.command.push(String::from("-tech-detect"));
  }
  spec.volumes.push(volume.volume_config("/inputs", true)?);

  let exit = run_component_with_runner(
    ResolvedRunner::Docker(spec),
    common::not_inline,
    ctx,
  )
  .await?
  .container()?;

  let (results, skipped) = parse_results(&exit.stdout);
  if skipped > 0 {
    ctx.warn(format!(
      "{skipped} httpx output lines were not parseable json"
    ));
  }
  ctx.info(format!("{} live services found", results.len()));
  common::to_output(&HttpxOutput {
    target_count: targets.len(),
    result_count: results.len(),
    raw_output: exit.stdout,
    results,
    options,
  })
}

/// Normalize httpx json-lines into stable result records.
fn parse_results(stdout: &str) -> (Vec<Value>, usize) {
  let (records, skipped) = common::parse_ndjson(stdout);
  let results = records
    .into_iter()
    .map(|record| {
      serde_json::json!({
        "url": record["url"],
        "host": record["host"],
        "port": record["port"],
        "scheme": record["scheme"],
        "statusCode": record["status_code"],
        "title": record["title"],
        "webserver": record["webserver"],
        "tech": record["tech"],
      })
    })
    .collect();
  (results, skipped)
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[tokio::test]
  async fn empty_targets_short_circuit_without_a_container() {
    let def = definition();
    let raw = json!({ "targets": [] });
    let inputs = def
      .inputs
      .parse_object(raw.as_object().unwrap())
      .unwrap();
    let params =
      def.parameters.parse_object(&JsonObject::new()).unwrap();
    let (ctx, _rx) =
      ExecutionContext::builder("run-1", "tenant-1").build();
    let node = ResolvedNode { inputs, params };
    let outputs = execute(node, ctx).await.unwrap();
    assert_eq!(outputs["results"], json!([]));
    assert_eq!(outputs["rawOutput"], json!(""));
    assert_eq!(outputs["targetCount"], json!(0));
    assert_eq!(outputs["resultCount"], json!(0));
    assert_eq!(outputs["options"]["threads"], json!(50));
    assert_eq!(
      outputs["options"]["followRedirects"],
      json!(true)
    );
    // And the zeroed output satisfies the declared contract.
    def.outputs.parse_object(&outputs).unwrap();
  }

  #[test]
  fn parser_normalizes_status_and_tech_fields() {
    let stdout = concat!(
      r#"{"url":"https://a.example.com","host":"a.example.com","port":"443","scheme":"https","status_code":200,"title":"Login","webserver":"nginx","tech":["React"]}"#,
      "\n",
      r#"{"url":"http://b.example.com","status_code":301}"#,
    );
    let (results, skipped) = parse_results(stdout);
    assert_eq!(skipped, 0);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["statusCode"], json!(200));
    assert_eq!(results[0]["tech"], json!(["React"]));
    assert_eq!(results[1]["statusCode"], json!(301));
  }

  #[test]
  fn definition_passes_self_check() {
    definition().self_check().unwrap();
  }
}

use std::sync::Arc;

use engine::{
  dispatch::{ResolvedRunner, run_component_with_runner},
  docker::{ContainerSpec, IsolatedVolume},
};
use indexmap::IndexMap;
use serde::Serialize;
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

const IMAGE: &str = "projectdiscovery/subfinder:latest";

fn runner() -> DockerRunnerConfig {
  DockerRunnerConfig {
    image: IMAGE.into(),
    timeout_seconds: 900,
    ..Default::default()
  }
}

pub fn definition() -> ComponentDefinition {
  ComponentDefinition {
    id: "studio.recon.subfinder".into(),
    label: "Subfinder".into(),
    category: ComponentCategory::Recon,
    version: "1.3.0".into(),
    description:
      "Passive subdomain enumeration over a list of apex domains."
        .into(),
    inputs: PortMap::new()
      .port(
        "domains",
        Schema::list(Schema::text()).label("Domains").required(),
      )
      .port(
        "providerConfig",
        Schema::secret()
          .label("Provider Config")
          .description(
            "subfinder provider-config.yaml with API keys for passive sources",
          ),
      ),
    parameters: PortMap::new(),
    outputs: PortMap::new()
      .port("subdomains", Schema::list(Schema::text()).required())
      .port("domainCount", Schema::number().required())
      .port("subdomainCount", Schema::number().required())
      .port("rawOutput", Schema::text().with_default("")),
    runner: RunnerConfig::Docker(runner()),
    retry: RetryPolicy::default(),
    execute: Arc::new(|node, ctx| Box::pin(execute(node, ctx))),
  }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubfinderOutput {
  subdomains: Vec<String>,
  domain_count: usize,
  subdomain_count: usize,
  raw_output: String,
}

async fn execute(
  node: ResolvedNode,
  ctx: ExecutionContext,
) -> ExecuteResult<JsonObject> {
  let domains = common::string_list(&node.inputs, "domains");
  if domains.is_empty() {
    ctx.info("no domains provided, skipping enumeration");
    return common::to_output(&SubfinderOutput {
      subdomains: Vec::new(),
      domain_count: 0,
      subdomain_count: 0,
      raw_output: String::new(),
    });
  }

  let mut files = IndexMap::new();
  files
    .insert(String::from("domains.txt"), domains.join("\n"));
  if let Some(secret_id) =
    common::get_str(&node.inputs, "providerConfig")
  {
    let config = ctx.secret(secret_id).await?.value;
    files.insert(String::from("provider-config.yaml"), config);
  }

  let mut volume = IsolatedVolume::new(&ctx)?;
  let result = enumerate(&mut volume, &files, &domains, &ctx).await;
  volume.cleanup().await;
  result
}

async fn enumerate(
  volume: &mut IsolatedVolume,
  files: &IndexMap<String, String>,
  domains: &[String],
  ctx: &ExecutionContext,
) -> ExecuteResult<JsonObject> {
  volume.initialize(files).await?;
  ctx.info(format!(
    "enumerating subdomains for {} domains",
    domains.len()
  ));

  let mut spec = ContainerSpec::from_runner(&runner());
  spec.command = vec![
    String::from("-silent"),
    String::from("-dL"),
    String::from("/inputs/domains.txt"),
  ];
  if files.contains_key("provider-config.yaml") {
    spec.command.extend([
      String::from("-provider-config"),
      String::from("/inputs/provider-config.yaml"),
    ]);
  }
  spec.volumes.push(volume.volume_config("/inputs", true)?);

  let exit = run_component_with_runner(
    ResolvedRunner::Docker(spec),
    common::not_inline,
    ctx,
  )
  .await?
  .container()?;

  let subdomains = parse_subdomains(&exit.stdout);
  ctx.info(format!("found {} subdomains", subdomains.len()));
  common::to_output(&SubfinderOutput {
    domain_count: domains.len(),
    subdomain_count: subdomains.len(),
    raw_output: exit.stdout,
    subdomains,
  })
}

fn parse_subdomains(stdout: &str) -> Vec<String> {
  stdout
    .lines()
    .map(str::trim)
    .filter(|line| !line.is_empty())
    .map(String::from)
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parser_splits_and_trims_stdout_lines() {
    let stdout = "a.example.com\nb.example.com\n\n  c.example.com  ";
    assert_eq!(
      parse_subdomains(stdout),
      ["a.example.com", "b.example.com", "c.example.com"]
    );
  }

  #[test]
  fn definition_passes_self_check() {
    definition().self_check().unwrap();
  }

  #[test]
  fn domains_port_coerces_a_single_string() {
    let def = definition();
    let raw = serde_json::json!({ "domains": "example.com" });
    let parsed = def
      .inputs
      .parse_object(raw.as_object().unwrap())
      .unwrap();
    assert_eq!(
      parsed["domains"],
      serde_json::json!(["example.com"])
    );
  }
}

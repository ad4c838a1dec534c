use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD};
use engine::dispatch::{
  ResolvedRunner, run_component_with_runner,
};
use engine::docker::ContainerSpec;
use serde::Serialize;
use studio_types::{
  JsonObject,
  component::{
    ComponentCategory, ComponentDefinition, DockerRunnerConfig,
    ResolvedNode, RetryPolicy, RunnerConfig,
  },
  context::ExecutionContext,
  errors::{ExecuteError, ExecuteResult},
  schema::{PortMap, Schema},
};

use crate::common;

const IMAGE: &str = "projectdiscovery/notify:latest";
const DEFAULT_TIMEOUT_SECONDS: u64 = 120;

/// The one component that opts into a shell: the provider config
/// arrives on stdin and has to land in a file before notify
/// starts. The message itself only ever travels as environment.
const DELIVER_SCRIPT: &str = "cat > /tmp/provider-config.yaml && printf '%s\\n' \"$NOTIFY_MESSAGE\" | notify -silent -provider-config /tmp/provider-config.yaml";

fn runner() -> DockerRunnerConfig {
  DockerRunnerConfig {
    image: IMAGE.into(),
    entrypoint: Some(String::from("sh")),
    timeout_seconds: common::env_timeout_seconds(
      "NOTIFY_TIMEOUT_SECONDS",
      DEFAULT_TIMEOUT_SECONDS,
    ),
    ..Default::default()
  }
}

pub fn definition() -> ComponentDefinition {
  ComponentDefinition {
    id: "studio.notify.notify".into(),
    label: "Notify".into(),
    category: ComponentCategory::Notify,
    version: "1.1.0".into(),
    description:
      "Deliver a message to the channels configured in a notify provider config."
        .into(),
    inputs: PortMap::new()
      .port(
        "message",
        Schema::text().label("Message").required(),
      )
      .port(
        "providerConfig",
        Schema::secret()
          .label("Provider Config")
          .description(
            "base64 encoded notify provider-config.yaml",
          )
          .required(),
      ),
    parameters: PortMap::new(),
    outputs: PortMap::new()
      .port("delivered", Schema::boolean().required())
      .port("rawOutput", Schema::text().with_default("")),
    runner: RunnerConfig::Docker(runner()),
    retry: RetryPolicy::default(),
    execute: Arc::new(|node, ctx| Box::pin(execute(node, ctx))),
  }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NotifyOutput {
  delivered: bool,
  raw_output: String,
}

async fn execute(
  node: ResolvedNode,
  ctx: ExecutionContext,
) -> ExecuteResult<JsonObject> {
  let message = common::get_str(&node.inputs, "message")
    .unwrap_or_default()
    .to_string();
  let secret_id = common::get_str(&node.inputs, "providerConfig")
    .ok_or_else(|| {
      ExecuteError::configuration("provider config not wired")
    })?;
  let encoded = ctx.secret(secret_id).await?.value;
  let provider_config = STANDARD
    .decode(encoded.trim())
    .map_err(|e| {
      ExecuteError::configuration(
        "provider config is not valid base64",
      )
      .with_cause(anyhow::Error::from(e))
    })?;

  let mut spec = ContainerSpec::from_runner(&runner());
  spec.command =
    vec![String::from("-c"), String::from(DELIVER_SCRIPT)];
  spec
    .env
    .insert(String::from("NOTIFY_MESSAGE"), message);
  spec.stdin = Some(provider_config);

  ctx.info("delivering notification");
  let exit = run_component_with_runner(
    ResolvedRunner::Docker(spec),
    common::not_inline,
    &ctx,
  )
  .await?
  .container()?;

  common::to_output(&NotifyOutput {
    delivered: exit.exit_code == 0,
    raw_output: exit.stdout,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn definition_passes_self_check() {
    definition().self_check().unwrap();
  }

  #[test]
  fn shell_opt_in_is_explicit_via_entrypoint() {
    let runner = runner();
    assert_eq!(runner.entrypoint.as_deref(), Some("sh"));
    // The message reaches the tool via environment, never argv.
    assert!(!DELIVER_SCRIPT.contains("{message}"));
  }
}

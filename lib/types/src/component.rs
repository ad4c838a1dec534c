use std::{fmt, future::Future, pin::Pin, sync::Arc};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display};
use typeshare::typeshare;

use crate::{
  JsonObject,
  context::ExecutionContext,
  errors::{ErrorKind, ExecuteResult},
  schema::PortMap,
};

pub type ExecuteFuture =
  Pin<Box<dyn Future<Output = ExecuteResult<JsonObject>> + Send>>;

pub type ExecuteFn = Arc<
  dyn Fn(ResolvedNode, ExecutionContext) -> ExecuteFuture
    + Send
    + Sync,
>;

/// Inputs and parameters after schema validation and coercion,
/// as handed to a component's `execute`.
#[derive(Debug, Clone, Default)]
pub struct ResolvedNode {
  pub inputs: JsonObject,
  pub params: JsonObject,
}

#[typeshare]
#[derive(
  Serialize,
  Deserialize,
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Display,
  AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum ComponentCategory {
  Recon,
  Dast,
  Secrets,
  Cloud,
  Notify,
  Identity,
}

/// Container network mode. Components without a reason to reach
/// the network run with `none`.
#[typeshare]
#[derive(
  Serialize,
  Deserialize,
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Display,
  AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NetworkMode {
  #[default]
  Bridge,
  None,
}

/// The execution strategy for a component, matched explicitly
/// at dispatch.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RunnerConfig {
  Inline,
  Docker(DockerRunnerConfig),
}

impl RunnerConfig {
  pub fn kind(&self) -> &'static str {
    match self {
      RunnerConfig::Inline => "inline",
      RunnerConfig::Docker(_) => "docker",
    }
  }
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DockerRunnerConfig {
  pub image: String,
  /// Platform pin, eg `linux/amd64` on ARM hosts for tools
  /// without ARM builds.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub platform: Option<String>,
  /// Entrypoint override. Explicitly choosing `sh` here is the
  /// only way a component opts into shell interpretation.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub entrypoint: Option<String>,
  /// Static argv. Components building argv dynamically leave this
  /// empty and pass the full command at dispatch.
  #[serde(default)]
  pub command: Vec<String>,
  #[serde(default)]
  pub env: IndexMap<String, String>,
  #[serde(default)]
  pub network: NetworkMode,
  #[serde(default = "default_timeout_seconds")]
  pub timeout_seconds: u64,
  /// Exit codes which signal success-with-findings rather than
  /// failure, eg Prowler 3 / TruffleHog 183.
  #[serde(default)]
  pub expected_exit_codes: Vec<i64>,
}

fn default_timeout_seconds() -> u64 {
  600
}

impl Default for DockerRunnerConfig {
  fn default() -> DockerRunnerConfig {
    DockerRunnerConfig {
      image: Default::default(),
      platform: None,
      entrypoint: None,
      command: Default::default(),
      env: Default::default(),
      network: Default::default(),
      timeout_seconds: default_timeout_seconds(),
      expected_exit_codes: Default::default(),
    }
  }
}

/// Per-component rule set governing bounded exponential retries.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
  #[serde(default = "default_initial_interval")]
  pub initial_interval_seconds: f64,
  #[serde(default = "default_maximum_interval")]
  pub maximum_interval_seconds: f64,
  #[serde(default = "default_backoff_coefficient")]
  pub backoff_coefficient: f64,
  #[serde(default)]
  pub non_retryable_error_kinds: Vec<ErrorKind>,
}

fn default_max_attempts() -> u32 {
  3
}

fn default_initial_interval() -> f64 {
  1.0
}

fn default_maximum_interval() -> f64 {
  60.0
}

fn default_backoff_coefficient() -> f64 {
  2.0
}

impl Default for RetryPolicy {
  fn default() -> RetryPolicy {
    RetryPolicy {
      max_attempts: default_max_attempts(),
      initial_interval_seconds: default_initial_interval(),
      maximum_interval_seconds: default_maximum_interval(),
      backoff_coefficient: default_backoff_coefficient(),
      non_retryable_error_kinds: Default::default(),
    }
  }
}

impl RetryPolicy {
  pub fn no_retries() -> RetryPolicy {
    RetryPolicy {
      max_attempts: 1,
      ..Default::default()
    }
  }
}

/// A declarative component: typed ports, a runner, a retry policy,
/// and the operational body.
#[derive(Clone)]
pub struct ComponentDefinition {
  /// Stable reverse-DNS id, unique in the registry.
  pub id: String,
  pub label: String,
  pub category: ComponentCategory,
  /// Semver.
  pub version: String,
  pub description: String,
  pub inputs: PortMap,
  pub parameters: PortMap,
  pub outputs: PortMap,
  pub runner: RunnerConfig,
  pub retry: RetryPolicy,
  pub execute: ExecuteFn,
}

impl fmt::Debug for ComponentDefinition {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("ComponentDefinition")
      .field("id", &self.id)
      .field("version", &self.version)
      .field("runner", &self.runner.kind())
      .finish_non_exhaustive()
  }
}

impl ComponentDefinition {
  /// Registration-time sanity. Definitions failing this are
  /// rejected by the registry.
  pub fn self_check(&self) -> anyhow::Result<()> {
    if !self.id.contains('.') {
      anyhow::bail!("component id '{}' is not reverse-DNS", self.id);
    }
    if let RunnerConfig::Docker(docker) = &self.runner {
      if docker.image.is_empty() {
        anyhow::bail!("docker runner requires an image");
      }
      if docker.timeout_seconds == 0 {
        anyhow::bail!("timeoutSeconds must be positive");
      }
    }
    self.inputs.self_check()?;
    self.parameters.self_check()?;
    self.outputs.self_check()?;
    Ok(())
  }

  pub fn metadata(&self) -> ComponentMetadata {
    ComponentMetadata {
      id: self.id.clone(),
      label: self.label.clone(),
      category: self.category,
      version: self.version.clone(),
      description: self.description.clone(),
      inputs: self.inputs.describe(),
      parameters: self.parameters.describe(),
      outputs: self.outputs.describe(),
      runner_kind: self.runner.kind().to_string(),
    }
  }
}

/// What [list][ComponentDefinition::metadata] exposes to UIs and
/// the orchestrator: everything except the execute body.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ComponentMetadata {
  pub id: String,
  pub label: String,
  pub category: ComponentCategory,
  pub version: String,
  pub description: String,
  pub inputs: Value,
  pub parameters: Value,
  pub outputs: Value,
  pub runner_kind: String,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::schema::Schema;

  fn noop_execute() -> ExecuteFn {
    Arc::new(|_, _| Box::pin(async { Ok(JsonObject::new()) }))
  }

  fn definition(runner: RunnerConfig) -> ComponentDefinition {
    ComponentDefinition {
      id: "studio.test.example".into(),
      label: "Example".into(),
      category: ComponentCategory::Recon,
      version: "1.0.0".into(),
      description: String::new(),
      inputs: PortMap::new()
        .port("targets", Schema::list(Schema::text())),
      parameters: PortMap::new(),
      outputs: PortMap::new(),
      runner,
      retry: RetryPolicy::default(),
      execute: noop_execute(),
    }
  }

  #[test]
  fn docker_runner_with_zero_timeout_fails_self_check() {
    let def =
      definition(RunnerConfig::Docker(DockerRunnerConfig {
        image: "alpine:latest".into(),
        timeout_seconds: 0,
        ..Default::default()
      }));
    assert!(def.self_check().is_err());
  }

  #[test]
  fn docker_runner_without_image_fails_self_check() {
    let def = definition(RunnerConfig::Docker(
      DockerRunnerConfig::default(),
    ));
    assert!(def.self_check().is_err());
  }

  #[test]
  fn metadata_projects_ports_without_execute() {
    let def = definition(RunnerConfig::Inline);
    let metadata = def.metadata();
    assert_eq!(metadata.runner_kind, "inline");
    assert_eq!(
      metadata.inputs["targets"]["kind"],
      serde_json::json!("list")
    );
  }

  #[test]
  fn retry_policy_deserializes_with_defaults() {
    let policy: RetryPolicy =
      serde_json::from_str("{}").unwrap();
    assert_eq!(policy.max_attempts, 3);
    assert_eq!(policy.backoff_coefficient, 2.0);
    assert!(policy.non_retryable_error_kinds.is_empty());
  }
}

use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
  /// The logging level. default: info
  #[serde(default)]
  pub level: LogLevel,

  /// Controls logging to stdout / stderr
  #[serde(default)]
  pub stdio: StdioLogMode,

  /// Use tracing-subscriber's pretty logging output option.
  #[serde(default)]
  pub pretty: bool,

  /// Enable opentelemetry exporting
  #[serde(default)]
  pub otlp_endpoint: String,

  #[serde(default = "default_opentelemetry_service_name")]
  pub opentelemetry_service_name: String,
}

fn default_opentelemetry_service_name() -> String {
  String::from("Studio Worker")
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: Default::default(),
      stdio: Default::default(),
      pretty: Default::default(),
      otlp_endpoint: Default::default(),
      opentelemetry_service_name: default_opentelemetry_service_name(
      ),
    }
  }
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
  Trace,
  Debug,
  #[default]
  Info,
  Warn,
  Error,
}

impl From<LogLevel> for tracing::Level {
  fn from(value: LogLevel) -> Self {
    match value {
      LogLevel::Trace => tracing::Level::TRACE,
      LogLevel::Debug => tracing::Level::DEBUG,
      LogLevel::Info => tracing::Level::INFO,
      LogLevel::Warn => tracing::Level::WARN,
      LogLevel::Error => tracing::Level::ERROR,
    }
  }
}

impl From<tracing::Level> for LogLevel {
  fn from(value: tracing::Level) -> Self {
    match value.as_str().to_lowercase().as_str() {
      "trace" => LogLevel::Trace,
      "debug" => LogLevel::Debug,
      "info" => LogLevel::Info,
      "warn" => LogLevel::Warn,
      "error" => LogLevel::Error,
      _ => LogLevel::Info,
    }
  }
}

#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum StdioLogMode {
  #[default]
  Standard,
  Json,
  None,
}

/// The worker daemon configuration, assembled from environment
/// variables and CLI args at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
  /// Port the worker api listens on. default: 8120
  #[serde(default = "default_worker_port")]
  pub port: u16,

  /// IP to bind the api server to. default: 0.0.0.0
  #[serde(default = "default_bind_ip")]
  pub bind_ip: String,

  /// Logging configuration.
  #[serde(default)]
  pub logging: LogConfig,

  /// Log the (sanitized) config object on startup.
  #[serde(default)]
  pub pretty_startup_config: bool,

  /// Static secrets available to invocations through
  /// `ctx.secrets`. Values never appear in logs or errors.
  #[serde(default)]
  pub secrets: IndexMap<String, String>,

  /// Destroy managed sandbox volumes older than this.
  /// default: 6
  #[serde(default = "default_sweep_threshold_hours")]
  pub volume_sweep_threshold_hours: u64,

  /// How often the orphan sweep runs. 0 disables the loop.
  /// default: 1
  #[serde(default = "default_sweep_interval_hours")]
  pub volume_sweep_interval_hours: u64,
}

fn default_worker_port() -> u16 {
  8120
}

fn default_bind_ip() -> String {
  String::from("0.0.0.0")
}

fn default_sweep_threshold_hours() -> u64 {
  6
}

fn default_sweep_interval_hours() -> u64 {
  1
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      port: default_worker_port(),
      bind_ip: default_bind_ip(),
      logging: Default::default(),
      pretty_startup_config: Default::default(),
      secrets: Default::default(),
      volume_sweep_threshold_hours: default_sweep_threshold_hours(),
      volume_sweep_interval_hours: default_sweep_interval_hours(),
    }
  }
}

impl WorkerConfig {
  /// Safe to log.
  pub fn sanitized(&self) -> WorkerConfig {
    let mut config = self.clone();
    config.secrets = config
      .secrets
      .keys()
      .map(|id| (id.clone(), String::from("#############")))
      .collect();
    config
  }
}

/// Environment overrides for [WorkerConfig]. Parsed with envy.
#[derive(Debug, Clone, Deserialize)]
pub struct Env {
  #[serde(default)]
  pub studio_worker_port: Option<u16>,
  #[serde(default)]
  pub studio_worker_bind_ip: Option<String>,
  #[serde(default)]
  pub studio_worker_logging_level: Option<LogLevel>,
  #[serde(default)]
  pub studio_worker_logging_stdio: Option<StdioLogMode>,
  #[serde(default)]
  pub studio_worker_logging_pretty: Option<bool>,
  #[serde(default)]
  pub studio_worker_logging_otlp_endpoint: Option<String>,
  #[serde(default)]
  pub studio_worker_logging_opentelemetry_service_name:
    Option<String>,
  #[serde(default)]
  pub studio_worker_pretty_startup_config: Option<bool>,
  /// Path to a json file holding the static secrets map.
  #[serde(default)]
  pub studio_worker_secrets_file: Option<PathBuf>,
  #[serde(default)]
  pub studio_worker_volume_sweep_threshold_hours: Option<u64>,
  #[serde(default)]
  pub studio_worker_volume_sweep_interval_hours: Option<u64>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sanitized_redacts_secret_values() {
    let config = WorkerConfig {
      secrets: [(
        String::from("aws-key"),
        String::from("super-secret"),
      )]
      .into_iter()
      .collect(),
      ..Default::default()
    };
    let sanitized = config.sanitized();
    assert!(sanitized.secrets.contains_key("aws-key"));
    assert!(
      !serde_json::to_string(&sanitized)
        .unwrap()
        .contains("super-secret")
    );
  }
}

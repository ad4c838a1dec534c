use std::sync::OnceLock;

use clap::Parser;
use colored::Colorize;
use indexmap::IndexMap;
use studio_types::config::{
  Env, LogConfig, LogLevel, WorkerConfig,
};

/// The Studio worker agent.
#[derive(Parser)]
#[command(name = "studio-worker", version, about)]
pub struct CliArgs {
  /// Set the log level (trace, debug, info, warn, error).
  #[arg(long)]
  pub log_level: Option<tracing::Level>,
}

pub fn worker_config() -> &'static WorkerConfig {
  static WORKER_CONFIG: OnceLock<WorkerConfig> = OnceLock::new();
  WORKER_CONFIG.get_or_init(|| {
    let env: Env = envy::from_env()
      .expect("failed to parse worker environment");
    let args = CliArgs::parse();
    let config = WorkerConfig::default();

    let secrets = match &env.studio_worker_secrets_file {
      Some(path) => {
        let contents = std::fs::read_to_string(path)
          .unwrap_or_else(|e| {
            panic!(
              "failed to read secrets file at {path:?} | {e:?}"
            )
          });
        serde_json::from_str::<IndexMap<String, String>>(
          &contents,
        )
        .unwrap_or_else(|e| {
          panic!(
            "failed to parse secrets file at {path:?} | {e:?}"
          )
        })
      }
      None => {
        println!(
          "{}: No secrets file configured, components relying on secrets will fail to resolve them",
          "INFO".green(),
        );
        Default::default()
      }
    };

    WorkerConfig {
      port: env.studio_worker_port.unwrap_or(config.port),
      bind_ip: env
        .studio_worker_bind_ip
        .unwrap_or(config.bind_ip),
      logging: LogConfig {
        level: args
          .log_level
          .map(LogLevel::from)
          .or(env.studio_worker_logging_level)
          .unwrap_or(config.logging.level),
        stdio: env
          .studio_worker_logging_stdio
          .unwrap_or(config.logging.stdio),
        pretty: env
          .studio_worker_logging_pretty
          .unwrap_or(config.logging.pretty),
        otlp_endpoint: env
          .studio_worker_logging_otlp_endpoint
          .unwrap_or(config.logging.otlp_endpoint),
        opentelemetry_service_name: env
          .studio_worker_logging_opentelemetry_service_name
          .unwrap_or(config.logging.opentelemetry_service_name),
      },
      pretty_startup_config: env
        .studio_worker_pretty_startup_config
        .unwrap_or(config.pretty_startup_config),
      secrets,
      volume_sweep_threshold_hours: env
        .studio_worker_volume_sweep_threshold_hours
        .unwrap_or(config.volume_sweep_threshold_hours),
      volume_sweep_interval_hours: env
        .studio_worker_volume_sweep_interval_hours
        .unwrap_or(config.volume_sweep_interval_hours),
    }
  })
}

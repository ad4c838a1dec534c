use std::time::Duration;

use anyhow::Context;
use opentelemetry::{KeyValue, global, trace::TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{Sampler, Tracer};
use opentelemetry_semantic_conventions::resource::SERVICE_VERSION;
use studio_types::config::{LogConfig, StdioLogMode};
use tracing::level_filters::LevelFilter;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{
  Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

pub fn init(config: &LogConfig) -> anyhow::Result<()> {
  let log_level: tracing::Level = config.level.into();

  let otel_layer = (!config.otlp_endpoint.is_empty())
    .then(|| {
      anyhow::Ok(OpenTelemetryLayer::new(otel_tracer(
        &config.otlp_endpoint,
        config.opentelemetry_service_name.clone(),
      )?))
    })
    .transpose()?;

  let stdio_layer = match (config.stdio, config.pretty) {
    (StdioLogMode::Standard, true) => Some(
      tracing_subscriber::fmt::layer()
        .pretty()
        .with_file(false)
        .with_line_number(false)
        .boxed(),
    ),
    (StdioLogMode::Standard, false) => Some(
      tracing_subscriber::fmt::layer()
        .with_file(false)
        .with_line_number(false)
        .boxed(),
    ),
    (StdioLogMode::Json, _) => {
      Some(tracing_subscriber::fmt::layer().json().boxed())
    }
    (StdioLogMode::None, _) => None,
  };

  if otel_layer.is_none() && stdio_layer.is_none() {
    return Ok(());
  }

  Registry::default()
    .with(LevelFilter::from(log_level))
    .with(stdio_layer)
    .with(otel_layer)
    .try_init()
    .context("failed to init logger")
}

fn otel_tracer(
  endpoint: &str,
  service_name: String,
) -> anyhow::Result<Tracer> {
  let exporter = opentelemetry_otlp::SpanExporter::builder()
    .with_http()
    .with_endpoint(endpoint)
    .with_timeout(Duration::from_secs(3))
    .build()
    .context("failed to build otlp span exporter")?;
  let provider =
    opentelemetry_sdk::trace::TracerProviderBuilder::default()
      .with_resource(
        opentelemetry_sdk::Resource::builder()
          .with_service_name(service_name.clone())
          .with_attribute(KeyValue::new(
            SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
          ))
          .build(),
      )
      .with_sampler(Sampler::AlwaysOn)
      .with_batch_exporter(exporter)
      .build();
  global::set_tracer_provider(provider.clone());
  Ok(provider.tracer(service_name))
}

#[macro_use]
extern crate tracing;

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::Context;

use crate::config::worker_config;

mod api;
mod config;

async fn app() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  let config = worker_config();
  logger::init(&config.logging)?;

  info!("Studio Worker version: v{}", env!("CARGO_PKG_VERSION"));
  if config.pretty_startup_config {
    info!("{:#?}", config.sanitized());
  } else {
    info!("{:?}", config.sanitized());
  }

  // Eagerly register the full catalog; the registry is read-only
  // from here on.
  engine::registry::init(components::all())?;

  spawn_volume_sweep_loop();

  let addr = format!("{}:{}", config.bind_ip, config.port);
  let socket_addr = SocketAddr::from_str(&addr)
    .context("failed to parse listen address")?;
  let listener = tokio::net::TcpListener::bind(socket_addr)
    .await
    .with_context(|| format!("failed to bind {socket_addr}"))?;

  info!("Studio Worker starting on http://{socket_addr}");
  axum::serve(listener, api::router())
    .await
    .context("failed to start http server")
}

/// Reclaim sandbox volumes left behind by invocations that died
/// before their own cleanup (worker crash, engine restart).
fn spawn_volume_sweep_loop() {
  let config = worker_config();
  if config.volume_sweep_interval_hours == 0 {
    info!("sandbox volume sweep loop disabled");
    return;
  }
  let threshold = Duration::from_secs(
    config.volume_sweep_threshold_hours * 3600,
  );
  let interval = Duration::from_secs(
    config.volume_sweep_interval_hours * 3600,
  );
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    // The immediate first tick would race worker startup.
    ticker.tick().await;
    loop {
      ticker.tick().await;
      engine::docker::sweep_orphaned_volumes(threshold).await;
    }
  });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let mut term_signal = tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  )?;
  tokio::select! {
    res = tokio::spawn(app()) => res?,
    _ = term_signal.recv() => Ok(()),
  }
}

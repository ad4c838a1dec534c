use std::sync::OnceLock;

use anyhow::Context;
use bollard::Docker;

mod run;
mod volume;

pub use run::{
  ContainerExit, ContainerSpec, VolumeMount, execute_container,
};
pub use volume::{
  IsolatedVolume, SweepSummary, sweep_orphaned_volumes,
  validate_filename,
};

/// Image used for the short-lived sandbox helper containers
/// (file writes, reads, listings).
pub const HELPER_IMAGE: &str = "alpine:latest";

pub fn docker_client() -> &'static DockerClient {
  static DOCKER_CLIENT: OnceLock<DockerClient> = OnceLock::new();
  DOCKER_CLIENT.get_or_init(Default::default)
}

pub struct DockerClient {
  docker: Docker,
}

impl Default for DockerClient {
  fn default() -> DockerClient {
    DockerClient {
      docker: Docker::connect_with_defaults()
        .expect("failed to connect to docker daemon"),
    }
  }
}

/// Resolve the container engine binary once per process.
pub fn docker_bin() -> &'static str {
  static DOCKER_BIN: OnceLock<String> = OnceLock::new();
  DOCKER_BIN.get_or_init(|| {
    std::env::var_os("PATH")
      .and_then(|path| {
        std::env::split_paths(&path)
          .map(|dir| dir.join("docker"))
          .find(|candidate| candidate.is_file())
      })
      .map(|path| path.to_string_lossy().into_owned())
      .unwrap_or_else(|| String::from("docker"))
  })
}

/// Run a direct engine command (`docker volume create ...`),
/// capturing output. Container runs go through
/// [execute_container] instead.
pub(crate) async fn engine_command(
  args: &[String],
) -> anyhow::Result<std::process::Output> {
  let output = tokio::process::Command::new(docker_bin())
    .args(args)
    .output()
    .await
    .with_context(|| {
      format!("failed to run container engine {}", args.join(" "))
    })?;
  if !output.status.success() {
    let stderr = String::from_utf8_lossy(&output.stderr);
    anyhow::bail!(
      "container engine {} failed | {}",
      args.first().map(String::as_str).unwrap_or_default(),
      stderr.trim(),
    );
  }
  Ok(output)
}

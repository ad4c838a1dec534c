use std::{sync::OnceLock, time::Duration};

use bollard::query_parameters::ListVolumesOptions;
use indexmap::IndexMap;
use regex::Regex;
use serde::Serialize;
use studio_types::{
  component::NetworkMode,
  context::ExecutionContext,
  errors::{ExecuteError, ExecuteResult},
  schema::FieldErrors,
  studio_timestamp,
};

use super::{
  ContainerSpec, DockerClient, HELPER_IMAGE, VolumeMount,
  docker_client, engine_command, execute_container,
};

pub const LABEL_TENANT: &str = "studio.tenant";
pub const LABEL_RUN: &str = "studio.run";
pub const LABEL_CREATED: &str = "studio.created";
pub const LABEL_MANAGED: &str = "studio.managed";

/// Tenant / run ids are opaque but constrained, so they can be
/// embedded in volume names and engine labels verbatim.
fn id_pattern() -> &'static Regex {
  static ID_PATTERN: OnceLock<Regex> = OnceLock::new();
  ID_PATTERN.get_or_init(|| {
    Regex::new(r"^[A-Za-z0-9_-]+$").expect("invalid id pattern")
  })
}

fn filename_pattern() -> &'static Regex {
  static FILENAME_PATTERN: OnceLock<Regex> = OnceLock::new();
  FILENAME_PATTERN.get_or_init(|| {
    Regex::new(r"^[A-Za-z0-9._/-]+$")
      .expect("invalid filename pattern")
  })
}

/// Enforce the sandbox file name policy. The whitelist keeps the
/// quoted write path injection-safe, the segment checks close
/// traversal and hidden-file routes.
pub fn validate_filename(name: &str) -> Result<(), String> {
  if name.starts_with('/') {
    return Err(String::from("absolute paths not allowed"));
  }
  if name.split('/').any(|segment| segment == "..") {
    return Err(String::from("path traversal not allowed"));
  }
  if name.is_empty()
    || name.ends_with('/')
    || name.contains("//")
    || !filename_pattern().is_match(name)
  {
    return Err(String::from("invalid characters in file name"));
  }
  if name.split('/').any(|segment| segment.starts_with('.')) {
    return Err(String::from("hidden path segments not allowed"));
  }
  Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum VolumeState {
  Uninitialized,
  Ready { volume_name: String },
  Destroyed,
}

/// An ephemeral named volume staging files into and out of a
/// single component invocation's containers.
///
/// Exclusively owned by the invocation that created it; the name
/// carries the tenant and run so a misrouted invocation is
/// detectable from `docker volume ls` alone.
#[derive(Debug)]
pub struct IsolatedVolume {
  ctx: ExecutionContext,
  state: VolumeState,
}

impl IsolatedVolume {
  pub fn new(
    ctx: &ExecutionContext,
  ) -> ExecuteResult<IsolatedVolume> {
    let mut errors = FieldErrors::new();
    if !id_pattern().is_match(ctx.tenant_id()) {
      errors.insert(
        String::from("tenantId"),
        vec![String::from("invalid tenant id")],
      );
    }
    if !id_pattern().is_match(ctx.run_id()) {
      errors.insert(
        String::from("runId"),
        vec![String::from("invalid run id")],
      );
    }
    if !errors.is_empty() {
      return Err(
        ExecuteError::validation("invalid sandbox identity")
          .with_field_errors(errors),
      );
    }
    Ok(IsolatedVolume {
      ctx: ctx.clone(),
      state: VolumeState::Uninitialized,
    })
  }

  /// Create the labeled volume and stage the given files.
  /// Rejected file names fail the whole call before any volume
  /// exists.
  pub async fn initialize(
    &mut self,
    files: &IndexMap<String, String>,
  ) -> ExecuteResult<String> {
    if self.state != VolumeState::Uninitialized {
      return Err(ExecuteError::configuration(
        "sandbox volume already initialized",
      ));
    }

    let mut errors = FieldErrors::new();
    for name in files.keys() {
      if let Err(message) = validate_filename(name) {
        errors
          .entry(String::from("filename"))
          .or_default()
          .push(message);
      }
    }
    if !errors.is_empty() {
      return Err(
        ExecuteError::validation("invalid sandbox file name")
          .with_field_errors(errors),
      );
    }

    let volume_name =
      sandbox_volume_name(self.ctx.tenant_id(), self.ctx.run_id());
    let created = chrono::Utc::now().to_rfc3339();
    engine_command(&[
      String::from("volume"),
      String::from("create"),
      String::from("--label"),
      format!("{LABEL_TENANT}={}", self.ctx.tenant_id()),
      String::from("--label"),
      format!("{LABEL_RUN}={}", self.ctx.run_id()),
      String::from("--label"),
      format!("{LABEL_CREATED}={created}"),
      String::from("--label"),
      format!("{LABEL_MANAGED}=true"),
      volume_name.clone(),
    ])
    .await
    .map_err(|e| {
      ExecuteError::container("failed to create sandbox volume")
        .with_cause(e)
    })?;
    self.state = VolumeState::Ready {
      volume_name: volume_name.clone(),
    };

    for (name, content) in files {
      self.write_file(name, content).await?;
    }
    Ok(volume_name)
  }

  /// Write one file through a short-lived helper container
  /// reading stdin. The single-quoted target is injection-safe:
  /// the name policy bans quotes and shell metacharacters.
  async fn write_file(
    &self,
    name: &str,
    content: &str,
  ) -> ExecuteResult<()> {
    let script = format!(
      "mkdir -p \"$(dirname '/data/{name}')\" && cat > '/data/{name}'",
    );
    let spec = ContainerSpec {
      image: String::from(HELPER_IMAGE),
      entrypoint: Some(String::from("sh")),
      command: vec![String::from("-c"), script],
      volumes: vec![self.volume_config("/data", false)?],
      network: NetworkMode::None,
      timeout_seconds: 60,
      stdin: Some(content.as_bytes().to_vec()),
      stream_logs: false,
      ..Default::default()
    };
    execute_container(spec, &self.ctx).await.map_err(|e| {
      ExecuteError::container(format!(
        "failed to write sandbox file '{name}'"
      ))
      .with_cause(e)
    })?;
    Ok(())
  }

  /// Read files back out of the sandbox. Missing files produce a
  /// warning and no entry, not an error.
  pub async fn read_files(
    &self,
    names: &[String],
  ) -> ExecuteResult<IndexMap<String, String>> {
    self.require_ready()?;
    let mut contents = IndexMap::new();
    for name in names {
      validate_filename(name).map_err(|message| {
        ExecuteError::validation("invalid sandbox file name")
          .with_field_error("filename", message)
      })?;
      let spec = ContainerSpec {
        image: String::from(HELPER_IMAGE),
        entrypoint: Some(String::from("cat")),
        command: vec![format!("/data/{name}")],
        volumes: vec![self.volume_config("/data", true)?],
        network: NetworkMode::None,
        timeout_seconds: 60,
        // cat exits 1 when the file is absent.
        expected_exit_codes: vec![1],
        stream_logs: false,
        ..Default::default()
      };
      let exit = execute_container(spec, &self.ctx).await?;
      if exit.expected_exit {
        self.ctx.warn(format!(
          "sandbox file '{name}' not found, skipping"
        ));
        continue;
      }
      contents.insert(name.clone(), exit.stdout);
    }
    Ok(contents)
  }

  /// Enumerate the files a container left behind in the sandbox,
  /// relative to the volume root.
  pub async fn list_files(&self) -> ExecuteResult<Vec<String>> {
    self.require_ready()?;
    let spec = ContainerSpec {
      image: String::from(HELPER_IMAGE),
      entrypoint: Some(String::from("find")),
      command: vec![
        String::from("/data"),
        String::from("-type"),
        String::from("f"),
      ],
      volumes: vec![self.volume_config("/data", true)?],
      network: NetworkMode::None,
      timeout_seconds: 60,
      stream_logs: false,
      ..Default::default()
    };
    let exit = execute_container(spec, &self.ctx).await?;
    Ok(
      exit
        .stdout
        .lines()
        .filter_map(|line| line.strip_prefix("/data/"))
        .map(String::from)
        .collect(),
    )
  }

  /// Pure mount spec for the component container.
  pub fn volume_config(
    &self,
    target: impl Into<String>,
    read_only: bool,
  ) -> ExecuteResult<VolumeMount> {
    let VolumeState::Ready { volume_name } = &self.state else {
      return Err(ExecuteError::configuration(
        "sandbox volume not initialized",
      ));
    };
    Ok(VolumeMount {
      source: volume_name.clone(),
      target: target.into(),
      read_only,
    })
  }

  pub fn name(&self) -> Option<&str> {
    match &self.state {
      VolumeState::Ready { volume_name } => Some(volume_name),
      _ => None,
    }
  }

  /// Best-effort destroy. Idempotent, never raises; failures are
  /// logged and left to the orphan sweep.
  pub async fn cleanup(&mut self) {
    let VolumeState::Ready { volume_name } = &self.state else {
      return;
    };
    let volume_name = volume_name.clone();
    self.state = VolumeState::Destroyed;
    if let Err(e) = remove_volume(&volume_name).await {
      warn!(
        "failed to remove sandbox volume {volume_name} | {e:#}"
      );
    }
  }

  fn require_ready(&self) -> ExecuteResult<()> {
    match self.state {
      VolumeState::Ready { .. } => Ok(()),
      _ => Err(ExecuteError::configuration(
        "sandbox volume not initialized",
      )),
    }
  }
}

impl Drop for IsolatedVolume {
  /// Last-resort reclamation when an execute future is dropped at
  /// a suspension point (cancellation) before cleanup ran.
  fn drop(&mut self) {
    if let VolumeState::Ready { volume_name } = &self.state {
      let volume_name = volume_name.clone();
      if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
          if let Err(e) = remove_volume(&volume_name).await {
            warn!(
              "failed to remove dropped sandbox volume {volume_name} | {e:#}"
            );
          }
        });
      } else {
        warn!(
          "sandbox volume {volume_name} leaked without a runtime, orphan sweep will reclaim it"
        );
      }
    }
  }
}

/// The millisecond suffix keeps names unique across retries of
/// the same node within one run.
fn sandbox_volume_name(tenant_id: &str, run_id: &str) -> String {
  format!(
    "tenant-{tenant_id}-run-{run_id}-{}",
    studio_timestamp()
  )
}

async fn remove_volume(volume_name: &str) -> anyhow::Result<()> {
  engine_command(&[
    String::from("volume"),
    String::from("rm"),
    String::from("--force"),
    String::from(volume_name),
  ])
  .await?;
  Ok(())
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
  /// Managed volumes inspected.
  pub scanned: usize,
  pub destroyed: usize,
  pub failed: usize,
}

/// Destroy managed sandbox volumes older than the threshold,
/// covering invocations that died before their own cleanup.
/// Never raises.
pub async fn sweep_orphaned_volumes(
  threshold: Duration,
) -> SweepSummary {
  let volumes = match docker_client().list_managed_volumes().await
  {
    Ok(volumes) => volumes,
    Err(e) => {
      warn!("failed to list sandbox volumes | {e:#}");
      return SweepSummary::default();
    }
  };
  let cutoff =
    studio_timestamp() - threshold.as_millis() as i64;
  let mut summary = SweepSummary {
    scanned: volumes.len(),
    ..Default::default()
  };
  for volume in volumes {
    let Some(created) = volume.created_ms else {
      warn!(
        "managed volume {} has no parseable creation time, skipping",
        volume.name
      );
      continue;
    };
    if created >= cutoff {
      continue;
    }
    match remove_volume(&volume.name).await {
      Ok(()) => summary.destroyed += 1,
      Err(e) => {
        summary.failed += 1;
        warn!(
          "failed to sweep sandbox volume {} | {e:#}",
          volume.name
        );
      }
    }
  }
  info!(
    "sandbox volume sweep complete | scanned: {} | destroyed: {} | failed: {}",
    summary.scanned, summary.destroyed, summary.failed,
  );
  summary
}

pub(crate) struct ManagedVolume {
  pub name: String,
  pub created_ms: Option<i64>,
}

impl DockerClient {
  pub(crate) async fn list_managed_volumes(
    &self,
  ) -> anyhow::Result<Vec<ManagedVolume>> {
    let volumes = self
      .docker
      .list_volumes(Option::<ListVolumesOptions>::None)
      .await?
      .volumes
      .unwrap_or_default()
      .into_iter()
      .filter(|volume| {
        volume.labels.get(LABEL_MANAGED).map(String::as_str)
          == Some("true")
      })
      .map(|volume| {
        let created_ms = volume
          .labels
          .get(LABEL_CREATED)
          .map(String::as_str)
          .or(volume.created_at.as_deref())
          .and_then(|created| {
            chrono::DateTime::parse_from_rfc3339(created).ok()
          })
          .map(|created| created.timestamp_millis());
        ManagedVolume {
          name: volume.name,
          created_ms,
        }
      })
      .collect();
    Ok(volumes)
  }
}

#[cfg(test)]
mod tests {
  use studio_types::errors::ErrorKind;

  use super::*;

  fn ctx(tenant: &str, run: &str) -> ExecutionContext {
    ExecutionContext::builder(run, tenant).build().0
  }

  #[test]
  fn ids_outside_the_charset_fail_construction() {
    let e = IsolatedVolume::new(&ctx("tenant/../x", "run-1"))
      .unwrap_err();
    assert_eq!(e.kind, ErrorKind::Validation);
    assert!(e.field_errors.contains_key("tenantId"));

    let e =
      IsolatedVolume::new(&ctx("tenant-1", "run 1")).unwrap_err();
    assert!(e.field_errors.contains_key("runId"));

    assert!(IsolatedVolume::new(&ctx("tenant_1", "run-1")).is_ok());
  }

  #[test]
  fn volume_names_carry_tenant_run_and_millis() {
    let name = sandbox_volume_name("acme_1", "run-42");
    let pattern =
      Regex::new(r"^tenant-acme_1-run-run-42-\d+$").unwrap();
    assert!(pattern.is_match(&name), "{name}");
  }

  #[test]
  fn traversal_is_rejected_before_charset() {
    assert_eq!(
      validate_filename("../etc/passwd").unwrap_err(),
      "path traversal not allowed"
    );
    assert_eq!(
      validate_filename("inputs/../../etc/passwd").unwrap_err(),
      "path traversal not allowed"
    );
  }

  #[test]
  fn absolute_and_hidden_names_are_rejected() {
    assert_eq!(
      validate_filename("/etc/passwd").unwrap_err(),
      "absolute paths not allowed"
    );
    assert_eq!(
      validate_filename(".env").unwrap_err(),
      "hidden path segments not allowed"
    );
    assert_eq!(
      validate_filename("config/.aws/credentials").unwrap_err(),
      "hidden path segments not allowed"
    );
  }

  #[test]
  fn shell_metacharacters_are_rejected() {
    for name in [
      "a;b",
      "a b",
      "a'b",
      "a\"b",
      "a$(id)",
      "a`id`",
      "a&b",
      "a|b",
    ] {
      assert_eq!(
        validate_filename(name).unwrap_err(),
        "invalid characters in file name",
        "{name}"
      );
    }
  }

  #[test]
  fn ordinary_names_pass() {
    for name in
      ["domains.txt", "inputs/targets.txt", "report-1_2.json"]
    {
      assert!(validate_filename(name).is_ok(), "{name}");
    }
  }

  #[tokio::test]
  async fn rejected_file_names_fail_before_volume_creation() {
    let mut volume =
      IsolatedVolume::new(&ctx("tenant-1", "run-1")).unwrap();
    let files = [(
      String::from("../etc/passwd"),
      String::from("x"),
    )]
    .into_iter()
    .collect();
    let e = volume.initialize(&files).await.unwrap_err();
    assert_eq!(e.kind, ErrorKind::Validation);
    assert_eq!(
      e.field_errors["filename"],
      vec!["path traversal not allowed"]
    );
    // No volume was created, so there is nothing to clean up.
    assert_eq!(volume.name(), None);
    volume.cleanup().await;
  }

  #[tokio::test]
  async fn mount_and_reads_require_initialize() {
    let volume =
      IsolatedVolume::new(&ctx("tenant-1", "run-1")).unwrap();
    let e = volume.volume_config("/inputs", true).unwrap_err();
    assert_eq!(e.kind, ErrorKind::Configuration);
    let e = volume
      .read_files(&[String::from("domains.txt")])
      .await
      .unwrap_err();
    assert_eq!(e.kind, ErrorKind::Configuration);
  }
}

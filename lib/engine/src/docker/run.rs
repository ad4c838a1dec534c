use std::{process::Stdio, time::Duration};

use anyhow::Context;
use indexmap::IndexMap;
use studio_types::{
  component::{DockerRunnerConfig, NetworkMode},
  context::ExecutionContext,
  errors::{ExecuteError, ExecuteResult},
};
use tokio::{
  io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
  process::Command,
  task::JoinHandle,
};

use super::docker_bin;

/// Caps for line-oriented capture, bounding memory over long
/// scans. Lines keep streaming to the log past the capture cap.
const MAX_LINE_BYTES: usize = 256 * 1024;
const MAX_CAPTURED_LINES: usize = 100_000;

/// How much trailing stderr is carried in error details.
const STDERR_SNIPPET_BYTES: usize = 2_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
  /// Volume name.
  pub source: String,
  /// Container path.
  pub target: String,
  pub read_only: bool,
}

impl VolumeMount {
  pub fn render(&self) -> String {
    let mode = if self.read_only { "ro" } else { "rw" };
    format!("{}:{}:{}", self.source, self.target, mode)
  }
}

/// A fully resolved container invocation. Static fields come from
/// the component's [DockerRunnerConfig], dynamic argv / volumes /
/// env are filled in by the component's execute.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
  pub image: String,
  pub platform: Option<String>,
  pub entrypoint: Option<String>,
  pub command: Vec<String>,
  pub env: IndexMap<String, String>,
  pub volumes: Vec<VolumeMount>,
  pub network: NetworkMode,
  pub timeout_seconds: u64,
  /// Written to container stdin, then the pipe is closed.
  pub stdin: Option<Vec<u8>>,
  /// Exit codes treated as success-with-findings.
  pub expected_exit_codes: Vec<i64>,
  /// Stream stdout / stderr lines into the invocation logger.
  /// Disabled for internal sandbox helper containers.
  pub stream_logs: bool,
}

impl ContainerSpec {
  pub fn from_runner(config: &DockerRunnerConfig) -> ContainerSpec {
    ContainerSpec {
      image: config.image.clone(),
      platform: config.platform.clone(),
      entrypoint: config.entrypoint.clone(),
      command: config.command.clone(),
      env: config.env.clone(),
      volumes: Vec::new(),
      network: config.network,
      timeout_seconds: config.timeout_seconds,
      stdin: None,
      expected_exit_codes: config.expected_exit_codes.clone(),
      stream_logs: true,
    }
  }

  /// The argv passed to the engine binary. No shell is involved
  /// anywhere; opting into one means setting `sh` as entrypoint
  /// explicitly.
  fn run_args(&self) -> Vec<String> {
    let mut args =
      vec![String::from("run"), String::from("--rm")];
    if self.stdin.is_some() {
      args.push(String::from("-i"));
    }
    if let Some(platform) = &self.platform {
      args.push(String::from("--platform"));
      args.push(platform.clone());
    }
    args.push(String::from("--network"));
    args.push(self.network.to_string());
    for (key, value) in &self.env {
      args.push(String::from("-e"));
      args.push(format!("{key}={value}"));
    }
    for mount in &self.volumes {
      args.push(String::from("-v"));
      args.push(mount.render());
    }
    if let Some(entrypoint) = &self.entrypoint {
      args.push(String::from("--entrypoint"));
      args.push(entrypoint.clone());
    }
    args.push(self.image.clone());
    args.extend(self.command.iter().cloned());
    args
  }
}

#[derive(Debug, Clone)]
pub struct ContainerExit {
  pub exit_code: i64,
  pub stdout: String,
  pub stderr: String,
  /// The exit code was non-zero but declared expected, eg
  /// Prowler 3 / TruffleHog 183 signaling findings present.
  pub expected_exit: bool,
}

/// Run a container to completion under wall-clock timeout and
/// cancellation, streaming output line by line.
pub async fn execute_container(
  spec: ContainerSpec,
  ctx: &ExecutionContext,
) -> ExecuteResult<ContainerExit> {
  if spec.timeout_seconds == 0 {
    return Err(
      ExecuteError::validation("timeoutSeconds must be positive")
        .with_field_error("timeoutSeconds", "must be positive"),
    );
  }
  if spec.command.is_empty() {
    return Err(ExecuteError::configuration(format!(
      "empty container command for image '{}'",
      spec.image
    )));
  }

  let mut spec = spec;
  let timeout = Duration::from_secs(spec.timeout_seconds);
  let stdin = spec.stdin.take();

  let mut command = Command::new(docker_bin());
  command
    .args(spec.run_args())
    .stdin(if stdin.is_some() {
      Stdio::piped()
    } else {
      Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  let mut child = command.spawn().map_err(|e| {
    ExecuteError::container(format!(
      "failed to start container for image '{}'",
      spec.image
    ))
    .with_cause(anyhow::Error::from(e))
  })?;

  if let Some(stdin) = stdin {
    let mut handle = child.stdin.take().ok_or_else(|| {
      ExecuteError::container("container stdin not piped")
    })?;
    tokio::spawn(async move {
      if let Err(e) = handle.write_all(&stdin).await {
        debug!("failed to write container stdin | {e:#}");
      }
      // Dropping the handle closes the pipe.
    });
  }

  let (Some(child_stdout), Some(child_stderr)) =
    (child.stdout.take(), child.stderr.take())
  else {
    terminate(&mut child).await;
    return Err(ExecuteError::container(
      "container stdio not piped",
    ));
  };
  let stream_ctx = spec.stream_logs.then(|| ctx.clone());
  let stdout_task =
    spawn_line_reader(child_stdout, stream_ctx.clone(), false);
  let stderr_task =
    spawn_line_reader(child_stderr, stream_ctx, true);

  let status = tokio::select! {
    status = child.wait() => status
      .context("failed to await container exit")
      .map_err(|e| {
        ExecuteError::container("container wait failed")
          .with_cause(e)
      })?,
    _ = tokio::time::sleep(timeout) => {
      terminate(&mut child).await;
      return Err(
        ExecuteError::container(format!(
          "container timed out after {}s",
          spec.timeout_seconds
        ))
        .with_detail("image", spec.image.clone())
        .with_detail("timeoutSeconds", spec.timeout_seconds),
      );
    }
    _ = ctx.cancel_token().cancelled() => {
      terminate(&mut child).await;
      return Err(
        ExecuteError::container("invocation cancelled")
          .non_retryable()
          .with_detail("cancelled", true),
      );
    }
  };

  let stdout = stdout_task.await.unwrap_or_default();
  let stderr = stderr_task.await.unwrap_or_default();

  let exit_code = match status.code() {
    Some(code) => code as i64,
    None => {
      return Err(
        ExecuteError::container("container terminated by signal")
          .with_detail("image", spec.image.clone()),
      );
    }
  };

  if exit_code == 0 {
    return Ok(ContainerExit {
      exit_code,
      stdout,
      stderr,
      expected_exit: false,
    });
  }
  if spec.expected_exit_codes.contains(&exit_code) {
    debug!(
      "container exited with declared expected code {exit_code}"
    );
    return Ok(ContainerExit {
      exit_code,
      stdout,
      stderr,
      expected_exit: true,
    });
  }
  Err(
    ExecuteError::container(format!(
      "container exited with code {exit_code}"
    ))
    .with_detail("image", spec.image.clone())
    .with_detail("exitCode", exit_code)
    .with_detail("stderr", tail(&stderr, STDERR_SNIPPET_BYTES)),
  )
}

async fn terminate(child: &mut tokio::process::Child) {
  if let Err(e) = child.start_kill() {
    warn!("failed to kill container process | {e:#}");
  }
  child.wait().await.ok();
}

fn spawn_line_reader(
  reader: impl AsyncRead + Unpin + Send + 'static,
  ctx: Option<ExecutionContext>,
  is_stderr: bool,
) -> JoinHandle<String> {
  tokio::spawn(async move {
    let mut lines = BufReader::new(reader).lines();
    let mut captured = String::new();
    let mut count: usize = 0;
    while let Ok(Some(line)) = lines.next_line().await {
      let line = truncate_at_boundary(line, MAX_LINE_BYTES);
      if let Some(ctx) = &ctx {
        if is_stderr {
          ctx.warn(line.clone());
        } else {
          ctx.info(line.clone());
        }
      }
      if count < MAX_CAPTURED_LINES {
        captured.push_str(&line);
        captured.push('\n');
        count += 1;
      }
    }
    // Drop a single trailing newline so raw output matches what
    // the tool printed.
    if captured.ends_with('\n') {
      captured.pop();
    }
    captured
  })
}

fn truncate_at_boundary(mut line: String, max: usize) -> String {
  if line.len() <= max {
    return line;
  }
  let mut cut = max;
  while !line.is_char_boundary(cut) {
    cut -= 1;
  }
  line.truncate(cut);
  line
}

fn tail(text: &str, max: usize) -> String {
  if text.len() <= max {
    return text.to_string();
  }
  let mut start = text.len() - max;
  while !text.is_char_boundary(start) {
    start += 1;
  }
  text[start..].to_string()
}

#[cfg(test)]
mod tests {
  use studio_types::errors::ErrorKind;

  use super::*;

  fn ctx() -> ExecutionContext {
    ExecutionContext::builder("run-1", "tenant-1").build().0
  }

  fn spec() -> ContainerSpec {
    ContainerSpec {
      image: String::from("projectdiscovery/subfinder:latest"),
      command: vec![
        String::from("-silent"),
        String::from("-dL"),
        String::from("/inputs/domains.txt"),
      ],
      timeout_seconds: 600,
      ..Default::default()
    }
  }

  #[test]
  fn run_args_render_in_stable_order() {
    let mut spec = spec();
    spec.platform = Some(String::from("linux/amd64"));
    spec.network = NetworkMode::Bridge;
    spec.env.insert(
      String::from("HOME"),
      String::from("/tmp"),
    );
    spec.volumes.push(VolumeMount {
      source: String::from("tenant-a-run-b-1"),
      target: String::from("/inputs"),
      read_only: true,
    });
    assert_eq!(
      spec.run_args(),
      [
        "run",
        "--rm",
        "--platform",
        "linux/amd64",
        "--network",
        "bridge",
        "-e",
        "HOME=/tmp",
        "-v",
        "tenant-a-run-b-1:/inputs:ro",
        "projectdiscovery/subfinder:latest",
        "-silent",
        "-dL",
        "/inputs/domains.txt",
      ]
    );
  }

  #[test]
  fn stdin_adds_interactive_flag_and_entrypoint_renders() {
    let mut spec = spec();
    spec.stdin = Some(b"hello".to_vec());
    spec.entrypoint = Some(String::from("sh"));
    spec.command =
      vec![String::from("-c"), String::from("cat > '/data/x'")];
    let args = spec.run_args();
    assert_eq!(args[2], "-i");
    let entrypoint_at =
      args.iter().position(|a| a == "--entrypoint").unwrap();
    assert_eq!(args[entrypoint_at + 1], "sh");
  }

  #[test]
  fn rw_mounts_render_rw() {
    let mount = VolumeMount {
      source: String::from("vol"),
      target: String::from("/output"),
      read_only: false,
    };
    assert_eq!(mount.render(), "vol:/output:rw");
  }

  #[tokio::test]
  async fn zero_timeout_is_a_validation_error() {
    let mut spec = spec();
    spec.timeout_seconds = 0;
    let e = execute_container(spec, &ctx()).await.unwrap_err();
    assert_eq!(e.kind, ErrorKind::Validation);
    assert!(e.field_errors.contains_key("timeoutSeconds"));
  }

  #[tokio::test]
  async fn empty_argv_is_a_configuration_error() {
    let mut spec = spec();
    spec.command.clear();
    let e = execute_container(spec, &ctx()).await.unwrap_err();
    assert_eq!(e.kind, ErrorKind::Configuration);
  }

  #[test]
  fn truncation_respects_char_boundaries() {
    let line = format!("{}é", "a".repeat(9));
    let truncated = truncate_at_boundary(line, 10);
    assert_eq!(truncated, "a".repeat(9));
  }
}

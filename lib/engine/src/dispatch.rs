use std::future::Future;

use serde_json::{Value, json};
use studio_types::{
  JsonObject,
  component::RunnerConfig,
  context::ExecutionContext,
  errors::{ExecuteError, ExecuteResult},
};

use crate::docker::{
  ContainerExit, ContainerSpec, execute_container,
};

/// A runner resolved for one invocation: the component's static
/// runner config merged with whatever argv / mounts / stdin its
/// execute body built for this payload.
pub enum ResolvedRunner {
  Inline,
  Docker(ContainerSpec),
}

impl ResolvedRunner {
  /// Resolve a docker runner, failing Configuration when the
  /// component is wired with a different runner kind.
  pub fn docker(
    runner: &RunnerConfig,
  ) -> ExecuteResult<ContainerSpec> {
    match runner {
      RunnerConfig::Docker(config) => {
        Ok(ContainerSpec::from_runner(config))
      }
      RunnerConfig::Inline => Err(ExecuteError::configuration(
        "component is not wired to a docker runner",
      )),
    }
  }

}

/// What a runner produced, before the component interprets it
/// against its output schema.
pub enum RunnerResult {
  /// Inline runner value, verbatim.
  Value(JsonObject),
  /// Docker runner frame: exit code, captured streams, expected
  /// exit marker.
  Container(ContainerExit),
}

impl RunnerResult {
  /// Raw stdout, for components whose output schema wants a
  /// plain string.
  pub fn raw(&self) -> &str {
    match self {
      RunnerResult::Value(_) => "",
      RunnerResult::Container(exit) => &exit.stdout,
    }
  }

  /// The runner-framed object `{exitCode, raw, stderr}`.
  pub fn framed(&self) -> Value {
    match self {
      RunnerResult::Value(value) => {
        Value::Object(value.clone())
      }
      RunnerResult::Container(exit) => json!({
        "exitCode": exit.exit_code,
        "raw": exit.stdout,
        "stderr": exit.stderr,
      }),
    }
  }

  /// The inline runner's value, verbatim.
  pub fn value(self) -> ExecuteResult<JsonObject> {
    match self {
      RunnerResult::Value(value) => Ok(value),
      RunnerResult::Container(_) => Err(
        ExecuteError::configuration(
          "runner produced a container exit, expected an inline value",
        ),
      ),
    }
  }

  pub fn container(self) -> ExecuteResult<ContainerExit> {
    match self {
      RunnerResult::Container(exit) => Ok(exit),
      RunnerResult::Value(_) => Err(
        ExecuteError::configuration(
          "runner produced an inline value, expected a container exit",
        ),
      ),
    }
  }
}

/// Execute a node body under its resolved runner and normalize
/// the result. Container stdout / stderr stream into the
/// invocation logger line by line as they arrive.
pub async fn run_component_with_runner<F, Fut>(
  runner: ResolvedRunner,
  inline: F,
  ctx: &ExecutionContext,
) -> ExecuteResult<RunnerResult>
where
  F: FnOnce(ExecutionContext) -> Fut,
  Fut: Future<Output = ExecuteResult<JsonObject>>,
{
  match runner {
    ResolvedRunner::Inline => {
      let value = inline(ctx.clone()).await?;
      Ok(RunnerResult::Value(value))
    }
    ResolvedRunner::Docker(spec) => {
      let exit = execute_container(spec, ctx).await?;
      Ok(RunnerResult::Container(exit))
    }
  }
}

#[cfg(test)]
mod tests {
  use studio_types::errors::ErrorKind;

  use super::*;

  fn ctx() -> ExecutionContext {
    ExecutionContext::builder("run-1", "tenant-1").build().0
  }

  #[tokio::test]
  async fn inline_values_pass_through_verbatim() {
    let result = run_component_with_runner(
      ResolvedRunner::Inline,
      |_| async {
        let mut out = JsonObject::new();
        out.insert(String::from("deleted"), json!(2));
        Ok(out)
      },
      &ctx(),
    )
    .await
    .unwrap();
    assert_eq!(result.framed()["deleted"], json!(2));
  }

  #[test]
  fn docker_resolution_rejects_inline_components() {
    let e =
      ResolvedRunner::docker(&RunnerConfig::Inline).unwrap_err();
    assert_eq!(e.kind, ErrorKind::Configuration);
  }

  #[test]
  fn framed_container_result_carries_exit_frame() {
    let result = RunnerResult::Container(ContainerExit {
      exit_code: 3,
      stdout: String::from("raw"),
      stderr: String::from("findings present"),
      expected_exit: true,
    });
    let framed = result.framed();
    assert_eq!(framed["exitCode"], json!(3));
    assert_eq!(framed["stderr"], json!("findings present"));
  }
}

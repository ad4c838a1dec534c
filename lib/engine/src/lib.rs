//! # Studio execution engine
//!
//! Takes a node handed over by the workflow orchestrator
//! (`component id` + raw inputs / params + execution context),
//! resolves the component, validates and coerces the payload,
//! and runs it under the component's retry policy and runner.

#[macro_use]
extern crate tracing;

use studio_types::{
  JsonObject,
  component::{ComponentDefinition, ResolvedNode},
  context::ExecutionContext,
  errors::{ErrorKind, ExecuteError, ExecuteResult},
};

pub mod dispatch;
pub mod docker;
pub mod registry;
pub mod retry;

/// Orchestrator entrypoint: resolve the component from the
/// process registry and run it.
pub async fn invoke(
  component_id: &str,
  inputs: &JsonObject,
  params: &JsonObject,
  ctx: &ExecutionContext,
) -> ExecuteResult<JsonObject> {
  let definition = registry::registry()?.get(component_id)?;
  invoke_definition(definition, inputs, params, ctx).await
}

/// Run a single definition: schema validation and coercion on the
/// way in, retry policy around `execute`, output contract
/// enforcement on the way out.
pub async fn invoke_definition(
  definition: &ComponentDefinition,
  inputs: &JsonObject,
  params: &JsonObject,
  ctx: &ExecutionContext,
) -> ExecuteResult<JsonObject> {
  let inputs = definition
    .inputs
    .parse_object(inputs)
    .map_err(|e| relabel(e, "inputs"))?;
  let params = definition
    .parameters
    .parse_object(params)
    .map_err(|e| relabel(e, "parameters"))?;
  let resolved = ResolvedNode { inputs, params };

  let outputs = retry::run_with_policy(&definition.retry, ctx, || {
    (definition.execute)(resolved.clone(), ctx.clone())
  })
  .await?;

  definition
    .outputs
    .parse_object(&outputs)
    .map_err(|e| relabel(e, "outputs"))
}

fn relabel(mut e: ExecuteError, what: &str) -> ExecuteError {
  if e.kind == ErrorKind::Validation {
    e.message = format!("{what} failed schema validation");
  }
  e
}

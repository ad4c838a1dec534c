//! # Studio Types
//!
//! Shared entities for the Studio worker. The orchestrator, the execution
//! engine, and the component catalog all speak in terms of these types.

use async_timing_util::unix_timestamp_ms;
use typeshare::typeshare;

/// [ComponentDefinition][component::ComponentDefinition] and its runner / retry subtypes.
pub mod component;
/// [LogConfig][config::LogConfig] and [WorkerConfig][config::WorkerConfig].
pub mod config;
/// [ExecutionContext][context::ExecutionContext], progress events, secret access.
pub mod context;
/// [ExecuteError][errors::ExecuteError] and the error kind taxonomy.
pub mod errors;
/// Port schemas, parsing / coercion, and the credential contract catalog.
pub mod schema;

#[typeshare(serialized_as = "any")]
pub type JsonObject = serde_json::Map<String, serde_json::Value>;

/// Unix timestamp in milliseconds as i64
pub fn studio_timestamp() -> i64 {
  unix_timestamp_ms() as i64
}

//! # Component catalog
//!
//! Every concrete component the worker can execute. Each module
//! composes the same machinery: typed ports, a runner, an
//! isolated sandbox volume where staging is needed, and a parser
//! from tool output to normalized results.

use studio_types::component::ComponentDefinition;

mod atlassian;
mod common;
mod httpx;
mod katana;
mod notify;
mod prowler;
mod sqlmap;
mod subfinder;
mod supabase;
mod trufflehog;

pub use common::Finding;

/// The full catalog, in the order it is presented to builders.
/// The worker registers this at startup.
pub fn all() -> Vec<ComponentDefinition> {
  vec![
    subfinder::definition(),
    httpx::definition(),
    katana::definition(),
    trufflehog::definition(),
    sqlmap::definition(),
    prowler::definition(),
    notify::definition(),
    supabase::definition(),
    atlassian::definition(),
  ]
}

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};
use typeshare::typeshare;

use crate::JsonObject;

pub type ExecuteResult<T> = Result<T, ExecuteError>;

/// Classification attached to every error crossing the engine boundary.
/// The retry controller keys off this.
#[typeshare]
#[derive(
  Serialize,
  Deserialize,
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Hash,
  Display,
  EnumString,
  AsRefStr,
)]
pub enum ErrorKind {
  /// Input, parameter, or output failed schema validation.
  Validation,
  /// Missing or invalid wiring: unknown component, missing
  /// credentials, wrong runner kind.
  Configuration,
  /// An external API failed or returned a malformed response.
  Service,
  /// Docker lifecycle or runtime failure, excluding expected
  /// findings-present exits.
  Container,
  #[default]
  Unknown,
}

impl ErrorKind {
  pub fn default_retryable(self) -> bool {
    match self {
      ErrorKind::Validation | ErrorKind::Configuration => false,
      ErrorKind::Service
      | ErrorKind::Container
      | ErrorKind::Unknown => true,
    }
  }
}

/// The classified error for a component invocation.
///
/// `details` must never carry secret values, only safe context
/// (exit codes, bounded stderr snippets, counts).
#[derive(Debug, Default)]
pub struct ExecuteError {
  pub kind: ErrorKind,
  pub message: String,
  /// Chained source error.
  pub cause: Option<anyhow::Error>,
  /// JSON-safe context map.
  pub details: JsonObject,
  /// Port / field path -> failure messages.
  pub field_errors: IndexMap<String, Vec<String>>,
  /// Explicit override of the kind-derived retryability.
  /// Only set for cancellation (Container, not retryable).
  retryable: Option<bool>,
}

impl ExecuteError {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> ExecuteError {
    ExecuteError {
      kind,
      message: message.into(),
      ..Default::default()
    }
  }

  pub fn validation(message: impl Into<String>) -> ExecuteError {
    ExecuteError::new(ErrorKind::Validation, message)
  }

  pub fn configuration(message: impl Into<String>) -> ExecuteError {
    ExecuteError::new(ErrorKind::Configuration, message)
  }

  pub fn service(message: impl Into<String>) -> ExecuteError {
    ExecuteError::new(ErrorKind::Service, message)
  }

  pub fn container(message: impl Into<String>) -> ExecuteError {
    ExecuteError::new(ErrorKind::Container, message)
  }

  pub fn unknown(message: impl Into<String>) -> ExecuteError {
    ExecuteError::new(ErrorKind::Unknown, message)
  }

  pub fn with_cause(
    mut self,
    cause: impl Into<anyhow::Error>,
  ) -> ExecuteError {
    self.cause = Some(cause.into());
    self
  }

  pub fn with_detail(
    mut self,
    key: impl Into<String>,
    value: impl Into<Value>,
  ) -> ExecuteError {
    self.details.insert(key.into(), value.into());
    self
  }

  pub fn with_field_error(
    mut self,
    path: impl Into<String>,
    message: impl Into<String>,
  ) -> ExecuteError {
    self
      .field_errors
      .entry(path.into())
      .or_default()
      .push(message.into());
    self
  }

  pub fn with_field_errors(
    mut self,
    field_errors: IndexMap<String, Vec<String>>,
  ) -> ExecuteError {
    self.field_errors.extend(field_errors);
    self
  }

  /// Pin retryability to false regardless of kind,
  /// eg. for cancellation surfaced as Container.
  pub fn non_retryable(mut self) -> ExecuteError {
    self.retryable = Some(false);
    self
  }

  pub fn retryable(&self) -> bool {
    self.retryable.unwrap_or(self.kind.default_retryable())
  }

  /// Classify an arbitrary error. Already-classified errors pass
  /// through, anything else is Unknown with the cause chained.
  pub fn classify(e: anyhow::Error) -> ExecuteError {
    match e.downcast::<ExecuteError>() {
      Ok(e) => e,
      Err(e) => {
        ExecuteError::unknown(format!("{e}")).with_cause(e)
      }
    }
  }
}

impl std::fmt::Display for ExecuteError {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    write!(f, "{}: {}", self.kind, self.message)
  }
}

impl std::error::Error for ExecuteError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    self
      .cause
      .as_ref()
      .map(|cause| &**cause as &(dyn std::error::Error + 'static))
  }
}

/// Wire projection of [ExecuteError], what the orchestrator /
/// UI receives. The cause chain is flattened into `trace`.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteErrorResponse {
  pub kind: ErrorKind,
  pub message: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub trace: Vec<String>,
  #[serde(default, skip_serializing_if = "JsonObject::is_empty")]
  pub details: JsonObject,
  #[serde(
    default,
    skip_serializing_if = "IndexMap::is_empty"
  )]
  pub field_errors: IndexMap<String, Vec<String>>,
  pub retryable: bool,
}

impl From<&ExecuteError> for ExecuteErrorResponse {
  fn from(e: &ExecuteError) -> ExecuteErrorResponse {
    let mut trace = Vec::new();
    if let Some(cause) = &e.cause {
      trace.extend(cause.chain().map(|e| e.to_string()));
    }
    ExecuteErrorResponse {
      kind: e.kind,
      message: e.message.clone(),
      trace,
      details: e.details.clone(),
      field_errors: e.field_errors.clone(),
      retryable: e.retryable(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn kind_retryability_defaults() {
    assert!(!ErrorKind::Validation.default_retryable());
    assert!(!ErrorKind::Configuration.default_retryable());
    assert!(ErrorKind::Service.default_retryable());
    assert!(ErrorKind::Container.default_retryable());
    assert!(ErrorKind::Unknown.default_retryable());
  }

  #[test]
  fn non_retryable_override_wins() {
    let e = ExecuteError::container("cancelled").non_retryable();
    assert!(!e.retryable());
  }

  #[test]
  fn classify_passes_through_classified_errors() {
    let e = ExecuteError::validation("bad input")
      .with_field_error("domains", "required value is missing");
    let classified = ExecuteError::classify(e.into());
    assert_eq!(classified.kind, ErrorKind::Validation);
    assert_eq!(
      classified.field_errors["domains"],
      vec!["required value is missing"]
    );
  }

  #[test]
  fn classify_wraps_unclassified_as_unknown() {
    let e = anyhow::anyhow!("something broke");
    let classified = ExecuteError::classify(e);
    assert_eq!(classified.kind, ErrorKind::Unknown);
    assert!(classified.retryable());
  }

  #[test]
  fn response_flattens_cause_chain() {
    let cause = anyhow::anyhow!("connection refused")
      .context("failed to reach docker daemon");
    let e = ExecuteError::container("volume create failed")
      .with_cause(cause)
      .with_detail("volumeName", "tenant-a-run-b-1");
    let res = ExecuteErrorResponse::from(&e);
    assert_eq!(res.kind, ErrorKind::Container);
    assert_eq!(res.trace.len(), 2);
    assert!(res.retryable);
  }
}

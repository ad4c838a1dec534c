use std::{fmt, future::Future, pin::Pin, sync::Arc};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use typeshare::typeshare;

use crate::errors::{ExecuteError, ExecuteResult};

/// Progress events which cannot be handed to a slow subscriber
/// are dropped beyond this buffer depth rather than blocking the
/// invocation.
pub const PROGRESS_BUFFER: usize = 256;

#[typeshare]
#[derive(
  Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq,
)]
#[serde(rename_all = "lowercase")]
pub enum ProgressLevel {
  Info,
  Warn,
  Error,
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
  pub level: ProgressLevel,
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct SecretValue {
  pub value: String,
  pub version: String,
}

pub type SecretFuture<'a> =
  Pin<Box<dyn Future<Output = ExecuteResult<SecretValue>> + Send + 'a>>;

/// Contract to the external secret store. The engine only ever
/// reads single secrets by id.
pub trait SecretsProvider: Send + Sync {
  fn get<'a>(&'a self, id: &'a str) -> SecretFuture<'a>;
}

/// Map-backed provider: worker config secrets and tests.
#[derive(Clone, Default)]
pub struct StaticSecrets(Arc<IndexMap<String, String>>);

impl StaticSecrets {
  pub fn new(
    secrets: impl IntoIterator<Item = (String, String)>,
  ) -> StaticSecrets {
    StaticSecrets(Arc::new(secrets.into_iter().collect()))
  }
}

impl SecretsProvider for StaticSecrets {
  fn get<'a>(&'a self, id: &'a str) -> SecretFuture<'a> {
    Box::pin(async move {
      self
        .0
        .get(id)
        .map(|value| SecretValue {
          value: value.clone(),
          version: String::from("static"),
        })
        .ok_or_else(|| {
          ExecuteError::configuration(format!(
            "unknown secret '{id}'"
          ))
        })
    })
  }
}

/// Per-invocation handle passed to `execute`, owned by the
/// orchestrator. Cheap to clone, read-only, shared by the
/// invocation and its descendants.
#[derive(Clone)]
pub struct ExecutionContext {
  inner: Arc<ContextInner>,
}

impl fmt::Debug for ExecutionContext {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("ExecutionContext")
      .field("run_id", &self.inner.run_id)
      .field("tenant_id", &self.inner.tenant_id)
      .finish_non_exhaustive()
  }
}

struct ContextInner {
  run_id: String,
  tenant_id: String,
  progress: mpsc::Sender<ProgressEvent>,
  secrets: Arc<dyn SecretsProvider>,
  cancel: CancellationToken,
}

impl ExecutionContext {
  pub fn builder(
    run_id: impl Into<String>,
    tenant_id: impl Into<String>,
  ) -> ExecutionContextBuilder {
    ExecutionContextBuilder {
      run_id: run_id.into(),
      tenant_id: tenant_id.into(),
      secrets: None,
      cancel: CancellationToken::new(),
      progress_buffer: PROGRESS_BUFFER,
    }
  }

  pub fn run_id(&self) -> &str {
    &self.inner.run_id
  }

  pub fn tenant_id(&self) -> &str {
    &self.inner.tenant_id
  }

  pub fn info(&self, message: impl Into<String>) {
    let message = message.into();
    tracing::info!(
      run_id = %self.inner.run_id,
      tenant_id = %self.inner.tenant_id,
      "{message}",
    );
    self.emit_progress(ProgressEvent {
      level: ProgressLevel::Info,
      message,
      data: None,
    });
  }

  pub fn warn(&self, message: impl Into<String>) {
    let message = message.into();
    tracing::warn!(
      run_id = %self.inner.run_id,
      tenant_id = %self.inner.tenant_id,
      "{message}",
    );
    self.emit_progress(ProgressEvent {
      level: ProgressLevel::Warn,
      message,
      data: None,
    });
  }

  pub fn error(&self, message: impl Into<String>) {
    let message = message.into();
    tracing::error!(
      run_id = %self.inner.run_id,
      tenant_id = %self.inner.tenant_id,
      "{message}",
    );
    self.emit_progress(ProgressEvent {
      level: ProgressLevel::Error,
      message,
      data: None,
    });
  }

  /// Single-threaded cooperative: never blocks on a slow
  /// subscriber. Events past the buffer are dropped.
  pub fn emit_progress(&self, event: ProgressEvent) {
    if self.inner.progress.try_send(event).is_err() {
      tracing::debug!(
        run_id = %self.inner.run_id,
        "progress subscriber behind, event dropped",
      );
    }
  }

  pub async fn secret(
    &self,
    id: &str,
  ) -> ExecuteResult<SecretValue> {
    self.inner.secrets.get(id).await
  }

  pub fn cancel_token(&self) -> &CancellationToken {
    &self.inner.cancel
  }

  pub fn is_cancelled(&self) -> bool {
    self.inner.cancel.is_cancelled()
  }
}

pub struct ExecutionContextBuilder {
  run_id: String,
  tenant_id: String,
  secrets: Option<Arc<dyn SecretsProvider>>,
  cancel: CancellationToken,
  progress_buffer: usize,
}

impl ExecutionContextBuilder {
  pub fn secrets(
    mut self,
    secrets: impl SecretsProvider + 'static,
  ) -> ExecutionContextBuilder {
    self.secrets = Some(Arc::new(secrets));
    self
  }

  pub fn cancel(
    mut self,
    cancel: CancellationToken,
  ) -> ExecutionContextBuilder {
    self.cancel = cancel;
    self
  }

  pub fn progress_buffer(
    mut self,
    progress_buffer: usize,
  ) -> ExecutionContextBuilder {
    self.progress_buffer = progress_buffer.max(1);
    self
  }

  /// Returns the context plus the receiving end of the progress
  /// channel, which the orchestrator drains.
  pub fn build(
    self,
  ) -> (ExecutionContext, mpsc::Receiver<ProgressEvent>) {
    let (tx, rx) = mpsc::channel(self.progress_buffer);
    let context = ExecutionContext {
      inner: Arc::new(ContextInner {
        run_id: self.run_id,
        tenant_id: self.tenant_id,
        progress: tx,
        secrets: self
          .secrets
          .unwrap_or_else(|| Arc::new(StaticSecrets::default())),
        cancel: self.cancel,
      }),
    };
    (context, rx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn static_secrets_resolve_known_ids() {
    let secrets = StaticSecrets::new([(
      String::from("github-token"),
      String::from("gh-value"),
    )]);
    let (ctx, _rx) = ExecutionContext::builder("run-1", "tenant-1")
      .secrets(secrets)
      .build();
    let secret = ctx.secret("github-token").await.unwrap();
    assert_eq!(secret.value, "gh-value");
    let e = ctx.secret("missing").await.unwrap_err();
    assert_eq!(
      e.kind,
      crate::errors::ErrorKind::Configuration
    );
  }

  #[tokio::test]
  async fn progress_events_deliver_in_emission_order() {
    let (ctx, mut rx) =
      ExecutionContext::builder("run-1", "tenant-1").build();
    ctx.info("first");
    ctx.warn("second");
    assert_eq!(rx.recv().await.unwrap().message, "first");
    let second = rx.recv().await.unwrap();
    assert_eq!(second.message, "second");
    assert_eq!(second.level, ProgressLevel::Warn);
  }

  #[tokio::test]
  async fn full_progress_buffer_drops_instead_of_blocking() {
    let (ctx, mut rx) =
      ExecutionContext::builder("run-1", "tenant-1")
        .progress_buffer(2)
        .build();
    for i in 0..10 {
      ctx.info(format!("event {i}"));
    }
    // Only the buffered events are retained.
    assert_eq!(rx.recv().await.unwrap().message, "event 0");
    assert_eq!(rx.recv().await.unwrap().message, "event 1");
    assert!(rx.try_recv().is_err());
  }
}

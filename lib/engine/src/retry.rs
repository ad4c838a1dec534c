use std::{future::Future, time::Duration};

use studio_types::{
  component::RetryPolicy,
  context::ExecutionContext,
  errors::{ExecuteError, ExecuteResult},
};

/// Wrap an operation with bounded exponential backoff.
///
/// Retries only errors whose kind is retryable and not listed in
/// the policy's non-retryable kinds. The backoff sleep is
/// cancellation aware; cancellation surfaces as a non-retryable
/// Container error.
pub async fn run_with_policy<T, F, Fut>(
  policy: &RetryPolicy,
  ctx: &ExecutionContext,
  mut operation: F,
) -> ExecuteResult<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = ExecuteResult<T>>,
{
  let max_attempts = policy.max_attempts.max(1);
  let mut attempt: u32 = 1;
  let mut interval = policy.initial_interval_seconds.max(0.0);
  loop {
    if ctx.is_cancelled() {
      return Err(cancelled());
    }
    let e = match operation().await {
      Ok(value) => return Ok(value),
      Err(e) => e,
    };
    if !e.retryable()
      || policy.non_retryable_error_kinds.contains(&e.kind)
      || attempt >= max_attempts
    {
      return Err(e);
    }
    let backoff = interval
      .min(policy.maximum_interval_seconds.max(0.0));
    ctx.warn(format!(
      "attempt {attempt}/{max_attempts} failed ({e}), retrying in {backoff:.1}s",
    ));
    tokio::select! {
      _ = tokio::time::sleep(Duration::from_secs_f64(backoff)) => {}
      _ = ctx.cancel_token().cancelled() => {
        return Err(cancelled());
      }
    }
    interval *= policy.backoff_coefficient.max(1.0);
    attempt += 1;
  }
}

fn cancelled() -> ExecuteError {
  ExecuteError::container("invocation cancelled")
    .non_retryable()
    .with_detail("cancelled", true)
}

#[cfg(test)]
mod tests {
  use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
  };

  use studio_types::errors::ErrorKind;
  use tokio_util::sync::CancellationToken;

  use super::*;

  fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
      max_attempts,
      initial_interval_seconds: 0.01,
      maximum_interval_seconds: 0.05,
      backoff_coefficient: 2.0,
      non_retryable_error_kinds: Vec::new(),
    }
  }

  fn ctx() -> ExecutionContext {
    ExecutionContext::builder("run-1", "tenant-1").build().0
  }

  #[tokio::test]
  async fn returns_first_success_without_retrying() {
    let calls = Arc::new(AtomicU32::new(0));
    let counted = calls.clone();
    let result =
      run_with_policy(&policy(5), &ctx(), move || {
        let counted = counted.clone();
        async move {
          counted.fetch_add(1, Ordering::SeqCst);
          Ok::<_, ExecuteError>(42)
        }
      })
      .await
      .unwrap();
    assert_eq!(result, 42);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn retryable_errors_exhaust_max_attempts() {
    let calls = Arc::new(AtomicU32::new(0));
    let counted = calls.clone();
    let e = run_with_policy::<u32, _, _>(
      &policy(3),
      &ctx(),
      move || {
        let counted = counted.clone();
        async move {
          counted.fetch_add(1, Ordering::SeqCst);
          Err(ExecuteError::service("upstream flapped"))
        }
      },
    )
    .await
    .unwrap_err();
    assert_eq!(e.kind, ErrorKind::Service);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn validation_errors_are_not_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let counted = calls.clone();
    run_with_policy::<u32, _, _>(&policy(5), &ctx(), move || {
      let counted = counted.clone();
      async move {
        counted.fetch_add(1, Ordering::SeqCst);
        Err(ExecuteError::validation("bad input"))
      }
    })
    .await
    .unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn policy_non_retryable_kinds_short_circuit() {
    let calls = Arc::new(AtomicU32::new(0));
    let counted = calls.clone();
    let mut policy = policy(5);
    policy.non_retryable_error_kinds = vec![ErrorKind::Service];
    run_with_policy::<u32, _, _>(&policy, &ctx(), move || {
      let counted = counted.clone();
      async move {
        counted.fetch_add(1, Ordering::SeqCst);
        Err(ExecuteError::service("bad credentials"))
      }
    })
    .await
    .unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn cancellation_aborts_the_backoff_sleep() {
    let cancel = CancellationToken::new();
    let (ctx, _rx) =
      ExecutionContext::builder("run-1", "tenant-1")
        .cancel(cancel.clone())
        .build();
    let mut slow_policy = policy(5);
    slow_policy.initial_interval_seconds = 30.0;
    slow_policy.maximum_interval_seconds = 30.0;
    cancel.cancel();
    let started = std::time::Instant::now();
    let e = run_with_policy::<u32, _, _>(
      &slow_policy,
      &ctx,
      move || async move {
        Err(ExecuteError::service("flaky"))
      },
    )
    .await
    .unwrap_err();
    assert_eq!(e.kind, ErrorKind::Container);
    assert!(!e.retryable());
    assert!(started.elapsed() < Duration::from_secs(5));
  }
}

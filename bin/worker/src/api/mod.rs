use std::time::Duration;

use derive_variants::{EnumVariants, ExtractVariant};
use engine::docker::SweepSummary;
use resolver_api::Resolve;
use serde::{Deserialize, Serialize};
use studio_types::{
  JsonObject,
  component::ComponentMetadata,
  context::{
    ExecutionContext, ProgressEvent, StaticSecrets,
  },
  errors::ExecuteErrorResponse,
};

use crate::config::worker_config;

mod router;

pub use router::router;

/// Cap on progress events echoed back in an Invoke response.
const MAX_COLLECTED_EVENTS: usize = 500;

pub struct Args;

#[derive(
  Serialize, Deserialize, Debug, Clone, EnumVariants,
)]
#[variant_derive(Debug)]
#[serde(tag = "type", content = "params")]
pub enum WorkerRequest {
  GetVersion(GetVersion),
  GetHealth(GetHealth),
  ListComponents(ListComponents),
  Invoke(Invoke),
  SweepVolumes(SweepVolumes),
}

impl WorkerRequest {
  pub async fn resolve(
    self,
    args: &Args,
  ) -> serror::Result<serde_json::Value> {
    debug!("handling {:?} request", self.extract_variant());
    let response = match self {
      WorkerRequest::GetVersion(request) => {
        to_json(&request.resolve(args).await?)?
      }
      WorkerRequest::GetHealth(request) => {
        to_json(&request.resolve(args).await?)?
      }
      WorkerRequest::ListComponents(request) => {
        to_json(&request.resolve(args).await?)?
      }
      WorkerRequest::Invoke(request) => {
        to_json(&request.resolve(args).await?)?
      }
      WorkerRequest::SweepVolumes(request) => {
        to_json(&request.resolve(args).await?)?
      }
    };
    Ok(response)
  }
}

fn to_json<T: Serialize>(
  response: &T,
) -> serror::Result<serde_json::Value> {
  serde_json::to_value(response)
    .map_err(anyhow::Error::from)
    .map_err(Into::into)
}

//

#[derive(Serialize, Deserialize, Debug, Clone, Resolve)]
#[response(GetVersionResponse)]
#[error(serror::Error)]
pub struct GetVersion {}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GetVersionResponse {
  pub version: String,
}

impl Resolve<Args> for GetVersion {
  async fn resolve(
    self,
    _: &Args,
  ) -> serror::Result<GetVersionResponse> {
    Ok(GetVersionResponse {
      version: env!("CARGO_PKG_VERSION").to_string(),
    })
  }
}

//

#[derive(Serialize, Deserialize, Debug, Clone, Resolve)]
#[response(GetHealthResponse)]
#[error(serror::Error)]
pub struct GetHealth {}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GetHealthResponse {}

impl Resolve<Args> for GetHealth {
  async fn resolve(
    self,
    _: &Args,
  ) -> serror::Result<GetHealthResponse> {
    Ok(GetHealthResponse {})
  }
}

//

#[derive(Serialize, Deserialize, Debug, Clone, Resolve)]
#[response(ListComponentsResponse)]
#[error(serror::Error)]
pub struct ListComponents {}

pub type ListComponentsResponse = Vec<ComponentMetadata>;

impl Resolve<Args> for ListComponents {
  #[instrument(name = "ListComponents", level = "debug", skip_all)]
  async fn resolve(
    self,
    _: &Args,
  ) -> serror::Result<ListComponentsResponse> {
    let registry = engine::registry::registry()
      .map_err(anyhow::Error::from)?;
    Ok(registry.list())
  }
}

//

/// Execute one workflow node on this worker.
#[derive(Serialize, Deserialize, Debug, Clone, Resolve)]
#[response(InvokeResponse)]
#[error(serror::Error)]
#[serde(rename_all = "camelCase")]
pub struct Invoke {
  pub component_id: String,
  pub run_id: String,
  pub tenant_id: String,
  #[serde(default)]
  pub inputs: JsonObject,
  #[serde(default)]
  pub params: JsonObject,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResponse {
  pub success: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub outputs: Option<JsonObject>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<ExecuteErrorResponse>,
  /// Progress events emitted by the invocation, in order.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub events: Vec<ProgressEvent>,
}

impl Resolve<Args> for Invoke {
  #[instrument(
    name = "Invoke",
    skip_all,
    fields(
      component_id = self.component_id,
      run_id = self.run_id,
      tenant_id = self.tenant_id,
    )
  )]
  async fn resolve(
    self,
    _: &Args,
  ) -> serror::Result<InvokeResponse> {
    let (ctx, mut progress) =
      ExecutionContext::builder(&self.run_id, &self.tenant_id)
        .secrets(StaticSecrets::new(
          worker_config().secrets.clone(),
        ))
        .build();
    let collector = tokio::spawn(async move {
      let mut events = Vec::new();
      while let Some(event) = progress.recv().await {
        if events.len() < MAX_COLLECTED_EVENTS {
          events.push(event);
        }
      }
      events
    });

    let result = engine::invoke(
      &self.component_id,
      &self.inputs,
      &self.params,
      &ctx,
    )
    .await;

    // Dropping the context closes the progress channel and ends
    // the collector.
    drop(ctx);
    let events = collector.await.unwrap_or_default();

    Ok(match result {
      Ok(outputs) => InvokeResponse {
        success: true,
        outputs: Some(outputs),
        error: None,
        events,
      },
      Err(e) => InvokeResponse {
        success: false,
        outputs: None,
        error: Some(ExecuteErrorResponse::from(&e)),
        events,
      },
    })
  }
}

//

/// Destroy managed sandbox volumes older than the threshold.
#[derive(Serialize, Deserialize, Debug, Clone, Resolve)]
#[response(SweepSummary)]
#[error(serror::Error)]
#[serde(rename_all = "camelCase")]
pub struct SweepVolumes {
  /// Override the configured threshold.
  #[serde(default)]
  pub threshold_hours: Option<u64>,
}

impl Resolve<Args> for SweepVolumes {
  #[instrument(name = "SweepVolumes", skip_all)]
  async fn resolve(
    self,
    _: &Args,
  ) -> serror::Result<SweepSummary> {
    let threshold_hours = self.threshold_hours.unwrap_or(
      worker_config().volume_sweep_threshold_hours,
    );
    Ok(
      engine::docker::sweep_orphaned_volumes(
        Duration::from_secs(threshold_hours * 3600),
      )
      .await,
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn requests_deserialize_from_tagged_json() {
    let request: WorkerRequest = serde_json::from_str(
      r#"{
        "type": "Invoke",
        "params": {
          "componentId": "studio.recon.subfinder",
          "runId": "run-1",
          "tenantId": "tenant-1",
          "inputs": { "domains": ["example.com"] }
        }
      }"#,
    )
    .unwrap();
    let WorkerRequest::Invoke(invoke) = request else {
      panic!("expected Invoke");
    };
    assert_eq!(invoke.component_id, "studio.recon.subfinder");
    assert!(invoke.params.is_empty());
  }
}

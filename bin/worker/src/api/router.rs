use anyhow::Context;
use axum::{Json, Router, extract::Path, routing::post};
use serde_json::{Value, json};

use super::{Args, WorkerRequest};

#[derive(serde::Deserialize)]
struct Variant {
  variant: String,
}

pub fn router() -> Router {
  Router::new()
    .route("/", post(handler))
    .route("/{variant}", post(variant_handler))
}

async fn variant_handler(
  Path(Variant { variant }): Path<Variant>,
  Json(params): Json<Value>,
) -> serror::Result<Json<Value>> {
  let request: WorkerRequest = serde_json::from_value(json!({
    "type": variant,
    "params": params,
  }))
  .context("failed to parse request body")?;
  handler(Json(request)).await
}

async fn handler(
  Json(request): Json<WorkerRequest>,
) -> serror::Result<Json<Value>> {
  let response = request.resolve(&Args).await?;
  Ok(Json(response))
}

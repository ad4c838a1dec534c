use engine::registry::ComponentRegistry;
use serde_json::json;
use studio_types::{
  component::RunnerConfig, context::ExecutionContext,
  errors::ErrorKind,
};

#[test]
fn the_full_catalog_registers() {
  let registry = ComponentRegistry::new(components::all())
    .expect("catalog registers");
  let listed = registry.list();
  assert_eq!(listed.len(), 9);
  // Metadata projections expose ports but no execute bodies.
  let subfinder = listed
    .iter()
    .find(|c| c.id == "studio.recon.subfinder")
    .unwrap();
  assert_eq!(subfinder.runner_kind, "docker");
  assert_eq!(
    subfinder.inputs["domains"]["kind"],
    json!("list")
  );
}

#[test]
fn catalog_ids_are_stable_and_unique() {
  let ids = components::all()
    .into_iter()
    .map(|c| c.id)
    .collect::<Vec<_>>();
  let mut deduped = ids.clone();
  deduped.sort();
  deduped.dedup();
  assert_eq!(deduped.len(), ids.len());
  assert!(ids.iter().all(|id| id.starts_with("studio.")));
}

#[test]
fn docker_components_declare_positive_timeouts() {
  for component in components::all() {
    if let RunnerConfig::Docker(docker) = &component.runner {
      assert!(
        docker.timeout_seconds > 0,
        "{} has a zero timeout",
        component.id
      );
      assert!(
        !docker.image.is_empty(),
        "{} has no image",
        component.id
      );
    }
  }
}

#[tokio::test]
async fn invoking_with_missing_required_inputs_is_validation() {
  let registry =
    ComponentRegistry::new(components::all()).unwrap();
  let definition =
    registry.get("studio.recon.subfinder").unwrap();
  let (ctx, _rx) =
    ExecutionContext::builder("run-1", "tenant-1").build();
  let empty = serde_json::Map::new();
  let e = engine::invoke_definition(
    definition, &empty, &empty, &ctx,
  )
  .await
  .unwrap_err();
  assert_eq!(e.kind, ErrorKind::Validation);
  assert_eq!(
    e.field_errors["domains"],
    vec!["required value is missing"]
  );
}

#[tokio::test]
async fn httpx_empty_targets_round_trip_through_the_engine() {
  let registry =
    ComponentRegistry::new(components::all()).unwrap();
  let definition = registry.get("studio.recon.httpx").unwrap();
  let (ctx, _rx) =
    ExecutionContext::builder("run-1", "tenant-1").build();
  let inputs = json!({ "targets": [] });
  let outputs = engine::invoke_definition(
    definition,
    inputs.as_object().unwrap(),
    &serde_json::Map::new(),
    &ctx,
  )
  .await
  .unwrap();
  assert_eq!(outputs["results"], json!([]));
  assert_eq!(outputs["targetCount"], json!(0));
  assert_eq!(outputs["options"]["techDetect"], json!(true));
}

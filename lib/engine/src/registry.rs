use std::sync::OnceLock;

use anyhow::{Context, anyhow};
use indexmap::IndexMap;
use studio_types::{
  component::{ComponentDefinition, ComponentMetadata},
  errors::{ExecuteError, ExecuteResult},
};

static REGISTRY: OnceLock<ComponentRegistry> = OnceLock::new();

/// Populate the process registry. Called exactly once at worker
/// startup, before any invocation; the registry is read-only
/// afterwards.
pub fn init(
  definitions: Vec<ComponentDefinition>,
) -> anyhow::Result<()> {
  let registry = ComponentRegistry::new(definitions)?;
  info!("registered {} components", registry.components.len());
  REGISTRY
    .set(registry)
    .map_err(|_| anyhow!("component registry already initialized"))
}

pub fn registry() -> ExecuteResult<&'static ComponentRegistry> {
  REGISTRY.get().ok_or_else(|| {
    ExecuteError::configuration(
      "component registry not initialized",
    )
  })
}

/// Keyed store of component definitions.
#[derive(Debug)]
pub struct ComponentRegistry {
  components: IndexMap<String, ComponentDefinition>,
}

impl ComponentRegistry {
  pub fn new(
    definitions: Vec<ComponentDefinition>,
  ) -> anyhow::Result<ComponentRegistry> {
    let mut components = IndexMap::new();
    for definition in definitions {
      definition.self_check().with_context(|| {
        format!(
          "component '{}' failed registration self check",
          definition.id
        )
      })?;
      let id = definition.id.clone();
      if components.insert(id.clone(), definition).is_some() {
        return Err(anyhow!("duplicate component id '{id}'"));
      }
    }
    Ok(ComponentRegistry { components })
  }

  pub fn get(
    &self,
    id: &str,
  ) -> ExecuteResult<&ComponentDefinition> {
    self.components.get(id).ok_or_else(|| {
      ExecuteError::configuration(format!(
        "unknown component '{id}'"
      ))
      .with_detail("componentId", id)
    })
  }

  /// Metadata projections only, no execute bodies.
  pub fn list(&self) -> Vec<ComponentMetadata> {
    self
      .components
      .values()
      .map(ComponentDefinition::metadata)
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use studio_types::{
    JsonObject,
    component::{
      ComponentCategory, ExecuteFn, RetryPolicy, RunnerConfig,
    },
    errors::ErrorKind,
    schema::PortMap,
  };

  use super::*;

  fn noop_execute() -> ExecuteFn {
    Arc::new(|_, _| Box::pin(async { Ok(JsonObject::new()) }))
  }

  fn definition(id: &str) -> ComponentDefinition {
    ComponentDefinition {
      id: id.into(),
      label: id.into(),
      category: ComponentCategory::Recon,
      version: "1.0.0".into(),
      description: String::new(),
      inputs: PortMap::new(),
      parameters: PortMap::new(),
      outputs: PortMap::new(),
      runner: RunnerConfig::Inline,
      retry: RetryPolicy::default(),
      execute: noop_execute(),
    }
  }

  #[test]
  fn duplicate_ids_are_rejected() {
    let e = ComponentRegistry::new(vec![
      definition("studio.test.a"),
      definition("studio.test.a"),
    ])
    .unwrap_err();
    assert!(e.to_string().contains("duplicate component id"));
  }

  #[test]
  fn lookup_miss_is_a_configuration_error() {
    let registry =
      ComponentRegistry::new(vec![definition("studio.test.a")])
        .unwrap();
    assert!(registry.get("studio.test.a").is_ok());
    let e = registry.get("studio.test.b").unwrap_err();
    assert_eq!(e.kind, ErrorKind::Configuration);
  }

  #[test]
  fn non_reverse_dns_id_fails_registration() {
    let e = ComponentRegistry::new(vec![definition("plain")])
      .unwrap_err();
    assert!(e.to_string().contains("failed registration"));
  }
}

//! # Credential contract catalog
//!
//! Named, reusable schemas for cross-component payloads. A component
//! declaring an input of `contract { name }` receives a structurally
//! validated value; the wiring layer resolves connections by contract
//! identity, so the name is the only public surface.

use std::sync::OnceLock;

use indexmap::IndexMap;

use super::{PortMap, Schema};

pub const AWS_CREDENTIAL: &str = "core.credential.aws";
pub const SUPABASE_CREDENTIAL: &str = "core.credential.supabase";

pub struct ContractSchema {
  pub name: &'static str,
  pub fields: PortMap,
}

fn catalog() -> &'static IndexMap<&'static str, ContractSchema> {
  static CATALOG: OnceLock<
    IndexMap<&'static str, ContractSchema>,
  > = OnceLock::new();
  CATALOG.get_or_init(|| {
    [
      ContractSchema {
        name: AWS_CREDENTIAL,
        fields: PortMap::new()
          .port(
            "accessKeyId",
            Schema::text().label("Access Key ID").required(),
          )
          .port(
            "secretAccessKey",
            Schema::text()
              .label("Secret Access Key")
              .editor("password")
              .required(),
          )
          .port(
            "sessionToken",
            Schema::text()
              .label("Session Token")
              .editor("password"),
          ),
      },
      ContractSchema {
        name: SUPABASE_CREDENTIAL,
        fields: PortMap::new()
          .port(
            "projectUrl",
            Schema::text().label("Project URL").required(),
          )
          .port(
            "serviceRoleKey",
            Schema::text()
              .label("Service Role Key")
              .editor("password")
              .required(),
          ),
      },
    ]
    .into_iter()
    .map(|contract| (contract.name, contract))
    .collect()
  })
}

pub fn get(name: &str) -> Option<&'static ContractSchema> {
  catalog().get(name)
}

pub fn list() -> impl Iterator<Item = &'static ContractSchema> {
  catalog().values()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn catalog_exposes_one_canonical_aws_contract() {
    assert_eq!(
      list().filter(|c| c.name == AWS_CREDENTIAL).count(),
      1
    );
    let aws = get(AWS_CREDENTIAL).unwrap();
    assert!(aws.fields.0.contains_key("accessKeyId"));
    assert!(aws.fields.0.contains_key("secretAccessKey"));
    assert!(!aws.fields.0["sessionToken"].required);
  }

  #[test]
  fn unknown_names_resolve_to_none() {
    assert!(get("core.credential.azure").is_none());
  }
}

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use typeshare::typeshare;

use crate::{
  JsonObject,
  errors::{ExecuteError, ExecuteResult},
};

pub mod contracts;

pub type FieldErrors = IndexMap<String, Vec<String>>;

/// Primitive port kinds.
#[typeshare]
#[derive(
  Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq,
)]
#[serde(rename_all = "lowercase")]
pub enum Primitive {
  Text,
  Number,
  Boolean,
  Json,
}

/// The closed set of port connection kinds.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SchemaKind {
  Primitive { name: Primitive },
  List { element: Box<Schema> },
  /// String-valued at rest. Callers pass secret ids through
  /// [secret resolution][crate::context::ExecutionContext::secret].
  Secret,
  /// A named capability, eg `core.credential.aws`. The value must
  /// structurally match the contract's own schema.
  Contract { name: String },
}

/// A declarative port / parameter schema node.
///
/// Schemas are declared once per component and reused for input
/// validation, output contract enforcement, and UI hints (the
/// `editor` field is opaque to the engine).
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Schema {
  #[serde(flatten)]
  pub kind: SchemaKind,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub label: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(
    default,
    rename = "default",
    skip_serializing_if = "Option::is_none"
  )]
  pub default_value: Option<Value>,
  #[serde(default)]
  pub required: bool,
  /// Bypass kind checking (still honors `required`).
  #[serde(default)]
  pub allow_any: bool,
  /// Editor hint for UIs only.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub editor: Option<String>,
}

impl Schema {
  fn of(kind: SchemaKind) -> Schema {
    Schema {
      kind,
      label: None,
      description: None,
      default_value: None,
      required: false,
      allow_any: false,
      editor: None,
    }
  }

  pub fn text() -> Schema {
    Schema::of(SchemaKind::Primitive {
      name: Primitive::Text,
    })
  }

  pub fn number() -> Schema {
    Schema::of(SchemaKind::Primitive {
      name: Primitive::Number,
    })
  }

  pub fn boolean() -> Schema {
    Schema::of(SchemaKind::Primitive {
      name: Primitive::Boolean,
    })
  }

  pub fn json() -> Schema {
    Schema::of(SchemaKind::Primitive {
      name: Primitive::Json,
    })
  }

  pub fn list(element: Schema) -> Schema {
    Schema::of(SchemaKind::List {
      element: Box::new(element),
    })
  }

  pub fn secret() -> Schema {
    Schema::of(SchemaKind::Secret)
  }

  pub fn contract(name: impl Into<String>) -> Schema {
    Schema::of(SchemaKind::Contract { name: name.into() })
  }

  pub fn label(mut self, label: impl Into<String>) -> Schema {
    self.label = Some(label.into());
    self
  }

  pub fn description(
    mut self,
    description: impl Into<String>,
  ) -> Schema {
    self.description = Some(description.into());
    self
  }

  pub fn required(mut self) -> Schema {
    self.required = true;
    self
  }

  pub fn allow_any(mut self) -> Schema {
    self.allow_any = true;
    self
  }

  pub fn with_default(mut self, default: impl Into<Value>) -> Schema {
    self.default_value = Some(default.into());
    self
  }

  pub fn editor(mut self, editor: impl Into<String>) -> Schema {
    self.editor = Some(editor.into());
    self
  }

  /// Parse and coerce a raw value against this schema.
  /// `Ok(None)` means the value is absent and that is acceptable.
  pub fn parse(
    &self,
    raw: Option<&Value>,
  ) -> ExecuteResult<Option<Value>> {
    let mut errors = FieldErrors::new();
    let value = self.parse_at("value", raw, &mut errors);
    if errors.is_empty() {
      Ok(value)
    } else {
      Err(
        ExecuteError::validation("value failed schema validation")
          .with_field_errors(errors),
      )
    }
  }

  /// The schema's default, if declared.
  pub fn default(&self) -> Option<Value> {
    self.default_value.clone()
  }

  /// Metadata projection for UIs.
  pub fn describe(&self) -> Value {
    serde_json::to_value(self).unwrap_or(Value::Null)
  }

  /// Registration-time sanity: defaults must parse against the
  /// schema itself, contract names must resolve in the catalog.
  pub fn self_check(&self) -> anyhow::Result<()> {
    match &self.kind {
      SchemaKind::Contract { name } => {
        if contracts::get(name).is_none() {
          anyhow::bail!("unknown credential contract '{name}'");
        }
      }
      SchemaKind::List { element } => element.self_check()?,
      _ => {}
    }
    if let Some(default) = &self.default_value {
      let mut errors = FieldErrors::new();
      // Guard against the declared default re-resolving to itself.
      let mut stripped = self.clone();
      stripped.default_value = None;
      stripped.parse_at("default", Some(default), &mut errors);
      if !errors.is_empty() {
        anyhow::bail!(
          "declared default does not parse: {errors:?}"
        );
      }
    }
    Ok(())
  }

  fn parse_at(
    &self,
    path: &str,
    raw: Option<&Value>,
    errors: &mut FieldErrors,
  ) -> Option<Value> {
    // Normalize absence: missing, null, and whitespace-only text
    // all resolve to the default / required handling below.
    let raw = match raw {
      None | Some(Value::Null) => None,
      Some(Value::String(s)) if s.trim().is_empty() => None,
      Some(v) => Some(v),
    };
    let Some(raw) = raw else {
      if let Some(default) = &self.default_value {
        return Some(default.clone());
      }
      if self.required {
        push_error(errors, path, "required value is missing");
      }
      return None;
    };
    if self.allow_any {
      return Some(raw.clone());
    }
    match &self.kind {
      SchemaKind::Primitive { name } => {
        parse_primitive(*name, path, raw, errors)
      }
      SchemaKind::List { element } => {
        self.parse_list(element, path, raw, errors)
      }
      SchemaKind::Secret => match raw {
        Value::String(s) => Some(Value::String(s.trim().into())),
        _ => {
          push_error(errors, path, "expected a secret reference");
          None
        }
      },
      SchemaKind::Contract { name } => {
        parse_contract(name, path, raw, errors)
      }
    }
  }

  fn parse_list(
    &self,
    element: &Schema,
    path: &str,
    raw: &Value,
    errors: &mut FieldErrors,
  ) -> Option<Value> {
    let items: Vec<Value> = match raw {
      Value::Array(items) => items.clone(),
      // A single bare value connects as a one-element list. A
      // newline / comma separated string connects as a text list.
      Value::String(s) if element.is_text() => s
        .split(['\n', ','])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| Value::String(part.to_string()))
        .collect(),
      other => vec![other.clone()],
    };
    let before = errors.len();
    let parsed = items
      .iter()
      .enumerate()
      .filter_map(|(i, item)| {
        element.parse_at(
          &format!("{path}.{i}"),
          Some(item),
          errors,
        )
      })
      .collect::<Vec<_>>();
    (errors.len() == before).then_some(Value::Array(parsed))
  }

  fn is_text(&self) -> bool {
    matches!(
      self.kind,
      SchemaKind::Primitive {
        name: Primitive::Text
      }
    )
  }
}

fn parse_primitive(
  name: Primitive,
  path: &str,
  raw: &Value,
  errors: &mut FieldErrors,
) -> Option<Value> {
  match (name, raw) {
    (Primitive::Json, value) => Some(value.clone()),
    (Primitive::Text, Value::String(s)) => {
      Some(Value::String(s.trim().to_string()))
    }
    (Primitive::Text, Value::Number(n)) => {
      Some(Value::String(n.to_string()))
    }
    (Primitive::Text, Value::Bool(b)) => {
      Some(Value::String(b.to_string()))
    }
    (Primitive::Number, Value::Number(_)) => Some(raw.clone()),
    (Primitive::Number, Value::String(s)) => {
      match s.trim().parse::<f64>() {
        Ok(n) => serde_json::Number::from_f64(n).map(Value::Number),
        Err(_) => {
          push_error(errors, path, "expected a number");
          None
        }
      }
    }
    (Primitive::Boolean, Value::Bool(_)) => Some(raw.clone()),
    (Primitive::Boolean, Value::String(s)) => {
      match s.trim().to_lowercase().as_str() {
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        _ => {
          push_error(errors, path, "expected a boolean");
          None
        }
      }
    }
    (Primitive::Text, _) => {
      push_error(errors, path, "expected text");
      None
    }
    (Primitive::Number, _) => {
      push_error(errors, path, "expected a number");
      None
    }
    (Primitive::Boolean, _) => {
      push_error(errors, path, "expected a boolean");
      None
    }
  }
}

fn parse_contract(
  name: &str,
  path: &str,
  raw: &Value,
  errors: &mut FieldErrors,
) -> Option<Value> {
  let Some(contract) = contracts::get(name) else {
    push_error(
      errors,
      path,
      format!("unknown credential contract '{name}'"),
    );
    return None;
  };
  let Some(object) = raw.as_object() else {
    push_error(
      errors,
      path,
      format!("expected an object matching contract '{name}'"),
    );
    return None;
  };
  let before = errors.len();
  let parsed =
    contract.fields.parse_into(Some(path), object, errors);
  (errors.len() == before)
    .then_some(Value::Object(parsed))
}

fn push_error(
  errors: &mut FieldErrors,
  path: &str,
  message: impl Into<String>,
) {
  errors
    .entry(path.to_string())
    .or_default()
    .push(message.into());
}

/// An ordered set of named ports: a component's inputs,
/// parameters, or outputs.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PortMap(pub IndexMap<String, Schema>);

impl PortMap {
  pub fn new() -> PortMap {
    PortMap::default()
  }

  pub fn port(
    mut self,
    name: impl Into<String>,
    schema: Schema,
  ) -> PortMap {
    self.0.insert(name.into(), schema);
    self
  }

  /// Parse and coerce a raw object against every declared port,
  /// collecting all failures into one Validation error.
  /// Keys not declared as ports are dropped.
  pub fn parse_object(
    &self,
    raw: &JsonObject,
  ) -> ExecuteResult<JsonObject> {
    let mut errors = FieldErrors::new();
    let parsed = self.parse_into(None, raw, &mut errors);
    if errors.is_empty() {
      Ok(parsed)
    } else {
      Err(
        ExecuteError::validation("failed schema validation")
          .with_field_errors(errors),
      )
    }
  }

  pub(crate) fn parse_into(
    &self,
    prefix: Option<&str>,
    raw: &JsonObject,
    errors: &mut FieldErrors,
  ) -> JsonObject {
    let mut out = JsonObject::new();
    for (name, schema) in &self.0 {
      let path = match prefix {
        Some(prefix) => format!("{prefix}.{name}"),
        None => name.clone(),
      };
      if let Some(value) =
        schema.parse_at(&path, raw.get(name), errors)
      {
        out.insert(name.clone(), value);
      }
    }
    out
  }

  pub fn describe(&self) -> Value {
    Value::Object(
      self
        .0
        .iter()
        .map(|(name, schema)| (name.clone(), schema.describe()))
        .collect(),
    )
  }

  pub fn self_check(&self) -> anyhow::Result<()> {
    for (name, schema) in &self.0 {
      schema
        .self_check()
        .map_err(|e| e.context(format!("port '{name}'")))?;
    }
    Ok(())
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn obj(value: Value) -> JsonObject {
    value.as_object().unwrap().clone()
  }

  #[test]
  fn text_is_trimmed_and_empty_normalizes_to_absent() {
    let schema = Schema::text();
    assert_eq!(
      schema.parse(Some(&json!("  example.com  "))).unwrap(),
      Some(json!("example.com"))
    );
    assert_eq!(schema.parse(Some(&json!("   "))).unwrap(), None);
  }

  #[test]
  fn required_missing_reports_field_error() {
    let e = Schema::text()
      .required()
      .parse(None)
      .unwrap_err();
    assert_eq!(
      e.field_errors["value"],
      vec!["required value is missing"]
    );
  }

  #[test]
  fn number_coerces_numeric_strings() {
    let schema = Schema::number();
    assert_eq!(
      schema.parse(Some(&json!("42"))).unwrap(),
      Some(json!(42.0))
    );
    assert!(schema.parse(Some(&json!("forty-two"))).is_err());
  }

  #[test]
  fn boolean_coerces_true_false_strings() {
    let schema = Schema::boolean();
    assert_eq!(
      schema.parse(Some(&json!("TRUE"))).unwrap(),
      Some(json!(true))
    );
    assert_eq!(
      schema.parse(Some(&json!(false))).unwrap(),
      Some(json!(false))
    );
  }

  #[test]
  fn text_list_accepts_single_string_and_csv() {
    let schema = Schema::list(Schema::text());
    assert_eq!(
      schema.parse(Some(&json!("example.com"))).unwrap(),
      Some(json!(["example.com"]))
    );
    assert_eq!(
      schema
        .parse(Some(&json!("us-east-1, us-west-2")))
        .unwrap(),
      Some(json!(["us-east-1", "us-west-2"]))
    );
    assert_eq!(
      schema
        .parse(Some(&json!("a.com\nb.com\n")))
        .unwrap(),
      Some(json!(["a.com", "b.com"]))
    );
  }

  #[test]
  fn list_element_failures_carry_indexed_paths() {
    let schema = Schema::list(Schema::number());
    let e = schema
      .parse(Some(&json!([1, "two", 3])))
      .unwrap_err();
    assert_eq!(e.field_errors["value.1"], vec!["expected a number"]);
  }

  #[test]
  fn defaults_apply_when_absent() {
    let schema = Schema::number().with_default(3);
    assert_eq!(schema.parse(None).unwrap(), Some(json!(3)));
  }

  #[test]
  fn allow_any_bypasses_kind_but_not_required() {
    let schema = Schema::number().allow_any().required();
    assert_eq!(
      schema.parse(Some(&json!("anything"))).unwrap(),
      Some(json!("anything"))
    );
    assert!(schema.parse(None).is_err());
  }

  #[test]
  fn aws_contract_validates_structurally() {
    let schema =
      Schema::contract(contracts::AWS_CREDENTIAL).required();
    let value = json!({
      "accessKeyId": "AKIAEXAMPLE",
      "secretAccessKey": "secret",
    });
    let parsed = schema.parse(Some(&value)).unwrap().unwrap();
    assert_eq!(parsed["accessKeyId"], json!("AKIAEXAMPLE"));

    let e = schema
      .parse(Some(&json!({ "accessKeyId": "AKIAEXAMPLE" })))
      .unwrap_err();
    assert_eq!(
      e.field_errors["value.secretAccessKey"],
      vec!["required value is missing"]
    );
  }

  #[test]
  fn unknown_contract_fails_self_check() {
    assert!(
      Schema::contract("core.credential.nope")
        .self_check()
        .is_err()
    );
    assert!(
      Schema::contract(contracts::AWS_CREDENTIAL)
        .self_check()
        .is_ok()
    );
  }

  #[test]
  fn port_map_collects_all_failures() {
    let ports = PortMap::new()
      .port("domains", Schema::list(Schema::text()).required())
      .port("depth", Schema::number());
    let raw = obj(json!({ "depth": "deep" }));
    let e = ports.parse_object(&raw).unwrap_err();
    assert_eq!(e.field_errors.len(), 2);
    assert_eq!(
      e.field_errors["domains"],
      vec!["required value is missing"]
    );
    assert_eq!(e.field_errors["depth"], vec!["expected a number"]);
  }

  #[test]
  fn port_map_drops_undeclared_keys() {
    let ports =
      PortMap::new().port("targets", Schema::list(Schema::text()));
    let raw = obj(json!({
      "targets": ["a.com"],
      "unexpected": true,
    }));
    let parsed = ports.parse_object(&raw).unwrap();
    assert!(!parsed.contains_key("unexpected"));
  }

  #[test]
  fn describe_round_trips_through_serde() {
    let schema = Schema::list(Schema::text())
      .label("Domains")
      .required();
    let described = schema.describe();
    assert_eq!(described["kind"], json!("list"));
    assert_eq!(described["required"], json!(true));
    let back: Schema =
      serde_json::from_value(described).unwrap();
    assert_eq!(back, schema);
  }
}

use serde::Serialize;
use serde_json::Value;
use studio_types::{
  JsonObject,
  context::ExecutionContext,
  errors::{ExecuteError, ExecuteResult},
};

/// Value extraction over resolved (schema-validated) payloads.
/// Absent keys mean the port was optional and unwired.
pub fn get_str<'a>(
  object: &'a JsonObject,
  key: &str,
) -> Option<&'a str> {
  object.get(key).and_then(Value::as_str)
}

pub fn get_bool(object: &JsonObject, key: &str) -> Option<bool> {
  object.get(key).and_then(Value::as_bool)
}

pub fn get_u64(object: &JsonObject, key: &str) -> Option<u64> {
  object.get(key).and_then(Value::as_f64).map(|n| n as u64)
}

pub fn string_list(object: &JsonObject, key: &str) -> Vec<String> {
  object
    .get(key)
    .and_then(Value::as_array)
    .map(|items| {
      items
        .iter()
        .filter_map(Value::as_str)
        .map(String::from)
        .collect()
    })
    .unwrap_or_default()
}

/// Tool-specific container timeout from the environment.
/// Invalid or absent values fall back to the component default.
pub fn env_timeout_seconds(var: &str, default: u64) -> u64 {
  std::env::var(var)
    .ok()
    .and_then(|raw| raw.trim().parse::<u64>().ok())
    .filter(|seconds| *seconds > 0)
    .unwrap_or(default)
}

/// Serialize a component output struct into the engine's output
/// object shape.
pub fn to_output<T: Serialize>(
  output: &T,
) -> ExecuteResult<JsonObject> {
  match serde_json::to_value(output) {
    Ok(Value::Object(object)) => Ok(object),
    Ok(_) => Err(ExecuteError::unknown(
      "component output is not an object",
    )),
    Err(e) => Err(
      ExecuteError::unknown("failed to serialize component output")
        .with_cause(anyhow::Error::from(e)),
    ),
  }
}

/// Line-oriented NDJSON parse. Returns the parsed records and
/// how many non-empty lines failed to parse.
pub fn parse_ndjson(stdout: &str) -> (Vec<Value>, usize) {
  let mut records = Vec::new();
  let mut skipped = 0;
  for line in stdout.lines() {
    let line = line.trim();
    if line.is_empty() {
      continue;
    }
    match serde_json::from_str::<Value>(line) {
      Ok(record) => records.push(record),
      Err(_) => skipped += 1,
    }
  }
  (records, skipped)
}

/// Inline body for docker-wired components; dispatch never
/// reaches it unless the wiring is broken.
pub async fn not_inline(
  _: ExecutionContext,
) -> ExecuteResult<JsonObject> {
  Err(ExecuteError::configuration(
    "component has no inline body",
  ))
}

/// A normalized security observation, shared by the scanner
/// components.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
  pub id: String,
  pub title: String,
  pub severity: String,
  pub status: String,
  pub resource_id: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub region: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub remediation: Option<String>,
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn ndjson_skips_non_json_noise_lines() {
    let stdout = "\n{\"url\":\"https://a\"}\nprogress 50%\n{\"url\":\"https://b\"}";
    let (records, skipped) = parse_ndjson(stdout);
    assert_eq!(records.len(), 2);
    assert_eq!(skipped, 1);
    assert_eq!(records[1]["url"], json!("https://b"));
  }

  #[test]
  fn env_timeout_rejects_garbage_and_zero() {
    // Unset vars fall through to the default.
    assert_eq!(
      env_timeout_seconds("STUDIO_TEST_UNSET_TIMEOUT", 300),
      300
    );
    unsafe {
      std::env::set_var("STUDIO_TEST_BAD_TIMEOUT", "soon");
    }
    assert_eq!(
      env_timeout_seconds("STUDIO_TEST_BAD_TIMEOUT", 120),
      120
    );
    unsafe {
      std::env::set_var("STUDIO_TEST_ZERO_TIMEOUT", "0");
    }
    assert_eq!(
      env_timeout_seconds("STUDIO_TEST_ZERO_TIMEOUT", 120),
      120
    );
    unsafe {
      std::env::set_var("STUDIO_TEST_GOOD_TIMEOUT", "45");
    }
    assert_eq!(
      env_timeout_seconds("STUDIO_TEST_GOOD_TIMEOUT", 120),
      45
    );
  }
}

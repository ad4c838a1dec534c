use std::{
  collections::HashSet,
  sync::{Arc, OnceLock},
  time::Duration,
};

use engine::dispatch::{
  ResolvedRunner, run_component_with_runner,
};
use serde::Serialize;
use serde_json::Value;
use studio_types::{
  JsonObject,
  component::{
    ComponentCategory, ComponentDefinition, ResolvedNode,
    RetryPolicy, RunnerConfig,
  },
  context::ExecutionContext,
  errors::{ExecuteError, ExecuteResult},
  schema::{PortMap, Schema},
};

use crate::common;

const DEFAULT_BASE_URL: &str = "https://api.atlassian.com";

fn http_client() -> &'static reqwest::Client {
  static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
  CLIENT.get_or_init(|| {
    reqwest::Client::builder()
      .timeout(Duration::from_secs(30))
      .build()
      .expect("failed to build atlassian http client")
  })
}

pub fn definition() -> ComponentDefinition {
  ComponentDefinition {
    id: "studio.identity.atlassian-offboarding".into(),
    label: "Atlassian Offboarding".into(),
    category: ComponentCategory::Identity,
    version: "1.2.0".into(),
    description:
      "Remove a list of users from an Atlassian organization directory."
        .into(),
    inputs: PortMap::new()
      .port(
        "orgId",
        Schema::text().label("Organization ID").required(),
      )
      .port(
        "emailUsernames",
        Schema::list(Schema::text())
          .label("Emails / Usernames")
          .required(),
      )
      .port(
        "accessToken",
        Schema::secret().label("Admin API Token").required(),
      ),
    parameters: PortMap::new().port(
      "baseUrl",
      Schema::text()
        .label("API Base URL")
        .with_default(DEFAULT_BASE_URL),
    ),
    outputs: PortMap::new()
      .port("results", Schema::list(Schema::json()).required())
      .port("summary", Schema::json().required()),
    runner: RunnerConfig::Inline,
    retry: RetryPolicy::default(),
    execute: Arc::new(|node, ctx| Box::pin(execute(node, ctx))),
  }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OffboardingSummary {
  requested: usize,
  found: usize,
  deleted: usize,
  failed: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OffboardingOutput {
  results: Vec<Value>,
  summary: OffboardingSummary,
}

async fn execute(
  node: ResolvedNode,
  ctx: ExecutionContext,
) -> ExecuteResult<JsonObject> {
  run_component_with_runner(
    ResolvedRunner::Inline,
    |ctx| offboard(node, ctx),
    &ctx,
  )
  .await?
  .value()
}

async fn offboard(
  node: ResolvedNode,
  ctx: ExecutionContext,
) -> ExecuteResult<JsonObject> {
  let org_id = common::get_str(&node.inputs, "orgId")
    .unwrap_or_default()
    .to_string();
  let base_url = common::get_str(&node.params, "baseUrl")
    .unwrap_or(DEFAULT_BASE_URL)
    .trim_end_matches('/')
    .to_string();
  let token_id = common::get_str(&node.inputs, "accessToken")
    .ok_or_else(|| {
      ExecuteError::configuration("access token not wired")
    })?;
  let token = ctx.secret(token_id).await?.value;
  let targets = normalize_targets(&common::string_list(
    &node.inputs,
    "emailUsernames",
  ));
  ctx.info(format!(
    "offboarding {} users from org {org_id}",
    targets.len()
  ));

  let mut results = Vec::new();
  let mut summary = OffboardingSummary {
    requested: targets.len(),
    found: 0,
    deleted: 0,
    failed: 0,
  };
  // One user can be listed under several aliases; delete each
  // resolved account exactly once.
  let mut deleted_accounts: HashSet<String> = HashSet::new();

  for target in &targets {
    if ctx.is_cancelled() {
      return Err(
        ExecuteError::container("invocation cancelled")
          .non_retryable(),
      );
    }
    let account_id =
      match search_user(&base_url, &org_id, &token, target).await
      {
        Ok(account_id) => account_id,
        Err(e) => {
          ctx.warn(format!("search failed for '{target}': {e}"));
          summary.failed += 1;
          results.push(serde_json::json!({
            "target": target,
            "status": "search-failed",
          }));
          continue;
        }
      };
    let Some(account_id) = account_id else {
      ctx.warn(format!("no directory match for '{target}'"));
      results.push(serde_json::json!({
        "target": target,
        "status": "not-found",
      }));
      continue;
    };
    summary.found += 1;
    if !deleted_accounts.insert(account_id.clone()) {
      ctx.info(format!(
        "'{target}' resolved to an already removed account, skipping"
      ));
      results.push(serde_json::json!({
        "target": target,
        "accountId": account_id,
        "status": "duplicate",
      }));
      continue;
    }
    match delete_user(&base_url, &org_id, &token, &account_id)
      .await
    {
      Ok(()) => {
        summary.deleted += 1;
        ctx.info(format!("removed '{target}'"));
        results.push(serde_json::json!({
          "target": target,
          "accountId": account_id,
          "status": "deleted",
        }));
      }
      Err(e) => {
        summary.failed += 1;
        ctx.error(format!("delete failed for '{target}': {e}"));
        results.push(serde_json::json!({
          "target": target,
          "accountId": account_id,
          "status": "delete-failed",
        }));
      }
    }
  }

  common::to_output(&OffboardingOutput { results, summary })
}

/// Lowercase, strip the mail domain, drop empties, and dedupe
/// while keeping first-seen order.
fn normalize_targets(raw: &[String]) -> Vec<String> {
  let mut seen = HashSet::new();
  let mut targets = Vec::new();
  for entry in raw {
    let username = entry
      .trim()
      .to_lowercase()
      .split('@')
      .next()
      .unwrap_or_default()
      .to_string();
    if username.is_empty() || !seen.insert(username.clone()) {
      continue;
    }
    targets.push(username);
  }
  targets
}

async fn search_user(
  base_url: &str,
  org_id: &str,
  token: &str,
  target: &str,
) -> ExecuteResult<Option<String>> {
  let url = format!("{base_url}/admin/v1/orgs/{org_id}/users");
  let response = http_client()
    .get(&url)
    .query(&[("query", target)])
    .bearer_auth(token)
    .send()
    .await
    .map_err(|e| {
      ExecuteError::service("atlassian user search failed")
        .with_cause(anyhow::Error::from(e))
    })?;
  let status = response.status();
  if !status.is_success() {
    return Err(
      ExecuteError::service(format!(
        "atlassian user search returned {status}"
      ))
      .with_detail("status", status.as_u16()),
    );
  }
  let body: Value = response.json().await.map_err(|e| {
    ExecuteError::service(
      "atlassian user search returned malformed json",
    )
    .with_cause(anyhow::Error::from(e))
  })?;
  Ok(match_account(&body, target))
}

/// Pick the account whose email local-part matches the target
/// exactly; a bare substring hit from the search API is not
/// enough to delete an account.
fn match_account(body: &Value, target: &str) -> Option<String> {
  body["data"].as_array()?.iter().find_map(|user| {
    let email = user["email"].as_str()?.to_lowercase();
    let local_part = email.split('@').next()?;
    (local_part == target || email == target)
      .then(|| user["account_id"].as_str().map(String::from))?
  })
}

async fn delete_user(
  base_url: &str,
  org_id: &str,
  token: &str,
  account_id: &str,
) -> ExecuteResult<()> {
  let url = format!(
    "{base_url}/admin/v1/orgs/{org_id}/directory/users/{account_id}"
  );
  let response = http_client()
    .delete(&url)
    .bearer_auth(token)
    .send()
    .await
    .map_err(|e| {
      ExecuteError::service("atlassian user delete failed")
        .with_cause(anyhow::Error::from(e))
    })?;
  let status = response.status();
  if !status.is_success() {
    return Err(
      ExecuteError::service(format!(
        "atlassian user delete returned {status}"
      ))
      .with_detail("status", status.as_u16()),
    );
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn normalization_strips_domains_and_dedupes() {
    let raw = vec![
      String::from("alice"),
      String::from("alice@example.com"),
      String::from("Bob"),
      String::from("  "),
    ];
    assert_eq!(normalize_targets(&raw), ["alice", "bob"]);
  }

  #[test]
  fn matching_requires_an_exact_local_part() {
    let body = json!({
      "data": [
        { "account_id": "a-1", "email": "alice-admin@example.com" },
        { "account_id": "a-2", "email": "alice@example.com" },
      ]
    });
    assert_eq!(
      match_account(&body, "alice").as_deref(),
      Some("a-2")
    );
    assert_eq!(match_account(&body, "carol"), None);
  }

  #[test]
  fn users_without_emails_never_match() {
    let body = json!({ "data": [{ "account_id": "a-1" }] });
    assert_eq!(match_account(&body, "alice"), None);
  }

  #[test]
  fn definition_passes_self_check() {
    definition().self_check().unwrap();
  }
}

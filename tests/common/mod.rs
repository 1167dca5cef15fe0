//! Common test utilities for E2E tests
//!
//! Builds a full `AppContext` against a temporary directory and a wiremock
//! server standing in for the upstream APIs.

#![allow(dead_code)]

use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::{MockServer, Request, Respond, ResponseTemplate};

use blockhaus::config::{
    ApiConfig, AppConfig, CacheConfig, LoggingConfig, PathsConfig, RunConfig, ThrottleConfig,
};
use blockhaus::data::{TargetFormat, TargetList};
use blockhaus::service::RunOptions;
use blockhaus::AppContext;

/// Test instance: mocked upstream + real store/cache in a temp dir
pub struct TestHarness {
    pub server: MockServer,
    pub context: AppContext,
    pub _temp_dir: TempDir,
}

impl TestHarness {
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let server = MockServer::start().await;

        let cookies_path = temp_dir.path().join("cookies.json");
        std::fs::write(
            &cookies_path,
            r#"[
                {"name": "ct0", "value": "test-csrf", "domain": ".x.com"},
                {"name": "auth_token", "value": "test-auth", "domain": ".x.com"}
            ]"#,
        )
        .unwrap();

        let config = AppConfig {
            paths: PathsConfig {
                cookies: cookies_path,
                targets: temp_dir.path().join("targets.json"),
                database: temp_dir.path().join("history.db"),
                cache_dir: temp_dir.path().join("cache"),
            },
            run: RunConfig {
                batch_size: 50,
                delay_secs: 0.0,
                retry_ceiling: 3,
                auto_retry_ceiling: 10,
                test_mode_limit: 5,
            },
            api: ApiConfig {
                base_url: server.uri(),
                enable_header_enhancement: true,
                enable_forwarded_for: false,
                timeout_secs: 5,
            },
            cache: CacheConfig {
                lookup_ttl_secs: 86_400,
                profile_ttl_secs: 3_600,
                relationship_ttl_secs: 1_800,
                profile_max_entries: 1_000,
                relationship_max_entries: 500,
            },
            throttle: ThrottleConfig {
                consecutive_403s: 5,
                window_secs: 300,
                cooldown_secs: 1_800,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        let context = AppContext::new(config, CancellationToken::new())
            .await
            .unwrap();

        Self {
            server,
            context,
            _temp_dir: temp_dir,
        }
    }

    /// Fast-paced run options for tests.
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            batch_size: 50,
            delay: Duration::ZERO,
            max_targets: None,
            auto_retry: false,
            retry_ceiling: 3,
            auto_retry_ceiling: 10,
        }
    }
}

pub fn screen_name_list(users: &[&str]) -> TargetList {
    TargetList {
        format: TargetFormat::ScreenName,
        users: users.iter().map(|u| u.to_string()).collect(),
    }
}

pub fn id_list(users: &[String]) -> TargetList {
    TargetList {
        format: TargetFormat::UserId,
        users: users.to_vec(),
    }
}

/// Single-user GraphQL body for an active account.
pub fn active_user_body(
    id: &str,
    screen_name: &str,
    following: bool,
    followed_by: bool,
    blocking: bool,
) -> Value {
    json!({
        "data": {"user": {"result": {
            "__typename": "User",
            "rest_id": id,
            "legacy": {
                "id_str": id,
                "screen_name": screen_name,
                "name": format!("{} display", screen_name),
                "following": following,
                "followed_by": followed_by,
                "blocking": blocking,
                "blocked_by": false,
                "protected": false,
                "verified": false
            }
        }}}
    })
}

/// Single-user GraphQL body for an unavailable account.
pub fn unavailable_user_body(reason: &str) -> Value {
    json!({
        "data": {"user": {"result": {
            "__typename": "UserUnavailable",
            "reason": reason
        }}}
    })
}

/// Body returned by a successful block call.
pub fn block_success_body(id: &str) -> Value {
    json!({"id_str": id, "screen_name": format!("user{id}")})
}

/// Responder for the batch user endpoint: echoes an active user for every
/// id in the request's `variables.userIds`. Ids listed in `omit_ids` are
/// dropped from the response entirely, the way the upstream omits
/// unresolvable accounts instead of sending placeholders.
#[derive(Default)]
pub struct BatchUsersResponder {
    omit_ids: Vec<String>,
}

impl BatchUsersResponder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn omitting(ids: &[&str]) -> Self {
        Self {
            omit_ids: ids.iter().map(|id| id.to_string()).collect(),
        }
    }
}

impl Respond for BatchUsersResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let variables = request
            .url
            .query_pairs()
            .find(|(key, _)| key == "variables")
            .map(|(_, value)| value.to_string())
            .unwrap_or_default();

        let ids: Vec<String> = serde_json::from_str::<Value>(&variables)
            .ok()
            .and_then(|v| {
                v.get("userIds").and_then(Value::as_array).map(|ids| {
                    ids.iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
            })
            .unwrap_or_default();

        let users: Vec<Value> = ids
            .iter()
            .filter(|id| !self.omit_ids.contains(id))
            .map(|id| {
                json!({"result": {
                    "__typename": "User",
                    "rest_id": id,
                    "legacy": {
                        "id_str": id,
                        "screen_name": format!("user{id}"),
                        "name": format!("User {id}"),
                        "following": false,
                        "followed_by": false,
                        "blocking": false,
                        "blocked_by": false,
                        "protected": false,
                        "verified": false
                    }
                }})
            })
            .collect();

        ResponseTemplate::new(200).set_body_json(json!({"data": {"users": users}}))
    }
}

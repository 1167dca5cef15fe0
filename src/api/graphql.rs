//! GraphQL wire details: endpoints, feature flags, response parsing
//!
//! The feature-flag table is a compatibility detail of the upstream web
//! client and drifts over time. It lives here as the single edit point;
//! `missing_feature` recognizes the upstream's rejection shape so a drift
//! fails fast with the flag name in the log.

use serde_json::{json, Value};
use std::collections::HashMap;

use crate::data::{FailureInfo, Relationship, ResolveOutcome, UserProfile, UserState};

// Endpoint paths, relative to the configured base URL. The hash segment is
// the upstream's persisted-query id and changes with their deploys.
pub const USER_BY_SCREEN_NAME_PATH: &str =
    "/i/api/graphql/7mjxD3-C6BxitPMVQ6w0-Q/UserByScreenName";
pub const USER_BY_REST_ID_PATH: &str = "/i/api/graphql/I5nvpI91ljifos1Y3Lltyg/UserByRestId";
pub const USERS_BY_REST_IDS_PATH: &str = "/i/api/graphql/GD4q8bBE2i6cqWw2iT74Gg/UsersByRestIds";
pub const BLOCKS_CREATE_PATH: &str = "/i/api/1.1/blocks/create.json";
pub const VERIFY_CREDENTIALS_PATH: &str = "/i/api/1.1/account/verify_credentials.json";

/// Maximum ids per `UsersByRestIds` call.
pub const BATCH_LIMIT: usize = 50;

/// Feature flags sent with every GraphQL call. Single edit point.
const FEATURE_FLAGS: &[(&str, bool)] = &[
    ("hidden_profile_likes_enabled", true),
    ("responsive_web_graphql_exclude_directive_enabled", true),
    ("verified_phone_label_enabled", false),
    (
        "subscriptions_verification_info_is_identity_verified_enabled",
        true,
    ),
    ("subscriptions_verification_info_verified_since_enabled", true),
    ("highlights_tweets_tab_ui_enabled", true),
    ("creator_subscriptions_tweet_preview_api_enabled", true),
    (
        "responsive_web_graphql_skip_user_profile_image_extensions_enabled",
        false,
    ),
    ("responsive_web_graphql_timeline_navigation_enabled", true),
];

/// The `features` query parameter value.
pub fn features_json() -> String {
    let map: serde_json::Map<String, Value> = FEATURE_FLAGS
        .iter()
        .map(|(name, enabled)| (name.to_string(), Value::Bool(*enabled)))
        .collect();
    Value::Object(map).to_string()
}

/// `variables` for the single-handle lookup.
pub fn screen_name_variables(screen_name: &str) -> String {
    json!({
        "screen_name": screen_name,
        "withSafetyModeUserFields": true,
        "withSuperFollowsUserFields": true,
    })
    .to_string()
}

/// `variables` for the single-id lookup.
pub fn rest_id_variables(user_id: &str) -> String {
    json!({
        "userId": user_id,
        "withSafetyModeUserFields": true,
        "withSuperFollowsUserFields": true,
    })
    .to_string()
}

/// `variables` for the batch lookup (caller enforces [`BATCH_LIMIT`]).
pub fn rest_ids_variables(user_ids: &[String]) -> String {
    json!({
        "userIds": user_ids,
        "withSafetyModeUserFields": true,
    })
    .to_string()
}

/// Detect the upstream's "features cannot be null" rejection and extract
/// the first missing flag name, so operators see exactly what to add to
/// the table above.
pub fn missing_feature(body: &Value) -> Option<String> {
    let errors = body.get("errors")?.as_array()?;
    for error in errors {
        let Some(message) = error.get("message").and_then(Value::as_str) else {
            continue;
        };
        if let Some(rest) = message.strip_prefix("The following features cannot be null:") {
            let first = rest.split(',').next()?.trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    None
}

/// Parse a single-user GraphQL response body into a resolve outcome.
pub fn parse_single_response(
    body: &Value,
    fallback_screen_name: Option<&str>,
    fallback_user_id: Option<&str>,
) -> ResolveOutcome {
    if let Some(result) = body
        .get("data")
        .and_then(|d| d.get("user"))
        .and_then(|u| u.get("result"))
    {
        return parse_user_result(result, fallback_screen_name, fallback_user_id);
    }

    // GraphQL-level errors: "User not found" arrives here, not as a result.
    if let Some(errors) = body.get("errors").and_then(Value::as_array) {
        for error in errors {
            let message = error.get("message").and_then(Value::as_str).unwrap_or("");
            if message.contains("User not found") {
                return ResolveOutcome::PermanentFailure {
                    user_state: UserState::NotFound,
                    user_id: fallback_user_id.map(String::from),
                    screen_name: fallback_screen_name.map(String::from),
                };
            }
        }
        let first = errors
            .first()
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("GraphQL error");
        return ResolveOutcome::TransientFailure(FailureInfo {
            api_error_message: Some(first.to_string()),
            api_error_code: errors
                .first()
                .and_then(|e| e.get("code"))
                .and_then(Value::as_i64),
            ..FailureInfo::default()
        });
    }

    ResolveOutcome::TransientFailure(FailureInfo {
        api_error_message: Some("empty user result".to_string()),
        ..FailureInfo::default()
    })
}

/// Parse the batch response into one outcome per requested id.
///
/// `data.users[]` is a map keyed by each entry's own `rest_id`/`id_str`,
/// not a positional array: the upstream omits unresolvable accounts from
/// the response entirely, so array position carries no meaning. Matching
/// by position would attribute the wrong user's profile (and relationship)
/// to every id after the first gap. Ids absent from the response are
/// not-found.
pub fn parse_batch_response(body: &Value, requested_ids: &[String]) -> Vec<ResolveOutcome> {
    let results = body
        .get("data")
        .and_then(|d| d.get("users"))
        .and_then(Value::as_array);

    let Some(results) = results else {
        let failure = FailureInfo {
            api_error_message: Some("malformed batch user response".to_string()),
            ..FailureInfo::default()
        };
        return requested_ids
            .iter()
            .map(|_| ResolveOutcome::TransientFailure(failure.clone()))
            .collect();
    };

    let mut by_id: HashMap<String, ResolveOutcome> = HashMap::with_capacity(results.len());
    for entry in results {
        let Some(result) = entry.get("result") else {
            continue;
        };
        // An entry that carries no id of its own cannot be attributed to
        // any requested id.
        let Some(id) = result_entry_id(result) else {
            continue;
        };
        let outcome = parse_user_result(result, None, Some(id.as_str()));
        by_id.insert(id, outcome);
    }

    requested_ids
        .iter()
        .map(|requested_id| {
            by_id
                .remove(requested_id)
                .unwrap_or_else(|| ResolveOutcome::PermanentFailure {
                    user_state: UserState::NotFound,
                    user_id: Some(requested_id.clone()),
                    screen_name: None,
                })
        })
        .collect()
}

/// The id a batch entry carries for itself.
fn result_entry_id(result: &Value) -> Option<String> {
    result
        .get("rest_id")
        .and_then(Value::as_str)
        .or_else(|| {
            result
                .get("legacy")
                .and_then(|legacy| legacy.get("id_str"))
                .and_then(Value::as_str)
        })
        .map(String::from)
}

/// Parse one `user.result` object.
fn parse_user_result(
    result: &Value,
    fallback_screen_name: Option<&str>,
    fallback_user_id: Option<&str>,
) -> ResolveOutcome {
    let typename = result
        .get("__typename")
        .and_then(Value::as_str)
        .unwrap_or("User");

    if typename == "UserUnavailable" {
        let user_state = result
            .get("reason")
            .and_then(Value::as_str)
            .map(UserState::from_provider_reason)
            .unwrap_or(UserState::Unavailable);

        let user_id = result
            .get("rest_id")
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| fallback_user_id.map(String::from));

        if user_state.is_permanent() {
            return ResolveOutcome::PermanentFailure {
                user_state,
                user_id,
                screen_name: fallback_screen_name.map(String::from),
            };
        }
        return ResolveOutcome::TransientFailure(FailureInfo {
            api_error_message: Some(format!("user {}", user_state.as_str())),
            ..FailureInfo::default()
        });
    }

    let Some(legacy) = result.get("legacy") else {
        return ResolveOutcome::TransientFailure(FailureInfo {
            api_error_message: Some("user result without legacy payload".to_string()),
            ..FailureInfo::default()
        });
    };

    let id = legacy
        .get("id_str")
        .and_then(Value::as_str)
        .or_else(|| result.get("rest_id").and_then(Value::as_str))
        .map(String::from)
        .or_else(|| fallback_user_id.map(String::from));

    let Some(id) = id else {
        return ResolveOutcome::TransientFailure(FailureInfo {
            api_error_message: Some("user result without id".to_string()),
            ..FailureInfo::default()
        });
    };

    let get_bool = |key: &str| legacy.get(key).and_then(Value::as_bool).unwrap_or(false);

    let profile = UserProfile {
        id,
        screen_name: legacy
            .get("screen_name")
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| fallback_screen_name.map(String::from)),
        display_name: legacy.get("name").and_then(Value::as_str).map(String::from),
        user_state: UserState::Active,
        protected: get_bool("protected"),
        verified: get_bool("verified"),
    };

    let relationship = Relationship {
        following: get_bool("following"),
        followed_by: get_bool("followed_by"),
        blocking: get_bool("blocking"),
        blocked_by: get_bool("blocked_by"),
        muted: get_bool("muting"),
    };

    ResolveOutcome::Ok(crate::data::ResolvedUser {
        profile,
        relationship,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_user_body(id: &str, screen_name: &str, following: bool) -> Value {
        json!({
            "data": {"user": {"result": {
                "__typename": "User",
                "rest_id": id,
                "legacy": {
                    "id_str": id,
                    "screen_name": screen_name,
                    "name": "Display Name",
                    "following": following,
                    "followed_by": false,
                    "blocking": false,
                    "blocked_by": false,
                    "protected": false,
                    "verified": true
                }
            }}}
        })
    }

    #[test]
    fn features_json_is_valid_and_complete() {
        let parsed: Value = serde_json::from_str(&features_json()).unwrap();
        let map = parsed.as_object().unwrap();
        assert_eq!(map.len(), FEATURE_FLAGS.len());
        assert_eq!(map["verified_phone_label_enabled"], Value::Bool(false));
    }

    #[test]
    fn parses_active_user_with_relationship() {
        let body = active_user_body("100", "alice", true);
        match parse_single_response(&body, Some("alice"), None) {
            ResolveOutcome::Ok(user) => {
                assert_eq!(user.profile.id, "100");
                assert_eq!(user.profile.screen_name.as_deref(), Some("alice"));
                assert_eq!(user.profile.user_state, UserState::Active);
                assert!(user.profile.verified);
                assert!(user.relationship.following);
                assert!(!user.relationship.blocking);
            }
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[test]
    fn parses_suspended_user_as_permanent() {
        let body = json!({
            "data": {"user": {"result": {
                "__typename": "UserUnavailable",
                "reason": "Suspended"
            }}}
        });
        match parse_single_response(&body, Some("bob"), None) {
            ResolveOutcome::PermanentFailure {
                user_state,
                screen_name,
                ..
            } => {
                assert_eq!(user_state, UserState::Suspended);
                assert_eq!(screen_name.as_deref(), Some("bob"));
            }
            other => panic!("expected PermanentFailure, got {other:?}"),
        }
    }

    #[test]
    fn unavailable_without_permanent_reason_is_transient() {
        let body = json!({
            "data": {"user": {"result": {
                "__typename": "UserUnavailable",
                "reason": "OverCapacity"
            }}}
        });
        assert!(matches!(
            parse_single_response(&body, None, Some("7")),
            ResolveOutcome::TransientFailure(_)
        ));
    }

    #[test]
    fn user_not_found_error_is_permanent() {
        let body = json!({
            "errors": [{"message": "User not found.", "code": 50}]
        });
        match parse_single_response(&body, Some("ghost"), None) {
            ResolveOutcome::PermanentFailure { user_state, .. } => {
                assert_eq!(user_state, UserState::NotFound);
            }
            other => panic!("expected PermanentFailure, got {other:?}"),
        }
    }

    fn batch_entry(id: &str, screen_name: &str) -> Value {
        json!({"result": {
            "__typename": "User",
            "rest_id": id,
            "legacy": {"id_str": id, "screen_name": screen_name, "name": screen_name}
        }})
    }

    #[test]
    fn batch_response_matches_requested_ids() {
        let body = json!({
            "data": {"users": [
                batch_entry("1", "a"),
                {"result": {
                    "__typename": "UserUnavailable",
                    "rest_id": "2",
                    "reason": "Suspended"
                }}
            ]}
        });
        let ids = vec!["1".to_string(), "2".to_string(), "3".to_string()];
        let outcomes = parse_batch_response(&body, &ids);
        assert_eq!(outcomes.len(), 3);
        assert!(matches!(outcomes[0], ResolveOutcome::Ok(_)));
        assert!(matches!(
            outcomes[1],
            ResolveOutcome::PermanentFailure {
                user_state: UserState::Suspended,
                ..
            }
        ));
        // Absent from the response entirely: not found.
        assert!(matches!(
            outcomes[2],
            ResolveOutcome::PermanentFailure {
                user_state: UserState::NotFound,
                ..
            }
        ));
    }

    #[test]
    fn batch_response_with_mid_batch_gap_does_not_shift_attribution() {
        // The upstream dropped "2" from the middle and returned the rest
        // out of order. Position must play no part in the matching.
        let body = json!({
            "data": {"users": [
                batch_entry("3", "c"),
                batch_entry("1", "a"),
                batch_entry("4", "d")
            ]}
        });
        let ids: Vec<String> = ["1", "2", "3", "4"].iter().map(|s| s.to_string()).collect();
        let outcomes = parse_batch_response(&body, &ids);

        match &outcomes[0] {
            ResolveOutcome::Ok(user) => assert_eq!(user.profile.id, "1"),
            other => panic!("expected Ok for id 1, got {other:?}"),
        }
        assert!(matches!(
            &outcomes[1],
            ResolveOutcome::PermanentFailure {
                user_state: UserState::NotFound,
                user_id: Some(id),
                ..
            } if id == "2"
        ));
        match &outcomes[2] {
            ResolveOutcome::Ok(user) => {
                assert_eq!(user.profile.id, "3");
                assert_eq!(user.profile.screen_name.as_deref(), Some("c"));
            }
            other => panic!("expected Ok for id 3, got {other:?}"),
        }
        match &outcomes[3] {
            ResolveOutcome::Ok(user) => assert_eq!(user.profile.id, "4"),
            other => panic!("expected Ok for id 4, got {other:?}"),
        }
    }

    #[test]
    fn batch_entry_without_own_id_is_not_misattributed() {
        // An unattributable entry is skipped; the requested id it might
        // have answered falls out as not found rather than stealing the
        // next entry's data.
        let body = json!({
            "data": {"users": [
                {"result": {"__typename": "UserUnavailable", "reason": "Suspended"}},
                batch_entry("2", "b")
            ]}
        });
        let ids = vec!["1".to_string(), "2".to_string()];
        let outcomes = parse_batch_response(&body, &ids);
        assert!(matches!(
            &outcomes[0],
            ResolveOutcome::PermanentFailure {
                user_state: UserState::NotFound,
                ..
            }
        ));
        match &outcomes[1] {
            ResolveOutcome::Ok(user) => assert_eq!(user.profile.id, "2"),
            other => panic!("expected Ok for id 2, got {other:?}"),
        }
    }

    #[test]
    fn missing_feature_extracts_flag_name() {
        let body = json!({
            "errors": [{
                "message": "The following features cannot be null: new_flag_enabled, other_flag"
            }]
        });
        assert_eq!(missing_feature(&body).as_deref(), Some("new_flag_enabled"));
        assert_eq!(missing_feature(&json!({"data": {}})), None);
    }
}

//! Data models
//!
//! Rust structs representing outcome rows, cache values, and the wire-level
//! user data returned by the upstream APIs. Enums stored in SQLite are
//! string-backed with `as_str`/`parse_str` pairs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Target list
// =============================================================================

/// Identifier format of a target list. The whole run is homogeneous in
/// whichever format the input file declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetFormat {
    ScreenName,
    UserId,
}

impl TargetFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScreenName => "screen_name",
            Self::UserId => "user_id",
        }
    }
}

/// Parsed target-list file: `{"format": ..., "users": [...]}`
#[derive(Debug, Clone, Deserialize)]
pub struct TargetList {
    pub format: TargetFormat,
    pub users: Vec<String>,
}

// =============================================================================
// Outcome records
// =============================================================================

/// Terminal status of one attempt on one target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Success,
    Skipped,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    pub fn parse_str(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "skipped" => Self::Skipped,
            _ => Self::Failed,
        }
    }
}

/// Account state reported by the upstream.
///
/// `Suspended`, `NotFound`, and `Deactivated` form the permanent-failure
/// set: once recorded, no further upstream call is permitted for the
/// target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserState {
    Active,
    Suspended,
    NotFound,
    Deactivated,
    Unavailable,
    Unknown,
}

impl UserState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::NotFound => "not_found",
            Self::Deactivated => "deactivated",
            Self::Unavailable => "unavailable",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse_str(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "suspended" => Self::Suspended,
            "not_found" => Self::NotFound,
            "deactivated" => Self::Deactivated,
            "unavailable" => Self::Unavailable,
            _ => Self::Unknown,
        }
    }

    /// Map an upstream unavailability reason onto a user state.
    pub fn from_provider_reason(reason: &str) -> Self {
        let normalized = reason.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "suspended" => Self::Suspended,
            "not_found" | "notfound" => Self::NotFound,
            "deactivated" => Self::Deactivated,
            _ => Self::Unavailable,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Suspended | Self::NotFound | Self::Deactivated)
    }
}

/// Coarse failure category stored with each failed/skipped outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RateLimit,
    ServerError,
    Unavailable,
    Network,
    Auth,
    Forbidden,
    FollowRelationship,
    AlreadyBlocked,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::ServerError => "server_error",
            Self::Unavailable => "unavailable",
            Self::Network => "network",
            Self::Auth => "auth",
            Self::Forbidden => "forbidden",
            Self::FollowRelationship => "follow_relationship",
            Self::AlreadyBlocked => "already_blocked",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse_str(s: &str) -> Self {
        match s {
            "rate_limit" => Self::RateLimit,
            "server_error" => Self::ServerError,
            "unavailable" => Self::Unavailable,
            "network" => Self::Network,
            "auth" => Self::Auth,
            "forbidden" => Self::Forbidden,
            "follow_relationship" => Self::FollowRelationship,
            "already_blocked" => Self::AlreadyBlocked,
            _ => Self::Unknown,
        }
    }
}

/// One attempt outcome on its way into the store.
///
/// Uniqueness in the store is by `user_id` when known, else `screen_name`;
/// a handle-only row is upgraded in place once the id is learned.
#[derive(Debug, Clone)]
pub struct NewOutcome {
    pub screen_name: Option<String>,
    pub user_id: Option<String>,
    pub display_name: Option<String>,
    pub status: OutcomeStatus,
    pub user_state: UserState,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub http_status: Option<u16>,
    pub session_id: i64,
}

/// A persisted outcome row
#[derive(Debug, Clone)]
pub struct OutcomeRecord {
    pub screen_name: Option<String>,
    pub user_id: Option<String>,
    pub display_name: Option<String>,
    pub status: OutcomeStatus,
    pub user_state: UserState,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub http_status: Option<u16>,
    pub attempts: i64,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub session_id: i64,
}

/// Permanent-failure summary returned by the bulk prefilter query
#[derive(Debug, Clone)]
pub struct PermanentFailure {
    pub user_state: UserState,
    pub error_kind: Option<ErrorKind>,
    pub last_updated: DateTime<Utc>,
}

/// A failed target eligible for the auto-retry pass
#[derive(Debug, Clone)]
pub struct RetryCandidate {
    pub screen_name: Option<String>,
    pub user_id: Option<String>,
    pub display_name: Option<String>,
    pub user_state: UserState,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl RetryCandidate {
    /// Identifier in the given list format, when the record carries it.
    pub fn identifier(&self, format: TargetFormat) -> Option<&str> {
        match format {
            TargetFormat::ScreenName => self.screen_name.as_deref(),
            TargetFormat::UserId => self.user_id.as_deref(),
        }
    }
}

// =============================================================================
// Upstream user data
// =============================================================================

/// Account profile as returned by the GraphQL user endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub screen_name: Option<String>,
    pub display_name: Option<String>,
    pub user_state: UserState,
    pub protected: bool,
    pub verified: bool,
}

/// Relationship between the caller session and a target account
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Relationship {
    pub following: bool,
    pub followed_by: bool,
    pub blocking: bool,
    pub blocked_by: bool,
    pub muted: bool,
}

/// A fully resolved target: profile + relationship snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedUser {
    pub profile: UserProfile,
    pub relationship: Relationship,
}

/// Per-target result of a resolve pass
#[derive(Debug, Clone)]
pub enum ResolveOutcome {
    /// Profile and relationship obtained; the target is actionable.
    Ok(ResolvedUser),
    /// Upstream says the account cannot be blocked, ever.
    PermanentFailure {
        user_state: UserState,
        user_id: Option<String>,
        screen_name: Option<String>,
    },
    /// The lookup failed in a way that may succeed later.
    TransientFailure(FailureInfo),
}

// =============================================================================
// Failure description
// =============================================================================

/// Structured description of a raw failure, consumed by the classifier.
///
/// Call sites hold an `Option<FailureInfo>` and match totally; there is no
/// partial field access on an absent failure.
#[derive(Debug, Clone, Default)]
pub struct FailureInfo {
    pub http_status: Option<u16>,
    pub api_error_message: Option<String>,
    pub api_error_code: Option<i64>,
    /// Connect/timeout-class transport failure.
    pub network: bool,
    /// Rate-limit reset epoch from response headers, when present.
    pub rate_limit_reset: Option<i64>,
}

impl FailureInfo {
    pub fn from_status(status: u16) -> Self {
        Self {
            http_status: Some(status),
            ..Self::default()
        }
    }

    /// Error-message sample bounded for storage.
    pub fn message_sample(&self) -> Option<String> {
        self.api_error_message
            .as_deref()
            .map(|m| truncate_sample(m, 200))
    }
}

/// Bound a message sample without splitting a multi-byte character.
pub(crate) fn truncate_sample(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

// =============================================================================
// Run bookkeeping
// =============================================================================

/// Counters mutated by the processing manager across a run
#[derive(Debug, Clone, Copy, Default)]
pub struct RunStats {
    pub processed: u64,
    pub blocked: u64,
    pub skipped: u64,
    pub errors: u64,
}

/// One batch's throughput summary, persisted per session
#[derive(Debug, Clone)]
pub struct PerfWindow {
    pub session_id: i64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub processed: i64,
    pub blocked: i64,
    pub errors: i64,
    pub requests_per_second: f64,
    pub success_rate: f64,
    /// Comma-joined bottleneck markers, when any tripped.
    pub bottleneck: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_state_round_trips_through_strings() {
        for state in [
            UserState::Active,
            UserState::Suspended,
            UserState::NotFound,
            UserState::Deactivated,
            UserState::Unavailable,
            UserState::Unknown,
        ] {
            assert_eq!(UserState::parse_str(state.as_str()), state);
        }
    }

    #[test]
    fn permanent_set_is_exactly_three_states() {
        assert!(UserState::Suspended.is_permanent());
        assert!(UserState::NotFound.is_permanent());
        assert!(UserState::Deactivated.is_permanent());
        assert!(!UserState::Unavailable.is_permanent());
        assert!(!UserState::Active.is_permanent());
        assert!(!UserState::Unknown.is_permanent());
    }

    #[test]
    fn provider_reason_maps_unrecognized_values_to_unavailable() {
        assert_eq!(
            UserState::from_provider_reason("Suspended"),
            UserState::Suspended
        );
        assert_eq!(
            UserState::from_provider_reason("something-new"),
            UserState::Unavailable
        );
    }

    #[test]
    fn message_sample_is_bounded() {
        let info = FailureInfo {
            api_error_message: Some("x".repeat(500)),
            ..FailureInfo::default()
        };
        assert_eq!(info.message_sample().unwrap().len(), 200);
    }
}

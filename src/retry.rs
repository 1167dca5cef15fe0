//! Failure classification and backoff policy
//!
//! `classify` is a pure function from a raw failure description to one of
//! three dispositions: permanent (record, never retry, never re-contact
//! upstream), transient (record, retry with backoff), or auth (reload the
//! session and retry the call exactly once). The processing manager and
//! the resume path both go through it, so the partition stays consistent
//! across runs.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

use crate::data::{ErrorKind, FailureInfo, UserState};

/// Base backoff interval.
pub const BASE_BACKOFF: Duration = Duration::from_secs(60);
/// Upper clamp for every computed wait.
pub const MAX_BACKOFF: Duration = Duration::from_secs(900);
/// Attempt ceiling for interactive runs.
pub const DEFAULT_RETRY_CEILING: i64 = 3;
/// Attempt ceiling for the auto-retry pass.
pub const AUTO_RETRY_CEILING: i64 = 10;

/// Transient failure sub-kind; drives backoff and reporting buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    RateLimit,
    ServerError,
    Unavailable,
    Network,
    Unknown,
}

impl TransientKind {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            Self::RateLimit => ErrorKind::RateLimit,
            Self::ServerError => ErrorKind::ServerError,
            Self::Unavailable => ErrorKind::Unavailable,
            Self::Network => ErrorKind::Network,
            Self::Unknown => ErrorKind::Unknown,
        }
    }
}

/// Disposition of a failed upstream call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The target can never be blocked; record and skip forever.
    Permanent(UserState),
    /// Eligible for retry. `wait` is the suggested minimum pause before
    /// the next attempt (already clamped).
    Transient { kind: TransientKind, wait: Duration },
    /// Session likely stale: reload the cookie jar and retry once.
    Auth,
}

/// Provider-error strings that indicate a permanently unblockable account.
const PERMANENT_MESSAGES: &[(&str, UserState)] = &[
    ("suspended", UserState::Suspended),
    ("user not found", UserState::NotFound),
    ("not found", UserState::NotFound),
    ("deactivated", UserState::Deactivated),
];

/// Provider-error strings that indicate a temporary condition.
const UNAVAILABLE_MESSAGES: &[&str] = &["temporarily unavailable", "unavailable", "over capacity"];

/// Classify a raw failure. `now` feeds the 429 reset-hint arithmetic so
/// the function stays deterministic under test.
pub fn classify(info: Option<&FailureInfo>, now: DateTime<Utc>) -> Classification {
    let Some(info) = info else {
        // No structured failure data at all: retryable, default pacing.
        return Classification::Transient {
            kind: TransientKind::Unknown,
            wait: BASE_BACKOFF,
        };
    };

    if info.network {
        return Classification::Transient {
            kind: TransientKind::Network,
            wait: BASE_BACKOFF,
        };
    }

    let message = info
        .api_error_message
        .as_deref()
        .unwrap_or("")
        .to_ascii_lowercase();

    // Provider strings are authoritative over status codes: a 200 body can
    // still carry a suspension notice.
    for (needle, state) in PERMANENT_MESSAGES {
        if message.contains(needle) {
            return Classification::Permanent(*state);
        }
    }

    match info.http_status {
        Some(401) => Classification::Auth,
        Some(429) => Classification::Transient {
            kind: TransientKind::RateLimit,
            wait: rate_limit_wait(info.rate_limit_reset, now),
        },
        Some(500) | Some(502) | Some(503) | Some(504) => Classification::Transient {
            kind: TransientKind::ServerError,
            wait: BASE_BACKOFF,
        },
        Some(403) if message.is_empty() => {
            // Empty-body 403: the throttling signature handled by the
            // client-side circuit; still retryable at the target level.
            Classification::Transient {
                kind: TransientKind::Unknown,
                wait: BASE_BACKOFF,
            }
        }
        _ => {
            if UNAVAILABLE_MESSAGES.iter().any(|m| message.contains(m)) {
                Classification::Transient {
                    kind: TransientKind::Unavailable,
                    wait: BASE_BACKOFF,
                }
            } else {
                Classification::Transient {
                    kind: TransientKind::Unknown,
                    wait: BASE_BACKOFF,
                }
            }
        }
    }
}

/// Wait for a rate-limited endpoint: reset-epoch minus now, clamped to
/// [60 s, 900 s]. A missing or past reset falls back to the lower bound.
pub fn rate_limit_wait(reset_epoch: Option<i64>, now: DateTime<Utc>) -> Duration {
    let wait = reset_epoch
        .map(|reset| reset - now.timestamp())
        .unwrap_or(0)
        .max(0) as u64;
    Duration::from_secs(wait).clamp(BASE_BACKOFF, MAX_BACKOFF)
}

/// Geometric backoff for attempt N (0-based): 60 s doubling, capped at
/// 900 s. Deterministic; see [`jittered`] for the scheduled variant.
pub fn backoff(attempt: u32) -> Duration {
    let exp = attempt.min(10);
    let secs = BASE_BACKOFF.as_secs().saturating_mul(1u64 << exp);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

/// Apply ±10% jitter to a computed wait.
pub fn jittered(wait: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor: f64 = rng.gen_range(0.9..=1.1);
    Duration::from_secs_f64(wait.as_secs_f64() * factor)
}

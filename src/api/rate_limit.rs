//! Rate-limit accounting and upstream-throttle circuit
//!
//! Every response updates a per-endpoint-family snapshot taken from the
//! `x-rate-limit-*` headers. Before dispatch, an exhausted family blocks
//! the caller until its reset (plus a small pad), bounded to 15 minutes.
//!
//! Separately, a run of consecutive empty-body 403s (the observed
//! signature of throttling unrelated to the documented limits) trips a
//! per-session circuit that pauses all dispatch for a cool-down.

use reqwest::header::HeaderMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;

/// Upstream endpoint families with independent rate-limit buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointFamily {
    /// GraphQL user-read calls (150 req / 15 min documented).
    UserRead,
    /// REST block-create (300 req / 15 min documented).
    BlockCreate,
    /// Credential verification.
    VerifyCredentials,
}

impl EndpointFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserRead => "user_read",
            Self::BlockCreate => "block_create",
            Self::VerifyCredentials => "verify_credentials",
        }
    }
}

/// Snapshot of one family's documented limit state
#[derive(Debug, Clone, Copy)]
struct Snapshot {
    limit: u32,
    remaining: u32,
    reset_epoch: i64,
}

/// Extra pad added to the advertised reset.
const RESET_PAD: Duration = Duration::from_secs(10);
/// Upper bound on any rate-limit wait.
const MAX_WAIT: Duration = Duration::from_secs(900);

/// Per-endpoint rate-limit ledger.
///
/// The lock only covers the read-modify-write of a snapshot; callers never
/// hold it across I/O.
#[derive(Debug, Default)]
pub struct RateLimitLedger {
    snapshots: std::sync::Mutex<HashMap<EndpointFamily, Snapshot>>,
}

impl RateLimitLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the family snapshot from a response's rate-limit headers.
    /// Responses without the headers leave the snapshot untouched.
    pub fn update_from_headers(&self, family: EndpointFamily, headers: &HeaderMap) {
        let parse = |name: &str| -> Option<i64> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
        };

        let (Some(limit), Some(remaining), Some(reset)) = (
            parse("x-rate-limit-limit"),
            parse("x-rate-limit-remaining"),
            parse("x-rate-limit-reset"),
        ) else {
            return;
        };

        let snapshot = Snapshot {
            limit: limit.max(0) as u32,
            remaining: remaining.max(0) as u32,
            reset_epoch: reset,
        };

        let mut snapshots = self.snapshots.lock().unwrap();
        snapshots.insert(family, snapshot);

        if snapshot.remaining == 0 {
            tracing::warn!(
                family = family.as_str(),
                limit = snapshot.limit,
                reset_epoch = snapshot.reset_epoch,
                "rate-limit bucket exhausted"
            );
        }
    }

    /// How long the caller must wait before dispatching to `family`, if at
    /// all: reset + 10 s pad when the bucket is empty and the reset is in
    /// the future, bounded to 15 minutes.
    pub fn wait_before_dispatch(&self, family: EndpointFamily) -> Option<Duration> {
        let snapshots = self.snapshots.lock().unwrap();
        let snapshot = snapshots.get(&family)?;
        if snapshot.remaining > 0 {
            return None;
        }

        let now = Utc::now().timestamp();
        let until_reset = snapshot.reset_epoch - now;
        if until_reset <= 0 {
            return None;
        }

        Some((Duration::from_secs(until_reset as u64) + RESET_PAD).min(MAX_WAIT))
    }

    /// Remaining budget for diagnostics.
    pub fn remaining(&self, family: EndpointFamily) -> Option<u32> {
        let snapshots = self.snapshots.lock().unwrap();
        snapshots.get(&family).map(|s| s.remaining)
    }
}

// =============================================================================
// Empty-body-403 circuit
// =============================================================================

/// Per-caller-session circuit for the empty-body 403 throttle signature.
///
/// `k` consecutive events inside `window` trip the circuit for `cooldown`;
/// any successful call resets the streak.
#[derive(Debug)]
pub struct ThrottleCircuit {
    events: Vec<Instant>,
    cooldown_until: Option<Instant>,
    threshold: u32,
    window: Duration,
    cooldown: Duration,
}

impl ThrottleCircuit {
    pub fn new(threshold: u32, window: Duration, cooldown: Duration) -> Self {
        Self {
            events: Vec::new(),
            cooldown_until: None,
            threshold: threshold.max(1),
            window,
            cooldown,
        }
    }

    /// Record one empty-body 403. Returns the cool-down duration when this
    /// event trips the circuit.
    pub fn record_forbidden(&mut self) -> Option<Duration> {
        let now = Instant::now();
        self.events.push(now);
        self.events
            .retain(|event| now.duration_since(*event) <= self.window);

        if self.events.len() >= self.threshold as usize {
            self.events.clear();
            self.cooldown_until = Some(now + self.cooldown);
            tracing::warn!(
                threshold = self.threshold,
                cooldown_secs = self.cooldown.as_secs(),
                "empty-body 403 streak tripped the throttle circuit"
            );
            return Some(self.cooldown);
        }
        None
    }

    /// Any successful call breaks the streak.
    pub fn record_success(&mut self) {
        self.events.clear();
    }

    /// Remaining cool-down, when the circuit is open.
    pub fn active_cooldown(&self) -> Option<Duration> {
        let until = self.cooldown_until?;
        let now = Instant::now();
        if until > now {
            Some(until - now)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn limit_headers(limit: &str, remaining: &str, reset: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-rate-limit-limit", HeaderValue::from_str(limit).unwrap());
        headers.insert(
            "x-rate-limit-remaining",
            HeaderValue::from_str(remaining).unwrap(),
        );
        headers.insert("x-rate-limit-reset", HeaderValue::from_str(reset).unwrap());
        headers
    }

    #[test]
    fn no_wait_while_budget_remains() {
        let ledger = RateLimitLedger::new();
        let reset = (Utc::now().timestamp() + 600).to_string();
        ledger.update_from_headers(
            EndpointFamily::UserRead,
            &limit_headers("150", "10", &reset),
        );
        assert!(ledger.wait_before_dispatch(EndpointFamily::UserRead).is_none());
        assert_eq!(ledger.remaining(EndpointFamily::UserRead), Some(10));
    }

    #[test]
    fn exhausted_bucket_waits_until_reset_with_pad() {
        let ledger = RateLimitLedger::new();
        let reset = (Utc::now().timestamp() + 120).to_string();
        ledger.update_from_headers(
            EndpointFamily::UserRead,
            &limit_headers("150", "0", &reset),
        );
        let wait = ledger
            .wait_before_dispatch(EndpointFamily::UserRead)
            .expect("must wait");
        assert!(wait >= Duration::from_secs(120));
        assert!(wait <= Duration::from_secs(135));
    }

    #[test]
    fn wait_is_bounded_to_fifteen_minutes() {
        let ledger = RateLimitLedger::new();
        let reset = (Utc::now().timestamp() + 7_200).to_string();
        ledger.update_from_headers(
            EndpointFamily::BlockCreate,
            &limit_headers("300", "0", &reset),
        );
        let wait = ledger
            .wait_before_dispatch(EndpointFamily::BlockCreate)
            .unwrap();
        assert_eq!(wait, Duration::from_secs(900));
    }

    #[test]
    fn past_reset_means_no_wait() {
        let ledger = RateLimitLedger::new();
        let reset = (Utc::now().timestamp() - 5).to_string();
        ledger.update_from_headers(
            EndpointFamily::UserRead,
            &limit_headers("150", "0", &reset),
        );
        assert!(ledger.wait_before_dispatch(EndpointFamily::UserRead).is_none());
    }

    #[test]
    fn families_are_independent() {
        let ledger = RateLimitLedger::new();
        let reset = (Utc::now().timestamp() + 300).to_string();
        ledger.update_from_headers(
            EndpointFamily::UserRead,
            &limit_headers("150", "0", &reset),
        );
        assert!(ledger.wait_before_dispatch(EndpointFamily::UserRead).is_some());
        assert!(ledger
            .wait_before_dispatch(EndpointFamily::BlockCreate)
            .is_none());
    }

    #[test]
    fn missing_headers_leave_snapshot_untouched() {
        let ledger = RateLimitLedger::new();
        ledger.update_from_headers(EndpointFamily::UserRead, &HeaderMap::new());
        assert!(ledger.remaining(EndpointFamily::UserRead).is_none());
    }

    #[test]
    fn circuit_trips_at_exactly_threshold() {
        let mut circuit = ThrottleCircuit::new(
            5,
            Duration::from_secs(300),
            Duration::from_secs(1_800),
        );

        for _ in 0..4 {
            assert!(circuit.record_forbidden().is_none());
        }
        let cooldown = circuit.record_forbidden().expect("fifth event trips");
        assert_eq!(cooldown, Duration::from_secs(1_800));
        assert!(circuit.active_cooldown().is_some());
    }

    #[test]
    fn success_resets_the_streak() {
        let mut circuit = ThrottleCircuit::new(
            5,
            Duration::from_secs(300),
            Duration::from_secs(1_800),
        );

        for _ in 0..4 {
            circuit.record_forbidden();
        }
        circuit.record_success();
        for _ in 0..4 {
            assert!(circuit.record_forbidden().is_none());
        }
    }

    #[test]
    fn events_outside_window_do_not_count() {
        let mut circuit =
            ThrottleCircuit::new(3, Duration::from_millis(50), Duration::from_secs(60));

        circuit.record_forbidden();
        circuit.record_forbidden();
        std::thread::sleep(Duration::from_millis(80));
        // The earlier two have aged out of the window.
        assert!(circuit.record_forbidden().is_none());
        assert!(circuit.record_forbidden().is_none());
    }
}

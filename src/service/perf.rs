//! Processing-speed monitoring
//!
//! Long runs degrade slowly: throttling tightens, the cache ages out, the
//! session sours. Each batch is summarized into a throughput window,
//! persisted alongside the outcomes, and compared against absolute floors
//! and the session's own first-window baseline. Degradation surfaces as
//! structured warn/error events while the run is still going, not in a
//! post-mortem.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::data::{PerfWindow, RunStats};

/// Windows slower than this are flagged outright.
const LOW_RATE_FLOOR: f64 = 1.0;
/// Below this the run has effectively stalled.
const COLLAPSED_RATE_FLOOR: f64 = 0.1;
/// Block success-rate floors.
const LOW_SUCCESS_RATE: f64 = 0.8;
const CRITICAL_SUCCESS_RATE: f64 = 0.5;
/// Error share of attempted blocks that marks a window as bottlenecked.
const HIGH_ERROR_RATE: f64 = 0.2;
/// Per-target wall time that marks a window as crawling.
const HIGH_SECONDS_PER_TARGET: f64 = 10.0;
/// Throughput drop vs. the session baseline that raises a degradation
/// alert (fraction of baseline retained).
const BASELINE_RETENTION_FLOOR: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Medium,
    High,
    Critical,
}

/// Operator-facing degradation alert
#[derive(Debug, Clone)]
pub struct PerfAlert {
    pub severity: AlertSeverity,
    pub message: String,
}

/// Per-run throughput monitor.
///
/// Holds the session baseline (the first productive window) so later
/// windows can be judged against how the run started, not just absolute
/// floors.
pub struct PerfMonitor {
    session_id: i64,
    baseline_rps: Option<f64>,
}

impl PerfMonitor {
    pub fn new(session_id: i64) -> Self {
        Self {
            session_id,
            baseline_rps: None,
        }
    }

    /// Summarize one batch. `before`/`after` are the run counters at the
    /// window edges; `elapsed` is its wall time.
    pub fn observe(
        &mut self,
        window_start: DateTime<Utc>,
        elapsed: Duration,
        before: RunStats,
        after: RunStats,
    ) -> (PerfWindow, Vec<PerfAlert>) {
        let processed = after.processed.saturating_sub(before.processed) as i64;
        let blocked = after.blocked.saturating_sub(before.blocked) as i64;
        let errors = after.errors.saturating_sub(before.errors) as i64;

        let seconds = elapsed.as_secs_f64().max(0.001);
        let requests_per_second = processed as f64 / seconds;
        let attempted = blocked + errors;
        let success_rate = if attempted > 0 {
            blocked as f64 / attempted as f64
        } else {
            1.0
        };

        let window = PerfWindow {
            session_id: self.session_id,
            window_start,
            window_end: Utc::now(),
            processed,
            blocked,
            errors,
            requests_per_second,
            success_rate,
            bottleneck: detect_bottleneck(processed, errors, requests_per_second, success_rate),
        };

        let alerts = self.check_thresholds(&window, seconds);

        // The first window that actually moved targets becomes the
        // session baseline.
        if self.baseline_rps.is_none() && processed > 0 {
            self.baseline_rps = Some(requests_per_second);
        }

        (window, alerts)
    }

    fn check_thresholds(&self, window: &PerfWindow, seconds: f64) -> Vec<PerfAlert> {
        let mut alerts = Vec::new();
        let attempted = window.blocked + window.errors;

        if window.processed > 0 && window.requests_per_second < COLLAPSED_RATE_FLOOR {
            alerts.push(PerfAlert {
                severity: AlertSeverity::Critical,
                message: format!(
                    "processing rate collapsed to {:.3} targets/s; investigate throttling or restart the session",
                    window.requests_per_second
                ),
            });
        }

        if attempted > 0 && window.success_rate < CRITICAL_SUCCESS_RATE {
            alerts.push(PerfAlert {
                severity: AlertSeverity::High,
                message: format!(
                    "block success rate down to {:.0}%; check the error samples and refresh the cookie jar",
                    window.success_rate * 100.0
                ),
            });
        }

        if window.processed > 0 && seconds / window.processed as f64 > HIGH_SECONDS_PER_TARGET {
            alerts.push(PerfAlert {
                severity: AlertSeverity::Medium,
                message: format!(
                    "averaging {:.1}s per target; check cache hit rate and batch size",
                    seconds / window.processed as f64
                ),
            });
        }

        if let Some(baseline) = self.baseline_rps {
            if window.processed > 0
                && baseline > 0.0
                && window.requests_per_second < baseline * BASELINE_RETENTION_FLOOR
            {
                alerts.push(PerfAlert {
                    severity: AlertSeverity::Medium,
                    message: format!(
                        "throughput {:.2} targets/s is down more than 30% from this session's baseline {:.2}",
                        window.requests_per_second, baseline
                    ),
                });
            }
        }

        alerts
    }
}

fn detect_bottleneck(
    processed: i64,
    errors: i64,
    requests_per_second: f64,
    success_rate: f64,
) -> Option<String> {
    let mut markers = Vec::new();

    if processed > 0 && requests_per_second < LOW_RATE_FLOOR {
        markers.push("low_request_rate");
    }
    if success_rate < LOW_SUCCESS_RATE {
        markers.push("low_success_rate");
    }
    let total = processed + errors;
    if total > 0 && errors as f64 / total as f64 > HIGH_ERROR_RATE {
        markers.push("high_error_rate");
    }

    if markers.is_empty() {
        None
    } else {
        Some(markers.join(","))
    }
}

//! Statistics reporter
//!
//! Read-only queries over the outcome store, rendered for the operator.
//! The same numbers drive the resume logic (what is left, what is
//! retry-eligible), so this module never writes.

use std::fmt::Write as _;

use crate::data::{Database, TargetList};
use crate::error::Result;

/// Snapshot of run progress against a target list
#[derive(Debug, Clone)]
pub struct Report {
    pub total_targets: usize,
    pub blocked: i64,
    pub remaining: i64,
    pub failed: i64,
    pub skipped: i64,
    pub retry_eligible: i64,
    pub retry_ceiling_reached: i64,
    pub by_user_state: Vec<(String, i64)>,
    pub by_error_kind: Vec<(String, i64, Vec<String>)>,
    /// Mean throughput over the most recent windows, when any exist.
    pub recent_rate_per_sec: Option<f64>,
    /// How many of those windows tripped a bottleneck marker.
    pub bottlenecked_windows: usize,
}

/// Build the progress report for a target list.
pub async fn build_report(
    db: &Database,
    list: &TargetList,
    retry_ceiling: i64,
) -> Result<Report> {
    let stats = db.stats(retry_ceiling).await?;
    let breakdown = db.failure_breakdown(5).await?;

    // Chunked so arbitrarily long target lists stay within the store's
    // bind-parameter limits.
    let mut settled: i64 = 0;
    for chunk in list.users.chunks(500) {
        settled += db.get_successful(chunk, list.format).await?.len() as i64;
        settled += db.get_permanent_failures(chunk, list.format).await?.len() as i64;
    }

    let windows = db.recent_perf_windows(12).await?;
    let productive: Vec<_> = windows.iter().filter(|w| w.processed > 0).collect();
    let recent_rate_per_sec = if productive.is_empty() {
        None
    } else {
        Some(
            productive.iter().map(|w| w.requests_per_second).sum::<f64>()
                / productive.len() as f64,
        )
    };
    let bottlenecked_windows = windows.iter().filter(|w| w.bottleneck.is_some()).count();

    Ok(Report {
        total_targets: list.users.len(),
        blocked: stats.success,
        remaining: (list.users.len() as i64 - settled).max(0),
        failed: stats.failed,
        skipped: stats.skipped,
        retry_eligible: stats.retry_eligible,
        retry_ceiling_reached: stats.retry_ceiling_reached,
        by_user_state: breakdown.by_user_state,
        by_error_kind: breakdown.by_error_kind,
        recent_rate_per_sec,
        bottlenecked_windows,
    })
}

impl Report {
    /// Human-readable rendering for the stats command.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== progress ===");
        let _ = writeln!(out, "targets:          {}", self.total_targets);
        let percent = if self.total_targets > 0 {
            self.blocked as f64 / self.total_targets as f64 * 100.0
        } else {
            0.0
        };
        let _ = writeln!(out, "blocked:          {} ({:.1}%)", self.blocked, percent);
        let _ = writeln!(out, "remaining:        {}", self.remaining);
        let _ = writeln!(out, "skipped:          {}", self.skipped);
        let _ = writeln!(out, "failed:           {}", self.failed);
        let _ = writeln!(out, "retry-eligible:   {}", self.retry_eligible);
        let _ = writeln!(out, "ceiling reached:  {}", self.retry_ceiling_reached);

        if let Some(rate) = self.recent_rate_per_sec {
            let _ = writeln!(out, "recent rate:      {:.2} targets/s", rate);
        }
        if self.bottlenecked_windows > 0 {
            let _ = writeln!(
                out,
                "bottlenecks:      {} of the last windows",
                self.bottlenecked_windows
            );
        }

        if !self.by_user_state.is_empty() {
            let _ = writeln!(out, "\nfailures by user state:");
            for (state, count) in &self.by_user_state {
                let _ = writeln!(out, "  {:<14} {}", state, count);
            }
        }

        if !self.by_error_kind.is_empty() {
            let _ = writeln!(out, "\nfailures by error kind:");
            for (kind, count, samples) in &self.by_error_kind {
                let _ = writeln!(out, "  {:<20} {}", kind, count);
                for sample in samples.iter().take(3) {
                    let _ = writeln!(out, "    - {}", sample);
                }
            }
        }

        out
    }
}

/// Render the error-sample dump for diagnosis.
pub async fn render_error_samples(db: &Database, limit: i64) -> Result<String> {
    let samples = db.error_samples(limit).await?;
    if samples.is_empty() {
        return Ok("no recorded error messages".to_string());
    }

    let mut out = String::from("=== error samples ===\n");
    for (index, sample) in samples.iter().enumerate() {
        let _ = writeln!(out, "{:2}. {}", index + 1, sample);
    }
    Ok(out)
}

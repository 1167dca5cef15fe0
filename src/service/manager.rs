//! Processing manager
//!
//! The resumable pipeline: slice the target list into batches, drop
//! already-settled targets with two bulk store queries, resolve the rest
//! through the API client, apply the safety checks, block, and record
//! every outcome. Transient failures become retry candidates for the
//! auto-retry pass; permanent failures are never contacted again.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiClient, CallOutcome};
use crate::data::{
    Database, ErrorKind, NewOutcome, OutcomeStatus, ResolveOutcome, ResolvedUser, RetryCandidate,
    TargetFormat, TargetList, UserState,
};
use crate::error::{AppError, Result};
use crate::retry::{self, Classification};
use crate::service::perf::{AlertSeverity, PerfMonitor};

/// Control parameters for one run
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub batch_size: usize,
    pub delay: Duration,
    /// None processes the whole list.
    pub max_targets: Option<usize>,
    pub auto_retry: bool,
    pub retry_ceiling: i64,
    pub auto_retry_ceiling: i64,
}

/// Per-run counters, also mirrored into the session row
pub use crate::data::RunStats;

/// Orchestrates one caller session's pipeline
pub struct Manager<'a> {
    db: &'a Database,
    client: &'a ApiClient,
    cancel: CancellationToken,
}

impl<'a> Manager<'a> {
    pub fn new(db: &'a Database, client: &'a ApiClient, cancel: CancellationToken) -> Self {
        Self { db, client, cancel }
    }

    /// Run the primary pass (and the auto-retry pass when enabled).
    pub async fn run(&self, list: &TargetList, options: &RunOptions) -> Result<RunStats> {
        let targets: Vec<String> = match options.max_targets {
            Some(max) => list.users.iter().take(max).cloned().collect(),
            None => list.users.clone(),
        };

        tracing::info!(
            total = targets.len(),
            format = list.format.as_str(),
            "starting bulk block run"
        );

        let session_id = self.db.start_session(targets.len() as i64).await?;
        let mut stats = RunStats::default();
        let mut monitor = PerfMonitor::new(session_id);

        let result = self
            .process_targets(
                &targets,
                list.format,
                options,
                options.retry_ceiling,
                session_id,
                &mut stats,
                &mut monitor,
            )
            .await;

        self.db.update_session(session_id, &stats).await?;
        self.db.complete_session(session_id).await?;
        result?;

        tracing::info!(
            processed = stats.processed,
            blocked = stats.blocked,
            skipped = stats.skipped,
            errors = stats.errors,
            "primary pass complete"
        );

        if options.auto_retry && !self.cancel.is_cancelled() {
            let retry_stats = self.run_retries(options, session_id).await?;
            stats.processed += retry_stats.processed;
            stats.blocked += retry_stats.blocked;
            stats.skipped += retry_stats.skipped;
            stats.errors += retry_stats.errors;
        }

        Ok(stats)
    }

    /// Process only the store's retry candidates, with the elevated
    /// ceiling. Does not recurse into another retry pass.
    pub async fn run_retries(&self, options: &RunOptions, session_id: i64) -> Result<RunStats> {
        let candidates = self
            .db
            .list_retry_candidates(options.auto_retry_ceiling)
            .await?;

        let mut stats = RunStats::default();
        if candidates.is_empty() {
            tracing::info!("no retry candidates");
            return Ok(stats);
        }

        tracing::info!(candidates = candidates.len(), "starting auto-retry pass");

        // Candidates that already have a numeric id take the batch path;
        // handle-only rows go through the per-handle resolve.
        let (with_id, handle_only): (Vec<&RetryCandidate>, Vec<&RetryCandidate>) =
            candidates.iter().partition(|c| c.user_id.is_some());

        let ids: Vec<String> = with_id
            .iter()
            .filter_map(|c| c.user_id.clone())
            .collect();
        let handles: Vec<String> = handle_only
            .iter()
            .filter_map(|c| c.screen_name.clone())
            .collect();

        let mut monitor = PerfMonitor::new(session_id);

        if !ids.is_empty() {
            self.process_targets(
                &ids,
                TargetFormat::UserId,
                options,
                options.auto_retry_ceiling,
                session_id,
                &mut stats,
                &mut monitor,
            )
            .await?;
        }
        if !handles.is_empty() && !self.cancel.is_cancelled() {
            self.process_targets(
                &handles,
                TargetFormat::ScreenName,
                options,
                options.auto_retry_ceiling,
                session_id,
                &mut stats,
                &mut monitor,
            )
            .await?;
        }

        tracing::info!(
            processed = stats.processed,
            blocked = stats.blocked,
            skipped = stats.skipped,
            errors = stats.errors,
            "auto-retry pass complete"
        );
        Ok(stats)
    }

    /// Resolve one target and log what the upstream knows about it.
    /// Diagnostic path; writes nothing.
    pub async fn check_target(
        &self,
        identifier: &str,
        format: TargetFormat,
    ) -> Result<ResolveOutcome> {
        let outcome = match format {
            TargetFormat::ScreenName => self.client.user_by_screen_name(identifier).await?,
            TargetFormat::UserId => self.client.user_by_rest_id(identifier).await?,
        };

        match &outcome {
            ResolveOutcome::Ok(user) => {
                tracing::info!(
                    id = %user.profile.id,
                    screen_name = user.profile.screen_name.as_deref().unwrap_or("-"),
                    display_name = user.profile.display_name.as_deref().unwrap_or("-"),
                    following = user.relationship.following,
                    followed_by = user.relationship.followed_by,
                    blocking = user.relationship.blocking,
                    "target resolved"
                );
            }
            ResolveOutcome::PermanentFailure { user_state, .. } => {
                tracing::warn!(user_state = user_state.as_str(), "target is not blockable");
            }
            ResolveOutcome::TransientFailure(info) => {
                tracing::warn!(?info, "target resolve failed");
            }
        }
        Ok(outcome)
    }

    // -------------------------------------------------------------------------
    // Batch pipeline
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn process_targets(
        &self,
        targets: &[String],
        format: TargetFormat,
        options: &RunOptions,
        attempt_ceiling: i64,
        session_id: i64,
        stats: &mut RunStats,
        monitor: &mut PerfMonitor,
    ) -> Result<()> {
        let total = targets.len();

        for (batch_index, batch) in targets.chunks(options.batch_size.max(1)).enumerate() {
            if self.cancel.is_cancelled() {
                tracing::info!("cancellation requested, stopping before next batch");
                break;
            }

            let window_start = chrono::Utc::now();
            let batch_clock = std::time::Instant::now();
            let stats_before = *stats;

            let batch_vec: Vec<String> = batch.to_vec();

            // Prefilter: bulk queries for settled targets. No upstream
            // call is ever made for these.
            let permanent = self.db.get_permanent_failures(&batch_vec, format).await?;
            let successful = self.db.get_successful(&batch_vec, format).await?;
            let exhausted = self
                .db
                .get_exhausted(&batch_vec, format, attempt_ceiling)
                .await?;

            let mut workload = Vec::with_capacity(batch_vec.len());
            for target in &batch_vec {
                if let Some(failure) = permanent.get(target) {
                    tracing::debug!(
                        user = %target,
                        user_state = failure.user_state.as_str(),
                        "skipping known permanent failure"
                    );
                    stats.skipped += 1;
                    stats.processed += 1;
                } else if successful.contains(target) {
                    tracing::debug!(user = %target, "skipping already-blocked target");
                    stats.skipped += 1;
                    stats.processed += 1;
                } else if exhausted.contains(target) {
                    tracing::debug!(user = %target, "skipping target at attempt ceiling");
                    stats.skipped += 1;
                    stats.processed += 1;
                } else {
                    workload.push(target.clone());
                }
            }

            if workload.is_empty() {
                tracing::info!(
                    batch = batch_index + 1,
                    "all targets in batch already settled"
                );
                continue;
            }

            let mut resolved = match self.client.resolve_users(&workload, format).await {
                Ok(resolved) => resolved,
                // A signal during a client-side wait aborts before any new
                // upstream call; treat it as a clean stop.
                Err(_) if self.cancel.is_cancelled() => return Ok(()),
                Err(error) => return Err(error),
            };

            for target in &workload {
                if self.cancel.is_cancelled() {
                    tracing::info!("cancellation requested, stopping mid-batch");
                    return Ok(());
                }

                stats.processed += 1;
                match resolved.remove(target) {
                    Some(ResolveOutcome::Ok(user)) => {
                        self.handle_resolved(target, format, user, options, session_id, stats)
                            .await?;
                    }
                    Some(ResolveOutcome::PermanentFailure {
                        user_state,
                        user_id,
                        screen_name,
                    }) => {
                        stats.skipped += 1;
                        self.db
                            .record_outcome(&NewOutcome {
                                screen_name: screen_name
                                    .or_else(|| Self::handle_of(target, format)),
                                user_id: user_id.or_else(|| Self::id_of(target, format)),
                                display_name: None,
                                status: OutcomeStatus::Failed,
                                user_state,
                                error_kind: Some(ErrorKind::Unavailable),
                                error_message: Some(format!("user {}", user_state.as_str())),
                                http_status: None,
                                session_id,
                            })
                            .await?;
                    }
                    Some(ResolveOutcome::TransientFailure(info)) => {
                        stats.errors += 1;
                        let kind = match retry::classify(Some(&info), chrono::Utc::now()) {
                            Classification::Transient { kind, .. } => kind.error_kind(),
                            _ => ErrorKind::Unknown,
                        };
                        self.db
                            .record_outcome(&NewOutcome {
                                screen_name: Self::handle_of(target, format),
                                user_id: Self::id_of(target, format),
                                display_name: None,
                                status: OutcomeStatus::Failed,
                                user_state: UserState::Unknown,
                                error_kind: Some(kind),
                                error_message: info.message_sample(),
                                http_status: info.http_status,
                                session_id,
                            })
                            .await?;
                    }
                    None => {
                        stats.errors += 1;
                        self.db
                            .record_outcome(&NewOutcome {
                                screen_name: Self::handle_of(target, format),
                                user_id: Self::id_of(target, format),
                                display_name: None,
                                status: OutcomeStatus::Failed,
                                user_state: UserState::Unknown,
                                error_kind: Some(ErrorKind::Unknown),
                                error_message: Some("resolve returned no result".to_string()),
                                http_status: None,
                                session_id,
                            })
                            .await?;
                    }
                }
            }

            self.db.update_session(session_id, stats).await?;

            let (window, alerts) =
                monitor.observe(window_start, batch_clock.elapsed(), stats_before, *stats);
            self.db.record_perf_window(&window).await?;
            for alert in alerts {
                match alert.severity {
                    AlertSeverity::Critical => {
                        tracing::error!(alert = %alert.message, "performance degradation")
                    }
                    AlertSeverity::High | AlertSeverity::Medium => {
                        tracing::warn!(alert = %alert.message, "performance degradation")
                    }
                }
            }

            tracing::info!(
                batch = batch_index + 1,
                completed = stats.processed,
                total,
                blocked = stats.blocked,
                skipped = stats.skipped,
                errors = stats.errors,
                rate_per_sec = window.requests_per_second,
                "batch complete"
            );
        }

        Ok(())
    }

    /// Safety checks and the block call for one resolved target.
    async fn handle_resolved(
        &self,
        target: &str,
        format: TargetFormat,
        user: ResolvedUser,
        options: &RunOptions,
        session_id: i64,
        stats: &mut RunStats,
    ) -> Result<()> {
        let profile = &user.profile;
        let relationship = &user.relationship;

        // Never block follow relationships.
        if relationship.following || relationship.followed_by {
            tracing::info!(
                user = %target,
                following = relationship.following,
                followed_by = relationship.followed_by,
                "skipping: follow relationship"
            );
            stats.skipped += 1;
            self.record_skip(profile, ErrorKind::FollowRelationship, "follow relationship", session_id)
                .await?;
            return Ok(());
        }

        // Already blocked upstream: nothing to do.
        if relationship.blocking {
            tracing::info!(user = %target, "skipping: already blocking");
            stats.skipped += 1;
            self.record_skip(profile, ErrorKind::AlreadyBlocked, "already blocking", session_id)
                .await?;
            return Ok(());
        }

        tracing::info!(
            user = %target,
            id = %profile.id,
            display_name = profile.display_name.as_deref().unwrap_or("-"),
            "blocking"
        );

        let call = match self.client.block_user(&profile.id).await {
            Ok(call) => call,
            Err(error @ AppError::Auth(_)) => {
                // The recovery retry already failed inside the client.
                // Commit this target's outcome before surfacing.
                self.db
                    .record_outcome(&NewOutcome {
                        screen_name: profile.screen_name.clone(),
                        user_id: Some(profile.id.clone()),
                        display_name: profile.display_name.clone(),
                        status: OutcomeStatus::Failed,
                        user_state: UserState::Unknown,
                        error_kind: Some(ErrorKind::Auth),
                        error_message: Some("session rejected".to_string()),
                        http_status: Some(401),
                        session_id,
                    })
                    .await?;
                return Err(error);
            }
            Err(_) if self.cancel.is_cancelled() => return Ok(()),
            Err(error) => return Err(error),
        };

        match call {
            CallOutcome::Ok(_) => {
                stats.blocked += 1;
                self.db
                    .record_outcome(&NewOutcome {
                        screen_name: profile.screen_name.clone(),
                        user_id: Some(profile.id.clone()),
                        display_name: profile.display_name.clone(),
                        status: OutcomeStatus::Success,
                        user_state: UserState::Active,
                        error_kind: None,
                        error_message: None,
                        http_status: Some(200),
                        session_id,
                    })
                    .await?;
                // The block changed the relationship; drop the cached
                // snapshot so a later run re-fetches it. Profile stays.
                self.client.cache().invalidate_relationship(&profile.id);
                self.pause(options.delay).await;
            }
            CallOutcome::Failed(info) => {
                stats.errors += 1;
                match retry::classify(Some(&info), chrono::Utc::now()) {
                    Classification::Permanent(user_state) => {
                        tracing::warn!(
                            user = %target,
                            user_state = user_state.as_str(),
                            "block failed permanently"
                        );
                        self.db
                            .record_outcome(&NewOutcome {
                                screen_name: profile.screen_name.clone(),
                                user_id: Some(profile.id.clone()),
                                display_name: profile.display_name.clone(),
                                status: OutcomeStatus::Failed,
                                user_state,
                                error_kind: Some(ErrorKind::Unavailable),
                                error_message: info.message_sample(),
                                http_status: info.http_status,
                                session_id,
                            })
                            .await?;
                        // No pacing needed; nothing was throttled.
                    }
                    Classification::Transient { kind, .. } => {
                        tracing::warn!(
                            user = %target,
                            kind = ?kind,
                            status = info.http_status,
                            "block failed, retry-eligible"
                        );
                        self.db
                            .record_outcome(&NewOutcome {
                                screen_name: profile.screen_name.clone(),
                                user_id: Some(profile.id.clone()),
                                display_name: profile.display_name.clone(),
                                status: OutcomeStatus::Failed,
                                user_state: UserState::Unknown,
                                error_kind: Some(kind.error_kind()),
                                error_message: info.message_sample(),
                                http_status: info.http_status,
                                session_id,
                            })
                            .await?;
                        self.pause(options.delay).await;
                    }
                    Classification::Auth => {
                        // 401s are resolved or escalated inside the client;
                        // reaching here means the signal was ambiguous.
                        self.db
                            .record_outcome(&NewOutcome {
                                screen_name: profile.screen_name.clone(),
                                user_id: Some(profile.id.clone()),
                                display_name: profile.display_name.clone(),
                                status: OutcomeStatus::Failed,
                                user_state: UserState::Unknown,
                                error_kind: Some(ErrorKind::Auth),
                                error_message: info.message_sample(),
                                http_status: info.http_status,
                                session_id,
                            })
                            .await?;
                    }
                }
            }
        }

        Ok(())
    }

    async fn record_skip(
        &self,
        profile: &crate::data::UserProfile,
        kind: ErrorKind,
        reason: &str,
        session_id: i64,
    ) -> Result<()> {
        self.db
            .record_outcome(&NewOutcome {
                screen_name: profile.screen_name.clone(),
                user_id: Some(profile.id.clone()),
                display_name: profile.display_name.clone(),
                status: OutcomeStatus::Skipped,
                user_state: UserState::Active,
                error_kind: Some(kind),
                error_message: Some(reason.to_string()),
                http_status: None,
                session_id,
            })
            .await
    }

    fn handle_of(target: &str, format: TargetFormat) -> Option<String> {
        matches!(format, TargetFormat::ScreenName).then(|| target.to_string())
    }

    fn id_of(target: &str, format: TargetFormat) -> Option<String> {
        matches!(format, TargetFormat::UserId).then(|| target.to_string())
    }

    /// Inter-call delay; a termination signal cuts it short.
    async fn pause(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

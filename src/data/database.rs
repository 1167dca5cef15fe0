//! SQLite outcome store
//!
//! All persistence goes through this module. The store owns its schema
//! bootstrap (opening an absent file creates it), runs in WAL journal mode
//! so the reporter can read while the manager commits, and answers the
//! batch prefilter with single bulk queries instead of per-target lookups.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use super::models::*;
use crate::error::{AppError, Result};
use crate::retry;

/// Database connection pool wrapper
pub struct Database {
    pool: Pool<Sqlite>,
}

/// Aggregate totals over the outcome table
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub total: i64,
    pub success: i64,
    pub skipped: i64,
    pub failed: i64,
    pub retry_ceiling_reached: i64,
    pub retry_eligible: i64,
    pub by_user_state: Vec<(String, i64)>,
}

/// Failure histograms with sample messages per bucket
#[derive(Debug, Clone, Default)]
pub struct FailureBreakdown {
    pub by_user_state: Vec<(String, i64)>,
    pub by_error_kind: Vec<(String, i64, Vec<String>)>,
}

impl Database {
    /// Open (creating if absent) the outcome store at `path`.
    ///
    /// Open-time errors are fatal to the process; per-query errors are
    /// surfaced to the caller unchanged.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.bootstrap_schema().await?;
        Ok(db)
    }

    async fn bootstrap_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS block_outcomes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                screen_name TEXT,
                user_id TEXT,
                display_name TEXT,
                status TEXT NOT NULL,
                user_state TEXT NOT NULL DEFAULT 'unknown',
                error_kind TEXT,
                error_message TEXT,
                http_status INTEGER,
                attempts INTEGER NOT NULL DEFAULT 1,
                first_seen TEXT NOT NULL,
                last_updated TEXT NOT NULL,
                session_id INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_outcomes_user_id
             ON block_outcomes(user_id) WHERE user_id IS NOT NULL",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_outcomes_screen_name_only
             ON block_outcomes(screen_name) WHERE user_id IS NULL",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_outcomes_screen_name
             ON block_outcomes(screen_name)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_outcomes_status
             ON block_outcomes(status)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                started_at TEXT NOT NULL,
                total_targets INTEGER NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0,
                blocked INTEGER NOT NULL DEFAULT 0,
                skipped INTEGER NOT NULL DEFAULT 0,
                errors INTEGER NOT NULL DEFAULT 0,
                completed INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS perf_windows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL,
                window_start TEXT NOT NULL,
                window_end TEXT NOT NULL,
                processed INTEGER NOT NULL,
                blocked INTEGER NOT NULL,
                errors INTEGER NOT NULL,
                requests_per_second REAL NOT NULL,
                success_rate REAL NOT NULL,
                bottleneck TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_perf_windows_session
             ON perf_windows(session_id, window_end)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Outcome writes
    // -------------------------------------------------------------------------

    /// Insert-or-update the outcome row for a target.
    ///
    /// Keyed by numeric id when known, else by handle. When the id becomes
    /// known after a handle-only row exists, that row is upgraded in place
    /// rather than duplicated. Attempts grow monotonically:
    /// `max(existing + 1, 1)` per recorded attempt.
    pub async fn record_outcome(&self, outcome: &NewOutcome) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Locate an existing row: by id first, then by handle (covers the
        // handle-only row awaiting its id).
        let existing: Option<(i64, i64)> = if let Some(user_id) = &outcome.user_id {
            let by_id = sqlx::query_as::<_, (i64, i64)>(
                "SELECT id, attempts FROM block_outcomes WHERE user_id = ?",
            )
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;

            match (by_id, &outcome.screen_name) {
                (Some(row), _) => Some(row),
                (None, Some(screen_name)) => {
                    sqlx::query_as::<_, (i64, i64)>(
                        "SELECT id, attempts FROM block_outcomes
                         WHERE screen_name = ? AND user_id IS NULL",
                    )
                    .bind(screen_name)
                    .fetch_optional(&mut *tx)
                    .await?
                }
                (None, None) => None,
            }
        } else if let Some(screen_name) = &outcome.screen_name {
            sqlx::query_as::<_, (i64, i64)>(
                "SELECT id, attempts FROM block_outcomes WHERE screen_name = ?",
            )
            .bind(screen_name)
            .fetch_optional(&mut *tx)
            .await?
        } else {
            return Err(AppError::Internal(anyhow::anyhow!(
                "outcome carries neither user_id nor screen_name"
            )));
        };

        match existing {
            Some((row_id, attempts)) => {
                sqlx::query(
                    r#"
                    UPDATE block_outcomes
                    SET screen_name = COALESCE(?, screen_name),
                        user_id = COALESCE(?, user_id),
                        display_name = COALESCE(?, display_name),
                        status = ?,
                        user_state = ?,
                        error_kind = ?,
                        error_message = ?,
                        http_status = ?,
                        attempts = ?,
                        last_updated = ?,
                        session_id = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&outcome.screen_name)
                .bind(&outcome.user_id)
                .bind(&outcome.display_name)
                .bind(outcome.status.as_str())
                .bind(outcome.user_state.as_str())
                .bind(outcome.error_kind.map(|k| k.as_str()))
                .bind(&outcome.error_message)
                .bind(outcome.http_status.map(i64::from))
                .bind((attempts + 1).max(1))
                .bind(now)
                .bind(outcome.session_id)
                .bind(row_id)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO block_outcomes (
                        screen_name, user_id, display_name, status, user_state,
                        error_kind, error_message, http_status, attempts,
                        first_seen, last_updated, session_id
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?)
                    "#,
                )
                .bind(&outcome.screen_name)
                .bind(&outcome.user_id)
                .bind(&outcome.display_name)
                .bind(outcome.status.as_str())
                .bind(outcome.user_state.as_str())
                .bind(outcome.error_kind.map(|k| k.as_str()))
                .bind(&outcome.error_message)
                .bind(outcome.http_status.map(i64::from))
                .bind(now)
                .bind(now)
                .bind(outcome.session_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Bulk prefilter queries
    // -------------------------------------------------------------------------

    fn identifier_column(format: TargetFormat) -> &'static str {
        match format {
            TargetFormat::ScreenName => "screen_name",
            TargetFormat::UserId => "user_id",
        }
    }

    /// Permanent failures among `identifiers`, in a single bulk query.
    pub async fn get_permanent_failures(
        &self,
        identifiers: &[String],
        format: TargetFormat,
    ) -> Result<HashMap<String, PermanentFailure>> {
        if identifiers.is_empty() {
            return Ok(HashMap::new());
        }

        let column = Self::identifier_column(format);
        let mut query_builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {column}, user_state, error_kind, last_updated
             FROM block_outcomes
             WHERE status = 'failed'
               AND user_state IN ('suspended', 'not_found', 'deactivated')
               AND {column} IN ("
        ));
        {
            let mut separated = query_builder.separated(", ");
            for identifier in identifiers {
                separated.push_bind(identifier);
            }
        }
        query_builder.push(")");

        let rows = query_builder.build().fetch_all(&self.pool).await?;

        let mut failures = HashMap::with_capacity(rows.len());
        for row in rows {
            let identifier: String = row.get(0);
            let user_state: String = row.get(1);
            let error_kind: Option<String> = row.get(2);
            let last_updated: DateTime<Utc> = row.get(3);
            failures.insert(
                identifier,
                PermanentFailure {
                    user_state: UserState::parse_str(&user_state),
                    error_kind: error_kind.as_deref().map(ErrorKind::parse_str),
                    last_updated,
                },
            );
        }
        Ok(failures)
    }

    /// Already-blocked targets among `identifiers`, in a single bulk query.
    pub async fn get_successful(
        &self,
        identifiers: &[String],
        format: TargetFormat,
    ) -> Result<HashSet<String>> {
        if identifiers.is_empty() {
            return Ok(HashSet::new());
        }

        let column = Self::identifier_column(format);
        let mut query_builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {column} FROM block_outcomes
             WHERE status = 'success' AND {column} IN ("
        ));
        {
            let mut separated = query_builder.separated(", ");
            for identifier in identifiers {
                separated.push_bind(identifier);
            }
        }
        query_builder.push(")");

        let rows = query_builder
            .build_query_scalar::<String>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    /// Failed targets that already hit the attempt ceiling. The pipeline
    /// must not contact upstream for these again until an explicit
    /// `reset_attempts`.
    pub async fn get_exhausted(
        &self,
        identifiers: &[String],
        format: TargetFormat,
        retry_ceiling: i64,
    ) -> Result<HashSet<String>> {
        if identifiers.is_empty() {
            return Ok(HashSet::new());
        }

        let column = Self::identifier_column(format);
        let mut query_builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {column} FROM block_outcomes
             WHERE status = 'failed'
               AND user_state NOT IN ('suspended', 'not_found', 'deactivated')
               AND attempts >= "
        ));
        query_builder.push_bind(retry_ceiling);
        query_builder.push(format!(" AND {column} IN ("));
        {
            let mut separated = query_builder.separated(", ");
            for identifier in identifiers {
                separated.push_bind(identifier);
            }
        }
        query_builder.push(")");

        let rows = query_builder
            .build_query_scalar::<String>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    // -------------------------------------------------------------------------
    // Retry support
    // -------------------------------------------------------------------------

    /// Failed targets whose state is transient, whose attempt count is
    /// below `retry_ceiling`, and whose backoff interval has elapsed.
    pub async fn list_retry_candidates(&self, retry_ceiling: i64) -> Result<Vec<RetryCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT screen_name, user_id, display_name, user_state,
                   attempts, error_message, last_updated
            FROM block_outcomes
            WHERE status = 'failed'
              AND user_state NOT IN ('suspended', 'not_found', 'deactivated')
              AND attempts < ?
            ORDER BY last_updated ASC
            "#,
        )
        .bind(retry_ceiling)
        .fetch_all(&self.pool)
        .await?;

        let now = Utc::now();
        let candidates = rows
            .into_iter()
            .map(|row| RetryCandidate {
                screen_name: row.get(0),
                user_id: row.get(1),
                display_name: row.get(2),
                user_state: UserState::parse_str(row.get::<String, _>(3).as_str()),
                attempts: row.get(4),
                last_error: row.get(5),
                last_updated: row.get(6),
            })
            .filter(|candidate| {
                let required = retry::backoff(candidate.attempts.max(0) as u32);
                let elapsed = now.signed_duration_since(candidate.last_updated);
                elapsed.to_std().map(|e| e >= required).unwrap_or(false)
            })
            .collect();
        Ok(candidates)
    }

    /// Reset attempt counts (and stale error fields) so the auto-retry
    /// pass reconsiders the matching failed targets. This is the explicit
    /// reset path, distinct from the per-attempt increment.
    pub async fn reset_attempts(
        &self,
        identifiers: Option<(&[String], TargetFormat)>,
    ) -> Result<u64> {
        let affected = match identifiers {
            None => {
                sqlx::query(
                    "UPDATE block_outcomes
                     SET attempts = 0, error_message = NULL, http_status = NULL
                     WHERE status = 'failed'",
                )
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            Some((identifiers, format)) => {
                if identifiers.is_empty() {
                    return Ok(0);
                }
                let column = Self::identifier_column(format);
                let mut query_builder = QueryBuilder::<Sqlite>::new(format!(
                    "UPDATE block_outcomes
                     SET attempts = 0, error_message = NULL, http_status = NULL
                     WHERE status = 'failed' AND {column} IN ("
                ));
                {
                    let mut separated = query_builder.separated(", ");
                    for identifier in identifiers {
                        separated.push_bind(identifier);
                    }
                }
                query_builder.push(")");
                query_builder
                    .build()
                    .execute(&self.pool)
                    .await?
                    .rows_affected()
            }
        };
        Ok(affected)
    }

    // -------------------------------------------------------------------------
    // Read-only reporting queries
    // -------------------------------------------------------------------------

    /// Totals broken down by status and user-state.
    pub async fn stats(&self, retry_ceiling: i64) -> Result<StoreStats> {
        let mut stats = StoreStats::default();

        let counts = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM block_outcomes GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        for (status, count) in counts {
            stats.total += count;
            match OutcomeStatus::parse_str(&status) {
                OutcomeStatus::Success => stats.success = count,
                OutcomeStatus::Skipped => stats.skipped = count,
                OutcomeStatus::Failed => stats.failed = count,
            }
        }

        stats.retry_ceiling_reached = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM block_outcomes
             WHERE status = 'failed'
               AND user_state NOT IN ('suspended', 'not_found', 'deactivated')
               AND attempts >= ?",
        )
        .bind(retry_ceiling)
        .fetch_one(&self.pool)
        .await?;

        stats.retry_eligible = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM block_outcomes
             WHERE status = 'failed'
               AND user_state NOT IN ('suspended', 'not_found', 'deactivated')
               AND attempts < ?",
        )
        .bind(retry_ceiling)
        .fetch_one(&self.pool)
        .await?;

        stats.by_user_state = sqlx::query_as::<_, (String, i64)>(
            "SELECT user_state, COUNT(*) FROM block_outcomes GROUP BY user_state",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(stats)
    }

    /// Failure histograms with a few sample messages per error-kind bucket.
    pub async fn failure_breakdown(&self, samples_per_bucket: i64) -> Result<FailureBreakdown> {
        let mut breakdown = FailureBreakdown {
            by_user_state: sqlx::query_as::<_, (String, i64)>(
                "SELECT user_state, COUNT(*) FROM block_outcomes
                 WHERE status = 'failed' GROUP BY user_state",
            )
            .fetch_all(&self.pool)
            .await?,
            by_error_kind: Vec::new(),
        };

        let kinds = sqlx::query_as::<_, (String, i64)>(
            "SELECT COALESCE(error_kind, 'unknown'), COUNT(*) FROM block_outcomes
             WHERE status = 'failed' GROUP BY COALESCE(error_kind, 'unknown')",
        )
        .fetch_all(&self.pool)
        .await?;

        for (kind, count) in kinds {
            let samples = sqlx::query_scalar::<_, String>(
                "SELECT DISTINCT error_message FROM block_outcomes
                 WHERE status = 'failed'
                   AND COALESCE(error_kind, 'unknown') = ?
                   AND error_message IS NOT NULL
                 ORDER BY last_updated DESC
                 LIMIT ?",
            )
            .bind(&kind)
            .bind(samples_per_bucket)
            .fetch_all(&self.pool)
            .await?;
            breakdown.by_error_kind.push((kind, count, samples));
        }

        Ok(breakdown)
    }

    /// Distinct recent error messages, newest first.
    pub async fn error_samples(&self, limit: i64) -> Result<Vec<String>> {
        let samples = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT error_message FROM block_outcomes
             WHERE status = 'failed' AND error_message IS NOT NULL
             ORDER BY last_updated DESC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(samples)
    }

    /// Fetch one outcome row by identifier.
    pub async fn get_record(
        &self,
        identifier: &str,
        format: TargetFormat,
    ) -> Result<Option<OutcomeRecord>> {
        let column = Self::identifier_column(format);
        let row = sqlx::query(&format!(
            "SELECT screen_name, user_id, display_name, status, user_state,
                    error_kind, error_message, http_status, attempts,
                    first_seen, last_updated, session_id
             FROM block_outcomes WHERE {column} = ?"
        ))
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Self::row_to_record(&row)))
    }

    fn row_to_record(row: &SqliteRow) -> OutcomeRecord {
        OutcomeRecord {
            screen_name: row.get(0),
            user_id: row.get(1),
            display_name: row.get(2),
            status: OutcomeStatus::parse_str(row.get::<String, _>(3).as_str()),
            user_state: UserState::parse_str(row.get::<String, _>(4).as_str()),
            error_kind: row
                .get::<Option<String>, _>(5)
                .as_deref()
                .map(ErrorKind::parse_str),
            error_message: row.get(6),
            http_status: row.get::<Option<i64>, _>(7).map(|s| s as u16),
            attempts: row.get(8),
            first_seen: row.get(9),
            last_updated: row.get(10),
            session_id: row.get(11),
        }
    }

    /// Backdate a row's last_updated so tests can cross backoff windows.
    pub async fn set_last_updated_for_test(
        &self,
        identifier: &str,
        format: TargetFormat,
        last_updated: DateTime<Utc>,
    ) -> Result<()> {
        let column = Self::identifier_column(format);
        sqlx::query(&format!(
            "UPDATE block_outcomes SET last_updated = ? WHERE {column} = ?"
        ))
        .bind(last_updated)
        .bind(identifier)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Session log
    // -------------------------------------------------------------------------

    /// Open a session row for this run; outcomes carry its id.
    pub async fn start_session(&self, total_targets: i64) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO sessions (started_at, total_targets) VALUES (?, ?)",
        )
        .bind(Utc::now())
        .bind(total_targets)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn update_session(&self, session_id: i64, stats: &RunStats) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET processed = ?, blocked = ?, skipped = ?, errors = ?
             WHERE id = ?",
        )
        .bind(stats.processed as i64)
        .bind(stats.blocked as i64)
        .bind(stats.skipped as i64)
        .bind(stats.errors as i64)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn complete_session(&self, session_id: i64) -> Result<()> {
        sqlx::query("UPDATE sessions SET completed = 1 WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Throughput windows
    // -------------------------------------------------------------------------

    /// Persist one batch's throughput summary.
    pub async fn record_perf_window(&self, window: &PerfWindow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO perf_windows (
                session_id, window_start, window_end, processed, blocked,
                errors, requests_per_second, success_rate, bottleneck
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(window.session_id)
        .bind(window.window_start)
        .bind(window.window_end)
        .bind(window.processed)
        .bind(window.blocked)
        .bind(window.errors)
        .bind(window.requests_per_second)
        .bind(window.success_rate)
        .bind(&window.bottleneck)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent throughput windows across sessions, newest first.
    pub async fn recent_perf_windows(&self, limit: i64) -> Result<Vec<PerfWindow>> {
        let rows = sqlx::query(
            r#"
            SELECT session_id, window_start, window_end, processed, blocked,
                   errors, requests_per_second, success_rate, bottleneck
            FROM perf_windows
            ORDER BY window_end DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| PerfWindow {
                session_id: row.get(0),
                window_start: row.get(1),
                window_end: row.get(2),
                processed: row.get(3),
                blocked: row.get(4),
                errors: row.get(5),
                requests_per_second: row.get(6),
                success_rate: row.get(7),
                bottleneck: row.get(8),
            })
            .collect())
    }
}

//! # Job Repository
//!
//! Persistence for scheduled jobs. One row per key; every state change is a
//! compare-and-set on the state observed by the caller, so two writers can
//! never both move the same key into an active state.

use crate::job::{AbandonReason, Job, JobConstraints, JobKey, JobState};
use crate::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

const JOB_COLUMNS: &str = "key, state, attempt, next_run_at, constraint_spec, last_error, abandon_reason, created_at, updated_at";

/// A stored job row, or the reason it could not be decoded
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedJob {
    Valid(Job),
    Corrupt { key: String, reason: String },
}

impl DecodedJob {
    pub fn key(&self) -> &str {
        match self {
            DecodedJob::Valid(job) => job.key.as_str(),
            DecodedJob::Corrupt { key, .. } => key,
        }
    }

    pub fn into_job(self) -> Result<Job> {
        match self {
            DecodedJob::Valid(job) => Ok(job),
            DecodedJob::Corrupt { key, reason } => Err(SyncError::LedgerCorruption {
                key,
                message: reason,
            }),
        }
    }
}

/// Fields written by a state transition
#[derive(Debug, Clone, PartialEq)]
pub struct JobTransition {
    pub state: JobState,
    pub attempt: u32,
    pub next_run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub abandon_reason: Option<AbandonReason>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Repository Trait
// ============================================================================

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert `job` unless a row for its key exists. Returns whether it was inserted.
    async fn insert_if_absent(&self, job: &Job) -> Result<bool>;

    /// Overwrite the row for `job.key` if it still matches `observed`
    /// (state, attempt and abandon reason).
    async fn replace_if_state(&self, job: &Job, observed: &Job) -> Result<bool>;

    /// Apply `transition` to `observed.key` if the row still has the
    /// observed state and attempt.
    async fn update_if_state(&self, observed: &Job, transition: &JobTransition) -> Result<bool>;

    async fn find_by_key(&self, key: &str) -> Result<Option<DecodedJob>>;

    /// Queued jobs due at `now`, plus rows whose state cannot be decoded,
    /// ordered by due time then key.
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<DecodedJob>>;

    /// Force an undecodable row to a decodable Abandoned(exhausted) row so a
    /// fresh enqueue can replace it.
    async fn quarantine(&self, key: &str, reason: &str, now: DateTime<Utc>) -> Result<()>;

    /// Move Retrying jobs whose backoff has elapsed back to Queued.
    async fn promote_retrying(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Move every Running job back to Queued, due at `now`.
    async fn reset_running(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn count_by_state(&self, state: JobState) -> Result<u64>;

    /// Delete terminal jobs last updated before `before`. Upload tombstones are kept.
    async fn delete_terminal(&self, before: DateTime<Utc>) -> Result<u64>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the jobs table if it does not exist
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                key TEXT PRIMARY KEY NOT NULL,
                state TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                next_run_at INTEGER NOT NULL,
                constraint_spec TEXT NOT NULL,
                last_error TEXT,
                abandon_reason TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(state, next_run_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn decode(row: &SqliteRow) -> Result<DecodedJob> {
        let key: String = row.try_get("key")?;
        match Self::decode_fields(row, &key) {
            Ok(job) => Ok(DecodedJob::Valid(job)),
            Err(reason) => Ok(DecodedJob::Corrupt { key, reason }),
        }
    }

    fn decode_fields(row: &SqliteRow, key: &str) -> std::result::Result<Job, String> {
        let key = JobKey::parse(key).map_err(|e| e.to_string())?;

        let state: String = row.try_get("state").map_err(|e| format!("state: {}", e))?;
        let state = JobState::from_persisted(&state).map_err(|e| e.to_string())?;

        let attempt: i64 = row.try_get("attempt").map_err(|e| format!("attempt: {}", e))?;
        let attempt =
            u32::try_from(attempt).map_err(|_| format!("attempt out of range: {}", attempt))?;

        let spec: String = row
            .try_get("constraint_spec")
            .map_err(|e| format!("constraint_spec: {}", e))?;
        let constraints =
            JobConstraints::from_json(&spec).map_err(|e| format!("constraint_spec: {}", e))?;

        let last_error: Option<String> = row
            .try_get("last_error")
            .map_err(|e| format!("last_error: {}", e))?;

        let abandon_reason: Option<String> = row
            .try_get("abandon_reason")
            .map_err(|e| format!("abandon_reason: {}", e))?;
        let abandon_reason = abandon_reason
            .map(|r| r.parse::<AbandonReason>())
            .transpose()
            .map_err(|e| e.to_string())?;

        Ok(Job {
            key,
            state,
            attempt,
            constraints,
            next_run_at: timestamp(row, "next_run_at")?,
            last_error,
            abandon_reason,
            created_at: timestamp(row, "created_at")?,
            updated_at: timestamp(row, "updated_at")?,
        })
    }
}

fn timestamp(row: &SqliteRow, column: &str) -> std::result::Result<DateTime<Utc>, String> {
    let millis: i64 = row.try_get(column).map_err(|e| format!("{}: {}", column, e))?;
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| format!("{} out of range: {}", column, millis))
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    async fn insert_if_absent(&self, job: &Job) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (key, state, attempt, next_run_at, constraint_spec, last_error, abandon_reason, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO NOTHING
            "#,
        )
        .bind(job.key.as_str())
        .bind(job.state.as_str())
        .bind(i64::from(job.attempt))
        .bind(job.next_run_at.timestamp_millis())
        .bind(job.constraints.to_json()?)
        .bind(job.last_error.as_deref())
        .bind(job.abandon_reason.map(|r| r.as_str()))
        .bind(job.created_at.timestamp_millis())
        .bind(job.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn replace_if_state(&self, job: &Job, observed: &Job) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?, attempt = ?, next_run_at = ?, constraint_spec = ?,
                last_error = ?, abandon_reason = ?, created_at = ?, updated_at = ?
            WHERE key = ? AND state = ? AND attempt = ? AND abandon_reason IS ?
            "#,
        )
        .bind(job.state.as_str())
        .bind(i64::from(job.attempt))
        .bind(job.next_run_at.timestamp_millis())
        .bind(job.constraints.to_json()?)
        .bind(job.last_error.as_deref())
        .bind(job.abandon_reason.map(|r| r.as_str()))
        .bind(job.created_at.timestamp_millis())
        .bind(job.updated_at.timestamp_millis())
        .bind(job.key.as_str())
        .bind(observed.state.as_str())
        .bind(i64::from(observed.attempt))
        .bind(observed.abandon_reason.map(|r| r.as_str()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_if_state(&self, observed: &Job, transition: &JobTransition) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?, attempt = ?, next_run_at = ?, last_error = ?,
                abandon_reason = ?, updated_at = ?
            WHERE key = ? AND state = ? AND attempt = ?
            "#,
        )
        .bind(transition.state.as_str())
        .bind(i64::from(transition.attempt))
        .bind(transition.next_run_at.timestamp_millis())
        .bind(transition.last_error.as_deref())
        .bind(transition.abandon_reason.map(|r| r.as_str()))
        .bind(transition.updated_at.timestamp_millis())
        .bind(observed.key.as_str())
        .bind(observed.state.as_str())
        .bind(i64::from(observed.attempt))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<DecodedJob>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE key = ?", JOB_COLUMNS))
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<DecodedJob>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM jobs
            WHERE (state = 'queued' AND next_run_at <= ?)
               OR state NOT IN ('queued', 'running', 'retrying', 'succeeded', 'abandoned')
            ORDER BY next_run_at ASC, key ASC
            "#,
            JOB_COLUMNS
        ))
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::decode).collect()
    }

    async fn quarantine(&self, key: &str, reason: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'abandoned', abandon_reason = 'exhausted', attempt = 0,
                constraint_spec = '{}', last_error = ?,
                next_run_at = ?, created_at = ?, updated_at = ?
            WHERE key = ?
            "#,
        )
        .bind(format!("corrupt job row: {}", reason))
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .bind(key)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn promote_retrying(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET state = 'queued', updated_at = ? WHERE state = 'retrying' AND next_run_at <= ?",
        )
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn reset_running(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET state = 'queued', next_run_at = ?, updated_at = ? WHERE state = 'running'",
        )
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        debug!(reset = result.rows_affected(), "Running jobs reset to queued");
        Ok(result.rows_affected())
    }

    async fn count_by_state(&self, state: JobState) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM jobs WHERE state = ?")
            .bind(state.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get::<i64, _>("count")? as u64)
    }

    async fn delete_terminal(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE updated_at < ?
              AND (
                state = 'succeeded'
                OR (state = 'abandoned'
                    AND (abandon_reason IS NOT 'permanent' OR key NOT LIKE 'upload:%'))
              )
            "#,
        )
        .bind(before.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

//! # Job Model
//!
//! Jobs are persisted units of work identified by a key:
//!
//! - `scan`: enumerate the media source into the ledger
//! - `dispatch`: enqueue one upload job per pending item
//! - `upload:{item_id}`: transfer a single item
//!
//! ## State Machine
//!
//! ```text
//! Queued -> Running -> Succeeded
//!              |
//!              +-> Retrying -> Queued   (after backoff)
//!              +-> Abandoned            (budget exhausted or permanent failure)
//! ```
//!
//! `Failed` labels the outcome of an attempt and is never stored; the queue
//! immediately resolves it to `Retrying` or `Abandoned`.

use crate::error::TaskFailure;
use crate::{Result, SyncError};
use bridge_traits::{MediaId, NetworkInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::time::Duration;

const SCAN_KEY: &str = "scan";
const DISPATCH_KEY: &str = "dispatch";
const UPLOAD_PREFIX: &str = "upload:";

// ============================================================================
// Job Key & Kind
// ============================================================================

/// Kind of work a job performs. The key determines the kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobKind {
    Scan,
    Dispatch,
    Upload(MediaId),
}

impl JobKind {
    /// Scan and dispatch are housekeeping; they run before uploads and
    /// outside the upload concurrency cap.
    pub fn is_housekeeping(&self) -> bool {
        matches!(self, JobKind::Scan | JobKind::Dispatch)
    }

    pub fn is_upload(&self) -> bool {
        matches!(self, JobKind::Upload(_))
    }
}

/// Validated job key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    key: String,
    kind: JobKind,
}

impl JobKey {
    pub fn scan() -> Self {
        Self {
            key: SCAN_KEY.to_string(),
            kind: JobKind::Scan,
        }
    }

    pub fn dispatch() -> Self {
        Self {
            key: DISPATCH_KEY.to_string(),
            kind: JobKind::Dispatch,
        }
    }

    pub fn upload(id: &MediaId) -> Self {
        Self {
            key: format!("{}{}", UPLOAD_PREFIX, id),
            kind: JobKind::Upload(id.clone()),
        }
    }

    /// Parse a persisted key
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            SCAN_KEY => Ok(Self::scan()),
            DISPATCH_KEY => Ok(Self::dispatch()),
            _ => match s.strip_prefix(UPLOAD_PREFIX) {
                Some(id) if !id.is_empty() => Ok(Self::upload(&MediaId::new(id))),
                _ => Err(SyncError::InvalidJobKey(s.to_string())),
            },
        }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> &JobKind {
        &self.kind
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

// ============================================================================
// Job State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    /// Outcome label of a failed attempt, never persisted
    Failed,
    Retrying,
    Abandoned,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Retrying => "retrying",
            JobState::Abandoned => "abandoned",
        }
    }

    /// Parse a state read from storage. `failed` is not a resting state.
    pub fn from_persisted(s: &str) -> Result<Self> {
        match s.parse::<JobState>()? {
            JobState::Failed => Err(SyncError::InvalidStatus(s.to_string())),
            state => Ok(state),
        }
    }

    /// Counts toward the at-most-one-active-job-per-key invariant
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Running | JobState::Retrying)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Abandoned)
    }

    /// Validate a transition performed by the queue.
    ///
    /// `Running -> Queued` is crash recovery. `Queued -> Queued` and
    /// terminal `-> Queued` are replacements by `enqueue`.
    pub fn can_transition_to(&self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Queued, Running)
                | (Queued, Queued)
                | (Running, Succeeded)
                | (Running, Retrying)
                | (Running, Abandoned)
                | (Running, Queued)
                | (Retrying, Queued)
                | (Succeeded, Queued)
                | (Abandoned, Queued)
        )
    }

    pub fn validate_transition(&self, to: JobState) -> Result<()> {
        if !self.can_transition_to(to) {
            return Err(SyncError::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: to.as_str().to_string(),
                reason: format!("Cannot transition from {} to {}", self.as_str(), to.as_str()),
            });
        }
        Ok(())
    }
}

impl FromStr for JobState {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "retrying" => Ok(JobState::Retrying),
            "abandoned" => Ok(JobState::Abandoned),
            _ => Err(SyncError::InvalidStatus(s.to_string())),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job reached `Abandoned`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonReason {
    /// Retry budget used up. A later enqueue replaces the job.
    Exhausted,
    /// The failure cannot succeed on retry. Upload jobs stay as tombstones.
    Permanent,
}

impl AbandonReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbandonReason::Exhausted => "exhausted",
            AbandonReason::Permanent => "permanent",
        }
    }
}

impl FromStr for AbandonReason {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "exhausted" => Ok(AbandonReason::Exhausted),
            "permanent" => Ok(AbandonReason::Permanent),
            _ => Err(SyncError::InvalidStatus(format!("abandon reason {}", s))),
        }
    }
}

// ============================================================================
// Constraints
// ============================================================================

/// Conditions that must hold before a job may start
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConstraints {
    pub requires_network: bool,
    pub requires_unmetered: bool,
}

impl JobConstraints {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn network() -> Self {
        Self {
            requires_network: true,
            requires_unmetered: false,
        }
    }

    pub fn unmetered() -> Self {
        Self {
            requires_network: true,
            requires_unmetered: true,
        }
    }

    /// Evaluate against a network snapshot. `None` means no monitor is
    /// installed and every constraint is treated as satisfied.
    pub fn is_satisfied_by(&self, network: Option<&NetworkInfo>) -> bool {
        let Some(info) = network else {
            return true;
        };
        if (self.requires_network || self.requires_unmetered) && !info.is_connected() {
            return false;
        }
        !(self.requires_unmetered && info.is_metered)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| SyncError::Database(format!("encode constraints: {}", e)))
    }

    pub fn from_json(spec: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(spec)
    }
}

// ============================================================================
// Job
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub key: JobKey,
    pub state: JobState,
    /// Executions started so far
    pub attempt: u32,
    pub constraints: JobConstraints,
    /// Earliest time the job may be claimed, or leave Retrying
    pub next_run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub abandon_reason: Option<AbandonReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Fresh Queued instance due at `now`
    pub fn new(request: &JobRequest, now: DateTime<Utc>) -> Self {
        Self {
            key: request.key.clone(),
            state: JobState::Queued,
            attempt: 0,
            constraints: request.constraints,
            next_run_at: now,
            last_error: None,
            abandon_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn kind(&self) -> &JobKind {
        self.key.kind()
    }

    /// Abandoned upload kept so dispatch stops re-enqueueing its item
    pub fn is_tombstone(&self) -> bool {
        self.state == JobState::Abandoned
            && self.abandon_reason == Some(AbandonReason::Permanent)
            && self.kind().is_upload()
    }
}

/// Request to schedule a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub key: JobKey,
    pub constraints: JobConstraints,
}

impl JobRequest {
    pub fn new(key: JobKey, constraints: JobConstraints) -> Self {
        Self { key, constraints }
    }

    pub fn scan() -> Self {
        Self::new(JobKey::scan(), JobConstraints::none())
    }

    pub fn dispatch() -> Self {
        Self::new(JobKey::dispatch(), JobConstraints::none())
    }

    pub fn upload(id: &MediaId, constraints: JobConstraints) -> Self {
        Self::new(JobKey::upload(id), constraints)
    }
}

/// Result of [`JobQueue::enqueue`](crate::JobQueue::enqueue)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// No row existed for the key
    Inserted,
    /// An existing row was replaced with a fresh instance
    Replaced,
    /// The existing row already covers the request
    Dropped,
}

impl EnqueueOutcome {
    pub fn is_enqueued(&self) -> bool {
        !matches!(self, EnqueueOutcome::Dropped)
    }
}

/// Outcome of one task attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Retryable(TaskFailure),
    Permanent(TaskFailure),
}

/// Outcome of one upload attempt
pub type UploadOutcome = TaskOutcome;

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success)
    }

    pub fn failure(&self) -> Option<&TaskFailure> {
        match self {
            TaskOutcome::Success => None,
            TaskOutcome::Retryable(f) | TaskOutcome::Permanent(f) => Some(f),
        }
    }
}

// ============================================================================
// Retry Policy
// ============================================================================

/// Exponential backoff with deterministic jitter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed before the job is abandoned
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay used as the jitter window on each side
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    pub fn upload_default() -> Self {
        Self {
            max_attempts: 8,
            base_delay_ms: 30_000,
            max_delay_ms: 3_600_000,
            jitter_ratio: 0.2,
        }
    }

    pub fn housekeeping_default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 60_000,
            max_delay_ms: 900_000,
            jitter_ratio: 0.2,
        }
    }

    /// Whether a job that has run `attempt` times may run again
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the retry that follows attempt number `attempt` (1-based)
    pub fn delay_for(&self, key: &JobKey, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let anchor = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);

        let span = (anchor as f64 * self.jitter_ratio.clamp(0.0, 1.0)) as u64;
        if span == 0 {
            return Duration::from_millis(anchor);
        }

        let lower = anchor.saturating_sub(span);
        let upper = anchor.saturating_add(span).min(self.max_delay_ms);
        let unit = deterministic_unit(key.as_str(), attempt);
        let offset = ((upper - lower) as f64 * unit) as u64;

        Duration::from_millis(lower + offset)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(SyncError::Config("max_attempts must be at least 1".into()));
        }
        if self.base_delay_ms == 0 || self.base_delay_ms > self.max_delay_ms {
            return Err(SyncError::Config(format!(
                "base_delay_ms ({}) must be positive and at most max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(SyncError::Config(format!(
                "jitter_ratio must be within 0.0..=1.0, got {}",
                self.jitter_ratio
            )));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::upload_default()
    }
}

/// Stable value in `[0, 1]` derived from the key and attempt
fn deterministic_unit(key: &str, attempt: u32) -> f64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    attempt.hash(&mut hasher);
    hasher.finish() as f64 / u64::MAX as f64
}

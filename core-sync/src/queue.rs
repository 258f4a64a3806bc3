//! # Job Queue
//!
//! Persistent half of the scheduler: deduplicating enqueue, claiming and
//! recording outcomes. Every write is a compare-and-set on the row the
//! caller observed, retried on conflict.
//!
//! ## Dedup policy
//!
//! | Existing row            | upload  | scan / dispatch |
//! |-------------------------|---------|-----------------|
//! | none                    | insert  | insert          |
//! | Queued, Retrying        | drop    | replace         |
//! | Running                 | drop    | drop            |
//! | Succeeded               | replace | replace         |
//! | Abandoned (exhausted)   | replace | replace         |
//! | Abandoned (permanent)   | drop    | replace         |

use crate::job::{
    AbandonReason, EnqueueOutcome, Job, JobKind, JobRequest, JobState, RetryPolicy, TaskOutcome,
};
use crate::repository::{DecodedJob, JobRepository, JobTransition, SqliteJobRepository};
use crate::{JobKey, Result, SyncError};
use bridge_traits::Clock;
use chrono::{DateTime, Utc};
use core_runtime::events::{EventBus, SyncEvent};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Compare-and-set rounds before enqueue gives up on a contended key
const MAX_CAS_ROUNDS: usize = 16;

/// Job counts by persisted state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: u64,
    pub running: u64,
    pub retrying: u64,
    pub succeeded: u64,
    pub abandoned: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.queued + self.running + self.retrying + self.succeeded + self.abandoned
    }

    /// No job is waiting or running
    pub fn is_idle(&self) -> bool {
        self.queued == 0 && self.running == 0 && self.retrying == 0
    }
}

/// Jobs ready to claim, after quarantining undecodable rows
#[derive(Debug, Default)]
pub struct DueJobs {
    /// Housekeeping first, then uploads, each in due order
    pub jobs: Vec<Job>,
    pub quarantined: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnqueueDecision {
    Replace,
    Drop,
}

fn decide(existing: &Job) -> EnqueueDecision {
    let upload = existing.kind().is_upload();
    match existing.state {
        JobState::Running => EnqueueDecision::Drop,
        JobState::Queued | JobState::Retrying if upload => EnqueueDecision::Drop,
        JobState::Queued | JobState::Retrying => EnqueueDecision::Replace,
        JobState::Abandoned if existing.is_tombstone() => EnqueueDecision::Drop,
        JobState::Succeeded | JobState::Abandoned | JobState::Failed => EnqueueDecision::Replace,
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub struct JobQueue {
    repository: Arc<dyn JobRepository>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    upload_retry: RetryPolicy,
    housekeeping_retry: RetryPolicy,
}

impl JobQueue {
    /// Create a queue backed by the jobs table in `pool`
    pub async fn new(pool: SqlitePool, clock: Arc<dyn Clock>, events: EventBus) -> Result<Self> {
        let repository = SqliteJobRepository::new(pool);
        repository.initialize().await?;
        Ok(Self::with_repository(Arc::new(repository), clock, events))
    }

    /// Create a queue with a custom repository
    pub fn with_repository(
        repository: Arc<dyn JobRepository>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            repository,
            clock,
            events,
            upload_retry: RetryPolicy::upload_default(),
            housekeeping_retry: RetryPolicy::housekeeping_default(),
        }
    }

    pub fn with_retry_policies(mut self, upload: RetryPolicy, housekeeping: RetryPolicy) -> Self {
        self.upload_retry = upload;
        self.housekeeping_retry = housekeeping;
        self
    }

    pub fn retry_policy(&self, kind: &JobKind) -> &RetryPolicy {
        if kind.is_upload() {
            &self.upload_retry
        } else {
            &self.housekeeping_retry
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Schedule `request` subject to the dedup policy
    #[instrument(skip(self, request), fields(job_key = %request.key))]
    pub async fn enqueue(&self, request: JobRequest) -> Result<EnqueueOutcome> {
        for _ in 0..MAX_CAS_ROUNDS {
            let fresh = Job::new(&request, self.clock.now());

            let existing = match self.repository.find_by_key(request.key.as_str()).await? {
                None => {
                    if self.repository.insert_if_absent(&fresh).await? {
                        debug!("Job inserted");
                        return Ok(EnqueueOutcome::Inserted);
                    }
                    continue;
                }
                Some(DecodedJob::Corrupt { key, reason }) => {
                    self.quarantine(&key, &reason).await?;
                    continue;
                }
                Some(DecodedJob::Valid(job)) => job,
            };

            match decide(&existing) {
                EnqueueDecision::Drop => {
                    debug!(status = %existing.state, "Enqueue dropped, existing job covers it");
                    return Ok(EnqueueOutcome::Dropped);
                }
                EnqueueDecision::Replace => {
                    if self.repository.replace_if_state(&fresh, &existing).await? {
                        debug!(previous = %existing.state, "Job replaced");
                        self.emit_transition(&fresh.key, existing.state, JobState::Queued, 0);
                        return Ok(EnqueueOutcome::Replaced);
                    }
                }
            }
        }

        warn!("Enqueue gave up after repeated conflicts");
        Err(SyncError::InvalidStateTransition {
            from: "unknown".to_string(),
            to: JobState::Queued.as_str().to_string(),
            reason: format!("{} changed concurrently {} times", request.key, MAX_CAS_ROUNDS),
        })
    }

    /// Move a Queued job to Running and count the attempt.
    ///
    /// Returns `None` if another worker claimed or replaced it first.
    pub async fn claim(&self, job: &Job) -> Result<Option<Job>> {
        job.state.validate_transition(JobState::Running)?;

        let now = self.clock.now();
        let transition = JobTransition {
            state: JobState::Running,
            attempt: job.attempt.saturating_add(1),
            next_run_at: job.next_run_at,
            last_error: job.last_error.clone(),
            abandon_reason: None,
            updated_at: now,
        };

        if !self.repository.update_if_state(job, &transition).await? {
            debug!(job_key = %job.key, "Claim lost to a concurrent writer");
            return Ok(None);
        }

        self.emit_transition(&job.key, job.state, JobState::Running, transition.attempt);
        Ok(Some(Job {
            state: JobState::Running,
            attempt: transition.attempt,
            updated_at: now,
            ..job.clone()
        }))
    }

    /// Record the outcome of a Running job's attempt
    #[instrument(skip(self, job, outcome), fields(job_key = %job.key, attempt = job.attempt))]
    pub async fn complete(&self, job: &Job, outcome: TaskOutcome) -> Result<Job> {
        let now = self.clock.now();
        let policy = self.retry_policy(job.kind());

        let (state, next_run_at, last_error, abandon_reason) = match &outcome {
            TaskOutcome::Success => (JobState::Succeeded, job.next_run_at, None, None),
            TaskOutcome::Retryable(failure) if policy.allows_retry(job.attempt) => {
                let delay = policy.delay_for(&job.key, job.attempt);
                debug!(
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Attempt failed, backing off"
                );
                (
                    JobState::Retrying,
                    after(now, delay),
                    Some(failure.to_string()),
                    None,
                )
            }
            TaskOutcome::Retryable(failure) => (
                JobState::Abandoned,
                job.next_run_at,
                Some(failure.to_string()),
                Some(AbandonReason::Exhausted),
            ),
            TaskOutcome::Permanent(failure) => (
                JobState::Abandoned,
                job.next_run_at,
                Some(failure.to_string()),
                Some(AbandonReason::Permanent),
            ),
        };

        job.state.validate_transition(state)?;

        let transition = JobTransition {
            state,
            attempt: job.attempt,
            next_run_at,
            last_error,
            abandon_reason,
            updated_at: now,
        };

        if !self.repository.update_if_state(job, &transition).await? {
            return Err(SyncError::InvalidStateTransition {
                from: job.state.as_str().to_string(),
                to: state.as_str().to_string(),
                reason: "job row changed while running".to_string(),
            });
        }

        match (state, abandon_reason) {
            (JobState::Succeeded, _) => info!(status = %state, "Job succeeded"),
            (JobState::Abandoned, Some(reason)) => {
                warn!(
                    status = %state,
                    reason = reason.as_str(),
                    error = ?transition.last_error,
                    "Job abandoned"
                );
                self.events.emit_sync(SyncEvent::JobAbandoned {
                    job_key: job.key.to_string(),
                    reason: reason.as_str().to_string(),
                    last_error: transition.last_error.clone(),
                });
            }
            _ => {}
        }
        self.emit_transition(&job.key, job.state, state, job.attempt);

        Ok(Job {
            state,
            next_run_at,
            last_error: transition.last_error,
            abandon_reason,
            updated_at: now,
            ..job.clone()
        })
    }

    /// Move Retrying jobs whose backoff has elapsed to Queued
    pub async fn promote_due_retries(&self) -> Result<u64> {
        let promoted = self.repository.promote_retrying(self.clock.now()).await?;
        if promoted > 0 {
            debug!(promoted, "Retrying jobs promoted");
        }
        Ok(promoted)
    }

    /// Crash recovery: jobs left Running by a previous process are re-queued
    /// with their attempt count intact.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let recovered = self.repository.reset_running(self.clock.now()).await?;
        if recovered > 0 {
            info!(recovered, "Recovered interrupted jobs");
        }
        Ok(recovered)
    }

    /// Queued jobs due now, housekeeping first. Undecodable rows are
    /// quarantined and reported.
    pub async fn due_jobs(&self) -> Result<DueJobs> {
        let mut due = DueJobs::default();

        for decoded in self.repository.list_due(self.clock.now()).await? {
            match decoded {
                DecodedJob::Valid(job) => due.jobs.push(job),
                DecodedJob::Corrupt { key, reason } => {
                    self.quarantine(&key, &reason).await?;
                    due.quarantined += 1;
                }
            }
        }

        // stable: due order is kept within each group
        due.jobs.sort_by_key(|job| !job.kind().is_housekeeping());
        Ok(due)
    }

    pub async fn get(&self, key: &JobKey) -> Result<Option<Job>> {
        self.repository
            .find_by_key(key.as_str())
            .await?
            .map(DecodedJob::into_job)
            .transpose()
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            queued: self.repository.count_by_state(JobState::Queued).await?,
            running: self.repository.count_by_state(JobState::Running).await?,
            retrying: self.repository.count_by_state(JobState::Retrying).await?,
            succeeded: self.repository.count_by_state(JobState::Succeeded).await?,
            abandoned: self.repository.count_by_state(JobState::Abandoned).await?,
        })
    }

    /// Delete terminal jobs untouched for `retention`. Upload tombstones stay.
    pub async fn prune(&self, retention: Duration) -> Result<u64> {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| self.clock.now().checked_sub_signed(r))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let deleted = self.repository.delete_terminal(cutoff).await?;
        if deleted > 0 {
            info!(deleted, "Pruned terminal jobs");
        }
        Ok(deleted)
    }

    async fn quarantine(&self, key: &str, reason: &str) -> Result<()> {
        error!(job_key = key, error = reason, "Quarantining corrupt job row");
        self.repository.quarantine(key, reason, self.clock.now()).await?;
        self.events.emit_sync(SyncEvent::LedgerCorrupted {
            job_key: key.to_string(),
            message: reason.to_string(),
        });
        Ok(())
    }

    fn emit_transition(&self, key: &JobKey, from: JobState, to: JobState, attempt: u32) {
        self.events.emit_sync(SyncEvent::JobStateChanged {
            job_key: key.to_string(),
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
            attempt,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::error::{FailureKind, TaskFailure};
    use crate::job::JobConstraints;
    use bridge_traits::time::ManualClock;
    use core_runtime::events::CoreEvent;

    struct Harness {
        queue: JobQueue,
        clock: Arc<ManualClock>,
        pool: SqlitePool,
        events: EventBus,
    }

    async fn harness() -> Harness {
        let pool = create_test_pool().await.unwrap();
        let clock = Arc::new(ManualClock::at_millis(1_000_000));
        let events = EventBus::new(64);
        let queue = JobQueue::new(pool.clone(), clock.clone(), events.clone())
            .await
            .unwrap();
        Harness {
            queue,
            clock,
            pool,
            events,
        }
    }

    fn upload(id: &str) -> JobRequest {
        JobRequest::upload(&id.into(), JobConstraints::network())
    }

    fn retryable() -> TaskOutcome {
        TaskOutcome::Retryable(TaskFailure::new(FailureKind::TransientNetwork, "HTTP 503"))
    }

    async fn claim_due(queue: &JobQueue, key: &JobKey) -> Job {
        let job = queue.get(key).await.unwrap().unwrap();
        queue.claim(&job).await.unwrap().unwrap()
    }

    #[test]
    fn test_decide_matrix() {
        let now = Utc::now();
        let mut up = Job::new(&upload("1"), now);
        let mut scan = Job::new(&JobRequest::scan(), now);

        for state in [JobState::Queued, JobState::Retrying] {
            up.state = state;
            scan.state = state;
            assert_eq!(decide(&up), EnqueueDecision::Drop);
            assert_eq!(decide(&scan), EnqueueDecision::Replace);
        }

        up.state = JobState::Running;
        scan.state = JobState::Running;
        assert_eq!(decide(&up), EnqueueDecision::Drop);
        assert_eq!(decide(&scan), EnqueueDecision::Drop);

        up.state = JobState::Succeeded;
        assert_eq!(decide(&up), EnqueueDecision::Replace);

        up.state = JobState::Abandoned;
        up.abandon_reason = Some(AbandonReason::Exhausted);
        assert_eq!(decide(&up), EnqueueDecision::Replace);
        up.abandon_reason = Some(AbandonReason::Permanent);
        assert_eq!(decide(&up), EnqueueDecision::Drop);

        scan.state = JobState::Abandoned;
        scan.abandon_reason = Some(AbandonReason::Permanent);
        assert_eq!(decide(&scan), EnqueueDecision::Replace);
    }

    #[tokio::test]
    async fn test_enqueue_dedups_uploads() {
        let h = harness().await;
        assert_eq!(h.queue.enqueue(upload("1")).await.unwrap(), EnqueueOutcome::Inserted);
        assert_eq!(h.queue.enqueue(upload("1")).await.unwrap(), EnqueueOutcome::Dropped);
        assert_eq!(h.queue.stats().await.unwrap().queued, 1);
    }

    #[tokio::test]
    async fn test_enqueue_replaces_periodic_job() {
        let h = harness().await;
        h.queue.enqueue(JobRequest::scan()).await.unwrap();
        let claimed = claim_due(&h.queue, &JobKey::scan()).await;
        h.queue.complete(&claimed, retryable()).await.unwrap();

        h.clock.advance(Duration::from_secs(3_600));
        h.queue.promote_due_retries().await.unwrap();
        assert_eq!(h.queue.enqueue(JobRequest::scan()).await.unwrap(), EnqueueOutcome::Replaced);

        let job = h.queue.get(&JobKey::scan()).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempt, 0);
        assert_eq!(job.next_run_at, h.clock.now());
    }

    #[tokio::test]
    async fn test_running_job_is_never_duplicated() {
        let h = harness().await;
        h.queue.enqueue(JobRequest::dispatch()).await.unwrap();
        claim_due(&h.queue, &JobKey::dispatch()).await;

        assert_eq!(h.queue.enqueue(JobRequest::dispatch()).await.unwrap(), EnqueueOutcome::Dropped);
        let stats = h.queue.stats().await.unwrap();
        assert_eq!(stats.running, 1);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let h = harness().await;
        h.queue.enqueue(upload("1")).await.unwrap();
        let job = h.queue.get(&JobKey::upload(&"1".into())).await.unwrap().unwrap();

        let first = h.queue.claim(&job).await.unwrap();
        let second = h.queue.claim(&job).await.unwrap();
        assert_eq!(first.map(|j| j.attempt), Some(1));
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_retry_then_exhaust() {
        let h = harness().await;
        let queue = JobQueue::new(h.pool.clone(), h.clock.clone(), h.events.clone())
            .await
            .unwrap()
            .with_retry_policies(
                RetryPolicy {
                    max_attempts: 2,
                    base_delay_ms: 1_000,
                    max_delay_ms: 10_000,
                    jitter_ratio: 0.0,
                },
                RetryPolicy::housekeeping_default(),
            );
        let key = JobKey::upload(&"1".into());
        queue.enqueue(upload("1")).await.unwrap();

        let job = claim_due(&queue, &key).await;
        let retrying = queue.complete(&job, retryable()).await.unwrap();
        assert_eq!(retrying.state, JobState::Retrying);
        assert_eq!(retrying.next_run_at, h.clock.now() + chrono::Duration::seconds(1));

        // backoff not yet elapsed
        assert_eq!(queue.promote_due_retries().await.unwrap(), 0);
        h.clock.advance(Duration::from_secs(1));
        assert_eq!(queue.promote_due_retries().await.unwrap(), 1);

        let job = claim_due(&queue, &key).await;
        assert_eq!(job.attempt, 2);
        let abandoned = queue.complete(&job, retryable()).await.unwrap();
        assert_eq!(abandoned.state, JobState::Abandoned);
        assert_eq!(abandoned.abandon_reason, Some(AbandonReason::Exhausted));

        // exhausted uploads accept new intent
        assert_eq!(queue.enqueue(upload("1")).await.unwrap(), EnqueueOutcome::Replaced);
    }

    #[tokio::test]
    async fn test_permanent_failure_leaves_tombstone() {
        let h = harness().await;
        let mut events = h.events.subscribe();
        let key = JobKey::upload(&"gone".into());
        h.queue.enqueue(upload("gone")).await.unwrap();

        let job = claim_due(&h.queue, &key).await;
        let outcome = TaskOutcome::Permanent(TaskFailure::new(FailureKind::ItemGone, "deleted"));
        let abandoned = h.queue.complete(&job, outcome).await.unwrap();
        assert!(abandoned.is_tombstone());
        assert_eq!(abandoned.last_error.as_deref(), Some("item_gone: deleted"));

        assert_eq!(h.queue.enqueue(upload("gone")).await.unwrap(), EnqueueOutcome::Dropped);

        let mut saw_abandon = false;
        while let Ok(event) = events.try_recv() {
            if let CoreEvent::Sync(SyncEvent::JobAbandoned { reason, .. }) = event {
                assert_eq!(reason, "permanent");
                saw_abandon = true;
            }
        }
        assert!(saw_abandon);
    }

    #[tokio::test]
    async fn test_complete_requires_running() {
        let h = harness().await;
        h.queue.enqueue(upload("1")).await.unwrap();
        let queued = h.queue.get(&JobKey::upload(&"1".into())).await.unwrap().unwrap();

        let result = h.queue.complete(&queued, TaskOutcome::Success).await;
        assert!(matches!(result, Err(SyncError::InvalidStateTransition { .. })));
    }

    #[tokio::test]
    async fn test_recover_interrupted_keeps_attempt() {
        let h = harness().await;
        let key = JobKey::upload(&"1".into());
        h.queue.enqueue(upload("1")).await.unwrap();
        claim_due(&h.queue, &key).await;

        assert_eq!(h.queue.recover_interrupted().await.unwrap(), 1);
        let job = h.queue.get(&key).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempt, 1);
    }

    #[tokio::test]
    async fn test_due_jobs_housekeeping_first_and_quarantine() {
        let h = harness().await;
        h.queue.enqueue(upload("a")).await.unwrap();
        h.clock.advance(Duration::from_millis(5));
        h.queue.enqueue(JobRequest::scan()).await.unwrap();
        sqlx::query(
            "INSERT INTO jobs (key, state, attempt, next_run_at, constraint_spec, created_at, updated_at) VALUES ('upload:z', 'queued', -4, 0, '{}', 0, 0)",
        )
        .execute(&h.pool)
        .await
        .unwrap();

        let due = h.queue.due_jobs().await.unwrap();
        assert_eq!(due.quarantined, 1);
        let keys: Vec<&str> = due.jobs.iter().map(|j| j.key.as_str()).collect();
        assert_eq!(keys, vec!["scan", "upload:a"]);

        // quarantined row is replaceable
        assert_eq!(h.queue.enqueue(upload("z")).await.unwrap(), EnqueueOutcome::Replaced);
    }

    #[tokio::test]
    async fn test_prune_respects_retention() {
        let h = harness().await;
        h.queue.enqueue(JobRequest::dispatch()).await.unwrap();
        let job = claim_due(&h.queue, &JobKey::dispatch()).await;
        h.queue.complete(&job, TaskOutcome::Success).await.unwrap();

        assert_eq!(h.queue.prune(Duration::from_secs(60)).await.unwrap(), 0);
        h.clock.advance(Duration::from_secs(61));
        assert_eq!(h.queue.prune(Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(h.queue.stats().await.unwrap().total(), 0);
    }
}

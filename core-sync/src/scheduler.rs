//! # Scheduler
//!
//! Executing half of the job system. Each `run_due_jobs` call promotes
//! elapsed retries and claims due jobs whose constraints hold. Housekeeping
//! jobs run inline, one after another, before any upload starts. Uploads run
//! on a `JoinSet` under a semaphore of `max_concurrent_uploads`.
//!
//! A task body reports a [`TaskOutcome`]; the queue turns that into the next
//! persisted state. Only persistence failures escape as errors.

use crate::coordinator::Coordinator;
use crate::error::{FailureKind, TaskFailure};
use crate::job::{EnqueueOutcome, Job, JobKind, JobRequest, JobState, TaskOutcome};
use crate::queue::{JobQueue, QueueStats};
use crate::scanner::Scanner;
use crate::uploader::Uploader;
use crate::{Result, SyncError};
use bridge_traits::{NetworkInfo, NetworkMonitor, NetworkStatus};
use core_runtime::events::{EventBus, SyncEvent};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn, Instrument};

// ============================================================================
// Task Registry
// ============================================================================

/// Task bodies keyed by [`JobKind`]
pub struct TaskRegistry {
    scanner: Scanner,
    coordinator: Coordinator,
    uploader: Uploader,
    queue: Arc<JobQueue>,
    events: EventBus,
}

impl TaskRegistry {
    pub fn new(
        scanner: Scanner,
        coordinator: Coordinator,
        uploader: Uploader,
        queue: Arc<JobQueue>,
        events: EventBus,
    ) -> Self {
        Self {
            scanner,
            coordinator,
            uploader,
            queue,
            events,
        }
    }

    /// Run the body for `kind` once
    pub async fn execute(&self, kind: &JobKind) -> Result<TaskOutcome> {
        match kind {
            JobKind::Scan => {
                let report = self.scanner.scan().await?;
                self.events.emit_sync(SyncEvent::ScanCompleted {
                    seen: report.seen,
                    discovered: report.discovered,
                });
                if report.discovered > 0 {
                    // fresh items should not wait for the next dispatch interval
                    self.queue.enqueue(JobRequest::dispatch()).await?;
                }
                Ok(TaskOutcome::Success)
            }
            JobKind::Dispatch => {
                let enqueued = self.coordinator.dispatch().await?;
                self.events.emit_sync(SyncEvent::DispatchCompleted {
                    enqueued: enqueued as u64,
                });
                Ok(TaskOutcome::Success)
            }
            JobKind::Upload(id) => self.uploader.upload(id).await,
        }
    }
}

// ============================================================================
// Reports
// ============================================================================

/// What one `run_due_jobs` pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Retrying jobs moved back to Queued
    pub promoted: u64,
    /// Undecodable rows forced to Abandoned
    pub quarantined: u64,
    /// Due jobs left Queued because their constraints did not hold
    pub deferred: u64,
    /// Due jobs another writer claimed or replaced first
    pub skipped: u64,
    pub started: u64,
    pub succeeded: u64,
    pub retrying: u64,
    pub abandoned: u64,
}

impl RunReport {
    fn record(&mut self, state: JobState) {
        match state {
            JobState::Succeeded => self.succeeded += 1,
            JobState::Retrying => self.retrying += 1,
            JobState::Abandoned => self.abandoned += 1,
            _ => {}
        }
    }
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct Scheduler {
    queue: Arc<JobQueue>,
    registry: Arc<TaskRegistry>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    upload_permits: Arc<Semaphore>,
    events: EventBus,
    started: AtomicBool,
}

impl Scheduler {
    pub fn new(
        queue: Arc<JobQueue>,
        registry: TaskRegistry,
        network_monitor: Option<Arc<dyn NetworkMonitor>>,
        max_concurrent_uploads: usize,
        events: EventBus,
    ) -> Self {
        Self {
            queue,
            registry: Arc::new(registry),
            network_monitor,
            upload_permits: Arc::new(Semaphore::new(max_concurrent_uploads.max(1))),
            events,
            started: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Recover jobs interrupted by a previous process and schedule the
    /// periodic jobs. Returns the number of recovered jobs.
    ///
    /// # Errors
    ///
    /// Calling `start` twice is an [`SyncError::InvalidStateTransition`].
    pub async fn start(&self) -> Result<u64> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SyncError::InvalidStateTransition {
                from: "started".to_string(),
                to: "started".to_string(),
                reason: "Scheduler::start may only be called once".to_string(),
            });
        }

        let recovered = self.queue.recover_interrupted().await?;
        self.queue.enqueue(JobRequest::scan()).await?;
        self.queue.enqueue(JobRequest::dispatch()).await?;

        info!(recovered, "Scheduler started");
        Ok(recovered)
    }

    pub async fn enqueue(&self, request: JobRequest) -> Result<EnqueueOutcome> {
        self.queue.enqueue(request).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.queue.stats().await
    }

    pub async fn prune(&self, retention: Duration) -> Result<u64> {
        self.queue.prune(retention).await
    }

    /// Run every job due now and wait for each started job's transition to
    /// be written.
    ///
    /// # Errors
    ///
    /// Returns the first persistence failure. Jobs whose outcome could not
    /// be recorded stay Running and are recovered by the next `start`.
    #[instrument(skip(self))]
    pub async fn run_due_jobs(&self) -> Result<RunReport> {
        let mut report = RunReport {
            promoted: self.queue.promote_due_retries().await?,
            ..Default::default()
        };

        let due = self.queue.due_jobs().await?;
        report.quarantined = due.quarantined;
        if due.jobs.is_empty() {
            return Ok(report);
        }

        let mut snapshot = self.network_snapshot().await;
        let mut tasks = JoinSet::new();
        let mut fatal: Option<SyncError> = None;

        for job in due.jobs {
            if !job.constraints.is_satisfied_by(snapshot.as_ref()) {
                debug!(job_key = %job.key, "Constraints unmet, deferring");
                report.deferred += 1;
                continue;
            }

            let permit = if job.kind().is_upload() {
                let (permit, waited) = self.acquire_upload_permit().await?;
                if waited {
                    // network may have changed while we waited
                    snapshot = self.network_snapshot().await;
                    if !job.constraints.is_satisfied_by(snapshot.as_ref()) {
                        debug!(job_key = %job.key, "Constraints lost while waiting, deferring");
                        report.deferred += 1;
                        continue;
                    }
                }
                Some(permit)
            } else {
                None
            };

            let claimed = match self.queue.claim(&job).await {
                Ok(Some(claimed)) => claimed,
                Ok(None) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) if e.is_fatal() => {
                    fatal = Some(e);
                    break;
                }
                Err(e) => {
                    warn!(job_key = %job.key, error = %e, "Claim rejected");
                    report.skipped += 1;
                    continue;
                }
            };
            report.started += 1;

            let registry = Arc::clone(&self.registry);
            let queue = Arc::clone(&self.queue);
            let events = self.events.clone();
            let span =
                tracing::info_span!("job", job_key = %claimed.key, attempt = claimed.attempt);

            if claimed.kind().is_housekeeping() {
                // inline, so a scan's dispatch sees every item it recorded
                match run_claimed(registry, queue, events, claimed).instrument(span).await {
                    Ok(state) => report.record(state),
                    Err(e) => {
                        fatal = Some(e);
                        break;
                    }
                }
                continue;
            }

            tasks.spawn(
                async move {
                    let _permit = permit;
                    run_claimed(registry, queue, events, claimed).await
                }
                .instrument(span),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(state)) => report.record(state),
                Ok(Err(e)) => {
                    error!(error = %e, "Job outcome could not be recorded");
                    fatal.get_or_insert(e);
                }
                Err(join_error) => {
                    error!(error = %join_error, "Job task aborted");
                }
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        debug!(?report, "Run complete");
        Ok(report)
    }

    /// Returns the permit and whether the caller had to wait for it
    async fn acquire_upload_permit(&self) -> Result<(OwnedSemaphorePermit, bool)> {
        match Arc::clone(&self.upload_permits).try_acquire_owned() {
            Ok(permit) => Ok((permit, false)),
            Err(TryAcquireError::NoPermits) => {
                let permit = Arc::clone(&self.upload_permits)
                    .acquire_owned()
                    .await
                    .map_err(|e| SyncError::Config(format!("upload semaphore closed: {}", e)))?;
                Ok((permit, true))
            }
            Err(TryAcquireError::Closed) => {
                Err(SyncError::Config("upload semaphore closed".to_string()))
            }
        }
    }

    /// `None` when no monitor is installed. A failing monitor reads as
    /// indeterminate, which no network constraint accepts.
    async fn network_snapshot(&self) -> Option<NetworkInfo> {
        let monitor = self.network_monitor.as_ref()?;
        match monitor.get_network_info().await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(error = %e, "Network monitor failed");
                Some(NetworkInfo {
                    status: NetworkStatus::Indeterminate,
                    network_type: None,
                    is_metered: true,
                })
            }
        }
    }
}

/// Execute a claimed job and record its outcome
async fn run_claimed(
    registry: Arc<TaskRegistry>,
    queue: Arc<JobQueue>,
    events: EventBus,
    job: Job,
) -> Result<JobState> {
    let executed = AssertUnwindSafe(registry.execute(job.kind()))
        .catch_unwind()
        .await;

    let outcome = match executed {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) if e.is_fatal() => return Err(e),
        Ok(Err(e)) => outcome_for_error(&job, e, &events),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(job_key = %job.key, panic = %message, "Job panicked");
            TaskOutcome::Retryable(TaskFailure::new(
                FailureKind::Internal,
                format!("panicked: {}", message),
            ))
        }
    };

    match queue.complete(&job, outcome).await {
        Ok(updated) => Ok(updated.state),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!(job_key = %job.key, error = %e, "Outcome not recorded");
            Ok(job.state)
        }
    }
}

fn outcome_for_error(job: &Job, error: SyncError, events: &EventBus) -> TaskOutcome {
    let failure = TaskFailure::new(error.failure_kind(), error.to_string());
    match failure.kind {
        FailureKind::LedgerCorruption | FailureKind::ItemGone => {
            if failure.kind == FailureKind::LedgerCorruption {
                events.emit_sync(SyncEvent::LedgerCorrupted {
                    job_key: job.key.to_string(),
                    message: failure.message.clone(),
                });
            }
            TaskOutcome::Permanent(failure)
        }
        _ => TaskOutcome::Retryable(failure),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

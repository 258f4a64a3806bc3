//! Core service façade and bootstrap helpers.
//!
//! This crate wires host-provided bridge implementations (media library,
//! HTTP, network monitor, clock) into the sync engine and drives it from a
//! timer loop. Desktop apps typically enable the `desktop-shims` feature
//! (which depends on `bridge-desktop`) to get default HTTP and network
//! adapters; mobile hosts inject their own through `CoreConfig`.
//!
//! ```ignore
//! use core_runtime::config::{CoreConfig, RemoteEndpoint};
//! use core_service::{DirectoryMediaSource, SyncService};
//! use core_sync::SyncConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = CoreConfig::builder()
//!     .endpoint(RemoteEndpoint::new("https://backup.example.com/upload"))
//!     .media_library(DirectoryMediaSource::new("/home/jo/Pictures"))
//!     .build()?;
//!
//! let service = SyncService::bootstrap(config, SyncConfig::default()).await?;
//! service.start().await?;
//! service.run(CancellationToken::new()).await?;
//! ```

pub mod error;

pub use error::{CoreError, Result};

#[cfg(feature = "desktop-shims")]
pub use bridge_desktop::{DesktopNetworkMonitor, DirectoryMediaSource, ReqwestHttpClient};

use bridge_traits::{NetworkChangeStream, NetworkInfo, NetworkMonitor};
use core_runtime::config::CoreConfig;
use core_runtime::events::{CoreEvent, EventBus, ServiceEvent};
use core_runtime::logging::{redact_url, strip_path};
use core_sync::{
    create_pool, Coordinator, DatabaseConfig, JobQueue, JobRequest, LedgerStats, QueueStats,
    RunReport, Scanner, Scheduler, SqliteSyncLedger, SyncConfig, SyncLedger, TaskRegistry,
    UploadConfig, Uploader,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::Receiver;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Queue and ledger counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub queue: QueueStats,
    pub ledger: LedgerStats,
}

/// Primary façade exposed to host applications.
pub struct SyncService {
    pool: SqlitePool,
    ledger: Arc<SqliteSyncLedger>,
    scheduler: Arc<Scheduler>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    events: EventBus,
    config: SyncConfig,
}

impl SyncService {
    /// Open the database and build every sync component.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration or when the database can not be
    /// opened and initialized.
    pub async fn bootstrap(core: CoreConfig, config: SyncConfig) -> Result<Self> {
        core.validate()?;
        config.validate()?;

        if let Some(parent) = core.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    CoreError::InitializationFailed(format!(
                        "cannot create database directory: {}",
                        e
                    ))
                })?;
            }
        }

        let database = core.database_path.to_string_lossy().into_owned();
        info!(
            database = %strip_path(&database),
            endpoint = %redact_url(&core.endpoint.url),
            "Bootstrapping sync service"
        );

        let pool = create_pool(DatabaseConfig::new(&core.database_path)).await?;
        let events = EventBus::default();

        let ledger = Arc::new(SqliteSyncLedger::new(pool.clone()).with_events(events.clone()));
        ledger.initialize().await?;

        let queue = Arc::new(
            JobQueue::new(pool.clone(), core.clock.clone(), events.clone())
                .await?
                .with_retry_policies(config.upload_retry, config.housekeeping_retry),
        );

        let scanner = Scanner::new(core.media_source.clone(), ledger.clone(), core.clock.clone());
        let coordinator =
            Coordinator::new(ledger.clone(), queue.clone(), config.upload_constraints());
        let uploader = Uploader::new(
            core.content_source.clone(),
            core.http_client.clone(),
            ledger.clone(),
            core.clock.clone(),
            events.clone(),
            UploadConfig::from_endpoint(&core.endpoint, &config),
        );
        let registry =
            TaskRegistry::new(scanner, coordinator, uploader, queue.clone(), events.clone());
        let scheduler = Scheduler::new(
            queue,
            registry,
            core.network_monitor.clone(),
            config.max_concurrent_uploads,
            events.clone(),
        );

        Ok(Self {
            pool,
            ledger,
            scheduler: Arc::new(scheduler),
            network_monitor: core.network_monitor,
            events,
            config,
        })
    }

    /// Recover interrupted jobs and schedule the first scan and dispatch.
    ///
    /// Returns the number of recovered jobs. May only be called once.
    pub async fn start(&self) -> Result<u64> {
        let recovered = self.scheduler.start().await?;
        self.events.emit_service(ServiceEvent::Started {
            recovered_jobs: recovered,
        });
        Ok(recovered)
    }

    /// Run one scheduling pass now
    pub async fn run_due_jobs(&self) -> Result<RunReport> {
        Ok(self.scheduler.run_due_jobs().await?)
    }

    /// Drive the scheduler until `shutdown` is cancelled or persistence fails.
    ///
    /// Jobs in flight at cancellation stay Running and are recovered by the
    /// next `start`.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut tick = every(self.config.tick_interval(), Duration::ZERO);
        let mut scan = every(self.config.scan_interval(), self.config.scan_interval());
        let mut dispatch = every(self.config.dispatch_interval(), self.config.dispatch_interval());
        let mut changes = self.network_changes().await;

        info!(
            tick_secs = self.config.tick_interval_secs,
            network_aware = changes.is_some(),
            "Sync loop running"
        );

        let outcome = loop {
            let step = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = tick.tick() => Step::RunDue,
                _ = scan.tick() => Step::Scan,
                _ = dispatch.tick() => Step::DispatchAndPrune,
                info = next_network_change(&mut changes) => {
                    if !info.is_connected() {
                        continue;
                    }
                    debug!(network = ?info.network_type, "Network available, running due jobs");
                    Step::RunDue
                }
            };

            // dropping a pass aborts its uploads; their jobs stay Running
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                result = self.perform(step) => result,
            };

            if let Err(e) = result {
                if e.is_fatal() {
                    break Err(e);
                }
                warn!(error = %e, "Sync loop step failed");
            }
        };

        match &outcome {
            Ok(()) => {
                info!("Sync loop stopped");
                self.events.emit_service(ServiceEvent::Stopped);
            }
            Err(e) => {
                error!(error = %e, "Sync loop stopped on fatal error");
                self.events.emit_service(ServiceEvent::Fatal {
                    message: e.to_string(),
                });
            }
        }
        outcome
    }

    pub async fn stats(&self) -> Result<SyncStats> {
        Ok(SyncStats {
            queue: self.scheduler.stats().await?,
            ledger: self.ledger.stats().await?,
        })
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        self.scheduler.queue()
    }

    pub fn ledger(&self) -> &Arc<SqliteSyncLedger> {
        &self.ledger
    }

    /// Close the database pool. The service is unusable afterwards.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn perform(&self, step: Step) -> Result<()> {
        match step {
            Step::RunDue => self.run_pass().await,
            Step::Scan => self.enqueue(JobRequest::scan()).await,
            Step::DispatchAndPrune => self.dispatch_and_prune().await,
        }
    }

    async fn run_pass(&self) -> Result<()> {
        let report = self.scheduler.run_due_jobs().await?;
        if report.started > 0 || report.deferred > 0 {
            debug!(?report, "Pass complete");
        }
        Ok(())
    }

    async fn enqueue(&self, request: JobRequest) -> Result<()> {
        self.scheduler.enqueue(request).await?;
        Ok(())
    }

    async fn dispatch_and_prune(&self) -> Result<()> {
        self.scheduler.enqueue(JobRequest::dispatch()).await?;
        self.scheduler.prune(self.config.job_retention()).await?;
        Ok(())
    }

    async fn network_changes(&self) -> Option<Box<dyn NetworkChangeStream>> {
        let monitor = self.network_monitor.as_ref()?;
        match monitor.subscribe_changes().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(error = %e, "Network change subscription unavailable");
                None
            }
        }
    }
}

/// Work selected by one turn of the run loop
#[derive(Debug, Clone, Copy)]
enum Step {
    RunDue,
    Scan,
    DispatchAndPrune,
}

fn every(period: Duration, delay: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + delay, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Pending forever once the stream is gone
async fn next_network_change(changes: &mut Option<Box<dyn NetworkChangeStream>>) -> NetworkInfo {
    if let Some(stream) = changes {
        if let Some(info) = stream.next().await {
            return info;
        }
        debug!("Network change stream closed");
        *changes = None;
    }
    std::future::pending().await
}

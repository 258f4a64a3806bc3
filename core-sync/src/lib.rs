//! # Sync Engine
//!
//! Backs up every media item on the device to a remote endpoint, exactly
//! once in steady state and at least once across crashes.
//!
//! ## Overview
//!
//! - Discovering items through the host's `MediaSource`
//! - Recording them in a durable ledger
//! - Scheduling one upload job per pending item
//! - Streaming item bytes to the endpoint with retries and backoff
//!
//! ## Components
//!
//! - **Ledger** (`ledger`): Items and their upload acknowledgments
//! - **Jobs** (`job`, `repository`, `queue`): Persisted jobs with dedup by key and CAS transitions
//! - **Scanner** (`scanner`): Enumerates the media source into the ledger
//! - **Coordinator** (`coordinator`): Enqueues uploads for pending items
//! - **Uploader** (`uploader`): Chunked streaming upload of one item
//! - **Scheduler** (`scheduler`): Constraint checks, concurrency and task dispatch

pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod job;
pub mod ledger;
pub mod queue;
pub mod repository;
pub mod scanner;
pub mod scheduler;
pub mod uploader;

pub use config::SyncConfig;
pub use coordinator::Coordinator;
pub use db::{create_pool, create_test_pool, DatabaseConfig};
pub use error::{FailureKind, Result, SyncError, TaskFailure};
pub use job::{
    AbandonReason, EnqueueOutcome, Job, JobConstraints, JobKey, JobKind, JobRequest, JobState,
    RetryPolicy, TaskOutcome, UploadOutcome,
};
pub use ledger::{LedgerStats, MediaItem, SqliteSyncLedger, SyncLedger};
pub use queue::{DueJobs, JobQueue, QueueStats};
pub use repository::{DecodedJob, JobRepository, JobTransition, SqliteJobRepository};
pub use scanner::{ScanReport, Scanner};
pub use scheduler::{RunReport, Scheduler, TaskRegistry};
pub use uploader::{UploadConfig, Uploader};

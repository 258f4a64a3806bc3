//! Sync engine tuning.

use crate::job::{JobConstraints, RetryPolicy};
use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sync engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upload jobs allowed to run at once
    pub max_concurrent_uploads: usize,

    /// Deadline for a single upload attempt (seconds)
    pub upload_timeout_secs: u64,

    /// Largest chunk read from an item per body write (bytes)
    pub chunk_size_bytes: usize,

    /// Chunks buffered between the reader and the request body
    pub buffered_chunks: usize,

    /// How often due jobs are run (seconds)
    pub tick_interval_secs: u64,

    /// How often a scan is enqueued (seconds)
    pub scan_interval_secs: u64,

    /// How often a dispatch is enqueued (seconds)
    pub dispatch_interval_secs: u64,

    /// How long terminal jobs are kept before pruning (seconds)
    pub job_retention_secs: u64,

    /// Whether to upload only on unmetered networks (WiFi)
    pub wifi_only: bool,

    pub upload_retry: RetryPolicy,

    pub housekeeping_retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 3,
            upload_timeout_secs: 600,
            chunk_size_bytes: 64 * 1024,
            buffered_chunks: 4,
            tick_interval_secs: 30,
            scan_interval_secs: 900,
            dispatch_interval_secs: 900,
            job_retention_secs: 7 * 24 * 3600,
            wifi_only: false,
            upload_retry: RetryPolicy::upload_default(),
            housekeeping_retry: RetryPolicy::housekeeping_default(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_uploads == 0 {
            return Err(SyncError::Config(
                "max_concurrent_uploads must be at least 1".into(),
            ));
        }
        if self.chunk_size_bytes == 0 || self.buffered_chunks == 0 {
            return Err(SyncError::Config(
                "chunk_size_bytes and buffered_chunks must be positive".into(),
            ));
        }
        for (name, secs) in [
            ("upload_timeout_secs", self.upload_timeout_secs),
            ("tick_interval_secs", self.tick_interval_secs),
            ("scan_interval_secs", self.scan_interval_secs),
            ("dispatch_interval_secs", self.dispatch_interval_secs),
        ] {
            if secs == 0 {
                return Err(SyncError::Config(format!("{} must be positive", name)));
            }
        }
        self.upload_retry.validate()?;
        self.housekeeping_retry.validate()?;
        Ok(())
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    /// Constraints attached to every upload job
    pub fn upload_constraints(&self) -> JobConstraints {
        if self.wifi_only {
            JobConstraints::unmetered()
        } else {
            JobConstraints::network()
        }
    }
}

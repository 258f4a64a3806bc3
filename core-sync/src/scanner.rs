//! Media scanner: records every item the media source reports.

use crate::ledger::SyncLedger;
use crate::{Result, SyncError};
use bridge_traits::{Clock, MediaSource};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Totals for one scan pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Entries reported by the media source
    pub seen: u64,
    /// Entries that were new to the ledger
    pub discovered: u64,
}

pub struct Scanner {
    source: Arc<dyn MediaSource>,
    ledger: Arc<dyn SyncLedger>,
    clock: Arc<dyn Clock>,
}

impl Scanner {
    pub fn new(
        source: Arc<dyn MediaSource>,
        ledger: Arc<dyn SyncLedger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            ledger,
            clock,
        }
    }

    /// Enumerate the media source to completion.
    ///
    /// # Errors
    ///
    /// - [`SyncError::SourceUnavailable`] if the cursor cannot be opened or advanced
    /// - [`SyncError::Database`] if a ledger write fails
    #[instrument(skip(self))]
    pub async fn scan(&self) -> Result<ScanReport> {
        let mut cursor = self.source.enumerate().await.map_err(|e| {
            warn!(error = %e, "Media source enumeration failed");
            SyncError::SourceUnavailable(e.to_string())
        })?;

        let mut report = ScanReport::default();
        loop {
            let entry = match cursor.next().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, seen = report.seen, "Media cursor failed mid-scan");
                    return Err(SyncError::SourceUnavailable(e.to_string()));
                }
            };

            report.seen += 1;
            if self.ledger.upsert_discovered(&entry.id, self.clock.now()).await? {
                report.discovered += 1;
                debug!(item_id = %entry.id, "New item");
            }
        }

        info!(seen = report.seen, discovered = report.discovered, "Scan complete");
        Ok(report)
    }
}

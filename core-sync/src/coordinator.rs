//! # Dispatch Coordinator
//!
//! Turns pending ledger items into upload jobs. The queue's dedup policy
//! makes repeated passes cheap: items that already have an active job or a
//! tombstone enqueue nothing.

use crate::job::{JobConstraints, JobRequest};
use crate::ledger::SyncLedger;
use crate::queue::JobQueue;
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub struct Coordinator {
    ledger: Arc<dyn SyncLedger>,
    queue: Arc<JobQueue>,
    upload_constraints: JobConstraints,
}

impl Coordinator {
    pub fn new(
        ledger: Arc<dyn SyncLedger>,
        queue: Arc<JobQueue>,
        upload_constraints: JobConstraints,
    ) -> Self {
        Self {
            ledger,
            queue,
            upload_constraints,
        }
    }

    /// Enqueue an upload job for every pending item.
    ///
    /// Returns the number of jobs inserted or replaced.
    #[instrument(skip(self))]
    pub async fn dispatch(&self) -> Result<usize> {
        let pending = self.ledger.list_pending().await?;
        let mut enqueued = 0;

        for item in &pending {
            let outcome = self
                .queue
                .enqueue(JobRequest::upload(&item.id, self.upload_constraints))
                .await?;
            if outcome.is_enqueued() {
                enqueued += 1;
                debug!(item_id = %item.id, ?outcome, "Upload scheduled");
            }
        }

        info!(pending = pending.len(), enqueued, "Dispatch complete");
        Ok(enqueued)
    }
}

//! # Event Bus System
//!
//! Provides an event-driven view of the sync engine using `tokio::sync::broadcast`.
//! Hosts subscribe to observe progress without polling the queue.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: Strongly-typed enum hierarchies per domain
//! - **EventBus**: Central broadcast channel for publishing events
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     emit      ┌───────────┐
//! │  Scheduler  ├──────────────>│           │
//! └─────────────┘               │ EventBus  │     subscribe    ┌────────────┐
//!                               │ (broadcast├─────────────────>│ Subscriber │
//! ┌─────────────┐     emit      │  channel) │                  └────────────┘
//! │ SyncService ├──────────────>│           │
//! └─────────────┘               └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{EventBus, SyncEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut subscriber = event_bus.subscribe();
//!
//! event_bus.emit_sync(SyncEvent::UploadSucceeded {
//!     item_id: "42".to_string(),
//! });
//!
//! let received = subscriber.recv().await.unwrap();
//! assert_eq!(received.description(), "Item uploaded");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   This is non-fatal; the subscriber can continue receiving new events.
//! - **`RecvError::Closed`**: All senders have been dropped. This indicates shutdown.
//!
//! Emitting never blocks and never fails. An event emitted while nobody is
//! subscribed is dropped.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

// Re-export commonly used types
pub use tokio::sync::broadcast::error::RecvError;
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Queue and upload activity
    Sync(SyncEvent),
    /// Service lifecycle
    Service(ServiceEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Sync(e) => e.description(),
            CoreEvent::Service(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Sync(SyncEvent::LedgerCorrupted { .. }) => EventSeverity::Error,
            CoreEvent::Service(ServiceEvent::Fatal { .. }) => EventSeverity::Error,
            CoreEvent::Sync(SyncEvent::JobAbandoned { .. }) => EventSeverity::Warning,
            CoreEvent::Sync(SyncEvent::UploadSucceeded { .. })
            | CoreEvent::Sync(SyncEvent::ScanCompleted { .. })
            | CoreEvent::Sync(SyncEvent::DispatchCompleted { .. }) => EventSeverity::Info,
            CoreEvent::Service(_) => EventSeverity::Info,
            CoreEvent::Sync(SyncEvent::JobStateChanged { .. }) => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    /// Debug-level events (verbose)
    Debug,
    /// Informational events
    Info,
    /// Warning events
    Warning,
    /// Error events
    Error,
}

// ============================================================================
// Sync Events
// ============================================================================

/// Events raised by the scanner, coordinator and scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SyncEvent {
    /// A scan pass finished.
    ScanCompleted {
        /// Entries the media source reported.
        seen: u64,
        /// Entries that were new to the ledger.
        discovered: u64,
    },
    /// A dispatch pass finished.
    DispatchCompleted {
        /// Upload jobs inserted or replaced.
        enqueued: u64,
    },
    /// A job moved between persisted states.
    JobStateChanged {
        job_key: String,
        from: String,
        to: String,
        attempt: u32,
    },
    /// The remote acknowledged an item and the ledger recorded it.
    UploadSucceeded { item_id: String },
    /// A job reached Abandoned and will not run again.
    JobAbandoned {
        job_key: String,
        /// `exhausted` or `permanent`
        reason: String,
        last_error: Option<String>,
    },
    /// A persisted row could not be decoded. Job rows are quarantined, item
    /// rows (keyed `item:<id>`) are skipped until repaired.
    LedgerCorrupted { job_key: String, message: String },
}

impl SyncEvent {
    fn description(&self) -> &str {
        match self {
            SyncEvent::ScanCompleted { .. } => "Scan completed",
            SyncEvent::DispatchCompleted { .. } => "Dispatch completed",
            SyncEvent::JobStateChanged { .. } => "Job state changed",
            SyncEvent::UploadSucceeded { .. } => "Item uploaded",
            SyncEvent::JobAbandoned { .. } => "Job abandoned",
            SyncEvent::LedgerCorrupted { .. } => "Corrupt ledger row",
        }
    }
}

// ============================================================================
// Service Events
// ============================================================================

/// Events raised by the service run loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ServiceEvent {
    /// Crash recovery finished and periodic jobs are enqueued.
    Started { recovered_jobs: u64 },
    /// The run loop observed its shutdown signal.
    Stopped,
    /// The run loop stopped on an unrecoverable persistence error.
    Fatal { message: String },
}

impl ServiceEvent {
    fn description(&self) -> &str {
        match self {
            ServiceEvent::Started { .. } => "Sync service started",
            ServiceEvent::Stopped => "Sync service stopped",
            ServiceEvent::Fatal { .. } => "Sync service failed",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Uses `tokio::sync::broadcast` internally, which provides:
/// - Multiple producers (clone the `EventBus`)
/// - Multiple consumers (each `subscribe()` creates a new receiver)
/// - Non-blocking sends (events are cloned for each subscriber)
/// - Lagging detection (slow subscribers get `RecvError::Lagged`)
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to current subscribers, if any.
    pub fn emit(&self, event: CoreEvent) {
        // only fails when nobody is subscribed
        self.sender.send(event).ok();
    }

    pub fn emit_sync(&self, event: SyncEvent) {
        self.emit(CoreEvent::Sync(event));
    }

    pub fn emit_service(&self, event: ServiceEvent) {
        self.emit(CoreEvent::Service(event));
    }

    /// Creates a new subscriber to receive events.
    ///
    /// Each call creates an independent receiver that will receive all future events.
    /// Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

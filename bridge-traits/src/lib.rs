//! # Host Bridge Traits
//!
//! Platform abstraction traits that must be implemented by each host platform.
//!
//! ## Overview
//!
//! This crate defines the contract between the backup core and the host it
//! runs on. Each trait represents a capability that the core requires but
//! that must be implemented differently per platform (desktop, iOS, Android).
//!
//! ## Traits
//!
//! ### Media
//! - [`MediaSource`](media::MediaSource) - Enumerate the device's photos and videos
//! - [`ContentSource`](media::ContentSource) - Open an item's bytes for streaming
//!
//! ### Networking
//! - [`HttpClient`](http::HttpClient) - Streamed uploads to the remote endpoint
//! - [`NetworkMonitor`](network::NetworkMonitor) - Connectivity and metered network detection
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//!
//! ## Platform Requirements
//!
//! | Platform | Implementation Crate | Status |
//! |----------|---------------------|--------|
//! | Desktop  | `bridge-desktop`    | ✅ In Progress |
//! | iOS      | TBD                 | 📋 Planned |
//! | Android  | TBD                 | 📋 Planned |
//!
//! ## Fail-Fast Strategy
//!
//! The core fails fast with descriptive errors when a required capability is
//! missing:
//!
//! ```ignore
//! let media_source = config.media_source
//!     .ok_or_else(|| Error::CapabilityMissing {
//!         capability: "MediaSource".to_string(),
//!         message: "No media source provided. \
//!                  Desktop: point the config at a pictures directory. \
//!                  Mobile: inject the platform media store adapter.".to_string()
//!     })?;
//! ```
//!
//! ## Error Handling
//!
//! All bridge traits use the [`BridgeError`](error::BridgeError) type. Of note:
//!
//! - [`ContentSource::open_stream`](media::ContentSource::open_stream) reports a
//!   deleted item as `NotFound`, which the core treats as permanent
//! - Transport failures are `Network` or `Timeout`, which the core retries
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` bounds to support safe concurrent usage
//! across async tasks.

pub mod error;
pub mod http;
pub mod media;
pub mod network;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use http::{ByteStream, HttpClient, HttpMethod, HttpRequest, HttpResponse, UploadBody};
pub use media::{
    ContentSource, MediaContent, MediaCursor, MediaEntry, MediaId, MediaMetadata, MediaSource,
    VecMediaCursor,
};
pub use network::{NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType};
pub use time::{Clock, ManualClock, SystemClock};

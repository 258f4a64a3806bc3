//! Media Enumeration and Content Access
//!
//! Read-only view of the device's media store. The core never writes to it;
//! it only enumerates what exists and opens byte streams for upload.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::error::Result;

/// Dynamic async reader used for item content.
pub type DynAsyncRead = dyn tokio::io::AsyncRead + Send + Unpin;

/// Stable identifier of a media item as reported by the media source.
///
/// The id is opaque to the core: a row id on mobile, a relative path on
/// desktop. Content is identified by id only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaId(String);

impl MediaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MediaId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MediaId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Descriptive metadata reported alongside an id during enumeration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub display_name: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
}

/// One enumerated media item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEntry {
    pub id: MediaId,
    pub metadata: MediaMetadata,
}

impl MediaEntry {
    pub fn new(id: impl Into<MediaId>) -> Self {
        Self {
            id: id.into(),
            metadata: MediaMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: MediaMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Pull-based cursor over one enumeration pass.
///
/// A cursor is finite and cannot be restarted; callers that need a fresh
/// view call [`MediaSource::enumerate`] again.
#[async_trait]
pub trait MediaCursor: Send {
    /// Next entry, or `None` once the pass is exhausted.
    async fn next(&mut self) -> Result<Option<MediaEntry>>;
}

/// Media enumeration trait
///
/// Platform equivalents:
/// - **Android**: `MediaStore` content provider query
/// - **iOS**: `PHAsset` fetch results
/// - **Desktop**: recursive listing of a pictures directory
///
/// Implementations may page internally and be slow; the core consumes the
/// cursor to completion once per scan.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Begin a new enumeration pass over every currently discoverable item.
    async fn enumerate(&self) -> Result<Box<dyn MediaCursor>>;
}

/// Readable content of a single item
pub struct MediaContent {
    pub reader: Box<DynAsyncRead>,
    pub file_name: String,
    pub mime_type: String,
    /// Byte length when the host knows it up front
    pub length: Option<u64>,
}

impl fmt::Debug for MediaContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaContent")
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Content access trait
///
/// `open_stream` must return [`BridgeError::NotFound`](crate::BridgeError::NotFound)
/// when the item no longer exists on the device; any other error is treated
/// as a temporary failure to read.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn open_stream(&self, id: &MediaId) -> Result<MediaContent>;
}

/// Cursor over an already materialized page of entries.
#[derive(Debug, Default)]
pub struct VecMediaCursor {
    entries: VecDeque<MediaEntry>,
}

impl VecMediaCursor {
    pub fn new(entries: impl IntoIterator<Item = MediaEntry>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }
}

#[async_trait]
impl MediaCursor for VecMediaCursor {
    async fn next(&mut self) -> Result<Option<MediaEntry>> {
        Ok(self.entries.pop_front())
    }
}

//! # Sync Ledger
//!
//! Durable record of every media item seen on the device and whether the
//! remote has acknowledged it.
//!
//! ## Invariants
//!
//! - An item is inserted once, on first observation, and never deleted.
//! - `uploaded_at`, once set, is never overwritten and is never earlier than
//!   `discovered_at`.
//! - Every operation is a single SQL statement.

use crate::{Result, SyncError};
use async_trait::async_trait;
use bridge_traits::MediaId;
use chrono::{DateTime, Utc};
use core_runtime::events::{EventBus, SyncEvent};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, error, warn};

// ============================================================================
// Types
// ============================================================================

/// One media item known to the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub id: MediaId,
    pub discovered_at: DateTime<Utc>,
    pub uploaded_at: Option<DateTime<Utc>>,
}

impl MediaItem {
    pub fn is_pending(&self) -> bool {
        self.uploaded_at.is_none()
    }
}

/// Ledger item counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub total: u64,
    pub pending: u64,
    pub uploaded: u64,
}

// ============================================================================
// Ledger Trait
// ============================================================================

#[async_trait]
pub trait SyncLedger: Send + Sync {
    /// Record `id` as discovered at `when` unless it is already known.
    ///
    /// Returns `true` when the item was newly inserted.
    async fn upsert_discovered(&self, id: &MediaId, when: DateTime<Utc>) -> Result<bool>;

    /// Record the remote acknowledgment of `id`.
    ///
    /// Unknown ids and already uploaded items are left untouched.
    async fn mark_uploaded(&self, id: &MediaId, when: DateTime<Utc>) -> Result<()>;

    /// Items without an acknowledgment, ordered by discovery time then id
    async fn list_pending(&self) -> Result<Vec<MediaItem>>;

    async fn exists(&self, id: &MediaId) -> Result<bool>;

    async fn get(&self, id: &MediaId) -> Result<Option<MediaItem>>;

    async fn stats(&self) -> Result<LedgerStats>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

pub struct SqliteSyncLedger {
    pool: SqlitePool,
    events: Option<EventBus>,
}

impl SqliteSyncLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, events: None }
    }

    /// Report rows skipped as undecodable on `events`
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Create the items table if it does not exist
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id TEXT PRIMARY KEY NOT NULL,
                discovered_at INTEGER NOT NULL,
                uploaded_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_items_pending ON items(discovered_at, id) WHERE uploaded_at IS NULL",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn decode_item(row: &SqliteRow) -> Result<MediaItem> {
        let id: String = row.try_get("id")?;
        let corrupt = |message: String| SyncError::LedgerCorruption {
            key: id.clone(),
            message,
        };

        let discovered_millis: i64 = row
            .try_get("discovered_at")
            .map_err(|e| corrupt(format!("discovered_at: {}", e)))?;
        let discovered_at = DateTime::from_timestamp_millis(discovered_millis)
            .ok_or_else(|| corrupt(format!("discovered_at out of range: {}", discovered_millis)))?;

        let uploaded_millis: Option<i64> = row
            .try_get("uploaded_at")
            .map_err(|e| corrupt(format!("uploaded_at: {}", e)))?;
        let uploaded_at = match uploaded_millis {
            Some(millis) => Some(
                DateTime::from_timestamp_millis(millis)
                    .ok_or_else(|| corrupt(format!("uploaded_at out of range: {}", millis)))?,
            ),
            None => None,
        };

        Ok(MediaItem {
            id: MediaId::new(id.clone()),
            discovered_at,
            uploaded_at,
        })
    }
}

#[async_trait]
impl SyncLedger for SqliteSyncLedger {
    async fn upsert_discovered(&self, id: &MediaId, when: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO items (id, discovered_at, uploaded_at) VALUES (?, ?, NULL) ON CONFLICT(id) DO NOTHING",
        )
        .bind(id.as_str())
        .bind(when.timestamp_millis())
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        if inserted {
            debug!(item_id = %id, "Discovered new item");
        }
        Ok(inserted)
    }

    async fn mark_uploaded(&self, id: &MediaId, when: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE items
            SET uploaded_at = MAX(?, discovered_at)
            WHERE id = ? AND uploaded_at IS NULL
            "#,
        )
        .bind(when.timestamp_millis())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            if self.exists(id).await? {
                debug!(item_id = %id, "Item already marked uploaded");
            } else {
                warn!(item_id = %id, "mark_uploaded for unknown item ignored");
            }
        }

        Ok(())
    }

    async fn list_pending(&self) -> Result<Vec<MediaItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, discovered_at, uploaded_at FROM items
            WHERE uploaded_at IS NULL
            ORDER BY discovered_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            match Self::decode_item(row) {
                Ok(item) => items.push(item),
                Err(SyncError::LedgerCorruption { key, message }) => {
                    error!(item_id = %key, %message, "Skipping undecodable ledger row");
                    if let Some(events) = &self.events {
                        events.emit_sync(SyncEvent::LedgerCorrupted {
                            job_key: format!("item:{}", key),
                            message,
                        });
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Ok(items)
    }

    async fn exists(&self, id: &MediaId) -> Result<bool> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM items WHERE id = ?) AS present")
            .bind(id.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("present")? != 0)
    }

    async fn get(&self, id: &MediaId) -> Result<Option<MediaItem>> {
        let row = sqlx::query("SELECT id, discovered_at, uploaded_at FROM items WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::decode_item).transpose()
    }

    async fn stats(&self) -> Result<LedgerStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN uploaded_at IS NULL THEN 1 ELSE 0 END), 0) AS pending
            FROM items
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let total = row.try_get::<i64, _>("total")? as u64;
        let pending = row.try_get::<i64, _>("pending")? as u64;
        Ok(LedgerStats {
            total,
            pending,
            uploaded: total - pending,
        })
    }
}

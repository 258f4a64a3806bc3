//! Shared fakes and wiring for sync integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::time::ManualClock;
use bridge_traits::{
    ContentSource, HttpClient, HttpRequest, HttpResponse, MediaContent, MediaCursor, MediaEntry,
    MediaId, MediaSource, NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkType,
    UploadBody, VecMediaCursor,
};
use chrono::{DateTime, Utc};
use core_runtime::events::EventBus;
use core_sync::{
    Coordinator, JobQueue, LedgerStats, MediaItem, RetryPolicy, Scanner, Scheduler,
    SqliteSyncLedger, SyncConfig, SyncLedger, TaskRegistry, UploadConfig, Uploader,
};
use futures::StreamExt;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ENDPOINT: &str = "https://backup.example.com/upload";

// ============================================================================
// Media library
// ============================================================================

/// Device media store backed by a map of id to bytes
#[derive(Default)]
pub struct MockMediaLibrary {
    items: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MockMediaLibrary {
    pub fn with_items(ids: &[&str]) -> Self {
        let library = Self::default();
        for id in ids {
            library.add(id, format!("pixels of {}", id).into_bytes());
        }
        library
    }

    pub fn add(&self, id: &str, bytes: Vec<u8>) {
        self.items.lock().unwrap().insert(id.to_string(), bytes);
    }

    /// User deleted the item from the device
    pub fn remove(&self, id: &str) {
        self.items.lock().unwrap().remove(id);
    }
}

#[async_trait]
impl MediaSource for MockMediaLibrary {
    async fn enumerate(&self) -> BridgeResult<Box<dyn MediaCursor>> {
        let entries: Vec<MediaEntry> = self
            .items
            .lock()
            .unwrap()
            .keys()
            .map(|id| MediaEntry::new(id.as_str()))
            .collect();
        Ok(Box::new(VecMediaCursor::new(entries)))
    }
}

#[async_trait]
impl ContentSource for MockMediaLibrary {
    async fn open_stream(&self, id: &MediaId) -> BridgeResult<MediaContent> {
        let bytes = self
            .items
            .lock()
            .unwrap()
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(format!("{} deleted", id)))?;
        Ok(MediaContent {
            length: Some(bytes.len() as u64),
            reader: Box::new(std::io::Cursor::new(bytes)),
            file_name: format!("{}.jpg", id),
            mime_type: "image/jpeg".to_string(),
        })
    }
}

// ============================================================================
// HTTP
// ============================================================================

/// Scripted reply for one request
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16),
    ConnectionReset,
}

type SendHook = Box<dyn Fn() + Send + Sync>;

/// Answers from a script, then with `fallback`. Drains every body.
pub struct ScriptedHttpClient {
    script: Mutex<VecDeque<Reply>>,
    fallback: u16,
    latency: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    received: Mutex<Vec<(String, usize)>>,
    on_send: Mutex<Option<SendHook>>,
}

impl ScriptedHttpClient {
    pub fn always(status: u16) -> Self {
        Self::scripted(Vec::new(), status)
    }

    pub fn scripted(script: Vec<Reply>, fallback: u16) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
            on_send: Mutex::new(None),
        }
    }

    /// Hold every request open for `latency` before answering
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Run `hook` at the start of every request
    pub fn on_send(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_send.lock().unwrap() = Some(Box::new(hook));
    }

    /// Most requests observed in flight at once
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// (item id header, body length) per request
    pub fn received(&self) -> Vec<(String, usize)> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for ScriptedHttpClient {
    async fn send_stream(
        &self,
        request: HttpRequest,
        mut body: UploadBody,
    ) -> BridgeResult<HttpResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        if let Some(hook) = self.on_send.lock().unwrap().as_ref() {
            hook();
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Status(self.fallback));

        let mut length = 0;
        while let Some(chunk) = body.stream.next().await {
            length += chunk?.len();
        }
        let item = request
            .headers
            .get("X-Hold-Item-Id")
            .cloned()
            .unwrap_or_default();
        self.received.lock().unwrap().push((item, length));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match reply {
            Reply::Status(status) => Ok(HttpResponse::new(status)),
            Reply::ConnectionReset => Err(BridgeError::Network("connection reset".into())),
        }
    }
}

// ============================================================================
// Network
// ============================================================================

pub struct MockNetworkMonitor {
    info: Mutex<NetworkInfo>,
}

impl MockNetworkMonitor {
    pub fn wifi() -> Self {
        Self {
            info: Mutex::new(NetworkInfo::connected(NetworkType::WiFi, false)),
        }
    }

    pub fn set(&self, info: NetworkInfo) {
        *self.info.lock().unwrap() = info;
    }
}

#[async_trait]
impl NetworkMonitor for MockNetworkMonitor {
    async fn get_network_info(&self) -> BridgeResult<NetworkInfo> {
        Ok(self.info.lock().unwrap().clone())
    }

    async fn subscribe_changes(&self) -> BridgeResult<Box<dyn NetworkChangeStream>> {
        Err(BridgeError::NotAvailable("change stream".into()))
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// Counts acknowledgments recorded through the ledger
pub struct CountingLedger {
    inner: SqliteSyncLedger,
    marks: AtomicUsize,
}

impl CountingLedger {
    pub fn marks(&self) -> usize {
        self.marks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncLedger for CountingLedger {
    async fn upsert_discovered(
        &self,
        id: &MediaId,
        when: DateTime<Utc>,
    ) -> core_sync::Result<bool> {
        self.inner.upsert_discovered(id, when).await
    }

    async fn mark_uploaded(&self, id: &MediaId, when: DateTime<Utc>) -> core_sync::Result<()> {
        self.marks.fetch_add(1, Ordering::SeqCst);
        self.inner.mark_uploaded(id, when).await
    }

    async fn list_pending(&self) -> core_sync::Result<Vec<MediaItem>> {
        self.inner.list_pending().await
    }

    async fn exists(&self, id: &MediaId) -> core_sync::Result<bool> {
        self.inner.exists(id).await
    }

    async fn get(&self, id: &MediaId) -> core_sync::Result<Option<MediaItem>> {
        self.inner.get(id).await
    }

    async fn stats(&self) -> core_sync::Result<LedgerStats> {
        self.inner.stats().await
    }
}

// ============================================================================
// Wiring
// ============================================================================

/// Retries one second apart, doubling, without jitter
pub fn test_config() -> SyncConfig {
    let retry = RetryPolicy {
        max_attempts: 5,
        base_delay_ms: 1_000,
        max_delay_ms: 60_000,
        jitter_ratio: 0.0,
    };
    SyncConfig {
        max_concurrent_uploads: 2,
        upload_timeout_secs: 5,
        chunk_size_bytes: 4,
        buffered_chunks: 2,
        upload_retry: retry,
        housekeeping_retry: retry,
        ..Default::default()
    }
}

pub struct Harness {
    pub pool: SqlitePool,
    pub clock: Arc<ManualClock>,
    pub events: EventBus,
    pub ledger: Arc<CountingLedger>,
    pub queue: Arc<JobQueue>,
    pub coordinator: Coordinator,
    pub scheduler: Scheduler,
    pub library: Arc<MockMediaLibrary>,
    pub http: Arc<ScriptedHttpClient>,
    pub network: Arc<MockNetworkMonitor>,
}

pub async fn harness(library: MockMediaLibrary, http: ScriptedHttpClient) -> Harness {
    let pool = core_sync::create_test_pool().await.unwrap();
    harness_on(
        pool,
        Arc::new(ManualClock::at_millis(1_700_000_000_000)),
        library,
        http,
        test_config(),
    )
    .await
}

pub async fn harness_on(
    pool: SqlitePool,
    clock: Arc<ManualClock>,
    library: MockMediaLibrary,
    http: ScriptedHttpClient,
    config: SyncConfig,
) -> Harness {
    let events = EventBus::new(1024);
    let library = Arc::new(library);
    let http = Arc::new(http);
    let network = Arc::new(MockNetworkMonitor::wifi());

    let sqlite_ledger = SqliteSyncLedger::new(pool.clone()).with_events(events.clone());
    sqlite_ledger.initialize().await.unwrap();
    let ledger = Arc::new(CountingLedger {
        inner: sqlite_ledger,
        marks: AtomicUsize::new(0),
    });

    let queue = Arc::new(
        JobQueue::new(pool.clone(), clock.clone(), events.clone())
            .await
            .unwrap()
            .with_retry_policies(config.upload_retry, config.housekeeping_retry),
    );

    let scanner = Scanner::new(library.clone(), ledger.clone(), clock.clone());
    let coordinator = Coordinator::new(ledger.clone(), queue.clone(), config.upload_constraints());
    let uploader = Uploader::new(
        library.clone(),
        http.clone(),
        ledger.clone(),
        clock.clone(),
        events.clone(),
        UploadConfig::new(ENDPOINT)
            .with_chunking(config.chunk_size_bytes, config.buffered_chunks)
            .with_timeout(config.upload_timeout()),
    );
    let registry = TaskRegistry::new(
        scanner,
        Coordinator::new(ledger.clone(), queue.clone(), config.upload_constraints()),
        uploader,
        queue.clone(),
        events.clone(),
    );
    let scheduler = Scheduler::new(
        queue.clone(),
        registry,
        Some(network.clone()),
        config.max_concurrent_uploads,
        events.clone(),
    );

    Harness {
        pool,
        clock,
        events,
        ledger,
        queue,
        coordinator,
        scheduler,
        library,
        http,
        network,
    }
}

impl Harness {
    pub async fn pending_ids(&self) -> Vec<String> {
        self.ledger
            .list_pending()
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.id.to_string())
            .collect()
    }

    /// Run passes, advancing the clock past any backoff, until nothing is
    /// left to do or `max_cycles` is reached. Returns the passes used.
    pub async fn run_until_idle(&self, max_cycles: usize) -> usize {
        for cycle in 1..=max_cycles {
            self.scheduler.run_due_jobs().await.unwrap();
            let stats = self.queue.stats().await.unwrap();
            if stats.is_idle() {
                return cycle;
            }
            self.clock.advance(Duration::from_secs(120));
        }
        max_cycles
    }
}

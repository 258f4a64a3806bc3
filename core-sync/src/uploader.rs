//! # Uploader
//!
//! Streams one item to the remote endpoint and records the acknowledgment.
//!
//! ## Body pipeline
//!
//! ```text
//! reader --read_buf(chunk_size)--> mpsc(buffered_chunks) --> ByteStream --> HttpClient
//! ```
//!
//! Each read fills a fresh buffer of at most `chunk_size` bytes, so at most
//! `chunk_size * (buffered_chunks + 1)` bytes of an item are in memory at
//! once whatever its size.
//!
//! The ledger is updated only after a 2xx, which makes delivery
//! at-least-once: a crash between the two re-uploads the item.

use crate::error::{FailureKind, TaskFailure};
use crate::job::UploadOutcome;
use crate::ledger::SyncLedger;
use crate::Result;
use bridge_traits::http::ByteStream;
use bridge_traits::{
    BridgeError, Clock, ContentSource, HttpClient, HttpRequest, HttpResponse, MediaContent,
    MediaId, UploadBody,
};
use bytes::BytesMut;
use core_runtime::config::RemoteEndpoint;
use core_runtime::events::{EventBus, SyncEvent};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

pub const ITEM_ID_HEADER: &str = "X-Hold-Item-Id";
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Upload transport settings
#[derive(Clone)]
pub struct UploadConfig {
    pub endpoint: String,
    pub auth_token: Option<String>,
    /// Multipart field name, or `None` for a raw body
    pub form_field: Option<String>,
    pub chunk_size: usize,
    pub buffered_chunks: usize,
    /// Deadline for one attempt, body included
    pub timeout: Duration,
}

impl UploadConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            auth_token: None,
            form_field: Some(core_runtime::config::DEFAULT_FORM_FIELD.to_string()),
            chunk_size: 64 * 1024,
            buffered_chunks: 4,
            timeout: Duration::from_secs(600),
        }
    }

    pub fn from_endpoint(endpoint: &RemoteEndpoint, sync: &crate::SyncConfig) -> Self {
        Self {
            endpoint: endpoint.url.clone(),
            auth_token: endpoint.auth_token.clone(),
            form_field: endpoint.form_field.clone(),
            chunk_size: sync.chunk_size_bytes,
            buffered_chunks: sync.buffered_chunks,
            timeout: sync.upload_timeout(),
        }
    }

    pub fn with_chunking(mut self, chunk_size: usize, buffered_chunks: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self.buffered_chunks = buffered_chunks.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn raw_body(mut self) -> Self {
        self.form_field = None;
        self
    }
}

impl std::fmt::Debug for UploadConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadConfig")
            .field("endpoint", &core_runtime::logging::redact_url(&self.endpoint))
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("form_field", &self.form_field)
            .field("chunk_size", &self.chunk_size)
            .field("buffered_chunks", &self.buffered_chunks)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Why a transfer did not produce a usable response
enum TransferError {
    /// Reading the item failed part way through
    Read(io::Error),
    Transport(BridgeError),
    /// The client answered without consuming the whole body
    Truncated { sent: u64 },
}

pub struct Uploader {
    content: Arc<dyn ContentSource>,
    http: Arc<dyn HttpClient>,
    ledger: Arc<dyn SyncLedger>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: UploadConfig,
}

impl Uploader {
    pub fn new(
        content: Arc<dyn ContentSource>,
        http: Arc<dyn HttpClient>,
        ledger: Arc<dyn SyncLedger>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        config: UploadConfig,
    ) -> Self {
        Self {
            content,
            http,
            ledger,
            clock,
            events,
            config,
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Upload one item.
    ///
    /// Transfer failures are returned as outcomes. `Err` is reserved for a
    /// ledger write failing after the remote acknowledged the item.
    #[instrument(skip(self), fields(item_id = %id))]
    pub async fn upload(&self, id: &MediaId) -> Result<UploadOutcome> {
        let content = match self.content.open_stream(id).await {
            Ok(content) => content,
            Err(BridgeError::NotFound(message)) => {
                info!(%message, "Item no longer on device");
                return Ok(UploadOutcome::Permanent(TaskFailure::new(
                    FailureKind::ItemGone,
                    message,
                )));
            }
            Err(e) => {
                warn!(error = %e, "Could not open item");
                return Ok(UploadOutcome::Retryable(TaskFailure::new(
                    FailureKind::SourceUnavailable,
                    e.to_string(),
                )));
            }
        };

        debug!(
            file_name = %content.file_name,
            length = ?content.length,
            "Starting transfer"
        );

        let transfer = tokio::time::timeout(self.config.timeout, self.transfer(id, content));
        let response = match transfer.await {
            Ok(Ok(response)) => response,
            Ok(Err(TransferError::Read(e))) => {
                warn!(error = %e, "Item read failed mid-transfer");
                return Ok(UploadOutcome::Retryable(TaskFailure::new(
                    FailureKind::SourceUnavailable,
                    e.to_string(),
                )));
            }
            Ok(Err(TransferError::Transport(e))) => {
                let kind = match e {
                    BridgeError::Timeout(_) => FailureKind::Timeout,
                    _ => FailureKind::TransientNetwork,
                };
                debug!(error = %e, "Transport failure");
                return Ok(UploadOutcome::Retryable(TaskFailure::new(kind, e.to_string())));
            }
            Ok(Err(TransferError::Truncated { sent })) => {
                warn!(sent, "Remote answered before receiving the whole item");
                return Ok(UploadOutcome::Retryable(TaskFailure::new(
                    FailureKind::TransientNetwork,
                    format!("body truncated after {} bytes", sent),
                )));
            }
            Err(_) => {
                warn!(timeout_secs = self.config.timeout.as_secs(), "Upload attempt timed out");
                return Ok(UploadOutcome::Retryable(TaskFailure::new(
                    FailureKind::Timeout,
                    format!("no response within {:?}", self.config.timeout),
                )));
            }
        };

        if let Some(outcome) = classify_status(&response) {
            return Ok(outcome);
        }

        self.ledger.mark_uploaded(id, self.clock.now()).await?;
        info!(status = response.status, "Item uploaded");
        self.events.emit_sync(SyncEvent::UploadSucceeded {
            item_id: id.to_string(),
        });

        Ok(UploadOutcome::Success)
    }

    async fn transfer(
        &self,
        id: &MediaId,
        content: MediaContent,
    ) -> std::result::Result<HttpResponse, TransferError> {
        let MediaContent {
            mut reader,
            file_name,
            mime_type,
            length,
        } = content;

        let (sender, receiver) =
            mpsc::channel::<io::Result<bytes::Bytes>>(self.config.buffered_chunks);
        let consumed = Arc::new(AtomicU64::new(0));
        let body = UploadBody {
            stream: receiver_stream(receiver, Arc::clone(&consumed)),
            file_name,
            mime_type,
            content_length: length,
            form_field: self.config.form_field.clone(),
        };

        let mut request = HttpRequest::post(&self.config.endpoint)
            .header(ITEM_ID_HEADER, id.as_str())
            .header(IDEMPOTENCY_HEADER, id.as_str())
            .timeout(self.config.timeout);
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_token(token);
        }

        let chunk_size = self.config.chunk_size;
        // Some(total) once the reader hit EOF, None if the client stopped early
        let pump = async move {
            let mut total = 0u64;
            loop {
                let mut chunk = BytesMut::with_capacity(chunk_size);
                match reader.read_buf(&mut chunk).await {
                    Ok(0) => return Ok(Some(total)),
                    Ok(n) => {
                        total += n as u64;
                        if sender.send(Ok(chunk.freeze())).await.is_err() {
                            return Ok(None);
                        }
                    }
                    Err(e) => {
                        let _ = sender
                            .send(Err(io::Error::new(e.kind(), e.to_string())))
                            .await;
                        return Err(e);
                    }
                }
            }
        };

        let (pumped, sent) = tokio::join!(pump, self.http.send_stream(request, body));

        let read = pumped.map_err(TransferError::Read)?;
        let response = sent.map_err(TransferError::Transport)?;

        // A response to a truncated body is never an acknowledgment
        let sent = consumed.load(Ordering::SeqCst);
        if response.is_success() && read != Some(sent) {
            return Err(TransferError::Truncated { sent });
        }
        Ok(response)
    }
}

/// Counts the bytes the client actually pulled into `consumed`
fn receiver_stream(
    receiver: mpsc::Receiver<io::Result<bytes::Bytes>>,
    consumed: Arc<AtomicU64>,
) -> ByteStream {
    Box::pin(futures::stream::unfold(receiver, move |mut receiver| {
        let consumed = Arc::clone(&consumed);
        async move {
            let Some(chunk) = receiver.recv().await else {
                return None;
            };
            if let Ok(bytes) = &chunk {
                consumed.fetch_add(bytes.len() as u64, Ordering::SeqCst);
            }
            Some((chunk, receiver))
        }
    }))
}

/// `None` for 2xx, otherwise the failure outcome for the status
fn classify_status(response: &HttpResponse) -> Option<UploadOutcome> {
    let status = response.status;
    if response.is_success() {
        return None;
    }

    let message = format!("HTTP {}", status);
    if response.is_server_error() || response.is_throttled() {
        debug!(status, "Remote unavailable");
        return Some(UploadOutcome::Retryable(TaskFailure::new(
            FailureKind::TransientNetwork,
            message,
        )));
    }
    if response.is_client_error() {
        warn!(status, body = %response.text(), "Remote rejected item");
        return Some(UploadOutcome::Permanent(TaskFailure::new(
            FailureKind::RemoteRejected,
            message,
        )));
    }

    debug!(status, "Unexpected status");
    Some(UploadOutcome::Retryable(TaskFailure::new(
        FailureKind::TransientNetwork,
        message,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::ledger::SqliteSyncLedger;
    use async_trait::async_trait;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::time::ManualClock;
    use futures::StreamExt;
    use mockall::mock;
    use std::collections::HashMap;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, ReadBuf};

    mock! {
        pub Http {}

        #[async_trait]
        impl HttpClient for Http {
            async fn send_stream(
                &self,
                request: HttpRequest,
                body: UploadBody,
            ) -> BridgeResult<HttpResponse>;
        }
    }

    /// In-memory content keyed by id
    struct MockContentSource {
        items: HashMap<String, Vec<u8>>,
    }

    impl MockContentSource {
        fn with(id: &str, bytes: Vec<u8>) -> Self {
            Self {
                items: HashMap::from([(id.to_string(), bytes)]),
            }
        }
    }

    #[async_trait]
    impl ContentSource for MockContentSource {
        async fn open_stream(&self, id: &MediaId) -> BridgeResult<MediaContent> {
            let bytes = self
                .items
                .get(id.as_str())
                .cloned()
                .ok_or_else(|| BridgeError::NotFound(id.to_string()))?;
            Ok(MediaContent {
                length: Some(bytes.len() as u64),
                reader: Box::new(std::io::Cursor::new(bytes)),
                file_name: format!("{}.jpg", id),
                mime_type: "image/jpeg".to_string(),
            })
        }
    }

    /// Reader that fails after yielding some bytes
    struct BrokenReader {
        remaining: usize,
    }

    impl AsyncRead for BrokenReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.remaining == 0 {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "media unmounted")));
            }
            let n = self.remaining.min(buf.remaining());
            buf.put_slice(&vec![0u8; n]);
            self.remaining -= n;
            Poll::Ready(Ok(()))
        }
    }

    struct BrokenContentSource;

    #[async_trait]
    impl ContentSource for BrokenContentSource {
        async fn open_stream(&self, _id: &MediaId) -> BridgeResult<MediaContent> {
            Ok(MediaContent {
                reader: Box::new(BrokenReader { remaining: 10 }),
                file_name: "a.jpg".into(),
                mime_type: "image/jpeg".into(),
                length: None,
            })
        }
    }

    /// Drains the body and records what it saw
    #[derive(Default)]
    struct RecordingHttpClient {
        status: u16,
        chunks: Mutex<Vec<usize>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    #[async_trait]
    impl HttpClient for RecordingHttpClient {
        async fn send_stream(
            &self,
            request: HttpRequest,
            mut body: UploadBody,
        ) -> BridgeResult<HttpResponse> {
            self.requests.lock().unwrap().push(request);
            while let Some(chunk) = body.stream.next().await {
                let chunk = chunk?;
                self.chunks.lock().unwrap().push(chunk.len());
            }
            Ok(HttpResponse::new(self.status))
        }
    }

    async fn ledger_with(id: &str) -> Arc<SqliteSyncLedger> {
        let ledger = SqliteSyncLedger::new(create_test_pool().await.unwrap());
        ledger.initialize().await.unwrap();
        ledger
            .upsert_discovered(&id.into(), chrono::DateTime::from_timestamp_millis(1).unwrap())
            .await
            .unwrap();
        Arc::new(ledger)
    }

    fn uploader(
        content: Arc<dyn ContentSource>,
        http: Arc<dyn HttpClient>,
        ledger: Arc<SqliteSyncLedger>,
        config: UploadConfig,
    ) -> Uploader {
        Uploader::new(
            content,
            http,
            ledger,
            Arc::new(ManualClock::at_millis(50)),
            EventBus::default(),
            config,
        )
    }

    fn responding(status: u16) -> MockHttp {
        let mut http = MockHttp::new();
        http.expect_send_stream()
            .times(1)
            .returning(move |_, _| Ok(HttpResponse::new(status)));
        http
    }

    #[tokio::test]
    async fn test_body_is_streamed_in_bounded_chunks() {
        let ledger = ledger_with("1").await;
        let http = Arc::new(RecordingHttpClient {
            status: 201,
            ..Default::default()
        });
        let uploader = uploader(
            Arc::new(MockContentSource::with("1", vec![7u8; 10_000])),
            http.clone(),
            ledger.clone(),
            UploadConfig::new("https://backup.example.com/upload")
                .with_chunking(4096, 2)
                .with_auth_token("s3cret"),
        );

        let outcome = uploader.upload(&"1".into()).await.unwrap();
        assert_eq!(outcome, UploadOutcome::Success);

        let chunks = http.chunks.lock().unwrap().clone();
        assert_eq!(chunks.iter().sum::<usize>(), 10_000);
        assert!(chunks.iter().all(|&len| len <= 4096));
        assert!(chunks.len() >= 3);

        let requests = http.requests.lock().unwrap();
        assert_eq!(requests[0].headers.get(ITEM_ID_HEADER).map(String::as_str), Some("1"));
        assert_eq!(requests[0].headers.get(IDEMPOTENCY_HEADER).map(String::as_str), Some("1"));
        assert_eq!(
            requests[0].headers.get("Authorization").map(String::as_str),
            Some("Bearer s3cret")
        );

        let item = ledger.get(&"1".into()).await.unwrap().unwrap();
        assert!(item.uploaded_at.is_some());
    }

    #[tokio::test]
    async fn test_server_errors_and_throttling_are_retryable() {
        for status in [500, 503, 408, 429, 302] {
            let ledger = ledger_with("1").await;
            let uploader = uploader(
                Arc::new(MockContentSource::with("1", vec![1, 2, 3])),
                Arc::new(responding(status)),
                ledger.clone(),
                UploadConfig::new("https://backup.example.com/upload"),
            );

            let outcome = uploader.upload(&"1".into()).await.unwrap();
            match outcome {
                UploadOutcome::Retryable(failure) => {
                    assert_eq!(failure.kind, FailureKind::TransientNetwork, "status {}", status)
                }
                other => panic!("status {} gave {:?}", status, other),
            }
            assert!(ledger.get(&"1".into()).await.unwrap().unwrap().is_pending());
        }
    }

    #[tokio::test]
    async fn test_client_error_is_permanent() {
        let ledger = ledger_with("1").await;
        let uploader = uploader(
            Arc::new(MockContentSource::with("1", vec![1])),
            Arc::new(responding(413)),
            ledger.clone(),
            UploadConfig::new("https://backup.example.com/upload"),
        );

        let outcome = uploader.upload(&"1".into()).await.unwrap();
        assert!(matches!(
            outcome,
            UploadOutcome::Permanent(TaskFailure { kind: FailureKind::RemoteRejected, .. })
        ));
        assert!(ledger.get(&"1".into()).await.unwrap().unwrap().is_pending());
    }

    #[tokio::test]
    async fn test_missing_item_is_permanent_without_sending() {
        let ledger = ledger_with("1").await;
        let mut http = MockHttp::new();
        http.expect_send_stream().times(0);
        let uploader = uploader(
            Arc::new(MockContentSource {
                items: HashMap::new(),
            }),
            Arc::new(http),
            ledger,
            UploadConfig::new("https://backup.example.com/upload"),
        );

        let outcome = uploader.upload(&"1".into()).await.unwrap();
        assert!(matches!(
            outcome,
            UploadOutcome::Permanent(TaskFailure { kind: FailureKind::ItemGone, .. })
        ));
    }

    #[tokio::test]
    async fn test_transport_errors_are_retryable() {
        let ledger = ledger_with("1").await;
        let mut http = MockHttp::new();
        http.expect_send_stream()
            .returning(|_, _| Err(BridgeError::Timeout("read timed out".into())));
        let uploader = uploader(
            Arc::new(MockContentSource::with("1", vec![1])),
            Arc::new(http),
            ledger,
            UploadConfig::new("https://backup.example.com/upload"),
        );

        let outcome = uploader.upload(&"1".into()).await.unwrap();
        assert!(matches!(
            outcome,
            UploadOutcome::Retryable(TaskFailure { kind: FailureKind::Timeout, .. })
        ));
    }

    #[tokio::test]
    async fn test_read_failure_is_never_acknowledged() {
        let ledger = ledger_with("a").await;
        let http = Arc::new(RecordingHttpClient {
            status: 200,
            ..Default::default()
        });
        let uploader = uploader(
            Arc::new(BrokenContentSource),
            http,
            ledger.clone(),
            UploadConfig::new("https://backup.example.com/upload"),
        );

        let outcome = uploader.upload(&"a".into()).await.unwrap();
        assert!(matches!(
            outcome,
            UploadOutcome::Retryable(TaskFailure { kind: FailureKind::SourceUnavailable, .. })
        ));
        assert!(ledger.get(&"a".into()).await.unwrap().unwrap().is_pending());
    }

    /// Takes the first chunk of the body and answers without reading the rest
    struct EarlyAnswerHttpClient;

    #[async_trait]
    impl HttpClient for EarlyAnswerHttpClient {
        async fn send_stream(
            &self,
            _request: HttpRequest,
            mut body: UploadBody,
        ) -> BridgeResult<HttpResponse> {
            body.stream.next().await;
            Ok(HttpResponse::new(200))
        }
    }

    #[tokio::test]
    async fn test_answer_to_partial_body_is_not_an_acknowledgment() {
        let ledger = ledger_with("1").await;
        let uploader = uploader(
            Arc::new(MockContentSource::with("1", vec![3u8; 10_000])),
            Arc::new(EarlyAnswerHttpClient),
            ledger.clone(),
            UploadConfig::new("https://backup.example.com/upload").with_chunking(4096, 2),
        );

        let outcome = uploader.upload(&"1".into()).await.unwrap();
        match outcome {
            UploadOutcome::Retryable(failure) => {
                assert_eq!(failure.kind, FailureKind::TransientNetwork);
                assert!(failure.message.starts_with("body truncated"), "{}", failure.message);
            }
            other => panic!("partial body gave {:?}", other),
        }
        assert!(ledger.get(&"1".into()).await.unwrap().unwrap().is_pending());
    }

    /// Never answers
    struct HangingHttpClient;

    #[async_trait]
    impl HttpClient for HangingHttpClient {
        async fn send_stream(
            &self,
            _request: HttpRequest,
            _body: UploadBody,
        ) -> BridgeResult<HttpResponse> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_attempt_deadline() {
        let ledger = ledger_with("1").await;
        let uploader = uploader(
            Arc::new(MockContentSource::with("1", vec![1])),
            Arc::new(HangingHttpClient),
            ledger,
            UploadConfig::new("https://backup.example.com/upload")
                .with_timeout(Duration::from_millis(200)),
        );

        let outcome = uploader.upload(&"1".into()).await.unwrap();
        assert!(matches!(
            outcome,
            UploadOutcome::Retryable(TaskFailure { kind: FailureKind::Timeout, .. })
        ));
    }

    #[test]
    fn test_config_debug_redacts() {
        let config =
            UploadConfig::new("https://u:p@backup.example.com/upload?k=v").with_auth_token("tok");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("tok\""));
        assert!(!debug.contains("u:p"));
        assert!(debug.contains("[REDACTED]"));
    }
}

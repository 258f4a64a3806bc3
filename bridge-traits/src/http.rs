//! HTTP Client Abstraction
//!
//! Provides streamed request bodies so large items never have to be held in
//! memory. Retries are not the client's concern; the scheduler owns them.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use crate::error::Result;

/// Request body delivered chunk by chunk.
///
/// An `Err` item aborts the request; the client must surface it as a failed
/// send rather than completing the upload with a truncated body.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// HTTP methods the uploader issues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Post,
}

/// HTTP request head (everything but the body)
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HashMap::new(),
            timeout: None,
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn bearer_token(self, token: impl Into<String>) -> Self {
        self.header("Authorization", format!("Bearer {}", token.into()))
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }
}

/// Streamed upload body
pub struct UploadBody {
    pub stream: ByteStream,
    pub file_name: String,
    pub mime_type: String,
    pub content_length: Option<u64>,
    /// Multipart form field carrying the file. `None` sends the raw bytes as
    /// the whole request body.
    pub form_field: Option<String>,
}

impl fmt::Debug for UploadBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadBody")
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("content_length", &self.content_length)
            .field("form_field", &self.form_field)
            .finish_non_exhaustive()
    }
}

/// HTTP response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Bytes::new(),
        }
    }

    /// Get response body as UTF-8 string, lossily
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Check if response status is successful (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Check if response status indicates a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }

    /// Check if response status indicates a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }

    /// 429 Too Many Requests or 408 Request Timeout
    pub fn is_throttled(&self) -> bool {
        matches!(self.status, 408 | 429)
    }
}

/// Async HTTP client trait
///
/// Implementations return `Ok` for every response that reached the client,
/// whatever its status. Transport failures map to
/// [`BridgeError::Network`](crate::BridgeError::Network) or
/// [`BridgeError::Timeout`](crate::BridgeError::Timeout).
///
/// # Example
///
/// ```ignore
/// use bridge_traits::http::{HttpClient, HttpRequest, UploadBody};
///
/// async fn push(client: &dyn HttpClient, body: UploadBody) -> Result<bool> {
///     let request = HttpRequest::post("https://backup.example.com/upload");
///     Ok(client.send_stream(request, body).await?.is_success())
/// }
/// ```
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Send a request whose body is consumed from `body.stream`
    async fn send_stream(&self, request: HttpRequest, body: UploadBody) -> Result<HttpResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_request_builder() {
        let request = HttpRequest::post("https://example.com/upload")
            .header("X-Hold-Item-Id", "42")
            .bearer_token("secret")
            .timeout(Duration::from_secs(30));

        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.url, "https://example.com/upload");
        assert_eq!(request.headers.get("X-Hold-Item-Id"), Some(&"42".to_string()));
        assert_eq!(
            request.headers.get("Authorization"),
            Some(&"Bearer secret".to_string())
        );
        assert_eq!(request.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_http_response_status_checks() {
        assert!(HttpResponse::new(200).is_success());
        assert!(HttpResponse::new(204).is_success());
        assert!(HttpResponse::new(404).is_client_error());
        assert!(HttpResponse::new(503).is_server_error());
        assert!(HttpResponse::new(429).is_throttled());
        assert!(HttpResponse::new(408).is_throttled());
        assert!(!HttpResponse::new(400).is_throttled());
    }
}

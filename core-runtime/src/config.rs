//! # Core Configuration Module
//!
//! Provides configuration management for the Hold sync core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! instance that holds every bridge and setting the core needs. It enforces
//! fail-fast validation so a missing capability is reported at startup with
//! an actionable message rather than as a failed upload hours later.
//!
//! ## Required Dependencies
//!
//! - `MediaSource` - Enumerates the device's media
//! - `ContentSource` - Opens item bytes for upload
//! - `RemoteEndpoint` - Where uploads go
//!
//! ## Optional Dependencies (with platform defaults)
//!
//! - `HttpClient` - Streamed uploads (desktop default: reqwest)
//! - `NetworkMonitor` - Connectivity detection (desktop default: TCP connect to the endpoint host)
//! - `Clock` - Time source (default: system clock)
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{CoreConfig, RemoteEndpoint};
//! use bridge_desktop::DirectoryMediaSource;
//!
//! let config = CoreConfig::builder()
//!     .database_path("/path/to/hold.db")
//!     .endpoint(RemoteEndpoint::new("https://backup.example.com/upload"))
//!     .media_library(DirectoryMediaSource::new("/home/jo/Pictures"))
//!     .build()
//!     .expect("Failed to build config");
//! ```

use crate::error::{Error, Result};
use crate::logging::{redact_if_sensitive, redact_url};
use bridge_traits::{Clock, ContentSource, HttpClient, MediaSource, NetworkMonitor, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

/// Multipart field that carries the file when none is configured.
pub const DEFAULT_FORM_FIELD: &str = "file";

/// Remote upload endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    /// Absolute `http`/`https` URL receiving one POST per item
    pub url: String,
    /// Optional bearer token sent with every upload
    pub auth_token: Option<String>,
    /// Multipart field name, or `None` to send the raw bytes as the body
    pub form_field: Option<String>,
}

impl RemoteEndpoint {
    /// Multipart endpoint using the default `"file"` field
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
            form_field: Some(DEFAULT_FORM_FIELD.to_string()),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_form_field(mut self, field: impl Into<String>) -> Self {
        self.form_field = Some(field.into());
        self
    }

    /// Send item bytes as the whole request body instead of a multipart form
    pub fn raw_body(mut self) -> Self {
        self.form_field = None;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let parsed = Url::parse(&self.url).map_err(|e| {
            Error::Endpoint(format!("URL must be absolute http(s): {}", e))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::Endpoint(format!(
                "URL must be absolute http(s), got scheme '{}'",
                parsed.scheme()
            )));
        }
        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(Error::Endpoint(format!(
                "URL has no host: '{}'",
                redact_url(&self.url)
            )));
        }
        if matches!(self.form_field.as_deref(), Some("")) {
            return Err(Error::Endpoint(
                "Multipart form field cannot be empty. Use .raw_body() to send unframed bytes."
                    .to_string(),
            ));
        }
        if matches!(self.auth_token.as_deref(), Some("")) {
            return Err(Error::Endpoint("Auth token cannot be empty when set".to_string()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("url", &redact_url(&self.url))
            .field(
                "auth_token",
                &self
                    .auth_token
                    .as_deref()
                    .map(|t| redact_if_sensitive("auth_token", t)),
            )
            .field("form_field", &self.form_field)
            .finish()
    }
}

/// Feature flags control optional behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureFlags {
    /// Require a NetworkMonitor so network constraints are actually checked
    pub enable_network_awareness: bool,
}

/// Core configuration for the Hold sync core.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Path to the SQLite database file holding the ledger and the job queue
    pub database_path: PathBuf,

    /// Upload target
    pub endpoint: RemoteEndpoint,

    /// Media enumeration (required)
    pub media_source: Arc<dyn MediaSource>,

    /// Content access (required)
    pub content_source: Arc<dyn ContentSource>,

    /// HTTP client for uploads (desktop default)
    pub http_client: Arc<dyn HttpClient>,

    /// Network connectivity monitor. Without one, network constraints are
    /// treated as satisfied.
    pub network_monitor: Option<Arc<dyn NetworkMonitor>>,

    /// Time source
    pub clock: Arc<dyn Clock>,

    /// Features flags
    pub features: FeatureFlags,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("database_path", &self.database_path)
            .field("endpoint", &self.endpoint)
            .field("media_source", &"MediaSource { ... }")
            .field("content_source", &"ContentSource { ... }")
            .field("http_client", &"HttpClient { ... }")
            .field(
                "network_monitor",
                &self
                    .network_monitor
                    .as_ref()
                    .map(|_| "NetworkMonitor { ... }"),
            )
            .field("features", &self.features)
            .finish()
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Database path is not empty
    /// - Endpoint is well formed
    /// - Feature flags are consistent with available bridges
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }

        self.endpoint.validate()?;

        if self.features.enable_network_awareness && self.network_monitor.is_none() {
            return Err(Error::Config(
                "Network awareness enabled but no NetworkMonitor provided. \
                 Disable the feature or inject a NetworkMonitor implementation."
                    .to_string(),
            ));
        }

        Ok(())
    }
}

fn media_source_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "MediaSource".to_string(),
        message: "MediaSource implementation is required to discover items. \
                 Desktop: use .media_library(DirectoryMediaSource::new(pictures_dir)). \
                 Mobile: inject the platform media store adapter (MediaStore/PhotoKit)."
            .to_string(),
    }
}

fn content_source_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "ContentSource".to_string(),
        message: "ContentSource implementation is required to read item bytes. \
                 Desktop: use .media_library(DirectoryMediaSource::new(pictures_dir)). \
                 Mobile: inject the platform content resolver adapter."
            .to_string(),
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn http_client_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: "No HTTP client implementation provided. \
                 Desktop: ensure the 'desktop-shims' feature is enabled to use the default ReqwestHttpClient. \
                 Mobile: inject platform-native adapter."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    use bridge_desktop::ReqwestHttpClient;

    let client = ReqwestHttpClient::new().map_err(|e| {
        Error::Internal(format!("Failed to initialize default HttpClient: {}", e))
    })?;
    let client: Arc<dyn HttpClient> = Arc::new(client);
    Ok(client)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    Err(http_client_missing_error())
}

#[cfg(feature = "desktop-shims")]
fn provide_default_network_monitor(
    endpoint: &RemoteEndpoint,
) -> Result<Option<Arc<dyn NetworkMonitor>>> {
    use bridge_desktop::DesktopNetworkMonitor;

    let monitor = DesktopNetworkMonitor::for_endpoint(&endpoint.url)
        .map_err(|e| Error::Endpoint(format!("Cannot derive reachability target: {}", e)))?;
    let monitor: Arc<dyn NetworkMonitor> = Arc::new(monitor);
    Ok(Some(monitor))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_network_monitor(
    _endpoint: &RemoteEndpoint,
) -> Result<Option<Arc<dyn NetworkMonitor>>> {
    Ok(None)
}

#[cfg(feature = "desktop-shims")]
fn default_database_path() -> Option<PathBuf> {
    bridge_desktop::default_database_path()
}

#[cfg(not(feature = "desktop-shims"))]
fn default_database_path() -> Option<PathBuf> {
    None
}

/// Builder for constructing [`CoreConfig`] instances.
///
/// Set options incrementally and call [`build()`](CoreConfigBuilder::build).
#[derive(Default)]
pub struct CoreConfigBuilder {
    database_path: Option<PathBuf>,
    endpoint: Option<RemoteEndpoint>,
    media_source: Option<Arc<dyn MediaSource>>,
    content_source: Option<Arc<dyn ContentSource>>,
    http_client: Option<Arc<dyn HttpClient>>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    clock: Option<Arc<dyn Clock>>,
    features: FeatureFlags,
}

impl CoreConfigBuilder {
    /// Sets the database path.
    ///
    /// With `desktop-shims` this defaults to `<data dir>/hold/hold.db`.
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Sets the upload endpoint (required).
    pub fn endpoint(mut self, endpoint: RemoteEndpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Sets the media enumeration implementation.
    pub fn media_source(mut self, source: Arc<dyn MediaSource>) -> Self {
        self.media_source = Some(source);
        self
    }

    /// Sets the content access implementation.
    pub fn content_source(mut self, source: Arc<dyn ContentSource>) -> Self {
        self.content_source = Some(source);
        self
    }

    /// Uses one value as both media source and content source.
    pub fn media_library<T>(mut self, library: T) -> Self
    where
        T: MediaSource + ContentSource + 'static,
    {
        let library = Arc::new(library);
        self.media_source = Some(library.clone());
        self.content_source = Some(library);
        self
    }

    /// Sets the HTTP client implementation.
    ///
    /// If not provided, the desktop default (reqwest-based) will be used when
    /// the `desktop-shims` feature is enabled.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the network monitor implementation.
    ///
    /// If not provided, the desktop default connects to the endpoint host when the
    /// `desktop-shims` feature is enabled.
    pub fn network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    /// Sets the time source. Default: [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Enables or disables network awareness.
    ///
    /// Requires a `NetworkMonitor` to be provided.
    ///
    /// Default: false
    pub fn enable_network_awareness(mut self, enabled: bool) -> Self {
        self.features.enable_network_awareness = enabled;
        self
    }

    /// Sets all feature flags at once.
    pub fn features(mut self, features: FeatureFlags) -> Self {
        self.features = features;
        self
    }

    /// Builds the final `CoreConfig` instance.
    ///
    /// Returns an error with an actionable message if:
    /// - Required bridges are missing (MediaSource, ContentSource, HttpClient without desktop-shims)
    /// - Configuration values are invalid
    /// - Feature flags are inconsistent with available bridges
    pub fn build(self) -> Result<CoreConfig> {
        let database_path = self
            .database_path
            .or_else(default_database_path)
            .ok_or_else(|| {
                Error::Config(
                    "Database path is required. Use .database_path() to set it.".to_string(),
                )
            })?;

        let endpoint = self.endpoint.ok_or_else(|| {
            Error::Config(
                "Remote endpoint is required. Use .endpoint(RemoteEndpoint::new(url)).".to_string(),
            )
        })?;
        endpoint.validate()?;

        let media_source = self.media_source.ok_or_else(media_source_missing_error)?;
        let content_source = self.content_source.ok_or_else(content_source_missing_error)?;

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client()?,
        };

        let network_monitor = match self.network_monitor {
            Some(monitor) => Some(monitor),
            None => provide_default_network_monitor(&endpoint)?,
        };

        let config = CoreConfig {
            database_path,
            endpoint,
            media_source,
            content_source,
            http_client,
            network_monitor,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            features: self.features,
        };

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::{
        BridgeError, HttpRequest, HttpResponse, MediaContent, MediaCursor, MediaId,
        NetworkChangeStream, NetworkInfo, UploadBody, VecMediaCursor,
    };

    // Mock implementations for testing
    struct MockLibrary;

    #[async_trait]
    impl MediaSource for MockLibrary {
        async fn enumerate(&self) -> BridgeResult<Box<dyn MediaCursor>> {
            Ok(Box::new(VecMediaCursor::default()))
        }
    }

    #[async_trait]
    impl ContentSource for MockLibrary {
        async fn open_stream(&self, id: &MediaId) -> BridgeResult<MediaContent> {
            Err(BridgeError::NotFound(id.to_string()))
        }
    }

    struct MockHttpClient;

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn send_stream(
            &self,
            _request: HttpRequest,
            _body: UploadBody,
        ) -> BridgeResult<HttpResponse> {
            Ok(HttpResponse::new(200))
        }
    }

    struct MockNetworkMonitor;

    #[async_trait]
    impl NetworkMonitor for MockNetworkMonitor {
        async fn get_network_info(&self) -> BridgeResult<NetworkInfo> {
            Ok(NetworkInfo::disconnected())
        }

        async fn subscribe_changes(&self) -> BridgeResult<Box<dyn NetworkChangeStream>> {
            Err(BridgeError::NotAvailable("no change stream".to_string()))
        }
    }

    fn complete_builder() -> CoreConfigBuilder {
        CoreConfig::builder()
            .database_path("/db/hold.db")
            .endpoint(RemoteEndpoint::new("https://backup.example.com/upload"))
            .media_library(MockLibrary)
            .http_client(Arc::new(MockHttpClient))
    }

    #[test]
    fn test_builder_with_all_required_fields() {
        let config = complete_builder().build().unwrap();

        assert_eq!(config.database_path, PathBuf::from("/db/hold.db"));
        assert_eq!(config.endpoint.form_field.as_deref(), Some("file"));
        assert!(config.endpoint.auth_token.is_none());
        assert!(!config.features.enable_network_awareness);
    }

    #[test]
    fn test_builder_requires_endpoint() {
        let result = CoreConfig::builder()
            .database_path("/db/hold.db")
            .media_library(MockLibrary)
            .http_client(Arc::new(MockHttpClient))
            .build();

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("Remote endpoint is required"));
    }

    #[test]
    fn test_builder_requires_media_source() {
        let result = CoreConfig::builder()
            .database_path("/db/hold.db")
            .endpoint(RemoteEndpoint::new("https://backup.example.com/upload"))
            .http_client(Arc::new(MockHttpClient))
            .build();

        match result {
            Err(Error::CapabilityMissing { capability, message }) => {
                assert_eq!(capability, "MediaSource");
                assert!(message.contains("DirectoryMediaSource"));
            }
            other => panic!("expected missing MediaSource, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_builder_requires_content_source() {
        let result = CoreConfig::builder()
            .database_path("/db/hold.db")
            .endpoint(RemoteEndpoint::new("https://backup.example.com/upload"))
            .media_source(Arc::new(MockLibrary))
            .http_client(Arc::new(MockHttpClient))
            .build();

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("ContentSource"));
    }

    #[cfg(not(feature = "desktop-shims"))]
    #[test]
    fn test_builder_requires_http_client_without_shims() {
        let result = CoreConfig::builder()
            .database_path("/db/hold.db")
            .endpoint(RemoteEndpoint::new("https://backup.example.com/upload"))
            .media_library(MockLibrary)
            .build();

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("HttpClient"));
    }

    #[cfg(feature = "desktop-shims")]
    #[test]
    fn test_build_with_desktop_defaults() {
        let config = CoreConfig::builder()
            .database_path("/db/hold.db")
            .endpoint(RemoteEndpoint::new("https://backup.example.com/upload"))
            .media_library(MockLibrary)
            .build()
            .expect("desktop defaults should succeed");

        assert!(config.network_monitor.is_some());
    }

    #[test]
    fn test_endpoint_validation() {
        let result = complete_builder()
            .endpoint(RemoteEndpoint::new("ftp://backup.example.com"))
            .build();
        assert!(result.unwrap_err().to_string().contains("absolute http(s)"));

        let result = complete_builder()
            .endpoint(RemoteEndpoint::new("https://backup.example.com/upload").with_form_field(""))
            .build();
        assert!(result.unwrap_err().to_string().contains("form field"));

        for malformed in [
            "https://",
            "https://exa mple.com/up",
            "backup.example.com/up",
            "mailto:jo@example.com",
        ] {
            assert!(
                matches!(RemoteEndpoint::new(malformed).validate(), Err(Error::Endpoint(_))),
                "{} should be rejected",
                malformed
            );
        }
        assert!(RemoteEndpoint::new("HTTPS://backup.example.com/up").validate().is_ok());
        assert!(RemoteEndpoint::new("http://[fd7a::1]:8080/up").validate().is_ok());

        let raw = RemoteEndpoint::new("https://backup.example.com/upload").raw_body();
        assert!(raw.form_field.is_none());
        assert!(raw.validate().is_ok());
    }

    #[test]
    fn test_endpoint_debug_hides_token() {
        let endpoint = RemoteEndpoint::new("https://user:pw@backup.example.com/upload?k=v")
            .with_auth_token("super-secret");
        let debug = format!("{:?}", endpoint);

        assert!(!debug.contains("super-secret"));
        assert!(!debug.contains("pw@"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_validate_network_awareness_requires_monitor() {
        let mut config = complete_builder().build().unwrap();
        config.network_monitor = None;
        config.features.enable_network_awareness = true;

        let err_msg = config.validate().unwrap_err().to_string();
        assert!(err_msg.contains("Network awareness enabled"));
        assert!(err_msg.contains("NetworkMonitor"));

        let config = complete_builder()
            .network_monitor(Arc::new(MockNetworkMonitor))
            .enable_network_awareness(true)
            .build();
        assert!(config.is_ok());
    }

    #[test]
    fn test_config_is_cloneable() {
        let config = complete_builder().build().unwrap();
        let cloned = config.clone();
        assert_eq!(cloned.database_path, config.database_path);
        assert_eq!(cloned.endpoint, config.endpoint);
    }
}

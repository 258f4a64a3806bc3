//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `MediaSource` / `ContentSource` backed by a pictures directory on disk
//! - `HttpClient` using `reqwest` with streamed multipart or raw bodies
//! - `NetworkMonitor` using a TCP reachability check
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{DesktopNetworkMonitor, DirectoryMediaSource, ReqwestHttpClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let library = DirectoryMediaSource::new(
//!         DirectoryMediaSource::default_root().unwrap_or_else(|| ".".into()),
//!     );
//!     let http_client = ReqwestHttpClient::new()?;
//!     let network = DesktopNetworkMonitor::for_endpoint("https://backup.example.com/upload")?;
//!
//!     // Use in core configuration
//!     Ok(())
//! }
//! ```

mod http;
mod media_library;
mod network;

pub use http::ReqwestHttpClient;
pub use media_library::DirectoryMediaSource;
pub use network::DesktopNetworkMonitor;

/// Default location of the sync database: `<data dir>/hold/hold.db`.
pub fn default_database_path() -> Option<std::path::PathBuf> {
    dirs::data_dir().map(|dir| dir.join("hold").join("hold.db"))
}

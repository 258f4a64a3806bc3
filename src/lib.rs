//! Workspace umbrella crate.
//!
//! Exposes the feature flags that map onto the individual workspace crates
//! (`core-service` and, through it, `bridge-desktop`). Host applications can
//! depend on `hold-workspace` and enable `desktop-shims` instead of wiring the
//! service, runtime and bridge crates one by one.

#[cfg(feature = "desktop-shims")]
pub use core_service::{SyncService, SyncStats};

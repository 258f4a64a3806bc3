//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the Hold sync core:
//! - Logging and tracing infrastructure
//! - Configuration management
//! - Event bus system
//!
//! ## Overview
//!
//! This crate contains the runtime utilities that the sync and service crates
//! depend on. It establishes the logging conventions, the bridge wiring, and
//! the event broadcasting mechanism used throughout the system.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};

//! # Alert Framework Common Library
//!
//! Shared code for the alert framework services including:
//! - Error types
//! - TOML configuration file model and loading
//! - SQLite pool initialization
//! - Pipeline event bus
//! - Timestamp helpers

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
pub use events::{EventBus, PipelineEvent};

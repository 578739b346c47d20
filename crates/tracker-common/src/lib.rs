//! Tracker Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, configuration structures and
//! identifier types used across all tracker components.

pub mod config;
pub mod error;
pub mod types;

pub use config::TrackerConfig;
pub use error::{Error, Result};
pub use types::*;

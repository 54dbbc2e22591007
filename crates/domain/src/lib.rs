//! Shared types used across all RELAY crates: the crate-wide error type,
//! structured trace events, and layered configuration.

pub mod config;
pub mod error;
pub mod trace;

pub use config::Config;
pub use error::{Error, Result};

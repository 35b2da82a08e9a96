//! Shared configuration schema and error types for the relay resilience layer.

pub mod config;
pub mod error;

pub use config::*;
pub use error::*;

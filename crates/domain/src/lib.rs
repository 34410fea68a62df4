//! Shared configuration and error types for the relay broker crates.

pub mod config;
pub mod error;

pub use error::{Error, Result};

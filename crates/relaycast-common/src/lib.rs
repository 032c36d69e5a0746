//! Relaycast Common - Shared types and configuration
//!
//! This crate provides identifiers, enums, configuration and the error type
//! shared by the storage layer, the dispatch engine and the server binary.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};

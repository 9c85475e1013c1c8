//! vcache Common - Shared types and utilities
//!
//! This crate provides the key types, error definitions and configuration
//! used by the vcache asset store.

pub mod config;
pub mod error;
pub mod types;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use types::*;

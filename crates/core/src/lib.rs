//! Core types for tessel
//!
//! This crate defines the foundational types used throughout the system:
//! - ObjectId, ConnectionId, TransactionId, ExtensionId, BranchId: identities
//! - Source: origin of committed changes
//! - TransactionFlags, TransactionStatus, CommitResult: lifecycle types
//! - Value: field values
//! - Version: per-object delta and its merge contract
//! - BranchConfig: branch configuration (`tessel.toml`)
//! - TesselError: error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod types;
pub mod value;
pub mod version;

pub use config::{BranchConfig, ConflictDetection, Consistency, Granularity, CONFIG_FILE_NAME};
pub use error::{TesselError, TesselResult};
pub use types::{
    BranchId, CommitResult, ConnectionId, ExtensionId, ObjectId, Source, TransactionFlags,
    TransactionId, TransactionStatus,
};
pub use value::Value;
pub use version::{FieldState, Version};

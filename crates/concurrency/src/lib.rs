//! Multi-version concurrency engine for tessel
//!
//! This crate implements optimistic, lock-free MVCC over versioned objects:
//! - Branch: public transaction owning an immutable, CAS-swapped snapshot chain
//! - Transaction: private unit of work with its own read/write sets
//! - Merge protocol: maps nobody watches fold into their successor
//! - Commit coordination: validation policies and the default manager
//! - Extensions: walkers, acknowledgers and source splitters
//!
//! Engine state is never guarded by a lock; every change installs a new
//! `Snapshot` with compare-and-swap and retries on contention.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod branch;
pub mod context;
pub mod extension;
pub mod manager;
mod merge;
pub mod retry;
pub mod sets;
pub mod snapshot;
pub mod transaction;
pub mod validation;
pub mod version_map;
pub mod version_set;
pub mod walker;

pub use branch::{AppendRequest, Branch, WeakBranch};
pub use context::{SuspendedTransaction, TransactionContext};
pub use extension::{Acknowledger, Extension, ExtensionCore, RunStatus, SourceSplitter};
pub use manager::{CommitCoordinator, CommitRequest, TransactionManager, TransactionMetrics};
pub use retry::{run_with_retry, RetryConfig};
pub use sets::TransactionSets;
pub use snapshot::{SlowChanging, Snapshot};
pub use transaction::{PendingOperations, Transaction};
pub use validation::{validate_transaction, ConflictType, ValidationResult};
pub use version_map::{InterceptionId, MapOwner, MergeState, VersionMap};
pub use version_set::VersionSet;
pub use walker::{FlushTicket, Visit, Visitor, WalkOutcome, Walker, WalkerOptions};

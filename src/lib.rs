//! tessel - multi-version concurrency core for shared transactional objects
//!
//! # Quick Start
//!
//! ```ignore
//! use tessel::{Branch, BranchConfig, ObjectId, TransactionFlags, TransactionManager};
//!
//! let trunk = Branch::trunk(BranchConfig::default());
//! let manager = TransactionManager::new();
//!
//! let mut txn = manager.begin(&trunk, TransactionFlags::NONE);
//! txn.set(ObjectId(1), "name", "Alice")?;
//! assert!(manager.commit_transaction(&mut txn)?.is_success());
//! ```
//!
//! # Architecture
//!
//! - `tessel-core`: ids, values, object versions, flags, errors, configuration
//! - `tessel-concurrency`: branches, transactions, the merge protocol and
//!   extensions
//!
//! Both are re-exported here.

pub use tessel_concurrency::*;
pub use tessel_core::*;

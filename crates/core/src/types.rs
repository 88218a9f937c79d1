//! Core identity and lifecycle types
//!
//! - ObjectId: identity of a versioned object (assigned by callers)
//! - TransactionId / ExtensionId / BranchId: process-wide identities
//! - ConnectionId: a remote peer
//! - Source: where a committed change came from
//! - TransactionFlags: per-transaction bitmask
//! - TransactionStatus / CommitResult: lifecycle outcomes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of a versioned object
///
/// Identity assignment is external to the engine; ids are supplied by callers
/// and only compared for equality and hashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj:{}", self.0)
    }
}

/// Remote peer identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn:{}", self.0)
    }
}

macro_rules! sequential_id {
    ($(#[$meta:meta])* $name:ident, $counter:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        static $counter: AtomicU64 = AtomicU64::new(1);

        impl $name {
            /// Allocate the next id (process-wide, monotonically increasing)
            pub fn next() -> Self {
                $name($counter.fetch_add(1, Ordering::Relaxed))
            }

            /// Raw numeric value
            pub fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

sequential_id!(
    /// Unique transaction identifier
    TransactionId,
    NEXT_TRANSACTION_ID,
    "txn"
);

sequential_id!(
    /// Unique extension identifier
    ExtensionId,
    NEXT_EXTENSION_ID,
    "ext"
);

sequential_id!(
    /// Unique branch identifier
    BranchId,
    NEXT_BRANCH_ID,
    "branch"
);

/// Origin of a committed version map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// Committed by a local transaction
    Local,
    /// Imported from another branch or a store
    Import,
    /// Propagated from a remote peer
    Remote(ConnectionId),
}

impl Source {
    /// Whether the values came from a remote propagation
    ///
    /// Merges involving remote-derived maps copy values instead of sharing them.
    pub fn is_remote(&self) -> bool {
        matches!(self, Source::Remote(_))
    }

    /// Originating peer, if remote
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            Source::Remote(c) => Some(*c),
            _ => None,
        }
    }
}

/// Per-transaction flag bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransactionFlags(u32);

impl TransactionFlags {
    /// No flags
    pub const NONE: TransactionFlags = TransactionFlags(0);
    /// Do not track reads
    pub const NO_READS: TransactionFlags = TransactionFlags(1 << 0);
    /// Reject writes
    pub const NO_WRITES: TransactionFlags = TransactionFlags(1 << 1);
    /// Read only up to the acknowledged boundary
    pub const IGNORE_SPECULATIVE: TransactionFlags = TransactionFlags(1 << 2);
    /// Transaction has committed
    pub const COMMITTED: TransactionFlags = TransactionFlags(1 << 3);
    /// Public transaction (trunk or branch)
    pub const PUBLIC: TransactionFlags = TransactionFlags(1 << 4);
    /// Originated from a remote peer
    pub const REMOTE: TransactionFlags = TransactionFlags(1 << 5);
    /// Started implicitly by a single operation
    pub const AUTO: TransactionFlags = TransactionFlags(1 << 6);
    /// Runs on behalf of a remote method call
    pub const REMOTE_METHOD_CALL: TransactionFlags = TransactionFlags(1 << 7);

    /// Flags a child never inherits from its parent
    pub const NOT_INHERITED: TransactionFlags =
        TransactionFlags(Self::COMMITTED.0 | Self::REMOTE.0 | Self::PUBLIC.0);

    /// Raw bits
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Whether every flag in `other` is set
    pub fn contains(&self, other: TransactionFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the flags in `other`
    pub fn insert(&mut self, other: TransactionFlags) {
        self.0 |= other.0;
    }

    /// Clear the flags in `other`
    pub fn remove(&mut self, other: TransactionFlags) {
        self.0 &= !other.0;
    }

    /// Copy of `self` without the flags in `other`
    pub fn without(self, other: TransactionFlags) -> TransactionFlags {
        TransactionFlags(self.0 & !other.0)
    }

    /// Whether no flag is set
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for TransactionFlags {
    type Output = TransactionFlags;

    fn bitor(self, rhs: TransactionFlags) -> TransactionFlags {
        TransactionFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for TransactionFlags {
    fn bitor_assign(&mut self, rhs: TransactionFlags) {
        self.0 |= rhs.0;
    }
}

/// Status of a transaction with respect to its execution context
///
/// State transitions:
/// - `Default` → `Suspended` (detached from its context)
/// - `Suspended` → `Default` (reattached, possibly on another thread)
/// - `Default` → `Published` (its writes became visible on the branch)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    /// Attached and running
    #[default]
    Default,
    /// Detached; may be resumed elsewhere unless committed
    Suspended,
    /// Writes folded into a committed version map
    Published,
}

/// Outcome of a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitResult {
    /// Writes are now part of the branch history
    Success,
    /// Validation failed; retry from a fresh parent snapshot
    Conflict,
    /// Fatal for this unit of work; not necessarily retry-safe
    Abort,
}

impl CommitResult {
    /// Whether the commit succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, CommitResult::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_contains_and_insert() {
        let mut flags = TransactionFlags::NO_READS;
        assert!(flags.contains(TransactionFlags::NO_READS));
        assert!(!flags.contains(TransactionFlags::NO_WRITES));

        flags.insert(TransactionFlags::NO_WRITES);
        assert!(flags.contains(TransactionFlags::NO_READS | TransactionFlags::NO_WRITES));

        flags.remove(TransactionFlags::NO_READS);
        assert!(!flags.contains(TransactionFlags::NO_READS));
        assert!(flags.contains(TransactionFlags::NO_WRITES));
    }

    #[test]
    fn test_flags_inheritance_mask() {
        let parent = TransactionFlags::COMMITTED
            | TransactionFlags::REMOTE
            | TransactionFlags::IGNORE_SPECULATIVE;
        let child = parent.without(TransactionFlags::NOT_INHERITED);
        assert!(child.contains(TransactionFlags::IGNORE_SPECULATIVE));
        assert!(!child.contains(TransactionFlags::COMMITTED));
        assert!(!child.contains(TransactionFlags::REMOTE));
    }

    #[test]
    fn test_sequential_ids_increase() {
        let a = TransactionId::next();
        let b = TransactionId::next();
        assert!(b > a);
        assert!(b.to_string().starts_with("txn:"));
    }

    #[test]
    fn test_source_connection() {
        let remote = Source::Remote(ConnectionId(9));
        assert!(remote.is_remote());
        assert_eq!(remote.connection(), Some(ConnectionId(9)));
        assert!(!Source::Local.is_remote());
        assert_eq!(Source::Import.connection(), None);
    }
}

//! Commit validation
//!
//! A transaction is validated against the maps appended to its branch after
//! the map it captured. What counts as a conflict depends on the branch's
//! `ConflictDetection` policy:
//!
//! - `ReadWriteConflicts`: a later map wrote an object this transaction read
//! - `WriteWriteConflicts`: a later map wrote an object this transaction wrote
//! - `LastWriteWins`: never
//!
//! Read-only transactions always validate: they have nothing to publish.

use crate::version_map::VersionMap;
use crate::version_set::VersionSet;
use std::sync::Arc;
use tessel_core::{ConflictDetection, ObjectId};

/// Conflict found during validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictType {
    /// A later map wrote an object this transaction read
    ReadWriteConflict {
        /// Object read by the transaction
        object: ObjectId,
        /// Sequence of the map that wrote it
        sequence: u64,
    },

    /// A later map wrote an object this transaction also wrote
    WriteWriteConflict {
        /// Object written by both
        object: ObjectId,
        /// Sequence of the map that wrote it
        sequence: u64,
    },
}

/// Result of transaction validation
///
/// Accumulates the first conflict found in each later map.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Conflicts detected during validation
    pub conflicts: Vec<ConflictType>,
}

impl ValidationResult {
    /// Result without conflicts
    pub fn ok() -> Self {
        Self::default()
    }

    /// Whether the transaction may commit
    pub fn is_valid(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Number of conflicts
    pub fn conflict_count(&self) -> usize {
        self.conflicts.len()
    }

    /// Human-readable summary for logs and errors
    pub fn describe(&self) -> String {
        match self.conflicts.first() {
            None => "no conflicts".to_string(),
            Some(ConflictType::ReadWriteConflict { object, sequence }) => format!(
                "{} read by this transaction was written by map {} ({} conflict(s))",
                object,
                sequence,
                self.conflict_count()
            ),
            Some(ConflictType::WriteWriteConflict { object, sequence }) => format!(
                "{} was also written by map {} ({} conflict(s))",
                object,
                sequence,
                self.conflict_count()
            ),
        }
    }
}

/// Validate a transaction's sets against the maps appended after its
/// captured map
///
/// `later` pairs each later map with its write set, oldest first.
pub fn validate_transaction<'a>(
    policy: ConflictDetection,
    later: impl IntoIterator<Item = (&'a Arc<VersionMap>, &'a Arc<VersionSet>)>,
    reads: Option<&VersionSet>,
    writes: &VersionSet,
) -> ValidationResult {
    if writes.is_empty() {
        return ValidationResult::ok();
    }
    let mut result = ValidationResult::ok();
    match policy {
        ConflictDetection::LastWriteWins => {}
        ConflictDetection::ReadWriteConflicts => {
            let Some(reads) = reads else {
                return result;
            };
            for (map, written) in later {
                if let Some(object) = written.first_common(reads) {
                    result.conflicts.push(ConflictType::ReadWriteConflict {
                        object,
                        sequence: map.sequence(),
                    });
                }
            }
        }
        ConflictDetection::WriteWriteConflicts => {
            for (map, written) in later {
                if let Some(object) = written.first_common(writes) {
                    result.conflicts.push(ConflictType::WriteWriteConflict {
                        object,
                        sequence: map.sequence(),
                    });
                }
            }
        }
    }
    result
}

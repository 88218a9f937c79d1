//! Commit coordination
//!
//! A private transaction does not publish itself: it hands its sets to a
//! `CommitCoordinator`. The default coordinator, `TransactionManager`, runs
//! optimistic validation against the branch's current snapshot and appends
//! with `Branch::try_append`, revalidating after every lost CAS.
//!
//! ## Commit Sequence
//!
//! ```text
//! 1. Nothing written                  -> Success, no map appended
//! 2. Source is a blocked peer         -> Abort
//! 3. Locate the transaction's base map in the current snapshot
//!    (gone after a rollback)          -> Conflict
//! 4. Validate against every map after the base
//!    (policy from BranchConfig)       -> Conflict
//! 5. try_append(current, request)     -> Success
//!    lost the CAS                     -> reload, goto 2
//! ```

use crate::branch::{AppendRequest, Branch};
use crate::snapshot::Snapshot;
use crate::transaction::Transaction;
use crate::validation::validate_transaction;
use crate::version_map::{MapOwner, VersionMap};
use crate::version_set::VersionSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tessel_core::{
    CommitResult, Source, TesselResult, TransactionFlags, TransactionId,
};
use tracing::{debug, trace, warn};

/// Everything a coordinator needs to commit one private transaction
#[derive(Debug)]
pub struct CommitRequest<'a> {
    /// Committing transaction
    pub transaction: TransactionId,
    /// Branch to append to
    pub branch: &'a Branch,
    /// Snapshot captured when the transaction started
    pub captured: &'a Arc<Snapshot>,
    /// Map validation starts after
    pub base: &'a Arc<VersionMap>,
    /// Buffered writes
    pub writes: Arc<VersionSet>,
    /// Tracked reads; `None` with `NO_READS`
    pub reads: Option<VersionSet>,
    /// Transaction flags at commit
    pub flags: TransactionFlags,
    /// Origin recorded on the appended map
    pub source: Source,
}

/// Validates and appends committed transactions
///
/// Implementations may add work around the append (replication, auditing)
/// but must publish through `Branch::try_append`.
pub trait CommitCoordinator: Send + Sync {
    /// Commit one transaction
    ///
    /// `Conflict` and `Abort` are outcomes; errors are reserved for protocol
    /// violations.
    fn commit(&self, request: CommitRequest<'_>) -> TesselResult<CommitResult>;
}

/// Point-in-time view of commit counters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransactionMetrics {
    /// Transactions started through `begin`
    pub total_started: u64,
    /// Commits that appended or had nothing to append
    pub total_committed: u64,
    /// Commits rejected by validation
    pub total_conflicted: u64,
    /// Commits refused (blocked peer)
    pub total_aborted: u64,
    /// Committed over all completed commits (0.0 when none completed)
    pub commit_rate: f64,
}

impl TransactionMetrics {
    /// Commits that reached an outcome
    pub fn total_completed(&self) -> u64 {
        self.total_committed + self.total_conflicted + self.total_aborted
    }

    /// Share of completed commits that did not succeed
    pub fn abort_rate(&self) -> f64 {
        let completed = self.total_completed();
        if completed == 0 {
            0.0
        } else {
            (self.total_conflicted + self.total_aborted) as f64 / completed as f64
        }
    }
}

/// Default optimistic commit coordinator
///
/// The counters use Relaxed ordering: they are observational and do not
/// synchronize anything else.
#[derive(Debug, Default)]
pub struct TransactionManager {
    total_started: AtomicU64,
    total_committed: AtomicU64,
    total_conflicted: AtomicU64,
    total_aborted: AtomicU64,
}

impl TransactionManager {
    /// New manager with zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a private transaction on `branch`
    pub fn begin(&self, branch: &Branch, flags: TransactionFlags) -> Transaction {
        self.total_started.fetch_add(1, Ordering::Relaxed);
        branch.start(flags)
    }

    /// Commit `txn` through this manager
    ///
    /// # Errors
    ///
    /// `InvalidState` if the transaction is finished, suspended or nested.
    pub fn commit_transaction(&self, txn: &mut Transaction) -> TesselResult<CommitResult> {
        txn.commit(self)
    }

    /// Snapshot of the counters
    pub fn metrics(&self) -> TransactionMetrics {
        let total_committed = self.total_committed.load(Ordering::Relaxed);
        let total_conflicted = self.total_conflicted.load(Ordering::Relaxed);
        let total_aborted = self.total_aborted.load(Ordering::Relaxed);
        let completed = total_committed + total_conflicted + total_aborted;
        TransactionMetrics {
            total_started: self.total_started.load(Ordering::Relaxed),
            total_committed,
            total_conflicted,
            total_aborted,
            commit_rate: if completed == 0 {
                0.0
            } else {
                total_committed as f64 / completed as f64
            },
        }
    }

    fn record(&self, result: CommitResult) -> TesselResult<CommitResult> {
        let counter = match result {
            CommitResult::Success => &self.total_committed,
            CommitResult::Conflict => &self.total_conflicted,
            CommitResult::Abort => &self.total_aborted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }
}

impl CommitCoordinator for TransactionManager {
    fn commit(&self, request: CommitRequest<'_>) -> TesselResult<CommitResult> {
        let CommitRequest {
            transaction,
            branch,
            base,
            writes,
            reads,
            flags,
            source,
            ..
        } = request;

        if writes.is_empty() {
            trace!(target: "tessel::txn", txn = %transaction, "nothing written, commit is a no-op");
            branch.recycle(writes);
            if let Some(reads) = reads {
                branch.recycle_set(reads);
            }
            return self.record(CommitResult::Success);
        }

        let policy = branch.config().conflict_detection;
        let append = AppendRequest {
            writes,
            reads: reads.map(Arc::new),
            source,
            owner: Some(MapOwner { transaction, flags }),
        };

        loop {
            let current = branch.current();
            if let Some(connection) = source.connection() {
                if current.slow_changing().is_blocked(connection) {
                    warn!(
                        target: "tessel::txn",
                        txn = %transaction,
                        %connection,
                        "commit from blocked peer refused"
                    );
                    return self.finish(branch, append, CommitResult::Abort);
                }
            }

            let Some(index) = current.position(base) else {
                debug!(target: "tessel::txn", txn = %transaction, "base map rolled back");
                return self.finish(branch, append, CommitResult::Conflict);
            };
            let later = current.version_maps()[index + 1..]
                .iter()
                .zip(current.writes()[index + 1..].iter());
            let validation =
                validate_transaction(policy, later, append.reads.as_deref(), &append.writes);
            if !validation.is_valid() {
                debug!(
                    target: "tessel::txn",
                    txn = %transaction,
                    conflicts = validation.conflict_count(),
                    reason = %validation.describe(),
                    "validation failed"
                );
                return self.finish(branch, append, CommitResult::Conflict);
            }

            if branch.try_append(&current, &append).is_some() {
                if let Some(reads) = append.reads {
                    branch.recycle(reads);
                }
                return self.record(CommitResult::Success);
            }
            trace!(target: "tessel::txn", txn = %transaction, "append CAS lost, revalidating");
        }
    }
}

impl TransactionManager {
    /// Return the request's storage and record a failed outcome
    fn finish(
        &self,
        branch: &Branch,
        request: AppendRequest,
        result: CommitResult,
    ) -> TesselResult<CommitResult> {
        branch.recycle(request.writes);
        if let Some(reads) = request.reads {
            branch.recycle(reads);
        }
        self.record(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_core::{BranchConfig, ConflictDetection, ConnectionId, ObjectId, Value};

    fn trunk(policy: ConflictDetection) -> Branch {
        Branch::trunk(BranchConfig::default().with_conflict_detection(policy))
    }

    #[test]
    fn test_read_write_conflict_first_committer_wins() {
        let branch = trunk(ConflictDetection::ReadWriteConflicts);
        let manager = TransactionManager::new();
        let mut t1 = manager.begin(&branch, TransactionFlags::NONE);
        let mut t2 = manager.begin(&branch, TransactionFlags::NONE);

        t1.field(ObjectId(1), "v").unwrap();
        t1.set(ObjectId(1), "v", 1i64).unwrap();
        t2.field(ObjectId(1), "v").unwrap();
        t2.set(ObjectId(1), "v", 2i64).unwrap();

        assert_eq!(manager.commit_transaction(&mut t1).unwrap(), CommitResult::Success);
        assert_eq!(manager.commit_transaction(&mut t2).unwrap(), CommitResult::Conflict);
        assert_eq!(branch.current().field(ObjectId(1), "v"), Some(Value::Int(1)));

        let metrics = manager.metrics();
        assert_eq!(metrics.total_started, 2);
        assert_eq!(metrics.total_committed, 1);
        assert_eq!(metrics.total_conflicted, 1);
        assert!((metrics.commit_rate - 0.5).abs() < f64::EPSILON);
        assert!((metrics.abort_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_disjoint_writers_both_commit() {
        let branch = trunk(ConflictDetection::ReadWriteConflicts);
        let manager = TransactionManager::new();
        let mut t1 = manager.begin(&branch, TransactionFlags::NONE);
        let mut t2 = manager.begin(&branch, TransactionFlags::NONE);
        t1.set(ObjectId(1), "v", 1i64).unwrap();
        t2.field(ObjectId(2), "v").unwrap();
        t2.set(ObjectId(2), "v", 2i64).unwrap();

        assert!(manager.commit_transaction(&mut t1).unwrap().is_success());
        assert!(manager.commit_transaction(&mut t2).unwrap().is_success());
        let snap = branch.current();
        assert_eq!(snap.field(ObjectId(1), "v"), Some(Value::Int(1)));
        assert_eq!(snap.field(ObjectId(2), "v"), Some(Value::Int(2)));
    }

    #[test]
    fn test_write_write_policy_rejects_overlapping_blind_writes() {
        let branch = trunk(ConflictDetection::WriteWriteConflicts);
        let manager = TransactionManager::new();
        let mut t1 = manager.begin(&branch, TransactionFlags::NONE);
        let mut t2 = manager.begin(&branch, TransactionFlags::NONE);
        t1.set(ObjectId(1), "v", 1i64).unwrap();
        t2.set(ObjectId(1), "v", 2i64).unwrap();

        assert!(manager.commit_transaction(&mut t1).unwrap().is_success());
        assert_eq!(manager.commit_transaction(&mut t2).unwrap(), CommitResult::Conflict);
    }

    #[test]
    fn test_last_write_wins() {
        let branch = trunk(ConflictDetection::LastWriteWins);
        let manager = TransactionManager::new();
        let mut t1 = manager.begin(&branch, TransactionFlags::NONE);
        let mut t2 = manager.begin(&branch, TransactionFlags::NONE);
        t1.field(ObjectId(1), "v").unwrap();
        t1.set(ObjectId(1), "v", 1i64).unwrap();
        t2.field(ObjectId(1), "v").unwrap();
        t2.set(ObjectId(1), "v", 2i64).unwrap();

        assert!(manager.commit_transaction(&mut t1).unwrap().is_success());
        assert!(manager.commit_transaction(&mut t2).unwrap().is_success());
        assert_eq!(branch.current().field(ObjectId(1), "v"), Some(Value::Int(2)));
    }

    #[test]
    fn test_empty_commit_appends_nothing() {
        let branch = trunk(ConflictDetection::ReadWriteConflicts);
        let manager = TransactionManager::new();
        let before = branch.current().next_sequence();
        let mut txn = manager.begin(&branch, TransactionFlags::NONE);
        txn.field(ObjectId(1), "v").unwrap();
        assert!(manager.commit_transaction(&mut txn).unwrap().is_success());
        assert_eq!(branch.current().next_sequence(), before);
    }

    #[test]
    fn test_blocked_peer_aborts() {
        let branch = trunk(ConflictDetection::ReadWriteConflicts);
        let manager = TransactionManager::new();
        branch.block(ConnectionId(7));
        let mut txn = branch.start_remote(TransactionFlags::NONE, ConnectionId(7));
        txn.set(ObjectId(1), "v", 1i64).unwrap();
        assert_eq!(manager.commit_transaction(&mut txn).unwrap(), CommitResult::Abort);
        assert_eq!(manager.metrics().total_aborted, 1);
        assert_eq!(branch.current().field(ObjectId(1), "v"), None);
    }

    #[test]
    fn test_appended_map_records_owner() {
        let branch = trunk(ConflictDetection::ReadWriteConflicts);
        let manager = TransactionManager::new();
        let reader = branch.start(TransactionFlags::NONE);
        let mut txn = manager.begin(&branch, TransactionFlags::NONE);
        let id = txn.id();
        txn.set(ObjectId(1), "v", 1i64).unwrap();
        manager.commit_transaction(&mut txn).unwrap();

        let head = Arc::clone(branch.current().head());
        assert_eq!(head.owner().map(|o| o.transaction), Some(id));
        assert_eq!(head.source(), Source::Local);
        drop(reader);
    }
}

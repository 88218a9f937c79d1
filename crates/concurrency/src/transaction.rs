//! Private transactions
//!
//! A `Transaction` is one unit of work started from a public `Branch`. It
//! captures a protected snapshot of the branch (the captured head, and the
//! acknowledged boundary when speculative maps exist, carry one watcher each
//! for as long as the transaction lives), records what it reads and buffers
//! what it writes in its own `TransactionSets`.
//!
//! Lifecycle:
//! - `commit` hands the sets to a `CommitCoordinator`, releases the
//!   protection and, on success, marks the transaction `COMMITTED`.
//! - `abort` discards the writes and releases the protection. Dropping an
//!   unfinished transaction aborts it.
//! - `start_child` opens a nested transaction sharing this one's view plus its
//!   pending writes; `merge_child` folds the child back in. A nested child is
//!   never committed to the branch directly.
//! - `suspend`/`resume` detach and reattach the transaction to an execution
//!   context; a suspended transaction rejects every operation.

use crate::branch::{Branch, Protection, ProtectedSnapshot};
use crate::manager::{CommitCoordinator, CommitRequest};
use crate::sets::TransactionSets;
use crate::snapshot::Snapshot;
use crate::version_map::VersionMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessel_core::{
    CommitResult, ObjectId, Source, TesselError, TesselResult, TransactionFlags, TransactionId,
    TransactionStatus, Value, Version,
};
use tracing::{debug, warn};

/// Summary of buffered work, as reported before commit or abort
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingOperations {
    /// Objects with buffered writes
    pub writes: usize,
    /// Objects read
    pub reads: usize,
}

impl PendingOperations {
    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.writes == 0 && self.reads == 0
    }
}

/// Private transaction
pub struct Transaction {
    id: TransactionId,
    branch: Branch,
    /// Private parent for nested transactions
    parent: Option<TransactionId>,
    flags: TransactionFlags,
    status: TransactionStatus,
    source: Source,
    captured: Arc<Snapshot>,
    /// Map validation starts after: the captured head, or the captured
    /// boundary when speculative maps are ignored
    base: Arc<VersionMap>,
    watched: Protection,
    sets: TransactionSets,
    finished: bool,
    start_time: Instant,
}

impl Transaction {
    pub(crate) fn private(
        branch: Branch,
        protected: ProtectedSnapshot,
        flags: TransactionFlags,
        source: Source,
    ) -> Transaction {
        let ProtectedSnapshot { snapshot, watched } = protected;
        let ignore_speculative = flags.contains(TransactionFlags::IGNORE_SPECULATIVE);
        let (visible, base) = if ignore_speculative {
            (
                snapshot.acknowledged_index() + 1,
                Arc::clone(snapshot.acknowledged_map()),
            )
        } else {
            (snapshot.len(), Arc::clone(snapshot.head()))
        };
        let writes = (!flags.contains(TransactionFlags::NO_WRITES)).then(|| branch.acquire_set());
        let reads = (!flags.contains(TransactionFlags::NO_READS)).then(|| branch.acquire_set());
        let sets = TransactionSets::new(writes, reads, Arc::clone(snapshot.writes_arc()), visible);

        let txn = Transaction {
            id: TransactionId::next(),
            branch,
            parent: None,
            flags,
            status: TransactionStatus::Default,
            source,
            captured: snapshot,
            base,
            watched,
            sets,
            finished: false,
            start_time: Instant::now(),
        };
        debug!(
            target: "tessel::txn",
            txn = %txn.id,
            branch = %txn.branch.id(),
            head = txn.captured.head().sequence(),
            "transaction started"
        );
        txn
    }

    /// Transaction id
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Branch the transaction belongs to
    pub fn branch(&self) -> &Branch {
        &self.branch
    }

    /// Private parent, for nested transactions
    pub fn parent(&self) -> Option<TransactionId> {
        self.parent
    }

    /// Whether this is a nested child of another private transaction
    pub fn is_nested(&self) -> bool {
        self.parent.is_some()
    }

    /// Current flags
    pub fn flags(&self) -> TransactionFlags {
        self.flags
    }

    /// Status relative to the execution context
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Origin recorded on the committed map
    pub fn source(&self) -> Source {
        self.source
    }

    /// Snapshot captured at start
    pub fn captured(&self) -> &Arc<Snapshot> {
        &self.captured
    }

    /// Read/write storage
    pub fn sets(&self) -> &TransactionSets {
        &self.sets
    }

    /// Whether the transaction committed successfully
    pub fn is_committed(&self) -> bool {
        self.flags.contains(TransactionFlags::COMMITTED)
    }

    /// Whether commit or abort already ran
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Time since start
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Whether the transaction has written nothing
    pub fn is_read_only(&self) -> bool {
        self.sets.writes().map_or(true, |w| w.is_empty())
    }

    /// Buffered writes and tracked reads
    pub fn pending_operations(&self) -> PendingOperations {
        PendingOperations {
            writes: self.sets.writes().map_or(0, |w| w.len()),
            reads: self.sets.reads().map_or(0, |r| r.len()),
        }
    }

    /// Check that the transaction accepts operations
    ///
    /// # Errors
    ///
    /// `InvalidState` once finished or while suspended.
    pub fn ensure_active(&self) -> TesselResult<()> {
        if self.finished {
            return Err(TesselError::invalid_state(format!(
                "transaction {} already finished",
                self.id
            )));
        }
        if self.status == TransactionStatus::Suspended {
            return Err(TesselError::invalid_state(format!(
                "transaction {} is suspended",
                self.id
            )));
        }
        Ok(())
    }

    /// Object state as this transaction observes it; records the read
    pub fn get(&mut self, object: ObjectId) -> TesselResult<Option<Version>> {
        self.ensure_active()?;
        self.sets.record_read(object);
        Ok(self.sets.resolve(object))
    }

    /// One field as this transaction observes it; records the read
    pub fn field(&mut self, object: ObjectId, field: &str) -> TesselResult<Option<Value>> {
        self.ensure_active()?;
        self.sets.record_read(object);
        Ok(self.sets.field(object, field))
    }

    fn version_mut(&mut self, object: ObjectId) -> TesselResult<&mut Version> {
        self.ensure_active()?;
        if !self.sets.tracks_writes() {
            return Err(TesselError::invalid_state(format!(
                "transaction {} was started with NO_WRITES",
                self.id
            )));
        }
        let id = self.id;
        self.sets
            .version_mut(object)
            .ok_or_else(|| TesselError::invalid_state(format!("transaction {} has no write set", id)))
    }

    /// Write one field
    pub fn set(
        &mut self,
        object: ObjectId,
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> TesselResult<()> {
        self.version_mut(object)?.set(field, value);
        Ok(())
    }

    /// Remove one field
    pub fn remove(&mut self, object: ObjectId, field: impl Into<String>) -> TesselResult<()> {
        self.version_mut(object)?.remove(field);
        Ok(())
    }

    /// Reset the object; fields written afterwards apply to an empty object
    pub fn clear(&mut self, object: ObjectId) -> TesselResult<()> {
        self.version_mut(object)?.clear();
        Ok(())
    }

    /// Nested transaction over this one's view and pending writes
    ///
    /// The child holds no watchers; the parent's protection covers it.
    /// Flags are inherited except `COMMITTED`, `REMOTE` and `PUBLIC`.
    pub fn start_child(&self, flags: TransactionFlags) -> TesselResult<Transaction> {
        self.ensure_active()?;
        let flags = self.flags.without(TransactionFlags::NOT_INHERITED) | flags;
        let sets = self.sets.nested(
            !flags.contains(TransactionFlags::NO_WRITES),
            !flags.contains(TransactionFlags::NO_READS),
        );
        let child = Transaction {
            id: TransactionId::next(),
            branch: self.branch.clone(),
            parent: Some(self.id),
            flags,
            status: TransactionStatus::Default,
            source: self.source,
            captured: Arc::clone(&self.captured),
            base: Arc::clone(&self.base),
            watched: Protection::new(),
            sets,
            finished: false,
            start_time: Instant::now(),
        };
        debug!(target: "tessel::txn", txn = %child.id, parent = %self.id, "nested transaction started");
        Ok(child)
    }

    /// Fold a nested child's writes and reads into this transaction
    ///
    /// # Errors
    ///
    /// `InvalidState` if `child` is not this transaction's child, or either
    /// side is no longer active.
    pub fn merge_child(&mut self, mut child: Transaction) -> TesselResult<()> {
        self.ensure_active()?;
        child.ensure_active()?;
        if child.parent != Some(self.id) {
            return Err(TesselError::invalid_state(format!(
                "transaction {} is not a child of {}",
                child.id, self.id
            )));
        }
        self.sets.absorb_child(&mut child.sets);
        child.flags.insert(TransactionFlags::COMMITTED);
        child.status = TransactionStatus::Published;
        child.finished = true;
        debug!(target: "tessel::txn", txn = %child.id, parent = %self.id, "nested transaction merged");
        Ok(())
    }

    fn release_protection(&mut self) {
        self.finished = true;
        let watched = std::mem::take(&mut self.watched);
        self.branch.release_all(watched);
    }

    /// Validate and append through `coordinator`
    ///
    /// `Conflict` and `Abort` are outcomes, not errors; either way the
    /// transaction is finished afterwards.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the transaction is finished, suspended or nested.
    pub fn commit(&mut self, coordinator: &dyn CommitCoordinator) -> TesselResult<CommitResult> {
        self.ensure_active()?;
        if let Some(parent) = self.parent {
            return Err(TesselError::invalid_state(format!(
                "nested transaction {} must be merged into {}",
                self.id, parent
            )));
        }
        let (writes, reads) = self.sets.take_for_commit();
        let outcome = coordinator.commit(CommitRequest {
            transaction: self.id,
            branch: &self.branch,
            captured: &self.captured,
            base: &self.base,
            writes,
            reads,
            flags: self.flags,
            source: self.source,
        });
        self.release_protection();
        for set in self.sets.reset() {
            self.branch.recycle_set(set);
        }

        match &outcome {
            Ok(CommitResult::Success) => {
                self.flags.insert(TransactionFlags::COMMITTED);
                self.status = TransactionStatus::Published;
                debug!(target: "tessel::txn", txn = %self.id, "transaction committed");
            }
            Ok(CommitResult::Conflict) => {
                debug!(target: "tessel::txn", txn = %self.id, "transaction conflicted");
            }
            Ok(CommitResult::Abort) => {
                warn!(target: "tessel::txn", txn = %self.id, "transaction aborted by coordinator");
            }
            Err(e) => {
                warn!(target: "tessel::txn", txn = %self.id, error = %e, "commit failed");
            }
        }
        outcome
    }

    /// Discard writes and release the captured snapshot
    ///
    /// Does nothing once the transaction is finished.
    pub fn abort(&mut self) {
        if self.finished {
            return;
        }
        self.release_protection();
        for set in self.sets.reset() {
            self.branch.recycle_set(set);
        }
        debug!(target: "tessel::txn", txn = %self.id, "transaction aborted");
    }

    /// Detach from the current execution context
    pub fn suspend(&mut self) -> TesselResult<()> {
        self.ensure_active()?;
        self.status = TransactionStatus::Suspended;
        Ok(())
    }

    /// Reattach after `suspend`
    ///
    /// # Errors
    ///
    /// `InvalidState` if the transaction committed or is not suspended.
    pub fn resume(&mut self) -> TesselResult<()> {
        if self.is_committed() || self.finished {
            return Err(TesselError::invalid_state(format!(
                "transaction {} already finished and cannot be resumed",
                self.id
            )));
        }
        if self.status != TransactionStatus::Suspended {
            return Err(TesselError::invalid_state(format!(
                "transaction {} is not suspended",
                self.id
            )));
        }
        self.status = TransactionStatus::Default;
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.abort();
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("branch", &self.branch.id())
            .field("parent", &self.parent)
            .field("flags", &self.flags)
            .field("status", &self.status)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransactionManager;
    use tessel_core::BranchConfig;

    static_assertions::assert_impl_all!(Transaction: Send);

    fn trunk() -> Branch {
        Branch::trunk(BranchConfig::default())
    }

    fn committed(branch: &Branch, object: u64, value: i64) {
        let mut txn = branch.start(TransactionFlags::NONE);
        txn.set(ObjectId(object), "v", value).unwrap();
        assert!(txn.commit(&TransactionManager::new()).unwrap().is_success());
    }

    #[test]
    fn test_reads_own_writes_over_snapshot() {
        let branch = trunk();
        committed(&branch, 1, 1);

        let mut txn = branch.start(TransactionFlags::NONE);
        assert_eq!(txn.field(ObjectId(1), "v").unwrap(), Some(Value::Int(1)));
        txn.set(ObjectId(1), "v", 5i64).unwrap();
        assert_eq!(txn.field(ObjectId(1), "v").unwrap(), Some(Value::Int(5)));
        assert_eq!(
            txn.pending_operations(),
            PendingOperations { writes: 1, reads: 1 }
        );
    }

    #[test]
    fn test_snapshot_isolation() {
        let branch = trunk();
        committed(&branch, 1, 1);
        let mut reader = branch.start(TransactionFlags::NONE);
        committed(&branch, 1, 2);
        assert_eq!(reader.field(ObjectId(1), "v").unwrap(), Some(Value::Int(1)));
        assert_eq!(branch.current().field(ObjectId(1), "v"), Some(Value::Int(2)));
    }

    #[test]
    fn test_commit_twice_is_protocol_error() {
        let branch = trunk();
        let mut txn = branch.start(TransactionFlags::NONE);
        txn.set(ObjectId(1), "v", 1i64).unwrap();
        assert!(txn.commit(&TransactionManager::new()).unwrap().is_success());
        assert!(txn.is_committed());
        assert_eq!(txn.status(), TransactionStatus::Published);

        let err = txn.commit(&TransactionManager::new()).unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(txn.set(ObjectId(1), "v", 2i64).is_err());
    }

    #[test]
    fn test_no_writes_flag() {
        let branch = trunk();
        let mut txn = branch.start(TransactionFlags::NO_WRITES);
        let err = txn.set(ObjectId(1), "v", 1i64).unwrap_err();
        assert!(matches!(err, TesselError::InvalidState(_)));
        assert!(txn.is_read_only());
    }

    #[test]
    fn test_no_reads_flag() {
        let branch = trunk();
        let mut txn = branch.start(TransactionFlags::NO_READS);
        txn.get(ObjectId(1)).unwrap();
        assert_eq!(txn.pending_operations().reads, 0);
    }

    #[test]
    fn test_abort_releases_protection() {
        let branch = trunk();
        committed(&branch, 1, 1);
        let mut txn = branch.start(TransactionFlags::NONE);
        let head = Arc::clone(branch.current().head());
        assert_eq!(head.watchers(), 3);

        txn.set(ObjectId(1), "v", 9i64).unwrap();
        txn.abort();
        assert!(txn.is_finished());
        assert_eq!(head.watchers(), 2);
        assert_eq!(branch.current().field(ObjectId(1), "v"), Some(Value::Int(1)));
        // Idempotent, and drop does not release twice
        txn.abort();
        drop(txn);
        assert_eq!(head.watchers(), 2);
    }

    #[test]
    fn test_drop_aborts() {
        let branch = trunk();
        let head = Arc::clone(branch.current().head());
        {
            let mut txn = branch.start(TransactionFlags::NONE);
            txn.set(ObjectId(1), "v", 1i64).unwrap();
            assert_eq!(head.watchers(), 3);
        }
        assert_eq!(head.watchers(), 2);
        assert_eq!(branch.current().field(ObjectId(1), "v"), None);
    }

    #[test]
    fn test_nested_child_merge() {
        let branch = trunk();
        let mut parent = branch.start(TransactionFlags::NONE);
        parent.set(ObjectId(1), "a", 1i64).unwrap();

        let mut child = parent.start_child(TransactionFlags::NONE).unwrap();
        assert!(child.is_nested());
        assert_eq!(child.field(ObjectId(1), "a").unwrap(), Some(Value::Int(1)));
        child.set(ObjectId(1), "b", 2i64).unwrap();
        assert_eq!(parent.field(ObjectId(1), "b").unwrap(), None);

        parent.merge_child(child).unwrap();
        assert_eq!(parent.field(ObjectId(1), "b").unwrap(), Some(Value::Int(2)));
        assert!(parent.commit(&TransactionManager::new()).unwrap().is_success());

        let snap = branch.current();
        assert_eq!(snap.field(ObjectId(1), "a"), Some(Value::Int(1)));
        assert_eq!(snap.field(ObjectId(1), "b"), Some(Value::Int(2)));
    }

    #[test]
    fn test_nested_child_cannot_commit() {
        let branch = trunk();
        let parent = branch.start(TransactionFlags::NONE);
        let mut child = parent.start_child(TransactionFlags::NONE).unwrap();
        child.set(ObjectId(1), "a", 1i64).unwrap();
        let err = child.commit(&TransactionManager::new()).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_merge_foreign_child_rejected() {
        let branch = trunk();
        let mut a = branch.start(TransactionFlags::NONE);
        let b = branch.start(TransactionFlags::NONE);
        let child_of_b = b.start_child(TransactionFlags::NONE).unwrap();
        assert!(a.merge_child(child_of_b).is_err());
    }

    #[test]
    fn test_child_flags_inheritance() {
        let branch = trunk();
        let parent = branch.start_remote(
            TransactionFlags::IGNORE_SPECULATIVE,
            tessel_core::ConnectionId(1),
        );
        let child = parent.start_child(TransactionFlags::NO_READS).unwrap();
        assert!(child.flags().contains(TransactionFlags::IGNORE_SPECULATIVE));
        assert!(child.flags().contains(TransactionFlags::NO_READS));
        assert!(!child.flags().contains(TransactionFlags::REMOTE));
    }

    #[test]
    fn test_suspend_blocks_operations() {
        let branch = trunk();
        let mut txn = branch.start(TransactionFlags::NONE);
        txn.suspend().unwrap();
        assert_eq!(txn.status(), TransactionStatus::Suspended);
        assert!(txn.set(ObjectId(1), "v", 1i64).is_err());
        assert!(txn.commit(&TransactionManager::new()).is_err());

        txn.resume().unwrap();
        txn.set(ObjectId(1), "v", 1i64).unwrap();
        assert!(txn.commit(&TransactionManager::new()).unwrap().is_success());
        assert!(txn.resume().is_err());
    }

    #[test]
    fn test_clear_and_remove() {
        let branch = trunk();
        let mut setup = branch.start(TransactionFlags::NONE);
        setup.set(ObjectId(1), "a", 1i64).unwrap();
        setup.set(ObjectId(1), "b", 2i64).unwrap();
        setup.set(ObjectId(2), "c", 3i64).unwrap();
        setup.commit(&TransactionManager::new()).unwrap();

        let mut txn = branch.start(TransactionFlags::NONE);
        txn.clear(ObjectId(1)).unwrap();
        txn.set(ObjectId(1), "z", 26i64).unwrap();
        txn.remove(ObjectId(2), "c").unwrap();
        txn.commit(&TransactionManager::new()).unwrap();

        let snap = branch.current();
        assert_eq!(snap.field(ObjectId(1), "a"), None);
        assert_eq!(snap.field(ObjectId(1), "z"), Some(Value::Int(26)));
        assert_eq!(snap.field(ObjectId(2), "c"), None);
    }
}

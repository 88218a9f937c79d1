//! Public transactions: trunks and branches
//!
//! A `Branch` owns one history: an atomically swapped pointer to the current
//! immutable `Snapshot`, the pending-merge queue, the set-storage free list
//! and the acknowledgment state of its acknowledgers. It never holds
//! transaction storage itself; private transactions are started from it.
//!
//! Every state change (append, merge, acknowledgment, rollback, registration,
//! blocking) builds a new snapshot and installs it with a compare-and-swap,
//! retrying from a fresh read on contention. Nothing here takes a lock over
//! branch state.
//!
//! # Watcher discipline
//!
//! The newest map always holds one *head* watcher and the last-acknowledged
//! map one *boundary* watcher. An append moves the head watcher; an
//! acknowledgment advance moves the boundary watcher. Private transactions
//! add their own watchers while alive.

use crate::extension::{Acknowledger, Extension};
use crate::merge::{self, PendingMerge};
use crate::sets::SetPool;
use crate::snapshot::{SlowChanging, Snapshot};
use crate::transaction::Transaction;
use crate::version_map::{MapOwner, VersionMap};
use crate::version_set::VersionSet;
use arc_swap::ArcSwap;
use crossbeam_deque::Injector;
use dashmap::DashMap;
use smallvec::{smallvec, SmallVec};
use std::fmt;
use std::sync::{Arc, Weak};
use tessel_core::{
    BranchConfig, BranchId, ConnectionId, Consistency, ExtensionId, Source, TesselError,
    TesselResult, TransactionFlags,
};
use tracing::{debug, trace, warn};

/// Watchers a private transaction holds on its captured snapshot
pub(crate) type Protection = SmallVec<[Arc<VersionMap>; 2]>;

/// Snapshot captured under watchers
pub(crate) struct ProtectedSnapshot {
    pub(crate) snapshot: Arc<Snapshot>,
    pub(crate) watched: Protection,
}

/// Everything needed to append one committed map
#[derive(Debug)]
pub struct AppendRequest {
    /// Committed write set
    pub writes: Arc<VersionSet>,
    /// Read set, kept only while the map is speculative
    pub reads: Option<Arc<VersionSet>>,
    /// Origin of the change
    pub source: Source,
    /// Committing transaction
    pub owner: Option<MapOwner>,
}

pub(crate) struct BranchInner {
    id: BranchId,
    parent: Option<Branch>,
    config: BranchConfig,
    snapshot: ArcSwap<Snapshot>,
    pending: Injector<PendingMerge>,
    pool: SetPool,
    /// Highest sequence each registered acknowledger confirmed
    acknowledged: DashMap<ExtensionId, u64>,
    store: Option<Arc<dyn Acknowledger>>,
}

/// Public transaction: the shared root of one history
#[derive(Clone)]
pub struct Branch {
    inner: Arc<BranchInner>,
}

/// Non-owning branch handle held by walkers
#[derive(Clone)]
pub struct WeakBranch {
    inner: Weak<BranchInner>,
    id: BranchId,
}

impl WeakBranch {
    /// Branch, if it is still alive
    pub fn upgrade(&self) -> Option<Branch> {
        self.inner.upgrade().map(|inner| Branch { inner })
    }

    /// Id of the referenced branch
    pub fn id(&self) -> BranchId {
        self.id
    }
}

impl Branch {
    fn build(
        parent: Option<Branch>,
        config: BranchConfig,
        initial: Snapshot,
        store: Option<Arc<dyn Acknowledger>>,
    ) -> Branch {
        let branch = Branch {
            inner: Arc::new(BranchInner {
                id: BranchId::next(),
                parent,
                pool: SetPool::new(config.max_pooled_sets),
                config,
                snapshot: ArcSwap::from_pointee(initial),
                pending: Injector::new(),
                acknowledged: DashMap::new(),
                store,
            }),
        };
        debug!(
            target: "tessel::branch",
            branch = %branch.id(),
            parent = ?branch.parent().map(|p| p.id()),
            "branch created"
        );
        branch
    }

    /// New trunk with an empty history
    pub fn trunk(config: BranchConfig) -> Branch {
        Self::build(None, config, Snapshot::initial(), None)
    }

    /// New trunk whose appends are confirmed by `store`
    ///
    /// With `Consistency::Full`, commits stay speculative until the store
    /// acknowledges them.
    pub fn trunk_with_store(config: BranchConfig, store: Arc<dyn Acknowledger>) -> TesselResult<Branch> {
        let branch = Self::build(None, config, Snapshot::initial(), Some(Arc::clone(&store)));
        branch.register(Extension::Acknowledger(store))?;
        Ok(branch)
    }

    /// New branch starting from this branch's acknowledged state
    ///
    /// The child's base map holds the parent's acknowledged history folded
    /// into one import.
    pub fn fork(&self, config: BranchConfig) -> Branch {
        let parent = self.current();
        let mut base = VersionSet::new();
        for writes in parent.writes()[..=parent.acknowledged_index()].iter().rev() {
            base.merge_older(writes, false);
        }
        let initial = Snapshot::initial().with_base(base);
        Self::build(Some(self.clone()), config, initial, None)
    }

    /// Branch id
    pub fn id(&self) -> BranchId {
        self.inner.id
    }

    /// Branch this one was forked from; `None` for a trunk
    pub fn parent(&self) -> Option<&Branch> {
        self.inner.parent.as_ref()
    }

    /// Whether this branch has no parent
    pub fn is_trunk(&self) -> bool {
        self.inner.parent.is_none()
    }

    /// Flags of the public transaction
    pub fn flags(&self) -> TransactionFlags {
        TransactionFlags::PUBLIC
    }

    /// Configuration fixed at creation
    pub fn config(&self) -> &BranchConfig {
        &self.inner.config
    }

    /// Persistent store registered at creation
    pub fn store(&self) -> Option<&Arc<dyn Acknowledger>> {
        self.inner.store.as_ref()
    }

    /// Current snapshot
    pub fn current(&self) -> Arc<Snapshot> {
        self.inner.snapshot.load_full()
    }

    /// Non-owning handle
    pub fn downgrade(&self) -> WeakBranch {
        WeakBranch {
            inner: Arc::downgrade(&self.inner),
            id: self.inner.id,
        }
    }

    /// Whether both handles refer to the same branch
    pub fn ptr_eq(&self, other: &Branch) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Start a private transaction over the current snapshot
    pub fn start(&self, flags: TransactionFlags) -> Transaction {
        self.start_from(flags, Source::Local)
    }

    /// Start a private transaction applying changes from a remote peer
    pub fn start_remote(&self, flags: TransactionFlags, connection: ConnectionId) -> Transaction {
        self.start_from(flags | TransactionFlags::REMOTE, Source::Remote(connection))
    }

    /// Start a private transaction importing changes from another branch or
    /// a store
    pub fn start_import(&self, flags: TransactionFlags) -> Transaction {
        self.start_from(flags, Source::Import)
    }

    fn start_from(&self, flags: TransactionFlags, source: Source) -> Transaction {
        let protected = self.protect();
        Transaction::private(self.clone(), protected, flags.without(TransactionFlags::PUBLIC), source)
    }

    /// Capture the current snapshot with its head (and boundary, when
    /// speculative maps exist) watched
    pub(crate) fn protect(&self) -> ProtectedSnapshot {
        loop {
            let snapshot = self.current();
            let head = Arc::clone(snapshot.head());
            if !head.try_watch() {
                trace!(target: "tessel::txn", branch = %self.id(), "head merged away, recapturing");
                continue;
            }
            let mut watched: Protection = smallvec![head];
            if snapshot.has_speculative() {
                let boundary = Arc::clone(snapshot.acknowledged_map());
                if !boundary.try_watch() {
                    self.release_all(watched);
                    trace!(target: "tessel::txn", branch = %self.id(), "boundary moved, recapturing");
                    continue;
                }
                watched.push(boundary);
            }
            return ProtectedSnapshot { snapshot, watched };
        }
    }

    /// Drop one watcher; a map nobody watches is merged into its successor
    pub(crate) fn release_watcher(&self, map: &Arc<VersionMap>) {
        if map.release() == 0 {
            merge::on_unwatched(self, map);
        }
    }

    pub(crate) fn release_all(&self, maps: impl IntoIterator<Item = Arc<VersionMap>>) {
        for map in maps {
            self.release_watcher(&map);
        }
    }

    /// Install `next` if the branch still points at `expected`
    pub(crate) fn install(&self, expected: &Arc<Snapshot>, next: Snapshot) -> Option<Arc<Snapshot>> {
        let next = Arc::new(next);
        let previous = self.inner.snapshot.compare_and_swap(expected, Arc::clone(&next));
        if Arc::ptr_eq(&*previous, expected) {
            Some(next)
        } else {
            None
        }
    }

    pub(crate) fn pending(&self) -> &Injector<PendingMerge> {
        &self.inner.pending
    }

    pub(crate) fn acquire_set(&self) -> VersionSet {
        self.inner.pool.acquire()
    }

    pub(crate) fn recycle_set(&self, set: VersionSet) {
        self.inner.pool.release(set);
    }

    /// Return committed storage to the free list when nothing shares it
    pub(crate) fn recycle(&self, set: Arc<VersionSet>) {
        if let Ok(set) = Arc::try_unwrap(set) {
            self.inner.pool.release(set);
        }
    }

    /// Cleared set buffers waiting for reuse
    pub fn pooled_sets(&self) -> usize {
        self.inner.pool.len()
    }

    /// Whether maps appended now are acknowledged immediately
    fn acknowledges_at_append(&self, snapshot: &Snapshot) -> bool {
        self.inner.config.consistency == Consistency::Eventual
            || snapshot.slow_changing().acknowledgers().is_empty()
    }

    /// Append a committed map if the branch still points at `expected`
    ///
    /// This is the primitive a commit coordinator builds on: validate against
    /// `expected`, then try to append; on `None` reload and revalidate.
    pub fn try_append(
        &self,
        expected: &Arc<Snapshot>,
        request: &AppendRequest,
    ) -> Option<Arc<VersionMap>> {
        let slow = expected.slow_changing();
        let acknowledged = self.acknowledges_at_append(expected);
        let interception = slow
            .splitters()
            .iter()
            .find_map(|s| s.intercept(request.source));
        let watchers = 1 + usize::from(acknowledged) + slow.full_walkers();
        let map = Arc::new(VersionMap::new(
            expected.next_sequence(),
            watchers,
            request.source,
            interception,
            request.owner,
        ));
        let reads = if acknowledged {
            None
        } else {
            request.reads.clone()
        };
        let next = expected.appended(
            Arc::clone(&map),
            Arc::clone(&request.writes),
            reads,
            acknowledged,
        );
        self.install(expected, next)?;

        self.release_watcher(expected.head());
        if acknowledged {
            self.release_watcher(expected.acknowledged_map());
        }
        debug!(
            target: "tessel::branch",
            branch = %self.id(),
            sequence = map.sequence(),
            speculative = !acknowledged,
            writes = request.writes.len(),
            "version map appended"
        );

        for acknowledger in slow.acknowledgers() {
            acknowledger.on_append(self, &map, &request.writes);
        }
        for walker in slow.walkers() {
            walker.notify();
        }
        merge::drain(self);
        Some(map)
    }

    /// Record that acknowledger `id` confirmed every map up to `sequence`
    ///
    /// The acknowledged index advances to the newest map every registered
    /// acknowledger has confirmed.
    pub fn acknowledge(&self, id: ExtensionId, sequence: u64) -> TesselResult<()> {
        match self.inner.acknowledged.get_mut(&id) {
            Some(mut confirmed) => {
                if sequence > *confirmed {
                    *confirmed = sequence;
                }
            }
            None => return Err(TesselError::NotRegistered(id.as_u64())),
        }
        self.advance_acknowledged();
        Ok(())
    }

    fn confirmed_floor(&self, snapshot: &Snapshot) -> u64 {
        if self.acknowledges_at_append(snapshot) {
            return u64::MAX;
        }
        snapshot
            .slow_changing()
            .acknowledgers()
            .iter()
            .map(|a| {
                self.inner
                    .acknowledged
                    .get(&a.core().id())
                    .map(|s| *s)
                    .unwrap_or(0)
            })
            .min()
            .unwrap_or(u64::MAX)
    }

    fn advance_acknowledged(&self) {
        loop {
            let current = self.current();
            if !current.has_speculative() {
                return;
            }
            let floor = self.confirmed_floor(&current);
            let maps = current.version_maps();
            let target = (current.acknowledged_index() + 1..maps.len())
                .rev()
                .find(|&i| maps[i].sequence() <= floor && maps[i].try_watch());
            let Some(index) = target else {
                return;
            };
            if self
                .install(&current, current.with_acknowledged_index(index))
                .is_some()
            {
                debug!(
                    target: "tessel::branch",
                    branch = %self.id(),
                    sequence = maps[index].sequence(),
                    "acknowledged boundary advanced"
                );
                self.release_watcher(current.acknowledged_map());
                // Walkers deliver only acknowledged maps
                for walker in current.slow_changing().walkers() {
                    walker.notify();
                }
                merge::drain(self);
                return;
            }
            self.release_watcher(&maps[index]);
            trace!(target: "tessel::branch", branch = %self.id(), "acknowledge CAS lost, retrying");
        }
    }

    /// Drop every speculative map
    ///
    /// Removed maps move to `DONE` without merging. With `origin`, that peer
    /// is blocked until `unblock`. Returns the number of maps removed.
    pub fn rollback_speculative(&self, origin: Option<ConnectionId>) -> usize {
        loop {
            let current = self.current();
            let mut next = current.truncated_to_acknowledged();
            if let Some(connection) = origin {
                next = next.with_slow_changing(current.slow_changing().with_blocked(connection));
            }
            if !current.has_speculative() {
                if origin.is_none() || self.install(&current, next).is_some() {
                    return 0;
                }
                continue;
            }

            // The boundary becomes the head and takes the head watcher
            let boundary = current.acknowledged_map();
            if !boundary.try_watch() {
                continue;
            }
            if self.install(&current, next).is_some() {
                let removed = &current.version_maps()[current.acknowledged_index() + 1..];
                for map in removed {
                    map.mark_done();
                }
                warn!(
                    target: "tessel::branch",
                    branch = %self.id(),
                    removed = removed.len(),
                    origin = ?origin,
                    "speculative maps rolled back"
                );
                return removed.len();
            }
            self.release_watcher(boundary);
        }
    }

    /// Pause commits attributed to `connection`
    pub fn block(&self, connection: ConnectionId) {
        self.update_slow_changing(|slow| slow.with_blocked(connection));
        debug!(target: "tessel::branch", branch = %self.id(), %connection, "peer blocked");
    }

    /// Resume commits from `connection` after it resynchronized
    pub fn unblock(&self, connection: ConnectionId) {
        self.update_slow_changing(|slow| slow.without_blocked(connection));
        debug!(target: "tessel::branch", branch = %self.id(), %connection, "peer unblocked");
    }

    /// Whether commits from `connection` are paused
    pub fn is_blocked(&self, connection: ConnectionId) -> bool {
        self.current().slow_changing().is_blocked(connection)
    }

    fn update_slow_changing(&self, f: impl Fn(&SlowChanging) -> SlowChanging) {
        loop {
            let current = self.current();
            let next = current.with_slow_changing(f(current.slow_changing()));
            if self.install(&current, next).is_some() {
                return;
            }
        }
    }

    /// Register an extension
    ///
    /// # Errors
    ///
    /// `AlreadyRegistered` if it is registered on this branch, `InvalidState`
    /// if it was disposed.
    pub fn register(&self, extension: Extension) -> TesselResult<()> {
        let id = extension.id();
        if extension.core().is_disposed() {
            return Err(TesselError::invalid_state(format!(
                "extension {} is disposed",
                id
            )));
        }
        let default = self.inner.config.granularity;
        let _registration = match &extension {
            Extension::Walker(walker) => Some(walker.registration()),
            _ => None,
        };
        loop {
            let current = self.current();
            if current.slow_changing().contains(id) {
                return Err(TesselError::AlreadyRegistered(id.as_u64()));
            }
            let held = match &extension {
                Extension::Walker(walker) => match walker.protect(self, &current, default) {
                    Some(held) => held,
                    None => continue,
                },
                _ => Vec::new(),
            };
            let slow = current
                .slow_changing()
                .with_extension(extension.clone(), default);
            if self
                .install(&current, current.with_slow_changing(slow))
                .is_some()
            {
                match &extension {
                    Extension::Walker(walker) => walker.attach(self, default, held),
                    Extension::Acknowledger(_) => {
                        self.inner
                            .acknowledged
                            .insert(id, current.acknowledged_map().sequence());
                    }
                    Extension::SourceSplitter(_) => {}
                }
                debug!(target: "tessel::branch", branch = %self.id(), ?extension, "extension registered");
                return Ok(());
            }
            self.release_all(held);
            trace!(target: "tessel::branch", branch = %self.id(), "register CAS lost, retrying");
        }
    }

    /// Unregister extension `id`, releasing every watcher it holds
    ///
    /// A `reason` marks the unregistration as a failure: the extension is
    /// disposed and pending flush waiters receive it as the abort cause.
    ///
    /// Unregistering a walker waits for a walk in progress on another thread
    /// to finish. A visitor must not unregister its own walker.
    ///
    /// # Errors
    ///
    /// `NotRegistered` if no such extension is registered on this branch.
    pub fn unregister(&self, id: ExtensionId, reason: Option<TesselError>) -> TesselResult<()> {
        let default = self.inner.config.granularity;
        let walker = match self.current().slow_changing().find(id) {
            Some(Extension::Walker(walker)) => Some(Arc::clone(walker)),
            _ => None,
        };
        let _registration = walker.as_ref().map(|w| w.registration());
        loop {
            let current = self.current();
            let Some(extension) = current.slow_changing().find(id).cloned() else {
                return Err(TesselError::NotRegistered(id.as_u64()));
            };
            let Some(slow) = current.slow_changing().without_extension(id, default) else {
                return Err(TesselError::NotRegistered(id.as_u64()));
            };
            let Some(installed) = self.install(&current, current.with_slow_changing(slow)) else {
                trace!(target: "tessel::branch", branch = %self.id(), "unregister CAS lost, retrying");
                continue;
            };
            match &extension {
                Extension::Walker(walker) => walker.detach(self, &installed, reason.clone()),
                Extension::Acknowledger(_) => {
                    self.inner.acknowledged.remove(&id);
                    self.advance_acknowledged();
                }
                Extension::SourceSplitter(_) => {}
            }
            match reason {
                Some(reason) => {
                    extension.core().dispose();
                    warn!(
                        target: "tessel::branch",
                        branch = %self.id(),
                        ?extension,
                        error = %reason,
                        "extension unregistered after failure"
                    );
                }
                None => {
                    debug!(target: "tessel::branch", branch = %self.id(), ?extension, "extension unregistered");
                }
            }
            return Ok(());
        }
    }

    /// Retry deferred merges; returns how many completed
    pub fn compact(&self) -> usize {
        merge::drain(self)
    }
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("id", &self.inner.id)
            .field("config", &self.inner.config)
            .field("snapshot", &self.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::ExtensionCore;
    use crate::{CommitCoordinator, TransactionManager};
    use parking_lot::Mutex;
    use tessel_core::{CommitResult, ObjectId, Value};

    static_assertions::assert_impl_all!(Branch: Send, Sync);

    /// Acknowledger that records appends and confirms them on demand
    struct ManualStore {
        core: ExtensionCore,
        appended: Mutex<Vec<u64>>,
    }

    impl ManualStore {
        fn new() -> Arc<Self> {
            Arc::new(ManualStore {
                core: ExtensionCore::new(),
                appended: Mutex::new(Vec::new()),
            })
        }
    }

    impl Acknowledger for ManualStore {
        fn core(&self) -> &ExtensionCore {
            &self.core
        }

        fn on_append(&self, _branch: &Branch, map: &Arc<VersionMap>, _writes: &Arc<VersionSet>) {
            self.appended.lock().push(map.sequence());
        }
    }

    fn write(branch: &Branch, object: u64, value: i64) -> CommitResult {
        let mut txn = branch.start(TransactionFlags::NONE);
        txn.set(ObjectId(object), "v", value).unwrap();
        TransactionManager::new().commit_transaction(&mut txn).unwrap()
    }

    #[test]
    fn test_trunk_starts_with_base_map() {
        let trunk = Branch::trunk(BranchConfig::default());
        assert!(trunk.is_trunk());
        assert!(trunk.flags().contains(TransactionFlags::PUBLIC));
        let snap = trunk.current();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.acknowledged_index(), 0);
    }

    #[test]
    fn test_commit_appends_and_compacts() {
        let trunk = Branch::trunk(BranchConfig::default());
        assert_eq!(write(&trunk, 1, 1), CommitResult::Success);
        let snap = trunk.current();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.head().sequence(), 1);
        assert_eq!(snap.head().watchers(), 2);
        assert_eq!(snap.field(ObjectId(1), "v"), Some(Value::Int(1)));
    }

    #[test]
    fn test_speculative_until_acknowledged() {
        let store = ManualStore::new();
        let trunk = Branch::trunk_with_store(BranchConfig::default(), store.clone()).unwrap();

        write(&trunk, 1, 1);
        // Keeps map 1 from folding into map 2
        let reader = trunk.start(TransactionFlags::NONE);
        write(&trunk, 2, 2);
        let snap = trunk.current();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap.acknowledged_index(), 0);
        assert!(snap.has_speculative());
        assert_eq!(*store.appended.lock(), vec![1, 2]);

        trunk.acknowledge(store.core.id(), 1).unwrap();
        let snap = trunk.current();
        assert!(snap.has_speculative());
        assert_eq!(snap.acknowledged_map().sequence(), 1);
        drop(reader);

        trunk.acknowledge(store.core.id(), 2).unwrap();
        let snap = trunk.current();
        assert!(!snap.has_speculative());
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.field(ObjectId(1), "v"), Some(Value::Int(1)));
        assert_eq!(snap.field(ObjectId(2), "v"), Some(Value::Int(2)));
    }

    #[test]
    fn test_eventual_consistency_acknowledges_at_append() {
        let store = ManualStore::new();
        let config = BranchConfig::default().with_consistency(Consistency::Eventual);
        let trunk = Branch::trunk_with_store(config, store.clone()).unwrap();
        write(&trunk, 1, 1);
        assert!(!trunk.current().has_speculative());
        assert_eq!(*store.appended.lock(), vec![1]);
    }

    #[test]
    fn test_rollback_blocks_origin() {
        let store = ManualStore::new();
        let trunk = Branch::trunk_with_store(BranchConfig::default(), store.clone()).unwrap();
        write(&trunk, 1, 1);
        write(&trunk, 2, 2);

        // Both speculative commits already folded into one map
        let removed = trunk.rollback_speculative(Some(ConnectionId(5)));
        assert_eq!(removed, 1);
        let snap = trunk.current();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.field(ObjectId(1), "v"), None);
        assert!(trunk.is_blocked(ConnectionId(5)));

        let mut remote = trunk.start_remote(TransactionFlags::NONE, ConnectionId(5));
        remote.set(ObjectId(3), "v", 3i64).unwrap();
        assert_eq!(
            TransactionManager::new().commit_transaction(&mut remote).unwrap(),
            CommitResult::Abort
        );

        trunk.unblock(ConnectionId(5));
        let mut remote = trunk.start_remote(TransactionFlags::NONE, ConnectionId(5));
        remote.set(ObjectId(3), "v", 3i64).unwrap();
        assert!(TransactionManager::new()
            .commit_transaction(&mut remote)
            .unwrap()
            .is_success());
        // Sequences are never reused after a rollback
        assert_eq!(trunk.current().head().sequence(), 3);
    }

    #[test]
    fn test_acknowledge_unknown_rejected() {
        let trunk = Branch::trunk(BranchConfig::default());
        let err = trunk.acknowledge(ExtensionId::next(), 1).unwrap_err();
        assert!(matches!(err, TesselError::NotRegistered(_)));
    }

    #[test]
    fn test_fork_starts_from_acknowledged_state() {
        let trunk = Branch::trunk(BranchConfig::default());
        write(&trunk, 1, 1);
        write(&trunk, 1, 2);
        let fork = trunk.fork(BranchConfig::default());
        assert!(!fork.is_trunk());
        assert!(fork.parent().unwrap().ptr_eq(&trunk));
        assert_eq!(fork.current().field(ObjectId(1), "v"), Some(Value::Int(2)));

        write(&fork, 1, 3);
        assert_eq!(trunk.current().field(ObjectId(1), "v"), Some(Value::Int(2)));
        assert_eq!(fork.current().field(ObjectId(1), "v"), Some(Value::Int(3)));
    }

    #[test]
    fn test_committed_storage_is_recycled() {
        let trunk = Branch::trunk(BranchConfig::default());
        for i in 0..4 {
            write(&trunk, i, 1);
        }
        assert!(trunk.pooled_sets() > 0);
        assert!(trunk.pooled_sets() <= trunk.config().max_pooled_sets);
    }

    #[test]
    fn test_coordinator_is_object_safe() {
        let coordinator: Box<dyn CommitCoordinator> = Box::new(TransactionManager::new());
        let trunk = Branch::trunk(BranchConfig::default());
        let mut txn = trunk.start(TransactionFlags::NONE);
        txn.set(ObjectId(1), "v", 1i64).unwrap();
        assert!(txn.commit(coordinator.as_ref()).unwrap().is_success());
    }
}

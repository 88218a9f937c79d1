//! Per-transaction read/write storage and its recycling free list
//!
//! `TransactionSets` is owned by exactly one private transaction. Its write
//! set is an `Arc<VersionSet>` so nested children can layer it as an overlay
//! and a commit can hand it to the snapshot without copying. Until commit the
//! owning transaction is the only writer; once the set is part of a snapshot
//! it is never mutated again.

use crate::version_set::VersionSet;
use parking_lot::Mutex;
use std::sync::Arc;
use tessel_core::{FieldState, ObjectId, Value, Version};

/// Read/write storage of one private transaction plus its captured view
#[derive(Debug, Clone)]
pub struct TransactionSets {
    writes: Option<Arc<VersionSet>>,
    reads: Option<VersionSet>,
    /// Write sets of the captured public snapshot, oldest first
    public_snapshot_versions: Arc<[Arc<VersionSet>]>,
    /// How many public layers are visible (fewer with `IGNORE_SPECULATIVE`)
    visible_public: usize,
    /// Ancestors' write sets for nested transactions, oldest first
    private_snapshot_versions: Vec<Arc<VersionSet>>,
}

impl TransactionSets {
    /// Storage over a captured public view
    pub(crate) fn new(
        writes: Option<VersionSet>,
        reads: Option<VersionSet>,
        public_snapshot_versions: Arc<[Arc<VersionSet>]>,
        visible_public: usize,
    ) -> Self {
        debug_assert!(visible_public <= public_snapshot_versions.len());
        TransactionSets {
            writes: writes.map(Arc::new),
            reads,
            public_snapshot_versions,
            visible_public,
            private_snapshot_versions: Vec::new(),
        }
    }

    /// Storage for a nested child sharing this view, with `self`'s writes as
    /// the newest overlay layer
    pub(crate) fn nested(&self, track_writes: bool, track_reads: bool) -> Self {
        let mut overlay = self.private_snapshot_versions.clone();
        if let Some(writes) = &self.writes {
            overlay.push(Arc::clone(writes));
        }
        TransactionSets {
            writes: track_writes.then(|| Arc::new(VersionSet::new())),
            reads: track_reads.then(VersionSet::new),
            public_snapshot_versions: Arc::clone(&self.public_snapshot_versions),
            visible_public: self.visible_public,
            private_snapshot_versions: overlay,
        }
    }

    /// Own write set
    pub fn writes(&self) -> Option<&VersionSet> {
        self.writes.as_deref()
    }

    /// Own read set
    pub fn reads(&self) -> Option<&VersionSet> {
        self.reads.as_ref()
    }

    /// Captured public write sets, oldest first
    pub fn public_snapshot_versions(&self) -> &[Arc<VersionSet>] {
        &self.public_snapshot_versions[..self.visible_public]
    }

    /// Private overlay layers, oldest first
    pub fn private_snapshot_versions(&self) -> &[Arc<VersionSet>] {
        &self.private_snapshot_versions
    }

    pub(crate) fn tracks_writes(&self) -> bool {
        self.writes.is_some()
    }

    /// Mutable version of `object` in the write set
    ///
    /// Only called while the transaction is private; a shared write set (held
    /// by a live nested child as overlay) is copied first.
    pub(crate) fn version_mut(&mut self, object: ObjectId) -> Option<&mut Version> {
        self.writes
            .as_mut()
            .map(|w| Arc::make_mut(w).version_mut(object))
    }

    pub(crate) fn record_read(&mut self, object: ObjectId) {
        if let Some(reads) = &mut self.reads {
            reads.version_mut(object);
        }
    }

    /// Layers newest first: own writes, overlay, visible public writes
    fn layers(&self) -> impl Iterator<Item = &VersionSet> {
        self.writes
            .as_deref()
            .into_iter()
            .chain(self.private_snapshot_versions.iter().rev().map(|s| &**s))
            .chain(self.public_snapshot_versions().iter().rev().map(|s| &**s))
    }

    /// Current value of one field as this transaction observes it
    pub fn field(&self, object: ObjectId, field: &str) -> Option<Value> {
        for layer in self.layers() {
            if let Some(version) = layer.get(object) {
                match version.field(field) {
                    FieldState::Set(value) => return Some(value.clone()),
                    FieldState::Removed => return None,
                    FieldState::Untouched => {}
                }
            }
        }
        None
    }

    /// Every layer's delta for `object` folded into one version
    pub fn resolve(&self, object: ObjectId) -> Option<Version> {
        let mut resolved: Option<Version> = None;
        for layer in self.layers() {
            if let Some(older) = layer.get(object) {
                match &mut resolved {
                    Some(newer) => {
                        newer.merge_older(older);
                        if newer.is_cleared() {
                            break;
                        }
                    }
                    None => {
                        if older.is_cleared() {
                            return Some(Version::clone(older));
                        }
                        resolved = Some(Version::clone(older));
                    }
                }
            }
        }
        resolved
    }

    /// Fold a finished nested child's writes and reads into this storage
    pub(crate) fn absorb_child(&mut self, child: &mut TransactionSets) {
        child.private_snapshot_versions.clear();
        if let (Some(own), Some(child_writes)) = (&mut self.writes, child.writes.take()) {
            let mut merged =
                Arc::try_unwrap(child_writes).unwrap_or_else(|shared| (*shared).clone());
            merged.merge_older(&**own, false);
            *own = Arc::new(merged);
        }
        if let (Some(own), Some(child_reads)) = (&mut self.reads, child.reads.take()) {
            for read in child_reads.objects() {
                own.version_mut(read);
            }
        }
    }

    /// Move the write and read sets out for commit
    pub(crate) fn take_for_commit(&mut self) -> (Arc<VersionSet>, Option<VersionSet>) {
        let writes = self.writes.take().unwrap_or_default();
        (writes, self.reads.take())
    }

    /// Drop the captured view and hand back buffers worth recycling
    pub(crate) fn reset(&mut self) -> Vec<VersionSet> {
        self.public_snapshot_versions = Arc::from(Vec::new());
        self.visible_public = 0;
        self.private_snapshot_versions.clear();
        let mut buffers = Vec::new();
        if let Some(writes) = self.writes.take() {
            if let Ok(set) = Arc::try_unwrap(writes) {
                buffers.push(set);
            }
        }
        if let Some(reads) = self.reads.take() {
            buffers.push(reads);
        }
        buffers
    }
}

/// Branch-level free list of cleared set buffers
///
/// Bounded by `max_pooled_sets`; extra buffers are dropped.
#[derive(Debug)]
pub(crate) struct SetPool {
    free: Mutex<Vec<VersionSet>>,
    max: usize,
}

impl SetPool {
    pub(crate) fn new(max: usize) -> Self {
        SetPool {
            free: Mutex::new(Vec::with_capacity(max)),
            max,
        }
    }

    /// Take a cleared buffer, or a fresh one if the list is empty
    pub(crate) fn acquire(&self) -> VersionSet {
        self.free.lock().pop().unwrap_or_default()
    }

    /// Clear `set` and keep it if the list has room
    pub(crate) fn release(&self, mut set: VersionSet) {
        set.clear();
        let mut free = self.free.lock();
        if free.len() < self.max {
            free.push(set);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(entries: &[(u64, &str, i64)]) -> Arc<VersionSet> {
        let mut set = VersionSet::new();
        for (object, field, value) in entries {
            set.version_mut(ObjectId(*object)).set(*field, *value);
        }
        Arc::new(set)
    }

    fn sets_over(public: Vec<Arc<VersionSet>>) -> TransactionSets {
        let visible = public.len();
        TransactionSets::new(
            Some(VersionSet::new()),
            Some(VersionSet::new()),
            Arc::from(public),
            visible,
        )
    }

    #[test]
    fn test_newest_layer_wins() {
        let mut sets = sets_over(vec![layer(&[(1, "a", 1)]), layer(&[(1, "a", 2)])]);
        assert_eq!(sets.field(ObjectId(1), "a"), Some(Value::Int(2)));

        sets.version_mut(ObjectId(1)).unwrap().set("a", 3i64);
        assert_eq!(sets.field(ObjectId(1), "a"), Some(Value::Int(3)));
    }

    #[test]
    fn test_cleared_layer_stops_lookup() {
        let mut sets = sets_over(vec![layer(&[(1, "a", 1), (1, "b", 1)])]);
        let own = sets.version_mut(ObjectId(1)).unwrap();
        own.clear();
        own.set("b", 5i64);

        assert_eq!(sets.field(ObjectId(1), "a"), None);
        assert_eq!(sets.field(ObjectId(1), "b"), Some(Value::Int(5)));
        let resolved = sets.resolve(ObjectId(1)).unwrap();
        assert!(resolved.is_cleared());
        assert_eq!(resolved.live_fields().len(), 1);
    }

    #[test]
    fn test_resolve_folds_all_layers() {
        let sets = sets_over(vec![layer(&[(1, "a", 1)]), layer(&[(1, "b", 2)])]);
        let resolved = sets.resolve(ObjectId(1)).unwrap();
        assert_eq!(resolved.field("a"), FieldState::Set(&Value::Int(1)));
        assert_eq!(resolved.field("b"), FieldState::Set(&Value::Int(2)));
        assert!(sets.resolve(ObjectId(9)).is_none());
    }

    #[test]
    fn test_hidden_speculative_layers() {
        let public: Arc<[Arc<VersionSet>]> =
            Arc::from(vec![layer(&[(1, "a", 1)]), layer(&[(1, "a", 2)])]);
        let sets = TransactionSets::new(None, None, public, 1);
        assert_eq!(sets.field(ObjectId(1), "a"), Some(Value::Int(1)));
        assert_eq!(sets.public_snapshot_versions().len(), 1);
    }

    #[test]
    fn test_nested_sees_parent_and_absorbs() {
        let mut parent = sets_over(vec![layer(&[(1, "a", 1)])]);
        parent.version_mut(ObjectId(1)).unwrap().set("b", 2i64);

        let mut child = parent.nested(true, true);
        assert_eq!(child.field(ObjectId(1), "b"), Some(Value::Int(2)));
        child.version_mut(ObjectId(1)).unwrap().set("b", 3i64);
        child.record_read(ObjectId(7));
        assert_eq!(parent.field(ObjectId(1), "b"), Some(Value::Int(2)));

        parent.absorb_child(&mut child);
        assert_eq!(parent.field(ObjectId(1), "b"), Some(Value::Int(3)));
        assert!(parent.reads().unwrap().contains(ObjectId(7)));
    }

    #[test]
    fn test_reads_untracked_when_absent() {
        let mut sets = TransactionSets::new(Some(VersionSet::new()), None, Arc::from(vec![]), 0);
        sets.record_read(ObjectId(1));
        assert!(sets.reads().is_none());
    }

    #[test]
    fn test_pool_bounded() {
        let pool = SetPool::new(2);
        for _ in 0..4 {
            let mut set = VersionSet::new();
            set.version_mut(ObjectId(1));
            pool.release(set);
        }
        assert_eq!(pool.len(), 2);
        let reused = pool.acquire();
        assert!(reused.is_empty());
        assert!(reused.slot_count() > 0);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_reset_returns_unshared_buffers() {
        let mut sets = sets_over(vec![layer(&[(1, "a", 1)])]);
        sets.version_mut(ObjectId(2)).unwrap().set("x", 1i64);
        let buffers = sets.reset();
        assert_eq!(buffers.len(), 2);
        assert!(sets.public_snapshot_versions().is_empty());
    }
}

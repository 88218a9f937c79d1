//! Immutable snapshot of a branch's history
//!
//! A `Snapshot` is the ordered chain of version maps a branch has committed,
//! oldest first, with the per-map write (and optional read) sets held in
//! parallel arrays. It is never mutated: every append, merge, acknowledgment,
//! rollback or registration builds a new `Snapshot` that the branch installs
//! with a compare-and-swap. Unchanged arrays are shared between snapshots.
//!
//! Maps at indices `0..=acknowledged_index` are acknowledged (durable); maps
//! after it are speculative and may be rolled back.

use crate::extension::{Acknowledger, Extension, SourceSplitter};
use crate::version_map::VersionMap;
use crate::version_set::VersionSet;
use crate::walker::Walker;
use std::fmt;
use std::sync::Arc;
use tessel_core::{ConnectionId, ExtensionId, Granularity, ObjectId, Source, Value, Version};

/// Registered extensions and blocked peers of a branch
///
/// Replaced wholesale on every change. The typed sublists are derived once
/// when an extension is added so hot paths never inspect variants.
#[derive(Clone, Default)]
pub struct SlowChanging {
    extensions: Vec<Extension>,
    acknowledgers: Vec<Arc<dyn Acknowledger>>,
    walkers: Vec<Arc<Walker>>,
    splitters: Vec<Arc<dyn SourceSplitter>>,
    /// Walkers observing every map; each appended map is born with one
    /// watcher per such walker
    full_walkers: usize,
    blocked: Vec<ConnectionId>,
}

impl SlowChanging {
    /// Registered extensions in registration order
    pub fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    /// Registered acknowledgers
    pub fn acknowledgers(&self) -> &[Arc<dyn Acknowledger>] {
        &self.acknowledgers
    }

    /// Registered walkers
    pub fn walkers(&self) -> &[Arc<Walker>] {
        &self.walkers
    }

    /// Registered source splitters
    pub fn splitters(&self) -> &[Arc<dyn SourceSplitter>] {
        &self.splitters
    }

    /// Number of registered walkers with `Granularity::All`
    pub fn full_walkers(&self) -> usize {
        self.full_walkers
    }

    /// Blocked remote peers
    pub fn blocked(&self) -> &[ConnectionId] {
        &self.blocked
    }

    /// Whether commits from `connection` are paused
    pub fn is_blocked(&self, connection: ConnectionId) -> bool {
        self.blocked.contains(&connection)
    }

    /// Whether an extension with `id` is registered
    pub fn contains(&self, id: ExtensionId) -> bool {
        self.extensions.iter().any(|e| e.id() == id)
    }

    /// Registered extension with `id`
    pub fn find(&self, id: ExtensionId) -> Option<&Extension> {
        self.extensions.iter().find(|e| e.id() == id)
    }

    pub(crate) fn with_extension(&self, extension: Extension, default: Granularity) -> Self {
        let mut next = self.clone();
        match &extension {
            Extension::Walker(w) => {
                if w.granularity_on(default) == Granularity::All {
                    next.full_walkers += 1;
                }
                next.walkers.push(Arc::clone(w));
            }
            Extension::Acknowledger(a) => next.acknowledgers.push(Arc::clone(a)),
            Extension::SourceSplitter(s) => next.splitters.push(Arc::clone(s)),
        }
        next.extensions.push(extension);
        next
    }

    /// Copy without extension `id`, or `None` if it is not registered
    pub(crate) fn without_extension(&self, id: ExtensionId, default: Granularity) -> Option<Self> {
        let position = self.extensions.iter().position(|e| e.id() == id)?;
        let mut next = self.clone();
        let removed = next.extensions.remove(position);
        match &removed {
            Extension::Walker(w) => {
                if w.granularity_on(default) == Granularity::All {
                    next.full_walkers -= 1;
                }
                next.walkers.retain(|x| !Arc::ptr_eq(x, w));
            }
            Extension::Acknowledger(_) => next.acknowledgers.retain(|a| a.core().id() != id),
            Extension::SourceSplitter(_) => next.splitters.retain(|s| s.core().id() != id),
        }
        Some(next)
    }

    pub(crate) fn with_blocked(&self, connection: ConnectionId) -> Self {
        let mut next = self.clone();
        if !next.blocked.contains(&connection) {
            next.blocked.push(connection);
        }
        next
    }

    pub(crate) fn without_blocked(&self, connection: ConnectionId) -> Self {
        let mut next = self.clone();
        next.blocked.retain(|c| *c != connection);
        next
    }
}

impl fmt::Debug for SlowChanging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlowChanging")
            .field(
                "extensions",
                &self.extensions.iter().map(|e| e.id()).collect::<Vec<_>>(),
            )
            .field("full_walkers", &self.full_walkers)
            .field("blocked", &self.blocked)
            .finish()
    }
}

/// Immutable chain of version maps
#[derive(Clone)]
pub struct Snapshot {
    version_maps: Arc<[Arc<VersionMap>]>,
    writes: Arc<[Arc<VersionSet>]>,
    reads: Arc<[Option<Arc<VersionSet>>]>,
    acknowledged_index: usize,
    next_sequence: u64,
    slow_changing: Arc<SlowChanging>,
}

impl Snapshot {
    /// First snapshot of a branch: one empty, acknowledged map
    ///
    /// The map starts with its head and boundary watchers.
    pub(crate) fn initial() -> Self {
        let base = Arc::new(VersionMap::new(0, 2, Source::Local, None, None));
        Snapshot {
            version_maps: Arc::from(vec![base]),
            writes: Arc::from(vec![Arc::new(VersionSet::new())]),
            reads: Arc::from(vec![None]),
            acknowledged_index: 0,
            next_sequence: 1,
            slow_changing: Arc::new(SlowChanging::default()),
        }
    }

    /// Initial snapshot whose base map carries `base`
    pub(crate) fn with_base(self, base: VersionSet) -> Snapshot {
        Snapshot {
            writes: Arc::from(vec![Arc::new(base)]),
            ..self
        }
    }

    /// Number of maps in the chain
    pub fn len(&self) -> usize {
        self.version_maps.len()
    }

    /// Always false; a chain holds at least its head
    pub fn is_empty(&self) -> bool {
        self.version_maps.is_empty()
    }

    /// Maps, oldest first
    pub fn version_maps(&self) -> &[Arc<VersionMap>] {
        &self.version_maps
    }

    /// Write sets parallel to `version_maps`
    pub fn writes(&self) -> &[Arc<VersionSet>] {
        &self.writes
    }

    pub(crate) fn writes_arc(&self) -> &Arc<[Arc<VersionSet>]> {
        &self.writes
    }

    /// Read sets parallel to `version_maps`; present only for speculative maps
    pub fn reads(&self) -> &[Option<Arc<VersionSet>>] {
        &self.reads
    }

    /// Index of the newest acknowledged map
    pub fn acknowledged_index(&self) -> usize {
        self.acknowledged_index
    }

    /// Newest map
    pub fn head(&self) -> &Arc<VersionMap> {
        &self.version_maps[self.version_maps.len() - 1]
    }

    /// Newest acknowledged map
    pub fn acknowledged_map(&self) -> &Arc<VersionMap> {
        &self.version_maps[self.acknowledged_index]
    }

    /// Whether maps exist past the acknowledged index
    pub fn has_speculative(&self) -> bool {
        self.acknowledged_index + 1 < self.version_maps.len()
    }

    /// Sequence the next appended map receives
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Registered extensions and blocked peers
    pub fn slow_changing(&self) -> &Arc<SlowChanging> {
        &self.slow_changing
    }

    /// Index of `map` in this chain
    pub fn position(&self, map: &Arc<VersionMap>) -> Option<usize> {
        self.version_maps.iter().rposition(|m| Arc::ptr_eq(m, map))
    }

    /// Every map's delta for `object` folded, newest first
    pub fn resolve(&self, object: ObjectId) -> Option<Version> {
        let mut resolved: Option<Version> = None;
        for set in self.writes.iter().rev() {
            if let Some(older) = set.get(object) {
                match &mut resolved {
                    Some(newer) => newer.merge_older(older),
                    None => resolved = Some(Version::clone(older)),
                }
                if resolved.as_ref().is_some_and(|v| v.is_cleared()) {
                    break;
                }
            }
        }
        resolved
    }

    /// Latest committed value of one field
    pub fn field(&self, object: ObjectId, field: &str) -> Option<Value> {
        self.resolve(object)
            .and_then(|v| v.live_fields().get(field).cloned())
    }

    /// Chain with `map` appended
    pub(crate) fn appended(
        &self,
        map: Arc<VersionMap>,
        writes: Arc<VersionSet>,
        reads: Option<Arc<VersionSet>>,
        acknowledged: bool,
    ) -> Snapshot {
        let len = self.len();
        Snapshot {
            version_maps: self.version_maps.iter().cloned().chain([map]).collect(),
            writes: self.writes.iter().cloned().chain([writes]).collect(),
            reads: self.reads.iter().cloned().chain([reads]).collect(),
            acknowledged_index: if acknowledged {
                len
            } else {
                self.acknowledged_index
            },
            next_sequence: self.next_sequence + 1,
            slow_changing: Arc::clone(&self.slow_changing),
        }
    }

    /// Chain with the map at `index` folded into its successor, whose sets
    /// are replaced by the merged ones
    pub(crate) fn merged(
        &self,
        index: usize,
        writes: Arc<VersionSet>,
        reads: Option<Arc<VersionSet>>,
    ) -> Snapshot {
        debug_assert!(index + 1 < self.len());
        let keep = |i: usize| i != index;
        let successor = index + 1;
        Snapshot {
            version_maps: self
                .version_maps
                .iter()
                .enumerate()
                .filter(|(i, _)| keep(*i))
                .map(|(_, m)| Arc::clone(m))
                .collect(),
            writes: self
                .writes
                .iter()
                .enumerate()
                .filter(|(i, _)| keep(*i))
                .map(|(i, w)| {
                    if i == successor {
                        Arc::clone(&writes)
                    } else {
                        Arc::clone(w)
                    }
                })
                .collect(),
            reads: self
                .reads
                .iter()
                .enumerate()
                .filter(|(i, _)| keep(*i))
                .map(|(i, r)| if i == successor { reads.clone() } else { r.clone() })
                .collect(),
            acknowledged_index: if index <= self.acknowledged_index {
                self.acknowledged_index - 1
            } else {
                self.acknowledged_index
            },
            next_sequence: self.next_sequence,
            slow_changing: Arc::clone(&self.slow_changing),
        }
    }

    pub(crate) fn with_acknowledged_index(&self, index: usize) -> Snapshot {
        debug_assert!(index < self.len());
        Snapshot {
            acknowledged_index: index,
            ..self.clone()
        }
    }

    /// Chain cut back to its acknowledged region
    pub(crate) fn truncated_to_acknowledged(&self) -> Snapshot {
        let len = self.acknowledged_index + 1;
        Snapshot {
            version_maps: Arc::from(&self.version_maps[..len]),
            writes: Arc::from(&self.writes[..len]),
            reads: Arc::from(&self.reads[..len]),
            ..self.clone()
        }
    }

    pub(crate) fn with_slow_changing(&self, slow_changing: SlowChanging) -> Snapshot {
        Snapshot {
            slow_changing: Arc::new(slow_changing),
            ..self.clone()
        }
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field(
                "sequences",
                &self
                    .version_maps
                    .iter()
                    .map(|m| m.sequence())
                    .collect::<Vec<_>>(),
            )
            .field("acknowledged_index", &self.acknowledged_index)
            .field("slow_changing", &self.slow_changing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(Snapshot: Send, Sync);
    static_assertions::assert_impl_all!(SlowChanging: Send, Sync);

    fn writes(entries: &[(u64, &str, i64)]) -> Arc<VersionSet> {
        let mut set = VersionSet::new();
        for (object, field, value) in entries {
            set.version_mut(ObjectId(*object)).set(*field, *value);
        }
        Arc::new(set)
    }

    fn map(sequence: u64) -> Arc<VersionMap> {
        Arc::new(VersionMap::new(sequence, 1, Source::Local, None, None))
    }

    #[test]
    fn test_initial_snapshot() {
        let snap = Snapshot::initial();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.acknowledged_index(), 0);
        assert!(!snap.has_speculative());
        assert_eq!(snap.head().watchers(), 2);
        assert!(snap.writes()[0].is_empty());
    }

    #[test]
    fn test_append_keeps_parallel_arrays() {
        let s0 = Snapshot::initial();
        let s1 = s0.appended(map(1), writes(&[(1, "k", 1)]), None, true);
        let s2 = s1.appended(map(2), writes(&[(1, "k", 2)]), Some(writes(&[(1, "k", 0)])), false);

        assert_eq!(s0.len(), 1);
        assert_eq!(s2.len(), 3);
        assert_eq!(s2.writes().len(), 3);
        assert_eq!(s2.reads().len(), 3);
        assert_eq!(s2.acknowledged_index(), 1);
        assert!(s2.has_speculative());
        assert_eq!(s2.next_sequence(), 3);
        assert_eq!(s2.field(ObjectId(1), "k"), Some(Value::Int(2)));
        assert_eq!(s1.field(ObjectId(1), "k"), Some(Value::Int(1)));
    }

    #[test]
    fn test_merged_removes_and_adjusts_boundary() {
        let s = Snapshot::initial()
            .appended(map(1), writes(&[(1, "a", 1)]), None, true)
            .appended(map(2), writes(&[(2, "b", 2)]), None, true);
        let b = Arc::clone(&s.version_maps()[2]);

        let mut combined = VersionSet::clone(&s.writes()[2]);
        combined.merge_older(&s.writes()[1], false);
        let merged = s.merged(1, Arc::new(combined), None);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged.acknowledged_index(), 1);
        assert!(Arc::ptr_eq(&merged.version_maps()[1], &b));
        assert_eq!(merged.field(ObjectId(1), "a"), Some(Value::Int(1)));
        assert_eq!(merged.field(ObjectId(2), "b"), Some(Value::Int(2)));
        // Source snapshot untouched
        assert_eq!(s.len(), 3);
        assert!(!s.writes()[2].contains(ObjectId(1)));
    }

    #[test]
    fn test_truncate_keeps_sequence_counter() {
        let s = Snapshot::initial()
            .appended(map(1), writes(&[(1, "a", 1)]), None, false)
            .appended(map(2), writes(&[(1, "a", 2)]), None, false);
        let t = s.truncated_to_acknowledged();
        assert_eq!(t.len(), 1);
        assert_eq!(t.next_sequence(), s.next_sequence());
        assert_eq!(t.field(ObjectId(1), "a"), None);
    }

    #[test]
    fn test_position_by_identity() {
        let m = map(1);
        let s = Snapshot::initial().appended(Arc::clone(&m), writes(&[]), None, true);
        assert_eq!(s.position(&m), Some(1));
        assert_eq!(s.position(&map(1)), None);
    }

    #[test]
    fn test_cleared_version_hides_older_history() {
        let mut reset = VersionSet::new();
        reset.version_mut(ObjectId(1)).clear();
        let s = Snapshot::initial()
            .appended(map(1), writes(&[(1, "a", 1)]), None, true)
            .appended(map(2), Arc::new(reset), None, true);
        assert_eq!(s.field(ObjectId(1), "a"), None);
        assert!(s.resolve(ObjectId(1)).unwrap().is_cleared());
    }

    #[test]
    fn test_blocked_list() {
        let slow = SlowChanging::default().with_blocked(ConnectionId(4));
        assert!(slow.is_blocked(ConnectionId(4)));
        assert_eq!(slow.with_blocked(ConnectionId(4)).blocked().len(), 1);
        assert!(!slow.without_blocked(ConnectionId(4)).is_blocked(ConnectionId(4)));
    }
}

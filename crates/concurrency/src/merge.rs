//! Lock-free compaction of the version map chain
//!
//! When a map's watcher count reaches zero it is folded into its successor:
//!
//! 1. Claim the map as `A` (`NONE -> CLAIMED_A`). If another attempt owns it,
//!    defer; if it is already `DONE`, there is nothing to do.
//! 2. Claim the successor as `B` (`NONE -> CLAIMED_B`). On failure defer the
//!    attempt with `A` still claimed; the pending queue retries it later.
//! 3. Build `B`'s new write set (and read set while speculative) with `A`'s
//!    versions folded under `B`'s. Neither input is mutated: shared versions
//!    are copied on write, and remote-derived maps are copied eagerly.
//! 4. CAS the branch to a snapshot without `A`, re-locating `A` on every
//!    retry. If `A` vanished (rolled back) the attempt is abandoned.
//! 5. `A = DONE`, `B = NONE`, then drain the pending queue.
//!
//! Watchers on the head and the acknowledged boundary mean `A` is never the
//! head and never crosses the boundary.
//!
//! Deferred attempts are retried by the next append, acknowledgment or
//! `Branch::compact`. An attempt queued just after a drain found the queue
//! empty waits for one of those, so a branch that has gone quiet should be
//! compacted explicitly.

use crate::branch::Branch;
use crate::version_map::VersionMap;
use crate::version_set::VersionSet;
use crossbeam_deque::Steal;
use std::sync::Arc;
use tessel_core::TransactionFlags;
use tracing::{debug, trace};

/// Deferred merge attempt
#[derive(Debug)]
pub(crate) struct PendingMerge {
    pub(crate) map: Arc<VersionMap>,
    /// `A` stays claimed while the attempt waits for `B`
    pub(crate) claimed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attempt {
    Merged,
    Deferred,
    Abandoned,
    Skipped,
}

/// Merge `map` into its successor now that nobody watches it
pub(crate) fn on_unwatched(branch: &Branch, map: &Arc<VersionMap>) {
    if attempt(branch, Arc::clone(map), false) == Attempt::Merged {
        drain(branch);
    }
}

fn defer(branch: &Branch, map: Arc<VersionMap>, claimed: bool) -> Attempt {
    trace!(target: "tessel::merge", sequence = map.sequence(), claimed, "merge deferred");
    branch.pending().push(PendingMerge { map, claimed });
    Attempt::Deferred
}

pub(crate) fn attempt(branch: &Branch, a: Arc<VersionMap>, a_claimed: bool) -> Attempt {
    if !a_claimed && !a.try_claim_a() {
        if a.is_done() {
            return Attempt::Skipped;
        }
        return defer(branch, a, false);
    }
    if a.watchers() > 0 {
        a.release_claim_a();
        return Attempt::Skipped;
    }

    let current = branch.current();
    let Some(index) = current.position(&a) else {
        a.mark_done();
        debug!(target: "tessel::merge", sequence = a.sequence(), "merge abandoned, map rolled back");
        return Attempt::Abandoned;
    };
    if index + 1 >= current.len() || index == current.acknowledged_index() {
        a.release_claim_a();
        return Attempt::Skipped;
    }

    let b = Arc::clone(&current.version_maps()[index + 1]);
    if !b.try_claim_b() {
        return defer(branch, a, true);
    }

    // Both claimed: neither input set changes until we release them
    let by_copy = a.source().is_remote() || b.source().is_remote();
    let a_writes = Arc::clone(&current.writes()[index]);
    let mut writes = if by_copy {
        current.writes()[index + 1].deep_clone()
    } else {
        VersionSet::clone(&current.writes()[index + 1])
    };
    writes.merge_older(&a_writes, by_copy);
    let writes = Arc::new(writes);

    let reads = match (&current.reads()[index], &current.reads()[index + 1]) {
        (None, None) => None,
        (a_reads, b_reads) => {
            let mut union = b_reads
                .as_deref()
                .map(VersionSet::clone)
                .unwrap_or_default();
            if let Some(older) = a_reads {
                union.merge_older(older, false);
            }
            Some(Arc::new(union))
        }
    };
    drop(current);

    loop {
        let current = branch.current();
        let Some(index) = current.position(&a) else {
            a.mark_done();
            b.release_claim_b();
            debug!(target: "tessel::merge", sequence = a.sequence(), "merge abandoned, map rolled back");
            return Attempt::Abandoned;
        };
        let successor_unchanged = current
            .version_maps()
            .get(index + 1)
            .is_some_and(|m| Arc::ptr_eq(m, &b));
        if !successor_unchanged {
            b.release_claim_b();
            return defer(branch, a, true);
        }

        let speculative = index > current.acknowledged_index();
        let next = current.merged(
            index,
            Arc::clone(&writes),
            if speculative { reads.clone() } else { None },
        );
        if branch.install(&current, next).is_some() {
            break;
        }
        trace!(target: "tessel::merge", sequence = a.sequence(), "merge CAS lost, retrying");
    }

    a.mark_done();
    b.release_claim_b();
    debug!(
        target: "tessel::merge",
        merged = a.sequence(),
        into = b.sequence(),
        "version maps merged"
    );

    if let Some(owner) = a.take_owner() {
        if !owner.flags.contains(TransactionFlags::REMOTE) {
            branch.recycle(a_writes);
        }
    }
    Attempt::Merged
}

/// Retry deferred merges until a full pass makes no progress
///
/// Returns the number of merges performed.
pub(crate) fn drain(branch: &Branch) -> usize {
    let mut merged = 0;
    loop {
        let pass = branch.pending().len();
        if pass == 0 {
            break;
        }
        let mut progress = false;
        for _ in 0..pass {
            let pending = loop {
                match branch.pending().steal() {
                    Steal::Success(p) => break Some(p),
                    Steal::Empty => break None,
                    Steal::Retry => continue,
                }
            };
            let Some(pending) = pending else {
                break;
            };
            if attempt(branch, pending.map, pending.claimed) == Attempt::Merged {
                merged += 1;
                progress = true;
            }
        }
        if !progress {
            break;
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_core::{BranchConfig, ConnectionId, ObjectId, Value, Version};

    fn commit(branch: &Branch, object: u64, value: i64) {
        let mut txn = branch.start(TransactionFlags::NONE);
        txn.set(ObjectId(object), "v", value).unwrap();
        assert!(txn.commit(&crate::TransactionManager::new()).unwrap().is_success());
    }

    #[test]
    fn test_unwatched_maps_fold_into_head() {
        let branch = Branch::trunk(BranchConfig::default());
        for i in 0..10 {
            commit(&branch, i, i as i64);
        }
        let snap = branch.current();
        assert_eq!(snap.len(), 1);
        for i in 0..10 {
            assert_eq!(snap.field(ObjectId(i), "v"), Some(Value::Int(i as i64)));
        }
    }

    #[test]
    fn test_protected_map_is_not_merged() {
        let branch = Branch::trunk(BranchConfig::default());
        commit(&branch, 1, 1);
        let reader = branch.start(TransactionFlags::NONE);
        commit(&branch, 2, 2);
        commit(&branch, 3, 3);

        // The reader's head survives; everything after it folds into the head
        let snap = branch.current();
        assert_eq!(snap.len(), 2);
        assert_eq!(reader.captured().head().sequence(), snap.version_maps()[0].sequence());

        drop(reader);
        assert_eq!(branch.current().len(), 1);
        assert_eq!(branch.current().field(ObjectId(1), "v"), Some(Value::Int(1)));
    }

    #[test]
    fn test_deferred_attempt_is_drained() {
        let branch = Branch::trunk(BranchConfig::default());
        commit(&branch, 1, 1);
        let holder = branch.start(TransactionFlags::NONE);
        commit(&branch, 2, 2);
        let holder2 = branch.start(TransactionFlags::NONE);
        commit(&branch, 3, 3);

        let snap = branch.current();
        assert_eq!(snap.len(), 3);
        let middle = Arc::clone(&snap.version_maps()[1]);
        let head = Arc::clone(snap.head());

        // Block the merge of `middle` by claiming its successor
        assert!(head.try_claim_b());
        drop(holder2);
        assert_eq!(branch.pending().len(), 1);
        assert_eq!(branch.current().len(), 3);

        head.release_claim_b();
        assert_eq!(branch.compact(), 1);
        assert!(middle.is_done());
        assert_eq!(branch.current().len(), 2);
        drop(holder);
        assert_eq!(branch.current().len(), 1);
    }

    fn versions(set: &VersionSet) -> Vec<Version> {
        set.iter().map(|v| Version::clone(v)).collect()
    }

    #[test]
    fn test_remote_merge_copies_versions() {
        let branch = Branch::trunk(BranchConfig::default());
        let mut remote = branch.start_remote(TransactionFlags::NONE, ConnectionId(7));
        remote.set(ObjectId(1), "v", 1i64).unwrap();
        remote.set(ObjectId(1), "a", 1i64).unwrap();
        remote.set(ObjectId(3), "v", 3i64).unwrap();
        assert!(remote.commit(&crate::TransactionManager::new()).unwrap().is_success());

        let reader = branch.start(TransactionFlags::NONE);
        let mut local = branch.start(TransactionFlags::NONE);
        local.set(ObjectId(1), "v", 2i64).unwrap();
        local.set(ObjectId(2), "v", 2i64).unwrap();
        assert!(local.commit(&crate::TransactionManager::new()).unwrap().is_success());

        let captured = branch.current();
        assert_eq!(captured.len(), 2);
        assert!(captured.version_maps()[0].source().is_remote());
        let a_writes = Arc::clone(&captured.writes()[0]);
        let b_writes = Arc::clone(&captured.writes()[1]);
        let a_before = versions(&a_writes);
        let b_before = versions(&b_writes);

        drop(reader);
        let merged_snapshot = branch.current();
        assert_eq!(merged_snapshot.len(), 1);
        let merged = &merged_snapshot.writes()[0];
        for version in merged.iter() {
            assert!(!a_writes.iter().any(|v| Arc::ptr_eq(v, version)));
            assert!(!b_writes.iter().any(|v| Arc::ptr_eq(v, version)));
        }
        assert_eq!(versions(&a_writes), a_before);
        assert_eq!(versions(&b_writes), b_before);

        assert_eq!(merged_snapshot.field(ObjectId(1), "v"), Some(Value::Int(2)));
        assert_eq!(merged_snapshot.field(ObjectId(1), "a"), Some(Value::Int(1)));
        assert_eq!(merged_snapshot.field(ObjectId(3), "v"), Some(Value::Int(3)));
        // The captured chain still reads the same values
        assert_eq!(captured.field(ObjectId(1), "v"), Some(Value::Int(2)));
        assert_eq!(captured.field(ObjectId(1), "a"), Some(Value::Int(1)));
    }
}

//! Version maps: the unit of committed change
//!
//! A `VersionMap` is the identity of one committed transaction inside a
//! branch's snapshot chain. Its write and read sets live in the snapshot's
//! parallel arrays; the map itself carries the shared, atomically mutated
//! bookkeeping:
//!
//! - **watchers**: how many parties protect this map from being merged away.
//!   It starts above zero and, once it has reached zero, never rises again.
//! - **merge state**: `NONE | CLAIMED_A | CLAIMED_B | DONE`. A map is claimed
//!   by at most one merge attempt at a time, either as the map being removed
//!   (`A`) or as the successor absorbing it (`B`).
//!
//! The two atomics are mutated independently; a merge claims `A` only after
//! its watcher count reached zero, and `try_watch` refuses a zero count, so a
//! claimed `A` can never be resurrected.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use tessel_core::{Source, TransactionFlags, TransactionId};

const NONE: u8 = 0;
const CLAIMED_A: u8 = 1;
const CLAIMED_B: u8 = 2;
const DONE: u8 = 3;

/// Merge claim state of a version map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    /// Not involved in a merge
    None,
    /// Being merged into its successor
    ClaimedA,
    /// Absorbing its predecessor
    ClaimedB,
    /// Merged away or rolled back
    Done,
}

impl MergeState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            NONE => MergeState::None,
            CLAIMED_A => MergeState::ClaimedA,
            CLAIMED_B => MergeState::ClaimedB,
            _ => MergeState::Done,
        }
    }
}

/// Tag assigned at append time by a source splitter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterceptionId(pub u32);

/// Committed transaction a map came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapOwner {
    /// Committing transaction
    pub transaction: TransactionId,
    /// Its flags at commit time
    pub flags: TransactionFlags,
}

/// Committed change of one transaction
pub struct VersionMap {
    sequence: u64,
    watchers: AtomicUsize,
    merge_state: AtomicU8,
    source: Source,
    interception: Option<InterceptionId>,
    owner: Mutex<Option<MapOwner>>,
}

impl VersionMap {
    pub(crate) fn new(
        sequence: u64,
        watchers: usize,
        source: Source,
        interception: Option<InterceptionId>,
        owner: Option<MapOwner>,
    ) -> Self {
        debug_assert!(watchers > 0);
        VersionMap {
            sequence,
            watchers: AtomicUsize::new(watchers),
            merge_state: AtomicU8::new(NONE),
            source,
            interception,
            owner: Mutex::new(owner),
        }
    }

    /// Commit-order number, unique within the branch
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Where the change came from
    pub fn source(&self) -> Source {
        self.source
    }

    /// Interception tag, if a splitter assigned one
    pub fn interception(&self) -> Option<InterceptionId> {
        self.interception
    }

    /// Committing transaction, cleared once the map merged away
    pub fn owner(&self) -> Option<MapOwner> {
        *self.owner.lock()
    }

    pub(crate) fn take_owner(&self) -> Option<MapOwner> {
        self.owner.lock().take()
    }

    /// Current watcher count
    pub fn watchers(&self) -> usize {
        self.watchers.load(Ordering::Acquire)
    }

    /// Add a watcher unless the count already reached zero
    pub(crate) fn try_watch(&self) -> bool {
        let mut current = self.watchers.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.watchers.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop a watcher; returns the remaining count
    pub(crate) fn release(&self) -> usize {
        let previous = self.watchers.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "watcher released more often than taken");
        previous - 1
    }

    /// Current merge state
    pub fn merge_state(&self) -> MergeState {
        MergeState::from_raw(self.merge_state.load(Ordering::Acquire))
    }

    /// Whether the map merged away or was rolled back
    pub fn is_done(&self) -> bool {
        self.merge_state.load(Ordering::Acquire) == DONE
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.merge_state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn try_claim_a(&self) -> bool {
        self.transition(NONE, CLAIMED_A)
    }

    pub(crate) fn try_claim_b(&self) -> bool {
        self.transition(NONE, CLAIMED_B)
    }

    pub(crate) fn release_claim_a(&self) {
        self.transition(CLAIMED_A, NONE);
    }

    pub(crate) fn release_claim_b(&self) {
        self.transition(CLAIMED_B, NONE);
    }

    pub(crate) fn mark_done(&self) {
        self.merge_state.store(DONE, Ordering::Release);
    }
}

impl fmt::Debug for VersionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionMap")
            .field("sequence", &self.sequence)
            .field("watchers", &self.watchers())
            .field("merge_state", &self.merge_state())
            .field("source", &self.source)
            .finish()
    }
}

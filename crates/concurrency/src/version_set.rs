//! Open-addressed set of object versions
//!
//! One `VersionSet` holds at most one `Version` per object. It backs both the
//! read and write sets of a private transaction and the per-map write/read
//! arrays of a `Snapshot`.
//!
//! Entries are `Arc<Version>` and every mutation goes through
//! `Arc::make_mut`, so a set cloned into a snapshot never observes later
//! mutations of the set it was cloned from. Mutation is in place only when
//! the entry is not shared with anyone else.
//!
//! Linear probing, power-of-two capacity, no deletions (sets only grow until
//! they are cleared for reuse).

use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tessel_core::{ObjectId, Version};

const MIN_CAPACITY: usize = 8;

/// Open-addressed `ObjectId -> Version` set
#[derive(Debug, Clone, Default)]
pub struct VersionSet {
    slots: Vec<Option<Arc<Version>>>,
    len: usize,
}

fn slot_hash(object: ObjectId) -> usize {
    let mut hasher = FxHasher::default();
    object.hash(&mut hasher);
    hasher.finish() as usize
}

impl VersionSet {
    /// Empty set; allocates on first insert
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty set sized for `capacity` entries without growing
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (capacity * 2).next_power_of_two().max(MIN_CAPACITY);
        VersionSet {
            slots: vec![None; slots],
            len: 0,
        }
    }

    /// Number of versions
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots (allocated capacity)
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Entry stored at `slot`, used by resumable traversals
    pub fn slot(&self, slot: usize) -> Option<&Arc<Version>> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    fn find(&self, object: ObjectId) -> Result<usize, usize> {
        let mask = self.slots.len() - 1;
        let mut index = slot_hash(object) & mask;
        loop {
            match &self.slots[index] {
                Some(v) if v.object() == object => return Ok(index),
                Some(_) => index = (index + 1) & mask,
                None => return Err(index),
            }
        }
    }

    /// Version of `object`, if present
    pub fn get(&self, object: ObjectId) -> Option<&Arc<Version>> {
        if self.slots.is_empty() {
            return None;
        }
        match self.find(object) {
            Ok(index) => self.slots[index].as_ref(),
            Err(_) => None,
        }
    }

    /// Whether `object` has a version in this set
    pub fn contains(&self, object: ObjectId) -> bool {
        self.get(object).is_some()
    }

    fn reserve_one(&mut self) {
        if (self.len + 1) * 2 <= self.slots.len() {
            return;
        }
        let new_size = (self.slots.len() * 2).max(MIN_CAPACITY);
        let old = std::mem::replace(&mut self.slots, vec![None; new_size]);
        self.len = 0;
        for v in old.into_iter().flatten() {
            self.insert(v);
        }
    }

    /// Insert or replace the version of its object; returns the replaced one
    pub fn insert(&mut self, version: Arc<Version>) -> Option<Arc<Version>> {
        self.reserve_one();
        match self.find(version.object()) {
            Ok(index) => self.slots[index].replace(version),
            Err(index) => {
                self.slots[index] = Some(version);
                self.len += 1;
                None
            }
        }
    }

    /// Mutable version of `object`, created empty when absent
    ///
    /// Copies the version first if it is shared with another set.
    pub fn version_mut(&mut self, object: ObjectId) -> &mut Version {
        self.reserve_one();
        let index = match self.find(object) {
            Ok(index) => index,
            Err(index) => {
                self.slots[index] = Some(Arc::new(Version::new(object)));
                self.len += 1;
                index
            }
        };
        match &mut self.slots[index] {
            Some(v) => Arc::make_mut(v),
            None => unreachable!("slot was just located or filled"),
        }
    }

    /// Versions in slot order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Version>> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    /// Object ids in slot order
    pub fn objects(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.iter().map(|v| v.object())
    }

    /// First object present in both sets
    pub fn first_common(&self, other: &VersionSet) -> Option<ObjectId> {
        let (small, large) = if self.len <= other.len {
            (self, other)
        } else {
            (other, self)
        };
        small.objects().find(|o| large.contains(*o))
    }

    /// Remove every entry, keeping the allocation
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.len = 0;
    }

    /// Fold an older set under this one
    ///
    /// For objects present in both, `self`'s version survives and absorbs the
    /// fields only `older` touched. With `by_copy`, versions taken from `older`
    /// are cloned instead of shared.
    pub fn merge_older(&mut self, older: &VersionSet, by_copy: bool) {
        for old in older.iter() {
            if self.contains(old.object()) {
                self.version_mut(old.object()).merge_older(old);
            } else if by_copy {
                self.insert(Arc::new(Version::clone(old)));
            } else {
                self.insert(Arc::clone(old));
            }
        }
    }

    /// Copy sharing no version with `self`
    pub fn deep_clone(&self) -> VersionSet {
        VersionSet {
            slots: self
                .slots
                .iter()
                .map(|s| s.as_ref().map(|v| Arc::new(Version::clone(v))))
                .collect(),
            len: self.len,
        }
    }
}

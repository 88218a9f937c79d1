//! Incremental history walkers
//!
//! A `Walker` replays the acknowledged version maps of every branch it is
//! registered on, in commit order, through a user `Visitor`. It never blocks
//! commits: it only holds watchers on the maps it still needs.
//!
//! # Granularity
//!
//! - `All`: every map is presented exactly once. Maps appended while the
//!   walker is registered are born with its watcher; maps present at
//!   registration are watched then. The last delivered map stays watched so
//!   visited content never folds into a map not yet presented.
//! - `Coalesce`: each walk presents the window between the last delivered
//!   map and the current acknowledged boundary. Maps inside the window may
//!   have merged; only the end of the window is watched.
//!
//! # Suspension
//!
//! A visitor returning `Visit::Suspend` leaves the presented entry
//! unconsumed. The walker records the exact point (window, map, phase, slot)
//! and the next `walk` presents the same entry again. A visitor error is
//! treated the same way and additionally resolves pending flush tickets
//! with that error.
//!
//! # Unregistration
//!
//! A walk that sees a snapshot without this walker stops delivering on that
//! branch: maps appended after the unregistration carry no watcher of ours.
//! The `All` cursor tracks its watched maps by handle and adopts only maps
//! from snapshots in which the walker was still registered.

use crate::branch::{Branch, WeakBranch};
use crate::extension::ExtensionCore;
use crate::snapshot::Snapshot;
use crate::version_map::VersionMap;
use crate::version_set::VersionSet;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessel_core::{
    BranchId, ExtensionId, Granularity, ObjectId, TesselError, TesselResult, Version,
};
use tracing::{debug, trace, warn};

/// Visitor verdict on one presented entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Entry consumed; present the next one
    Continue,
    /// Entry not consumed; stop and present it again on the next walk
    Suspend,
}

/// Receives the history a walker replays
///
/// For every map: `begin_map`, then each written object, then (with
/// `WalkerOptions::visit_reads`) each read object when the map still carries
/// its read set, then `end_map`.
pub trait Visitor: Send {
    /// A map is about to be presented
    fn begin_map(&mut self, _branch: &Branch, _map: &Arc<VersionMap>) -> TesselResult<Visit> {
        Ok(Visit::Continue)
    }

    /// One object written by `map`
    fn visit_write(
        &mut self,
        branch: &Branch,
        map: &Arc<VersionMap>,
        version: &Version,
    ) -> TesselResult<Visit>;

    /// One object read by the transaction that committed `map`
    fn visit_read(
        &mut self,
        _branch: &Branch,
        _map: &Arc<VersionMap>,
        _object: ObjectId,
    ) -> TesselResult<Visit> {
        Ok(Visit::Continue)
    }

    /// Every entry of `map` was presented
    fn end_map(&mut self, _branch: &Branch, _map: &Arc<VersionMap>) -> TesselResult<Visit> {
        Ok(Visit::Continue)
    }
}

/// Walker configuration
#[derive(Clone, Default)]
pub struct WalkerOptions {
    /// Overrides the branch's default granularity
    pub granularity: Option<Granularity>,
    /// Present read sets as well as write sets
    pub visit_reads: bool,
    /// Called when the walker moves from idle to notified; schedules `run`
    pub on_notify: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl WalkerOptions {
    /// Set the granularity override
    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = Some(granularity);
        self
    }

    /// Present read sets
    pub fn with_reads(mut self) -> Self {
        self.visit_reads = true;
        self
    }

    /// Set the wake-up callback
    pub fn with_on_notify(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_notify = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for WalkerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalkerOptions")
            .field("granularity", &self.granularity)
            .field("visit_reads", &self.visit_reads)
            .field("on_notify", &self.on_notify.is_some())
            .finish()
    }
}

/// Result of one `walk`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    /// Every branch was already up to date
    Idle,
    /// Something was delivered; every branch is now up to date
    Progressed,
    /// The visitor suspended; the walker resumes at the same entry
    Suspended,
}

#[derive(Default)]
struct FlushSlot {
    result: Mutex<Option<TesselResult<()>>>,
    ready: Condvar,
}

impl FlushSlot {
    fn resolve(&self, result: TesselResult<()>) {
        let mut slot = self.result.lock();
        if slot.is_none() {
            *slot = Some(result);
            self.ready.notify_all();
        }
    }
}

/// Completion handle returned by `Walker::flush`
///
/// Resolved with `Ok(())` once a walk finds every registered branch up to
/// date, or with the error that stopped the walker.
#[derive(Clone)]
pub struct FlushTicket {
    slot: Arc<FlushSlot>,
}

impl FlushTicket {
    /// Result, if already resolved
    pub fn try_result(&self) -> Option<TesselResult<()>> {
        self.slot.result.lock().clone()
    }

    /// Whether the ticket has been resolved
    pub fn is_resolved(&self) -> bool {
        self.slot.result.lock().is_some()
    }

    /// Block until resolved or `timeout` elapsed
    pub fn wait(&self, timeout: Duration) -> Option<TesselResult<()>> {
        let deadline = Instant::now() + timeout;
        let mut result = self.slot.result.lock();
        while result.is_none() {
            if self.slot.ready.wait_until(&mut result, deadline).timed_out() {
                break;
            }
        }
        result.clone()
    }
}

impl fmt::Debug for FlushTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushTicket")
            .field("result", &*self.slot.result.lock())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Begin,
    Writes,
    Reads,
    End,
}

#[derive(Clone)]
struct Entry {
    map: Arc<VersionMap>,
    writes: Arc<VersionSet>,
    reads: Option<Arc<VersionSet>>,
}

/// Maps being delivered, captured when the window opened
///
/// Holding the sets keeps them stable even if the maps merge meanwhile.
struct Window {
    entries: Vec<Entry>,
    /// Becomes the boundary once the window is delivered
    end: Arc<VersionMap>,
    entry: usize,
    phase: Phase,
    slot: usize,
}

impl Window {
    fn capture(snapshot: &Snapshot, start: usize, end: usize) -> Window {
        let entries = (start..=end)
            .map(|i| Entry {
                map: Arc::clone(&snapshot.version_maps()[i]),
                writes: Arc::clone(&snapshot.writes()[i]),
                reads: snapshot.reads()[i].clone(),
            })
            .collect();
        Window {
            entries,
            end: Arc::clone(&snapshot.version_maps()[end]),
            entry: 0,
            phase: Phase::Begin,
            slot: 0,
        }
    }
}

enum Delivery {
    UpToDate,
    Delivered,
    Suspended,
}

/// Per-branch traversal state
struct BranchCursor {
    branch: WeakBranch,
    granularity: Granularity,
    /// Last delivered map; watched
    boundary: Option<Arc<VersionMap>>,
    /// `All`: maps after the boundary carrying our watcher, oldest first
    held: VecDeque<Arc<VersionMap>>,
    /// Watched end of the next `Coalesce` window
    target: Option<Arc<VersionMap>>,
    window: Option<Window>,
}

impl BranchCursor {
    /// Take over the maps appended after the newest one already held
    ///
    /// Every map in `snapshot` past that anchor was appended while the walker
    /// was registered and so was born with its watcher.
    fn adopt(&mut self, branch: &Branch, snapshot: &Snapshot) {
        while let Some(last) = self.held.back() {
            if !last.is_done() || snapshot.position(last).is_some() {
                break;
            }
            // Rolled back
            if let Some(last) = self.held.pop_back() {
                branch.release_watcher(&last);
            }
        }
        let anchor = self.held.back().or(self.boundary.as_ref());
        if let Some(position) = anchor.and_then(|m| snapshot.position(m)) {
            self.held
                .extend(snapshot.version_maps()[position + 1..].iter().cloned());
        }
    }

    fn open_window(&mut self, branch: &Branch, walker: ExtensionId) -> Option<Window> {
        loop {
            let snapshot = branch.current();
            if !snapshot.slow_changing().contains(walker) {
                // Unregistration in progress; new maps lack our watcher
                return None;
            }
            match self.granularity {
                Granularity::All => {
                    self.adopt(branch, &snapshot);
                    let position = snapshot.position(self.held.front()?)?;
                    if position > snapshot.acknowledged_index() {
                        return None;
                    }
                    return Some(Window::capture(&snapshot, position, position));
                }
                Granularity::Coalesce => {
                    let start = self
                        .boundary
                        .as_ref()
                        .and_then(|b| snapshot.position(b))
                        .map_or(0, |p| p + 1);
                    if start > snapshot.acknowledged_index() {
                        return None;
                    }
                    let target = match self.target.take() {
                        Some(target) => target,
                        None => {
                            let target = Arc::clone(snapshot.acknowledged_map());
                            if !target.try_watch() {
                                trace!(target: "tessel::walker", branch = %branch.id(), "boundary moved, reloading");
                                continue;
                            }
                            target
                        }
                    };
                    match snapshot.position(&target) {
                        Some(end) if end >= start => {
                            return Some(Window::capture(&snapshot, start, end))
                        }
                        _ => branch.release_watcher(&target),
                    }
                }
            }
        }
    }

    fn deliver(
        &mut self,
        branch: &Branch,
        walker: ExtensionId,
        visitor: &mut dyn Visitor,
        visit_reads: bool,
    ) -> TesselResult<Delivery> {
        if self.window.is_none() {
            self.window = self.open_window(branch, walker);
        }
        let Some(window) = self.window.as_mut() else {
            return Ok(Delivery::UpToDate);
        };

        while let Some(entry) = window.entries.get(window.entry).cloned() {
            match window.phase {
                Phase::Begin => {
                    if visitor.begin_map(branch, &entry.map)? == Visit::Suspend {
                        return Ok(Delivery::Suspended);
                    }
                    window.phase = Phase::Writes;
                    window.slot = 0;
                }
                Phase::Writes => {
                    while window.slot < entry.writes.slot_count() {
                        if let Some(version) = entry.writes.slot(window.slot) {
                            if visitor.visit_write(branch, &entry.map, version)? == Visit::Suspend {
                                return Ok(Delivery::Suspended);
                            }
                        }
                        window.slot += 1;
                    }
                    window.phase = Phase::Reads;
                    window.slot = 0;
                }
                Phase::Reads => {
                    if let Some(reads) = entry.reads.as_ref().filter(|_| visit_reads) {
                        while window.slot < reads.slot_count() {
                            if let Some(read) = reads.slot(window.slot) {
                                let object = read.object();
                                if visitor.visit_read(branch, &entry.map, object)? == Visit::Suspend {
                                    return Ok(Delivery::Suspended);
                                }
                            }
                            window.slot += 1;
                        }
                    }
                    window.phase = Phase::End;
                    window.slot = 0;
                }
                Phase::End => {
                    if visitor.end_map(branch, &entry.map)? == Visit::Suspend {
                        return Ok(Delivery::Suspended);
                    }
                    window.entry += 1;
                    window.phase = Phase::Begin;
                }
            }
        }

        let Some(window) = self.window.take() else {
            return Ok(Delivery::UpToDate);
        };
        debug!(
            target: "tessel::walker",
            branch = %branch.id(),
            sequence = window.end.sequence(),
            maps = window.entries.len(),
            "window delivered"
        );
        if self.granularity == Granularity::All {
            let front = self.held.pop_front();
            debug_assert!(front.is_some_and(|m| Arc::ptr_eq(&m, &window.end)));
        }
        if let Some(previous) = self.boundary.replace(window.end) {
            branch.release_watcher(&previous);
        }
        Ok(Delivery::Delivered)
    }

    /// Drop every watcher this cursor holds on `branch`
    ///
    /// `installed` is the snapshot that removed the walker; its maps are the
    /// last ones born with the walker's watcher.
    fn release(mut self, branch: &Branch, installed: &Snapshot) {
        match self.granularity {
            Granularity::All => {
                self.adopt(branch, installed);
                // An open window's map is the front of `held`
                branch.release_all(self.held.drain(..));
            }
            Granularity::Coalesce => {
                if let Some(window) = self.window.take() {
                    branch.release_watcher(&window.end);
                }
                if let Some(target) = self.target.take() {
                    branch.release_watcher(&target);
                }
            }
        }
        if let Some(boundary) = self.boundary.take() {
            branch.release_watcher(&boundary);
        }
    }
}

struct WalkerState {
    visitor: Box<dyn Visitor>,
    cursors: Vec<BranchCursor>,
    /// Round-robin start
    next: usize,
}

/// Extension replaying branch history through a `Visitor`
pub struct Walker {
    core: ExtensionCore,
    options: WalkerOptions,
    state: Mutex<WalkerState>,
    /// Orders registration changes so a detach completes before re-attaching
    registration: Mutex<()>,
    flushes: Mutex<Vec<Arc<FlushSlot>>>,
}

impl Walker {
    /// Walker using each branch's default granularity
    pub fn new(visitor: impl Visitor + 'static) -> Arc<Walker> {
        Self::with_options(visitor, WalkerOptions::default())
    }

    /// Walker with explicit options
    pub fn with_options(visitor: impl Visitor + 'static, options: WalkerOptions) -> Arc<Walker> {
        Arc::new(Walker {
            core: ExtensionCore::new(),
            options,
            state: Mutex::new(WalkerState {
                visitor: Box::new(visitor),
                cursors: Vec::new(),
                next: 0,
            }),
            registration: Mutex::new(()),
            flushes: Mutex::new(Vec::new()),
        })
    }

    /// Id and run-state
    pub fn core(&self) -> &ExtensionCore {
        &self.core
    }

    /// Options fixed at construction
    pub fn options(&self) -> &WalkerOptions {
        &self.options
    }

    /// Granularity on a branch whose default is `default`
    pub fn granularity_on(&self, default: Granularity) -> Granularity {
        self.options.granularity.unwrap_or(default)
    }

    /// Branches this walker currently tracks
    pub fn branches(&self) -> Vec<BranchId> {
        self.state.lock().cursors.iter().map(|c| c.branch.id()).collect()
    }

    /// Request a run; invokes `on_notify` on the idle-to-notified edge
    pub fn notify(&self) {
        if self.core.request_run() {
            if let Some(on_notify) = &self.options.on_notify {
                on_notify();
            }
        }
    }

    /// Watch what this walker needs before it is installed on `branch`
    ///
    /// `None` if a map was merged away meanwhile; the caller retries on a
    /// fresh snapshot.
    pub(crate) fn protect(
        &self,
        branch: &Branch,
        snapshot: &Snapshot,
        default: Granularity,
    ) -> Option<Vec<Arc<VersionMap>>> {
        let wanted: &[Arc<VersionMap>] = match self.granularity_on(default) {
            Granularity::All => snapshot.version_maps(),
            Granularity::Coalesce => std::slice::from_ref(snapshot.acknowledged_map()),
        };
        let mut held = Vec::with_capacity(wanted.len());
        for map in wanted {
            if !map.try_watch() {
                branch.release_all(held);
                return None;
            }
            held.push(Arc::clone(map));
        }
        Some(held)
    }

    /// Held by the branch across a registration change and the matching
    /// `attach` or `detach`
    pub(crate) fn registration(&self) -> MutexGuard<'_, ()> {
        self.registration.lock()
    }

    /// Start tracking `branch` with the watchers taken by `protect`
    pub(crate) fn attach(&self, branch: &Branch, default: Granularity, held: Vec<Arc<VersionMap>>) {
        let granularity = self.granularity_on(default);
        let (held, target) = match granularity {
            Granularity::All => (VecDeque::from(held), None),
            Granularity::Coalesce => (VecDeque::new(), held.into_iter().next()),
        };
        self.state.lock().cursors.push(BranchCursor {
            branch: branch.downgrade(),
            granularity,
            boundary: None,
            held,
            target,
            window: None,
        });
        debug!(target: "tessel::walker", walker = %self.core.id(), branch = %branch.id(), ?granularity, "walker attached");
        self.notify();
    }

    /// Stop tracking `branch`, releasing the watchers counted in `installed`
    pub(crate) fn detach(&self, branch: &Branch, installed: &Snapshot, reason: Option<TesselError>) {
        let cursor = {
            let mut state = self.state.lock();
            let position = state.cursors.iter().position(|c| c.branch.id() == branch.id());
            let cursor = position.map(|p| state.cursors.remove(p));
            if state.next >= state.cursors.len() {
                state.next = 0;
            }
            cursor
        };
        if let Some(cursor) = cursor {
            cursor.release(branch, installed);
        }
        if let Some(reason) = reason {
            self.resolve(
                mem::take(&mut *self.flushes.lock()),
                Err(TesselError::aborted_by("walker unregistered", reason)),
            );
        }
        debug!(target: "tessel::walker", walker = %self.core.id(), branch = %branch.id(), "walker detached");
    }

    /// Ticket resolved once every registered branch has been walked up to
    /// the acknowledged state current at the time of a later walk
    pub fn flush(&self) -> FlushTicket {
        let slot = Arc::new(FlushSlot::default());
        if self.core.is_disposed() {
            slot.resolve(Err(TesselError::invalid_state(format!(
                "walker {} is disposed",
                self.core.id()
            ))));
        } else {
            self.flushes.lock().push(Arc::clone(&slot));
            self.notify();
        }
        FlushTicket { slot }
    }

    fn resolve(&self, waiting: Vec<Arc<FlushSlot>>, result: TesselResult<()>) {
        for slot in waiting {
            slot.resolve(result.clone());
        }
    }

    /// Deliver everything acknowledged on every registered branch
    ///
    /// Branches are served round-robin, one window per turn, until all are
    /// up to date or the visitor suspends. Flush tickets taken before the
    /// walk started are resolved by it.
    ///
    /// # Errors
    ///
    /// The visitor's error. The walker stays registered and resumes at the
    /// failing entry.
    pub fn walk(&self) -> TesselResult<WalkOutcome> {
        let waiting = mem::take(&mut *self.flushes.lock());
        let result = self.walk_all();
        match &result {
            Ok(WalkOutcome::Suspended) => self.flushes.lock().extend(waiting),
            Ok(_) => self.resolve(waiting, Ok(())),
            Err(e) => {
                warn!(target: "tessel::walker", walker = %self.core.id(), error = %e, "visitor failed");
                self.resolve(waiting, Err(e.clone()));
            }
        }
        result
    }

    fn walk_all(&self) -> TesselResult<WalkOutcome> {
        let mut state = self.state.lock();
        let WalkerState {
            visitor,
            cursors,
            next,
        } = &mut *state;
        cursors.retain(|c| c.branch.upgrade().is_some());

        let mut delivered = false;
        loop {
            let count = cursors.len();
            if count == 0 {
                break;
            }
            if *next >= count {
                *next = 0;
            }
            let mut progress = false;
            for step in 0..count {
                let index = (*next + step) % count;
                let cursor = &mut cursors[index];
                let Some(branch) = cursor.branch.upgrade() else {
                    continue;
                };
                let delivery = cursor.deliver(
                    &branch,
                    self.core.id(),
                    visitor.as_mut(),
                    self.options.visit_reads,
                );
                match delivery {
                    Ok(Delivery::UpToDate) => {}
                    Ok(Delivery::Delivered) => progress = true,
                    Ok(Delivery::Suspended) => {
                        *next = index;
                        trace!(target: "tessel::walker", walker = %self.core.id(), branch = %branch.id(), "visitor suspended");
                        return Ok(WalkOutcome::Suspended);
                    }
                    Err(e) => {
                        *next = index;
                        return Err(e);
                    }
                }
            }
            if !progress {
                break;
            }
            delivered = true;
            *next = (*next + 1) % count;
        }
        Ok(if delivered {
            WalkOutcome::Progressed
        } else {
            WalkOutcome::Idle
        })
    }

    /// Drive the run-state machine: walk while runs are requested
    ///
    /// Returns `Idle` without walking if the walker is disposed or another
    /// thread is running it (that thread walks again).
    ///
    /// # Errors
    ///
    /// The visitor's error; the run ends and the walker stays runnable.
    pub fn run(&self) -> TesselResult<WalkOutcome> {
        self.core.request_run();
        let mut outcome = WalkOutcome::Idle;
        while self.core.begin() {
            let result = self.walk();
            let again = self.core.end();
            match result? {
                WalkOutcome::Suspended => return Ok(WalkOutcome::Suspended),
                WalkOutcome::Progressed => outcome = WalkOutcome::Progressed,
                WalkOutcome::Idle => {}
            }
            if !again {
                break;
            }
        }
        Ok(outcome)
    }
}

impl fmt::Debug for Walker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Walker")
            .field("core", &self.core)
            .field("options", &self.options)
            .finish()
    }
}

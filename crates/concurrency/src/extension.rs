//! Branch extensions
//!
//! An extension is a registrable consumer of a branch's commit stream. The
//! set of kinds is closed:
//!
//! - **Walker**: replays acknowledged version maps in commit order
//! - **Acknowledger**: a store or peer that confirms appended maps by sequence
//! - **SourceSplitter**: tags appended maps with an interception id
//!
//! Every extension carries an `ExtensionCore` with its id and run-state.
//! The run-state coalesces wake-ups into at most one in-flight execution:
//!
//! ```text
//! IDLE --request_run--> NOTIFIED --begin--> RUNNING --end--> IDLE
//!                                              |
//!                                   request_run while running
//!                                              v
//!                                     RUNNING_NOTIFIED --end--> NOTIFIED
//! ```
//!
//! `DISPOSED` is terminal and absorbs every transition.

use crate::branch::Branch;
use crate::version_map::{InterceptionId, VersionMap};
use crate::version_set::VersionSet;
use crate::walker::Walker;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tessel_core::{ExtensionId, Source};

const IDLE: u8 = 0;
const NOTIFIED: u8 = 1;
const RUNNING: u8 = 2;
const RUNNING_NOTIFIED: u8 = 3;
const DISPOSED: u8 = 4;

/// Observable run-state of an extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Nothing to do
    Idle,
    /// A run was requested and has not started
    Notified,
    /// Running (possibly with another run already requested)
    Running,
    /// Terminal
    Disposed,
}

/// Id and run-state shared by every extension kind
pub struct ExtensionCore {
    id: ExtensionId,
    state: AtomicU8,
}

impl Default for ExtensionCore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtensionCore {
    /// Fresh core with a new id, idle
    pub fn new() -> Self {
        ExtensionCore {
            id: ExtensionId::next(),
            state: AtomicU8::new(IDLE),
        }
    }

    /// Extension id
    pub fn id(&self) -> ExtensionId {
        self.id
    }

    /// Current run-state
    pub fn status(&self) -> RunStatus {
        match self.state.load(Ordering::Acquire) {
            IDLE => RunStatus::Idle,
            NOTIFIED => RunStatus::Notified,
            RUNNING | RUNNING_NOTIFIED => RunStatus::Running,
            _ => RunStatus::Disposed,
        }
    }

    /// Whether the extension reached its terminal state
    pub fn is_disposed(&self) -> bool {
        self.state.load(Ordering::Acquire) == DISPOSED
    }

    /// Ask for a run; returns true if this call moved `IDLE` to `NOTIFIED`
    /// (the caller should schedule the run)
    pub fn request_run(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = match current {
                IDLE => NOTIFIED,
                RUNNING => RUNNING_NOTIFIED,
                _ => return false,
            };
            match self
                .state
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next == NOTIFIED,
                Err(actual) => current = actual,
            }
        }
    }

    /// Start a requested run; false if none is pending or one is in flight
    pub fn begin(&self) -> bool {
        self.state
            .compare_exchange(NOTIFIED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Finish a run; returns true if another run was requested meanwhile
    pub fn end(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = match current {
                RUNNING => IDLE,
                RUNNING_NOTIFIED => NOTIFIED,
                _ => return false,
            };
            match self
                .state
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next == NOTIFIED,
                Err(actual) => current = actual,
            }
        }
    }

    /// Move to the terminal state
    pub fn dispose(&self) {
        self.state.store(DISPOSED, Ordering::Release);
    }
}

impl fmt::Debug for ExtensionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionCore")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

/// Store or peer confirming appended maps
///
/// With `Consistency::Full`, appended maps stay speculative until every
/// registered acknowledger called `Branch::acknowledge` with a sequence at
/// least as large as theirs.
pub trait Acknowledger: Send + Sync {
    /// Id and run-state
    fn core(&self) -> &ExtensionCore;

    /// A map was appended to `branch`
    ///
    /// Called on the committing thread after the append became visible.
    /// Implementations must not block; acknowledge later from their own
    /// context.
    fn on_append(&self, branch: &Branch, map: &Arc<VersionMap>, writes: &Arc<VersionSet>);
}

/// Tags appended maps by source
pub trait SourceSplitter: Send + Sync {
    /// Id and run-state
    fn core(&self) -> &ExtensionCore;

    /// Interception id for a map committed from `source`, if any
    fn intercept(&self, source: Source) -> Option<InterceptionId>;
}

/// Registered extension
#[derive(Clone)]
pub enum Extension {
    /// History replay
    Walker(Arc<Walker>),
    /// Acknowledging store or peer
    Acknowledger(Arc<dyn Acknowledger>),
    /// Source-based map tagging
    SourceSplitter(Arc<dyn SourceSplitter>),
}

impl Extension {
    /// Id and run-state of the wrapped extension
    pub fn core(&self) -> &ExtensionCore {
        match self {
            Extension::Walker(w) => w.core(),
            Extension::Acknowledger(a) => a.core(),
            Extension::SourceSplitter(s) => s.core(),
        }
    }

    /// Extension id
    pub fn id(&self) -> ExtensionId {
        self.core().id()
    }
}

impl From<Arc<Walker>> for Extension {
    fn from(walker: Arc<Walker>) -> Self {
        Extension::Walker(walker)
    }
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Extension::Walker(_) => "Walker",
            Extension::Acknowledger(_) => "Acknowledger",
            Extension::SourceSplitter(_) => "SourceSplitter",
        };
        write!(f, "{}({})", kind, self.id())
    }
}

//! Explicit current-transaction context
//!
//! Code that runs "inside" a transaction receives a `TransactionContext`
//! instead of consulting thread-local state. The context keeps a stack: the
//! bottom entry is a private transaction of some branch, every entry above
//! it a nested child of the one below. `begin` pushes, `commit`/`abort` pop
//! and restore the previous current transaction.
//!
//! A top-level transaction can be detached with `suspend` and later
//! reattached to any idle context with `resume`.

use crate::branch::Branch;
use crate::manager::CommitCoordinator;
use crate::transaction::Transaction;
use tessel_core::{CommitResult, TesselError, TesselResult, TransactionFlags, TransactionId};
use tracing::debug;

/// Stack of active transactions for one logical thread of work
#[derive(Debug, Default)]
pub struct TransactionContext {
    stack: Vec<Transaction>,
}

/// Top-level transaction detached from its context
#[derive(Debug)]
pub struct SuspendedTransaction {
    txn: Transaction,
}

impl SuspendedTransaction {
    /// Id of the suspended transaction
    pub fn id(&self) -> TransactionId {
        self.txn.id()
    }

    /// Read-only access while detached
    pub fn transaction(&self) -> &Transaction {
        &self.txn
    }
}

impl TransactionContext {
    /// Context with no current transaction
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transactions on the stack
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Whether no transaction is current
    pub fn is_idle(&self) -> bool {
        self.stack.is_empty()
    }

    /// Current transaction
    pub fn current(&mut self) -> Option<&mut Transaction> {
        self.stack.last_mut()
    }

    /// Start a transaction and make it current
    ///
    /// With a transaction already current the new one is its nested child and
    /// `branch` must be the one it belongs to.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the current transaction belongs to another branch
    /// or cannot start children.
    pub fn begin(&mut self, branch: &Branch, flags: TransactionFlags) -> TesselResult<&mut Transaction> {
        let txn = match self.stack.last() {
            Some(parent) => {
                if !parent.branch().ptr_eq(branch) {
                    return Err(TesselError::invalid_state(format!(
                        "transaction {} belongs to branch {}, not {}",
                        parent.id(),
                        parent.branch().id(),
                        branch.id()
                    )));
                }
                parent.start_child(flags)?
            }
            None => branch.start(flags),
        };
        self.stack.push(txn);
        Ok(self.current_unchecked())
    }

    fn current_unchecked(&mut self) -> &mut Transaction {
        let last = self.stack.len() - 1;
        &mut self.stack[last]
    }

    fn pop(&mut self) -> TesselResult<Transaction> {
        self.stack
            .pop()
            .ok_or_else(|| TesselError::invalid_state("no current transaction"))
    }

    /// Commit the current transaction and restore its parent as current
    ///
    /// A nested child is merged into its parent and reports `Success`; only
    /// the bottom transaction goes through `coordinator`.
    ///
    /// # Errors
    ///
    /// `InvalidState` if no transaction is current or the transaction
    /// refuses to commit. The popped transaction is aborted in that case.
    pub fn commit(&mut self, coordinator: &dyn CommitCoordinator) -> TesselResult<CommitResult> {
        let mut txn = self.pop()?;
        match self.stack.last_mut() {
            Some(parent) => {
                parent.merge_child(txn)?;
                Ok(CommitResult::Success)
            }
            None => txn.commit(coordinator),
        }
    }

    /// Abort the current transaction and restore its parent as current
    ///
    /// # Errors
    ///
    /// `InvalidState` if no transaction is current.
    pub fn abort(&mut self) -> TesselResult<()> {
        let mut txn = self.pop()?;
        txn.abort();
        Ok(())
    }

    /// Detach the current top-level transaction
    ///
    /// # Errors
    ///
    /// `InvalidState` if no transaction is current or nested children are
    /// still open.
    pub fn suspend(&mut self) -> TesselResult<SuspendedTransaction> {
        if self.stack.len() > 1 {
            return Err(TesselError::invalid_state(format!(
                "cannot suspend with {} nested transaction(s) open",
                self.stack.len() - 1
            )));
        }
        let mut txn = self.pop()?;
        txn.suspend()?;
        debug!(target: "tessel::txn", txn = %txn.id(), "transaction suspended");
        Ok(SuspendedTransaction { txn })
    }

    /// Reattach a suspended transaction as current
    ///
    /// # Errors
    ///
    /// `InvalidState` if this context already has a current transaction or
    /// the transaction can no longer run. The suspended transaction is
    /// aborted in that case.
    pub fn resume(&mut self, suspended: SuspendedTransaction) -> TesselResult<&mut Transaction> {
        let SuspendedTransaction { mut txn } = suspended;
        if let Some(current) = self.stack.last() {
            return Err(TesselError::invalid_state(format!(
                "cannot resume {}: {} is current",
                txn.id(),
                current.id()
            )));
        }
        txn.resume()?;
        debug!(target: "tessel::txn", txn = %txn.id(), "transaction resumed");
        self.stack.push(txn);
        Ok(self.current_unchecked())
    }
}

//! Unit-of-work coordination.
//!
//! A [`TransactionCoordinator`] drives one store transaction through
//! `Idle → Active → {Committed, Aborted} → Idle` and owns the
//! [`UpdateTracker`] that collects its side effects. There is no nesting:
//! `begin` on an active coordinator fails.

use crate::error::{ServiceError, ServiceResult};
use crate::object::ObjectRef;
use crate::store::{ObjectStore, StoreTransaction};
use crate::tracker::{TrackedChanges, UpdateTracker};
use objsync_protocol::Oid;
use tracing::{debug, error, warn};

/// State of a [`TransactionCoordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// No transaction.
    Idle,
    /// A transaction is open.
    Active,
    /// The last transaction committed.
    Committed,
    /// The last transaction was rolled back.
    Aborted,
}

/// Begins, commits and aborts store transactions for one exchange.
pub struct TransactionCoordinator<'s> {
    store: &'s dyn ObjectStore,
    user: String,
    state: TransactionState,
    active: Option<Box<dyn StoreTransaction + 's>>,
    tracker: UpdateTracker,
    last_outcome: Option<TransactionState>,
}

impl<'s> TransactionCoordinator<'s> {
    /// Creates an idle coordinator acting for `user`.
    pub fn new(store: &'s dyn ObjectStore, user: impl Into<String>) -> Self {
        Self {
            store,
            user: user.into(),
            state: TransactionState::Idle,
            active: None,
            tracker: UpdateTracker::new(),
            last_outcome: None,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Returns how the last finished transaction ended.
    pub fn last_outcome(&self) -> Option<TransactionState> {
        self.last_outcome
    }

    /// Returns true while a transaction is open.
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Returns the side effects recorded so far.
    pub fn tracker(&self) -> &UpdateTracker {
        &self.tracker
    }

    /// Opens a transaction.
    pub fn begin(&mut self) -> ServiceResult<()> {
        if self.is_active() {
            return Err(ServiceError::internal("transaction already active"));
        }
        let store = self.store;
        self.active = Some(store.begin_transaction(&self.user)?);
        self.tracker.clear();
        self.state = TransactionState::Active;
        debug!(user = %self.user, "transaction started");
        Ok(())
    }

    fn store_transaction(&mut self) -> ServiceResult<&mut (dyn StoreTransaction + 's)> {
        self.active
            .as_deref_mut()
            .ok_or_else(|| ServiceError::internal("no active transaction"))
    }

    /// Persists a transient object now.
    pub fn make_persistent(&mut self, handle: &ObjectRef) -> ServiceResult<Oid> {
        self.store_transaction()?.make_persistent(handle)
    }

    /// Records a changed object; its state is written at commit.
    pub fn object_changed(&mut self, handle: &ObjectRef) {
        self.tracker.object_changed(handle);
    }

    /// Records an object for disposal at commit.
    pub fn object_disposed(&mut self, handle: &ObjectRef) {
        self.tracker.object_disposed(handle);
    }

    /// Writes pending changes and commits.
    ///
    /// Returns everything the transaction touched. A failure while writing
    /// rolls the transaction back and is returned as an abort.
    pub fn commit(&mut self) -> ServiceResult<TrackedChanges> {
        if !self.is_active() {
            return Err(ServiceError::internal("commit without active transaction"));
        }
        if let Err(cause) = self.flush() {
            return Err(self.abort(cause));
        }

        let transaction = self
            .active
            .take()
            .ok_or_else(|| ServiceError::internal("no active transaction"))?;
        if let Err(cause) = transaction.commit() {
            self.tracker.clear();
            self.finish(TransactionState::Aborted);
            warn!(%cause, "store commit failed");
            return Err(ServiceError::aborted(cause));
        }

        self.finish(TransactionState::Committed);
        let changes = self.tracker.take();
        debug!(
            changed = changes.changed.len(),
            disposed = changes.disposed.len(),
            "transaction committed"
        );
        Ok(changes)
    }

    fn flush(&mut self) -> ServiceResult<()> {
        let changed = self.tracker.changed().to_vec();
        let disposed = self.tracker.disposed().to_vec();
        let transaction = self.store_transaction()?;

        // Objects persisted earlier in the transaction are already written.
        for handle in changed.iter().filter(|h| h.is_persistent() && h.is_dirty()) {
            transaction.apply_update(handle)?;
        }
        for handle in &disposed {
            transaction.dispose(handle)?;
        }
        Ok(())
    }

    /// Rolls back the open transaction and returns `cause` wrapped as an abort.
    ///
    /// A rollback that itself fails is unrecoverable and is reported as an
    /// internal error.
    pub fn abort(&mut self, cause: ServiceError) -> ServiceError {
        self.tracker.clear();
        let rollback = match self.active.take() {
            Some(transaction) => transaction.abort(),
            None => Ok(()),
        };
        self.finish(TransactionState::Aborted);

        match rollback {
            Ok(()) => {
                warn!(%cause, "transaction rolled back");
                ServiceError::aborted(cause)
            }
            Err(rollback_error) => {
                error!(%cause, %rollback_error, "rollback failed");
                ServiceError::internal(format!(
                    "rollback failed after '{cause}': {rollback_error}"
                ))
            }
        }
    }

    fn finish(&mut self, outcome: TransactionState) {
        self.last_outcome = Some(outcome);
        self.state = TransactionState::Idle;
    }

    /// Runs `work` inside a transaction.
    ///
    /// Commits if `work` succeeds, aborts if it fails, and returns the
    /// result together with the recorded side effects.
    pub fn run<T>(
        &mut self,
        work: impl FnOnce(&mut Self) -> ServiceResult<T>,
    ) -> ServiceResult<(T, TrackedChanges)> {
        self.begin()?;
        match work(self) {
            Ok(value) => {
                let changes = self.commit()?;
                Ok((value, changes))
            }
            Err(cause) => Err(self.abort(cause)),
        }
    }
}

impl Drop for TransactionCoordinator<'_> {
    fn drop(&mut self) {
        if let Some(transaction) = self.active.take() {
            if let Err(e) = transaction.abort() {
                error!(error = %e, "rollback on drop failed");
            }
        }
    }
}

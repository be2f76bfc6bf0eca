//! Per-exchange state.
//!
//! Every operation gets a fresh [`ExchangeContext`]; nothing here outlives a
//! single request. Domain actions see the exchange through an
//! [`ActionContext`] that is passed to them explicitly.

use crate::error::ServiceResult;
use crate::known::KnownObjectsTable;
use crate::object::ObjectRef;
use crate::store::{InstanceQuery, ObjectStore};
use crate::transaction::TransactionCoordinator;
use objsync_protocol::{Oid, Session};
use tracing::debug;

/// Messages and warnings raised by domain code during one transaction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MessageLog {
    messages: Vec<String>,
    warnings: Vec<String>,
}

impl MessageLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an informational message for the user.
    pub fn add_message(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    /// Records a warning for the user.
    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Messages recorded so far.
    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// Warnings recorded so far.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.warnings.is_empty()
    }

    /// Removes and returns `(messages, warnings)`.
    pub fn take(&mut self) -> (Vec<String>, Vec<String>) {
        (
            std::mem::take(&mut self.messages),
            std::mem::take(&mut self.warnings),
        )
    }

    /// Discards everything.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.warnings.clear();
    }
}

/// State scoped to one request.
#[derive(Debug)]
pub struct ExchangeContext {
    /// The validated session of the caller.
    pub session: Session,
    /// Handles decoded during this exchange.
    pub known: KnownObjectsTable,
    /// Messages raised during this exchange.
    pub log: MessageLog,
}

impl ExchangeContext {
    /// Starts an exchange for `session`.
    pub fn new(session: Session) -> Self {
        Self {
            session,
            known: KnownObjectsTable::new(),
            log: MessageLog::new(),
        }
    }

    /// The caller's user name.
    pub fn user(&self) -> &str {
        &self.session.user
    }
}

/// What a domain action may do while it runs.
///
/// Changes made through [`changed`](Self::changed) and
/// [`dispose`](Self::dispose) are written when the surrounding transaction
/// commits and are reported back to the client in the change set.
pub struct ActionContext<'a, 's> {
    session: &'a Session,
    store: &'s dyn ObjectStore,
    transaction: &'a mut TransactionCoordinator<'s>,
    log: &'a mut MessageLog,
}

impl<'a, 's> ActionContext<'a, 's> {
    /// Creates a context for one action invocation.
    pub fn new(
        session: &'a Session,
        store: &'s dyn ObjectStore,
        transaction: &'a mut TransactionCoordinator<'s>,
        log: &'a mut MessageLog,
    ) -> Self {
        Self {
            session,
            store,
            transaction,
            log,
        }
    }

    /// The user running the action.
    pub fn user(&self) -> &str {
        &self.session.user
    }

    /// The object store.
    pub fn store(&self) -> &'s dyn ObjectStore {
        self.store
    }

    /// Records that `handle` was modified.
    pub fn changed(&mut self, handle: &ObjectRef) {
        handle.mark_dirty();
        self.transaction.object_changed(handle);
    }

    /// Marks `handle` for deletion.
    pub fn dispose(&mut self, handle: &ObjectRef) {
        self.transaction.object_disposed(handle);
    }

    /// Persists a new object (and whatever it references) immediately.
    pub fn persist(&mut self, handle: &ObjectRef) -> ServiceResult<Oid> {
        let oid = self.transaction.make_persistent(handle)?;
        self.transaction.object_changed(handle);
        debug!(%oid, type_name = handle.type_name(), "persisted by action");
        Ok(oid)
    }

    /// Adds a message for the user.
    pub fn inform(&mut self, message: impl Into<String>) {
        self.log.add_message(message);
    }

    /// Adds a warning for the user.
    pub fn warn(&mut self, warning: impl Into<String>) {
        self.log.add_warning(warning);
    }

    /// Loads a persistent object.
    pub fn load(&self, oid: &Oid, type_name: &str) -> ServiceResult<ObjectRef> {
        self.store.load_by_oid(oid, type_name)
    }

    /// Runs a store query.
    pub fn query(&self, query: &InstanceQuery) -> ServiceResult<Vec<ObjectRef>> {
        self.store.query(query)
    }
}

//! Optimistic concurrency check.

use crate::error::{ServiceError, ServiceResult};
use crate::object::ObjectRef;
use crate::store::ObjectStore;
use objsync_protocol::Version;
use tracing::warn;

/// Compares claimed versions against the store's current versions.
///
/// This is the only concurrency control the protocol performs. It never
/// retries or merges; a stale client must refresh and try again.
pub struct VersionGuard<'s> {
    store: &'s dyn ObjectStore,
}

impl<'s> VersionGuard<'s> {
    /// Creates a guard over `store`.
    pub fn new(store: &'s dyn ObjectStore) -> Self {
        Self { store }
    }

    /// Fails with `ConcurrencyConflict` unless `claimed` is the current version.
    pub fn check_lock(&self, handle: &ObjectRef, claimed: &Version) -> ServiceResult<()> {
        let current = self.store.current_version(handle)?;
        if claimed.differs(&current) {
            let oid = handle
                .persistent_oid()
                .ok_or_else(|| ServiceError::internal("versioned object without oid"))?;
            warn!(%oid, %claimed, %current, "stale version rejected");
            return Err(ServiceError::ConcurrencyConflict {
                oid,
                claimed: claimed.clone(),
                current,
            });
        }
        Ok(())
    }

    /// Like [`check_lock`](Self::check_lock), but a missing claim is a protocol error.
    pub fn check_claimed(&self, handle: &ObjectRef, claimed: Option<&Version>) -> ServiceResult<()> {
        let claimed = claimed.ok_or_else(|| {
            ServiceError::protocol(format!("no version claimed for {}", handle.describe()))
        })?;
        self.check_lock(handle, claimed)
    }
}

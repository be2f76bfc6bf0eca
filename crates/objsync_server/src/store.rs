//! Object store capability consumed by the protocol service.
//!
//! The store owns server objects and performs the physical reads and writes.
//! Writes happen inside a [`StoreTransaction`]; the store must be able to roll
//! back everything done under one.

use crate::error::ServiceResult;
use crate::object::{ObjectRef, ScalarValue};
use objsync_protocol::{Oid, Version};
use std::collections::BTreeMap;

/// Value a query pattern compares a member against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternValue {
    /// Member must be null.
    Null,
    /// Member must hold this scalar.
    Scalar(ScalarValue),
    /// Member must reference the object with this oid.
    Reference(Oid),
}

/// A decoded instance query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceQuery {
    /// Type whose instances are searched.
    pub type_name: String,
    /// Member id to required value; empty matches every instance.
    pub pattern: BTreeMap<String, PatternValue>,
}

impl InstanceQuery {
    /// Matches every instance of `type_name`.
    pub fn all(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            pattern: BTreeMap::new(),
        }
    }
}

/// Read side of the object store.
pub trait ObjectStore: Send + Sync {
    /// Loads a persistent object. Fails with `NotFound` if it does not exist.
    fn load_by_oid(&self, oid: &Oid, type_name: &str) -> ServiceResult<ObjectRef>;

    /// Loads one lazily resolved member into `handle`.
    fn resolve_field(&self, handle: &ObjectRef, member_id: &str) -> ServiceResult<()>;

    /// Loads every member of `handle`.
    fn resolve_fully(&self, handle: &ObjectRef) -> ServiceResult<()>;

    /// Runs a query.
    fn query(&self, query: &InstanceQuery) -> ServiceResult<Vec<ObjectRef>>;

    /// Returns true if any instance of the type exists.
    fn has_instances(&self, type_name: &str) -> ServiceResult<bool>;

    /// Returns the singleton object registered under a logical service name.
    fn service_by_logical_name(&self, name: &str) -> ServiceResult<ObjectRef>;

    /// Returns the authoritative current version of a persistent object.
    fn current_version(&self, handle: &ObjectRef) -> ServiceResult<Version>;

    /// Starts a write transaction on behalf of `user`.
    fn begin_transaction(&self, user: &str) -> ServiceResult<Box<dyn StoreTransaction + '_>>;
}

/// Write side of the object store, scoped to one transaction.
///
/// Dropping an unfinished transaction must roll it back.
pub trait StoreTransaction {
    /// Persists a transient object and every transient object it references.
    ///
    /// Returns the object's persistent oid. Calling this on an object that is
    /// already persistent returns its oid and does nothing else.
    fn make_persistent(&mut self, handle: &ObjectRef) -> ServiceResult<Oid>;

    /// Writes the loaded state of a persistent object and returns its new version.
    fn apply_update(&mut self, handle: &ObjectRef) -> ServiceResult<Version>;

    /// Deletes a persistent object.
    fn dispose(&mut self, handle: &ObjectRef) -> ServiceResult<()>;

    /// Makes every write of this transaction permanent.
    fn commit(self: Box<Self>) -> ServiceResult<()>;

    /// Reverts every write of this transaction.
    fn abort(self: Box<Self>) -> ServiceResult<()>;
}

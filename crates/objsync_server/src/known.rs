//! Per-exchange table of materialized objects.

use crate::object::{same_object, ObjectRef};
use objsync_protocol::Oid;
use std::collections::HashMap;

/// Key of an entry in the [`KnownObjectsTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnownKey {
    /// Persistent oid or client-side transient placeholder.
    Oid(Oid),
    /// Synthetic key for a new object the client sent without any oid.
    InFlight(u64),
}

/// Maps oids to the handles decoded for them during one exchange.
///
/// Decoding the same oid twice yields the same handle, so shared and cyclic
/// subgraphs are materialized once. A table lives for exactly one exchange
/// and is never used as a cache across requests.
#[derive(Debug, Default)]
pub struct KnownObjectsTable {
    objects: HashMap<KnownKey, ObjectRef>,
    next_in_flight: u64,
}

impl KnownObjectsTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle decoded for `oid`.
    pub fn get(&self, oid: &Oid) -> Option<ObjectRef> {
        self.objects.get(&KnownKey::Oid(*oid)).cloned()
    }

    /// Returns true if `oid` has been decoded.
    pub fn contains(&self, oid: &Oid) -> bool {
        self.objects.contains_key(&KnownKey::Oid(*oid))
    }

    /// Records the handle decoded for `oid`.
    pub fn insert(&mut self, oid: Oid, handle: ObjectRef) {
        self.objects.insert(KnownKey::Oid(oid), handle);
    }

    /// Records a new object that arrived without an oid.
    pub fn insert_in_flight(&mut self, handle: ObjectRef) -> KnownKey {
        self.next_in_flight += 1;
        let key = KnownKey::InFlight(self.next_in_flight);
        self.objects.insert(key, handle);
        key
    }

    /// Also registers `handle` under its persistent oid once it has one.
    pub fn promote(&mut self, handle: &ObjectRef) {
        if let Some(oid) = handle.persistent_oid() {
            self.objects.insert(KnownKey::Oid(oid), ObjectRef::clone(handle));
        }
    }

    /// Returns true if `handle` is in the table under any key.
    pub fn holds(&self, handle: &ObjectRef) -> bool {
        self.objects.values().any(|h| same_object(h, handle))
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if nothing has been decoded.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

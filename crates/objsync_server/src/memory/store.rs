//! In-memory [`ObjectStore`] with undo-log transactions.

use crate::error::{ServiceError, ServiceResult};
use crate::object::{FieldValue, ObjectRef, ResolveState, ScalarValue, ServerObject};
use crate::store::{InstanceQuery, ObjectStore, PatternValue, StoreTransaction};
use objsync_protocol::{Oid, Version};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// Stored form of a member value. References are kept as serials.
#[derive(Debug, Clone, PartialEq)]
enum StoredValue {
    Null,
    Scalar(ScalarValue),
    Reference(u64),
    Collection(Vec<u64>),
}

#[derive(Debug, Clone)]
struct Record {
    type_name: String,
    version: Version,
    fields: BTreeMap<String, StoredValue>,
}

impl Record {
    fn has_collections(&self) -> bool {
        self.fields
            .values()
            .any(|v| matches!(v, StoredValue::Collection(_)))
    }
}

#[derive(Debug, Default)]
struct StoreState {
    records: BTreeMap<u64, Record>,
    services: HashMap<String, u64>,
    next_serial: u64,
}

/// Counters describing store activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Calls to `make_persistent`, including no-op calls.
    pub make_persistent_calls: u64,
    /// Objects actually written for the first time.
    pub objects_persisted: u64,
    /// Updates written.
    pub updates: u64,
    /// Objects deleted.
    pub disposals: u64,
    /// Transactions committed.
    pub commits: u64,
    /// Transactions rolled back.
    pub aborts: u64,
}

#[derive(Debug, Default)]
struct AtomicStats {
    make_persistent_calls: AtomicU64,
    objects_persisted: AtomicU64,
    updates: AtomicU64,
    disposals: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// An object store that keeps every record in memory.
///
/// Writes are applied eagerly and recorded in an undo log, so a transaction
/// sees its own writes and rollback restores the previous records. Only one
/// write transaction is open at a time; readers are never blocked by it.
///
/// # Example
///
/// ```
/// use objsync_server::{InMemoryObjectStore, ObjectStore, ServerObject};
///
/// let store = InMemoryObjectStore::new();
/// let oid = store.seed(&ServerObject::new_transient("Person", None)).unwrap();
/// assert!(store.has_instances("Person").unwrap());
/// assert!(store.load_by_oid(&oid, "Person").is_ok());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    state: RwLock<StoreState>,
    writer: Mutex<()>,
    stats: AtomicStats,
}

impl InMemoryObjectStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Persists `handle` (and everything it references) in its own transaction.
    pub fn seed(&self, handle: &ObjectRef) -> ServiceResult<Oid> {
        let mut transaction = self.begin_transaction("system")?;
        let oid = transaction.make_persistent(handle)?;
        transaction.commit()?;
        Ok(oid)
    }

    /// Persists `handle` and registers it under a logical service name.
    pub fn register_service(&self, name: impl Into<String>, handle: &ObjectRef) -> ServiceResult<Oid> {
        let oid = self.seed(handle)?;
        self.state.write().services.insert(name.into(), oid.serial());
        Ok(oid)
    }

    /// Returns the number of stored objects.
    pub fn object_count(&self) -> usize {
        self.state.read().records.len()
    }

    /// Returns true if an object with this oid is stored.
    pub fn contains(&self, oid: &Oid) -> bool {
        oid.is_persistent() && self.state.read().records.contains_key(&oid.serial())
    }

    /// Returns a snapshot of the activity counters.
    pub fn stats(&self) -> StoreStats {
        let s = &self.stats;
        StoreStats {
            make_persistent_calls: s.make_persistent_calls.load(Ordering::Relaxed),
            objects_persisted: s.objects_persisted.load(Ordering::Relaxed),
            updates: s.updates.load(Ordering::Relaxed),
            disposals: s.disposals.load(Ordering::Relaxed),
            commits: s.commits.load(Ordering::Relaxed),
            aborts: s.aborts.load(Ordering::Relaxed),
        }
    }

    fn serial_of(handle: &ObjectRef) -> ServiceResult<u64> {
        handle
            .persistent_oid()
            .map(|oid| oid.serial())
            .ok_or_else(|| ServiceError::not_found(format!("{} is not persistent", handle.describe())))
    }

    fn ghost(state: &StoreState, serial: u64) -> Option<ObjectRef> {
        state.records.get(&serial).map(|record| {
            ServerObject::new_persistent(
                record.type_name.clone(),
                Oid::Persistent(serial),
                record.version.clone(),
            )
        })
    }

    fn load_value(state: &StoreState, stored: &StoredValue) -> FieldValue {
        match stored {
            StoredValue::Null => FieldValue::Null,
            StoredValue::Scalar(value) => FieldValue::Scalar(value.clone()),
            StoredValue::Reference(serial) => Self::ghost(state, *serial)
                .map(FieldValue::Reference)
                .unwrap_or(FieldValue::Null),
            StoredValue::Collection(serials) => FieldValue::Collection(
                serials
                    .iter()
                    .filter_map(|serial| Self::ghost(state, *serial))
                    .collect(),
            ),
        }
    }

    /// Builds a handle with scalars and references loaded; collections stay lazy.
    fn materialize(state: &StoreState, serial: u64) -> ServiceResult<ObjectRef> {
        let record = state
            .records
            .get(&serial)
            .ok_or_else(|| ServiceError::not_found(Oid::Persistent(serial).to_string()))?;
        let handle = ServerObject::new_persistent(
            record.type_name.clone(),
            Oid::Persistent(serial),
            record.version.clone(),
        );
        for (member_id, stored) in &record.fields {
            if !matches!(stored, StoredValue::Collection(_)) {
                handle.restore_field(member_id.clone(), Self::load_value(state, stored));
            }
        }
        handle.set_resolve_state(if record.has_collections() {
            ResolveState::Partial
        } else {
            ResolveState::Resolved
        });
        Ok(handle)
    }

    fn refresh_resolve_state(handle: &ObjectRef, record: &Record) {
        let complete = record.fields.keys().all(|member_id| handle.has_field(member_id));
        handle.set_resolve_state(if complete {
            ResolveState::Resolved
        } else {
            ResolveState::Partial
        });
    }

    fn matches(record: &Record, pattern: &BTreeMap<String, PatternValue>) -> bool {
        pattern.iter().all(|(member_id, wanted)| {
            let stored = record.fields.get(member_id).unwrap_or(&StoredValue::Null);
            match (wanted, stored) {
                (PatternValue::Null, StoredValue::Null) => true,
                (PatternValue::Scalar(a), StoredValue::Scalar(b)) => a == b,
                (PatternValue::Reference(oid), StoredValue::Reference(serial)) => {
                    oid.is_persistent() && oid.serial() == *serial
                }
                _ => false,
            }
        })
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn load_by_oid(&self, oid: &Oid, type_name: &str) -> ServiceResult<ObjectRef> {
        if !oid.is_persistent() {
            return Err(ServiceError::not_found(format!("{oid} is not a persistent oid")));
        }
        let state = self.state.read();
        let record = state
            .records
            .get(&oid.serial())
            .ok_or_else(|| ServiceError::not_found(oid.to_string()))?;
        if record.type_name != type_name {
            return Err(ServiceError::not_found(format!(
                "{oid} is a {}, not a {type_name}",
                record.type_name
            )));
        }
        Self::materialize(&state, oid.serial())
    }

    fn resolve_field(&self, handle: &ObjectRef, member_id: &str) -> ServiceResult<()> {
        let serial = Self::serial_of(handle)?;
        let state = self.state.read();
        let record = state
            .records
            .get(&serial)
            .ok_or_else(|| ServiceError::not_found(handle.describe()))?;
        let value = record
            .fields
            .get(member_id)
            .map(|stored| Self::load_value(&state, stored))
            .unwrap_or(FieldValue::Null);
        handle.restore_field(member_id, value);
        Self::refresh_resolve_state(handle, record);
        Ok(())
    }

    fn resolve_fully(&self, handle: &ObjectRef) -> ServiceResult<()> {
        let serial = Self::serial_of(handle)?;
        let state = self.state.read();
        let record = state
            .records
            .get(&serial)
            .ok_or_else(|| ServiceError::not_found(handle.describe()))?;
        for (member_id, stored) in &record.fields {
            if !handle.has_field(member_id) {
                handle.restore_field(member_id.clone(), Self::load_value(&state, stored));
            }
        }
        handle.set_resolve_state(ResolveState::Resolved);
        Ok(())
    }

    fn query(&self, query: &InstanceQuery) -> ServiceResult<Vec<ObjectRef>> {
        let state = self.state.read();
        state
            .records
            .iter()
            .filter(|(_, record)| {
                record.type_name == query.type_name && Self::matches(record, &query.pattern)
            })
            .map(|(serial, _)| Self::materialize(&state, *serial))
            .collect()
    }

    fn has_instances(&self, type_name: &str) -> ServiceResult<bool> {
        Ok(self
            .state
            .read()
            .records
            .values()
            .any(|record| record.type_name == type_name))
    }

    fn service_by_logical_name(&self, name: &str) -> ServiceResult<ObjectRef> {
        let state = self.state.read();
        let serial = state
            .services
            .get(name)
            .copied()
            .ok_or_else(|| ServiceError::not_found(format!("service {name}")))?;
        Self::materialize(&state, serial)
    }

    fn current_version(&self, handle: &ObjectRef) -> ServiceResult<Version> {
        let serial = Self::serial_of(handle)?;
        self.state
            .read()
            .records
            .get(&serial)
            .map(|record| record.version.clone())
            .ok_or_else(|| ServiceError::not_found(handle.describe()))
    }

    fn begin_transaction(&self, user: &str) -> ServiceResult<Box<dyn StoreTransaction + '_>> {
        let writer = self.writer.lock();
        Ok(Box::new(MemoryTransaction {
            store: self,
            _writer: writer,
            user: user.to_string(),
            undo: Vec::new(),
            finished: false,
        }))
    }
}

enum Undo {
    Created(u64),
    Replaced(u64, Record),
}

/// Write transaction of an [`InMemoryObjectStore`].
struct MemoryTransaction<'a> {
    store: &'a InMemoryObjectStore,
    _writer: MutexGuard<'a, ()>,
    user: String,
    undo: Vec<Undo>,
    finished: bool,
}

impl MemoryTransaction<'_> {
    fn persist_graph(&mut self, handle: &ObjectRef) -> ServiceResult<Oid> {
        let serial = {
            let mut state = self.store.state.write();
            state.next_serial += 1;
            state.next_serial
        };
        let oid = Oid::Persistent(serial);
        // Assigned before recursing so back-references see a persistent object.
        handle.set_oid(oid);
        self.persist_references(handle)?;

        let version = Version::stamped(1, self.user.clone());
        let record = Record {
            type_name: handle.type_name().to_string(),
            version: version.clone(),
            fields: Self::stored_fields(handle)?,
        };
        self.store.state.write().records.insert(serial, record);
        self.undo.push(Undo::Created(serial));

        handle.set_version(version);
        handle.set_resolve_state(ResolveState::Resolved);
        handle.clear_dirty();
        bump(&self.store.stats.objects_persisted);
        Ok(oid)
    }

    fn persist_references(&mut self, handle: &ObjectRef) -> ServiceResult<()> {
        for (_, value) in handle.fields() {
            match value {
                FieldValue::Reference(target) if target.is_transient() => {
                    self.persist_graph(&target)?;
                }
                FieldValue::Collection(elements) => {
                    for element in elements.iter().filter(|e| e.is_transient()) {
                        self.persist_graph(element)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn stored_fields(handle: &ObjectRef) -> ServiceResult<BTreeMap<String, StoredValue>> {
        handle
            .fields()
            .into_iter()
            .map(|(member_id, value)| Ok((member_id, Self::stored_value(&value)?)))
            .collect()
    }

    fn stored_value(value: &FieldValue) -> ServiceResult<StoredValue> {
        let serial = |handle: &ObjectRef| InMemoryObjectStore::serial_of(handle);
        Ok(match value {
            FieldValue::Null => StoredValue::Null,
            FieldValue::Scalar(scalar) => StoredValue::Scalar(scalar.clone()),
            FieldValue::Reference(target) => StoredValue::Reference(serial(target)?),
            FieldValue::Collection(elements) => StoredValue::Collection(
                elements.iter().map(serial).collect::<ServiceResult<Vec<_>>>()?,
            ),
        })
    }

    fn rollback(&mut self) {
        let mut state = self.store.state.write();
        while let Some(entry) = self.undo.pop() {
            match entry {
                Undo::Created(serial) => {
                    state.records.remove(&serial);
                }
                Undo::Replaced(serial, record) => {
                    state.records.insert(serial, record);
                }
            }
        }
        self.finished = true;
        bump(&self.store.stats.aborts);
    }
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn make_persistent(&mut self, handle: &ObjectRef) -> ServiceResult<Oid> {
        bump(&self.store.stats.make_persistent_calls);
        match handle.persistent_oid() {
            Some(oid) => Ok(oid),
            None => self.persist_graph(handle),
        }
    }

    fn apply_update(&mut self, handle: &ObjectRef) -> ServiceResult<Version> {
        let serial = InMemoryObjectStore::serial_of(handle)?;
        self.persist_references(handle)?;
        let fields = Self::stored_fields(handle)?;

        let version = {
            let mut state = self.store.state.write();
            let record = state
                .records
                .get_mut(&serial)
                .ok_or_else(|| ServiceError::not_found(handle.describe()))?;
            let previous = record.clone();
            record.fields.extend(fields);
            record.version = Version::stamped(previous.version.sequence + 1, self.user.clone());
            let version = record.version.clone();
            self.undo.push(Undo::Replaced(serial, previous));
            version
        };

        handle.set_version(version.clone());
        handle.clear_dirty();
        bump(&self.store.stats.updates);
        Ok(version)
    }

    fn dispose(&mut self, handle: &ObjectRef) -> ServiceResult<()> {
        let serial = InMemoryObjectStore::serial_of(handle)?;
        let previous = self
            .store
            .state
            .write()
            .records
            .remove(&serial)
            .ok_or_else(|| ServiceError::not_found(handle.describe()))?;
        self.undo.push(Undo::Replaced(serial, previous));
        bump(&self.store.stats.disposals);
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> ServiceResult<()> {
        self.undo.clear();
        self.finished = true;
        bump(&self.store.stats.commits);
        Ok(())
    }

    fn abort(mut self: Box<Self>) -> ServiceResult<()> {
        self.rollback();
        Ok(())
    }
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback();
        }
    }
}

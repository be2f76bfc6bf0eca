//! Server-side object handles.
//!
//! A handle is shared (`Arc`) between the object store, which owns the
//! object, and the exchange that is currently working with it. Handle
//! identity is pointer identity: two [`ObjectRef`]s name the same in-memory
//! object iff [`same_object`] says so.

use objsync_protocol::{Oid, Version};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Shared reference to a server object.
pub type ObjectRef = Arc<ServerObject>;

/// Returns true if both references point at the same handle.
pub fn same_object(a: &ObjectRef, b: &ObjectRef) -> bool {
    Arc::ptr_eq(a, b)
}

/// Identity key of a handle, stable while the handle is alive.
pub(crate) fn object_key(handle: &ObjectRef) -> usize {
    Arc::as_ptr(handle) as usize
}

/// Decoded form of a value-type member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalarValue {
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

/// Value held by one member of a server object.
#[derive(Clone)]
pub enum FieldValue {
    /// No value.
    Null,
    /// Value type.
    Scalar(ScalarValue),
    /// One-to-one association.
    Reference(ObjectRef),
    /// One-to-many association.
    Collection(Vec<ObjectRef>),
}

impl FieldValue {
    /// Returns true for [`FieldValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Returns the referenced object of a one-to-one association.
    pub fn as_reference(&self) -> Option<&ObjectRef> {
        match self {
            FieldValue::Reference(handle) => Some(handle),
            _ => None,
        }
    }

    /// Returns the scalar of a value member.
    pub fn as_scalar(&self) -> Option<&ScalarValue> {
        match self {
            FieldValue::Scalar(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the elements of a one-to-many association.
    pub fn as_collection(&self) -> Option<&[ObjectRef]> {
        match self {
            FieldValue::Collection(elements) => Some(elements),
            _ => None,
        }
    }

    /// Compares two values, using handle identity for references.
    pub fn same_as(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (FieldValue::Null, FieldValue::Null) => true,
            (FieldValue::Scalar(a), FieldValue::Scalar(b)) => a == b,
            (FieldValue::Reference(a), FieldValue::Reference(b)) => same_object(a, b),
            (FieldValue::Collection(a), FieldValue::Collection(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| same_object(x, y))
            }
            _ => false,
        }
    }
}

impl fmt::Debug for FieldValue {
    // References print as identity only; object graphs may be cyclic.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "Null"),
            FieldValue::Scalar(value) => write!(f, "{value:?}"),
            FieldValue::Reference(handle) => write!(f, "Ref({})", handle.describe()),
            FieldValue::Collection(elements) => f
                .debug_list()
                .entries(elements.iter().map(|e| e.describe()))
                .finish(),
        }
    }
}

/// How much of a persistent object's state has been loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveState {
    /// Identity and version only.
    Ghost,
    /// Some members loaded, lazy members pending.
    Partial,
    /// Every member loaded.
    Resolved,
}

#[derive(Debug)]
struct ObjectState {
    oid: Option<Oid>,
    version: Option<Version>,
    resolve: ResolveState,
    fields: BTreeMap<String, FieldValue>,
    dirty: bool,
}

/// An object living on the server.
pub struct ServerObject {
    type_name: String,
    state: RwLock<ObjectState>,
}

impl ServerObject {
    /// Creates a handle for an object that has not been persisted.
    ///
    /// `oid` is the client's placeholder, if it sent one.
    pub fn new_transient(type_name: impl Into<String>, oid: Option<Oid>) -> ObjectRef {
        Arc::new(Self {
            type_name: type_name.into(),
            state: RwLock::new(ObjectState {
                oid,
                version: None,
                resolve: ResolveState::Resolved,
                fields: BTreeMap::new(),
                dirty: false,
            }),
        })
    }

    /// Creates a handle for a persistent object with nothing loaded yet.
    pub fn new_persistent(type_name: impl Into<String>, oid: Oid, version: Version) -> ObjectRef {
        Arc::new(Self {
            type_name: type_name.into(),
            state: RwLock::new(ObjectState {
                oid: Some(oid),
                version: Some(version),
                resolve: ResolveState::Ghost,
                fields: BTreeMap::new(),
                dirty: false,
            }),
        })
    }

    /// Returns the type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Returns the current oid.
    pub fn oid(&self) -> Option<Oid> {
        self.state.read().oid
    }

    /// Returns the persistent oid, if the object has one.
    pub fn persistent_oid(&self) -> Option<Oid> {
        self.oid().filter(Oid::is_persistent)
    }

    /// Replaces the oid. Used by the store when the object is persisted.
    pub fn set_oid(&self, oid: Oid) {
        self.state.write().oid = Some(oid);
    }

    /// Returns true once the store has assigned a persistent oid.
    pub fn is_persistent(&self) -> bool {
        self.persistent_oid().is_some()
    }

    /// Returns true while the object has no persistent oid.
    pub fn is_transient(&self) -> bool {
        !self.is_persistent()
    }

    /// Returns the version last seen for this handle.
    pub fn version(&self) -> Option<Version> {
        self.state.read().version.clone()
    }

    /// Records the version produced by the store.
    pub fn set_version(&self, version: Version) {
        self.state.write().version = Some(version);
    }

    /// Returns how much state is loaded.
    pub fn resolve_state(&self) -> ResolveState {
        self.state.read().resolve
    }

    /// Sets how much state is loaded.
    pub fn set_resolve_state(&self, resolve: ResolveState) {
        self.state.write().resolve = resolve;
    }

    /// Returns true if every member is loaded.
    pub fn is_resolved(&self) -> bool {
        self.resolve_state() == ResolveState::Resolved
    }

    /// Returns a member's value if it is loaded.
    pub fn field(&self, member_id: &str) -> Option<FieldValue> {
        self.state.read().fields.get(member_id).cloned()
    }

    /// Returns true if the member is loaded.
    pub fn has_field(&self, member_id: &str) -> bool {
        self.state.read().fields.contains_key(member_id)
    }

    /// Returns a snapshot of every loaded member.
    pub fn fields(&self) -> Vec<(String, FieldValue)> {
        self.state
            .read()
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Sets a member and marks the object dirty.
    pub fn set_field(&self, member_id: impl Into<String>, value: FieldValue) {
        let mut state = self.state.write();
        state.fields.insert(member_id.into(), value);
        state.dirty = true;
    }

    /// Clears a member and marks the object dirty.
    pub fn clear_field(&self, member_id: &str) {
        self.set_field(member_id, FieldValue::Null);
    }

    /// Appends `element` to a collection member unless it is already there.
    ///
    /// Returns false if the element was present.
    pub fn add_element(&self, member_id: &str, element: ObjectRef) -> bool {
        let mut state = self.state.write();
        let slot = state
            .fields
            .entry(member_id.to_string())
            .or_insert_with(|| FieldValue::Collection(Vec::new()));
        if slot.is_null() {
            *slot = FieldValue::Collection(Vec::new());
        }
        let added = match slot {
            FieldValue::Collection(elements) => {
                if elements.iter().any(|e| same_object(e, &element)) {
                    false
                } else {
                    elements.push(element);
                    true
                }
            }
            _ => false,
        };
        if added {
            state.dirty = true;
        }
        added
    }

    /// Removes `element` from a collection member.
    ///
    /// Returns false if the element was not present.
    pub fn remove_element(&self, member_id: &str, element: &ObjectRef) -> bool {
        let mut state = self.state.write();
        let removed = match state.fields.get_mut(member_id) {
            Some(FieldValue::Collection(elements)) => {
                let before = elements.len();
                elements.retain(|e| !same_object(e, element));
                elements.len() != before
            }
            _ => false,
        };
        if removed {
            state.dirty = true;
        }
        removed
    }

    /// Loads a member from storage without marking the object dirty.
    pub fn restore_field(&self, member_id: impl Into<String>, value: FieldValue) {
        self.state.write().fields.insert(member_id.into(), value);
    }

    /// Returns true if the object has unsaved changes.
    pub fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    /// Marks the object as having unsaved changes.
    pub fn mark_dirty(&self) {
        self.state.write().dirty = true;
    }

    /// Marks the object as saved.
    pub fn clear_dirty(&self) {
        self.state.write().dirty = false;
    }

    /// Short human-readable identity, e.g. `Person:P#1`.
    pub fn describe(&self) -> String {
        match self.oid() {
            Some(oid) => format!("{}:{}", self.type_name, oid),
            None => format!("{}:<new>", self.type_name),
        }
    }
}

impl fmt::Debug for ServerObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("ServerObject")
            .field("type_name", &self.type_name)
            .field("oid", &state.oid)
            .field("version", &state.version)
            .field("resolve", &state.resolve)
            .field("fields", &state.fields)
            .field("dirty", &state.dirty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_handle() {
        let handle = ServerObject::new_transient("Person", Some(Oid::Transient(4)));
        assert!(handle.is_transient());
        assert!(handle.is_resolved());
        assert_eq!(handle.oid(), Some(Oid::Transient(4)));
        assert_eq!(handle.persistent_oid(), None);
    }

    #[test]
    fn persistence_switches_oid() {
        let handle = ServerObject::new_transient("Person", None);
        handle.set_oid(Oid::Persistent(9));
        assert!(handle.is_persistent());
        assert_eq!(handle.describe(), "Person:P#9");
    }

    #[test]
    fn set_field_marks_dirty_restore_does_not() {
        let handle =
            ServerObject::new_persistent("Person", Oid::Persistent(1), Version::new(1, "a", 0));
        handle.restore_field("age", FieldValue::Scalar(ScalarValue::Integer(3)));
        assert!(!handle.is_dirty());

        handle.set_field("age", FieldValue::Scalar(ScalarValue::Integer(4)));
        assert!(handle.is_dirty());
        assert_eq!(
            handle.field("age").unwrap().as_scalar(),
            Some(&ScalarValue::Integer(4))
        );

        handle.clear_dirty();
        handle.clear_field("age");
        assert!(handle.field("age").unwrap().is_null());
        assert!(handle.is_dirty());
    }

    #[test]
    fn collection_elements_are_unique() {
        let owner = ServerObject::new_transient("Person", None);
        let friend = ServerObject::new_transient("Person", None);

        assert!(owner.add_element("friends", Arc::clone(&friend)));
        assert!(!owner.add_element("friends", Arc::clone(&friend)));
        assert_eq!(owner.field("friends").unwrap().as_collection().unwrap().len(), 1);

        assert!(owner.remove_element("friends", &friend));
        assert!(!owner.remove_element("friends", &friend));
    }

    #[test]
    fn cyclic_debug_terminates() {
        let a = ServerObject::new_transient("Person", None);
        let b = ServerObject::new_transient("Person", None);
        a.set_field("friend", FieldValue::Reference(Arc::clone(&b)));
        b.set_field("friend", FieldValue::Reference(Arc::clone(&a)));

        let text = format!("{a:?}");
        assert!(text.contains("Ref(Person:<new>)"));
    }

    #[test]
    fn same_as_uses_identity() {
        let a = ServerObject::new_transient("Person", None);
        let b = ServerObject::new_transient("Person", None);
        let ra = FieldValue::Reference(Arc::clone(&a));
        assert!(ra.same_as(&FieldValue::Reference(Arc::clone(&a))));
        assert!(!ra.same_as(&FieldValue::Reference(b)));
    }
}

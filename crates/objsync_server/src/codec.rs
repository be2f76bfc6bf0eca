//! Conversion between server handles and wire values.
//!
//! Decoding is deduplicated through the exchange's [`KnownObjectsTable`], so
//! an oid that appears several times in one request maps to one handle.
//! Encoding a complete graph keeps its own table of emitted handles: an
//! object is written out in full once and as an identity afterwards, which
//! makes cyclic graphs terminate.

use crate::error::{ServiceError, ServiceResult};
use crate::known::KnownObjectsTable;
use crate::metamodel::{MemberDescriptor, MemberKind, MemberResolver};
use crate::object::{object_key, FieldValue, ObjectRef, ResolveState, ScalarValue, ServerObject};
use crate::store::ObjectStore;
use objsync_protocol::{Oid, Version, WireValue};
use std::collections::{BTreeMap, HashSet};

/// How much of an object to put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeMode {
    /// Oid, type and current version only.
    IdentityOnly,
    /// The loaded fields, with references as identities.
    ForUpdate,
    /// Every visible member, recursively, each object once.
    CompleteGraph,
    /// Newly assigned oids and versions for a graph the client sent.
    MadePersistentDelta,
}

/// Encodes and decodes object graphs for one store and metamodel.
pub struct GraphCodec<'a> {
    store: &'a dyn ObjectStore,
    resolver: &'a dyn MemberResolver,
}

impl<'a> GraphCodec<'a> {
    /// Creates a codec.
    pub fn new(store: &'a dyn ObjectStore, resolver: &'a dyn MemberResolver) -> Self {
        Self { store, resolver }
    }

    /// Decodes any wire value.
    pub fn decode(&self, value: &WireValue, known: &mut KnownObjectsTable) -> ServiceResult<FieldValue> {
        match value {
            WireValue::Null => Ok(FieldValue::Null),
            WireValue::Identity { .. } | WireValue::Graph { .. } => {
                self.decode_object(value, known).map(FieldValue::Reference)
            }
            WireValue::Encoded { type_name, payload } => {
                let codec = self.resolver.value_codec(type_name)?;
                codec.decode(payload).map(FieldValue::Scalar)
            }
            WireValue::Collection { elements, .. } => elements
                .iter()
                .map(|element| self.decode_object(element, known))
                .collect::<ServiceResult<Vec<_>>>()
                .map(FieldValue::Collection),
        }
    }

    /// Decodes a value that must denote an object.
    pub fn decode_object(&self, value: &WireValue, known: &mut KnownObjectsTable) -> ServiceResult<ObjectRef> {
        match value {
            WireValue::Identity { oid, type_name, .. } => self.lookup(oid, type_name, known),
            WireValue::Graph {
                oid,
                type_name,
                fields,
                ..
            } => {
                let handle = match oid {
                    None => {
                        self.resolver.type_by_name(type_name)?;
                        let handle = ServerObject::new_transient(type_name.clone(), None);
                        known.insert_in_flight(ObjectRef::clone(&handle));
                        handle
                    }
                    Some(oid @ Oid::Transient(_)) => match known.get(oid) {
                        Some(handle) => Self::same_type(handle, oid, type_name)?,
                        None => {
                            self.resolver.type_by_name(type_name)?;
                            let handle = ServerObject::new_transient(type_name.clone(), Some(*oid));
                            known.insert(*oid, ObjectRef::clone(&handle));
                            handle
                        }
                    },
                    Some(oid) => self.lookup(oid, type_name, known)?,
                };
                self.apply_fields(&handle, fields, known)?;
                Ok(handle)
            }
            other => Err(ServiceError::protocol(format!(
                "expected an object reference, got {}",
                other.kind()
            ))),
        }
    }

    /// Decodes a value destined for `member`, checking that its shape fits.
    pub fn decode_member(
        &self,
        member: &MemberDescriptor,
        value: &WireValue,
        known: &mut KnownObjectsTable,
    ) -> ServiceResult<FieldValue> {
        match (member.kind, value) {
            (_, WireValue::Null) => Ok(FieldValue::Null),
            (MemberKind::Value, WireValue::Encoded { type_name, .. }) if *type_name != member.type_name => {
                Err(ServiceError::protocol(format!(
                    "member {} expects {}, got {type_name}",
                    member.id, member.type_name
                )))
            }
            (MemberKind::Value, WireValue::Encoded { .. })
            | (MemberKind::Reference, WireValue::Identity { .. } | WireValue::Graph { .. })
            | (MemberKind::Collection, WireValue::Collection { .. }) => self.decode(value, known),
            (kind, other) => Err(ServiceError::protocol(format!(
                "{} member {} cannot hold a {} value",
                kind.describe(),
                member.id,
                other.kind()
            ))),
        }
    }

    fn lookup(&self, oid: &Oid, type_name: &str, known: &mut KnownObjectsTable) -> ServiceResult<ObjectRef> {
        if let Some(handle) = known.get(oid) {
            return Self::same_type(handle, oid, type_name);
        }
        if oid.is_transient() {
            return Err(ServiceError::protocol(format!(
                "transient object {oid} referenced before it was sent"
            )));
        }
        self.resolver.type_by_name(type_name)?;
        let handle = self.store.load_by_oid(oid, type_name)?;
        known.insert(*oid, ObjectRef::clone(&handle));
        Ok(handle)
    }

    /// A handle already decoded in this exchange must be named with its own type.
    fn same_type(handle: ObjectRef, oid: &Oid, type_name: &str) -> ServiceResult<ObjectRef> {
        if handle.type_name() == type_name {
            Ok(handle)
        } else {
            Err(ServiceError::not_found(format!(
                "{oid} is a {}, not a {type_name}",
                handle.type_name()
            )))
        }
    }

    fn apply_fields(
        &self,
        handle: &ObjectRef,
        fields: &BTreeMap<String, WireValue>,
        known: &mut KnownObjectsTable,
    ) -> ServiceResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let ty = self.resolver.type_by_name(handle.type_name())?;
        for (member_id, wire) in fields {
            let member = self.resolver.member_by_name(&ty, member_id)?;
            if member.hidden {
                return Err(ServiceError::not_modifiable(
                    format!("{}#{member_id}", handle.type_name()),
                    "not visible",
                ));
            }
            let value = self.decode_member(member, wire, known)?;
            handle.set_field(member_id.clone(), value);
        }
        Ok(())
    }

    /// Encodes `handle` in `mode`.
    ///
    /// `MadePersistentDelta` needs the original request value; use
    /// [`encode_made_persistent`](Self::encode_made_persistent) for it.
    pub fn encode(&self, handle: &ObjectRef, mode: EncodeMode) -> ServiceResult<WireValue> {
        match mode {
            EncodeMode::IdentityOnly => self.identity(handle),
            EncodeMode::ForUpdate => self.for_update(handle),
            EncodeMode::CompleteGraph => self.complete(handle, &mut HashSet::new()),
            EncodeMode::MadePersistentDelta => Err(ServiceError::internal(
                "made-persistent delta requires the original value",
            )),
        }
    }

    /// Encodes a single member of `handle` as it is currently loaded.
    pub fn encode_member(&self, handle: &ObjectRef, member: &MemberDescriptor) -> ServiceResult<WireValue> {
        let value = handle.field(&member.id).unwrap_or(FieldValue::Null);
        self.shallow(member, &value)
    }

    /// Encodes an action result of declared type `type_name`.
    pub fn encode_value(&self, value: &FieldValue, type_name: Option<&str>) -> ServiceResult<WireValue> {
        let mut emitted = HashSet::new();
        match value {
            FieldValue::Null => Ok(WireValue::Null),
            FieldValue::Scalar(scalar) => {
                let type_name = type_name.ok_or_else(|| {
                    ServiceError::internal("scalar result from an action without a return type")
                })?;
                self.scalar(type_name, scalar)
            }
            FieldValue::Reference(handle) => self.complete(handle, &mut emitted),
            FieldValue::Collection(handles) => {
                let element_type = type_name
                    .or_else(|| handles.first().map(|h| h.type_name()))
                    .unwrap_or_default()
                    .to_string();
                let elements = handles
                    .iter()
                    .map(|h| self.complete(h, &mut emitted))
                    .collect::<ServiceResult<Vec<_>>>()?;
                Ok(WireValue::collection(element_type, elements))
            }
        }
    }

    /// Reports the oids and versions assigned to a graph the client sent.
    ///
    /// `original` is the value as received and `decoded` what it decoded to.
    /// Nested graphs and collections are followed so that every transient
    /// placeholder in the original can be reconciled. Members holding plain
    /// values are left out.
    pub fn encode_made_persistent(&self, original: &WireValue, decoded: &FieldValue) -> ServiceResult<WireValue> {
        match (original, decoded) {
            (WireValue::Identity { .. }, FieldValue::Reference(handle)) => self.identity(handle),
            (WireValue::Graph { fields, .. }, FieldValue::Reference(handle)) => {
                let mut delta = BTreeMap::new();
                for (member_id, nested) in fields {
                    if !matches!(
                        nested,
                        WireValue::Graph { .. } | WireValue::Identity { .. } | WireValue::Collection { .. }
                    ) {
                        continue;
                    }
                    let current = handle.field(member_id).unwrap_or(FieldValue::Null);
                    delta.insert(member_id.clone(), self.encode_made_persistent(nested, &current)?);
                }
                Ok(WireValue::Graph {
                    oid: handle.oid(),
                    type_name: handle.type_name().to_string(),
                    version: handle.version(),
                    fields: delta,
                })
            }
            (WireValue::Collection { element_type, elements }, FieldValue::Collection(handles)) => {
                let elements = elements
                    .iter()
                    .zip(handles)
                    .map(|(element, handle)| {
                        self.encode_made_persistent(element, &FieldValue::Reference(ObjectRef::clone(handle)))
                    })
                    .collect::<ServiceResult<Vec<_>>>()?;
                Ok(WireValue::collection(element_type.clone(), elements))
            }
            _ => Ok(WireValue::Null),
        }
    }

    fn identity(&self, handle: &ObjectRef) -> ServiceResult<WireValue> {
        let oid = handle.oid().ok_or_else(|| {
            ServiceError::internal(format!("{} has no oid to reference", handle.describe()))
        })?;
        Ok(WireValue::identity(oid, handle.type_name(), handle.version()))
    }

    fn graph_header(handle: &ObjectRef) -> (Option<Oid>, String, Option<Version>) {
        (handle.oid(), handle.type_name().to_string(), handle.version())
    }

    fn for_update(&self, handle: &ObjectRef) -> ServiceResult<WireValue> {
        let ty = self.resolver.type_by_name(handle.type_name())?;
        let mut fields = BTreeMap::new();
        for (member_id, value) in handle.fields() {
            let member = self.resolver.member_by_name(&ty, &member_id)?;
            if member.hidden {
                continue;
            }
            fields.insert(member_id, self.shallow(member, &value)?);
        }
        let (oid, type_name, version) = Self::graph_header(handle);
        Ok(WireValue::Graph {
            oid,
            type_name,
            version,
            fields,
        })
    }

    fn complete(&self, handle: &ObjectRef, emitted: &mut HashSet<usize>) -> ServiceResult<WireValue> {
        if emitted.contains(&object_key(handle)) || handle.resolve_state() == ResolveState::Ghost {
            return self.identity(handle);
        }
        emitted.insert(object_key(handle));

        let ty = self.resolver.type_by_name(handle.type_name())?;
        let mut fields = BTreeMap::new();
        for member in ty.members().iter().filter(|m| !m.hidden) {
            let value = match handle.field(&member.id) {
                Some(value) => value,
                None if handle.is_resolved() => FieldValue::Null,
                None => continue,
            };
            let wire = match &value {
                FieldValue::Reference(target) => self.complete(target, emitted)?,
                FieldValue::Collection(elements) => WireValue::collection(
                    member.type_name.clone(),
                    elements
                        .iter()
                        .map(|e| self.complete(e, emitted))
                        .collect::<ServiceResult<Vec<_>>>()?,
                ),
                other => self.shallow(member, other)?,
            };
            fields.insert(member.id.clone(), wire);
        }
        let (oid, type_name, version) = Self::graph_header(handle);
        Ok(WireValue::Graph {
            oid,
            type_name,
            version,
            fields,
        })
    }

    fn shallow(&self, member: &MemberDescriptor, value: &FieldValue) -> ServiceResult<WireValue> {
        match value {
            FieldValue::Null => Ok(WireValue::Null),
            FieldValue::Scalar(scalar) => self.scalar(&member.type_name, scalar),
            FieldValue::Reference(target) => self.identity(target),
            FieldValue::Collection(elements) => Ok(WireValue::collection(
                member.type_name.clone(),
                elements
                    .iter()
                    .map(|e| self.identity(e))
                    .collect::<ServiceResult<Vec<_>>>()?,
            )),
        }
    }

    fn scalar(&self, type_name: &str, value: &ScalarValue) -> ServiceResult<WireValue> {
        let codec = self.resolver.value_codec(type_name)?;
        Ok(WireValue::encoded(type_name, codec.encode(value)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryObjectStore;
    use crate::metamodel::{TypeDescriptor, TypeRegistry};
    use crate::object::same_object;
    use objsync_protocol::FaultKind;
    use std::sync::Arc;

    fn registry() -> TypeRegistry {
        TypeRegistry::new()
            .with_type(
                TypeDescriptor::new("Person")
                    .with_member(MemberDescriptor::value("name", "string"))
                    .with_member(MemberDescriptor::value("age", "int"))
                    .with_member(MemberDescriptor::value("secret", "string").hidden())
                    .with_member(MemberDescriptor::reference("employer", "Company"))
                    .with_member(MemberDescriptor::collection("friends", "Person")),
            )
            .with_type(TypeDescriptor::new("Company").with_member(MemberDescriptor::value("name", "string")))
    }

    fn text(s: &str) -> FieldValue {
        FieldValue::Scalar(ScalarValue::Text(s.into()))
    }

    fn person(name: &str) -> ObjectRef {
        let handle = ServerObject::new_transient("Person", None);
        handle.set_field("name", text(name));
        handle
    }

    #[test]
    fn identity_decodes_to_one_handle() {
        let store = InMemoryObjectStore::new();
        let registry = registry();
        let codec = GraphCodec::new(&store, &registry);
        let acme = ServerObject::new_transient("Company", None);
        let oid = store.seed(&acme).unwrap();

        let reference = WireValue::identity(oid, "Company", None);
        let graph = WireValue::graph(None, "Person", None)
            .with_field("employer", reference.clone())
            .with_field("friends", WireValue::collection("Person", vec![]));
        let mut known = KnownObjectsTable::new();
        let first = codec.decode_object(&graph, &mut known).unwrap();
        let second = codec.decode_object(&reference, &mut known).unwrap();

        let employer = first.field("employer").unwrap();
        assert!(same_object(employer.as_reference().unwrap(), &second));
        assert_eq!(known.len(), 2);
    }

    #[test]
    fn unknown_oid_is_not_found() {
        let store = InMemoryObjectStore::new();
        let registry = registry();
        let codec = GraphCodec::new(&store, &registry);
        let err = codec
            .decode(
                &WireValue::identity(Oid::Persistent(42), "Person", None),
                &mut KnownObjectsTable::new(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), FaultKind::NotFound);
    }

    #[test]
    fn unknown_type_and_member() {
        let store = InMemoryObjectStore::new();
        let registry = registry();
        let codec = GraphCodec::new(&store, &registry);
        let mut known = KnownObjectsTable::new();

        let err = codec
            .decode(&WireValue::graph(None, "Robot", None), &mut known)
            .unwrap_err();
        assert_eq!(err.kind(), FaultKind::UnknownType);

        let err = codec
            .decode(
                &WireValue::graph(None, "Person", None).with_field("height", WireValue::Null),
                &mut known,
            )
            .unwrap_err();
        assert_eq!(err.kind(), FaultKind::UnknownMember);

        let err = codec
            .decode(&WireValue::encoded("money", "12"), &mut known)
            .unwrap_err();
        assert_eq!(err.kind(), FaultKind::UnknownType);
    }

    #[test]
    fn shape_mismatch_is_protocol_error() {
        let store = InMemoryObjectStore::new();
        let registry = registry();
        let codec = GraphCodec::new(&store, &registry);
        let graph = WireValue::graph(None, "Person", None)
            .with_field("employer", WireValue::encoded("string", "Acme"));
        let err = codec.decode(&graph, &mut KnownObjectsTable::new()).unwrap_err();
        assert_eq!(err.kind(), FaultKind::Protocol);

        let graph = WireValue::graph(None, "Person", None).with_field("age", WireValue::encoded("string", "x"));
        let err = codec.decode(&graph, &mut KnownObjectsTable::new()).unwrap_err();
        assert_eq!(err.kind(), FaultKind::Protocol);
    }

    #[test]
    fn transient_oid_shared_within_exchange() {
        let store = InMemoryObjectStore::new();
        let registry = registry();
        let codec = GraphCodec::new(&store, &registry);
        let mut known = KnownObjectsTable::new();

        let acme = WireValue::graph(Some(Oid::Transient(1)), "Company", None)
            .with_field("name", WireValue::encoded("string", "Acme"));
        let ada = WireValue::graph(None, "Person", None).with_field("employer", acme.clone());
        let bob = WireValue::graph(None, "Person", None).with_field("employer", acme);

        let ada = codec.decode_object(&ada, &mut known).unwrap();
        let bob = codec.decode_object(&bob, &mut known).unwrap();
        let a = ada.field("employer").unwrap();
        let b = bob.field("employer").unwrap();
        assert!(same_object(a.as_reference().unwrap(), b.as_reference().unwrap()));
    }

    #[test]
    fn complete_graph_terminates_on_cycles_and_hides_members() {
        let store = InMemoryObjectStore::new();
        let registry = registry();
        let codec = GraphCodec::new(&store, &registry);

        let ada = person("Ada");
        let bob = person("Bob");
        ada.set_field("secret", text("xyzzy"));
        ada.set_field("friends", FieldValue::Collection(vec![Arc::clone(&bob)]));
        bob.set_field("friends", FieldValue::Collection(vec![Arc::clone(&ada)]));
        store.seed(&ada).unwrap();

        let wire = codec.encode(&ada, EncodeMode::CompleteGraph).unwrap();
        let fields = wire.fields().unwrap();
        assert!(!fields.contains_key("secret"));
        assert_eq!(fields["employer"], WireValue::Null);

        let WireValue::Collection { elements, .. } = &fields["friends"] else {
            panic!("friends should be a collection");
        };
        let bob_fields = elements[0].fields().unwrap();
        let WireValue::Collection { elements: back, .. } = &bob_fields["friends"] else {
            panic!("friends should be a collection");
        };
        assert_eq!(back[0].kind(), "identity");
        assert_eq!(back[0].oid(), ada.oid());
    }

    #[test]
    fn complete_graph_round_trips() {
        let store = InMemoryObjectStore::new();
        let registry = registry();
        let codec = GraphCodec::new(&store, &registry);

        let ada = person("Ada");
        ada.set_field("age", FieldValue::Scalar(ScalarValue::Integer(36)));
        let oid = store.seed(&ada).unwrap();
        let loaded = store.load_by_oid(&oid, "Person").unwrap();
        store.resolve_fully(&loaded).unwrap();

        let wire = codec.encode(&loaded, EncodeMode::CompleteGraph).unwrap();
        let decoded = codec.decode_object(&wire, &mut KnownObjectsTable::new()).unwrap();
        assert_eq!(decoded.oid(), Some(oid));
        assert_eq!(decoded.field("name").unwrap().as_scalar(), Some(&ScalarValue::Text("Ada".into())));
        assert_eq!(decoded.field("age").unwrap().as_scalar(), Some(&ScalarValue::Integer(36)));
        assert!(decoded.field("employer").unwrap().is_null());
    }

    #[test]
    fn ghosts_are_emitted_as_identity() {
        let store = InMemoryObjectStore::new();
        let registry = registry();
        let codec = GraphCodec::new(&store, &registry);
        let oid = store.seed(&person("Ada")).unwrap();
        let version = store.load_by_oid(&oid, "Person").unwrap().version().unwrap();
        let ghost = ServerObject::new_persistent("Person", oid, version);
        assert_eq!(ghost.resolve_state(), ResolveState::Ghost);

        let wire = codec.encode(&ghost, EncodeMode::CompleteGraph).unwrap();
        assert_eq!(wire.kind(), "identity");
    }

    #[test]
    fn for_update_uses_identities() {
        let store = InMemoryObjectStore::new();
        let registry = registry();
        let codec = GraphCodec::new(&store, &registry);
        let ada = person("Ada");
        let acme = ServerObject::new_transient("Company", None);
        ada.set_field("employer", FieldValue::Reference(Arc::clone(&acme)));
        store.seed(&ada).unwrap();

        let wire = codec.encode(&ada, EncodeMode::ForUpdate).unwrap();
        let fields = wire.fields().unwrap();
        assert_eq!(fields["employer"].kind(), "identity");
        assert_eq!(fields["name"], WireValue::encoded("string", "Ada"));
        assert_eq!(wire.version(), ada.version().as_ref());
    }

    #[test]
    fn made_persistent_delta_follows_nested_graphs() {
        let store = InMemoryObjectStore::new();
        let registry = registry();
        let codec = GraphCodec::new(&store, &registry);
        let mut known = KnownObjectsTable::new();

        let original = WireValue::graph(Some(Oid::Transient(1)), "Person", None)
            .with_field("name", WireValue::encoded("string", "Ada"))
            .with_field(
                "employer",
                WireValue::graph(Some(Oid::Transient(2)), "Company", None)
                    .with_field("name", WireValue::encoded("string", "Acme")),
            );
        let decoded = codec.decode(&original, &mut known).unwrap();
        store.seed(decoded.as_reference().unwrap()).unwrap();

        let delta = codec.encode_made_persistent(&original, &decoded).unwrap();
        assert!(delta.oid().unwrap().is_persistent());
        let fields = delta.fields().unwrap();
        assert!(!fields.contains_key("name"));
        assert!(fields["employer"].oid().unwrap().is_persistent());
        assert_eq!(fields["employer"].version().unwrap().sequence, 1);
    }

    #[test]
    fn known_handle_must_keep_its_type() {
        let store = InMemoryObjectStore::new();
        let registry = registry();
        let codec = GraphCodec::new(&store, &registry);
        let oid = store.seed(&person("Ada")).unwrap();
        let mut known = KnownObjectsTable::new();

        codec
            .decode_object(&WireValue::identity(oid, "Person", None), &mut known)
            .unwrap();
        let err = codec
            .decode_object(&WireValue::identity(oid, "Company", None), &mut known)
            .unwrap_err();
        assert_eq!(err.kind(), FaultKind::NotFound);

        let transient = WireValue::graph(Some(Oid::Transient(5)), "Person", None);
        codec.decode_object(&transient, &mut known).unwrap();
        let err = codec
            .decode_object(&WireValue::graph(Some(Oid::Transient(5)), "Company", None), &mut known)
            .unwrap_err();
        assert_eq!(err.kind(), FaultKind::NotFound);
    }

    #[test]
    fn hidden_members_are_not_accepted_from_clients() {
        let store = InMemoryObjectStore::new();
        let registry = registry();
        let codec = GraphCodec::new(&store, &registry);
        let graph = WireValue::graph(None, "Person", None)
            .with_field("secret", WireValue::encoded("string", "leaked"));

        let err = codec
            .decode_object(&graph, &mut KnownObjectsTable::new())
            .unwrap_err();
        assert_eq!(err.kind(), FaultKind::NotModifiable);
    }
}

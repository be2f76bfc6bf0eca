//! Values exchanged over the protocol.

use crate::error::{ProtocolError, ProtocolResult};
use crate::oid::{Oid, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tag names accepted in the `kind` field of an encoded wire value.
const WIRE_KINDS: [&str; 5] = ["null", "identity", "graph", "encoded", "collection"];

/// A value crossing the wire.
///
/// Wire values are immutable and belong to the exchange that carries them.
/// Object references come in two flavours: [`WireValue::Identity`] names an
/// object the other side is expected to know, [`WireValue::Graph`] also
/// carries (part of) its state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireValue {
    /// Absence of a value.
    Null,
    /// Reference to a persistent object by identity only.
    Identity {
        /// Object identifier.
        oid: Oid,
        /// Name of the object's type.
        type_name: String,
        /// Version the sender last saw, if any.
        version: Option<Version>,
    },
    /// Reference plus partial or full field data.
    Graph {
        /// Identifier; absent for objects that were never persisted.
        oid: Option<Oid>,
        /// Name of the object's type.
        type_name: String,
        /// Version the sender last saw, if any.
        version: Option<Version>,
        /// Member id to value.
        fields: BTreeMap<String, WireValue>,
    },
    /// Immutable value type serialized by a type-specific codec.
    Encoded {
        /// Name of the value type.
        type_name: String,
        /// Codec output.
        payload: String,
    },
    /// Contents of a one-to-many member or a multi-object result.
    Collection {
        /// Name of the element type.
        element_type: String,
        /// Element references.
        elements: Vec<WireValue>,
    },
}

impl WireValue {
    /// Creates an identity reference.
    pub fn identity(oid: Oid, type_name: impl Into<String>, version: Option<Version>) -> Self {
        WireValue::Identity {
            oid,
            type_name: type_name.into(),
            version,
        }
    }

    /// Creates a graph value with no fields.
    pub fn graph(oid: Option<Oid>, type_name: impl Into<String>, version: Option<Version>) -> Self {
        WireValue::Graph {
            oid,
            type_name: type_name.into(),
            version,
            fields: BTreeMap::new(),
        }
    }

    /// Creates an encoded value.
    pub fn encoded(type_name: impl Into<String>, payload: impl Into<String>) -> Self {
        WireValue::Encoded {
            type_name: type_name.into(),
            payload: payload.into(),
        }
    }

    /// Creates a collection value.
    pub fn collection(element_type: impl Into<String>, elements: Vec<WireValue>) -> Self {
        WireValue::Collection {
            element_type: element_type.into(),
            elements,
        }
    }

    /// Adds a field to a graph value. Other variants are returned unchanged.
    #[must_use]
    pub fn with_field(mut self, member_id: impl Into<String>, value: WireValue) -> Self {
        if let WireValue::Graph { fields, .. } = &mut self {
            fields.insert(member_id.into(), value);
        }
        self
    }

    /// Returns the tag name used on the wire.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            WireValue::Null => "null",
            WireValue::Identity { .. } => "identity",
            WireValue::Graph { .. } => "graph",
            WireValue::Encoded { .. } => "encoded",
            WireValue::Collection { .. } => "collection",
        }
    }

    /// Returns true for [`WireValue::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, WireValue::Null)
    }

    /// Returns the type name carried by this value.
    #[must_use]
    pub fn type_name(&self) -> Option<&str> {
        match self {
            WireValue::Null => None,
            WireValue::Identity { type_name, .. }
            | WireValue::Graph { type_name, .. }
            | WireValue::Encoded { type_name, .. } => Some(type_name),
            WireValue::Collection { element_type, .. } => Some(element_type),
        }
    }

    /// Returns the oid of an object reference.
    #[must_use]
    pub fn oid(&self) -> Option<Oid> {
        match self {
            WireValue::Identity { oid, .. } => Some(*oid),
            WireValue::Graph { oid, .. } => *oid,
            _ => None,
        }
    }

    /// Returns the version of an object reference.
    #[must_use]
    pub fn version(&self) -> Option<&Version> {
        match self {
            WireValue::Identity { version, .. } | WireValue::Graph { version, .. } => {
                version.as_ref()
            }
            _ => None,
        }
    }

    /// Returns the fields of a graph value.
    #[must_use]
    pub fn fields(&self) -> Option<&BTreeMap<String, WireValue>> {
        match self {
            WireValue::Graph { fields, .. } => Some(fields),
            _ => None,
        }
    }

    /// Encodes to CBOR bytes.
    pub fn to_cbor(&self) -> ProtocolResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|e| ProtocolError::encoding_failed(e.to_string()))?;
        Ok(bytes)
    }

    /// Decodes from CBOR bytes.
    ///
    /// Tags are checked before the value is materialized so that a value
    /// written by a newer peer fails with [`ProtocolError::UnknownWireType`]
    /// instead of a generic decoding error.
    pub fn from_cbor(bytes: &[u8]) -> ProtocolResult<Self> {
        let raw: ciborium::Value = ciborium::de::from_reader(bytes)
            .map_err(|e| ProtocolError::decoding_failed(e.to_string()))?;
        check_wire_kinds(&raw)?;
        raw.deserialized()
            .map_err(|e| ProtocolError::decoding_failed(e.to_string()))
    }
}

pub(crate) fn map_field<'a>(map: &'a [(ciborium::Value, ciborium::Value)], name: &str) -> Option<&'a ciborium::Value> {
    map.iter()
        .find(|(k, _)| k.as_text() == Some(name))
        .map(|(_, v)| v)
}

/// Walks a raw CBOR value shaped like a [`WireValue`] and rejects unknown tags.
pub(crate) fn check_wire_kinds(raw: &ciborium::Value) -> ProtocolResult<()> {
    let map = raw
        .as_map()
        .ok_or_else(|| ProtocolError::invalid_structure("expected map for wire value"))?;
    let kind = map_field(map, "kind")
        .and_then(|v| v.as_text())
        .ok_or_else(|| ProtocolError::invalid_structure("missing kind"))?;
    if !WIRE_KINDS.contains(&kind) {
        return Err(ProtocolError::UnknownWireType(kind.to_string()));
    }

    match kind {
        "graph" => {
            if let Some(fields) = map_field(map, "fields").and_then(|v| v.as_map()) {
                for (_, value) in fields {
                    check_wire_kinds(value)?;
                }
            }
        }
        "collection" => {
            if let Some(elements) = map_field(map, "elements").and_then(|v| v.as_array()) {
                for element in elements {
                    check_wire_kinds(element)?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_graph() -> WireValue {
        WireValue::graph(Some(Oid::Persistent(1)), "Person", Some(Version::new(1, "alice", 10)))
            .with_field("name", WireValue::encoded("string", "Ada"))
            .with_field(
                "employer",
                WireValue::identity(Oid::Persistent(2), "Company", None),
            )
            .with_field(
                "friends",
                WireValue::collection(
                    "Person",
                    vec![WireValue::graph(Some(Oid::Transient(7)), "Person", None)],
                ),
            )
    }

    #[test]
    fn graph_cbor_roundtrip() {
        let value = sample_graph();
        let bytes = value.to_cbor().unwrap();
        assert_eq!(WireValue::from_cbor(&bytes).unwrap(), value);
    }

    #[test]
    fn null_roundtrip() {
        let bytes = WireValue::Null.to_cbor().unwrap();
        assert_eq!(WireValue::from_cbor(&bytes).unwrap(), WireValue::Null);
    }

    #[test]
    fn unknown_top_level_kind() {
        let raw = ciborium::Value::Map(vec![(
            ciborium::Value::Text("kind".into()),
            ciborium::Value::Text("blob".into()),
        )]);
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&raw, &mut bytes).unwrap();

        let err = WireValue::from_cbor(&bytes).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownWireType("blob".into()));
    }

    #[test]
    fn unknown_nested_kind() {
        let nested = ciborium::Value::Map(vec![(
            ciborium::Value::Text("kind".into()),
            ciborium::Value::Text("stream".into()),
        )]);
        let raw = ciborium::Value::Map(vec![
            (
                ciborium::Value::Text("kind".into()),
                ciborium::Value::Text("collection".into()),
            ),
            (
                ciborium::Value::Text("element_type".into()),
                ciborium::Value::Text("Person".into()),
            ),
            (
                ciborium::Value::Text("elements".into()),
                ciborium::Value::Array(vec![nested]),
            ),
        ]);
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&raw, &mut bytes).unwrap();

        let err = WireValue::from_cbor(&bytes).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownWireType("stream".into()));
    }

    #[test]
    fn accessors() {
        let value = sample_graph();
        assert_eq!(value.kind(), "graph");
        assert_eq!(value.type_name(), Some("Person"));
        assert_eq!(value.oid(), Some(Oid::Persistent(1)));
        assert_eq!(value.version().map(|v| v.sequence), Some(1));
        assert_eq!(value.fields().map(|f| f.len()), Some(3));
        assert!(WireValue::Null.type_name().is_none());
    }

    #[test]
    fn with_field_ignores_non_graph() {
        let value = WireValue::encoded("int", "1").with_field("x", WireValue::Null);
        assert_eq!(value, WireValue::encoded("int", "1"));
    }
}

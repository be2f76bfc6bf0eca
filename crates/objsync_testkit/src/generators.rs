//! Property-based test generators using proptest.
//!
//! Strategies produce structurally valid wire values: identities always carry
//! an oid and graphs only nest further wire values, so every generated value
//! survives a CBOR round trip.

use objsync_protocol::{ClientActionOp, Oid, Version, WireValue};
use proptest::prelude::*;

/// Strategy for oids of either state.
pub fn oid_strategy() -> impl Strategy<Value = Oid> {
    prop_oneof![
        any::<u64>().prop_map(Oid::Persistent),
        any::<u64>().prop_map(Oid::Transient),
    ]
}

/// Strategy for version stamps.
pub fn version_strategy() -> impl Strategy<Value = Version> {
    (any::<u64>(), user_strategy(), any::<u64>())
        .prop_map(|(sequence, user, timestamp)| Version::new(sequence, user, timestamp))
}

/// Strategy for user names.
pub fn user_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex")
}

/// Strategy for type names.
pub fn type_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-zA-Z]{0,11}").expect("Invalid regex")
}

/// Strategy for member ids.
pub fn member_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-zA-Z0-9_]{0,11}").expect("Invalid regex")
}

/// Strategy for leaf wire values.
pub fn leaf_wire_value_strategy() -> impl Strategy<Value = WireValue> {
    prop_oneof![
        Just(WireValue::Null),
        (oid_strategy(), type_name_strategy(), prop::option::of(version_strategy()))
            .prop_map(|(oid, type_name, version)| WireValue::identity(oid, type_name, version)),
        (type_name_strategy(), any::<String>())
            .prop_map(|(type_name, payload)| WireValue::encoded(type_name, payload)),
    ]
}

/// Strategy for arbitrary, possibly nested, wire values.
pub fn wire_value_strategy() -> impl Strategy<Value = WireValue> {
    leaf_wire_value_strategy().prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            (
                prop::option::of(oid_strategy()),
                type_name_strategy(),
                prop::option::of(version_strategy()),
                prop::collection::btree_map(member_id_strategy(), inner.clone(), 0..4),
            )
                .prop_map(|(oid, type_name, version, fields)| WireValue::Graph {
                    oid,
                    type_name,
                    version,
                    fields,
                }),
            (type_name_strategy(), prop::collection::vec(inner, 0..4))
                .prop_map(|(element_type, elements)| WireValue::collection(element_type, elements)),
        ]
    })
}

/// Strategy for client batch elements.
pub fn client_op_strategy() -> impl Strategy<Value = ClientActionOp> {
    prop_oneof![
        wire_value_strategy().prop_map(ClientActionOp::add),
        wire_value_strategy().prop_map(ClientActionOp::change),
        wire_value_strategy().prop_map(ClientActionOp::delete),
    ]
}

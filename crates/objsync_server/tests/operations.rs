//! Integration tests for queries, single-member mutations and sessions.

use objsync_protocol::{FaultKind, Oid, QueryDescriptor, Version, WireValue};
use objsync_server::{
    same_object, FieldValue, GraphCodec, KnownObjectsTable, ObjectStore, RuleBasedAuthorization,
    ScalarValue, ServerObject, ServiceConfig, VersionGuard,
};
use objsync_testkit::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

fn collection_oids(value: &WireValue) -> Vec<Oid> {
    match value {
        WireValue::Collection { elements, .. } => elements.iter().filter_map(WireValue::oid).collect(),
        other => panic!("expected a collection, got {other:?}"),
    }
}

// ============================================================================
// Optimistic locking
// ============================================================================

#[test]
fn set_value_then_repeat_with_stale_version() {
    let env = TestEnvironment::new();
    let ada = env.seed_person("Ada", 36);

    let updates = env
        .service
        .set_value(&env.session, "age", &ada, &int(42))
        .unwrap();
    assert_eq!(updates.changed_oids(), vec![ada.oid().unwrap()]);
    assert!(updates.disposed.is_empty());

    let changed = &updates.changed[0];
    assert!(changed.version().unwrap().differs(ada.version().unwrap()));
    assert_eq!(changed.version().unwrap().user, ALICE);
    assert_eq!(changed.fields().unwrap()["age"], int(42));
    assert_eq!(env.stored_int(&ada, "age"), Some(42));

    let err = env
        .service
        .set_value(&env.session, "age", &ada, &int(43))
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::ConcurrencyConflict);
    assert!(err.is_retryable());
    assert_eq!(env.stored_int(&ada, "age"), Some(42));
}

#[test]
fn version_guard_accepts_only_current_version() {
    let env = TestEnvironment::new();
    let ada = env.seed_person("Ada", 36);
    let handle = env.load(&ada);
    let guard = VersionGuard::new(&*env.store);
    let current = ada.version().unwrap().clone();

    assert!(guard.check_lock(&handle, &current).is_ok());

    let other_user = Version::new(current.sequence, "mallory", current.timestamp);
    let err = guard.check_lock(&handle, &other_user).unwrap_err();
    assert_eq!(err.kind(), FaultKind::ConcurrencyConflict);

    let err = guard.check_claimed(&handle, None).unwrap_err();
    assert_eq!(err.kind(), FaultKind::Protocol);
}

#[test]
fn mutation_without_claimed_version_is_rejected() {
    let env = TestEnvironment::new();
    let ada = env.seed_person("Ada", 36);
    let unversioned = WireValue::identity(ada.oid().unwrap(), "Person", None);

    let err = env
        .service
        .set_value(&env.session, "age", &unversioned, &int(1))
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::Protocol);
    assert_eq!(env.stored_int(&ada, "age"), Some(36));
}

// ============================================================================
// Guard sequence
// ============================================================================

#[test]
fn unusable_member_is_not_modifiable() {
    let env = TestEnvironment::with_authorization(
        RuleBasedAuthorization::new().disable("Person", "employer"),
    );
    let ada = env.seed_person("Ada", 36);
    let acme = env.seed_company("Acme");

    let err = env
        .service
        .set_association(&env.session, "employer", &ada, &acme)
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::NotModifiable);
    assert!(err.is_abort());

    let stored = env.load(&ada);
    assert!(stored.field("employer").is_none());
    assert_eq!(
        env.store.current_version(&stored).unwrap(),
        *ada.version().unwrap()
    );
}

#[test]
fn user_specific_veto() {
    let env = TestEnvironment::with_authorization(
        RuleBasedAuthorization::new().disable_for(BOB, "Person", "age"),
    );
    let ada = env.seed_person("Ada", 36);
    let bob = env.login(BOB, BOB_CREDENTIAL);

    let err = env.service.set_value(&bob, "age", &ada, &int(1)).unwrap_err();
    assert_eq!(err.kind(), FaultKind::NotModifiable);
    assert!(env.service.set_value(&env.session, "age", &ada, &int(1)).is_ok());
}

#[test]
fn operation_must_match_member_kind() {
    let env = TestEnvironment::new();
    let ada = env.seed_person("Ada", 36);
    let acme = env.seed_company("Acme");

    let err = env
        .service
        .set_value(&env.session, "employer", &ada, &acme)
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::Protocol);

    let err = env
        .service
        .add_to_collection(&env.session, "age", &ada, &acme)
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::Protocol);

    let err = env
        .service
        .set_value(&env.session, "height", &ada, &int(180))
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::UnknownMember);
}

#[test]
fn mutation_target_must_be_persistent() {
    let env = TestEnvironment::new();
    let err = env
        .service
        .set_value(&env.session, "age", &person_graph("Zoe", 1), &int(2))
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::Protocol);
}

#[test]
fn hidden_member_cannot_be_written() {
    let env = TestEnvironment::new();
    let ada = ServerObject::new_transient("Person", None);
    ada.set_field("name", FieldValue::Scalar(ScalarValue::Text("Ada".into())));
    ada.set_field("notes", FieldValue::Scalar(ScalarValue::Text("private".into())));
    let ada = env.seed(&ada);

    let err = env
        .service
        .set_value(&env.session, "notes", &ada, &text("overwritten"))
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::NotModifiable);
    assert!(err.is_abort());

    let err = env
        .service
        .clear_value(&env.session, "notes", &ada)
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::NotModifiable);

    let notes = env.load(&ada).field("notes").unwrap();
    assert_eq!(notes.as_scalar(), Some(&ScalarValue::Text("private".into())));
    assert!(!env.service.authorize_visibility(&env.session, "notes", &ada).unwrap());
    assert!(!env.service.authorize_usability(&env.session, "notes", &ada).unwrap());
}

// ============================================================================
// Associations, values and collections
// ============================================================================

#[test]
fn set_and_clear_association() {
    let env = TestEnvironment::new();
    let ada = env.seed_person("Ada", 36);
    let acme = env.seed_company("Acme");
    let globex = env.seed_company("Globex");

    let updates = env
        .service
        .set_association(&env.session, "employer", &ada, &acme)
        .unwrap();
    let ada_v2 = updates.changed[0].clone();
    assert_eq!(ada_v2.fields().unwrap()["employer"].oid(), acme.oid());

    let err = env
        .service
        .clear_association(&env.session, "employer", &ada_v2, &globex)
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::Protocol);

    env.service
        .clear_association(&env.session, "employer", &ada_v2, &acme)
        .unwrap();
    assert!(env.load(&ada).field("employer").unwrap().is_null());
}

#[test]
fn set_association_persists_new_associate() {
    let env = TestEnvironment::new();
    let ada = env.seed_person("Ada", 36);
    let initech = WireValue::graph(None, "Company", None).with_field("name", text("Initech"));

    assert!(!env.store.has_instances("Company").unwrap());
    let updates = env
        .service
        .set_association(&env.session, "employer", &ada, &initech)
        .unwrap();

    assert_eq!(updates.changed.len(), 2);
    assert!(env.store.has_instances("Company").unwrap());
    let employer = env.load(&ada).field("employer").unwrap();
    assert!(employer.as_reference().unwrap().is_persistent());
}

#[test]
fn clear_value() {
    let env = TestEnvironment::new();
    let ada = env.seed_person("Ada", 36);

    let updates = env.service.clear_value(&env.session, "age", &ada).unwrap();
    assert_eq!(updates.changed[0].fields().unwrap()["age"], WireValue::Null);
    assert_eq!(env.stored_int(&ada, "age"), None);
}

#[test]
fn add_and_remove_collection_elements() {
    let env = TestEnvironment::new();
    let ada = env.seed_person("Ada", 36);
    let bob = env.seed_person("Bob", 40);

    let updates = env
        .service
        .add_to_collection(&env.session, "friends", &ada, &bob)
        .unwrap();
    let ada_v2 = updates.changed[0].clone();
    assert_eq!(
        collection_oids(&ada_v2.fields().unwrap()["friends"]),
        vec![bob.oid().unwrap()]
    );

    let updates = env
        .service
        .add_to_collection(&env.session, "friends", &ada_v2, &bob)
        .unwrap();
    assert!(updates.is_empty());

    let friends = env.service.resolve_field(&env.session, &ada, "friends").unwrap();
    assert_eq!(collection_oids(&friends), vec![bob.oid().unwrap()]);

    env.service
        .remove_from_collection(&env.session, "friends", &ada_v2, &bob)
        .unwrap();
    let friends = env.service.resolve_field(&env.session, &ada, "friends").unwrap();
    assert!(collection_oids(&friends).is_empty());
}

// ============================================================================
// Reads
// ============================================================================

#[test]
fn get_object() {
    let env = TestEnvironment::new();
    let ada = env.seed_person("Ada", 36);
    let oid = ada.oid().unwrap();

    let wire = env.service.get_object(&env.session, &oid, "Person").unwrap();
    assert_eq!(wire.oid(), Some(oid));
    assert_eq!(wire.version(), ada.version());
    assert_eq!(wire.fields().unwrap()["name"], text("Ada"));

    let err = env
        .service
        .get_object(&env.session, &Oid::Persistent(999), "Person")
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::NotFound);

    let err = env.service.get_object(&env.session, &oid, "Robot").unwrap_err();
    assert_eq!(err.kind(), FaultKind::UnknownType);
}

#[test]
fn resolve_immediately_returns_visible_graph() {
    let env = TestEnvironment::new();
    let ada = ServerObject::new_transient("Person", None);
    let bob = ServerObject::new_transient("Person", None);
    ada.set_field("name", FieldValue::Scalar(ScalarValue::Text("Ada".into())));
    ada.set_field("notes", FieldValue::Scalar(ScalarValue::Text("private".into())));
    ada.set_field("friends", FieldValue::Collection(vec![Arc::clone(&bob)]));
    let ada = env.seed(&ada);

    let wire = env.service.resolve_immediately(&env.session, &ada).unwrap();
    let fields = wire.fields().unwrap();
    assert!(!fields.contains_key("notes"));
    assert_eq!(fields["name"], text("Ada"));
    assert_eq!(collection_oids(&fields["friends"]), vec![bob.oid().unwrap()]);
    match &fields["friends"] {
        WireValue::Collection { elements, .. } => assert_eq!(elements[0].kind(), "identity"),
        other => panic!("expected a collection, got {other:?}"),
    }

    let err = env
        .service
        .resolve_field(&env.session, &ada, "height")
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::UnknownMember);
}

#[test]
fn find_and_has_instances() {
    let env = TestEnvironment::new();
    assert!(!env.service.has_instances(&env.session, "Person").unwrap());
    env.seed_person("Ada", 36);
    env.seed_person("Bob", 40);
    assert!(env.service.has_instances(&env.session, "Person").unwrap());

    let err = env.service.has_instances(&env.session, "Robot").unwrap_err();
    assert_eq!(err.kind(), FaultKind::UnknownType);

    let all = env
        .service
        .find_instances(&env.session, &QueryDescriptor::all("Person"))
        .unwrap();
    assert_eq!(all.len(), 2);

    let mut pattern = BTreeMap::new();
    pattern.insert("age".to_string(), int(40));
    let forty = env
        .service
        .find_instances(&env.session, &QueryDescriptor::pattern("Person", pattern))
        .unwrap();
    assert_eq!(forty.len(), 1);
    assert_eq!(forty[0].fields().unwrap()["name"], text("Bob"));

    let mut pattern = BTreeMap::new();
    pattern.insert("height".to_string(), int(180));
    let err = env
        .service
        .find_instances(&env.session, &QueryDescriptor::pattern("Person", pattern))
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::UnknownMember);
}

#[test]
fn find_by_association() {
    let env = TestEnvironment::new();
    let ada = env.seed_person("Ada", 36);
    env.seed_person("Bob", 40);
    let acme = env.seed_company("Acme");
    env.service
        .set_association(&env.session, "employer", &ada, &acme)
        .unwrap();

    let mut pattern = BTreeMap::new();
    pattern.insert("employer".to_string(), acme.clone());
    let staff = env
        .service
        .find_instances(&env.session, &QueryDescriptor::pattern("Person", pattern))
        .unwrap();
    assert_eq!(staff.len(), 1);
    assert_eq!(staff[0].oid(), ada.oid());
}

#[test]
fn oid_for_service() {
    let env = TestEnvironment::new();
    let people = env.people_service();
    assert_eq!(people.kind(), "identity");
    assert!(people.oid().unwrap().is_persistent());

    let err = env.service.oid_for_service(&env.session, "robots").unwrap_err();
    assert_eq!(err.kind(), FaultKind::NotFound);
}

#[test]
fn authorization_queries() {
    let env = TestEnvironment::with_authorization(
        RuleBasedAuthorization::new()
            .hide("Person", "notes")
            .disable("Person", "age"),
    );
    let ada = env.seed_person("Ada", 36);
    let service = &env.service;

    assert!(!service.authorize_visibility(&env.session, "notes", &ada).unwrap());
    assert!(service.authorize_visibility(&env.session, "Person#age", &ada).unwrap());
    assert!(!service.authorize_usability(&env.session, "age", &ada).unwrap());
    assert!(service.authorize_usability(&env.session, "birthday", &ada).unwrap());

    let err = service
        .authorize_visibility(&env.session, "height", &ada)
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::UnknownMember);
}

#[test]
fn properties_come_from_config() {
    let env = TestEnvironment::with_config(ServiceConfig::default().with_property("locale", "en-GB"));
    let properties = env.service.get_properties(&env.session).unwrap();
    assert_eq!(properties["locale"], "en-GB");
    assert_eq!(properties["batch.max_operations"], "100");
}

#[test]
fn reads_ignore_fields_sent_with_persistent_targets() {
    let env = TestEnvironment::new();
    let ada = env.seed_person("Ada", 36);
    let claimed = WireValue::graph(ada.oid(), "Person", ada.version().cloned())
        .with_field("age", int(99));

    let wire = env.service.resolve_immediately(&env.session, &claimed).unwrap();
    assert_eq!(wire.fields().unwrap()["age"], int(36));

    let age = env.service.resolve_field(&env.session, &claimed, "age").unwrap();
    assert_eq!(age, int(36));
    assert_eq!(env.stored_int(&ada, "age"), Some(36));
}

// ============================================================================
// Graph codec properties
// ============================================================================

#[test]
fn complete_graph_round_trips() {
    let env = TestEnvironment::new();
    let ada = env.seed_person("Ada", 36);
    let acme = env.seed_company("Acme");
    env.service
        .set_association(&env.session, "employer", &ada, &acme)
        .unwrap();

    let wire = env.service.resolve_immediately(&env.session, &ada).unwrap();
    let registry = people_registry();
    let codec = GraphCodec::new(&*env.store, &registry);
    let decoded = codec
        .decode_object(&wire, &mut KnownObjectsTable::new())
        .unwrap();
    let original = env.load(&ada);

    assert_eq!(decoded.oid(), original.oid());
    assert_eq!(decoded.type_name(), original.type_name());
    for member in ["name", "age"] {
        assert_eq!(
            decoded.field(member).unwrap().as_scalar(),
            original.field(member).unwrap().as_scalar()
        );
    }
    let employer = decoded.field("employer").unwrap();
    assert_eq!(employer.as_reference().unwrap().oid(), acme.oid());
}

#[test]
fn shared_references_decode_to_one_handle() {
    let env = TestEnvironment::new();
    let acme = env.seed_company("Acme");
    let graph = WireValue::graph(None, "Person", None)
        .with_field("employer", acme.clone())
        .with_field(
            "friends",
            WireValue::collection(
                "Person",
                vec![WireValue::graph(None, "Person", None).with_field("employer", acme)],
            ),
        );

    let registry = people_registry();
    let codec = GraphCodec::new(&*env.store, &registry);
    let root = codec
        .decode_object(&graph, &mut KnownObjectsTable::new())
        .unwrap();

    let employer = root.field("employer").unwrap();
    let friends = root.field("friends").unwrap();
    let friend_employer = friends.as_collection().unwrap()[0].field("employer").unwrap();
    assert!(same_object(
        employer.as_reference().unwrap(),
        friend_employer.as_reference().unwrap()
    ));
}

// ============================================================================
// Sessions and lifecycle
// ============================================================================

#[test]
fn closed_and_forged_sessions_are_rejected() {
    let env = TestEnvironment::new();
    let bob = env.login(BOB, BOB_CREDENTIAL);
    assert!(env.service.has_instances(&bob, "Person").is_ok());

    let mut forged = bob.clone();
    forged.user = ALICE.into();
    let err = env.service.has_instances(&forged, "Person").unwrap_err();
    assert_eq!(err.kind(), FaultKind::AuthFailed);

    env.service.close_session(&bob).unwrap();
    let err = env.service.has_instances(&bob, "Person").unwrap_err();
    assert_eq!(err.kind(), FaultKind::AuthFailed);
    assert!(env.service.has_instances(&env.session, "Person").is_ok());
}

#[test]
fn operations_fail_after_shutdown() {
    let env = TestEnvironment::new();
    env.service.shutdown().unwrap();

    let err = env.service.has_instances(&env.session, "Person").unwrap_err();
    assert_eq!(err.kind(), FaultKind::Protocol);
    assert!(env.service.open_session(ALICE, ALICE_CREDENTIAL).is_err());
    assert!(env.service.init().is_err());
}

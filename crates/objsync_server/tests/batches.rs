//! Integration tests for client action batches.

use objsync_protocol::{ClientActionOp, FaultKind, QueryDescriptor, WireValue};
use objsync_server::{ObjectStore, ServiceConfig};
use objsync_testkit::prelude::*;
use std::collections::BTreeMap;

fn people_named(env: &TestEnvironment, name: &str) -> usize {
    let mut pattern = BTreeMap::new();
    pattern.insert("name".to_string(), text(name));
    env.service
        .find_instances(&env.session, &QueryDescriptor::pattern("Person", pattern))
        .unwrap()
        .len()
}

#[test]
fn add_persists_new_objects() {
    let env = TestEnvironment::new();
    let result = env
        .service
        .execute_client_action(&env.session, &[ClientActionOp::add(person_graph("Zoe", 7))])
        .unwrap();

    assert_eq!(result.results.len(), 1);
    let added = &result.results[0];
    assert_eq!(added.kind(), "graph");
    assert!(added.oid().unwrap().is_persistent());
    assert_eq!(added.version().unwrap().sequence, 1);
    assert_eq!(result.updates.changed_oids(), vec![added.oid().unwrap()]);
    assert_eq!(env.stored_int(added, "age"), Some(7));
}

#[test]
fn same_transient_object_is_persisted_once() {
    let env = TestEnvironment::new();
    let before = env.store.stats().objects_persisted;

    let ops = [
        ClientActionOp::add(transient_person(1, "Ada")),
        ClientActionOp::add(transient_person(1, "Ada")),
    ];
    let result = env.service.execute_client_action(&env.session, &ops).unwrap();

    let first = result.results[0].oid().unwrap();
    let second = result.results[1].oid().unwrap();
    assert!(first.is_persistent());
    assert_eq!(first, second);
    assert_eq!(env.store.stats().objects_persisted, before + 1);
    assert_eq!(people_named(&env, "Ada"), 1);
}

#[test]
fn nested_transient_reference_resolves_to_one_oid() {
    let env = TestEnvironment::new();
    let acme = WireValue::graph(Some(objsync_protocol::Oid::Transient(9)), "Company", None)
        .with_field("name", text("Acme"));
    let ops = [
        ClientActionOp::add(person_graph("Ada", 36).with_field("employer", acme.clone())),
        ClientActionOp::add(person_graph("Bob", 40).with_field("employer", acme)),
    ];
    let result = env.service.execute_client_action(&env.session, &ops).unwrap();

    let ada_employer = result.results[0].fields().unwrap()["employer"].oid().unwrap();
    let bob_employer = result.results[1].fields().unwrap()["employer"].oid().unwrap();
    assert!(ada_employer.is_persistent());
    assert_eq!(ada_employer, bob_employer);
    assert!(!result.results[0].fields().unwrap().contains_key("name"));
}

#[test]
fn change_and_delete() {
    let env = TestEnvironment::new();
    let ada = env.seed_person("Ada", 36);
    let bob = env.seed_person("Bob", 40);

    let change = WireValue::graph(ada.oid(), "Person", ada.version().cloned())
        .with_field("age", int(37));
    let ops = [ClientActionOp::change(change), ClientActionOp::delete(bob.clone())];
    let result = env.service.execute_client_action(&env.session, &ops).unwrap();

    let changed = &result.results[0];
    assert_eq!(changed.kind(), "identity");
    assert_eq!(changed.version().unwrap().sequence, 2);
    assert_eq!(result.results[1], WireValue::Null);

    assert_eq!(result.updates.changed_oids(), vec![ada.oid().unwrap()]);
    assert_eq!(result.updates.disposed, vec![bob.clone()]);
    assert_eq!(env.stored_int(&ada, "age"), Some(37));
    assert!(!env.store.contains(&bob.oid().unwrap()));
}

#[test]
fn conflicting_element_aborts_whole_batch() {
    let env = TestEnvironment::new();
    let ada = env.seed_person("Ada", 36);
    let bob = env.seed_person("Bob", 40);
    env.service
        .set_value(&env.session, "age", &ada, &int(37))
        .unwrap();
    let commits = env.store.stats().commits;

    let stale_change = WireValue::graph(ada.oid(), "Person", ada.version().cloned())
        .with_field("age", int(99));
    let ops = [
        ClientActionOp::add(person_graph("Carol", 20)),
        ClientActionOp::change(stale_change),
        ClientActionOp::delete(bob.clone()),
    ];
    let err = env
        .service
        .execute_client_action(&env.session, &ops)
        .unwrap_err();

    assert_eq!(err.kind(), FaultKind::ConcurrencyConflict);
    assert!(err.is_abort());
    assert_eq!(people_named(&env, "Carol"), 0);
    assert_eq!(env.stored_int(&ada, "age"), Some(37));
    assert!(env.store.contains(&bob.oid().unwrap()));
    assert_eq!(env.store.stats().commits, commits);
}

#[test]
fn failure_kind_passes_through_abort() {
    let env = TestEnvironment::new();
    let ops = [
        ClientActionOp::add(person_graph("Carol", 20)),
        ClientActionOp::add(WireValue::graph(None, "Robot", None)),
    ];
    let err = env
        .service
        .execute_client_action(&env.session, &ops)
        .unwrap_err();

    assert_eq!(err.kind(), FaultKind::UnknownType);
    assert!(err.to_fault().aborted);
    assert_eq!(people_named(&env, "Carol"), 0);
}

#[test]
fn hidden_member_in_client_graph_aborts_batch() {
    let env = TestEnvironment::new();
    let ada = env.seed_person("Ada", 36);

    let added = person_graph("Zoe", 7).with_field("notes", text("planted"));
    let err = env
        .service
        .execute_client_action(&env.session, &[ClientActionOp::add(added)])
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::NotModifiable);
    assert_eq!(people_named(&env, "Zoe"), 0);

    let change = WireValue::graph(ada.oid(), "Person", ada.version().cloned())
        .with_field("notes", text("planted"));
    let err = env
        .service
        .execute_client_action(&env.session, &[ClientActionOp::change(change)])
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::NotModifiable);
    assert!(env.load(&ada).field("notes").is_none());
}

#[test]
fn change_requires_claimed_version() {
    let env = TestEnvironment::new();
    let ada = env.seed_person("Ada", 36);
    let unversioned = WireValue::graph(ada.oid(), "Person", None).with_field("age", int(1));

    let err = env
        .service
        .execute_client_action(&env.session, &[ClientActionOp::change(unversioned)])
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::Protocol);
    assert_eq!(env.stored_int(&ada, "age"), Some(36));
}

#[test]
fn add_must_carry_an_object() {
    let env = TestEnvironment::new();
    let err = env
        .service
        .execute_client_action(&env.session, &[ClientActionOp::add(int(3))])
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::Protocol);
}

#[test]
fn oversized_batch_is_rejected() {
    let env = TestEnvironment::with_config(ServiceConfig::default().with_max_batch_operations(2));
    let ops = vec![ClientActionOp::add(person_graph("Zoe", 1)); 3];

    let err = env
        .service
        .execute_client_action(&env.session, &ops)
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::Protocol);
    assert!(!err.is_abort());
    assert!(!env.store.has_instances("Person").unwrap());
}

#[test]
fn empty_batch_commits_nothing() {
    let env = TestEnvironment::new();
    let result = env.service.execute_client_action(&env.session, &[]).unwrap();
    assert!(result.results.is_empty());
    assert!(result.updates.is_empty());
}

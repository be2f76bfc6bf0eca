//! Fixture domain model and service helpers.
//!
//! The domain is deliberately small:
//!
//! - `Person { name: string, age: int, notes: string (hidden), employer: Company, friends: [Person] }`
//! - `Company { name: string }`
//! - `PersonRepository`, registered as the `people` service
//!
//! Actions cover the interesting paths of `executeServerAction`: creating and
//! persisting new objects, changing the target, reporting messages and
//! warnings, persisting transient parameters, and failing after a change.

use objsync_protocol::{ActionKind, Oid, Session, WireValue};
use objsync_server::{
    ActionContext, ActionDescriptor, AuthorizationChecker, FieldValue, InMemoryObjectStore,
    MemberDescriptor, ObjectRef, ObjectStore, ProtocolService, RequestHandler, ScalarValue,
    ServerObject, ServiceConfig, ServiceError, ServiceResult, StaticAuthenticator, TypeDescriptor,
    TypeRegistry,
};
use std::sync::Arc;

/// User opened by default in a [`TestEnvironment`].
pub const ALICE: &str = "alice";
/// Alice's credential.
pub const ALICE_CREDENTIAL: &str = "alice-pw";
/// A second user.
pub const BOB: &str = "bob";
/// Bob's credential.
pub const BOB_CREDENTIAL: &str = "bob-pw";
/// Logical name of the repository service.
pub const PEOPLE_SERVICE: &str = "people";

/// Wire value of an `int`.
pub fn int(value: i64) -> WireValue {
    WireValue::encoded("int", value.to_string())
}

/// Wire value of a `string`.
pub fn text(value: &str) -> WireValue {
    WireValue::encoded("string", value)
}

/// A new person as a client would send it, without an oid.
pub fn person_graph(name: &str, age: i64) -> WireValue {
    WireValue::graph(None, "Person", None)
        .with_field("name", text(name))
        .with_field("age", int(age))
}

/// A new person carrying a client-side transient oid.
pub fn transient_person(serial: u64, name: &str) -> WireValue {
    WireValue::graph(Some(Oid::Transient(serial)), "Person", None).with_field("name", text(name))
}

fn integer_field(handle: &ObjectRef, member_id: &str) -> i64 {
    match handle.field(member_id) {
        Some(FieldValue::Scalar(ScalarValue::Integer(value))) => value,
        _ => 0,
    }
}

fn text_field(handle: &ObjectRef, member_id: &str) -> String {
    match handle.field(member_id) {
        Some(FieldValue::Scalar(ScalarValue::Text(value))) => value,
        _ => String::new(),
    }
}

fn new_person(
    ctx: &mut ActionContext<'_, '_>,
    _repository: &ObjectRef,
    parameters: &[FieldValue],
) -> ServiceResult<FieldValue> {
    let name = match parameters.first() {
        Some(FieldValue::Scalar(ScalarValue::Text(name))) => name.clone(),
        _ => return Err(ServiceError::protocol("newPerson expects a name")),
    };
    let person = ServerObject::new_transient("Person", None);
    person.set_field("name", FieldValue::Scalar(ScalarValue::Text(name.clone())));
    person.set_field("age", FieldValue::Scalar(ScalarValue::Integer(0)));
    ctx.persist(&person)?;
    ctx.inform(format!("created {name}"));
    Ok(FieldValue::Reference(person))
}

fn birthday(
    ctx: &mut ActionContext<'_, '_>,
    person: &ObjectRef,
    _parameters: &[FieldValue],
) -> ServiceResult<FieldValue> {
    let age = integer_field(person, "age") + 1;
    person.set_field("age", FieldValue::Scalar(ScalarValue::Integer(age)));
    ctx.changed(person);
    ctx.inform(format!("happy birthday, {}", text_field(person, "name")));
    if age >= 100 {
        ctx.warn("centenarian");
    }
    Ok(FieldValue::Scalar(ScalarValue::Integer(age)))
}

fn befriend(
    ctx: &mut ActionContext<'_, '_>,
    person: &ObjectRef,
    parameters: &[FieldValue],
) -> ServiceResult<FieldValue> {
    let friend = match parameters.first() {
        Some(FieldValue::Reference(friend)) => Arc::clone(friend),
        _ => return Err(ServiceError::protocol("befriend expects a person")),
    };
    if person.is_persistent() {
        ctx.store().resolve_field(person, "friends")?;
    }
    if friend.is_transient() {
        ctx.persist(&friend)?;
    }
    person.add_element("friends", friend);
    ctx.changed(person);
    Ok(FieldValue::Null)
}

fn retire(
    ctx: &mut ActionContext<'_, '_>,
    person: &ObjectRef,
    _parameters: &[FieldValue],
) -> ServiceResult<FieldValue> {
    person.clear_field("employer");
    ctx.changed(person);
    if integer_field(person, "age") < 65 {
        return Err(ServiceError::not_modifiable("Person#retire", "too young to retire"));
    }
    ctx.inform("retired");
    Ok(FieldValue::Null)
}

/// The fixture metamodel.
pub fn people_registry() -> TypeRegistry {
    TypeRegistry::new()
        .with_type(
            TypeDescriptor::new("Person")
                .with_member(MemberDescriptor::value("name", "string"))
                .with_member(MemberDescriptor::value("age", "int"))
                .with_member(MemberDescriptor::value("notes", "string").hidden())
                .with_member(MemberDescriptor::reference("employer", "Company"))
                .with_member(MemberDescriptor::collection("friends", "Person"))
                .with_action(ActionDescriptor::new(
                    "birthday",
                    ActionKind::User,
                    vec![],
                    Some("int".into()),
                    birthday,
                ))
                .with_action(ActionDescriptor::new(
                    "befriend",
                    ActionKind::User,
                    vec!["Person".into()],
                    None,
                    befriend,
                ))
                .with_action(ActionDescriptor::new(
                    "retire",
                    ActionKind::User,
                    vec![],
                    None,
                    retire,
                )),
        )
        .with_type(TypeDescriptor::new("Company").with_member(MemberDescriptor::value("name", "string")))
        .with_type(TypeDescriptor::new("PersonRepository").with_action(ActionDescriptor::new(
            "newPerson",
            ActionKind::User,
            vec!["string".into()],
            Some("Person".into()),
            new_person,
        )))
}

/// Authenticator knowing [`ALICE`] and [`BOB`].
pub fn people_authenticator() -> StaticAuthenticator {
    StaticAuthenticator::new()
        .with_user(ALICE, ALICE_CREDENTIAL)
        .with_user(BOB, BOB_CREDENTIAL)
}

/// A running service over an in-memory store, with alice logged in.
pub struct TestEnvironment {
    /// The backing store.
    pub store: Arc<InMemoryObjectStore>,
    /// The service.
    pub service: Arc<ProtocolService>,
    /// Handler over the same service.
    pub handler: RequestHandler,
    /// Alice's session.
    pub session: Session,
}

impl TestEnvironment {
    /// Creates an environment with default configuration.
    pub fn new() -> Self {
        Self::build(ServiceConfig::default(), None)
    }

    /// Creates an environment with `config`.
    pub fn with_config(config: ServiceConfig) -> Self {
        Self::build(config, None)
    }

    /// Creates an environment with an authorization checker.
    pub fn with_authorization(authorization: impl AuthorizationChecker + 'static) -> Self {
        Self::build(ServiceConfig::default(), Some(Arc::new(authorization)))
    }

    fn build(config: ServiceConfig, authorization: Option<Arc<dyn AuthorizationChecker>>) -> Self {
        let store = Arc::new(InMemoryObjectStore::new());
        store
            .register_service(PEOPLE_SERVICE, &ServerObject::new_transient("PersonRepository", None))
            .expect("Failed to register people service");

        let mut service = ProtocolService::new(
            config,
            store.clone(),
            Arc::new(people_registry()),
            Arc::new(people_authenticator()),
        );
        if let Some(authorization) = authorization {
            service = service.with_authorization(authorization);
        }
        service.init().expect("Failed to start service");
        let session = service
            .open_session(ALICE, ALICE_CREDENTIAL)
            .expect("Failed to open session");

        let service = Arc::new(service);
        Self {
            store,
            handler: RequestHandler::new(Arc::clone(&service)),
            service,
            session,
        }
    }

    /// Opens another session.
    pub fn login(&self, user: &str, credential: &str) -> Session {
        self.service
            .open_session(user, credential)
            .expect("Failed to open session")
    }

    /// Stores a person and returns its identity with the current version.
    pub fn seed_person(&self, name: &str, age: i64) -> WireValue {
        let person = ServerObject::new_transient("Person", None);
        person.set_field("name", FieldValue::Scalar(ScalarValue::Text(name.into())));
        person.set_field("age", FieldValue::Scalar(ScalarValue::Integer(age)));
        self.seed(&person)
    }

    /// Stores a company and returns its identity with the current version.
    pub fn seed_company(&self, name: &str) -> WireValue {
        let company = ServerObject::new_transient("Company", None);
        company.set_field("name", FieldValue::Scalar(ScalarValue::Text(name.into())));
        self.seed(&company)
    }

    /// Stores an object graph and returns the root's identity.
    pub fn seed(&self, handle: &ObjectRef) -> WireValue {
        let oid = self.store.seed(handle).expect("Failed to seed object");
        WireValue::identity(oid, handle.type_name(), handle.version())
    }

    /// Loads an object straight from the store.
    pub fn load(&self, identity: &WireValue) -> ObjectRef {
        let oid = identity.oid().expect("Identity without oid");
        let type_name = identity.type_name().expect("Identity without type");
        self.store
            .load_by_oid(&oid, type_name)
            .expect("Failed to load object")
    }

    /// Current value of an `int` member in the store.
    pub fn stored_int(&self, identity: &WireValue, member_id: &str) -> Option<i64> {
        match self.load(identity).field(member_id) {
            Some(FieldValue::Scalar(ScalarValue::Integer(value))) => Some(value),
            _ => None,
        }
    }

    /// Identity of the people repository service.
    pub fn people_service(&self) -> WireValue {
        self.service
            .oid_for_service(&self.session, PEOPLE_SERVICE)
            .expect("Failed to look up people service")
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

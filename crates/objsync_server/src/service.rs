//! The protocol service facade.
//!
//! [`ProtocolService`] is the single entry point for every operation. Each
//! call validates the session, builds a fresh exchange context, and runs
//! mutations inside one transaction whose side effects are returned to the
//! client as a [`ChangeSet`].

use crate::auth::{Authenticator, SessionManager};
use crate::authorization::{AllowAll, AuthorizationChecker, MemberIdentifier};
use crate::codec::{EncodeMode, GraphCodec};
use crate::config::ServiceConfig;
use crate::context::{ActionContext, ExchangeContext};
use crate::error::{ServiceError, ServiceResult};
use crate::known::KnownObjectsTable;
use crate::metamodel::{MemberDescriptor, MemberKind, MemberResolver};
use crate::object::{FieldValue, ObjectRef};
use crate::store::{InstanceQuery, ObjectStore, PatternValue};
use crate::tracker::TrackedChanges;
use crate::transaction::TransactionCoordinator;
use crate::version::VersionGuard;
use objsync_protocol::{
    ActionKind, ChangeSet, ClientActionOp, ClientActionResult, ClientOpKind, Oid, QueryCriteria,
    QueryDescriptor, ServerActionResult, Session, WireValue, PROTOCOL_VERSION,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lifecycle state of a [`ProtocolService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Created but not initialized.
    Uninitialized,
    /// Serving requests.
    Running,
    /// Shut down; every operation fails.
    ShutDown,
}

impl ServiceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ServiceState::Running,
            2 => ServiceState::ShutDown,
            _ => ServiceState::Uninitialized,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ServiceState::Uninitialized => 0,
            ServiceState::Running => 1,
            ServiceState::ShutDown => 2,
        }
    }
}

/// What a mutation does once its guards have passed.
#[derive(Debug, Clone, Copy)]
enum Mutation {
    SetValue,
    ClearValue,
    SetAssociation,
    ClearAssociation,
    AddElement,
    RemoveElement,
}

impl Mutation {
    fn name(self) -> &'static str {
        match self {
            Mutation::SetValue => "setValue",
            Mutation::ClearValue => "clearValue",
            Mutation::SetAssociation => "setAssociation",
            Mutation::ClearAssociation => "clearAssociation",
            Mutation::AddElement => "addToCollection",
            Mutation::RemoveElement => "removeFromCollection",
        }
    }

    fn member_kind(self) -> MemberKind {
        match self {
            Mutation::SetValue | Mutation::ClearValue => MemberKind::Value,
            Mutation::SetAssociation | Mutation::ClearAssociation => MemberKind::Reference,
            Mutation::AddElement | Mutation::RemoveElement => MemberKind::Collection,
        }
    }
}

/// Result of one client batch element, before encoding.
enum BatchOutcome {
    Added(FieldValue),
    Changed(ObjectRef),
    Deleted,
}

/// Server side of the object synchronization protocol.
///
/// # Example
///
/// ```
/// use objsync_server::{InMemoryObjectStore, ProtocolService, ServiceConfig, StaticAuthenticator, TypeRegistry};
/// use std::sync::Arc;
///
/// let service = ProtocolService::new(
///     ServiceConfig::default(),
///     Arc::new(InMemoryObjectStore::new()),
///     Arc::new(TypeRegistry::new()),
///     Arc::new(StaticAuthenticator::new().with_user("alice", "secret")),
/// );
/// service.init().unwrap();
/// let session = service.open_session("alice", "secret").unwrap();
/// assert!(service.get_properties(&session).is_ok());
/// ```
pub struct ProtocolService {
    config: ServiceConfig,
    store: Arc<dyn ObjectStore>,
    resolver: Arc<dyn MemberResolver>,
    authenticator: Arc<dyn Authenticator>,
    authorization: Arc<dyn AuthorizationChecker>,
    sessions: SessionManager,
    state: AtomicU8,
}

impl ProtocolService {
    /// Creates an uninitialized service that allows every member.
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn ObjectStore>,
        resolver: Arc<dyn MemberResolver>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let sessions = SessionManager::new(config.session_secret.clone(), config.session_expiry());
        Self {
            config,
            store,
            resolver,
            authenticator,
            authorization: Arc::new(AllowAll),
            sessions,
            state: AtomicU8::new(ServiceState::Uninitialized.as_u8()),
        }
    }

    /// Replaces the authorization checker.
    #[must_use]
    pub fn with_authorization(mut self, authorization: Arc<dyn AuthorizationChecker>) -> Self {
        self.authorization = authorization;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns the number of open sessions.
    pub fn open_sessions(&self) -> usize {
        self.sessions.open_count()
    }

    /// Starts serving. Calling it again while running is a no-op.
    pub fn init(&self) -> ServiceResult<()> {
        match self.state.compare_exchange(
            ServiceState::Uninitialized.as_u8(),
            ServiceState::Running.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                info!(protocol_version = PROTOCOL_VERSION, "protocol service started");
                Ok(())
            }
            Err(current) => match ServiceState::from_u8(current) {
                ServiceState::Running => Ok(()),
                _ => Err(ServiceError::protocol("service has been shut down")),
            },
        }
    }

    /// Stops serving and closes every session.
    pub fn shutdown(&self) -> ServiceResult<()> {
        let previous = self.state.swap(ServiceState::ShutDown.as_u8(), Ordering::AcqRel);
        if ServiceState::from_u8(previous) != ServiceState::ShutDown {
            let closed = self.sessions.close_all();
            info!(closed_sessions = closed, "protocol service shut down");
        }
        Ok(())
    }

    /// Authenticates `user` and opens a session.
    pub fn open_session(&self, user: &str, credential: &str) -> ServiceResult<Session> {
        self.ensure_running()?;
        if !self.authenticator.authenticate(user, credential) {
            warn!(user, "authentication failed");
            return Err(ServiceError::auth_failed(format!("invalid credentials for {user}")));
        }
        self.sessions.open(user)
    }

    /// Ends a session. Closing a session that is not open does nothing.
    pub fn close_session(&self, session: &Session) -> ServiceResult<()> {
        self.ensure_running()?;
        self.sessions.close(session);
        Ok(())
    }

    /// Returns whether the member is visible for `target`.
    pub fn authorize_visibility(&self, session: &Session, member_id: &str, target: &WireValue) -> ServiceResult<bool> {
        self.authorize(session, member_id, target, false)
    }

    /// Returns whether the member is usable for `target`.
    pub fn authorize_usability(&self, session: &Session, member_id: &str, target: &WireValue) -> ServiceResult<bool> {
        self.authorize(session, member_id, target, true)
    }

    /// Loads an object and returns its loaded state.
    pub fn get_object(&self, session: &Session, oid: &Oid, type_name: &str) -> ServiceResult<WireValue> {
        self.begin_exchange(session, "getObject")?;
        self.resolver.type_by_name(type_name)?;
        let handle = self.store.load_by_oid(oid, type_name)?;
        self.codec().encode(&handle, EncodeMode::ForUpdate)
    }

    /// Loads one member of `target` and returns its value.
    pub fn resolve_field(&self, session: &Session, target: &WireValue, field_id: &str) -> ServiceResult<WireValue> {
        let mut exchange = self.begin_exchange(session, "resolveField")?;
        let codec = self.codec();
        let handle = Self::read_target(&codec, &mut exchange.known, target)?;
        let ty = self.resolver.type_by_name(handle.type_name())?;
        let member = self.resolver.member_by_name(&ty, field_id)?;
        if handle.is_persistent() {
            self.store.resolve_field(&handle, field_id)?;
        }
        codec.encode_member(&handle, member)
    }

    /// Loads `target` completely and returns the whole visible graph.
    pub fn resolve_immediately(&self, session: &Session, target: &WireValue) -> ServiceResult<WireValue> {
        let mut exchange = self.begin_exchange(session, "resolveImmediately")?;
        let codec = self.codec();
        let handle = Self::read_target(&codec, &mut exchange.known, target)?;
        if handle.is_persistent() && !handle.is_resolved() {
            self.store.resolve_fully(&handle)?;
        }
        codec.encode(&handle, EncodeMode::CompleteGraph)
    }

    /// Runs a query and returns every match as a complete graph.
    pub fn find_instances(&self, session: &Session, query: &QueryDescriptor) -> ServiceResult<Vec<WireValue>> {
        self.begin_exchange(session, "findInstances")?;
        let query = self.instance_query(query)?;
        let codec = self.codec();
        let results = self.store.query(&query)?;
        debug!(type_name = %query.type_name, matches = results.len(), "query executed");
        results
            .iter()
            .map(|handle| {
                if !handle.is_resolved() {
                    self.store.resolve_fully(handle)?;
                }
                codec.encode(handle, EncodeMode::CompleteGraph)
            })
            .collect()
    }

    /// Returns whether any instance of `type_name` exists.
    pub fn has_instances(&self, session: &Session, type_name: &str) -> ServiceResult<bool> {
        self.begin_exchange(session, "hasInstances")?;
        self.resolver.type_by_name(type_name)?;
        self.store.has_instances(type_name)
    }

    /// Returns the identity of a service object.
    pub fn oid_for_service(&self, session: &Session, service_id: &str) -> ServiceResult<WireValue> {
        self.begin_exchange(session, "oidForService")?;
        let handle = self.store.service_by_logical_name(service_id)?;
        self.codec().encode(&handle, EncodeMode::IdentityOnly)
    }

    /// Returns the properties advertised to clients.
    pub fn get_properties(&self, session: &Session) -> ServiceResult<BTreeMap<String, String>> {
        self.begin_exchange(session, "getProperties")?;
        let mut properties = self.config.properties.clone();
        properties.insert("protocol.version".into(), PROTOCOL_VERSION.to_string());
        properties.insert(
            "batch.max_operations".into(),
            self.config.max_batch_operations.to_string(),
        );
        Ok(properties)
    }

    /// Sets a reference member.
    pub fn set_association(
        &self,
        session: &Session,
        member_id: &str,
        target: &WireValue,
        associate: &WireValue,
    ) -> ServiceResult<ChangeSet> {
        self.mutate(session, Mutation::SetAssociation, member_id, target, associate)
    }

    /// Sets a value member.
    pub fn set_value(
        &self,
        session: &Session,
        member_id: &str,
        target: &WireValue,
        value: &WireValue,
    ) -> ServiceResult<ChangeSet> {
        self.mutate(session, Mutation::SetValue, member_id, target, value)
    }

    /// Clears a reference member.
    ///
    /// A non-null `associate` must be the current associate.
    pub fn clear_association(
        &self,
        session: &Session,
        member_id: &str,
        target: &WireValue,
        associate: &WireValue,
    ) -> ServiceResult<ChangeSet> {
        self.mutate(session, Mutation::ClearAssociation, member_id, target, associate)
    }

    /// Clears a value member.
    pub fn clear_value(&self, session: &Session, member_id: &str, target: &WireValue) -> ServiceResult<ChangeSet> {
        self.mutate(session, Mutation::ClearValue, member_id, target, &WireValue::Null)
    }

    /// Adds an element to a collection member. Adding a present element does nothing.
    pub fn add_to_collection(
        &self,
        session: &Session,
        member_id: &str,
        target: &WireValue,
        element: &WireValue,
    ) -> ServiceResult<ChangeSet> {
        self.mutate(session, Mutation::AddElement, member_id, target, element)
    }

    /// Removes an element from a collection member.
    pub fn remove_from_collection(
        &self,
        session: &Session,
        member_id: &str,
        target: &WireValue,
        element: &WireValue,
    ) -> ServiceResult<ChangeSet> {
        self.mutate(session, Mutation::RemoveElement, member_id, target, element)
    }

    /// Applies a batch of client-side changes in one transaction.
    pub fn execute_client_action(
        &self,
        session: &Session,
        operations: &[ClientActionOp],
    ) -> ServiceResult<ClientActionResult> {
        let exchange = self.begin_exchange(session, "executeClientAction")?;
        if operations.len() > self.config.max_batch_operations {
            return Err(ServiceError::protocol(format!(
                "batch of {} operations exceeds the limit of {}",
                operations.len(),
                self.config.max_batch_operations
            )));
        }

        let ExchangeContext { mut known, .. } = exchange;
        let codec = self.codec();
        let guard = VersionGuard::new(&*self.store);
        let mut coordinator = TransactionCoordinator::new(&*self.store, &session.user);

        let (outcomes, changes) = coordinator.run(|tx| {
            let mut outcomes = Vec::with_capacity(operations.len());
            for (index, op) in operations.iter().enumerate() {
                debug!(index, kind = ?op.kind, "applying batch element");
                let outcome = match op.kind {
                    ClientOpKind::Add => {
                        let decoded = codec.decode(&op.data, &mut known)?;
                        let handle = decoded.as_reference().cloned().ok_or_else(|| {
                            ServiceError::protocol(format!("ADD element {index} is not an object"))
                        })?;
                        if handle.is_transient() {
                            tx.make_persistent(&handle)?;
                            known.promote(&handle);
                        }
                        tx.object_changed(&handle);
                        BatchOutcome::Added(decoded)
                    }
                    ClientOpKind::Change => {
                        let handle = Self::load_target(&codec, &mut known, &op.data)?;
                        guard.check_claimed(&handle, op.data.version())?;
                        codec.decode_object(&op.data, &mut known)?;
                        tx.object_changed(&handle);
                        BatchOutcome::Changed(handle)
                    }
                    ClientOpKind::Delete => {
                        let handle = Self::load_target(&codec, &mut known, &op.data)?;
                        guard.check_claimed(&handle, op.data.version())?;
                        tx.object_disposed(&handle);
                        BatchOutcome::Deleted
                    }
                };
                outcomes.push(outcome);
            }
            Ok(outcomes)
        })?;

        let results = operations
            .iter()
            .zip(outcomes)
            .map(|(op, outcome)| match outcome {
                BatchOutcome::Added(decoded) => codec.encode_made_persistent(&op.data, &decoded),
                BatchOutcome::Changed(handle) => codec.encode(&handle, EncodeMode::IdentityOnly),
                BatchOutcome::Deleted => Ok(WireValue::Null),
            })
            .collect::<ServiceResult<Vec<_>>>()?;
        let updates = self.change_set(&codec, changes)?;
        debug!(operations = operations.len(), changed = updates.changed.len(), "batch committed");
        Ok(ClientActionResult { results, updates })
    }

    /// Invokes a domain action on the server in one transaction.
    pub fn execute_server_action(
        &self,
        session: &Session,
        kind: ActionKind,
        action_id: &str,
        target: &WireValue,
        parameter_types: &[String],
        parameters: &[WireValue],
    ) -> ServiceResult<ServerActionResult> {
        let ExchangeContext {
            session: exchange_session,
            mut known,
            mut log,
        } = self.begin_exchange(session, "executeServerAction")?;
        if parameters.len() != parameter_types.len() {
            return Err(ServiceError::protocol(format!(
                "{} parameters given for {} declared types",
                parameters.len(),
                parameter_types.len()
            )));
        }

        let store: &dyn ObjectStore = &*self.store;
        let codec = self.codec();
        let guard = VersionGuard::new(store);
        let mut coordinator = TransactionCoordinator::new(store, &session.user);

        let ((handle, decoded_parameters, result, return_type), changes) = coordinator.run(|tx| {
            let handle = codec.decode_object(target, &mut known)?;
            if handle.is_persistent() {
                guard.check_claimed(&handle, target.version())?;
            }

            let ty = self.resolver.type_by_name(handle.type_name())?;
            let action = self
                .resolver
                .action_by_name(&ty, kind, action_id, parameter_types)?;
            let member = MemberIdentifier::new(handle.type_name(), action_id);
            self.check_usable(&exchange_session, &member, &handle)?;

            let decoded_parameters = parameters
                .iter()
                .map(|p| codec.decode(p, &mut known))
                .collect::<ServiceResult<Vec<_>>>()?;
            for (wire, decoded) in parameters.iter().zip(&decoded_parameters) {
                if let (FieldValue::Reference(parameter), Some(claimed)) = (decoded, wire.version()) {
                    if parameter.is_persistent() {
                        guard.check_lock(parameter, claimed)?;
                    }
                }
            }

            let mut ctx = ActionContext::new(&exchange_session, store, &mut *tx, &mut log);
            let result = action.invoke(&mut ctx, &handle, &decoded_parameters)?;
            debug!(action = %member, "action invoked");
            Ok((handle, decoded_parameters, result, action.return_type.clone()))
        })?;

        let result = codec.encode_value(&result, return_type.as_deref())?;
        let persisted_target = Self::persisted_delta(&codec, target, &FieldValue::Reference(handle))?;
        let persisted_parameters = parameters
            .iter()
            .zip(&decoded_parameters)
            .map(|(original, decoded)| Self::persisted_delta(&codec, original, decoded))
            .collect::<ServiceResult<Vec<_>>>()?;
        let updates = self.change_set(&codec, changes)?;
        let (messages, warnings) = log.take();

        Ok(ServerActionResult {
            result,
            persisted_target,
            persisted_parameters,
            updates,
            messages,
            warnings,
        })
    }

    fn ensure_running(&self) -> ServiceResult<()> {
        match self.state() {
            ServiceState::Running => Ok(()),
            ServiceState::Uninitialized => Err(ServiceError::protocol("service is not initialized")),
            ServiceState::ShutDown => Err(ServiceError::protocol("service has been shut down")),
        }
    }

    fn begin_exchange(&self, session: &Session, operation: &str) -> ServiceResult<ExchangeContext> {
        self.ensure_running()?;
        self.sessions.validate(session)?;
        debug!(operation, user = %session.user, "exchange started");
        Ok(ExchangeContext::new(session.clone()))
    }

    fn codec(&self) -> GraphCodec<'_> {
        GraphCodec::new(&*self.store, &*self.resolver)
    }

    fn authorize(&self, session: &Session, member_id: &str, target: &WireValue, usability: bool) -> ServiceResult<bool> {
        let operation = if usability {
            "authorizeUsability"
        } else {
            "authorizeVisibility"
        };
        let mut exchange = self.begin_exchange(session, operation)?;
        let handle = Self::read_target(&self.codec(), &mut exchange.known, target)?;
        let member = MemberIdentifier::parse(member_id, handle.type_name())?;
        let ty = self.resolver.type_by_name(&member.type_name)?;
        let is_action = ty.actions().iter().any(|a| a.id == member.member_id);
        if !is_action && self.resolver.member_by_name(&ty, &member.member_id)?.hidden {
            return Ok(false);
        }
        Ok(if usability {
            self.authorization.is_usable(session, &member, Some(&handle))
        } else {
            self.authorization.is_visible(session, &member, Some(&handle))
        })
    }

    fn check_usable(&self, session: &Session, member: &MemberIdentifier, handle: &ObjectRef) -> ServiceResult<()> {
        if !self.authorization.is_visible(session, member, Some(handle)) {
            warn!(%member, user = %session.user, "member not visible");
            return Err(ServiceError::not_modifiable(member.to_string(), "not visible"));
        }
        if !self.authorization.is_usable(session, member, Some(handle)) {
            warn!(%member, user = %session.user, "member not usable");
            return Err(ServiceError::not_modifiable(member.to_string(), "not usable"));
        }
        Ok(())
    }

    /// The identity part of a value naming a persistent object.
    fn persistent_identity(target: &WireValue) -> Option<WireValue> {
        match target {
            WireValue::Identity { oid, type_name, .. }
            | WireValue::Graph {
                oid: Some(oid),
                type_name,
                ..
            } if oid.is_persistent() => Some(WireValue::identity(*oid, type_name.clone(), None)),
            _ => None,
        }
    }

    /// Loads the persistent object a mutation addresses, ignoring any fields.
    fn load_target(codec: &GraphCodec<'_>, known: &mut KnownObjectsTable, target: &WireValue) -> ServiceResult<ObjectRef> {
        match Self::persistent_identity(target) {
            Some(identity) => codec.decode_object(&identity, known),
            None => Err(ServiceError::protocol(format!(
                "mutation target must be a persistent object, got {}",
                target.kind()
            ))),
        }
    }

    /// Loads the object a read addresses. Fields sent with a persistent
    /// object are ignored so the answer reflects stored state only.
    fn read_target(codec: &GraphCodec<'_>, known: &mut KnownObjectsTable, target: &WireValue) -> ServiceResult<ObjectRef> {
        match Self::persistent_identity(target) {
            Some(identity) => codec.decode_object(&identity, known),
            None => codec.decode_object(target, known),
        }
    }

    fn mutate(
        &self,
        session: &Session,
        mutation: Mutation,
        member_id: &str,
        target: &WireValue,
        value: &WireValue,
    ) -> ServiceResult<ChangeSet> {
        let ExchangeContext { mut known, .. } = self.begin_exchange(session, mutation.name())?;
        let codec = self.codec();
        let guard = VersionGuard::new(&*self.store);
        let mut coordinator = TransactionCoordinator::new(&*self.store, &session.user);

        let ((), changes) = coordinator.run(|tx| {
            let handle = Self::load_target(&codec, &mut known, target)?;
            let ty = self.resolver.type_by_name(handle.type_name())?;
            let member = self.resolver.member_by_name(&ty, member_id)?;
            if member.kind != mutation.member_kind() {
                return Err(ServiceError::protocol(format!(
                    "{} is not applicable to {} member {}",
                    mutation.name(),
                    member.kind.describe(),
                    member.id
                )));
            }
            guard.check_claimed(&handle, target.version())?;
            let identifier = MemberIdentifier::new(handle.type_name(), member_id);
            if member.hidden {
                warn!(member = %identifier, user = %session.user, "hidden member cannot be modified");
                return Err(ServiceError::not_modifiable(identifier.to_string(), "not visible"));
            }
            self.check_usable(session, &identifier, &handle)?;

            if self.apply_mutation(tx, &codec, &mut known, mutation, &handle, member, value)? {
                tx.object_changed(&handle);
            }
            Ok(())
        })?;

        self.change_set(&codec, changes)
    }

    /// Applies a guarded mutation. Returns false if nothing changed.
    #[allow(clippy::too_many_arguments)]
    fn apply_mutation(
        &self,
        tx: &mut TransactionCoordinator<'_>,
        codec: &GraphCodec<'_>,
        known: &mut KnownObjectsTable,
        mutation: Mutation,
        handle: &ObjectRef,
        member: &MemberDescriptor,
        value: &WireValue,
    ) -> ServiceResult<bool> {
        match mutation {
            Mutation::SetValue | Mutation::SetAssociation => {
                let decoded = codec.decode_member(member, value, known)?;
                if let FieldValue::Reference(associate) = &decoded {
                    Self::persist_if_new(tx, associate)?;
                }
                handle.set_field(member.id.clone(), decoded);
                Ok(true)
            }
            Mutation::ClearValue => {
                handle.clear_field(&member.id);
                Ok(true)
            }
            Mutation::ClearAssociation => {
                if !value.is_null() {
                    let expected = codec.decode_object(value, known)?;
                    let current = handle.field(&member.id).unwrap_or(FieldValue::Null);
                    let matches = match (current.as_reference(), expected.persistent_oid()) {
                        (Some(current), Some(oid)) => current.persistent_oid() == Some(oid),
                        _ => false,
                    };
                    if !matches {
                        return Err(ServiceError::protocol(format!(
                            "{} is not the current associate of {}",
                            expected.describe(),
                            member.id
                        )));
                    }
                }
                handle.clear_field(&member.id);
                Ok(true)
            }
            Mutation::AddElement | Mutation::RemoveElement => {
                let element = codec.decode_object(value, known)?;
                if handle.is_persistent() {
                    self.store.resolve_field(handle, &member.id)?;
                }
                let current = handle.field(&member.id).unwrap_or(FieldValue::Null);
                let existing = current
                    .as_collection()
                    .unwrap_or_default()
                    .iter()
                    .find(|e| e.persistent_oid().is_some() && e.persistent_oid() == element.persistent_oid())
                    .cloned();
                if let Mutation::AddElement = mutation {
                    if existing.is_some() {
                        return Ok(false);
                    }
                    Self::persist_if_new(tx, &element)?;
                    Ok(handle.add_element(&member.id, element))
                } else {
                    Ok(existing.is_some_and(|e| handle.remove_element(&member.id, &e)))
                }
            }
        }
    }

    fn persist_if_new(tx: &mut TransactionCoordinator<'_>, handle: &ObjectRef) -> ServiceResult<()> {
        if handle.is_transient() {
            tx.make_persistent(handle)?;
            tx.object_changed(handle);
        }
        Ok(())
    }

    /// Reports a transient-origin object the transaction made persistent.
    fn persisted_delta(codec: &GraphCodec<'_>, original: &WireValue, decoded: &FieldValue) -> ServiceResult<WireValue> {
        let transient_origin = matches!(original, WireValue::Graph { oid, .. } if !oid.is_some_and(|o| o.is_persistent()));
        match decoded {
            FieldValue::Reference(handle) if transient_origin && handle.is_persistent() => {
                codec.encode_made_persistent(original, decoded)
            }
            _ => Ok(WireValue::Null),
        }
    }

    fn change_set(&self, codec: &GraphCodec<'_>, changes: TrackedChanges) -> ServiceResult<ChangeSet> {
        let changed = changes
            .changed
            .iter()
            .filter(|h| h.is_persistent())
            .map(|h| codec.encode(h, EncodeMode::ForUpdate))
            .collect::<ServiceResult<Vec<_>>>()?;
        let disposed = changes
            .disposed
            .iter()
            .map(|h| codec.encode(h, EncodeMode::IdentityOnly))
            .collect::<ServiceResult<Vec<_>>>()?;
        Ok(ChangeSet { changed, disposed })
    }

    fn instance_query(&self, query: &QueryDescriptor) -> ServiceResult<InstanceQuery> {
        let ty = self.resolver.type_by_name(&query.type_name)?;
        let wire_pattern = match &query.criteria {
            QueryCriteria::All => return Ok(InstanceQuery::all(&query.type_name)),
            QueryCriteria::Pattern(pattern) => pattern,
        };
        let mut pattern = BTreeMap::new();
        for (member_id, wire) in wire_pattern {
            let member = self.resolver.member_by_name(&ty, member_id)?;
            let value = match (member.kind, wire) {
                (_, WireValue::Null) => PatternValue::Null,
                (MemberKind::Value, WireValue::Encoded { type_name, payload }) => {
                    PatternValue::Scalar(self.resolver.value_codec(type_name)?.decode(payload)?)
                }
                (MemberKind::Reference, WireValue::Identity { oid, .. }) => PatternValue::Reference(*oid),
                (_, other) => {
                    return Err(ServiceError::protocol(format!(
                        "cannot match {} member {} against a {} value",
                        member.kind.describe(),
                        member.id,
                        other.kind()
                    )))
                }
            };
            pattern.insert(member_id.clone(), value);
        }
        Ok(InstanceQuery {
            type_name: query.type_name.clone(),
            pattern,
        })
    }
}

//! Request and response envelope for the protocol operations.
//!
//! Every operation is a request/response pair keyed by the operation name.
//! The envelope is transport neutral; [`Request::encode`] and
//! [`Response::encode`] produce CBOR bytes any transport can carry.

use crate::error::{ProtocolError, ProtocolResult};
use crate::oid::Oid;
use crate::wire::{check_wire_kinds, map_field, WireValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An authenticated session as seen by the client.
///
/// The token is opaque to the client; the server signs it when the session
/// is opened and checks it on every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier.
    pub id: [u8; 16],
    /// Authenticated user name.
    pub user: String,
    /// Unix millis when the session was opened.
    pub issued_at: u64,
    /// Server signature over the fields above.
    pub token: Vec<u8>,
}

/// Category of a server action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Regular user action.
    User,
    /// Only available while exploring a prototype.
    Exploration,
    /// Diagnostic action.
    Debug,
}

/// Kind of one element of a client action batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientOpKind {
    /// Persist a new object graph.
    Add,
    /// Update a persistent object.
    Change,
    /// Dispose of a persistent object.
    Delete,
}

/// One element of a client action batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientActionOp {
    /// What to do.
    pub kind: ClientOpKind,
    /// Object graph (`Add`, `Change`) or identity (`Delete`).
    pub data: WireValue,
}

impl ClientActionOp {
    /// Creates an `Add` element.
    pub fn add(data: WireValue) -> Self {
        Self {
            kind: ClientOpKind::Add,
            data,
        }
    }

    /// Creates a `Change` element.
    pub fn change(data: WireValue) -> Self {
        Self {
            kind: ClientOpKind::Change,
            data,
        }
    }

    /// Creates a `Delete` element.
    pub fn delete(data: WireValue) -> Self {
        Self {
            kind: ClientOpKind::Delete,
            data,
        }
    }
}

/// Query passed through to the object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    /// Type whose instances are searched.
    pub type_name: String,
    /// Selection criteria.
    pub criteria: QueryCriteria,
}

/// Selection criteria of a [`QueryDescriptor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryCriteria {
    /// Every instance of the type.
    All,
    /// Instances whose members equal the given values.
    Pattern(BTreeMap<String, WireValue>),
}

impl QueryDescriptor {
    /// Matches every instance of `type_name`.
    pub fn all(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            criteria: QueryCriteria::All,
        }
    }

    /// Matches instances whose members equal `pattern`.
    pub fn pattern(type_name: impl Into<String>, pattern: BTreeMap<String, WireValue>) -> Self {
        Self {
            type_name: type_name.into(),
            criteria: QueryCriteria::Pattern(pattern),
        }
    }
}

/// Objects changed or disposed by a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Changed objects with their new versions.
    pub changed: Vec<WireValue>,
    /// Identities of disposed objects.
    pub disposed: Vec<WireValue>,
}

impl ChangeSet {
    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.disposed.is_empty()
    }

    /// Returns the oids of the changed objects.
    pub fn changed_oids(&self) -> Vec<Oid> {
        self.changed.iter().filter_map(WireValue::oid).collect()
    }
}

/// Result of a client action batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientActionResult {
    /// One entry per batch element, in order.
    pub results: Vec<WireValue>,
    /// Side effects of the whole batch.
    pub updates: ChangeSet,
}

/// Result of a server action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerActionResult {
    /// Value returned by the action.
    pub result: WireValue,
    /// Made-persistent delta for a target that was transient, else `Null`.
    pub persisted_target: WireValue,
    /// Made-persistent deltas for parameters, `Null` where nothing changed.
    pub persisted_parameters: Vec<WireValue>,
    /// Side effects of the action.
    pub updates: ChangeSet,
    /// Informational messages raised by the action.
    pub messages: Vec<String>,
    /// Warnings raised by the action.
    pub warnings: Vec<String>,
}

/// Category of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Unknown oid, service or object.
    NotFound,
    /// Type name unknown to the metamodel.
    UnknownType,
    /// Member id unknown on the type.
    UnknownMember,
    /// No action matches the request.
    UnknownAction,
    /// Visibility or usability veto.
    NotModifiable,
    /// The claimed version is stale.
    ConcurrencyConflict,
    /// Malformed or unexpected request.
    Protocol,
    /// Bad credentials or invalid session.
    AuthFailed,
    /// Internal server fault.
    Internal,
}

impl FaultKind {
    /// Returns true if the client may recover by refreshing and retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, FaultKind::ConcurrencyConflict | FaultKind::NotModifiable)
    }
}

/// A typed, response-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    /// Category.
    pub kind: FaultKind,
    /// Human readable detail.
    pub message: String,
    /// True if the failure rolled back a transaction.
    pub aborted: bool,
}

/// A protocol request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "body", rename_all = "snake_case")]
pub enum Request {
    /// Start the service.
    Init,
    /// Stop the service.
    Shutdown,
    /// Authenticate and open a session.
    OpenSession {
        /// User name.
        user: String,
        /// Credential to verify.
        credential: String,
    },
    /// End a session.
    CloseSession {
        /// Session to end.
        session: Session,
    },
    /// Ask whether a member is visible.
    AuthorizeVisibility {
        /// Caller session.
        session: Session,
        /// Member identifier, `Type#member` or a bare member id.
        member_id: String,
        /// Object owning the member.
        target: WireValue,
    },
    /// Ask whether a member is usable.
    AuthorizeUsability {
        /// Caller session.
        session: Session,
        /// Member identifier, `Type#member` or a bare member id.
        member_id: String,
        /// Object owning the member.
        target: WireValue,
    },
    /// Fetch an object for cache refresh.
    GetObject {
        /// Caller session.
        session: Session,
        /// Object identifier.
        oid: Oid,
        /// Type name.
        type_name: String,
    },
    /// Load one lazily resolved field.
    ResolveField {
        /// Caller session.
        session: Session,
        /// Owning object.
        target: WireValue,
        /// Member id.
        field_id: String,
    },
    /// Load an object completely.
    ResolveImmediately {
        /// Caller session.
        session: Session,
        /// Object to resolve.
        target: WireValue,
    },
    /// Run a store query.
    FindInstances {
        /// Caller session.
        session: Session,
        /// Query to run.
        query: QueryDescriptor,
    },
    /// Ask whether any instance of a type exists.
    HasInstances {
        /// Caller session.
        session: Session,
        /// Type name.
        type_name: String,
    },
    /// Set a reference member.
    SetAssociation {
        /// Caller session.
        session: Session,
        /// Member id.
        member_id: String,
        /// Owning object with claimed version.
        target: WireValue,
        /// New associate.
        associate: WireValue,
    },
    /// Set a value member.
    SetValue {
        /// Caller session.
        session: Session,
        /// Member id.
        member_id: String,
        /// Owning object with claimed version.
        target: WireValue,
        /// New value.
        value: WireValue,
    },
    /// Clear a reference member.
    ClearAssociation {
        /// Caller session.
        session: Session,
        /// Member id.
        member_id: String,
        /// Owning object with claimed version.
        target: WireValue,
        /// Associate the client expects to remove, or `Null`.
        associate: WireValue,
    },
    /// Clear a value member.
    ClearValue {
        /// Caller session.
        session: Session,
        /// Member id.
        member_id: String,
        /// Owning object with claimed version.
        target: WireValue,
    },
    /// Add an element to a collection member.
    AddToCollection {
        /// Caller session.
        session: Session,
        /// Member id.
        member_id: String,
        /// Owning object with claimed version.
        target: WireValue,
        /// Element to add.
        element: WireValue,
    },
    /// Remove an element from a collection member.
    RemoveFromCollection {
        /// Caller session.
        session: Session,
        /// Member id.
        member_id: String,
        /// Owning object with claimed version.
        target: WireValue,
        /// Element to remove.
        element: WireValue,
    },
    /// Apply a batch of client-side changes atomically.
    ExecuteClientAction {
        /// Caller session.
        session: Session,
        /// Batch elements, applied in order.
        operations: Vec<ClientActionOp>,
    },
    /// Invoke a domain action on the server.
    ExecuteServerAction {
        /// Caller session.
        session: Session,
        /// Action category.
        action_kind: ActionKind,
        /// Action id.
        action_id: String,
        /// Object the action is invoked on.
        target: WireValue,
        /// Declared parameter types.
        parameter_types: Vec<String>,
        /// Parameter values.
        parameters: Vec<WireValue>,
    },
    /// Look up a service object.
    OidForService {
        /// Caller session.
        session: Session,
        /// Logical service name.
        service_id: String,
    },
    /// Fetch the properties the server advertises.
    GetProperties {
        /// Caller session.
        session: Session,
    },
}

impl Request {
    /// Returns the operation name.
    #[must_use]
    pub fn operation(&self) -> &'static str {
        match self {
            Request::Init => "init",
            Request::Shutdown => "shutdown",
            Request::OpenSession { .. } => "open_session",
            Request::CloseSession { .. } => "close_session",
            Request::AuthorizeVisibility { .. } => "authorize_visibility",
            Request::AuthorizeUsability { .. } => "authorize_usability",
            Request::GetObject { .. } => "get_object",
            Request::ResolveField { .. } => "resolve_field",
            Request::ResolveImmediately { .. } => "resolve_immediately",
            Request::FindInstances { .. } => "find_instances",
            Request::HasInstances { .. } => "has_instances",
            Request::SetAssociation { .. } => "set_association",
            Request::SetValue { .. } => "set_value",
            Request::ClearAssociation { .. } => "clear_association",
            Request::ClearValue { .. } => "clear_value",
            Request::AddToCollection { .. } => "add_to_collection",
            Request::RemoveFromCollection { .. } => "remove_from_collection",
            Request::ExecuteClientAction { .. } => "execute_client_action",
            Request::ExecuteServerAction { .. } => "execute_server_action",
            Request::OidForService { .. } => "oid_for_service",
            Request::GetProperties { .. } => "get_properties",
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    ///
    /// Every embedded wire value is tag-checked first, so an unknown kind
    /// anywhere in the request fails with [`ProtocolError::UnknownWireType`].
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let raw: ciborium::Value = ciborium::de::from_reader(bytes)
            .map_err(|e| ProtocolError::decoding_failed(e.to_string()))?;
        if let Some(body) = raw
            .as_map()
            .and_then(|map| map_field(map, "body"))
            .and_then(|body| body.as_map())
        {
            check_request_body(body)?;
        }
        raw.deserialized()
            .map_err(|e| ProtocolError::decoding_failed(e.to_string()))
    }
}

/// Tag-checks the wire values carried by a request body.
fn check_request_body(body: &[(ciborium::Value, ciborium::Value)]) -> ProtocolResult<()> {
    for (key, value) in body {
        match key.as_text() {
            Some("target" | "associate" | "value" | "element") => check_wire_kinds(value)?,
            Some("parameters") => {
                for parameter in value.as_array().into_iter().flatten() {
                    check_wire_kinds(parameter)?;
                }
            }
            Some("operations") => {
                for op in value.as_array().into_iter().flatten() {
                    if let Some(data) = op.as_map().and_then(|op| map_field(op, "data")) {
                        check_wire_kinds(data)?;
                    }
                }
            }
            Some("query") => {
                let pattern = value
                    .as_map()
                    .and_then(|query| map_field(query, "criteria"))
                    .and_then(|criteria| criteria.as_map())
                    .and_then(|criteria| map_field(criteria, "pattern"))
                    .and_then(|pattern| pattern.as_map());
                for (_, expected) in pattern.into_iter().flatten() {
                    check_wire_kinds(expected)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// A protocol response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "body", rename_all = "snake_case")]
pub enum Response {
    /// The service is running.
    Initialized,
    /// The service stopped.
    ShutDown,
    /// A session was opened.
    Session(Session),
    /// A session was closed.
    SessionClosed,
    /// Answer to an authorization query.
    Authorization(bool),
    /// A single encoded object or field.
    Object(WireValue),
    /// Query results.
    Instances(Vec<WireValue>),
    /// Answer to `has_instances`.
    HasInstances(bool),
    /// Side effects of a member mutation.
    Updates(ChangeSet),
    /// Outcome of a client action batch.
    ClientAction(ClientActionResult),
    /// Outcome of a server action.
    ServerAction(ServerActionResult),
    /// Advertised properties.
    Properties(BTreeMap<String, String>),
    /// The operation failed.
    Fault(Fault),
}

impl Response {
    /// Returns the fault, if the operation failed.
    #[must_use]
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Response::Fault(fault) => Some(fault),
            _ => None,
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

fn to_cbor<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes)
        .map_err(|e| ProtocolError::encoding_failed(e.to_string()))?;
    Ok(bytes)
}

fn from_cbor<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::decoding_failed(e.to_string()))
}

//! # objsync server
//!
//! Server side of the objsync remote object-graph protocol.
//!
//! This crate provides:
//! - `ProtocolService`, the facade implementing every protocol operation
//! - `GraphCodec`, converting object graphs to and from wire values with
//!   per-exchange deduplication
//! - `VersionGuard`, the optimistic concurrency check
//! - `TransactionCoordinator` and `UpdateTracker`, the unit of work and its
//!   recorded side effects
//! - HMAC-SHA256 signed sessions
//! - `RequestHandler`, dispatching CBOR request envelopes
//! - `InMemoryObjectStore` and `TypeRegistry` for embedded hosts and tests
//!
//! # Architecture
//!
//! The service never talks to a database or reflects over types itself. It
//! consumes four collaborators through traits:
//! - `ObjectStore` loads, queries and persists objects
//! - `MemberResolver` describes types, members and actions
//! - `AuthorizationChecker` vetoes members per session
//! - `Authenticator` verifies credentials
//!
//! Every request gets a fresh exchange context. Mutations run inside one
//! transaction: guards are checked first, changes are applied, and the
//! objects touched are returned as a change set. Any failure rolls the
//! whole transaction back.
//!
//! # Example
//!
//! ```rust,ignore
//! use objsync_server::{ProtocolService, RequestHandler};
//!
//! let handler = RequestHandler::new(Arc::new(service));
//! let response_bytes = handler.handle_encoded(&request_bytes)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod auth;
mod authorization;
mod codec;
mod config;
mod context;
mod error;
mod handler;
mod known;
mod memory;
mod metamodel;
mod object;
mod service;
mod store;
mod tracker;
mod transaction;
mod version;

pub use auth::{Authenticator, SessionManager, StaticAuthenticator};
pub use authorization::{AllowAll, AuthorizationChecker, MemberIdentifier, RuleBasedAuthorization};
pub use codec::{EncodeMode, GraphCodec};
pub use config::ServiceConfig;
pub use context::{ActionContext, ExchangeContext, MessageLog};
pub use error::{ServiceError, ServiceResult};
pub use handler::RequestHandler;
pub use known::{KnownKey, KnownObjectsTable};
pub use memory::{InMemoryObjectStore, StoreStats};
pub use metamodel::{
    ActionDescriptor, ActionInvoker, BoolCodec, BytesCodec, IntegerCodec, MemberDescriptor,
    MemberKind, MemberResolver, TextCodec, TypeDescriptor, TypeRegistry, ValueCodec,
};
pub use object::{same_object, FieldValue, ObjectRef, ResolveState, ScalarValue, ServerObject};
pub use service::{ProtocolService, ServiceState};
pub use store::{InstanceQuery, ObjectStore, PatternValue, StoreTransaction};
pub use tracker::{TrackedChanges, UpdateTracker};
pub use transaction::{TransactionCoordinator, TransactionState};
pub use version::VersionGuard;

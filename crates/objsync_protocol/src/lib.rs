//! # objsync protocol
//!
//! Wire data model for the objsync remote object-graph protocol.
//!
//! This crate provides:
//! - `Oid` and `Version`, the identity and concurrency stamp of server objects
//! - `WireValue`, the tagged union of values crossing the wire
//! - `Request`/`Response`, one pair per protocol operation
//! - `Fault`/`FaultKind` for typed response-level failures
//! - CBOR encoding/decoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod error;
mod messages;
mod oid;
mod wire;

pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    ActionKind, ChangeSet, ClientActionOp, ClientActionResult, ClientOpKind, Fault, FaultKind,
    QueryCriteria, QueryDescriptor, Request, Response, ServerActionResult, Session,
};
pub use oid::{unix_millis, Oid, Version};
pub use wire::WireValue;

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;

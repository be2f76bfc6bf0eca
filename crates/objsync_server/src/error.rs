//! Error types for the protocol service.

use objsync_protocol::{Fault, FaultKind, Oid, ProtocolError, Version};
use thiserror::Error;

/// Result type for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors that can occur while serving a protocol operation.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Unknown oid, service or other lookup miss.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// Type name unknown to the metamodel.
    #[error("unknown type: {type_name}")]
    UnknownType {
        /// The type name.
        type_name: String,
    },

    /// Member id not present on the type.
    #[error("unknown member {member_id} on {type_name}")]
    UnknownMember {
        /// Owning type.
        type_name: String,
        /// The member id.
        member_id: String,
    },

    /// No action matches the request.
    #[error("unknown action {action_id} on {type_name}")]
    UnknownAction {
        /// Owning type.
        type_name: String,
        /// The action id.
        action_id: String,
    },

    /// The member is hidden or disabled for this session.
    #[error("member {member} is not modifiable: {reason}")]
    NotModifiable {
        /// Member identifier.
        member: String,
        /// Why the veto applies.
        reason: String,
    },

    /// The claimed version is stale.
    #[error("concurrency conflict on {oid}: claimed {claimed}, current {current}")]
    ConcurrencyConflict {
        /// The object.
        oid: Oid,
        /// Version the client presented.
        claimed: Version,
        /// Authoritative version.
        current: Version,
    },

    /// Malformed or unexpected request content.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Bad credentials or invalid session.
    #[error("authentication failed: {reason}")]
    AuthFailed {
        /// Why authentication failed.
        reason: String,
    },

    /// A failure inside an active transaction; the transaction was rolled back.
    #[error("transaction aborted: {cause}")]
    TransactionAborted {
        /// The failure that caused the abort.
        cause: Box<ServiceError>,
    },

    /// Internal fault, including a failed rollback.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the fault.
        message: String,
    },
}

impl ServiceError {
    /// Creates a not found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates an unknown type error.
    pub fn unknown_type(type_name: impl Into<String>) -> Self {
        Self::UnknownType {
            type_name: type_name.into(),
        }
    }

    /// Creates an unknown member error.
    pub fn unknown_member(type_name: impl Into<String>, member_id: impl Into<String>) -> Self {
        Self::UnknownMember {
            type_name: type_name.into(),
            member_id: member_id.into(),
        }
    }

    /// Creates an unknown action error.
    pub fn unknown_action(type_name: impl Into<String>, action_id: impl Into<String>) -> Self {
        Self::UnknownAction {
            type_name: type_name.into(),
            action_id: action_id.into(),
        }
    }

    /// Creates a not modifiable error.
    pub fn not_modifiable(member: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NotModifiable {
            member: member.into(),
            reason: reason.into(),
        }
    }

    /// Creates a protocol error for a structural problem.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(ProtocolError::invalid_structure(message))
    }

    /// Creates an authentication failure.
    pub fn auth_failed(reason: impl Into<String>) -> Self {
        Self::AuthFailed {
            reason: reason.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wraps `cause` as the reason a transaction was rolled back.
    ///
    /// An error that already records an abort is returned unchanged.
    pub fn aborted(cause: ServiceError) -> Self {
        match cause {
            aborted @ ServiceError::TransactionAborted { .. } => aborted,
            cause => Self::TransactionAborted {
                cause: Box::new(cause),
            },
        }
    }

    /// Returns the innermost error, looking through transaction aborts.
    pub fn root_cause(&self) -> &ServiceError {
        match self {
            ServiceError::TransactionAborted { cause } => cause.root_cause(),
            other => other,
        }
    }

    /// Returns true if a transaction was rolled back because of this error.
    pub fn is_abort(&self) -> bool {
        matches!(self, ServiceError::TransactionAborted { .. })
    }

    /// Returns the wire category of this error.
    ///
    /// Aborts report the kind of their cause, so a conflict inside a batch is
    /// still seen as a conflict by the client.
    pub fn kind(&self) -> FaultKind {
        match self.root_cause() {
            ServiceError::NotFound { .. } => FaultKind::NotFound,
            ServiceError::UnknownType { .. } => FaultKind::UnknownType,
            ServiceError::UnknownMember { .. } => FaultKind::UnknownMember,
            ServiceError::UnknownAction { .. } => FaultKind::UnknownAction,
            ServiceError::NotModifiable { .. } => FaultKind::NotModifiable,
            ServiceError::ConcurrencyConflict { .. } => FaultKind::ConcurrencyConflict,
            ServiceError::Protocol(_) => FaultKind::Protocol,
            ServiceError::AuthFailed { .. } => FaultKind::AuthFailed,
            ServiceError::Internal { .. } | ServiceError::TransactionAborted { .. } => {
                FaultKind::Internal
            }
        }
    }

    /// Returns true if the client may recover by refreshing and retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Converts to a response-level fault.
    pub fn to_fault(&self) -> Fault {
        Fault {
            kind: self.kind(),
            message: self.to_string(),
            aborted: self.is_abort(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conflict() -> ServiceError {
        ServiceError::ConcurrencyConflict {
            oid: Oid::Persistent(1),
            claimed: Version::new(1, "alice", 10),
            current: Version::new(2, "bob", 20),
        }
    }

    #[test]
    fn abort_reports_cause_kind() {
        let err = ServiceError::aborted(conflict());
        assert!(err.is_abort());
        assert_eq!(err.kind(), FaultKind::ConcurrencyConflict);
        assert!(err.is_retryable());

        let fault = err.to_fault();
        assert!(fault.aborted);
        assert!(fault.message.contains("P#1"));
    }

    #[test]
    fn aborted_does_not_nest() {
        let err = ServiceError::aborted(ServiceError::aborted(conflict()));
        match err {
            ServiceError::TransactionAborted { cause } => {
                assert!(matches!(*cause, ServiceError::ConcurrencyConflict { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn classification() {
        assert_eq!(ServiceError::protocol("bad").kind(), FaultKind::Protocol);
        assert!(!ServiceError::protocol("bad").is_retryable());
        assert_eq!(
            ServiceError::not_modifiable("Person#age", "disabled").kind(),
            FaultKind::NotModifiable
        );
        assert_eq!(ServiceError::internal("oops").kind(), FaultKind::Internal);
        assert!(!ServiceError::internal("oops").to_fault().aborted);
    }
}

//! Member-level authorization.

use crate::error::{ServiceError, ServiceResult};
use crate::object::ObjectRef;
use objsync_protocol::Session;
use std::collections::HashSet;
use std::fmt;

/// Names one member of one type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberIdentifier {
    /// Owning type.
    pub type_name: String,
    /// Member or action id.
    pub member_id: String,
}

impl MemberIdentifier {
    /// Creates an identifier.
    pub fn new(type_name: impl Into<String>, member_id: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            member_id: member_id.into(),
        }
    }

    /// Parses `Type#member`, or a bare member id of `default_type`.
    pub fn parse(text: &str, default_type: &str) -> ServiceResult<Self> {
        let (type_name, member_id) = match text.split_once('#') {
            Some((type_name, member_id)) => (type_name, member_id),
            None => (default_type, text),
        };
        if type_name.is_empty() || member_id.is_empty() {
            return Err(ServiceError::protocol(format!("invalid member identifier {text:?}")));
        }
        Ok(Self::new(type_name, member_id))
    }
}

impl fmt::Display for MemberIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.type_name, self.member_id)
    }
}

/// Decides whether a session may see and use a member.
pub trait AuthorizationChecker: Send + Sync {
    /// Returns true if the member is visible.
    fn is_visible(&self, session: &Session, member: &MemberIdentifier, target: Option<&ObjectRef>) -> bool;

    /// Returns true if the member may be changed or invoked.
    fn is_usable(&self, session: &Session, member: &MemberIdentifier, target: Option<&ObjectRef>) -> bool;
}

/// Allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AuthorizationChecker for AllowAll {
    fn is_visible(&self, _: &Session, _: &MemberIdentifier, _: Option<&ObjectRef>) -> bool {
        true
    }

    fn is_usable(&self, _: &Session, _: &MemberIdentifier, _: Option<&ObjectRef>) -> bool {
        true
    }
}

/// Vetoes listed members, optionally only for some users.
#[derive(Debug, Clone, Default)]
pub struct RuleBasedAuthorization {
    hidden: HashSet<MemberIdentifier>,
    disabled: HashSet<MemberIdentifier>,
    disabled_for_user: HashSet<(String, MemberIdentifier)>,
}

impl RuleBasedAuthorization {
    /// Creates a checker with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hides a member from everyone. Hidden members are also unusable.
    #[must_use]
    pub fn hide(mut self, type_name: &str, member_id: &str) -> Self {
        self.hidden.insert(MemberIdentifier::new(type_name, member_id));
        self
    }

    /// Disables a member for everyone.
    #[must_use]
    pub fn disable(mut self, type_name: &str, member_id: &str) -> Self {
        self.disabled.insert(MemberIdentifier::new(type_name, member_id));
        self
    }

    /// Disables a member for one user.
    #[must_use]
    pub fn disable_for(mut self, user: &str, type_name: &str, member_id: &str) -> Self {
        self.disabled_for_user
            .insert((user.to_string(), MemberIdentifier::new(type_name, member_id)));
        self
    }
}

impl AuthorizationChecker for RuleBasedAuthorization {
    fn is_visible(&self, _: &Session, member: &MemberIdentifier, _: Option<&ObjectRef>) -> bool {
        !self.hidden.contains(member)
    }

    fn is_usable(&self, session: &Session, member: &MemberIdentifier, target: Option<&ObjectRef>) -> bool {
        self.is_visible(session, member, target)
            && !self.disabled.contains(member)
            && !self
                .disabled_for_user
                .contains(&(session.user.clone(), member.clone()))
    }
}

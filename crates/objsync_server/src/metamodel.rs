//! Member resolution capability and a registry-backed implementation.
//!
//! How members are discovered is up to the host: the service only needs a
//! [`MemberResolver`]. [`TypeRegistry`] is a resolver built from explicit
//! descriptors, used by embedded hosts and tests.

use crate::context::ActionContext;
use crate::error::{ServiceError, ServiceResult};
use crate::object::{FieldValue, ObjectRef, ScalarValue};
use objsync_protocol::ActionKind;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Capability of a member, selected by tag rather than by subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    /// Value type; supports set/clear value.
    Value,
    /// One-to-one association; supports set/clear association.
    Reference,
    /// One-to-many association; supports add/remove element.
    Collection,
}

impl MemberKind {
    /// Name used in error messages.
    pub fn describe(&self) -> &'static str {
        match self {
            MemberKind::Value => "value",
            MemberKind::Reference => "association",
            MemberKind::Collection => "collection",
        }
    }
}

/// Describes one member of a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberDescriptor {
    /// Member id.
    pub id: String,
    /// Capability tag.
    pub kind: MemberKind,
    /// Value type name, or referenced/element type name.
    pub type_name: String,
    /// Hidden members are never sent in complete graphs.
    pub hidden: bool,
}

impl MemberDescriptor {
    /// Creates a value member.
    pub fn value(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self::new(id, MemberKind::Value, type_name)
    }

    /// Creates a one-to-one association.
    pub fn reference(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self::new(id, MemberKind::Reference, type_name)
    }

    /// Creates a one-to-many association.
    pub fn collection(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self::new(id, MemberKind::Collection, type_name)
    }

    fn new(id: impl Into<String>, kind: MemberKind, type_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            type_name: type_name.into(),
            hidden: false,
        }
    }

    /// Marks the member hidden.
    #[must_use]
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }
}

/// Domain behaviour behind an action.
pub trait ActionInvoker: Send + Sync {
    /// Runs the action against `target`.
    fn invoke(
        &self,
        ctx: &mut ActionContext<'_, '_>,
        target: &ObjectRef,
        parameters: &[FieldValue],
    ) -> ServiceResult<FieldValue>;
}

impl<F> ActionInvoker for F
where
    F: Fn(&mut ActionContext<'_, '_>, &ObjectRef, &[FieldValue]) -> ServiceResult<FieldValue>
        + Send
        + Sync,
{
    fn invoke(
        &self,
        ctx: &mut ActionContext<'_, '_>,
        target: &ObjectRef,
        parameters: &[FieldValue],
    ) -> ServiceResult<FieldValue> {
        self(ctx, target, parameters)
    }
}

/// Describes an action of a type.
pub struct ActionDescriptor {
    /// Action id.
    pub id: String,
    /// Action category.
    pub kind: ActionKind,
    /// Declared parameter types, in order.
    pub parameter_types: Vec<String>,
    /// Declared return type; `None` for actions returning nothing.
    pub return_type: Option<String>,
    invoker: Arc<dyn ActionInvoker>,
}

impl ActionDescriptor {
    /// Creates an action descriptor.
    pub fn new(
        id: impl Into<String>,
        kind: ActionKind,
        parameter_types: Vec<String>,
        return_type: Option<String>,
        invoker: impl ActionInvoker + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            parameter_types,
            return_type,
            invoker: Arc::new(invoker),
        }
    }

    /// Runs the action.
    pub fn invoke(
        &self,
        ctx: &mut ActionContext<'_, '_>,
        target: &ObjectRef,
        parameters: &[FieldValue],
    ) -> ServiceResult<FieldValue> {
        self.invoker.invoke(ctx, target, parameters)
    }
}

impl fmt::Debug for ActionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDescriptor")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("parameter_types", &self.parameter_types)
            .field("return_type", &self.return_type)
            .finish_non_exhaustive()
    }
}

/// Describes a domain type.
#[derive(Debug, Default)]
pub struct TypeDescriptor {
    /// Type name.
    pub name: String,
    members: Vec<MemberDescriptor>,
    actions: Vec<Arc<ActionDescriptor>>,
}

impl TypeDescriptor {
    /// Creates a type with no members.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds a member.
    #[must_use]
    pub fn with_member(mut self, member: MemberDescriptor) -> Self {
        self.members.push(member);
        self
    }

    /// Adds an action.
    #[must_use]
    pub fn with_action(mut self, action: ActionDescriptor) -> Self {
        self.actions.push(Arc::new(action));
        self
    }

    /// Looks up a member by id.
    pub fn member(&self, member_id: &str) -> Option<&MemberDescriptor> {
        self.members.iter().find(|m| m.id == member_id)
    }

    /// Returns the members in declaration order.
    pub fn members(&self) -> &[MemberDescriptor] {
        &self.members
    }

    /// Returns the actions in declaration order.
    pub fn actions(&self) -> &[Arc<ActionDescriptor>] {
        &self.actions
    }
}

/// Converts a value type to and from its wire payload.
pub trait ValueCodec: Send + Sync {
    /// Parses a payload.
    fn decode(&self, payload: &str) -> ServiceResult<ScalarValue>;

    /// Renders a value as a payload.
    fn encode(&self, value: &ScalarValue) -> ServiceResult<String>;
}

impl fmt::Debug for dyn ValueCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueCodec").finish_non_exhaustive()
    }
}

/// Metamodel lookups the service depends on.
pub trait MemberResolver: Send + Sync {
    /// Looks up a type. Fails with `UnknownType`.
    fn type_by_name(&self, name: &str) -> ServiceResult<Arc<TypeDescriptor>>;

    /// Looks up a member of a type. Fails with `UnknownMember`.
    fn member_by_name<'t>(
        &self,
        ty: &'t TypeDescriptor,
        member_id: &str,
    ) -> ServiceResult<&'t MemberDescriptor> {
        ty.member(member_id)
            .ok_or_else(|| ServiceError::unknown_member(&ty.name, member_id))
    }

    /// Looks up an action by kind, id and parameter types. Fails with `UnknownAction`.
    fn action_by_name(
        &self,
        ty: &TypeDescriptor,
        kind: ActionKind,
        action_id: &str,
        parameter_types: &[String],
    ) -> ServiceResult<Arc<ActionDescriptor>> {
        ty.actions()
            .iter()
            .find(|a| a.id == action_id && a.kind == kind && a.parameter_types == parameter_types)
            .cloned()
            .ok_or_else(|| ServiceError::unknown_action(&ty.name, action_id))
    }

    /// Returns the codec of a value type. Fails with `UnknownType`.
    fn value_codec(&self, type_name: &str) -> ServiceResult<Arc<dyn ValueCodec>>;
}

fn bad_payload(type_name: &str, payload: &str) -> ServiceError {
    ServiceError::protocol(format!("invalid {type_name} payload: {payload:?}"))
}

fn wrong_scalar(type_name: &str, value: &ScalarValue) -> ServiceError {
    ServiceError::protocol(format!("cannot encode {value:?} as {type_name}"))
}

/// Codec for `int` values.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegerCodec;

impl ValueCodec for IntegerCodec {
    fn decode(&self, payload: &str) -> ServiceResult<ScalarValue> {
        payload
            .trim()
            .parse()
            .map(ScalarValue::Integer)
            .map_err(|_| bad_payload("int", payload))
    }

    fn encode(&self, value: &ScalarValue) -> ServiceResult<String> {
        match value {
            ScalarValue::Integer(n) => Ok(n.to_string()),
            other => Err(wrong_scalar("int", other)),
        }
    }
}

/// Codec for `string` values.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl ValueCodec for TextCodec {
    fn decode(&self, payload: &str) -> ServiceResult<ScalarValue> {
        Ok(ScalarValue::Text(payload.to_string()))
    }

    fn encode(&self, value: &ScalarValue) -> ServiceResult<String> {
        match value {
            ScalarValue::Text(text) => Ok(text.clone()),
            other => Err(wrong_scalar("string", other)),
        }
    }
}

/// Codec for `bool` values.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoolCodec;

impl ValueCodec for BoolCodec {
    fn decode(&self, payload: &str) -> ServiceResult<ScalarValue> {
        match payload {
            "true" => Ok(ScalarValue::Bool(true)),
            "false" => Ok(ScalarValue::Bool(false)),
            _ => Err(bad_payload("bool", payload)),
        }
    }

    fn encode(&self, value: &ScalarValue) -> ServiceResult<String> {
        match value {
            ScalarValue::Bool(b) => Ok(b.to_string()),
            other => Err(wrong_scalar("bool", other)),
        }
    }
}

/// Codec for `bytes` values, carried as lowercase hex.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl ValueCodec for BytesCodec {
    fn decode(&self, payload: &str) -> ServiceResult<ScalarValue> {
        if payload.len() % 2 != 0 || !payload.is_ascii() {
            return Err(bad_payload("bytes", payload));
        }
        (0..payload.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&payload[i..i + 2], 16))
            .collect::<Result<Vec<u8>, _>>()
            .map(ScalarValue::Bytes)
            .map_err(|_| bad_payload("bytes", payload))
    }

    fn encode(&self, value: &ScalarValue) -> ServiceResult<String> {
        match value {
            ScalarValue::Bytes(bytes) => Ok(bytes.iter().map(|b| format!("{b:02x}")).collect()),
            other => Err(wrong_scalar("bytes", other)),
        }
    }
}

/// A [`MemberResolver`] backed by registered descriptors.
///
/// The built-in value types `int`, `string`, `bool` and `bytes` are always
/// available.
pub struct TypeRegistry {
    types: HashMap<String, Arc<TypeDescriptor>>,
    codecs: HashMap<String, Arc<dyn ValueCodec>>,
}

impl TypeRegistry {
    /// Creates a registry with only the built-in value types.
    pub fn new() -> Self {
        let mut codecs: HashMap<String, Arc<dyn ValueCodec>> = HashMap::new();
        codecs.insert("int".into(), Arc::new(IntegerCodec));
        codecs.insert("string".into(), Arc::new(TextCodec));
        codecs.insert("bool".into(), Arc::new(BoolCodec));
        codecs.insert("bytes".into(), Arc::new(BytesCodec));
        Self {
            types: HashMap::new(),
            codecs,
        }
    }

    /// Registers a domain type.
    #[must_use]
    pub fn with_type(mut self, ty: TypeDescriptor) -> Self {
        self.types.insert(ty.name.clone(), Arc::new(ty));
        self
    }

    /// Registers a value type codec.
    #[must_use]
    pub fn with_codec(mut self, type_name: impl Into<String>, codec: impl ValueCodec + 'static) -> Self {
        self.codecs.insert(type_name.into(), Arc::new(codec));
        self
    }

    /// Returns the number of registered domain types.
    pub fn type_count(&self) -> usize {
        self.types.len()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemberResolver for TypeRegistry {
    fn type_by_name(&self, name: &str) -> ServiceResult<Arc<TypeDescriptor>> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::unknown_type(name))
    }

    fn value_codec(&self, type_name: &str) -> ServiceResult<Arc<dyn ValueCodec>> {
        self.codecs
            .get(type_name)
            .cloned()
            .ok_or_else(|| ServiceError::unknown_type(type_name))
    }
}

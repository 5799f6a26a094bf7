//! Error taxonomy for dispatch and administrative operations.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::table::EntryOrigin;
use crate::value::TypeId;

/// A resolution layer consulted while dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionLayer {
    Category,
    InstanceOverride,
    TypeTable,
    FullInterception,
    Field,
    Hook,
}

impl fmt::Display for ResolutionLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolutionLayer::Category => "category",
            ResolutionLayer::InstanceOverride => "instance override",
            ResolutionLayer::TypeTable => "type table",
            ResolutionLayer::FullInterception => "full interception",
            ResolutionLayer::Field => "field",
            ResolutionLayer::Hook => "missing-member hook",
        };
        f.write_str(name)
    }
}

struct Trail<'a>(&'a [ResolutionLayer]);

impl fmt::Display for Trail<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, layer) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{}", layer)?;
        }
        Ok(())
    }
}

/// No layer provided the member and no hook handled it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingMemberError {
    pub member_name: String,
    pub receiver_type: String,
    pub arg_types: Vec<String>,
    /// Whether the access was a property access.
    pub is_property: bool,
    /// Layers consulted, in order.
    pub trail: Vec<ResolutionLayer>,
}

impl fmt::Display for MissingMemberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = if self.is_property { "property" } else { "method" };
        write!(
            f,
            "no {} `{}` on `{}` for argument types ({}) [consulted: {}]",
            what,
            self.member_name,
            self.receiver_type,
            self.arg_types.join(", "),
            Trail(&self.trail)
        )
    }
}

impl std::error::Error for MissingMemberError {}

/// Two or more overloads are equally specific for the runtime argument types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmbiguousDispatchError {
    pub member_name: String,
    pub receiver_type: String,
    pub arg_types: Vec<String>,
    /// Rendered signatures of the tied candidates.
    pub candidates: Vec<String>,
    pub trail: Vec<ResolutionLayer>,
}

impl fmt::Display for AmbiguousDispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ambiguous call to `{}` on `{}` for argument types ({}): candidates {} [consulted: {}]",
            self.member_name,
            self.receiver_type,
            self.arg_types.join(", "),
            self.candidates.join(" | "),
            Trail(&self.trail)
        )
    }
}

impl std::error::Error for AmbiguousDispatchError {}

/// Error raised by an interceptor's `before` or `after`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("interceptor rejected `{member}`: {message}")]
pub struct InterceptorError {
    pub member: String,
    pub message: String,
}

impl InterceptorError {
    pub fn new(member: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            member: member.into(),
            message: message.into(),
        }
    }
}

/// Error raised by an implementation body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("`{member}` raised: {message}")]
pub struct RaisedError {
    pub member: String,
    pub message: String,
}

/// Errors returned by [`Dispatcher::dispatch`](crate::Dispatcher::dispatch).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("{0}")]
    MissingMember(MissingMemberError),

    #[error("{0}")]
    Ambiguous(AmbiguousDispatchError),

    /// Propagated exactly as the interceptor returned it.
    #[error(transparent)]
    Interceptor(#[from] InterceptorError),

    #[error(transparent)]
    Raised(#[from] RaisedError),

    #[error("dispatch of `{member}` exceeded the maximum nesting depth of {limit}")]
    DepthExceeded { member: String, limit: usize },
}

impl DispatchError {
    /// Error for an implementation body to return.
    pub fn raised(member: impl Into<String>, message: impl Into<String>) -> Self {
        DispatchError::Raised(RaisedError {
            member: member.into(),
            message: message.into(),
        })
    }

    /// The member name the failure is about.
    pub fn member_name(&self) -> &str {
        match self {
            DispatchError::MissingMember(e) => &e.member_name,
            DispatchError::Ambiguous(e) => &e.member_name,
            DispatchError::Interceptor(e) => &e.member,
            DispatchError::Raised(e) => &e.member,
            DispatchError::DepthExceeded { member, .. } => member,
        }
    }

    pub fn is_missing_member(&self) -> bool {
        matches!(self, DispatchError::MissingMember(_))
    }
}

/// A registration would replace an existing signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationConflictError {
    pub type_name: String,
    pub signature: String,
}

impl fmt::Display for RegistrationConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "`{}` already defines `{}` (register with overwrite allowed to replace it)",
            self.type_name, self.signature
        )
    }
}

impl std::error::Error for RegistrationConflictError {}

/// Errors from administrative registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("{0}")]
    Conflict(RegistrationConflictError),

    #[error("unknown type id {0:?}")]
    UnknownType(TypeId),

    #[error("type `{name}` is already declared with different supertypes")]
    Redeclared { name: String },

    #[error("cannot mix `{name}` into itself")]
    SelfMixin { name: String },
}

/// What kind of member collided during a mixin merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    Method,
    Property,
    Hook,
}

/// Non-fatal report of a mixin overriding an existing member (last wins).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixinConflictWarning {
    pub target: TypeId,
    pub source: TypeId,
    pub kind: ConflictKind,
    pub member: Arc<str>,
    pub params: Vec<TypeId>,
    /// Origin of the entry that was replaced.
    pub replaced: Option<EntryOrigin>,
}

impl fmt::Display for MixinConflictWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mixin {:?} -> {:?} replaces {:?} `{}`/{}",
            self.source,
            self.target,
            self.kind,
            self.member,
            self.params.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_member_message() {
        let err = MissingMemberError {
            member_name: "bark".to_string(),
            receiver_type: "Animal".to_string(),
            arg_types: vec!["Int".to_string(), "String".to_string()],
            is_property: false,
            trail: vec![ResolutionLayer::TypeTable, ResolutionLayer::Hook],
        };
        let msg = err.to_string();
        assert!(msg.contains("method `bark`"));
        assert!(msg.contains("`Animal`"));
        assert!(msg.contains("(Int, String)"));
        assert!(msg.contains("type table -> missing-member hook"));
    }

    #[test]
    fn test_interceptor_error_is_transparent() {
        let err = DispatchError::from(InterceptorError::new("speak", "denied"));
        assert_eq!(err.to_string(), "interceptor rejected `speak`: denied");
        assert_eq!(err.member_name(), "speak");
    }
}

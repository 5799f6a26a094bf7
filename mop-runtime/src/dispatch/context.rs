//! Call descriptors and the context handed to implementations.

use std::fmt;
use std::sync::Arc;

use crate::error::{DispatchError, ResolutionLayer};
use crate::value::{ObjectRef, TypeId, Value};

use super::{Dispatcher, Resolution};

/// What kind of member access a call is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberKind {
    Method,
    PropertyGet,
    PropertySet,
}

impl MemberKind {
    pub fn is_property(self) -> bool {
        !matches!(self, MemberKind::Method)
    }
}

/// How an implicit (receiver-less) call inside an implementation is resolved
/// between the owner and the delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResolutionMode {
    OwnerOnly,
    #[default]
    OwnerFirst,
    DelegateFirst,
    DelegateOnly,
}

/// Where a dynamic method or interceptor is attached.
#[derive(Debug, Clone)]
pub enum Target {
    Type(TypeId),
    Instance(ObjectRef),
}

/// A call site's request.
#[derive(Debug, Clone)]
pub struct CallDescriptor {
    pub receiver: Value,
    pub member: Arc<str>,
    pub args: Vec<Value>,
    pub kind: MemberKind,
    /// Compile-time argument types, if the caller knows them. Accepted for
    /// diagnostics only: resolution always ranks on runtime types.
    pub static_hints: Option<Vec<TypeId>>,
    pub delegate: Option<Value>,
    pub mode: ResolutionMode,
}

impl CallDescriptor {
    pub fn method(receiver: impl Into<Value>, member: &str, args: Vec<Value>) -> Self {
        Self::new(receiver.into(), member, args, MemberKind::Method)
    }

    pub fn property_get(receiver: impl Into<Value>, member: &str) -> Self {
        Self::new(receiver.into(), member, Vec::new(), MemberKind::PropertyGet)
    }

    pub fn property_set(receiver: impl Into<Value>, member: &str, value: impl Into<Value>) -> Self {
        Self::new(receiver.into(), member, vec![value.into()], MemberKind::PropertySet)
    }

    /// Descriptor for the flat `(receiver, name, args, is_property)` form:
    /// a property access with no argument is a get, otherwise a set.
    pub fn from_parts(receiver: Value, member: &str, args: Vec<Value>, is_property: bool) -> Self {
        let kind = match (is_property, args.is_empty()) {
            (false, _) => MemberKind::Method,
            (true, true) => MemberKind::PropertyGet,
            (true, false) => MemberKind::PropertySet,
        };
        Self::new(receiver, member, args, kind)
    }

    fn new(receiver: Value, member: &str, args: Vec<Value>, kind: MemberKind) -> Self {
        Self {
            receiver,
            member: Arc::from(member),
            args,
            kind,
            static_hints: None,
            delegate: None,
            mode: ResolutionMode::default(),
        }
    }

    pub fn with_static_hints(mut self, hints: Vec<TypeId>) -> Self {
        self.static_hints = Some(hints);
        self
    }

    pub fn with_delegate(mut self, delegate: impl Into<Value>, mode: ResolutionMode) -> Self {
        self.delegate = Some(delegate.into());
        self.mode = mode;
        self
    }

    /// Runtime types of the arguments.
    pub fn arg_types(&self) -> Vec<TypeId> {
        self.args.iter().map(Value::type_id).collect()
    }
}

/// Context an implementation runs in.
///
/// Carries the receiver explicitly; there is no ambient "current self".
/// Nested calls made through it count toward the dispatcher's depth limit
/// and see the same thread's active categories.
pub struct CallContext<'a> {
    pub(super) dispatcher: &'a Dispatcher,
    pub(super) receiver: Value,
    pub(super) delegate: Option<Value>,
    pub(super) mode: ResolutionMode,
    pub(super) member: Arc<str>,
    pub(super) layer: ResolutionLayer,
    pub(super) depth: usize,
}

impl<'a> CallContext<'a> {
    pub fn receiver(&self) -> &Value {
        &self.receiver
    }

    pub fn delegate(&self) -> Option<&Value> {
        self.delegate.as_ref()
    }

    pub fn mode(&self) -> ResolutionMode {
        self.mode
    }

    /// Name the caller asked for.
    pub fn member(&self) -> &str {
        &self.member
    }

    /// Layer that supplied the running implementation.
    pub fn layer(&self) -> ResolutionLayer {
        self.layer
    }

    /// Nesting depth; 0 for a top-level dispatch.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn dispatcher(&self) -> &'a Dispatcher {
        self.dispatcher
    }

    /// Nested method call.
    pub fn dispatch(
        &self,
        receiver: impl Into<Value>,
        member: &str,
        args: Vec<Value>,
    ) -> Result<Value, DispatchError> {
        self.nested(&CallDescriptor::method(receiver, member, args))
    }

    pub fn get_property(&self, receiver: impl Into<Value>, member: &str) -> Result<Value, DispatchError> {
        self.nested(&CallDescriptor::property_get(receiver, member))
    }

    pub fn set_property(
        &self,
        receiver: impl Into<Value>,
        member: &str,
        value: impl Into<Value>,
    ) -> Result<Value, DispatchError> {
        self.nested(&CallDescriptor::property_set(receiver, member, value))
    }

    /// Call `member` without naming a receiver, resolving against the
    /// receiver (owner) and delegate in the order the mode prescribes.
    ///
    /// Only a miss at the top of a candidate falls through to the next one;
    /// errors raised further down propagate.
    pub fn call_implicit(&self, member: &str, args: Vec<Value>) -> Result<Value, DispatchError> {
        let owner = Some(&self.receiver);
        let delegate = self.delegate.as_ref();
        let order = match self.mode {
            ResolutionMode::OwnerOnly => [owner, None],
            ResolutionMode::OwnerFirst => [owner, delegate],
            ResolutionMode::DelegateFirst => [delegate, owner],
            ResolutionMode::DelegateOnly => [delegate, None],
        };

        let mut first_miss = None;
        for receiver in order.into_iter().flatten() {
            let call = CallDescriptor::method(receiver.clone(), member, args.clone());
            match self.dispatcher.resolve_call(&call, self.depth + 1)? {
                Resolution::Value(value) => return Ok(value),
                Resolution::Missing(missing) => {
                    first_miss.get_or_insert(missing);
                }
            }
        }
        Err(match first_miss {
            Some(missing) => DispatchError::MissingMember(missing),
            // DelegateOnly without a delegate.
            None => DispatchError::MissingMember(self.dispatcher.missing_error(
                &CallDescriptor::method(self.receiver.clone(), member, args),
                Vec::new(),
            )),
        })
    }

    fn nested(&self, call: &CallDescriptor) -> Result<Value, DispatchError> {
        self.dispatcher.dispatch_at(call, self.depth + 1)
    }
}

impl fmt::Debug for CallContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("receiver", &self.receiver)
            .field("delegate", &self.delegate)
            .field("mode", &self.mode)
            .field("member", &self.member)
            .field("layer", &self.layer)
            .field("depth", &self.depth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_parts_kinds() {
        let get = CallDescriptor::from_parts(Value::Int(1), "size", vec![], true);
        assert_eq!(get.kind, MemberKind::PropertyGet);

        let set = CallDescriptor::from_parts(Value::Int(1), "size", vec![Value::Int(2)], true);
        assert_eq!(set.kind, MemberKind::PropertySet);

        let call = CallDescriptor::from_parts(Value::Int(1), "size", vec![], false);
        assert_eq!(call.kind, MemberKind::Method);
        assert!(!call.kind.is_property());
    }

    #[test]
    fn test_arg_types_are_runtime_types() {
        let call = CallDescriptor::method(Value::Null, "f", vec![Value::Int(1), Value::from("s")])
            .with_static_hints(vec![TypeId::OBJECT, TypeId::OBJECT]);
        assert_eq!(call.arg_types(), vec![TypeId::INT, TypeId::STRING]);
    }
}

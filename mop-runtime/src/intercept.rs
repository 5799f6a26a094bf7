//! Call interceptors.
//!
//! An interceptor wraps the invocation chosen by resolution. It can look at
//! the call, rewrite its arguments, suppress it with a substitute result and
//! rewrite the result. It cannot change the receiver: the context hands it
//! out by shared reference only.
//!
//! Interceptors attach to a type (covering its subtypes) or to a single
//! object. On a call the instance interceptor wins, then the interceptor of
//! the nearest type on the receiver's lineage.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::dispatch::{MemberKind, Target};
use crate::error::{InterceptorError, ResolutionLayer};
use crate::value::{ObjectId, TypeId, Value, WeakObject};

/// Decision returned by [`Interceptor::before`].
#[derive(Debug, Clone, PartialEq)]
pub enum BeforeOutcome {
    /// Invoke the implementation with the original arguments.
    Continue,
    /// Invoke the implementation with these arguments instead.
    ContinueWith(Vec<Value>),
    /// Skip the implementation; this value goes to `after` as the result.
    Suppress(Value),
}

/// Read-only view of an intercepted call.
#[derive(Debug)]
pub struct InvocationContext<'a> {
    pub receiver: &'a Value,
    pub receiver_type: TypeId,
    pub member: &'a str,
    pub args: &'a [Value],
    pub kind: MemberKind,
    /// Layer that supplied the implementation.
    pub layer: ResolutionLayer,
}

/// Before/after decoration of resolved calls.
pub trait Interceptor: Send + Sync {
    fn before(&self, _ctx: &InvocationContext<'_>) -> Result<BeforeOutcome, InterceptorError> {
        Ok(BeforeOutcome::Continue)
    }

    /// Sees the implementation's result (or the suppression value) and
    /// returns the final result. Not called when the implementation fails.
    fn after(&self, _ctx: &InvocationContext<'_>, result: Value) -> Result<Value, InterceptorError> {
        Ok(result)
    }
}

/// Installed interceptors, by type and by object.
#[derive(Default)]
pub(crate) struct InterceptorRegistry {
    by_type: RwLock<FxHashMap<TypeId, Arc<dyn Interceptor>>>,
    by_instance: DashMap<ObjectId, (WeakObject, Arc<dyn Interceptor>)>,
}

impl InterceptorRegistry {
    /// Install, returning the interceptor previously attached to `target`.
    pub(crate) fn install(
        &self,
        target: &Target,
        interceptor: Arc<dyn Interceptor>,
    ) -> Option<Arc<dyn Interceptor>> {
        match target {
            Target::Type(ty) => self.by_type.write().insert(*ty, interceptor),
            Target::Instance(object) => self
                .by_instance
                .insert(object.id(), (object.downgrade(), interceptor))
                .map(|(_, previous)| previous),
        }
    }

    pub(crate) fn uninstall(&self, target: &Target) -> Option<Arc<dyn Interceptor>> {
        match target {
            Target::Type(ty) => self.by_type.write().remove(ty),
            Target::Instance(object) => self
                .by_instance
                .remove(&object.id())
                .map(|(_, (_, previous))| previous),
        }
    }

    /// Drop instance interceptors whose object has died.
    pub(crate) fn purge(&self) -> usize {
        let before = self.by_instance.len();
        self.by_instance.retain(|_, (owner, _)| owner.is_alive());
        before.saturating_sub(self.by_instance.len())
    }

    /// Interceptor governing a call on `receiver`, whose lineage is given.
    pub(crate) fn resolve(
        &self,
        receiver: &Value,
        lineage: &[(TypeId, u32)],
    ) -> Option<Arc<dyn Interceptor>> {
        if let Value::Object(object) = receiver {
            if let Some(slot) = self.by_instance.get(&object.id()) {
                return Some(slot.1.clone());
            }
        }
        let by_type = self.by_type.read();
        if by_type.is_empty() {
            return None;
        }
        lineage
            .iter()
            .find_map(|(ty, _)| by_type.get(ty).cloned())
    }
}

/// One call seen by a [`TracingInterceptor`].
#[derive(Debug, Clone, PartialEq)]
pub struct InterceptedCall {
    pub receiver_type: TypeId,
    pub member: String,
    pub args: Vec<Value>,
}

/// Logs every call it wraps and keeps a record of them.
#[derive(Debug, Default)]
pub struct TracingInterceptor {
    calls: Mutex<Vec<InterceptedCall>>,
}

impl TracingInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<InterceptedCall> {
        self.calls.lock().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl Interceptor for TracingInterceptor {
    fn before(&self, ctx: &InvocationContext<'_>) -> Result<BeforeOutcome, InterceptorError> {
        debug!(
            receiver_type = ctx.receiver_type.0,
            member = ctx.member,
            args = ctx.args.len(),
            layer = %ctx.layer,
            "call"
        );
        self.calls.lock().push(InterceptedCall {
            receiver_type: ctx.receiver_type,
            member: ctx.member.to_string(),
            args: ctx.args.to_vec(),
        });
        Ok(BeforeOutcome::Continue)
    }

    fn after(&self, ctx: &InvocationContext<'_>, result: Value) -> Result<Value, InterceptorError> {
        debug!(member = ctx.member, result = %result, "return");
        Ok(result)
    }
}

//! The dispatcher: one resolution algorithm over every layer.
//!
//! # Resolution order
//!
//! 1. **Categories** active on the calling thread, newest frame first.
//! 2. **Instance override** fragment of the receiver object.
//! 3. **Full interception**: if the receiver's type chain declares
//!    `invokeMethod` / `getProperty` / `setProperty`, that override takes
//!    the call with `(name, args...)` and steps 4 to 6 are skipped.
//! 4. **Type tables** along the receiver's lineage, mixins included; a
//!    derived type's entry shadows an ancestor's identical signature.
//! 5. **Field** read or write on the receiver object (properties only).
//! 6. **Hooks**: `methodMissing` / `propertyMissing` from the same layers,
//!    called with `(name, args...)`.
//! 7. Otherwise a [`MissingMemberError`].
//!
//! A layer with no applicable candidate falls through. A layer with tied
//! candidates fails the call as ambiguous.

mod context;
mod resolver;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::category::{CategoryFrame, CategoryGuard, CategorySnapshot, CategoryStack};
use crate::config::RuntimeConfig;
use crate::error::{
    AmbiguousDispatchError, DispatchError, MissingMemberError, MixinConflictWarning,
    RegistryError, ResolutionLayer,
};
use crate::intercept::{BeforeOutcome, Interceptor, InterceptorRegistry, InvocationContext};
use crate::mixin::MixinMerger;
use crate::overrides::InstanceOverrideStore;
use crate::registry::TypeRegistry;
use crate::table::{HookKind, Implementation, InterceptionKind, MethodTable, Signature};
use crate::trace::{DispatchObserver, ObserverSet, TraceEvent};
use crate::value::{TypeId, Value};

pub use context::{CallContext, CallDescriptor, MemberKind, ResolutionMode, Target};
pub use resolver::{DispatchResult, MethodCandidate, OverloadResolver};

/// Outcome of a resolution that may legitimately miss.
pub(crate) enum Resolution {
    Value(Value),
    Missing(MissingMemberError),
}

/// Implementation chosen by one layer, with the type that declared it.
struct Selected {
    implementation: Implementation,
    declaring_type: TypeId,
}

/// Entry point of the runtime.
///
/// Owns the type registry, instance overrides, mixin records and
/// interceptors. Categories are per thread and per dispatcher.
pub struct Dispatcher {
    config: RuntimeConfig,
    registry: TypeRegistry,
    overrides: InstanceOverrideStore,
    mixins: MixinMerger,
    interceptors: InterceptorRegistry,
    categories: CategoryStack,
    observers: ObserverSet,
}

impl Dispatcher {
    pub fn new(config: RuntimeConfig) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            config,
            registry: TypeRegistry::new(),
            overrides: InstanceOverrideStore::new(),
            mixins: MixinMerger::new(),
            interceptors: InterceptorRegistry::default(),
            categories: CategoryStack::new(id),
            observers: ObserverSet::default(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn overrides(&self) -> &InstanceOverrideStore {
        &self.overrides
    }

    pub fn categories(&self) -> &CategoryStack {
        &self.categories
    }

    pub fn add_observer(&self, observer: Arc<dyn DispatchObserver>) {
        self.observers.add(observer);
    }

    // ---- types and tables ----

    pub fn declare_type(&self, name: &str, supertypes: &[TypeId]) -> Result<TypeId, RegistryError> {
        self.registry.declare(name, supertypes)
    }

    pub fn type_named(&self, name: &str) -> TypeId {
        self.registry.type_named(name)
    }

    pub fn register_native_method(
        &self,
        ty: TypeId,
        name: &str,
        param_types: &[TypeId],
        imp: Implementation,
        allow_overwrite: bool,
    ) -> Result<(), RegistryError> {
        self.registry.register(ty, name, param_types, imp, allow_overwrite)
    }

    /// Add a method at runtime to a type or to one object. An existing entry
    /// with the same signature is shadowed until the method is removed.
    pub fn add_dynamic_method(
        &self,
        target: &Target,
        name: &str,
        param_types: &[TypeId],
        imp: Implementation,
    ) -> Result<(), RegistryError> {
        match target {
            Target::Type(ty) => self.registry.add_dynamic(*ty, name, param_types, imp),
            Target::Instance(object) => {
                self.overrides.update(object, |fragment| {
                    fragment.insert_dynamic(Signature::new(name, param_types), imp)
                });
                Ok(())
            }
        }
    }

    /// Remove a dynamic method, restoring what it shadowed. Returns false
    /// when there was no dynamic method with that signature.
    pub fn remove_dynamic_method(
        &self,
        target: &Target,
        name: &str,
        param_types: &[TypeId],
    ) -> Result<bool, RegistryError> {
        match target {
            Target::Type(ty) => self.registry.remove_dynamic(*ty, name, param_types),
            Target::Instance(object) => {
                if self.overrides.get_override(object.id()).is_none() {
                    return Ok(false);
                }
                let signature = Signature::new(name, param_types);
                let removed = self
                    .overrides
                    .update(object, |fragment| fragment.remove_dynamic(&signature));
                if removed {
                    self.overrides.remove_if_empty(object.id());
                }
                Ok(removed)
            }
        }
    }

    pub fn register_property(
        &self,
        ty: TypeId,
        name: &str,
        getter: Option<Implementation>,
        setter: Option<Implementation>,
    ) -> Result<(), RegistryError> {
        self.registry.register_property(ty, name, getter, setter)
    }

    pub fn set_hook(&self, ty: TypeId, kind: HookKind, imp: Implementation) -> Result<(), RegistryError> {
        self.registry.set_hook(ty, kind, imp)
    }

    pub fn set_full_interception(
        &self,
        ty: TypeId,
        kind: InterceptionKind,
        imp: Option<Implementation>,
    ) -> Result<(), RegistryError> {
        self.registry.set_full_interception(ty, kind, imp)
    }

    /// Merge `source`'s own table into `target`'s. Conflicts are returned,
    /// traced and (per config) logged.
    pub fn install_mixin(
        &self,
        target: TypeId,
        source: TypeId,
    ) -> Result<Vec<MixinConflictWarning>, RegistryError> {
        let conflicts =
            self.mixins
                .install(&self.registry, target, source, self.config.log_mixin_conflicts)?;
        for warning in &conflicts {
            self.emit(|| TraceEvent::MixinConflict(warning.clone()));
        }
        Ok(conflicts)
    }

    pub fn mixins_of(&self, target: TypeId) -> Vec<TypeId> {
        self.mixins.mixins_of(target)
    }

    // ---- categories ----

    /// Activate a category frame on the calling thread until the guard drops.
    pub fn push_category(&self, frame: CategoryFrame) -> CategoryGuard {
        self.categories.push(frame)
    }

    /// Run `f` with `frame` active; the frame is popped however `f` exits.
    pub fn with_category<R>(&self, frame: CategoryFrame, f: impl FnOnce() -> R) -> R {
        let _guard = self.categories.push(frame);
        f()
    }

    /// Capture the calling thread's active categories.
    pub fn active_categories(&self) -> CategorySnapshot {
        self.categories.snapshot()
    }

    /// Run `f` with a captured set of categories active on this thread.
    pub fn with_categories<R>(&self, snapshot: &CategorySnapshot, f: impl FnOnce() -> R) -> R {
        self.categories.with_snapshot(snapshot, f)
    }

    // ---- interceptors ----

    /// Attach an interceptor, returning the one it replaces.
    pub fn install_interceptor(
        &self,
        target: &Target,
        interceptor: Arc<dyn Interceptor>,
    ) -> Option<Arc<dyn Interceptor>> {
        self.interceptors.install(target, interceptor)
    }

    /// Sweep per-object state (overrides and interceptors) left behind by
    /// dropped objects. Returns how many entries were removed.
    pub fn purge_dead(&self) -> usize {
        let removed = self.overrides.purge() + self.interceptors.purge();
        trace!(removed, "purged dead per-object entries");
        removed
    }

    pub fn uninstall_interceptor(&self, target: &Target) -> Option<Arc<dyn Interceptor>> {
        self.interceptors.uninstall(target)
    }

    /// Run `f` with `interceptor` attached to `target`, then put back
    /// whatever was attached before, however `f` exits.
    pub fn with_interceptor<R>(
        &self,
        target: Target,
        interceptor: Arc<dyn Interceptor>,
        f: impl FnOnce() -> R,
    ) -> R {
        let previous = self.interceptors.install(&target, interceptor);
        let _restore = RestoreInterceptor {
            interceptors: &self.interceptors,
            target,
            previous,
        };
        f()
    }

    // ---- dispatch ----

    /// Resolve and invoke `name` on `receiver`.
    ///
    /// With `is_property`, no argument reads the property and one argument
    /// writes it.
    pub fn dispatch(
        &self,
        receiver: impl Into<Value>,
        name: &str,
        args: Vec<Value>,
        is_property: bool,
    ) -> Result<Value, DispatchError> {
        self.dispatch_call(&CallDescriptor::from_parts(receiver.into(), name, args, is_property))
    }

    pub fn dispatch_call(&self, call: &CallDescriptor) -> Result<Value, DispatchError> {
        self.dispatch_at(call, 0)
    }

    pub(crate) fn dispatch_at(&self, call: &CallDescriptor, depth: usize) -> Result<Value, DispatchError> {
        match self.resolve_call(call, depth)? {
            Resolution::Value(value) => Ok(value),
            Resolution::Missing(missing) => Err(DispatchError::MissingMember(missing)),
        }
    }

    pub(crate) fn resolve_call(
        &self,
        call: &CallDescriptor,
        depth: usize,
    ) -> Result<Resolution, DispatchError> {
        if depth > self.config.max_dispatch_depth {
            return Err(DispatchError::DepthExceeded {
                member: call.member.to_string(),
                limit: self.config.max_dispatch_depth,
            });
        }

        let receiver_type = call.receiver.type_id();
        let lineage = self.registry.lineage(receiver_type);
        let arg_types = call.arg_types();
        let mut trail = Vec::new();
        trace!(member = %call.member, receiver = %self.registry.name_of(receiver_type), kind = ?call.kind, depth, "dispatch");

        // 1. categories
        let frames = self.categories.frames();
        if !frames.is_empty() {
            trail.push(ResolutionLayer::Category);
        }
        for (frame_index, frame) in frames.iter().enumerate() {
            for entry in frame.entries() {
                if !in_lineage(&lineage, entry.receiver) {
                    continue;
                }
                let tables = [(entry.receiver, &*entry.fragment)];
                if let Some(selected) = self.select(&tables, call, &arg_types, &trail)? {
                    trace!(member = %call.member, frame_index, "category hit");
                    self.emit(|| TraceEvent::CategoryHit {
                        member: call.member.clone(),
                        receiver_type,
                        frame_index,
                    });
                    return self.invoke(call, &selected.implementation, ResolutionLayer::Category, depth, &lineage, false);
                }
            }
        }

        // 2. instance override
        let object = call.receiver.as_object();
        let fragment = object.and_then(|object| self.overrides.get_override(object.id()));
        if let (Some(object), Some(fragment)) = (object, &fragment) {
            trail.push(ResolutionLayer::InstanceOverride);
            let tables = [(receiver_type, &**fragment)];
            if let Some(selected) = self.select(&tables, call, &arg_types, &trail)? {
                trace!(member = %call.member, object = %object.id(), "instance override hit");
                self.emit(|| TraceEvent::InstanceOverrideHit {
                    member: call.member.clone(),
                    object: object.id(),
                });
                return self.invoke(call, &selected.implementation, ResolutionLayer::InstanceOverride, depth, &lineage, false);
            }
        }

        let chain = self.registry.chain_tables(&lineage);
        let chain_refs: Vec<(TypeId, &MethodTable)> =
            chain.iter().map(|(ty, table)| (*ty, &**table)).collect();

        // 3. full interception
        let interception = match call.kind {
            MemberKind::Method => InterceptionKind::InvokeMethod,
            MemberKind::PropertyGet => InterceptionKind::GetProperty,
            MemberKind::PropertySet => InterceptionKind::SetProperty,
        };
        let routed = chain_refs
            .iter()
            .find_map(|(ty, table)| table.interception(interception).map(|imp| (*ty, imp)));
        if let Some((declaring_type, imp)) = routed {
            trail.push(ResolutionLayer::FullInterception);
            trace!(member = %call.member, declaring = %self.registry.name_of(declaring_type), "full interception");
            self.emit(|| TraceEvent::FullInterception {
                member: call.member.clone(),
                receiver_type,
                declaring_type,
            });
            return self.invoke(call, imp, ResolutionLayer::FullInterception, depth, &lineage, true);
        }

        // 4. type tables
        trail.push(ResolutionLayer::TypeTable);
        if let Some(selected) = self.select(&chain_refs, call, &arg_types, &trail)? {
            trace!(member = %call.member, declaring = %self.registry.name_of(selected.declaring_type), "type table hit");
            self.emit(|| TraceEvent::TypeTableHit {
                member: call.member.clone(),
                receiver_type,
                declaring_type: selected.declaring_type,
            });
            return self.invoke(call, &selected.implementation, ResolutionLayer::TypeTable, depth, &lineage, false);
        }

        // 5. plain fields
        if call.kind.is_property() && self.config.property_field_fallback {
            if let Some(object) = object {
                trail.push(ResolutionLayer::Field);
                let hit = match (call.kind, call.args.as_slice()) {
                    (MemberKind::PropertyGet, _) => object.field(&call.member),
                    (MemberKind::PropertySet, [value]) if object.has_field(&call.member) => {
                        object.set_field(call.member.to_string(), value.clone());
                        Some(Value::Null)
                    }
                    _ => None,
                };
                if let Some(value) = hit {
                    trace!(member = %call.member, object = %object.id(), "field access");
                    self.emit(|| TraceEvent::FieldAccess {
                        member: call.member.clone(),
                        object: object.id(),
                    });
                    return Ok(Resolution::Value(value));
                }
            }
        }

        // 6. missing-member hooks
        let hook_kind = if call.kind.is_property() {
            HookKind::PropertyMissing
        } else {
            HookKind::MethodMissing
        };
        trail.push(ResolutionLayer::Hook);
        let hook = frames
            .iter()
            .flat_map(|frame| frame.entries())
            .filter(|entry| in_lineage(&lineage, entry.receiver))
            .find_map(|entry| entry.fragment.hook(hook_kind).map(|imp| (imp, ResolutionLayer::Category)))
            .or_else(|| {
                fragment
                    .as_deref()
                    .and_then(|f| f.hook(hook_kind))
                    .map(|imp| (imp, ResolutionLayer::InstanceOverride))
            })
            .or_else(|| {
                chain_refs
                    .iter()
                    .find_map(|(_, table)| table.hook(hook_kind))
                    .map(|imp| (imp, ResolutionLayer::TypeTable))
            });
        if let Some((imp, layer)) = hook {
            trace!(member = %call.member, source = %layer, "missing-member hook");
            self.emit(|| TraceEvent::HookInvoked {
                member: call.member.clone(),
                kind: hook_kind,
                layer,
            });
            return self.invoke(call, imp, ResolutionLayer::Hook, depth, &lineage, true);
        }

        // 7. nothing
        trace!(member = %call.member, receiver = %self.registry.name_of(receiver_type), "missing member");
        self.emit(|| TraceEvent::MissingMember {
            member: call.member.clone(),
            receiver_type,
        });
        Ok(Resolution::Missing(self.missing_error(call, trail)))
    }

    /// Pick the implementation `tables` provide for `call`, if any.
    ///
    /// Methods are collected across all tables, earlier tables shadowing
    /// identical signatures in later ones, then ranked. Properties take the
    /// first table with the matching accessor.
    fn select(
        &self,
        tables: &[(TypeId, &MethodTable)],
        call: &CallDescriptor,
        arg_types: &[TypeId],
        trail: &[ResolutionLayer],
    ) -> Result<Option<Selected>, DispatchError> {
        match call.kind {
            MemberKind::Method => {
                let mut seen: Vec<&Signature> = Vec::new();
                let mut candidates = Vec::new();
                for (ty, table) in tables {
                    for entry in table.methods_named(&call.member) {
                        if entry.signature.arity() != arg_types.len() || seen.contains(&&entry.signature) {
                            continue;
                        }
                        seen.push(&entry.signature);
                        candidates.push(MethodCandidate::from_entry(entry, *ty));
                    }
                }
                if candidates.is_empty() {
                    return Ok(None);
                }

                match OverloadResolver::new(&self.registry).resolve(arg_types, candidates) {
                    DispatchResult::Resolved(winner) => Ok(Some(Selected {
                        implementation: winner.implementation,
                        declaring_type: winner.declaring_type,
                    })),
                    DispatchResult::NoMatch => Ok(None),
                    DispatchResult::Ambiguous(tied) => {
                        Err(DispatchError::Ambiguous(self.ambiguous_error(call, &tied, trail)))
                    }
                }
            }
            MemberKind::PropertyGet => Ok(tables.iter().find_map(|(ty, table)| {
                let getter = table.property(&call.member)?.getter.clone()?;
                Some(Selected {
                    implementation: getter,
                    declaring_type: *ty,
                })
            })),
            MemberKind::PropertySet => {
                if call.args.len() != 1 {
                    return Ok(None);
                }
                Ok(tables.iter().find_map(|(ty, table)| {
                    let setter = table.property(&call.member)?.setter.clone()?;
                    Some(Selected {
                        implementation: setter,
                        declaring_type: *ty,
                    })
                }))
            }
        }
    }

    /// Run an implementation, wrapped by the receiver's interceptor if any.
    ///
    /// With `routed`, the member name is passed as the first argument
    /// (hooks and full-interception overrides).
    fn invoke(
        &self,
        call: &CallDescriptor,
        imp: &Implementation,
        layer: ResolutionLayer,
        depth: usize,
        lineage: &[(TypeId, u32)],
        routed: bool,
    ) -> Result<Resolution, DispatchError> {
        let ctx = CallContext {
            dispatcher: self,
            receiver: call.receiver.clone(),
            delegate: call.delegate.clone(),
            mode: call.mode,
            member: call.member.clone(),
            layer,
            depth,
        };
        let run = |args: &[Value]| {
            if routed {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(Value::Str(call.member.clone()));
                full.extend_from_slice(args);
                imp.invoke(&ctx, &full)
            } else {
                imp.invoke(&ctx, args)
            }
        };

        let Some(interceptor) = self.interceptors.resolve(&call.receiver, lineage) else {
            return run(&call.args).map(Resolution::Value);
        };

        let view = InvocationContext {
            receiver: &call.receiver,
            receiver_type: call.receiver.type_id(),
            member: &call.member,
            args: &call.args,
            kind: call.kind,
            layer,
        };
        let result = match interceptor.before(&view)? {
            BeforeOutcome::Continue => run(&call.args)?,
            BeforeOutcome::ContinueWith(args) => run(&args)?,
            BeforeOutcome::Suppress(value) => {
                trace!(member = %call.member, "call suppressed by interceptor");
                value
            }
        };
        Ok(Resolution::Value(interceptor.after(&view, result)?))
    }

    pub(crate) fn missing_error(&self, call: &CallDescriptor, trail: Vec<ResolutionLayer>) -> MissingMemberError {
        MissingMemberError {
            member_name: call.member.to_string(),
            receiver_type: self.registry.name_of(call.receiver.type_id()).to_string(),
            arg_types: self.type_names(&call.arg_types()),
            is_property: call.kind.is_property(),
            trail,
        }
    }

    fn ambiguous_error(
        &self,
        call: &CallDescriptor,
        tied: &[MethodCandidate],
        trail: &[ResolutionLayer],
    ) -> AmbiguousDispatchError {
        AmbiguousDispatchError {
            member_name: call.member.to_string(),
            receiver_type: self.registry.name_of(call.receiver.type_id()).to_string(),
            arg_types: self.type_names(&call.arg_types()),
            candidates: tied
                .iter()
                .map(|c| {
                    format!(
                        "{}.{}",
                        self.registry.name_of(c.declaring_type),
                        self.registry.render_signature(&c.signature)
                    )
                })
                .collect(),
            trail: trail.to_vec(),
        }
    }

    fn type_names(&self, types: &[TypeId]) -> Vec<String> {
        types.iter().map(|t| self.registry.name_of(*t).to_string()).collect()
    }

    fn emit(&self, make: impl FnOnce() -> TraceEvent) {
        if self.config.emit_trace_events {
            self.observers.emit(make);
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("types", &self.registry.len())
            .field("overrides", &self.overrides.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn in_lineage(lineage: &[(TypeId, u32)], ty: TypeId) -> bool {
    lineage.iter().any(|(ancestor, _)| *ancestor == ty)
}

struct RestoreInterceptor<'a> {
    interceptors: &'a InterceptorRegistry,
    target: Target,
    previous: Option<Arc<dyn Interceptor>>,
}

impl Drop for RestoreInterceptor<'_> {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(previous) => {
                self.interceptors.install(&self.target, previous);
            }
            None => {
                self.interceptors.uninstall(&self.target);
            }
        }
    }
}

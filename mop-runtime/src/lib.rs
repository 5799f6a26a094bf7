//! Meta-object dispatch runtime.
//!
//! Resolves every method call and property access on a receiver through a
//! fixed stack of layers: thread-scoped categories, per-object overrides,
//! full-interception opt-ins, per-type method tables (with mixins merged
//! in) and missing-member hooks. Overloads are chosen by the runtime types
//! of all arguments. Interceptors can wrap whatever resolution picks.
//!
//! ```
//! use mop_runtime::{Dispatcher, Implementation, ObjectRef, Target, Value};
//!
//! let dispatcher = Dispatcher::default();
//! let animal = dispatcher.declare_type("Animal", &[]).unwrap();
//! dispatcher
//!     .register_native_method(animal, "speak", &[], Implementation::constant("..."), false)
//!     .unwrap();
//! dispatcher
//!     .add_dynamic_method(&Target::Type(animal), "speak", &[], Implementation::constant("Woof"))
//!     .unwrap();
//!
//! let rex = ObjectRef::new(animal);
//! assert_eq!(dispatcher.dispatch(rex, "speak", vec![], false).unwrap(), Value::from("Woof"));
//! ```

pub mod category;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod intercept;
pub mod mixin;
pub mod overrides;
pub mod registry;
pub mod table;
pub mod trace;
pub mod value;

pub use category::{CategoryEntry, CategoryFrame, CategoryGuard, CategorySnapshot, CategoryStack};
pub use config::{ConfigError, RuntimeConfig};
pub use dispatch::{
    CallContext, CallDescriptor, DispatchResult, Dispatcher, MemberKind, MethodCandidate,
    OverloadResolver, ResolutionMode, Target,
};
pub use error::{
    AmbiguousDispatchError, ConflictKind, DispatchError, InterceptorError, MissingMemberError,
    MixinConflictWarning, RaisedError, RegistrationConflictError, RegistryError, ResolutionLayer,
};
pub use intercept::{BeforeOutcome, InterceptedCall, Interceptor, InvocationContext, TracingInterceptor};
pub use mixin::MixinMerger;
pub use overrides::InstanceOverrideStore;
pub use registry::{TypeRegistry, NULL_DISTANCE};
pub use table::{
    CapturedEnv, EntryOrigin, HookKind, Implementation, InterceptionKind, MethodEntry, MethodTable,
    PropertyAccessors, Signature,
};
pub use trace::{DispatchObserver, RecordingObserver, TraceEvent};
pub use value::{Object, ObjectId, ObjectRef, TypeId, Value, WeakObject};

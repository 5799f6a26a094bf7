//! Resolution trace events and observers.
//!
//! The dispatcher fires one [`TraceEvent`] per resolution decision. Events
//! go to every registered [`DispatchObserver`]; they are only constructed
//! when at least one observer is registered and tracing is enabled in the
//! [`RuntimeConfig`](crate::RuntimeConfig).

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{MixinConflictWarning, ResolutionLayer};
use crate::table::HookKind;
use crate::value::{ObjectId, TypeId};

/// A single resolution decision.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    CategoryHit {
        member: Arc<str>,
        receiver_type: TypeId,
        /// 0 for the most recently pushed frame.
        frame_index: usize,
    },
    InstanceOverrideHit {
        member: Arc<str>,
        object: ObjectId,
    },
    TypeTableHit {
        member: Arc<str>,
        receiver_type: TypeId,
        declaring_type: TypeId,
    },
    FullInterception {
        member: Arc<str>,
        receiver_type: TypeId,
        declaring_type: TypeId,
    },
    FieldAccess {
        member: Arc<str>,
        object: ObjectId,
    },
    HookInvoked {
        member: Arc<str>,
        kind: HookKind,
        layer: ResolutionLayer,
    },
    MissingMember {
        member: Arc<str>,
        receiver_type: TypeId,
    },
    MixinConflict(MixinConflictWarning),
}

impl TraceEvent {
    /// Member the event is about.
    pub fn member(&self) -> &str {
        match self {
            TraceEvent::CategoryHit { member, .. }
            | TraceEvent::InstanceOverrideHit { member, .. }
            | TraceEvent::TypeTableHit { member, .. }
            | TraceEvent::FullInterception { member, .. }
            | TraceEvent::FieldAccess { member, .. }
            | TraceEvent::HookInvoked { member, .. }
            | TraceEvent::MissingMember { member, .. } => member,
            TraceEvent::MixinConflict(warning) => &warning.member,
        }
    }
}

/// Subscriber for trace events. Called synchronously on the dispatching thread.
pub trait DispatchObserver: Send + Sync {
    fn on_event(&self, event: &TraceEvent);
}

/// Observer that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<TraceEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the recorded events, oldest first.
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    /// Take the recorded events, leaving the log empty.
    pub fn drain(&self) -> Vec<TraceEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DispatchObserver for RecordingObserver {
    fn on_event(&self, event: &TraceEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Registered observers.
#[derive(Default)]
pub(crate) struct ObserverSet {
    observers: RwLock<Vec<Arc<dyn DispatchObserver>>>,
}

impl ObserverSet {
    pub(crate) fn add(&self, observer: Arc<dyn DispatchObserver>) {
        self.observers.write().push(observer);
    }

    /// Deliver the event built by `make`; `make` only runs when someone listens.
    pub(crate) fn emit(&self, make: impl FnOnce() -> TraceEvent) {
        let observers = self.observers.read();
        if observers.is_empty() {
            return;
        }
        let event = make();
        for observer in observers.iter() {
            observer.on_event(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_observers_skips_construction() {
        let set = ObserverSet::default();
        let mut built = false;
        set.emit(|| {
            built = true;
            TraceEvent::MissingMember {
                member: Arc::from("x"),
                receiver_type: TypeId::OBJECT,
            }
        });
        assert!(!built);
    }

    #[test]
    fn test_recording_observer() {
        let set = ObserverSet::default();
        let recorder = Arc::new(RecordingObserver::new());
        set.add(recorder.clone());

        set.emit(|| TraceEvent::MissingMember {
            member: Arc::from("bark"),
            receiver_type: TypeId::OBJECT,
        });

        let events = recorder.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].member(), "bark");
        assert!(recorder.is_empty());
    }
}

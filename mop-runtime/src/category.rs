//! Thread-confined category frames.
//!
//! A category is a set of table fragments that is active only for a
//! dynamic extent on one thread: pushed on scope entry, popped on scope
//! exit. Frames live in a thread-local stack keyed by the owning
//! dispatcher, so two dispatchers on the same thread never see each
//! other's categories and no other thread ever sees them at all.
//!
//! Pushing returns a [`CategoryGuard`]; dropping it pops the frame, which
//! covers normal returns, early returns and unwinding alike.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{trace, warn};

use crate::table::MethodTable;
use crate::value::TypeId;

thread_local! {
    static STACKS: RefCell<FxHashMap<u64, Vec<Arc<CategoryFrame>>>> =
        RefCell::new(FxHashMap::default());
}

/// A fragment applying to receivers assignable to `receiver`.
#[derive(Debug, Clone)]
pub struct CategoryEntry {
    pub receiver: TypeId,
    pub fragment: Arc<MethodTable>,
}

/// Ordered list of fragments pushed and popped as one unit.
#[derive(Debug, Clone, Default)]
pub struct CategoryFrame {
    name: Option<Arc<str>>,
    entries: Vec<CategoryEntry>,
}

impl CategoryFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame with a name used in trace output.
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(Arc::from(name)),
            entries: Vec::new(),
        }
    }

    /// Builder: add a fragment for receivers of type `receiver` (or subtypes).
    pub fn with(mut self, receiver: TypeId, fragment: MethodTable) -> Self {
        self.add(receiver, fragment);
        self
    }

    pub fn add(&mut self, receiver: TypeId, fragment: MethodTable) {
        self.entries.push(CategoryEntry {
            receiver,
            fragment: Arc::new(fragment),
        });
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Entries in declaration order (first match wins).
    pub fn entries(&self) -> &[CategoryEntry] {
        &self.entries
    }
}

/// Captured category stack, for handing the active categories to work that
/// continues elsewhere (another thread, a resumed continuation).
#[derive(Debug, Clone, Default)]
pub struct CategorySnapshot {
    frames: Vec<Arc<CategoryFrame>>,
}

impl CategorySnapshot {
    /// Number of frames captured.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Handle to the calling thread's category stack for one dispatcher.
#[derive(Debug)]
pub struct CategoryStack {
    owner: u64,
}

impl CategoryStack {
    pub(crate) fn new(owner: u64) -> Self {
        Self { owner }
    }

    /// Push a frame on the calling thread. The frame is popped when the
    /// returned guard is dropped or explicitly popped.
    pub fn push(&self, frame: CategoryFrame) -> CategoryGuard {
        self.push_shared(Arc::new(frame))
    }

    fn push_shared(&self, frame: Arc<CategoryFrame>) -> CategoryGuard {
        let depth = STACKS.with(|stacks| {
            let mut stacks = stacks.borrow_mut();
            let stack = stacks.entry(self.owner).or_default();
            trace!(frame = frame.name().unwrap_or("<anonymous>"), depth = stack.len() + 1, "push category");
            stack.push(frame.clone());
            stack.len()
        });
        CategoryGuard {
            owner: self.owner,
            frame,
            depth,
            released: false,
            _not_send: PhantomData,
        }
    }

    /// Active frames, most recently pushed first.
    pub fn frames(&self) -> Vec<Arc<CategoryFrame>> {
        STACKS.with(|stacks| {
            stacks
                .borrow()
                .get(&self.owner)
                .map(|stack| stack.iter().rev().cloned().collect())
                .unwrap_or_default()
        })
    }

    /// Number of active frames on the calling thread.
    pub fn depth(&self) -> usize {
        STACKS.with(|stacks| stacks.borrow().get(&self.owner).map_or(0, Vec::len))
    }

    pub fn snapshot(&self) -> CategorySnapshot {
        STACKS.with(|stacks| CategorySnapshot {
            frames: stacks
                .borrow()
                .get(&self.owner)
                .cloned()
                .unwrap_or_default(),
        })
    }

    /// Run `f` with the snapshot's frames pushed on top of the calling
    /// thread's stack, popping them afterwards on every exit path.
    pub fn with_snapshot<R>(&self, snapshot: &CategorySnapshot, f: impl FnOnce() -> R) -> R {
        let _guards = GuardSet(
            snapshot
                .frames
                .iter()
                .map(|frame| self.push_shared(frame.clone()))
                .collect(),
        );
        f()
    }
}

/// Pops a batch of guards innermost first.
struct GuardSet(Vec<CategoryGuard>);

impl Drop for GuardSet {
    fn drop(&mut self) {
        while let Some(guard) = self.0.pop() {
            guard.pop();
        }
    }
}

/// Pops its frame when dropped. Not `Send`: a frame must be popped on the
/// thread that pushed it.
#[must_use = "the category is popped as soon as the guard is dropped"]
#[derive(Debug)]
pub struct CategoryGuard {
    owner: u64,
    frame: Arc<CategoryFrame>,
    depth: usize,
    released: bool,
    _not_send: PhantomData<*const ()>,
}

impl CategoryGuard {
    /// Pop the frame now.
    pub fn pop(mut self) {
        self.release();
    }

    /// Stack depth this guard's frame occupied when pushed.
    pub fn depth(&self) -> usize {
        self.depth
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        // `try_with` tolerates guards dropped during thread-local teardown.
        let _ = STACKS.try_with(|stacks| {
            let mut stacks = stacks.borrow_mut();
            let Some(stack) = stacks.get_mut(&self.owner) else {
                return;
            };
            // Only this guard's frame goes; frames of guards still alive stay.
            let Some(index) = stack.iter().rposition(|frame| Arc::ptr_eq(frame, &self.frame)) else {
                return;
            };
            if index + 1 != stack.len() {
                warn!(
                    frame = self.frame.name().unwrap_or("<anonymous>"),
                    position = index + 1,
                    depth = stack.len(),
                    "category popped out of order"
                );
            }
            stack.remove(index);
            trace!(depth = stack.len(), "pop category");
            if stack.is_empty() {
                stacks.remove(&self.owner);
            }
        });
    }
}

impl Drop for CategoryGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Implementation;

    fn frame(tag: &str) -> CategoryFrame {
        CategoryFrame::named(tag).with(
            TypeId::OBJECT,
            MethodTable::new().with_method(tag, vec![], Implementation::constant(tag)),
        )
    }

    #[test]
    fn test_push_pop_lifo() {
        let stack = CategoryStack::new(1);
        assert_eq!(stack.depth(), 0);

        let outer = stack.push(frame("outer"));
        let inner = stack.push(frame("inner"));
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.frames()[0].name(), Some("inner"));

        inner.pop();
        assert_eq!(stack.depth(), 1);
        drop(outer);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_pop_on_panic() {
        let stack = CategoryStack::new(2);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = stack.push(frame("doomed"));
            assert_eq!(stack.depth(), 1);
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_stacks_isolated_per_owner() {
        let a = CategoryStack::new(10);
        let b = CategoryStack::new(11);
        let _guard = a.push(frame("a"));
        assert_eq!(a.depth(), 1);
        assert_eq!(b.depth(), 0);
    }

    #[test]
    fn test_not_visible_on_other_threads() {
        let stack = CategoryStack::new(20);
        let _guard = stack.push(frame("local"));
        let seen = std::thread::spawn(|| CategoryStack::new(20).depth())
            .join()
            .unwrap();
        assert_eq!(seen, 0);
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_snapshot_replayed_on_other_thread() {
        let stack = CategoryStack::new(30);
        let _guard = stack.push(frame("carried"));
        let snapshot = stack.snapshot();
        assert_eq!(snapshot.depth(), 1);

        let (inside, after) = std::thread::spawn(move || {
            let remote = CategoryStack::new(30);
            let inside = remote.with_snapshot(&snapshot, || remote.depth());
            (inside, remote.depth())
        })
        .join()
        .unwrap();

        assert_eq!(inside, 1);
        assert_eq!(after, 0);
    }

    #[test]
    fn test_out_of_order_pop_keeps_live_frames() {
        let stack = CategoryStack::new(40);
        let outer = stack.push(frame("outer"));
        let inner = stack.push(frame("inner"));

        drop(outer);
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.frames()[0].name(), Some("inner"));

        drop(inner);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_replayed_frame_pops_topmost_copy() {
        let stack = CategoryStack::new(41);
        let _outer = stack.push(frame("shared"));
        let snapshot = stack.snapshot();

        let inside = stack.with_snapshot(&snapshot, || stack.depth());
        assert_eq!(inside, 2);
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.frames()[0].name(), Some("shared"));
    }
}

// Stack/frame introspection and identity resolution.
//
// Both are implemented by the runtime. The production adapters here are
// what a runtime without a stack walker or handle table falls back to: no
// frames, and identity references handed out from a counter.

use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::interfaces::ThreadRef;
use crate::payload::{ClassHandle, ExternalRef, Handle, Location, MethodHandle, ObjectHandle};

/// Where a thrown exception will be caught.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchSite {
    pub method: MethodHandle,
    pub location: Location,
}

/// Stack/frame introspection.
///
/// Must be callable from inside a safe-call transition.
pub trait StackIntrospection: Send + Sync + 'static {
    /// Number of frames on the thread's stack.
    fn frame_depth(&self, thread: &ThreadRef) -> i32;

    /// Search the stack for a handler of `exception`.
    ///
    /// The search may itself raise events on `thread` (class loading while
    /// resolving handler types); the caller hides them.
    fn find_exception_handler(
        &self,
        thread: &ThreadRef,
        exception: ObjectHandle,
    ) -> Option<CatchSite>;
}

/// Adapter for threads with no introspectable stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedStack;

impl StackIntrospection for DetachedStack {
    fn frame_depth(&self, _thread: &ThreadRef) -> i32 {
        0
    }

    fn find_exception_handler(
        &self,
        _thread: &ThreadRef,
        _exception: ObjectHandle,
    ) -> Option<CatchSite> {
        None
    }
}

/// Class/method/object identity resolution.
pub trait IdentityResolver: Send + Sync + 'static {
    /// Create an agent-visible reference valid until `release_local`.
    fn make_local(&self, handle: Handle) -> ExternalRef;

    fn release_local(&self, reference: ExternalRef);

    fn class_of(&self, object: ObjectHandle) -> ClassHandle;

    /// Class mirrors are never reported as VM object allocations.
    fn is_class_mirror(&self, object: ObjectHandle) -> bool;

    fn object_size(&self, object: ObjectHandle) -> u64;

    /// Whether a buffered object can still be reported.
    fn is_alive(&self, object: ObjectHandle) -> bool;
}

/// Resolver handing out sequential references and counting live ones.
///
/// # Examples
///
/// ```
/// use vigil::interfaces::{CountingResolver, IdentityResolver};
/// use vigil::payload::{Handle, ObjectHandle};
///
/// let resolver = CountingResolver::new();
/// let r = resolver.make_local(Handle::Object(ObjectHandle(1)));
/// assert_eq!(resolver.live_locals(), 1);
/// resolver.release_local(r);
/// assert_eq!(resolver.live_locals(), 0);
/// ```
#[derive(Debug, Default)]
pub struct CountingResolver {
    next: AtomicU64,
    live: AtomicUsize,
    classes: DashMap<ObjectHandle, ClassHandle>,
    dead: DashSet<ObjectHandle>,
}

impl CountingResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// References created and not yet released.
    pub fn live_locals(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Record the class of an object so `class_of` can answer for it.
    pub fn set_class(&self, object: ObjectHandle, class: ClassHandle) {
        self.classes.insert(object, class);
    }

    /// Make `is_alive` answer false for `object` from now on.
    pub fn mark_dead(&self, object: ObjectHandle) {
        self.dead.insert(object);
    }
}

impl IdentityResolver for CountingResolver {
    fn make_local(&self, _handle: Handle) -> ExternalRef {
        self.live.fetch_add(1, Ordering::AcqRel);
        ExternalRef(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn release_local(&self, _reference: ExternalRef) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    fn class_of(&self, object: ObjectHandle) -> ClassHandle {
        self.classes
            .get(&object)
            .map(|c| *c.value())
            .unwrap_or(ClassHandle(0))
    }

    fn is_class_mirror(&self, _object: ObjectHandle) -> bool {
        false
    }

    fn object_size(&self, _object: ObjectHandle) -> u64 {
        0
    }

    fn is_alive(&self, object: ObjectHandle) -> bool {
        !self.dead.contains(&object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_stack_reports_no_frames() {
        let t = ThreadRef::managed(1);
        assert_eq!(DetachedStack.frame_depth(&t), 0);
        assert_eq!(DetachedStack.find_exception_handler(&t, ObjectHandle(1)), None);
    }

    #[test]
    fn resolver_tracks_classes() {
        let resolver = CountingResolver::new();
        resolver.set_class(ObjectHandle(5), ClassHandle(9));
        assert_eq!(resolver.class_of(ObjectHandle(5)), ClassHandle(9));
        assert_eq!(resolver.class_of(ObjectHandle(6)), ClassHandle(0));
    }

    #[test]
    fn resolver_reports_marked_objects_dead() {
        let resolver = CountingResolver::new();
        assert!(resolver.is_alive(ObjectHandle(1)));
        resolver.mark_dead(ObjectHandle(1));
        assert!(!resolver.is_alive(ObjectHandle(1)));
        assert!(resolver.is_alive(ObjectHandle(2)));
    }

    #[test]
    fn resolver_hands_out_distinct_refs() {
        let resolver = CountingResolver::new();
        let a = resolver.make_local(Handle::Class(ClassHandle(1)));
        let b = resolver.make_local(Handle::Class(ClassHandle(1)));
        assert_ne!(a, b);
        assert_eq!(resolver.live_locals(), 2);
    }
}

//! Per-thread event state.
//!
//! Created lazily when a thread first raises an event that passes the fast
//! enablement check, reaped when the thread ends. Almost everything in here
//! is only touched by the owning thread. The exceptions are the enablement
//! view, which enablement writers recompute, and the per-environment vector,
//! which writers and teardown lock.

mod env_thread;
mod table;

pub use env_thread::{EnvThreadState, LocationGate};
pub use table::{DEFAULT_REAPED_RETENTION, ThreadTable};

use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, Ordering};

use crate::collector::CollectorSlots;
use crate::environment::EnvironmentId;
use crate::event::{AtomicEventSet, EventKind, EventSet};
use crate::interfaces::{StackIntrospection, ThreadRef};

const UNKNOWN_DEPTH: i32 = -1;

/// Exception lifecycle on a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ExceptionState {
    #[default]
    Cleared = 0,
    /// Throw observed, not yet caught
    Detected = 1,
    /// Catch observed for the detected exception
    Caught = 2,
}

impl ExceptionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ExceptionState::Detected,
            2 => ExceptionState::Caught,
            _ => ExceptionState::Cleared,
        }
    }
}

/// Event bookkeeping for one runtime thread.
pub struct ThreadEventState {
    thread: ThreadRef,
    /// Kinds some environment wants from this thread
    enabled: AtomicEventSet,
    interp_only: AtomicBool,
    envs: Mutex<Vec<EnvThreadState>>,
    exception: AtomicU8,
    stack_depth: AtomicI32,
    single_step_hidden: AtomicBool,
    hidden_events: AtomicU32,
    agent_depth: AtomicU32,
    collectors: Mutex<CollectorSlots>,
    terminated: AtomicBool,
}

impl ThreadEventState {
    pub(crate) fn new(thread: ThreadRef) -> Self {
        Self {
            thread,
            enabled: AtomicEventSet::new(),
            interp_only: AtomicBool::new(false),
            envs: Mutex::new(Vec::new()),
            exception: AtomicU8::new(ExceptionState::Cleared as u8),
            stack_depth: AtomicI32::new(UNKNOWN_DEPTH),
            single_step_hidden: AtomicBool::new(false),
            hidden_events: AtomicU32::new(0),
            agent_depth: AtomicU32::new(0),
            collectors: Mutex::new(CollectorSlots::default()),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn thread(&self) -> ThreadRef {
        self.thread
    }

    #[inline(always)]
    pub fn is_enabled(&self, kind: EventKind) -> bool {
        self.enabled.contains(kind)
    }

    pub fn enabled_events(&self) -> EventSet {
        self.enabled.load()
    }

    /// Publish a recomputed view. Returns `Some(new_mode)` if interpreter-only
    /// mode flipped.
    pub(crate) fn publish_view(&self, view: EventSet) -> Option<bool> {
        self.enabled.store(view);
        let interp = !view.intersection(EventSet::interp_only()).is_empty();
        let previous = self.interp_only.swap(interp, Ordering::AcqRel);
        (previous != interp).then_some(interp)
    }

    /// Whether the thread must run interpreted so that step, method entry,
    /// method exit and frame pop events can be produced.
    #[inline]
    pub fn is_interp_only(&self) -> bool {
        self.interp_only.load(Ordering::Acquire)
    }

    /// Run `f` on this thread's state for `env`, creating it if needed.
    pub(crate) fn with_env<R>(
        &self,
        env: EnvironmentId,
        f: impl FnOnce(&mut EnvThreadState) -> R,
    ) -> R {
        let mut envs = self.envs.lock();
        if envs.len() <= env.index() {
            envs.resize_with(env.index() + 1, EnvThreadState::default);
        }
        f(&mut envs[env.index()])
    }

    pub(crate) fn lock_envs(&self) -> MutexGuard<'_, Vec<EnvThreadState>> {
        self.envs.lock()
    }

    /// Kinds `env` enabled for this thread only.
    pub fn env_enabled(&self, env: EnvironmentId) -> EventSet {
        self.envs
            .lock()
            .get(env.index())
            .map(EnvThreadState::enabled)
            .unwrap_or_default()
    }

    /// Clone of the per-environment state, for inspection.
    pub fn env_state(&self, env: EnvironmentId) -> Option<EnvThreadState> {
        self.envs.lock().get(env.index()).cloned()
    }

    pub fn exception_state(&self) -> ExceptionState {
        ExceptionState::from_u8(self.exception.load(Ordering::Acquire))
    }

    pub(crate) fn set_exception_state(&self, state: ExceptionState) {
        self.exception.store(state as u8, Ordering::Release);
    }

    pub fn is_exception_detected(&self) -> bool {
        self.exception_state() == ExceptionState::Detected
    }

    pub fn is_exception_caught(&self) -> bool {
        self.exception_state() == ExceptionState::Caught
    }

    /// Interpreter frame depth, recomputed from the stack if invalidated.
    pub fn cur_stack_depth(&self, stack: &dyn StackIntrospection) -> i32 {
        let depth = self.stack_depth.load(Ordering::Relaxed);
        if depth != UNKNOWN_DEPTH {
            return depth;
        }
        let depth = stack.frame_depth(&self.thread);
        self.stack_depth.store(depth, Ordering::Relaxed);
        depth
    }

    pub(crate) fn incr_stack_depth(&self) {
        let depth = self.stack_depth.load(Ordering::Relaxed);
        if depth != UNKNOWN_DEPTH {
            self.stack_depth.store(depth + 1, Ordering::Relaxed);
        }
    }

    pub(crate) fn decr_stack_depth(&self) {
        let depth = self.stack_depth.load(Ordering::Relaxed);
        if depth > 0 {
            self.stack_depth.store(depth - 1, Ordering::Relaxed);
        }
    }

    /// Forget the cached depth; the next reader asks the stack.
    pub fn invalidate_stack_depth(&self) {
        self.stack_depth.store(UNKNOWN_DEPTH, Ordering::Relaxed);
    }

    pub(crate) fn set_single_step_hidden(&self, hidden: bool) {
        self.single_step_hidden.store(hidden, Ordering::Release);
    }

    pub fn is_single_step_hidden(&self) -> bool {
        self.single_step_hidden.load(Ordering::Acquire)
    }

    /// Suppress every event raised on this thread until the guard drops.
    pub fn hide_events(self: &Arc<Self>) -> EventHidingGuard {
        self.hidden_events.fetch_add(1, Ordering::AcqRel);
        EventHidingGuard {
            state: Arc::clone(self),
        }
    }

    #[inline]
    pub fn events_hidden(&self) -> bool {
        self.hidden_events.load(Ordering::Acquire) > 0
    }

    pub(crate) fn enter_agent(&self) -> u32 {
        self.agent_depth.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn leave_agent(&self) {
        self.agent_depth.fetch_sub(1, Ordering::AcqRel);
    }

    /// Number of agent callbacks currently on this thread's stack.
    pub fn agent_depth(&self) -> u32 {
        self.agent_depth.load(Ordering::Acquire)
    }

    pub(crate) fn collectors(&self) -> MutexGuard<'_, CollectorSlots> {
        self.collectors.lock()
    }

    pub(crate) fn mark_terminated(&self) {
        self.terminated.store(true, Ordering::Release);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ThreadEventState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadEventState")
            .field("thread", &self.thread)
            .field("enabled", &self.enabled)
            .field("interp_only", &self.is_interp_only())
            .field("exception", &self.exception_state())
            .field("agent_depth", &self.agent_depth())
            .finish_non_exhaustive()
    }
}

/// Scope during which a thread posts no events.
#[must_use = "events are only hidden while the guard is alive"]
pub struct EventHidingGuard {
    state: Arc<ThreadEventState>,
}

impl Drop for EventHidingGuard {
    fn drop(&mut self) {
        self.state.hidden_events.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::CatchSite;
    use crate::payload::ObjectHandle;

    struct FixedDepth(i32);

    impl StackIntrospection for FixedDepth {
        fn frame_depth(&self, _thread: &ThreadRef) -> i32 {
            self.0
        }

        fn find_exception_handler(
            &self,
            _thread: &ThreadRef,
            _exception: ObjectHandle,
        ) -> Option<CatchSite> {
            None
        }
    }

    #[test]
    fn stack_depth_is_lazily_recomputed() {
        let state = ThreadEventState::new(ThreadRef::managed(1));
        // Unknown depth is not adjusted
        state.incr_stack_depth();
        assert_eq!(state.cur_stack_depth(&FixedDepth(3)), 3);
        state.incr_stack_depth();
        assert_eq!(state.cur_stack_depth(&FixedDepth(99)), 4);
        state.decr_stack_depth();
        state.invalidate_stack_depth();
        assert_eq!(state.cur_stack_depth(&FixedDepth(7)), 7);
    }

    #[test]
    fn interp_only_follows_view() {
        let state = ThreadEventState::new(ThreadRef::managed(1));
        let mut view = EventSet::EMPTY;
        view.insert(EventKind::ClassLoad);
        assert_eq!(state.publish_view(view), None);
        view.insert(EventKind::SingleStep);
        assert_eq!(state.publish_view(view), Some(true));
        assert!(state.is_interp_only());
        assert_eq!(state.publish_view(EventSet::EMPTY), Some(false));
    }

    #[test]
    fn hiding_guards_nest() {
        let state = Arc::new(ThreadEventState::new(ThreadRef::managed(1)));
        let outer = state.hide_events();
        {
            let _inner = state.hide_events();
            assert!(state.events_hidden());
        }
        assert!(state.events_hidden());
        drop(outer);
        assert!(!state.events_hidden());
    }

    #[test]
    fn env_state_grows_on_demand() {
        let state = ThreadEventState::new(ThreadRef::managed(1));
        assert!(state.env_state(EnvironmentId(2)).is_none());
        state.with_env(EnvironmentId(2), |ets| ets.enabled.insert(EventKind::Breakpoint));
        assert!(state.env_enabled(EnvironmentId(2)).contains(EventKind::Breakpoint));
        assert!(state.env_enabled(EnvironmentId(0)).is_empty());
    }
}

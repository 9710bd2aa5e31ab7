//! Safe-call transition around every agent callback.
//!
//! A [`SafeCallTransition`] is entered once per environment per dispatch and
//! undone by `Drop`, so every exit path (normal return, agent fault, panic
//! inside the callback) restores exactly what was saved. Transitions nest by
//! plain stack discipline when a callback raises further events.

use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::environment::{Environment, EnvironmentId, EventCallback};
use crate::event::EventKind;
use crate::interfaces::{
    Collaborators, ContextToken, ExecutionContextSwitch, IdentityResolver, ThreadRef,
};
use crate::payload::{EventPayload, ExternalRef, Handle};
use crate::stats::EventCounters;
use crate::thread_state::{ExceptionState, ThreadEventState};

/// Agent-visible references created for one callback.
///
/// Every reference handed out is released when the scope ends.
pub struct ResourceScope<'a> {
    resolver: &'a dyn IdentityResolver,
    refs: RefCell<Vec<ExternalRef>>,
}

impl<'a> ResourceScope<'a> {
    fn new(resolver: &'a dyn IdentityResolver) -> Self {
        Self {
            resolver,
            refs: RefCell::new(Vec::new()),
        }
    }

    pub fn local_ref(&self, handle: Handle) -> ExternalRef {
        let reference = self.resolver.make_local(handle);
        self.refs.borrow_mut().push(reference);
        reference
    }

    /// References currently held by this scope.
    pub fn len(&self) -> usize {
        self.refs.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self) {
        for reference in self.refs.borrow_mut().drain(..).rev() {
            self.resolver.release_local(reference);
        }
    }
}

impl Drop for ResourceScope<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// What a callback sees of one event.
pub struct EventContext<'a> {
    env: &'a Environment,
    kind: EventKind,
    thread: ThreadRef,
    thread_ref: ExternalRef,
    payload: &'a EventPayload,
    scope: &'a ResourceScope<'a>,
    state: &'a ThreadEventState,
}

impl<'a> EventContext<'a> {
    pub fn env(&self) -> &Environment {
        self.env
    }

    pub fn env_id(&self) -> EnvironmentId {
        self.env.id()
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn thread(&self) -> ThreadRef {
        self.thread
    }

    /// Agent-visible reference to the posting thread.
    pub fn thread_ref(&self) -> ExternalRef {
        self.thread_ref
    }

    pub fn payload(&self) -> &EventPayload {
        self.payload
    }

    /// Expose a runtime entity to the agent for the rest of this callback.
    pub fn local_ref(&self, handle: Handle) -> ExternalRef {
        self.scope.local_ref(handle)
    }

    /// References currently held for this callback.
    pub fn live_refs(&self) -> usize {
        self.scope.len()
    }

    /// Nesting depth of agent callbacks on this thread, this one included.
    pub fn agent_depth(&self) -> u32 {
        self.state.agent_depth()
    }
}

impl std::fmt::Debug for EventContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventContext")
            .field("env", &self.env.id())
            .field("kind", &self.kind)
            .field("thread", &self.thread)
            .field("payload", self.payload)
            .finish()
    }
}

/// Scoped save/restore around one agent callback.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use vigil::interfaces::{Collaborators, CountingResolver, ThreadRef};
/// use vigil::test_utils::TestFixture;
/// use vigil::thread_state::ExceptionState;
/// use vigil::transition::SafeCallTransition;
///
/// let resolver = Arc::new(CountingResolver::new());
/// let fixture = TestFixture::with_collaborators(
///     Collaborators::default().with_identity(resolver.clone()),
/// );
/// let state = fixture.system.state_for(ThreadRef::managed(1));
///
/// {
///     let transition = SafeCallTransition::enter(&state, fixture.system.collaborators());
///     assert_eq!(state.agent_depth(), 1);
///     assert!(resolver.live_locals() > 0);
///     drop(transition);
/// }
/// assert_eq!(state.agent_depth(), 0);
/// assert_eq!(resolver.live_locals(), 0);
/// assert_eq!(state.exception_state(), ExceptionState::Cleared);
/// ```
pub struct SafeCallTransition<'a> {
    state: &'a ThreadEventState,
    thread: ThreadRef,
    context: &'a dyn ExecutionContextSwitch,
    saved_exception: ExceptionState,
    token: Option<ContextToken>,
    thread_ref: ExternalRef,
    scope: ResourceScope<'a>,
}

impl<'a> SafeCallTransition<'a> {
    pub fn enter(state: &'a ThreadEventState, collaborators: &'a Collaborators) -> Self {
        let thread = state.thread();
        let saved_exception = state.exception_state();
        state.enter_agent();
        let scope = ResourceScope::new(collaborators.identity.as_ref());
        let thread_ref = scope.local_ref(Handle::Thread(thread.key));
        let context = collaborators.context.as_ref();
        let token = Some(context.leave_managed(&thread));

        Self {
            state,
            thread,
            context,
            saved_exception,
            token,
            thread_ref,
            scope,
        }
    }

    pub fn scope(&self) -> &ResourceScope<'a> {
        &self.scope
    }

    /// Run `callback` for `env`. Agent faults and panics are logged, counted
    /// and cleared here; they never propagate to the posting runtime code.
    pub fn invoke(
        &self,
        env: &Environment,
        kind: EventKind,
        payload: &EventPayload,
        callback: &EventCallback,
        counters: &EventCounters,
    ) {
        let ctx = EventContext {
            env,
            kind,
            thread: self.thread,
            thread_ref: self.thread_ref,
            payload,
            scope: &self.scope,
            state: self.state,
        };

        counters.record_delivered();
        match catch_unwind(AssertUnwindSafe(|| callback(&ctx))) {
            Ok(Ok(())) => {}
            Ok(Err(fault)) => {
                counters.record_callback_fault();
                tracing::warn!(
                    env = %env.id(),
                    event = ?kind,
                    thread = %self.thread.key,
                    %fault,
                    "agent callback fault cleared"
                );
            }
            Err(panic) => {
                counters.record_callback_fault();
                tracing::warn!(
                    env = %env.id(),
                    event = ?kind,
                    thread = %self.thread.key,
                    panic = panic_message(panic.as_ref()),
                    "agent callback panicked; cleared"
                );
            }
        }
    }
}

impl Drop for SafeCallTransition<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.context.return_to_managed(&self.thread, token);
        }
        self.scope.release();
        self.state.set_exception_state(self.saved_exception);
        self.state.leave_agent();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Capabilities;
    use crate::environment::{CallbackTable, EnvFlags};
    use crate::error::AgentFault;
    use crate::interfaces::{CountingResolver, ExecState, ThreadStateSwitch};
    use crate::payload::{ClassHandle, ObjectHandle};
    use std::sync::Arc;

    struct Harness {
        resolver: Arc<CountingResolver>,
        switch: Arc<ThreadStateSwitch>,
        collaborators: Collaborators,
        env: Environment,
        state: ThreadEventState,
        counters: EventCounters,
    }

    fn harness() -> Harness {
        let resolver = Arc::new(CountingResolver::new());
        let switch = Arc::new(ThreadStateSwitch::new());
        let collaborators = Collaborators::default()
            .with_identity(resolver.clone())
            .with_context(switch.clone());
        Harness {
            resolver,
            switch,
            collaborators,
            env: Environment::new(
                EnvironmentId(0),
                Capabilities::empty(),
                CallbackTable::new(),
                EnvFlags::empty(),
            ),
            state: ThreadEventState::new(ThreadRef::managed(1)),
            counters: EventCounters::default(),
        }
    }

    fn callback(
        f: impl Fn(&EventContext<'_>) -> Result<(), AgentFault> + Send + Sync + 'static,
    ) -> EventCallback {
        Arc::new(f)
    }

    #[test]
    fn state_is_restored_after_callback() {
        let h = harness();
        h.state.set_exception_state(ExceptionState::Detected);
        let switch = h.switch.clone();
        let cb = callback(move |ctx| {
            assert_eq!(switch.state_of(ctx.thread().key), ExecState::InNative);
            assert_eq!(ctx.agent_depth(), 1);
            ctx.local_ref(Handle::Class(ClassHandle(2)));
            ctx.local_ref(Handle::Object(ObjectHandle(3)));
            assert_eq!(ctx.live_refs(), 3);
            Ok(())
        });

        {
            let t = SafeCallTransition::enter(&h.state, &h.collaborators);
            // Callback-induced bookkeeping must not leak out
            h.state.set_exception_state(ExceptionState::Cleared);
            t.invoke(&h.env, EventKind::ClassLoad, &EventPayload::Empty, &cb, &h.counters);
        }

        assert_eq!(h.resolver.live_locals(), 0);
        assert_eq!(h.switch.state_of(ThreadRef::managed(1).key), ExecState::InRuntime);
        assert_eq!(h.state.exception_state(), ExceptionState::Detected);
        assert_eq!(h.state.agent_depth(), 0);
        assert_eq!(h.counters.snapshot().delivered, 1);
    }

    #[test]
    fn faults_and_panics_are_cleared() {
        let h = harness();
        let failing = callback(|_| Err(AgentFault::new("bad agent")));
        let panicking = callback(|_| panic!("agent blew up"));

        let t = SafeCallTransition::enter(&h.state, &h.collaborators);
        t.invoke(&h.env, EventKind::ClassLoad, &EventPayload::Empty, &failing, &h.counters);
        t.invoke(&h.env, EventKind::ClassLoad, &EventPayload::Empty, &panicking, &h.counters);
        drop(t);

        let stats = h.counters.snapshot();
        assert_eq!(stats.callback_faults, 2);
        assert_eq!(stats.delivered, 2);
        assert_eq!(h.state.agent_depth(), 0);
        assert_eq!(h.resolver.live_locals(), 0);
    }

    #[test]
    fn transitions_nest() {
        let h = harness();
        let outer = SafeCallTransition::enter(&h.state, &h.collaborators);
        h.state.set_exception_state(ExceptionState::Detected);
        {
            let _inner = SafeCallTransition::enter(&h.state, &h.collaborators);
            assert_eq!(h.state.agent_depth(), 2);
            h.state.set_exception_state(ExceptionState::Caught);
        }
        assert_eq!(h.state.exception_state(), ExceptionState::Detected);
        assert_eq!(h.state.agent_depth(), 1);
        drop(outer);
        assert_eq!(h.state.exception_state(), ExceptionState::Cleared);
        assert_eq!(h.switch.state_of(ThreadRef::managed(1).key), ExecState::InRuntime);
    }
}

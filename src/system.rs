//! The surface other runtime subsystems report through.
//!
//! [`EventSystem`] owns the phase gate, the environment registry, the
//! enablement index, the dispatcher and the deferred queue, and exposes the
//! operations agents and runtime code call: registration, subscription,
//! posting, collectors, deferred enqueue and phase advance.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::capabilities::Capabilities;
use crate::collector::{
    CollectedRecord, CollectionPause, CollectorKind, EventCollector, RecordOutcome,
    record_for_thread,
};
use crate::config::EventConfig;
use crate::deferred::{DeferredEvent, DeferredQueue};
use crate::dispatch::Dispatcher;
use crate::enablement::EnablementIndex;
use crate::environment::{CallbackTable, EnvFlags, Environment, EnvironmentId};
use crate::error::{EventError, EventResult};
use crate::event::EventKind;
use crate::interfaces::{Collaborators, ThreadKind, ThreadRef};
use crate::payload::{EventPayload, ObjectHandle};
use crate::phase::{Phase, PhaseGate};
use crate::registry::EnvironmentRegistry;
use crate::stats::{EventCounters, EventStats};
use crate::thread_state::{EventHidingGuard, ThreadEventState, ThreadTable};

/// Identity VM-global lifecycle events are posted under.
pub const VM_THREAD: ThreadRef = ThreadRef::system(0);

/// Where a subscription change applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableScope {
    Global,
    Thread(ThreadRef),
}

/// Event notification core.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use vigil::capabilities::Capabilities;
/// use vigil::environment::{CallbackTable, EnvFlags};
/// use vigil::event::EventKind;
/// use vigil::interfaces::ThreadRef;
/// use vigil::payload::{ClassHandle, EventPayload};
/// use vigil::phase::Phase;
/// use vigil::system::{EnableScope, EventSystem};
///
/// let system = EventSystem::with_defaults().unwrap();
/// for phase in [Phase::Start, Phase::Onload, Phase::Live] {
///     system.advance(phase).unwrap();
/// }
///
/// let loads = Arc::new(AtomicUsize::new(0));
/// let seen = loads.clone();
/// let callbacks = CallbackTable::new().with(EventKind::ClassLoad, move |_| {
///     seen.fetch_add(1, Ordering::Relaxed);
///     Ok(())
/// });
/// let env = system
///     .register(Capabilities::empty(), callbacks, EnvFlags::empty())
///     .unwrap();
/// system
///     .set_event_enabled(env, EventKind::ClassLoad, EnableScope::Global, true)
///     .unwrap();
///
/// let payload = EventPayload::Class { class: ClassHandle(7) };
/// assert_eq!(system.post(EventKind::ClassLoad, ThreadRef::managed(1), &payload), 1);
/// assert_eq!(loads.load(Ordering::Relaxed), 1);
/// ```
pub struct EventSystem {
    dispatcher: Arc<Dispatcher>,
    deferred: DeferredQueue,
    /// Set by the one caller that runs the DEAD sequence
    dying: AtomicBool,
}

impl EventSystem {
    pub fn new(config: EventConfig, collaborators: Collaborators) -> EventResult<Self> {
        let gate = Arc::new(PhaseGate::new());
        let registry = Arc::new(EnvironmentRegistry::new(Arc::clone(&gate)));
        let index = Arc::new(EnablementIndex::new(
            Arc::clone(&registry),
            Arc::new(ThreadTable::with_retention(config.reaped_retention)),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            config,
            gate,
            registry,
            index,
            collaborators,
            Arc::new(EventCounters::default()),
        ));
        let deferred = DeferredQueue::start(Arc::clone(&dispatcher))?;
        Ok(Self {
            dispatcher,
            deferred,
            dying: AtomicBool::new(false),
        })
    }

    /// Default configuration and collaborators.
    pub fn with_defaults() -> EventResult<Self> {
        Self::new(EventConfig::default(), Collaborators::default())
    }

    /// Configuration from the environment, default collaborators.
    pub fn from_env() -> EventResult<Self> {
        Self::new(EventConfig::from_env(), Collaborators::default())
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn gate(&self) -> &Arc<PhaseGate> {
        self.dispatcher.gate()
    }

    pub fn phase(&self) -> Phase {
        self.gate().current()
    }

    pub fn registry(&self) -> &Arc<EnvironmentRegistry> {
        self.dispatcher.registry()
    }

    pub fn index(&self) -> &Arc<EnablementIndex> {
        self.dispatcher.index()
    }

    pub fn config(&self) -> &EventConfig {
        self.dispatcher.config()
    }

    pub fn collaborators(&self) -> &Collaborators {
        self.dispatcher.collaborators()
    }

    pub fn deferred(&self) -> &DeferredQueue {
        &self.deferred
    }

    pub fn stats(&self) -> EventStats {
        self.dispatcher.counters().snapshot()
    }

    // Environments

    pub fn register(
        &self,
        capabilities: Capabilities,
        callbacks: CallbackTable,
        flags: EnvFlags,
    ) -> EventResult<EnvironmentId> {
        self.registry()
            .register(capabilities, callbacks, flags)
            .map(|env| env.id())
    }

    pub fn environment(&self, env: EnvironmentId) -> EventResult<Arc<Environment>> {
        self.registry().get(env)
    }

    fn live_environment(&self, env: EnvironmentId) -> EventResult<Arc<Environment>> {
        let environment = self.registry().get(env)?;
        if environment.is_disposed() {
            return Err(EventError::EnvironmentDisposed(env));
        }
        Ok(environment)
    }

    /// Dispose `env`. It keeps its place in the list but receives nothing
    /// further and contributes nothing to enablement.
    pub fn unregister(&self, env: EnvironmentId) -> EventResult<()> {
        let environment = self.live_environment(env)?;
        let guard = self.index().write();
        environment.dispose();
        self.index().clear_thread_enables(&guard, &environment);
        drop(guard);
        tracing::debug!(%env, "environment disposed");
        Ok(())
    }

    /// Subscribe or unsubscribe `env` to `kind`, process-wide or for one
    /// thread. The enablement index reflects the change before this returns.
    pub fn set_event_enabled(
        &self,
        env: EnvironmentId,
        kind: EventKind,
        scope: EnableScope,
        enabled: bool,
    ) -> EventResult<()> {
        let environment = self.live_environment(env)?;
        if self.gate().is_dead() {
            return Err(EventError::RuntimeDead);
        }
        if enabled && !environment.has_capability_for(kind) {
            return Err(EventError::MissingCapability {
                kind,
                required: kind.required_capability(),
            });
        }

        match scope {
            EnableScope::Global => self.index().set_global(&environment, kind, enabled),
            EnableScope::Thread(thread) => {
                if !kind.is_thread_filterable() {
                    return Err(EventError::ThreadFilterNotAllowed(kind));
                }
                if self.index().threads().is_reaped(thread.key) {
                    return Err(EventError::NoThreadState(thread.key));
                }
                let state = self.index().state_for(thread);
                self.index()
                    .set_for_thread(&environment, &state, kind, enabled)?;
            }
        }
        tracing::debug!(%env, event = ?kind, ?scope, enabled, "event enablement changed");
        Ok(())
    }

    /// Replace `env`'s callbacks. Kinds left without a callback drop out of
    /// the enablement index even if still subscribed.
    pub fn set_event_callbacks(
        &self,
        env: EnvironmentId,
        callbacks: CallbackTable,
    ) -> EventResult<()> {
        let environment = self.live_environment(env)?;
        let guard = self.index().write();
        environment.replace_callbacks(callbacks);
        self.index().refresh_all(&guard);
        Ok(())
    }

    #[inline(always)]
    pub fn is_enabled(&self, kind: EventKind) -> bool {
        self.dispatcher.is_enabled(kind)
    }

    // Posting

    pub fn state_for(&self, thread: ThreadRef) -> Arc<ThreadEventState> {
        self.dispatcher.state_for(thread)
    }

    #[inline]
    pub fn post(&self, kind: EventKind, thread: ThreadRef, payload: &EventPayload) -> usize {
        self.dispatcher.post(kind, thread, payload)
    }

    pub fn post_to(
        &self,
        env: EnvironmentId,
        kind: EventKind,
        thread: ThreadRef,
        payload: &EventPayload,
    ) -> usize {
        self.dispatcher.post_to(env, kind, thread, payload)
    }

    // Collectors

    pub fn acquire_collector(&self, kind: CollectorKind, thread: ThreadRef) -> EventCollector<'_> {
        EventCollector::acquire(&self.dispatcher, kind, thread)
    }

    /// Buffer a VM object allocation in the thread's active collector.
    pub fn record_allocation(&self, thread: ThreadRef, object: ObjectHandle) -> RecordOutcome {
        record_for_thread(
            &self.dispatcher,
            thread,
            CollectorKind::VmObjectAlloc,
            CollectedRecord::Allocation(object),
        )
    }

    /// Buffer a sampled allocation in the thread's active collector.
    pub fn record_sampled_allocation(
        &self,
        thread: ThreadRef,
        object: ObjectHandle,
    ) -> RecordOutcome {
        record_for_thread(
            &self.dispatcher,
            thread,
            CollectorKind::SampledObjectAlloc,
            CollectedRecord::Allocation(object),
        )
    }

    pub fn pause_collection(&self, thread: ThreadRef) -> CollectionPause {
        CollectionPause::new(&self.dispatcher, thread)
    }

    // Deferred delivery

    pub fn enqueue(&self, event: DeferredEvent) -> EventResult<()> {
        self.deferred.enqueue(event)
    }

    pub fn drain_deferred(&self) -> EventResult<()> {
        self.deferred.drain()
    }

    // Lifecycle

    /// Advance the phase gate. Entering DEAD first drains the deferred
    /// queue, then posts VM death, then closes the gate and stops the
    /// worker. Only one caller runs that sequence; any other gets
    /// `InvalidPhaseTransition` and posts nothing.
    pub fn advance(&self, next: Phase) -> EventResult<()> {
        if next != Phase::Dead {
            return self.gate().advance(next);
        }

        let from = self.gate().current();
        if from != Phase::Live
            || self
                .dying
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return Err(EventError::InvalidPhaseTransition { from, to: next });
        }
        if let Err(error) = self.deferred.drain() {
            tracing::warn!(%error, "deferred events may be lost at teardown");
        }
        self.post(EventKind::VmDeath, VM_THREAD, &EventPayload::Empty);
        self.gate().advance(Phase::Dead)?;
        self.deferred.shutdown()
    }

    /// A thread became visible to the event system.
    pub fn thread_started(&self, thread: ThreadRef) -> usize {
        self.index().threads().revive(thread.key);
        if thread.hidden {
            return 0;
        }
        self.state_for(thread);
        let (kind, payload) = Self::thread_lifecycle(thread, true);
        self.post(kind, thread, &payload)
    }

    /// A thread is terminating. Posts its end event, then reaps its state.
    pub fn thread_ended(&self, thread: ThreadRef) -> usize {
        let delivered = if thread.hidden {
            0
        } else {
            let (kind, payload) = Self::thread_lifecycle(thread, false);
            self.post(kind, thread, &payload)
        };
        self.index().reap(thread.key);
        delivered
    }

    fn thread_lifecycle(thread: ThreadRef, start: bool) -> (EventKind, EventPayload) {
        match (thread.kind, start) {
            (ThreadKind::Virtual, true) => (
                EventKind::VirtualThreadStart,
                EventPayload::VirtualThread {
                    vthread: ObjectHandle(thread.key.0),
                },
            ),
            (ThreadKind::Virtual, false) => (
                EventKind::VirtualThreadEnd,
                EventPayload::VirtualThread {
                    vthread: ObjectHandle(thread.key.0),
                },
            ),
            (_, true) => (EventKind::ThreadStart, EventPayload::Empty),
            (_, false) => (EventKind::ThreadEnd, EventPayload::Empty),
        }
    }

    // Per-thread controls

    pub fn hide_single_stepping(&self, thread: ThreadRef) {
        self.state_for(thread).set_single_step_hidden(true);
    }

    pub fn expose_single_stepping(&self, thread: ThreadRef) {
        if let Some(state) = self.index().threads().get(thread.key) {
            state.set_single_step_hidden(false);
        }
    }

    /// Suppress every event on `thread` until the guard drops.
    pub fn hide_events(&self, thread: ThreadRef) -> EventHidingGuard {
        self.state_for(thread).hide_events()
    }

    /// Forget `env`'s current location on `thread` so the next
    /// location-gated event there is delivered.
    pub fn clear_current_location(&self, env: EnvironmentId, thread: ThreadRef) -> EventResult<()> {
        self.live_environment(env)?;
        let state = self
            .index()
            .threads()
            .get(thread.key)
            .ok_or(EventError::NoThreadState(thread.key))?;
        state.with_env(env, |ets| ets.clear_location());
        Ok(())
    }

    /// Request a frame pop event for `env` when the frame at `depth` on
    /// `thread` exits.
    pub fn notify_frame_pop(
        &self,
        env: EnvironmentId,
        thread: ThreadRef,
        depth: i32,
    ) -> EventResult<()> {
        let environment = self.live_environment(env)?;
        if !environment.has_capability_for(EventKind::FramePop) {
            return Err(EventError::MissingCapability {
                kind: EventKind::FramePop,
                required: EventKind::FramePop.required_capability(),
            });
        }
        if self.index().threads().is_reaped(thread.key) {
            return Err(EventError::NoThreadState(thread.key));
        }
        self.state_for(thread)
            .with_env(env, |ets| ets.set_frame_pop(depth));
        Ok(())
    }
}

impl std::fmt::Debug for EventSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSystem")
            .field("dispatcher", &self.dispatcher)
            .field("deferred", &self.deferred)
            .field("dying", &self.dying.load(Ordering::Relaxed))
            .finish()
    }
}

//! Synchronous dispatch engine.
//!
//! `post` is called from runtime code that may execute billions of times, so
//! the disabled case is one atomic load for the phase and one for the
//! enablement word. Everything else lives behind a non-inlined slow path.

use std::sync::Arc;

use crate::config::EventConfig;
use crate::enablement::EnablementIndex;
use crate::environment::{Environment, EnvironmentId, EventCallback};
use crate::event::{EventKind, EventSet};
use crate::interfaces::{Collaborators, ThreadRef};
use crate::invariant;
use crate::payload::EventPayload;
use crate::phase::{Phase, PhaseGate};
use crate::registry::{EnvSnapshot, EnvironmentRegistry};
use crate::stats::EventCounters;
use crate::thread_state::{EnvThreadState, LocationGate, ThreadEventState};
use crate::transition::SafeCallTransition;

#[inline(always)]
fn unlikely(b: bool) -> bool {
    #[cold]
    fn cold() {}
    if b {
        cold();
    }
    b
}

/// Delivers events to the environments that want them.
pub struct Dispatcher {
    config: EventConfig,
    gate: Arc<PhaseGate>,
    registry: Arc<EnvironmentRegistry>,
    index: Arc<EnablementIndex>,
    collaborators: Collaborators,
    counters: Arc<EventCounters>,
}

impl Dispatcher {
    pub fn new(
        config: EventConfig,
        gate: Arc<PhaseGate>,
        registry: Arc<EnvironmentRegistry>,
        index: Arc<EnablementIndex>,
        collaborators: Collaborators,
        counters: Arc<EventCounters>,
    ) -> Self {
        Self {
            config,
            gate,
            registry,
            index,
            collaborators,
            counters,
        }
    }

    pub fn config(&self) -> &EventConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<PhaseGate> {
        &self.gate
    }

    pub fn registry(&self) -> &Arc<EnvironmentRegistry> {
        &self.registry
    }

    pub fn index(&self) -> &Arc<EnablementIndex> {
        &self.index
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn counters(&self) -> &Arc<EventCounters> {
        &self.counters
    }

    /// Fast check for callers that want to skip building a payload.
    #[inline(always)]
    pub fn is_enabled(&self, kind: EventKind) -> bool {
        self.index.is_enabled(kind)
    }

    pub fn state_for(&self, thread: ThreadRef) -> Arc<ThreadEventState> {
        self.index.state_for(thread)
    }

    /// Post `kind` raised on `thread` to every interested environment, in
    /// registration order. Returns the number of callbacks invoked.
    #[inline]
    pub fn post(&self, kind: EventKind, thread: ThreadRef, payload: &EventPayload) -> usize {
        self.post_filtered(kind, thread, payload, |_| true)
    }

    /// Post to a single environment.
    pub fn post_to(
        &self,
        env: EnvironmentId,
        kind: EventKind,
        thread: ThreadRef,
        payload: &EventPayload,
    ) -> usize {
        self.post_filtered(kind, thread, payload, |e| e.id() == env)
    }

    /// Post to the interested environments `filter` accepts.
    #[inline]
    pub fn post_filtered<F>(
        &self,
        kind: EventKind,
        thread: ThreadRef,
        payload: &EventPayload,
        filter: F,
    ) -> usize
    where
        F: Fn(&Environment) -> bool,
    {
        let phase = self.gate.current();
        if unlikely(phase < kind.min_phase() || phase == Phase::Dead) {
            return 0;
        }
        if !self.index.is_enabled(kind) {
            return 0;
        }
        self.dispatch(kind, thread, payload, phase, &filter)
    }

    #[inline(never)]
    fn dispatch(
        &self,
        kind: EventKind,
        thread: ThreadRef,
        payload: &EventPayload,
        phase: Phase,
        filter: &dyn Fn(&Environment) -> bool,
    ) -> usize {
        self.counters.record_posted();

        let state = self.index.state_for(thread);
        if state.is_terminated() || state.events_hidden() {
            return 0;
        }
        if kind.is_thread_filterable() && !state.is_enabled(kind) {
            return 0;
        }
        if kind == EventKind::SingleStep && state.is_single_step_hidden() {
            return 0;
        }

        if self.config.trace_events {
            tracing::trace!(event = ?kind, thread = %thread.key, "event triggered");
        }

        let envs = self.registry.snapshot();
        match payload.location() {
            Some((method, location)) if kind.is_location_gated() => {
                let targets = {
                    let mut locals = state.lock_envs();
                    if locals.len() < envs.len() {
                        locals.resize_with(envs.len(), Default::default);
                    }
                    for ets in locals.iter_mut() {
                        ets.compare_and_set_location(method, location);
                    }
                    self.located_targets(&envs, kind, phase, filter, &mut locals)
                };
                targets
                    .iter()
                    .map(|(env, callback)| self.deliver(env, &state, kind, payload, callback))
                    .sum()
            }
            location => {
                invariant!(
                    self.counters,
                    location.is_some() || !kind.is_location_gated(),
                    "location-gated {:?} posted without a location",
                    kind
                );
                let mut delivered = 0;
                for env in envs.iter() {
                    if !wants(env, kind, phase, || state.env_enabled(env.id())) || !filter(env) {
                        continue;
                    }
                    let Some(callback) = env.callback(kind) else {
                        continue;
                    };
                    delivered += self.deliver(env, &state, kind, payload, &callback);
                }
                delivered
            }
        }
    }

    /// Environments to call for a location-gated event, marking each as
    /// posted at the current location. Runs under the thread's env lock; no
    /// callback is invoked here.
    fn located_targets(
        &self,
        envs: &EnvSnapshot,
        kind: EventKind,
        phase: Phase,
        filter: &dyn Fn(&Environment) -> bool,
        locals: &mut [EnvThreadState],
    ) -> Vec<(Arc<Environment>, EventCallback)> {
        let mut targets = Vec::new();
        for env in envs.iter() {
            let ets = &mut locals[env.id().index()];
            if !wants(env, kind, phase, || ets.enabled()) || !filter(env) {
                continue;
            }
            let Some(callback) = env.callback(kind) else {
                continue;
            };
            match ets.gate(kind) {
                LocationGate::Deliver => targets.push((Arc::clone(env), callback)),
                LocationGate::Duplicate => self.counters.record_duplicate_suppressed(),
            }
        }
        targets
    }

    fn deliver(
        &self,
        env: &Environment,
        state: &ThreadEventState,
        kind: EventKind,
        payload: &EventPayload,
        callback: &EventCallback,
    ) -> usize {
        let transition = SafeCallTransition::enter(state, &self.collaborators);
        transition.invoke(env, kind, payload, callback, &self.counters);
        drop(transition);

        if self.config.trace_events {
            tracing::trace!(
                event = ?kind,
                thread = %state.thread().key,
                env = %env.id(),
                "event sent"
            );
        }
        1
    }
}

/// Whether `env` wants `kind` from a thread whose thread-level enables for
/// it are `local`.
#[inline]
fn wants(
    env: &Environment,
    kind: EventKind,
    phase: Phase,
    local: impl FnOnce() -> EventSet,
) -> bool {
    !env.is_disposed()
        && env.accepts_phase(phase)
        && env.has_callback(kind)
        && (env.is_globally_enabled(kind)
            || (kind.is_thread_filterable() && local().contains(kind)))
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("phase", &self.gate.current())
            .field("environments", &self.registry.len())
            .field("index", &self.index)
            .finish()
    }
}

//! Derived enablement bits read on every hot-path check.
//!
//! The process-wide word is the union of what every live environment wants,
//! restricted to kinds it has a callback for. Each thread additionally keeps
//! its own view: global subscriptions plus the thread-level ones made for it.
//!
//! Readers never block. Writers serialize on one narrow lock and publish in
//! an order that keeps every thread view a subset of the process-wide word
//! at every instant.

use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

use crate::environment::{Environment, EnvironmentId};
use crate::error::{EventError, EventResult};
use crate::event::{AtomicEventSet, EventKind, EventSet};
use crate::interfaces::{ThreadKey, ThreadRef};
use crate::registry::{EnvSnapshot, EnvironmentRegistry};
use crate::thread_state::{ThreadEventState, ThreadTable};

/// Process-wide and per-thread enablement.
pub struct EnablementIndex {
    global: CachePadded<AtomicEventSet>,
    write_lock: Mutex<()>,
    registry: Arc<EnvironmentRegistry>,
    threads: Arc<ThreadTable>,
}

impl EnablementIndex {
    pub fn new(registry: Arc<EnvironmentRegistry>, threads: Arc<ThreadTable>) -> Self {
        Self {
            global: CachePadded::new(AtomicEventSet::new()),
            write_lock: Mutex::new(()),
            registry,
            threads,
        }
    }

    /// Fast check: does any environment want `kind` from any thread.
    #[inline(always)]
    pub fn is_enabled(&self, kind: EventKind) -> bool {
        self.global.contains(kind)
    }

    pub fn global(&self) -> EventSet {
        self.global.load()
    }

    pub fn threads(&self) -> &Arc<ThreadTable> {
        &self.threads
    }

    /// Hold off every other enablement writer.
    pub(crate) fn write(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock()
    }

    /// Thread state for `thread`, created on first use.
    ///
    /// Creation takes the write lock so a new state cannot miss a
    /// concurrent recomputation. A thread that already ended gets a detached,
    /// terminated state that is never entered in the table, so nothing is
    /// delivered for it and nothing leaks.
    pub fn state_for(&self, thread: ThreadRef) -> Arc<ThreadEventState> {
        if let Some(state) = self.threads.get(thread.key) {
            return state;
        }
        self.create_state(thread)
    }

    #[cold]
    fn create_state(&self, thread: ThreadRef) -> Arc<ThreadEventState> {
        let _guard = self.write();
        if self.threads.is_reaped(thread.key) {
            let detached = ThreadEventState::new(thread);
            detached.mark_terminated();
            return Arc::new(detached);
        }
        let envs = self.registry.snapshot();
        self.threads.get_or_insert_with(thread, |state| {
            state.publish_view(Self::thread_view(&envs, state));
            tracing::debug!(
                thread = %thread.key,
                kind = ?thread.kind,
                "thread event state created"
            );
        })
    }

    fn global_view(envs: &EnvSnapshot) -> EventSet {
        envs.iter()
            .fold(EventSet::EMPTY, |acc, env| acc.union(env.contribution()))
    }

    fn thread_view(envs: &EnvSnapshot, state: &ThreadEventState) -> EventSet {
        let locals = state.lock_envs();
        envs.iter()
            .filter(|env| !env.is_disposed())
            .fold(EventSet::EMPTY, |acc, env| {
                let local = locals
                    .get(env.id().index())
                    .map(|ets| ets.enabled())
                    .unwrap_or_default();
                acc.union(
                    env.global_enabled()
                        .union(local)
                        .intersection(env.callback_mask()),
                )
            })
    }

    fn publish_thread(envs: &EnvSnapshot, state: &ThreadEventState) {
        if let Some(interp_only) = state.publish_view(Self::thread_view(envs, state)) {
            tracing::debug!(
                thread = %state.thread().key,
                interp_only,
                "interpreter-only mode changed"
            );
        }
    }

    /// Recompute the process-wide word and every thread view.
    pub(crate) fn refresh_all(&self, _guard: &MutexGuard<'_, ()>) {
        let envs = self.registry.snapshot();
        let next = Self::global_view(&envs);
        // Widen first so views never escape the published word
        self.global.store(self.global.load().union(next));
        for state in self.threads.states() {
            Self::publish_thread(&envs, &state);
        }
        self.global.store(next);
    }

    /// Recompute the process-wide word and one thread's view.
    pub(crate) fn refresh_thread(&self, _guard: &MutexGuard<'_, ()>, state: &ThreadEventState) {
        let envs = self.registry.snapshot();
        let next = Self::global_view(&envs);
        self.global.store(self.global.load().union(next));
        Self::publish_thread(&envs, state);
        self.global.store(next);
    }

    /// Change `env`'s subscription for every thread.
    pub(crate) fn set_global(&self, env: &Environment, kind: EventKind, enabled: bool) {
        let guard = self.write();
        if env.set_globally_enabled(kind, enabled) {
            self.refresh_all(&guard);
        }
    }

    /// Change `env`'s subscription for one thread. Only that thread's view
    /// is recomputed.
    pub(crate) fn set_for_thread(
        &self,
        env: &Environment,
        state: &ThreadEventState,
        kind: EventKind,
        enabled: bool,
    ) -> EventResult<()> {
        let guard = self.write();
        if state.is_terminated() {
            return Err(EventError::NoThreadState(state.thread().key));
        }
        let changed = state.with_env(env.id(), |ets| ets.enabled.set(kind, enabled));
        if changed {
            env.adjust_thread_count(kind, enabled);
            self.refresh_thread(&guard, state);
        }
        Ok(())
    }

    /// Drop every thread-level subscription `env` holds.
    pub(crate) fn clear_thread_enables(&self, guard: &MutexGuard<'_, ()>, env: &Environment) {
        for state in self.threads.states() {
            state.with_env(env.id(), |ets| ets.enabled = EventSet::EMPTY);
        }
        self.refresh_all(guard);
    }

    /// Remove a terminated thread and withdraw its thread-level enables.
    pub(crate) fn reap(&self, key: ThreadKey) -> Option<Arc<ThreadEventState>> {
        let guard = self.write();
        let state = self.threads.remove(key)?;
        state.mark_terminated();

        let envs = self.registry.snapshot();
        let locals: Vec<EventSet> = state.lock_envs().iter().map(|e| e.enabled()).collect();
        for (index, local) in locals.into_iter().enumerate() {
            if let Some(env) = envs.get(EnvironmentId(index as u32)) {
                for kind in local.iter() {
                    env.adjust_thread_count(kind, false);
                }
            }
        }
        let next = Self::global_view(&envs);
        self.global.store(next);
        drop(guard);

        tracing::debug!(thread = %key, "thread event state reaped");
        Some(state)
    }
}

impl std::fmt::Debug for EnablementIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnablementIndex")
            .field("global", &self.global())
            .field("threads", &self.threads.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Capabilities;
    use crate::environment::{CallbackTable, EnvFlags};
    use crate::phase::PhaseGate;

    fn index() -> (Arc<EnvironmentRegistry>, EnablementIndex) {
        let registry = Arc::new(EnvironmentRegistry::new(Arc::new(PhaseGate::new())));
        let index = EnablementIndex::new(Arc::clone(&registry), Arc::new(ThreadTable::new()));
        (registry, index)
    }

    fn with_callbacks(registry: &EnvironmentRegistry, kinds: &[EventKind]) -> Arc<Environment> {
        let table = kinds
            .iter()
            .fold(CallbackTable::new(), |t, k| t.with(*k, |_| Ok(())));
        registry
            .register(Capabilities::all(), table, EnvFlags::empty())
            .unwrap()
    }

    #[test]
    fn global_enable_reaches_existing_and_new_threads() {
        let (registry, index) = index();
        let env = with_callbacks(&registry, &[EventKind::ClassLoad]);
        let early = index.state_for(ThreadRef::managed(1));

        index.set_global(&env, EventKind::ClassLoad, true);
        assert!(index.is_enabled(EventKind::ClassLoad));
        assert!(early.is_enabled(EventKind::ClassLoad));
        assert!(index.state_for(ThreadRef::managed(2)).is_enabled(EventKind::ClassLoad));

        index.set_global(&env, EventKind::ClassLoad, false);
        assert!(!index.is_enabled(EventKind::ClassLoad));
        assert!(!early.is_enabled(EventKind::ClassLoad));
    }

    #[test]
    fn missing_callback_keeps_kind_disabled() {
        let (registry, index) = index();
        let env = with_callbacks(&registry, &[]);
        index.set_global(&env, EventKind::ClassLoad, true);
        assert!(!index.is_enabled(EventKind::ClassLoad));
    }

    #[test]
    fn thread_enable_touches_only_that_thread() {
        let (registry, index) = index();
        let env = with_callbacks(&registry, &[EventKind::Breakpoint]);
        let t1 = index.state_for(ThreadRef::managed(1));
        let t2 = index.state_for(ThreadRef::managed(2));

        index.set_for_thread(&env, &t1, EventKind::Breakpoint, true).unwrap();
        assert!(index.is_enabled(EventKind::Breakpoint));
        assert!(t1.is_enabled(EventKind::Breakpoint));
        assert!(!t2.is_enabled(EventKind::Breakpoint));

        index.set_for_thread(&env, &t1, EventKind::Breakpoint, false).unwrap();
        assert!(!index.is_enabled(EventKind::Breakpoint));
    }

    #[test]
    fn reaping_withdraws_thread_enables() {
        let (registry, index) = index();
        let env = with_callbacks(&registry, &[EventKind::SingleStep]);
        let t1 = index.state_for(ThreadRef::managed(1));
        index.set_for_thread(&env, &t1, EventKind::SingleStep, true).unwrap();
        assert!(t1.is_interp_only());

        let reaped = index.reap(ThreadKey(1)).unwrap();
        assert!(reaped.is_terminated());
        assert!(!index.is_enabled(EventKind::SingleStep));
        assert!(env.thread_enabled_any().is_empty());
        assert!(matches!(
            index.set_for_thread(&env, &reaped, EventKind::SingleStep, true),
            Err(EventError::NoThreadState(ThreadKey(1)))
        ));
    }

    #[test]
    fn reaped_thread_gets_a_detached_state() {
        let (registry, index) = index();
        let env = with_callbacks(&registry, &[EventKind::ClassLoad]);
        index.set_global(&env, EventKind::ClassLoad, true);
        index.state_for(ThreadRef::managed(1));
        index.reap(ThreadKey(1)).unwrap();

        let late = index.state_for(ThreadRef::managed(1));
        assert!(late.is_terminated());
        assert!(late.enabled_events().is_empty());
        assert!(index.threads().get(ThreadKey(1)).is_none());
        assert!(index.threads().is_reaped(ThreadKey(1)));
    }
}

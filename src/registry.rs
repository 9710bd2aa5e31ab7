//! Append-only, insertion-ordered environment registry.
//!
//! Readers take a snapshot of the list (one `ArcSwap` load) and iterate it
//! without locks. Writers serialize on a small mutex, copy the list, append
//! and publish. Environments are never removed, so a snapshot taken at any
//! time is a prefix of every later one.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::capabilities::Capabilities;
use crate::environment::{CallbackTable, EnvFlags, Environment, EnvironmentId};
use crate::error::{EventError, EventResult};
use crate::phase::PhaseGate;

/// Registration-ordered view of the environments at one instant.
#[derive(Debug, Clone)]
pub struct EnvSnapshot {
    envs: Arc<Vec<Arc<Environment>>>,
}

impl EnvSnapshot {
    pub fn len(&self) -> usize {
        self.envs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envs.is_empty()
    }

    pub fn get(&self, id: EnvironmentId) -> Option<&Arc<Environment>> {
        self.envs.get(id.index())
    }

    /// Environments in registration order. Restartable: each call starts
    /// from the first environment of this snapshot.
    pub fn iter(&self) -> std::slice::Iter<'_, Arc<Environment>> {
        self.envs.iter()
    }
}

impl<'a> IntoIterator for &'a EnvSnapshot {
    type Item = &'a Arc<Environment>;
    type IntoIter = std::slice::Iter<'a, Arc<Environment>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Ordered collection of registered environments.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use vigil::capabilities::Capabilities;
/// use vigil::environment::{CallbackTable, EnvFlags};
/// use vigil::phase::PhaseGate;
/// use vigil::registry::EnvironmentRegistry;
///
/// let registry = EnvironmentRegistry::new(Arc::new(PhaseGate::new()));
/// let a = registry
///     .register(Capabilities::empty(), CallbackTable::new(), EnvFlags::empty())
///     .unwrap();
/// let b = registry
///     .register(Capabilities::empty(), CallbackTable::new(), EnvFlags::empty())
///     .unwrap();
///
/// let order: Vec<_> = registry.snapshot().iter().map(|e| e.id()).collect();
/// assert_eq!(order, vec![a.id(), b.id()]);
/// ```
pub struct EnvironmentRegistry {
    gate: Arc<PhaseGate>,
    envs: ArcSwap<Vec<Arc<Environment>>>,
    append_lock: Mutex<()>,
    snapshots: AtomicUsize,
}

impl EnvironmentRegistry {
    pub fn new(gate: Arc<PhaseGate>) -> Self {
        Self {
            gate,
            envs: ArcSwap::from_pointee(Vec::new()),
            append_lock: Mutex::new(()),
            snapshots: AtomicUsize::new(0),
        }
    }

    /// Append a new environment.
    ///
    /// Fails with [`EventError::RuntimeDead`] once the gate reached DEAD.
    pub fn register(
        &self,
        capabilities: Capabilities,
        callbacks: CallbackTable,
        flags: EnvFlags,
    ) -> EventResult<Arc<Environment>> {
        let _guard = self.append_lock.lock();
        if self.gate.is_dead() {
            return Err(EventError::RuntimeDead);
        }

        let current = self.envs.load_full();
        let id = EnvironmentId(current.len() as u32);
        let env = Arc::new(Environment::new(id, capabilities, callbacks, flags));

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(Arc::clone(&env));
        self.envs.store(Arc::new(next));

        tracing::debug!(env = %id, ?capabilities, ?flags, "environment registered");
        Ok(env)
    }

    /// Snapshot of registration order at this instant.
    pub fn snapshot(&self) -> EnvSnapshot {
        self.snapshots.fetch_add(1, Ordering::Relaxed);
        EnvSnapshot {
            envs: self.envs.load_full(),
        }
    }

    /// Same as [`snapshot`](Self::snapshot), named for the iteration protocol.
    pub fn iter(&self) -> EnvSnapshot {
        self.snapshot()
    }

    pub fn get(&self, id: EnvironmentId) -> EventResult<Arc<Environment>> {
        self.envs
            .load()
            .get(id.index())
            .cloned()
            .ok_or(EventError::UnknownEnvironment(id))
    }

    pub fn len(&self) -> usize {
        self.envs.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of snapshots taken so far.
    pub fn snapshots_taken(&self) -> usize {
        self.snapshots.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for EnvironmentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentRegistry")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::Phase;

    fn registry() -> EnvironmentRegistry {
        EnvironmentRegistry::new(Arc::new(PhaseGate::new()))
    }

    fn register(registry: &EnvironmentRegistry) -> EventResult<Arc<Environment>> {
        registry.register(Capabilities::empty(), CallbackTable::new(), EnvFlags::empty())
    }

    #[test]
    fn ids_follow_registration_order() {
        let registry = registry();
        for expected in 0..4 {
            assert_eq!(register(&registry).unwrap().id(), EnvironmentId(expected));
        }
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn snapshot_is_stable_across_later_registration() {
        let registry = registry();
        register(&registry).unwrap();
        let snapshot = registry.snapshot();
        register(&registry).unwrap();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.snapshot().len(), 2);
        // Restartable
        assert_eq!(snapshot.iter().count(), snapshot.iter().count());
    }

    #[test]
    fn register_after_dead_fails() {
        let gate = Arc::new(PhaseGate::new());
        let registry = EnvironmentRegistry::new(Arc::clone(&gate));
        for phase in [Phase::Start, Phase::Onload, Phase::Live, Phase::Dead] {
            gate.advance(phase).unwrap();
        }
        assert_eq!(register(&registry).unwrap_err(), EventError::RuntimeDead);
        assert!(registry.is_empty());
    }

    #[test]
    fn unknown_environment_lookup() {
        let registry = registry();
        assert_eq!(
            registry.get(EnvironmentId(2)).unwrap_err(),
            EventError::UnknownEnvironment(EnvironmentId(2))
        );
    }
}

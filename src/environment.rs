//! Registered observer agents.
//!
//! An [`Environment`] is created by the registry and never removed while the
//! runtime is alive. Disposal clears its subscriptions and callbacks in place
//! so concurrent iteration never observes a removal.

use arc_swap::ArcSwap;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::capabilities::Capabilities;
use crate::error::AgentFault;
use crate::event::{AtomicEventSet, EVENT_COUNT, EventKind, EventSet};
use crate::phase::Phase;
use crate::transition::EventContext;

/// Registration index of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvironmentId(pub u32);

impl EnvironmentId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "env#{}", self.0)
    }
}

bitflags! {
    /// Registration-time properties of an environment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EnvFlags: u8 {
        /// May retransform already-loaded classes
        const RETRANSFORM_CAPABLE = 1 << 0;
        /// Receives events during PRIMORDIAL, including the early VM start
        const EARLY_VMSTART = 1 << 1;
    }
}

/// Agent callback.
///
/// Returning `Err` reports a fault; the fault is logged and cleared at the
/// safe-call boundary and never reaches the runtime.
pub type EventCallback =
    Arc<dyn Fn(&EventContext<'_>) -> Result<(), AgentFault> + Send + Sync + 'static>;

/// Sparse event kind to callback mapping.
///
/// # Examples
///
/// ```
/// use vigil::environment::CallbackTable;
/// use vigil::event::EventKind;
///
/// let table = CallbackTable::new().with(EventKind::ClassLoad, |_ctx| Ok(()));
/// assert!(table.get(EventKind::ClassLoad).is_some());
/// assert!(table.get(EventKind::ClassPrepare).is_none());
/// assert!(table.mask().contains(EventKind::ClassLoad));
/// ```
#[derive(Clone)]
pub struct CallbackTable {
    slots: [Option<EventCallback>; EVENT_COUNT],
}

impl CallbackTable {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    pub fn with<F>(mut self, kind: EventKind, callback: F) -> Self
    where
        F: Fn(&EventContext<'_>) -> Result<(), AgentFault> + Send + Sync + 'static,
    {
        self.slots[kind.index()] = Some(Arc::new(callback));
        self
    }

    pub fn set(&mut self, kind: EventKind, callback: Option<EventCallback>) {
        self.slots[kind.index()] = callback;
    }

    pub fn get(&self, kind: EventKind) -> Option<&EventCallback> {
        self.slots[kind.index()].as_ref()
    }

    /// Kinds with a callback installed.
    pub fn mask(&self) -> EventSet {
        EventKind::ALL
            .iter()
            .copied()
            .filter(|k| self.slots[k.index()].is_some())
            .collect()
    }
}

impl Default for CallbackTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CallbackTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CallbackTable").field(&self.mask()).finish()
    }
}

/// One registered agent.
pub struct Environment {
    id: EnvironmentId,
    capabilities: Capabilities,
    flags: EnvFlags,
    callbacks: ArcSwap<CallbackTable>,
    callback_mask: AtomicEventSet,
    /// Kinds enabled for every thread
    global_enabled: AtomicEventSet,
    /// Per kind, how many threads have this environment's thread-level
    /// enable set. Only changed under the enablement write lock.
    thread_counts: Mutex<[u32; EVENT_COUNT]>,
    disposed: AtomicBool,
}

impl Environment {
    pub(crate) fn new(
        id: EnvironmentId,
        capabilities: Capabilities,
        callbacks: CallbackTable,
        flags: EnvFlags,
    ) -> Self {
        let mask = callbacks.mask();
        let callback_mask = AtomicEventSet::new();
        callback_mask.store(mask);
        Self {
            id,
            capabilities,
            flags,
            callbacks: ArcSwap::from_pointee(callbacks),
            callback_mask,
            global_enabled: AtomicEventSet::new(),
            thread_counts: Mutex::new([0; EVENT_COUNT]),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> EnvironmentId {
        self.id
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn flags(&self) -> EnvFlags {
        self.flags
    }

    pub fn is_early(&self) -> bool {
        self.flags.contains(EnvFlags::EARLY_VMSTART)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Ordinary environments receive events from START on; early ones
    /// already during PRIMORDIAL.
    #[inline]
    pub fn accepts_phase(&self, phase: Phase) -> bool {
        phase >= Phase::Start || self.is_early()
    }

    pub fn has_capability_for(&self, kind: EventKind) -> bool {
        self.capabilities.contains(kind.required_capability())
    }

    #[inline]
    pub fn is_globally_enabled(&self, kind: EventKind) -> bool {
        self.global_enabled.contains(kind)
    }

    pub fn global_enabled(&self) -> EventSet {
        self.global_enabled.load()
    }

    #[inline]
    pub fn has_callback(&self, kind: EventKind) -> bool {
        self.callback_mask.contains(kind)
    }

    pub fn callback_mask(&self) -> EventSet {
        self.callback_mask.load()
    }

    pub fn callback(&self, kind: EventKind) -> Option<EventCallback> {
        self.callbacks.load().get(kind).cloned()
    }

    /// Kinds some thread has enabled at thread level for this environment.
    pub fn thread_enabled_any(&self) -> EventSet {
        let counts = self.thread_counts.lock();
        EventKind::ALL
            .iter()
            .copied()
            .filter(|k| counts[k.index()] > 0)
            .collect()
    }

    /// What this environment contributes to the process-wide index.
    pub(crate) fn contribution(&self) -> EventSet {
        if self.is_disposed() {
            return EventSet::EMPTY;
        }
        self.global_enabled()
            .union(self.thread_enabled_any())
            .intersection(self.callback_mask())
    }

    pub(crate) fn set_globally_enabled(&self, kind: EventKind, enabled: bool) -> bool {
        self.global_enabled.set(kind, enabled) != enabled
    }

    pub(crate) fn adjust_thread_count(&self, kind: EventKind, enabled: bool) {
        let mut counts = self.thread_counts.lock();
        let slot = &mut counts[kind.index()];
        if enabled {
            *slot += 1;
        } else {
            *slot = slot.saturating_sub(1);
        }
    }

    pub(crate) fn replace_callbacks(&self, callbacks: CallbackTable) {
        let mask = callbacks.mask();
        self.callbacks.store(Arc::new(callbacks));
        self.callback_mask.store(mask);
    }

    pub(crate) fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.global_enabled.store(EventSet::EMPTY);
        self.replace_callbacks(CallbackTable::new());
        *self.thread_counts.lock() = [0; EVENT_COUNT];
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("id", &self.id)
            .field("capabilities", &self.capabilities)
            .field("flags", &self.flags)
            .field("global_enabled", &self.global_enabled)
            .field("callbacks", &self.callback_mask)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

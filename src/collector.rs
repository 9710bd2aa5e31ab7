//! Scoped batching of high-frequency events.
//!
//! A collector buffers candidate events raised on its thread while runtime
//! code holds state that makes a synchronous callback unsafe, and flushes
//! them through the dispatcher when the scope ends. Each thread has one slot
//! per [`CollectorKind`]; the first collector to find the slot empty owns
//! it, and any collector acquired while the slot is occupied is suppressed.
//!
//! While flushing, the owner stays installed but stops accepting records, so
//! allocations made by the callbacks it triggers are neither buffered nor
//! able to install a nested collector.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::dispatch::Dispatcher;
use crate::event::EventKind;
use crate::interfaces::ThreadRef;
use crate::invariant;
use crate::payload::{EventPayload, ObjectHandle};
use crate::thread_state::ThreadEventState;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Kind of collector, one slot each per thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectorKind {
    VmObjectAlloc,
    SampledObjectAlloc,
    DynamicCode,
}

impl CollectorKind {
    pub const COUNT: usize = 3;
    pub const ALL: [CollectorKind; Self::COUNT] = [
        CollectorKind::VmObjectAlloc,
        CollectorKind::SampledObjectAlloc,
        CollectorKind::DynamicCode,
    ];

    const fn slot(self) -> usize {
        self as usize
    }

    /// Event the buffered records are posted as.
    pub const fn event_kind(self) -> EventKind {
        match self {
            CollectorKind::VmObjectAlloc => EventKind::VmObjectAlloc,
            CollectorKind::SampledObjectAlloc => EventKind::SampledObjectAlloc,
            CollectorKind::DynamicCode => EventKind::DynamicCodeGenerated,
        }
    }
}

/// A buffered candidate event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectedRecord {
    Allocation(ObjectHandle),
    DynamicCode {
        name: String,
        code_begin: usize,
        code_len: usize,
    },
}

#[derive(Debug)]
pub(crate) struct SlotEntry {
    owner: u64,
    enabled: bool,
    records: Vec<CollectedRecord>,
}

/// A thread's collector slots.
#[derive(Debug, Default)]
pub struct CollectorSlots {
    slots: [Option<SlotEntry>; CollectorKind::COUNT],
}

impl CollectorSlots {
    pub fn is_occupied(&self, kind: CollectorKind) -> bool {
        self.slots[kind.slot()].is_some()
    }

    /// Whether the occupant of `kind` currently accepts records.
    pub fn is_accepting(&self, kind: CollectorKind) -> bool {
        self.slots[kind.slot()]
            .as_ref()
            .is_some_and(|entry| entry.enabled)
    }

    fn get_mut(&mut self, kind: CollectorKind) -> Option<&mut SlotEntry> {
        self.slots[kind.slot()].as_mut()
    }

    fn take(&mut self, kind: CollectorKind) -> Option<SlotEntry> {
        self.slots[kind.slot()].take()
    }

    fn install(&mut self, kind: CollectorKind, entry: SlotEntry) {
        self.slots[kind.slot()] = Some(entry);
    }
}

/// State of an acquired collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    /// The event kind was disabled at acquisition
    Inactive,
    /// Owns the thread's slot and buffers records
    Accumulating,
    /// Another collector owns the slot
    Suppressed,
}

/// Where a record routed through a thread's slot ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Buffered,
    /// A collector is installed but not accepting (flushing or paused), or
    /// the record is never reported
    Discarded,
    NoCollector,
}

/// Scoped collector guard. Flushes on drop.
///
/// # Examples
///
/// ```
/// use vigil::collector::{CollectedRecord, CollectorKind, CollectorState};
/// use vigil::event::EventKind;
/// use vigil::interfaces::ThreadRef;
/// use vigil::payload::ObjectHandle;
/// use vigil::test_utils::{RecordingAgent, TestFixture};
///
/// let fixture = TestFixture::live();
/// let agent = RecordingAgent::new();
/// let env = fixture.register(&agent, &[EventKind::VmObjectAlloc]);
/// fixture.enable(env, EventKind::VmObjectAlloc);
///
/// let thread = ThreadRef::managed(1);
/// {
///     let collector = fixture.system.acquire_collector(CollectorKind::VmObjectAlloc, thread);
///     assert_eq!(collector.state(), CollectorState::Accumulating);
///     collector.record(CollectedRecord::Allocation(ObjectHandle(1)));
///     collector.record(CollectedRecord::Allocation(ObjectHandle(2)));
///     assert_eq!(agent.count(EventKind::VmObjectAlloc), 0);
/// }
/// assert_eq!(agent.count(EventKind::VmObjectAlloc), 2);
/// ```
pub struct EventCollector<'a> {
    dispatcher: &'a Dispatcher,
    kind: CollectorKind,
    thread: ThreadRef,
    state: CollectorState,
    owner: u64,
    thread_state: Option<Arc<ThreadEventState>>,
}

impl<'a> EventCollector<'a> {
    pub fn acquire(dispatcher: &'a Dispatcher, kind: CollectorKind, thread: ThreadRef) -> Self {
        let mut collector = Self {
            dispatcher,
            kind,
            thread,
            state: CollectorState::Inactive,
            owner: 0,
            thread_state: None,
        };

        if !dispatcher.is_enabled(kind.event_kind()) {
            return collector;
        }
        if kind == CollectorKind::SampledObjectAlloc && !thread.can_run_managed_code() {
            return collector;
        }

        let state = dispatcher.state_for(thread);
        {
            let mut slots = state.collectors();
            if slots.is_occupied(kind) {
                collector.state = CollectorState::Suppressed;
            } else {
                collector.owner = NEXT_OWNER.fetch_add(1, Ordering::Relaxed);
                slots.install(
                    kind,
                    SlotEntry {
                        owner: collector.owner,
                        enabled: true,
                        records: Vec::with_capacity(dispatcher.config().collector_initial_capacity),
                    },
                );
                collector.state = CollectorState::Accumulating;
                tracing::debug!(collector = ?kind, thread = %thread.key, "collector installed");
            }
        }
        collector.thread_state = Some(state);
        collector
    }

    pub fn kind(&self) -> CollectorKind {
        self.kind
    }

    pub fn state(&self) -> CollectorState {
        self.state
    }

    /// Buffer a candidate. No-op unless accumulating.
    pub fn record(&self, record: CollectedRecord) -> bool {
        let (CollectorState::Accumulating, Some(state)) = (self.state, &self.thread_state) else {
            return false;
        };
        let mut slots = state.collectors();
        match slots.get_mut(self.kind) {
            Some(entry) if entry.owner == self.owner && entry.enabled => {
                entry.records.push(record);
                true
            }
            _ => false,
        }
    }

    /// Records buffered so far.
    pub fn len(&self) -> usize {
        let Some(state) = &self.thread_state else {
            return 0;
        };
        if self.state != CollectorState::Accumulating {
            return 0;
        }
        state
            .collectors()
            .get_mut(self.kind)
            .filter(|entry| entry.owner == self.owner)
            .map_or(0, |entry| entry.records.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// End the scope now. Same as dropping the guard.
    pub fn release(self) {}

    fn flush(&mut self) {
        let Some(state) = self.thread_state.take() else {
            return;
        };
        let counters = self.dispatcher.counters();

        let records = {
            let mut slots = state.collectors();
            match slots.get_mut(self.kind) {
                Some(entry) if entry.owner == self.owner => {
                    entry.enabled = false;
                    std::mem::take(&mut entry.records)
                }
                _ => {
                    invariant!(
                        counters,
                        false,
                        "collector {:?} lost its slot before flush",
                        self.kind
                    );
                    return;
                }
            }
        };

        tracing::debug!(
            collector = ?self.kind,
            thread = %self.thread.key,
            records = records.len(),
            "flushing collector"
        );

        let event = self.kind.event_kind();
        for record in records {
            match self.resolve(record) {
                Some(payload) => {
                    if self.dispatcher.post(event, self.thread, &payload) > 0 {
                        counters.record_collector_flushed();
                    }
                }
                None => {
                    counters.record_collector_dropped();
                    tracing::warn!(
                        collector = ?self.kind,
                        thread = %self.thread.key,
                        "dropping collected record that can no longer be reported"
                    );
                }
            }
        }

        let popped = state.collectors().take(self.kind);
        invariant!(
            counters,
            popped.as_ref().map(|entry| entry.owner) == Some(self.owner),
            "collector {:?} slot changed owner during flush",
            self.kind
        );
    }

    fn resolve(&self, record: CollectedRecord) -> Option<EventPayload> {
        match record {
            CollectedRecord::Allocation(object) => {
                let identity = &self.dispatcher.collaborators().identity;
                if !identity.is_alive(object) {
                    return None;
                }
                Some(EventPayload::Allocation {
                    object,
                    class: identity.class_of(object),
                    size: identity.object_size(object),
                })
            }
            CollectedRecord::DynamicCode {
                name,
                code_begin,
                code_len,
            } => Some(EventPayload::DynamicCode {
                name,
                code_begin,
                code_len,
            }),
        }
    }
}

impl Drop for EventCollector<'_> {
    fn drop(&mut self) {
        if self.state == CollectorState::Accumulating {
            self.flush();
        }
    }
}

impl std::fmt::Debug for EventCollector<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCollector")
            .field("kind", &self.kind)
            .field("thread", &self.thread)
            .field("state", &self.state)
            .finish()
    }
}

/// Route a record raised on `thread` into whichever collector occupies its
/// slot for `kind`.
pub fn record_for_thread(
    dispatcher: &Dispatcher,
    thread: ThreadRef,
    kind: CollectorKind,
    record: CollectedRecord,
) -> RecordOutcome {
    let Some(state) = dispatcher.index().threads().get(thread.key) else {
        return RecordOutcome::NoCollector;
    };
    if let (CollectorKind::VmObjectAlloc, CollectedRecord::Allocation(object)) = (kind, &record) {
        if dispatcher.collaborators().identity.is_class_mirror(*object) {
            return RecordOutcome::Discarded;
        }
    }
    let mut slots = state.collectors();
    match slots.get_mut(kind) {
        None => RecordOutcome::NoCollector,
        Some(entry) if !entry.enabled => RecordOutcome::Discarded,
        Some(entry) => {
            entry.records.push(record);
            RecordOutcome::Buffered
        }
    }
}

/// Scope during which the thread's VM object allocation collector accepts
/// no records.
#[must_use = "collection resumes when the pause is dropped"]
pub struct CollectionPause {
    state: Option<Arc<ThreadEventState>>,
}

impl CollectionPause {
    pub fn new(dispatcher: &Dispatcher, thread: ThreadRef) -> Self {
        let state = dispatcher.index().threads().get(thread.key).filter(|state| {
            let mut slots = state.collectors();
            match slots.get_mut(CollectorKind::VmObjectAlloc) {
                Some(entry) if entry.enabled => {
                    entry.enabled = false;
                    true
                }
                _ => false,
            }
        });
        Self { state }
    }

    /// Whether this pause actually disabled a collector.
    pub fn is_active(&self) -> bool {
        self.state.is_some()
    }
}

impl Drop for CollectionPause {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            if let Some(entry) = state.collectors().get_mut(CollectorKind::VmObjectAlloc) {
                entry.enabled = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_events() {
        assert_eq!(CollectorKind::VmObjectAlloc.event_kind(), EventKind::VmObjectAlloc);
        assert_eq!(
            CollectorKind::DynamicCode.event_kind(),
            EventKind::DynamicCodeGenerated
        );
        for (i, kind) in CollectorKind::ALL.iter().enumerate() {
            assert_eq!(kind.slot(), i);
        }
    }

    #[test]
    fn slots_track_occupancy() {
        let mut slots = CollectorSlots::default();
        assert!(!slots.is_occupied(CollectorKind::DynamicCode));
        slots.install(
            CollectorKind::DynamicCode,
            SlotEntry {
                owner: 1,
                enabled: true,
                records: Vec::new(),
            },
        );
        assert!(slots.is_accepting(CollectorKind::DynamicCode));
        slots.get_mut(CollectorKind::DynamicCode).unwrap().enabled = false;
        assert!(slots.is_occupied(CollectorKind::DynamicCode));
        assert!(!slots.is_accepting(CollectorKind::DynamicCode));
        assert!(slots.take(CollectorKind::DynamicCode).is_some());
        assert!(!slots.is_occupied(CollectorKind::DynamicCode));
    }
}

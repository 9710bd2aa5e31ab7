//! Closed catalog of notifiable runtime events and bitsets over it.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::capabilities::Capabilities;
use crate::phase::Phase;

/// Identifies what happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventKind {
    VmInit = 0,
    VmDeath,
    VmStart,
    ThreadStart,
    ThreadEnd,
    ClassLoad,
    ClassPrepare,
    ClassUnload,
    VirtualThreadStart,
    VirtualThreadEnd,
    VirtualThreadMount,
    VirtualThreadUnmount,
    Breakpoint,
    SingleStep,
    FieldAccess,
    FieldModification,
    MethodEntry,
    MethodExit,
    FramePop,
    Exception,
    ExceptionCatch,
    MonitorContendedEnter,
    MonitorContendedEntered,
    MonitorWait,
    MonitorWaited,
    ObjectFree,
    ResourceExhausted,
    VmObjectAlloc,
    SampledObjectAlloc,
    GarbageCollectionStart,
    GarbageCollectionFinish,
    DataDumpRequest,
    NativeMethodBind,
    DynamicCodeGenerated,
    CompiledMethodLoad,
    CompiledMethodUnload,
}

/// Number of event kinds in the catalog.
pub const EVENT_COUNT: usize = 36;

impl EventKind {
    pub const ALL: [EventKind; EVENT_COUNT] = [
        EventKind::VmInit,
        EventKind::VmDeath,
        EventKind::VmStart,
        EventKind::ThreadStart,
        EventKind::ThreadEnd,
        EventKind::ClassLoad,
        EventKind::ClassPrepare,
        EventKind::ClassUnload,
        EventKind::VirtualThreadStart,
        EventKind::VirtualThreadEnd,
        EventKind::VirtualThreadMount,
        EventKind::VirtualThreadUnmount,
        EventKind::Breakpoint,
        EventKind::SingleStep,
        EventKind::FieldAccess,
        EventKind::FieldModification,
        EventKind::MethodEntry,
        EventKind::MethodExit,
        EventKind::FramePop,
        EventKind::Exception,
        EventKind::ExceptionCatch,
        EventKind::MonitorContendedEnter,
        EventKind::MonitorContendedEntered,
        EventKind::MonitorWait,
        EventKind::MonitorWaited,
        EventKind::ObjectFree,
        EventKind::ResourceExhausted,
        EventKind::VmObjectAlloc,
        EventKind::SampledObjectAlloc,
        EventKind::GarbageCollectionStart,
        EventKind::GarbageCollectionFinish,
        EventKind::DataDumpRequest,
        EventKind::NativeMethodBind,
        EventKind::DynamicCodeGenerated,
        EventKind::CompiledMethodLoad,
        EventKind::CompiledMethodUnload,
    ];

    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[inline(always)]
    const fn bit(self) -> u64 {
        1u64 << (self as u8)
    }

    /// Lowest phase in which the event may be generated at all.
    ///
    /// Events that hand agent-visible object, class or thread references to
    /// the callback need ONLOAD.
    pub const fn min_phase(self) -> Phase {
        match self {
            EventKind::VmStart => Phase::Start,
            EventKind::ClassUnload
            | EventKind::ObjectFree
            | EventKind::ResourceExhausted
            | EventKind::GarbageCollectionStart
            | EventKind::GarbageCollectionFinish
            | EventKind::DataDumpRequest
            | EventKind::NativeMethodBind
            | EventKind::DynamicCodeGenerated
            | EventKind::CompiledMethodLoad
            | EventKind::CompiledMethodUnload => Phase::Primordial,
            _ => Phase::Onload,
        }
    }

    /// Whether the event may be enabled for an individual thread. VM-global
    /// events can only be controlled process-wide.
    pub const fn is_thread_filterable(self) -> bool {
        !matches!(
            self,
            EventKind::VmInit
                | EventKind::VmStart
                | EventKind::VmDeath
                | EventKind::ThreadStart
                | EventKind::VirtualThreadStart
                | EventKind::CompiledMethodLoad
                | EventKind::CompiledMethodUnload
                | EventKind::DynamicCodeGenerated
                | EventKind::DataDumpRequest
        )
    }

    /// Breakpoint and single step are de-duplicated per location.
    pub const fn is_location_gated(self) -> bool {
        matches!(self, EventKind::Breakpoint | EventKind::SingleStep)
    }

    /// Events that can only be produced while the thread runs in the
    /// interpreter.
    pub const fn requires_interp_only(self) -> bool {
        matches!(
            self,
            EventKind::SingleStep
                | EventKind::MethodEntry
                | EventKind::MethodExit
                | EventKind::FramePop
        )
    }

    /// Capability an environment must hold to enable this event.
    pub fn required_capability(self) -> Capabilities {
        match self {
            EventKind::Breakpoint => Capabilities::CAN_GENERATE_BREAKPOINTS,
            EventKind::SingleStep => Capabilities::CAN_GENERATE_SINGLE_STEP,
            EventKind::FieldAccess => Capabilities::CAN_GENERATE_FIELD_ACCESS,
            EventKind::FieldModification => Capabilities::CAN_GENERATE_FIELD_MODIFICATION,
            EventKind::MethodEntry => Capabilities::CAN_GENERATE_METHOD_ENTRY,
            EventKind::MethodExit => Capabilities::CAN_GENERATE_METHOD_EXIT,
            EventKind::FramePop => Capabilities::CAN_GENERATE_FRAME_POP,
            EventKind::Exception | EventKind::ExceptionCatch => {
                Capabilities::CAN_GENERATE_EXCEPTION_EVENTS
            }
            EventKind::MonitorContendedEnter
            | EventKind::MonitorContendedEntered
            | EventKind::MonitorWait
            | EventKind::MonitorWaited => Capabilities::CAN_GENERATE_MONITOR_EVENTS,
            EventKind::ObjectFree => Capabilities::CAN_GENERATE_OBJECT_FREE,
            EventKind::ResourceExhausted => Capabilities::CAN_GENERATE_RESOURCE_EXHAUSTION,
            EventKind::VmObjectAlloc => Capabilities::CAN_GENERATE_VM_OBJECT_ALLOC,
            EventKind::SampledObjectAlloc => Capabilities::CAN_GENERATE_SAMPLED_ALLOC,
            EventKind::GarbageCollectionStart | EventKind::GarbageCollectionFinish => {
                Capabilities::CAN_GENERATE_GC_EVENTS
            }
            EventKind::NativeMethodBind => Capabilities::CAN_GENERATE_NATIVE_METHOD_BIND,
            EventKind::CompiledMethodLoad | EventKind::CompiledMethodUnload => {
                Capabilities::CAN_GENERATE_COMPILED_METHOD_LOAD
            }
            EventKind::VirtualThreadStart
            | EventKind::VirtualThreadEnd
            | EventKind::VirtualThreadMount
            | EventKind::VirtualThreadUnmount => Capabilities::CAN_SUPPORT_VIRTUAL_THREADS,
            _ => Capabilities::empty(),
        }
    }
}

/// Plain bitset of event kinds.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventSet(u64);

impl EventSet {
    pub const EMPTY: EventSet = EventSet(0);

    pub const fn from_bits(bits: u64) -> Self {
        EventSet(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn all() -> Self {
        EventKind::ALL.iter().copied().collect()
    }

    /// Kinds that force the interpreter.
    pub fn interp_only() -> Self {
        EventKind::ALL
            .iter()
            .copied()
            .filter(|k| k.requires_interp_only())
            .collect()
    }

    /// Kinds that may be enabled per thread.
    pub fn thread_filterable() -> Self {
        EventKind::ALL
            .iter()
            .copied()
            .filter(|k| k.is_thread_filterable())
            .collect()
    }

    #[inline(always)]
    pub const fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn insert(&mut self, kind: EventKind) -> bool {
        let was = self.contains(kind);
        self.0 |= kind.bit();
        !was
    }

    pub fn remove(&mut self, kind: EventKind) -> bool {
        let was = self.contains(kind);
        self.0 &= !kind.bit();
        was
    }

    pub fn set(&mut self, kind: EventKind, on: bool) -> bool {
        if on { self.insert(kind) } else { self.remove(kind) }
    }

    pub const fn union(self, other: EventSet) -> EventSet {
        EventSet(self.0 | other.0)
    }

    pub const fn intersection(self, other: EventSet) -> EventSet {
        EventSet(self.0 & other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn is_subset_of(self, other: EventSet) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = EventKind> {
        EventKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl FromIterator<EventKind> for EventSet {
    fn from_iter<I: IntoIterator<Item = EventKind>>(iter: I) -> Self {
        let mut set = EventSet::EMPTY;
        for kind in iter {
            set.insert(kind);
        }
        set
    }
}

impl std::fmt::Debug for EventSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Event bitset readable without locks.
///
/// Readers use relaxed loads; writers publish whole words, so a reader
/// always sees some complete recomputation result.
#[derive(Default)]
pub struct AtomicEventSet(AtomicU64);

impl AtomicEventSet {
    pub const fn new() -> Self {
        AtomicEventSet(AtomicU64::new(0))
    }

    #[inline(always)]
    pub fn contains(&self, kind: EventKind) -> bool {
        self.0.load(Ordering::Relaxed) & kind.bit() != 0
    }

    #[inline(always)]
    pub fn load(&self) -> EventSet {
        EventSet(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, set: EventSet) {
        self.0.store(set.0, Ordering::Release);
    }

    /// Set or clear one kind; returns the previous membership.
    pub fn set(&self, kind: EventKind, on: bool) -> bool {
        let previous = if on {
            self.0.fetch_or(kind.bit(), Ordering::AcqRel)
        } else {
            self.0.fetch_and(!kind.bit(), Ordering::AcqRel)
        };
        previous & kind.bit() != 0
    }
}

impl std::fmt::Debug for AtomicEventSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.load().fmt(f)
    }
}

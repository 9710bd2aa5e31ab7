//! Process-wide lifecycle phase gate.
//!
//! The gate is read on nearly every dispatch entry point, so `current()` is a
//! single atomic load. Transitions are rare and serialize on a small mutex
//! that also backs a condvar for callers waiting on a phase.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use crate::error::{EventError, EventResult};

/// Lifecycle phase of the runtime, in transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Phase {
    Primordial = 0,
    Start = 1,
    Onload = 2,
    Live = 3,
    Dead = 4,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Primordial,
        Phase::Start,
        Phase::Onload,
        Phase::Live,
        Phase::Dead,
    ];

    fn from_u8(raw: u8) -> Phase {
        match raw {
            0 => Phase::Primordial,
            1 => Phase::Start,
            2 => Phase::Onload,
            3 => Phase::Live,
            _ => Phase::Dead,
        }
    }

    /// The only phase `advance` will accept next.
    pub fn successor(self) -> Option<Phase> {
        match self {
            Phase::Primordial => Some(Phase::Start),
            Phase::Start => Some(Phase::Onload),
            Phase::Onload => Some(Phase::Live),
            Phase::Live => Some(Phase::Dead),
            Phase::Dead => None,
        }
    }
}

/// Monotonic phase gate.
///
/// # Examples
///
/// ```
/// use vigil::phase::{Phase, PhaseGate};
///
/// let gate = PhaseGate::new();
/// assert_eq!(gate.current(), Phase::Primordial);
///
/// gate.advance(Phase::Start).unwrap();
/// assert!(gate.is_at_least(Phase::Start));
///
/// // Skipping or moving backward is rejected without side effects
/// assert!(gate.advance(Phase::Live).is_err());
/// assert!(gate.advance(Phase::Primordial).is_err());
/// assert_eq!(gate.current(), Phase::Start);
/// ```
pub struct PhaseGate {
    phase: AtomicU8,
    early_start_recorded: AtomicU8,
    transition_lock: Mutex<()>,
    phase_changed: Condvar,
}

impl PhaseGate {
    pub fn new() -> Self {
        PhaseGate {
            phase: AtomicU8::new(Phase::Primordial as u8),
            early_start_recorded: AtomicU8::new(0),
            transition_lock: Mutex::new(()),
            phase_changed: Condvar::new(),
        }
    }

    #[inline(always)]
    pub fn current(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn is_at_least(&self, phase: Phase) -> bool {
        self.phase.load(Ordering::Acquire) >= phase as u8
    }

    #[inline(always)]
    pub fn is_dead(&self) -> bool {
        self.is_at_least(Phase::Dead)
    }

    /// Move to `next`, which must be the immediate successor of the current
    /// phase. DEAD is terminal.
    pub fn advance(&self, next: Phase) -> EventResult<()> {
        let _guard = self.transition_lock.lock();
        let from = self.current();
        if from.successor() != Some(next) {
            return Err(EventError::InvalidPhaseTransition { from, to: next });
        }
        self.phase.store(next as u8, Ordering::Release);
        tracing::debug!(?from, to = ?next, "phase transition");
        self.phase_changed.notify_all();
        Ok(())
    }

    /// Record that the runtime began its early start sequence. Only meaningful
    /// before START; environments flagged as early may then see VM start.
    pub fn record_early_start(&self) {
        self.early_start_recorded.store(1, Ordering::Release);
    }

    pub fn early_start_recorded(&self) -> bool {
        self.early_start_recorded.load(Ordering::Acquire) != 0
    }

    /// Block until the gate reaches `phase`. Returns false on timeout.
    pub fn wait_until_at_least(&self, phase: Phase, timeout: Duration) -> bool {
        let mut guard = self.transition_lock.lock();
        if self.is_at_least(phase) {
            return true;
        }
        let result = self
            .phase_changed
            .wait_while_for(&mut guard, |_| !self.is_at_least(phase), timeout);
        !result.timed_out() || self.is_at_least(phase)
    }
}

impl Default for PhaseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PhaseGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PhaseGate").field(&self.current()).finish()
    }
}

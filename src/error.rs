//! Error types for the event core.

use thiserror::Error;

use crate::capabilities::Capabilities;
use crate::environment::EnvironmentId;
use crate::event::EventKind;
use crate::interfaces::ThreadKey;
use crate::phase::Phase;

/// Errors returned to the runtime or to agents by the event core.
///
/// Agent callback faults never surface here. They are caught, logged and
/// cleared at the safe-call boundary.
///
/// # Examples
///
/// ```
/// use vigil::error::{EventError, EventResult};
/// use vigil::phase::Phase;
///
/// let err = EventError::InvalidPhaseTransition {
///     from: Phase::Live,
///     to: Phase::Start,
/// };
/// assert_eq!(err.to_string(), "invalid phase transition from Live to Start");
///
/// let ok: EventResult<u32> = Ok(7);
/// assert!(ok.is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    /// The phase gate only moves forward one step at a time
    #[error("invalid phase transition from {from:?} to {to:?}")]
    InvalidPhaseTransition { from: Phase, to: Phase },
    /// The runtime already reached the DEAD phase
    #[error("runtime is dead")]
    RuntimeDead,
    /// No environment with this identity was ever registered
    #[error("unknown environment {0}")]
    UnknownEnvironment(EnvironmentId),
    /// The environment was disposed and accepts no further changes
    #[error("environment {0} has been disposed")]
    EnvironmentDisposed(EnvironmentId),
    /// Enabling this event needs a capability the environment lacks
    #[error("event {kind:?} requires capability {required:?}")]
    MissingCapability {
        kind: EventKind,
        required: Capabilities,
    },
    /// VM-global events cannot be enabled for a single thread
    #[error("event {0:?} cannot be controlled per thread")]
    ThreadFilterNotAllowed(EventKind),
    /// The thread has terminated and its event state was reaped
    #[error("no event state for thread {0}")]
    NoThreadState(ThreadKey),
    /// The deferred queue is at capacity
    #[error("deferred queue full (capacity {capacity})")]
    QueueFull { capacity: usize },
    /// The background delivery worker could not be started
    #[error("failed to spawn delivery worker: {0}")]
    WorkerSpawn(String),
    /// The background delivery worker is gone
    #[error("delivery worker unavailable")]
    WorkerUnavailable,
}

/// Result type for event core operations
pub type EventResult<T> = Result<T, EventError>;

/// Fault reported by an agent callback.
///
/// Returned from a callback to signal that it raised an error the runtime did
/// not expect. The fault is logged and cleared; the triggering operation
/// continues as if the callback had returned normally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("agent fault: {message}")]
pub struct AgentFault {
    pub message: String,
}

impl AgentFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Check an engine invariant.
///
/// Fatal in development builds. Release builds log the violation and bump the
/// `invariant_violations` counter on the given stats block.
#[macro_export]
macro_rules! invariant {
    ($stats:expr, $cond:expr, $($msg:tt)+) => {
        let ok: bool = $cond;
        if !ok {
            debug_assert!(ok, $($msg)+);
            $stats.record_invariant_violation();
            ::tracing::error!($($msg)+);
        }
    };
}

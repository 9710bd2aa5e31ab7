// Thread identity, execution-context switching and background worker
// scheduling.
//
// The event core never inspects a thread itself. It only needs a stable key,
// the kind of thread (to decide which events it may raise), a way to leave the
// runtime's managed-safe state around agent code, and a way to start its one
// delivery worker.

use dashmap::DashMap;
use std::fmt;
use std::thread::JoinHandle;

use crate::error::{EventError, EventResult};

/// Stable identity of a runtime thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadKey(pub u64);

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// Kind of runtime thread raising an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadKind {
    /// Platform thread running managed code
    Managed,
    /// Virtual thread mounted on a carrier
    Virtual,
    /// Runtime service thread (runs deferred delivery)
    Service,
    /// JIT compiler thread; cannot run managed code
    Compiler,
    /// Other runtime-internal thread (GC workers, VM thread)
    System,
}

/// A thread as seen by the event core.
///
/// # Examples
///
/// ```
/// use vigil::interfaces::{ThreadKind, ThreadRef};
///
/// let t = ThreadRef::managed(7);
/// assert_eq!(t.kind, ThreadKind::Managed);
/// assert!(t.can_run_managed_code());
/// assert!(!ThreadRef::compiler(8).can_run_managed_code());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadRef {
    pub key: ThreadKey,
    pub kind: ThreadKind,
    /// Hidden from external view; no thread lifecycle events are posted
    pub hidden: bool,
}

impl ThreadRef {
    pub const fn new(id: u64, kind: ThreadKind) -> Self {
        Self {
            key: ThreadKey(id),
            kind,
            hidden: false,
        }
    }

    pub const fn managed(id: u64) -> Self {
        Self::new(id, ThreadKind::Managed)
    }

    pub const fn virtual_thread(id: u64) -> Self {
        Self::new(id, ThreadKind::Virtual)
    }

    pub const fn service(id: u64) -> Self {
        Self::new(id, ThreadKind::Service)
    }

    pub const fn compiler(id: u64) -> Self {
        Self::new(id, ThreadKind::Compiler)
    }

    pub const fn system(id: u64) -> Self {
        Self::new(id, ThreadKind::System)
    }

    pub const fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub const fn can_run_managed_code(&self) -> bool {
        matches!(
            self.kind,
            ThreadKind::Managed | ThreadKind::Virtual | ThreadKind::Service
        )
    }
}

/// Runtime-visible execution state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecState {
    /// Executing compiled or interpreted managed code
    InManaged,
    /// Executing runtime code
    #[default]
    InRuntime,
    /// Executing foreign (agent) code; safepoints proceed without it
    InNative,
    Blocked,
}

/// State saved by `leave_managed` and handed back to `return_to_managed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextToken(pub ExecState);

/// Primitive the safe-call transition uses to run agent code.
pub trait ExecutionContextSwitch: Send + Sync + 'static {
    /// Move the thread into a state where it may run agent code.
    fn leave_managed(&self, thread: &ThreadRef) -> ContextToken;
    /// Undo `leave_managed`.
    fn return_to_managed(&self, thread: &ThreadRef, token: ContextToken);
}

/// Production adapter tracking each thread's execution state in a map.
#[derive(Debug, Default)]
pub struct ThreadStateSwitch {
    states: DashMap<ThreadKey, ExecState>,
}

impl ThreadStateSwitch {
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
        }
    }

    pub fn state_of(&self, thread: ThreadKey) -> ExecState {
        self.states
            .get(&thread)
            .map(|s| *s.value())
            .unwrap_or_default()
    }

    /// Threads currently away from the default state.
    pub fn tracked_threads(&self) -> usize {
        self.states.len()
    }
}

impl ExecutionContextSwitch for ThreadStateSwitch {
    fn leave_managed(&self, thread: &ThreadRef) -> ContextToken {
        let previous = self
            .states
            .insert(thread.key, ExecState::InNative)
            .unwrap_or_default();
        ContextToken(previous)
    }

    fn return_to_managed(&self, thread: &ThreadRef, token: ContextToken) {
        if token.0 == ExecState::default() {
            self.states.remove(&thread.key);
        } else {
            self.states.insert(thread.key, token.0);
        }
    }
}

/// Handle to the delivery worker.
#[derive(Debug)]
pub struct WorkerHandle {
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn from_join(join: JoinHandle<()>) -> Self {
        Self { join: Some(join) }
    }

    /// Handle for a worker whose lifetime the scheduler manages itself.
    pub fn detached() -> Self {
        Self { join: None }
    }

    pub fn join(mut self) -> EventResult<()> {
        match self.join.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| EventError::WorkerSpawn("delivery worker panicked".into())),
            None => Ok(()),
        }
    }
}

/// Background worker scheduling.
pub trait WorkerScheduler: Send + Sync + 'static {
    fn spawn_worker(
        &self,
        name: &str,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> EventResult<WorkerHandle>;
}

/// Spawns the worker as a named OS thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsThreadScheduler;

impl WorkerScheduler for OsThreadScheduler {
    fn spawn_worker(
        &self,
        name: &str,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> EventResult<WorkerHandle> {
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map(WorkerHandle::from_join)
            .map_err(|e| EventError::WorkerSpawn(e.to_string()))
    }
}

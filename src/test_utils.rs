//! Test utilities for event core tests
//!
//! Shared fixtures so unit tests, integration tests, doctests and benches
//! set up the event system the same way.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::capabilities::Capabilities;
use crate::config::EventConfig;
use crate::environment::{CallbackTable, EnvFlags, EnvironmentId};
use crate::event::EventKind;
use crate::interfaces::{CatchSite, Collaborators, StackIntrospection, ThreadRef};
use crate::payload::{EventPayload, Location, MethodHandle, ObjectHandle};
use crate::phase::Phase;
use crate::system::{EnableScope, EventSystem};

/// One callback invocation seen by a [`RecordingAgent`].
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub env: EnvironmentId,
    pub kind: EventKind,
    pub thread: ThreadRef,
    pub payload: EventPayload,
}

/// Agent that records every callback it receives.
///
/// # Examples
///
/// ```
/// use vigil::event::EventKind;
/// use vigil::interfaces::ThreadRef;
/// use vigil::payload::{ClassHandle, EventPayload};
/// use vigil::test_utils::{RecordingAgent, TestFixture};
///
/// let fixture = TestFixture::live();
/// let agent = RecordingAgent::new();
/// let env = fixture.register(&agent, &[EventKind::ClassLoad]);
/// fixture.enable(env, EventKind::ClassLoad);
///
/// let payload = EventPayload::Class { class: ClassHandle(3) };
/// fixture.system.post(EventKind::ClassLoad, ThreadRef::managed(1), &payload);
/// assert_eq!(agent.count(EventKind::ClassLoad), 1);
/// assert_eq!(agent.envs_for(EventKind::ClassLoad), vec![env]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RecordingAgent {
    log: Arc<Mutex<Vec<Recorded>>>,
}

impl RecordingAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback table recording `kinds`.
    pub fn callbacks(&self, kinds: &[EventKind]) -> CallbackTable {
        kinds.iter().fold(CallbackTable::new(), |table, kind| {
            let log = Arc::clone(&self.log);
            table.with(*kind, move |ctx| {
                log.lock().push(Recorded {
                    env: ctx.env_id(),
                    kind: ctx.kind(),
                    thread: ctx.thread(),
                    payload: ctx.payload().clone(),
                });
                Ok(())
            })
        })
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.log.lock().iter().filter(|r| r.kind == kind).count()
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.log.lock().clone()
    }

    /// Environments that received `kind`, in delivery order.
    pub fn envs_for(&self, kind: EventKind) -> Vec<EnvironmentId> {
        self.log
            .lock()
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.env)
            .collect()
    }

    pub fn payloads(&self, kind: EventKind) -> Vec<EventPayload> {
        self.log
            .lock()
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.payload.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.log.lock().clear();
    }
}

/// Stack collaborator whose answers tests set directly.
#[derive(Debug, Default)]
pub struct ScriptedStack {
    depth: AtomicI32,
    catch_site: Mutex<Option<CatchSite>>,
}

impl ScriptedStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_depth(&self, depth: i32) {
        self.depth.store(depth, Ordering::Relaxed);
    }

    pub fn set_catch_site(&self, method: MethodHandle, location: Location) {
        *self.catch_site.lock() = Some(CatchSite { method, location });
    }
}

impl StackIntrospection for ScriptedStack {
    fn frame_depth(&self, _thread: &ThreadRef) -> i32 {
        self.depth.load(Ordering::Relaxed)
    }

    fn find_exception_handler(
        &self,
        _thread: &ThreadRef,
        _exception: ObjectHandle,
    ) -> Option<CatchSite> {
        *self.catch_site.lock()
    }
}

/// Test fixture wrapping an [`EventSystem`].
///
/// Environments registered through the fixture hold every capability, so
/// tests only fail on the check they are exercising.
pub struct TestFixture {
    pub system: EventSystem,
}

impl TestFixture {
    /// Fresh system in PRIMORDIAL.
    pub fn new() -> Self {
        Self::with_parts(EventConfig::default(), Collaborators::default())
    }

    /// Fresh system already advanced to LIVE.
    pub fn live() -> Self {
        let fixture = Self::new();
        fixture.advance_to_live();
        fixture
    }

    pub fn with_collaborators(collaborators: Collaborators) -> Self {
        Self::with_parts(EventConfig::default(), collaborators)
    }

    pub fn with_config(config: EventConfig) -> Self {
        Self::with_parts(config, Collaborators::default())
    }

    pub fn with_parts(config: EventConfig, collaborators: Collaborators) -> Self {
        match EventSystem::new(config, collaborators) {
            Ok(system) => Self { system },
            Err(error) => panic!("failed to start event system: {error}"),
        }
    }

    /// Advance through every phase up to LIVE from wherever the gate is.
    pub fn advance_to_live(&self) {
        while self.system.phase() < Phase::Live {
            let Some(next) = self.system.phase().successor() else {
                break;
            };
            if let Err(error) = self.system.advance(next) {
                panic!("phase advance failed: {error}");
            }
        }
    }

    pub fn register(&self, agent: &RecordingAgent, kinds: &[EventKind]) -> EnvironmentId {
        self.register_with_flags(agent, kinds, EnvFlags::empty())
    }

    pub fn register_with_flags(
        &self,
        agent: &RecordingAgent,
        kinds: &[EventKind],
        flags: EnvFlags,
    ) -> EnvironmentId {
        match self
            .system
            .register(Capabilities::potential(), agent.callbacks(kinds), flags)
        {
            Ok(env) => env,
            Err(error) => panic!("register failed: {error}"),
        }
    }

    pub fn enable(&self, env: EnvironmentId, kind: EventKind) {
        self.set(env, kind, EnableScope::Global, true);
    }

    pub fn disable(&self, env: EnvironmentId, kind: EventKind) {
        self.set(env, kind, EnableScope::Global, false);
    }

    pub fn enable_for(&self, env: EnvironmentId, kind: EventKind, thread: ThreadRef) {
        self.set(env, kind, EnableScope::Thread(thread), true);
    }

    fn set(&self, env: EnvironmentId, kind: EventKind, scope: EnableScope, enabled: bool) {
        if let Err(error) = self.system.set_event_enabled(env, kind, scope, enabled) {
            panic!("set_event_enabled({kind:?}, {scope:?}, {enabled}) failed: {error}");
        }
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience macro for creating a test fixture
#[macro_export]
macro_rules! test_fixture {
    () => {
        $crate::test_utils::TestFixture::new()
    };
    (live) => {
        $crate::test_utils::TestFixture::live()
    };
    ($collaborators:expr) => {
        $crate::test_utils::TestFixture::with_collaborators($collaborators)
    };
}

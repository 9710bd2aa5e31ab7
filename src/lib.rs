//! Event-notification core for a managed runtime.
//!
//! Agents register as environments, subscribe to event kinds process-wide or
//! per thread, and receive synchronous callbacks when runtime subsystems post
//! events. Events that cannot be delivered from where they are raised go
//! through a single background worker; high-frequency allocation and code
//! generation events can be batched in per-thread collectors.
//!
//! # Examples
//!
//! ```
//! use vigil::event::EventKind;
//! use vigil::interfaces::ThreadRef;
//! use vigil::payload::{Location, MethodHandle};
//! use vigil::test_utils::{RecordingAgent, TestFixture};
//!
//! let fixture = TestFixture::live();
//! let agent = RecordingAgent::new();
//! let env = fixture.register(&agent, &[EventKind::Breakpoint]);
//! let thread = ThreadRef::managed(1);
//! fixture.enable_for(env, EventKind::Breakpoint, thread);
//!
//! let system = &fixture.system;
//! assert_eq!(system.post_breakpoint(thread, MethodHandle(1), Location(8)), 1);
//! // Same location again before moving: suppressed
//! assert_eq!(system.post_breakpoint(thread, MethodHandle(1), Location(8)), 0);
//! // Another thread is not subscribed
//! assert_eq!(system.post_breakpoint(ThreadRef::managed(2), MethodHandle(1), Location(8)), 0);
//! ```

pub mod capabilities;
pub mod collector;
pub mod config;
pub mod deferred;
pub mod dispatch;
pub mod enablement;
pub mod environment;
pub mod error;
pub mod event;
pub mod interfaces;
pub mod notify;
pub mod payload;
pub mod phase;
pub mod registry;
pub mod stats;
pub mod system;
pub mod test_utils;
pub mod thread_state;
pub mod transition;

pub use capabilities::Capabilities;
pub use collector::{CollectedRecord, CollectorKind, CollectorState, EventCollector, RecordOutcome};
pub use config::EventConfig;
pub use deferred::DeferredEvent;
pub use environment::{CallbackTable, EnvFlags, EnvironmentId};
pub use error::{AgentFault, EventError, EventResult};
pub use event::{EventKind, EventSet};
pub use payload::EventPayload;
pub use phase::Phase;
pub use stats::EventStats;
pub use system::{EnableScope, EventSystem};
pub use transition::EventContext;

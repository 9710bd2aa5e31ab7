//! Location de-duplication for single step and breakpoint.

mod common;

use proptest::prelude::*;

use vigil::event::EventKind;
use vigil::interfaces::ThreadRef;
use vigil::payload::{Location, MethodHandle};
use vigil::test_utils::{RecordingAgent, TestFixture};

proptest! {
    /// Replaying a walk over locations delivers exactly one step per run of
    /// equal consecutive locations.
    #[test]
    fn single_step_delivers_once_per_location_run(
        walk in prop::collection::vec((0u64..3, 0i64..4), 1..60)
    ) {
        let fixture = TestFixture::live();
        let agent = RecordingAgent::new();
        let env = fixture.register(&agent, &[EventKind::SingleStep]);
        let thread = ThreadRef::managed(1);
        fixture.enable_for(env, EventKind::SingleStep, thread);

        let mut expected = 0;
        let mut previous = None;
        for (method, location) in &walk {
            let here = (MethodHandle(*method), Location(*location));
            if previous != Some(here) {
                expected += 1;
            }
            previous = Some(here);
            fixture.system.post_single_step(thread, here.0, here.1);
        }

        prop_assert_eq!(agent.count(EventKind::SingleStep), expected);
        prop_assert_eq!(
            fixture.system.stats().duplicates_suppressed,
            walk.len() - expected
        );
    }
}

#[test]
fn breakpoint_and_step_at_one_location_both_arrive_once() {
    common::init_test_tracing();
    let fixture = TestFixture::live();
    let agent = RecordingAgent::new();
    let env = fixture.register(&agent, &[EventKind::SingleStep, EventKind::Breakpoint]);
    let thread = ThreadRef::managed(1);
    fixture.enable_for(env, EventKind::SingleStep, thread);
    fixture.enable_for(env, EventKind::Breakpoint, thread);

    let (m, l) = (MethodHandle(1), Location(10));
    assert_eq!(fixture.system.post_breakpoint(thread, m, l), 1);
    assert_eq!(fixture.system.post_single_step(thread, m, l), 1);
    assert_eq!(fixture.system.post_breakpoint(thread, m, l), 0);
    assert_eq!(fixture.system.post_single_step(thread, m, l), 0);
}

#[test]
fn environments_deduplicate_independently() {
    let fixture = TestFixture::live();
    let first = RecordingAgent::new();
    let second = RecordingAgent::new();
    let a = fixture.register(&first, &[EventKind::Breakpoint]);
    let b = fixture.register(&second, &[EventKind::Breakpoint]);
    fixture.enable(a, EventKind::Breakpoint);
    let thread = ThreadRef::managed(1);

    let (m, l) = (MethodHandle(1), Location(10));
    assert_eq!(fixture.system.post_breakpoint(thread, m, l), 1);
    // b subscribes while the thread sits at the location; it has not seen it yet
    fixture.enable(b, EventKind::Breakpoint);
    assert_eq!(fixture.system.post_breakpoint(thread, m, l), 1);
    assert_eq!(first.count(EventKind::Breakpoint), 1);
    assert_eq!(second.count(EventKind::Breakpoint), 1);
}

#[test]
fn threads_track_locations_separately() {
    let fixture = TestFixture::live();
    let agent = RecordingAgent::new();
    let env = fixture.register(&agent, &[EventKind::Breakpoint]);
    fixture.enable(env, EventKind::Breakpoint);

    let (m, l) = (MethodHandle(1), Location(10));
    assert_eq!(fixture.system.post_breakpoint(ThreadRef::managed(1), m, l), 1);
    assert_eq!(fixture.system.post_breakpoint(ThreadRef::managed(2), m, l), 1);
    assert_eq!(fixture.system.post_breakpoint(ThreadRef::managed(1), m, l), 0);
}

#[test]
fn clearing_the_location_rearms_delivery() {
    let fixture = TestFixture::live();
    let agent = RecordingAgent::new();
    let env = fixture.register(&agent, &[EventKind::Breakpoint]);
    fixture.enable(env, EventKind::Breakpoint);
    let thread = ThreadRef::managed(1);

    let (m, l) = (MethodHandle(1), Location(10));
    assert_eq!(fixture.system.post_breakpoint(thread, m, l), 1);
    assert_eq!(fixture.system.post_breakpoint(thread, m, l), 0);
    fixture.system.clear_current_location(env, thread).unwrap();
    assert_eq!(fixture.system.post_breakpoint(thread, m, l), 1);
}

#[test]
fn hidden_single_stepping_suppresses_steps_only() {
    let fixture = TestFixture::live();
    let agent = RecordingAgent::new();
    let env = fixture.register(&agent, &[EventKind::SingleStep, EventKind::Breakpoint]);
    let thread = ThreadRef::managed(1);
    fixture.enable_for(env, EventKind::SingleStep, thread);
    fixture.enable_for(env, EventKind::Breakpoint, thread);

    fixture.system.hide_single_stepping(thread);
    assert_eq!(fixture.system.post_single_step(thread, MethodHandle(1), Location(1)), 0);
    assert_eq!(fixture.system.post_breakpoint(thread, MethodHandle(1), Location(2)), 1);
    fixture.system.expose_single_stepping(thread);
    assert_eq!(fixture.system.post_single_step(thread, MethodHandle(1), Location(3)), 1);
}

//! Phase gate ordering and phase-dependent delivery.

mod common;

use vigil::error::EventError;
use vigil::event::EventKind;
use vigil::interfaces::ThreadRef;
use vigil::payload::{ClassHandle, EventPayload};
use vigil::phase::Phase;
use vigil::test_utils::{RecordingAgent, TestFixture};

#[test]
fn phases_advance_in_order_and_reject_skips() {
    common::init_test_tracing();
    let fixture = TestFixture::new();
    let system = &fixture.system;

    assert_eq!(
        system.advance(Phase::Onload),
        Err(EventError::InvalidPhaseTransition {
            from: Phase::Primordial,
            to: Phase::Onload
        })
    );
    assert_eq!(system.phase(), Phase::Primordial);

    system.advance(Phase::Start).unwrap();
    assert!(system.advance(Phase::Primordial).is_err());
    assert!(system.advance(Phase::Start).is_err());
    assert_eq!(system.phase(), Phase::Start);

    system.advance(Phase::Onload).unwrap();
    system.advance(Phase::Live).unwrap();
    system.advance(Phase::Dead).unwrap();
    assert!(system.gate().is_dead());
    assert!(system.advance(Phase::Dead).is_err());
}

#[test]
fn onload_events_are_dropped_until_onload() {
    let fixture = TestFixture::new();
    let agent = RecordingAgent::new();
    let env = fixture.register(&agent, &[EventKind::ClassLoad]);
    fixture.enable(env, EventKind::ClassLoad);
    let payload = EventPayload::Class { class: ClassHandle(1) };
    let thread = ThreadRef::managed(1);

    assert_eq!(fixture.system.post(EventKind::ClassLoad, thread, &payload), 0);
    fixture.system.advance(Phase::Start).unwrap();
    assert_eq!(fixture.system.post(EventKind::ClassLoad, thread, &payload), 0);
    assert_eq!(agent.count(EventKind::ClassLoad), 0);

    fixture.system.advance(Phase::Onload).unwrap();
    assert_eq!(fixture.system.post(EventKind::ClassLoad, thread, &payload), 1);
    fixture.system.advance(Phase::Live).unwrap();
    assert_eq!(fixture.system.post(EventKind::ClassLoad, thread, &payload), 1);
    assert_eq!(agent.count(EventKind::ClassLoad), 2);
}

#[test]
fn nothing_is_delivered_after_dead() {
    let fixture = TestFixture::live();
    let agent = RecordingAgent::new();
    let env = fixture.register(&agent, &[EventKind::ClassLoad, EventKind::VmDeath]);
    fixture.enable(env, EventKind::ClassLoad);
    fixture.enable(env, EventKind::VmDeath);

    fixture.system.advance(Phase::Dead).unwrap();
    assert_eq!(agent.count(EventKind::VmDeath), 1);

    let payload = EventPayload::Class { class: ClassHandle(1) };
    assert_eq!(fixture.system.post(EventKind::ClassLoad, ThreadRef::managed(1), &payload), 0);
    assert_eq!(agent.count(EventKind::ClassLoad), 0);
}

#[test]
fn registration_fails_after_dead() {
    let fixture = TestFixture::live();
    fixture.system.advance(Phase::Dead).unwrap();
    let agent = RecordingAgent::new();
    let result = fixture.system.register(
        vigil::Capabilities::empty(),
        agent.callbacks(&[EventKind::ClassLoad]),
        vigil::EnvFlags::empty(),
    );
    assert_eq!(result, Err(EventError::RuntimeDead));
}

#[test]
fn early_environments_see_primordial_events() {
    let fixture = TestFixture::new();
    let early = RecordingAgent::new();
    let ordinary = RecordingAgent::new();
    let early_env = fixture.register_with_flags(
        &early,
        &[EventKind::NativeMethodBind],
        vigil::EnvFlags::EARLY_VMSTART,
    );
    let ordinary_env = fixture.register(&ordinary, &[EventKind::NativeMethodBind]);
    fixture.enable(early_env, EventKind::NativeMethodBind);
    fixture.enable(ordinary_env, EventKind::NativeMethodBind);

    let thread = ThreadRef::managed(1);
    let method = vigil::payload::MethodHandle(4);
    assert_eq!(fixture.system.post_native_method_bind(thread, method, 0x400), 1);
    assert_eq!(early.count(EventKind::NativeMethodBind), 1);
    assert_eq!(ordinary.count(EventKind::NativeMethodBind), 0);

    fixture.system.advance(Phase::Start).unwrap();
    assert_eq!(fixture.system.post_native_method_bind(thread, method, 0x400), 2);
}

#[test]
fn racing_shutdowns_post_vm_death_once() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    let fixture = TestFixture::live();
    let deaths = Arc::new(AtomicUsize::new(0));
    let seen = deaths.clone();
    let table = vigil::CallbackTable::new().with(EventKind::VmDeath, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        Ok(())
    });
    let env = fixture
        .system
        .register(vigil::Capabilities::empty(), table, vigil::EnvFlags::empty())
        .unwrap();
    fixture.enable(env, EventKind::VmDeath);

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| scope.spawn(|| fixture.system.advance(Phase::Dead)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(EventError::InvalidPhaseTransition { to: Phase::Dead, .. })
    )));
    assert_eq!(deaths.load(Ordering::SeqCst), 1);
    assert!(fixture.system.gate().is_dead());
}

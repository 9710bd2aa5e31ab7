//! Event collector scoping, nesting and flushing.

mod common;

use std::sync::Arc;

use vigil::collector::{CollectedRecord, CollectorKind, CollectorState, RecordOutcome};
use vigil::event::EventKind;
use vigil::interfaces::{Collaborators, CountingResolver, IdentityResolver, ThreadRef};
use vigil::payload::{ClassHandle, EventPayload, ExternalRef, Handle, ObjectHandle};
use vigil::test_utils::{RecordingAgent, TestFixture};

fn alloc_fixture() -> (TestFixture, RecordingAgent, vigil::EnvironmentId) {
    let fixture = TestFixture::live();
    let agent = RecordingAgent::new();
    let env = fixture.register(&agent, &[EventKind::VmObjectAlloc]);
    fixture.enable(env, EventKind::VmObjectAlloc);
    (fixture, agent, env)
}

fn allocated(agent: &RecordingAgent) -> Vec<ObjectHandle> {
    agent
        .payloads(EventKind::VmObjectAlloc)
        .into_iter()
        .filter_map(|payload| match payload {
            EventPayload::Allocation { object, .. } => Some(object),
            _ => None,
        })
        .collect()
}

#[test]
fn thousand_allocations_flush_in_order() {
    common::init_test_tracing();
    let (fixture, agent, _) = alloc_fixture();
    let thread = ThreadRef::managed(1);

    {
        let _collector = fixture
            .system
            .acquire_collector(CollectorKind::VmObjectAlloc, thread);
        for i in 0..1000 {
            assert_eq!(fixture.system.post_vm_object_alloc(thread, ObjectHandle(i)), 0);
        }
        assert_eq!(agent.count(EventKind::VmObjectAlloc), 0);
    }

    let expected: Vec<_> = (0..1000).map(ObjectHandle).collect();
    assert_eq!(allocated(&agent), expected);
    assert_eq!(fixture.system.stats().collector_flushed, 1000);

    // After the scope: direct while enabled
    assert_eq!(fixture.system.post_vm_object_alloc(thread, ObjectHandle(5000)), 1);
}

#[test]
fn allocation_after_disable_is_dropped() {
    let (fixture, agent, env) = alloc_fixture();
    let thread = ThreadRef::managed(1);
    drop(fixture.system.acquire_collector(CollectorKind::VmObjectAlloc, thread));

    fixture.disable(env, EventKind::VmObjectAlloc);
    assert_eq!(fixture.system.post_vm_object_alloc(thread, ObjectHandle(1)), 0);
    assert!(agent.is_empty());
}

#[test]
fn objects_dead_at_flush_are_dropped() {
    let resolver = Arc::new(CountingResolver::new());
    let fixture =
        TestFixture::with_collaborators(Collaborators::default().with_identity(resolver.clone()));
    fixture.advance_to_live();
    let agent = RecordingAgent::new();
    let env = fixture.register(&agent, &[EventKind::VmObjectAlloc]);
    fixture.enable(env, EventKind::VmObjectAlloc);
    let thread = ThreadRef::managed(1);

    {
        let _collector = fixture
            .system
            .acquire_collector(CollectorKind::VmObjectAlloc, thread);
        for i in 1..=3 {
            fixture.system.post_vm_object_alloc(thread, ObjectHandle(i));
        }
        // Collected before the scope ends
        resolver.mark_dead(ObjectHandle(2));
    }

    assert_eq!(allocated(&agent), vec![ObjectHandle(1), ObjectHandle(3)]);
    let stats = fixture.system.stats();
    assert_eq!(stats.collector_dropped, 1);
    assert_eq!(stats.collector_flushed, 2);
    assert_eq!(resolver.live_locals(), 0);
}

#[test]
fn records_flushed_to_nobody_are_not_counted() {
    let (fixture, agent, env) = alloc_fixture();
    let thread = ThreadRef::managed(1);

    let collector = fixture
        .system
        .acquire_collector(CollectorKind::VmObjectAlloc, thread);
    fixture.system.post_vm_object_alloc(thread, ObjectHandle(1));
    fixture.system.post_vm_object_alloc(thread, ObjectHandle(2));
    assert_eq!(collector.len(), 2);

    fixture.disable(env, EventKind::VmObjectAlloc);
    collector.release();

    assert!(agent.is_empty());
    let stats = fixture.system.stats();
    assert_eq!(stats.collector_flushed, 0);
    assert_eq!(stats.collector_dropped, 0);
    assert_eq!(stats.delivered, 0);
}

#[test]
fn nested_collector_is_suppressed() {
    let (fixture, agent, _) = alloc_fixture();
    let thread = ThreadRef::managed(1);

    let outer = fixture
        .system
        .acquire_collector(CollectorKind::VmObjectAlloc, thread);
    assert_eq!(outer.state(), CollectorState::Accumulating);
    outer.record(CollectedRecord::Allocation(ObjectHandle(1)));

    {
        let inner = fixture
            .system
            .acquire_collector(CollectorKind::VmObjectAlloc, thread);
        assert_eq!(inner.state(), CollectorState::Suppressed);
        assert!(!inner.record(CollectedRecord::Allocation(ObjectHandle(99))));
        // Runtime allocations still land in the outer collector
        fixture.system.post_vm_object_alloc(thread, ObjectHandle(2));
    }
    assert_eq!(agent.count(EventKind::VmObjectAlloc), 0);
    assert_eq!(outer.state(), CollectorState::Accumulating);
    outer.record(CollectedRecord::Allocation(ObjectHandle(3)));
    assert_eq!(outer.len(), 3);

    outer.release();
    assert_eq!(
        allocated(&agent),
        vec![ObjectHandle(1), ObjectHandle(2), ObjectHandle(3)]
    );
}

#[test]
fn disabled_kind_gives_inactive_collector() {
    let fixture = TestFixture::live();
    let thread = ThreadRef::managed(1);
    let collector = fixture
        .system
        .acquire_collector(CollectorKind::DynamicCode, thread);
    assert_eq!(collector.state(), CollectorState::Inactive);
    assert!(!collector.record(CollectedRecord::DynamicCode {
        name: "stub".into(),
        code_begin: 0,
        code_len: 1
    }));
    assert!(collector.is_empty());
    // No thread state was needed
    assert!(fixture.system.index().threads().is_empty());
}

#[test]
fn kinds_have_independent_slots() {
    let fixture = TestFixture::live();
    let agent = RecordingAgent::new();
    let env = fixture.register(
        &agent,
        &[EventKind::VmObjectAlloc, EventKind::SampledObjectAlloc],
    );
    fixture.enable(env, EventKind::VmObjectAlloc);
    fixture.enable(env, EventKind::SampledObjectAlloc);
    let thread = ThreadRef::managed(1);

    let vm = fixture
        .system
        .acquire_collector(CollectorKind::VmObjectAlloc, thread);
    let sampled = fixture
        .system
        .acquire_collector(CollectorKind::SampledObjectAlloc, thread);
    assert_eq!(vm.state(), CollectorState::Accumulating);
    assert_eq!(sampled.state(), CollectorState::Accumulating);

    fixture.system.post_sampled_object_alloc(thread, ObjectHandle(1));
    drop(vm);
    assert_eq!(agent.count(EventKind::SampledObjectAlloc), 0);
    drop(sampled);
    assert_eq!(agent.count(EventKind::SampledObjectAlloc), 1);
}

#[test]
fn sampled_collection_needs_a_managed_thread() {
    let fixture = TestFixture::live();
    let agent = RecordingAgent::new();
    let env = fixture.register(&agent, &[EventKind::SampledObjectAlloc]);
    fixture.enable(env, EventKind::SampledObjectAlloc);

    let compiler = ThreadRef::compiler(4);
    let collector = fixture
        .system
        .acquire_collector(CollectorKind::SampledObjectAlloc, compiler);
    assert_eq!(collector.state(), CollectorState::Inactive);
    assert_eq!(fixture.system.post_sampled_object_alloc(compiler, ObjectHandle(1)), 0);
}

#[test]
fn paused_collector_discards_records() {
    let (fixture, agent, _) = alloc_fixture();
    let thread = ThreadRef::managed(1);

    {
        let _collector = fixture
            .system
            .acquire_collector(CollectorKind::VmObjectAlloc, thread);
        fixture.system.post_vm_object_alloc(thread, ObjectHandle(1));
        {
            let pause = fixture.system.pause_collection(thread);
            assert!(pause.is_active());
            assert_eq!(
                fixture.system.record_allocation(thread, ObjectHandle(2)),
                RecordOutcome::Discarded
            );
        }
        assert_eq!(
            fixture.system.record_allocation(thread, ObjectHandle(3)),
            RecordOutcome::Buffered
        );
    }
    assert_eq!(allocated(&agent), vec![ObjectHandle(1), ObjectHandle(3)]);
}

/// Resolver that treats even object ids as class mirrors.
#[derive(Debug, Default)]
struct MirrorResolver;

impl IdentityResolver for MirrorResolver {
    fn make_local(&self, _handle: Handle) -> ExternalRef {
        ExternalRef(1)
    }

    fn release_local(&self, _reference: ExternalRef) {}

    fn class_of(&self, _object: ObjectHandle) -> ClassHandle {
        ClassHandle(1)
    }

    fn is_class_mirror(&self, object: ObjectHandle) -> bool {
        object.0 % 2 == 0
    }

    fn object_size(&self, _object: ObjectHandle) -> u64 {
        16
    }

    fn is_alive(&self, _object: ObjectHandle) -> bool {
        true
    }
}

#[test]
fn class_mirrors_are_not_recorded() {
    let fixture = TestFixture::with_collaborators(
        Collaborators::default().with_identity(Arc::new(MirrorResolver)),
    );
    fixture.advance_to_live();
    let agent = RecordingAgent::new();
    let env = fixture.register(&agent, &[EventKind::VmObjectAlloc]);
    fixture.enable(env, EventKind::VmObjectAlloc);
    let thread = ThreadRef::managed(1);

    {
        let _collector = fixture
            .system
            .acquire_collector(CollectorKind::VmObjectAlloc, thread);
        for i in 1..=4 {
            fixture.system.post_vm_object_alloc(thread, ObjectHandle(i));
        }
    }
    assert_eq!(allocated(&agent), vec![ObjectHandle(1), ObjectHandle(3)]);
    // Direct posting skips mirrors too
    assert_eq!(fixture.system.post_vm_object_alloc(thread, ObjectHandle(6)), 0);
    assert_eq!(
        agent.payloads(EventKind::VmObjectAlloc)[0],
        EventPayload::Allocation {
            object: ObjectHandle(1),
            class: ClassHandle(1),
            size: 16
        }
    );
}

#[test]
fn allocations_during_flush_are_not_collected() {
    let fixture = Arc::new(TestFixture::live());
    let weak = Arc::downgrade(&fixture);
    // Every reported allocation allocates once more from the callback
    let table = vigil::CallbackTable::new().with(EventKind::VmObjectAlloc, move |ctx| {
        if let (Some(fixture), EventPayload::Allocation { object, .. }) =
            (weak.upgrade(), ctx.payload())
        {
            if object.0 < 100 {
                fixture
                    .system
                    .post_vm_object_alloc(ctx.thread(), ObjectHandle(object.0 + 100));
            }
        }
        Ok(())
    });
    let env = fixture
        .system
        .register(vigil::Capabilities::all(), table, vigil::EnvFlags::empty())
        .unwrap();
    fixture.enable(env, EventKind::VmObjectAlloc);
    let thread = ThreadRef::managed(1);

    {
        let collector = fixture
            .system
            .acquire_collector(CollectorKind::VmObjectAlloc, thread);
        collector.record(CollectedRecord::Allocation(ObjectHandle(1)));
        collector.record(CollectedRecord::Allocation(ObjectHandle(2)));
    }

    let stats = fixture.system.stats();
    // Two flushed; the callback allocations were discarded, not buffered
    assert_eq!(stats.collector_flushed, 2);
    assert_eq!(stats.delivered, 2);

    // With the scope gone the same callback allocation is posted directly
    assert_eq!(fixture.system.post_vm_object_alloc(thread, ObjectHandle(3)), 1);
    assert_eq!(fixture.system.stats().delivered, 4);
}

#[test]
fn dynamic_code_reported_under_locks_is_collected() {
    let fixture = TestFixture::live();
    let agent = RecordingAgent::new();
    let env = fixture.register(&agent, &[EventKind::DynamicCodeGenerated]);
    fixture.enable(env, EventKind::DynamicCodeGenerated);
    let thread = ThreadRef::compiler(2);

    {
        let _collector = fixture
            .system
            .acquire_collector(CollectorKind::DynamicCode, thread);
        fixture
            .system
            .post_dynamic_code_generated_while_holding_locks(thread, "adapter", 0x100, 32)
            .unwrap();
        assert!(agent.is_empty());
    }
    assert_eq!(agent.count(EventKind::DynamicCodeGenerated), 1);
    assert_eq!(fixture.system.stats().deferred_enqueued, 0);

    // Without a collector it is deferred instead
    fixture
        .system
        .post_dynamic_code_generated_while_holding_locks(thread, "stub", 0x200, 16)
        .unwrap();
    fixture.system.drain_deferred().unwrap();
    assert_eq!(agent.count(EventKind::DynamicCodeGenerated), 2);
    assert_eq!(fixture.system.stats().deferred_delivered, 1);
}

//! Typed posting entry points used by runtime subsystems.
//!
//! Each helper performs the cheap enablement check before building its
//! payload, then applies the bookkeeping its event needs (stack depth,
//! exception lifecycle, frame pops, collectors, deferral) around the plain
//! dispatcher post.

use crate::collector::{CollectedRecord, CollectorKind, RecordOutcome, record_for_thread};
use crate::deferred::DeferredEvent;
use crate::environment::EnvironmentId;
use crate::error::EventResult;
use crate::event::EventKind;
use crate::interfaces::ThreadRef;
use crate::payload::{
    ClassHandle, EventPayload, FieldId, Location, MethodHandle, ObjectHandle, Value,
};
use crate::phase::Phase;
use crate::system::{EventSystem, VM_THREAD};
use crate::thread_state::{ExceptionState, ThreadEventState};

impl EventSystem {
    // VM lifecycle

    /// Post VM start. The early post reaches only environments flagged for
    /// early start; the ordinary post skips those that already saw it.
    pub fn post_vm_start(&self, early: bool) -> usize {
        if !self.is_enabled(EventKind::VmStart) {
            return 0;
        }
        let gate = self.gate();
        if early {
            gate.record_early_start();
            return self.dispatcher().post_filtered(
                EventKind::VmStart,
                VM_THREAD,
                &EventPayload::Empty,
                |env| env.is_early(),
            );
        }
        let skip_early = gate.early_start_recorded();
        self.dispatcher().post_filtered(
            EventKind::VmStart,
            VM_THREAD,
            &EventPayload::Empty,
            |env| !(skip_early && env.is_early()),
        )
    }

    pub fn post_vm_initialized(&self, thread: ThreadRef) -> usize {
        if !self.is_enabled(EventKind::VmInit) {
            return 0;
        }
        self.post(EventKind::VmInit, thread, &EventPayload::Empty)
    }

    pub fn post_data_dump_request(&self) -> usize {
        if !self.is_enabled(EventKind::DataDumpRequest) {
            return 0;
        }
        self.post(EventKind::DataDumpRequest, VM_THREAD, &EventPayload::Empty)
    }

    // Classes

    pub fn post_class_load(&self, thread: ThreadRef, class: ClassHandle) -> usize {
        if !self.is_enabled(EventKind::ClassLoad) {
            return 0;
        }
        self.post(EventKind::ClassLoad, thread, &EventPayload::Class { class })
    }

    pub fn post_class_prepare(&self, thread: ThreadRef, class: ClassHandle) -> usize {
        if !self.is_enabled(EventKind::ClassPrepare) {
            return 0;
        }
        self.post(EventKind::ClassPrepare, thread, &EventPayload::Class { class })
    }

    /// Class unload is always delivered from the worker; only the name
    /// survives the class.
    pub fn post_class_unload(&self, name: &str) -> EventResult<()> {
        if !self.is_enabled(EventKind::ClassUnload) {
            return Ok(());
        }
        self.enqueue(DeferredEvent::class_unload(name))
    }

    // Interpreter events

    pub fn post_single_step(
        &self,
        thread: ThreadRef,
        method: MethodHandle,
        location: Location,
    ) -> usize {
        if !self.is_enabled(EventKind::SingleStep) {
            return 0;
        }
        self.post(
            EventKind::SingleStep,
            thread,
            &EventPayload::Location { method, location },
        )
    }

    pub fn post_breakpoint(
        &self,
        thread: ThreadRef,
        method: MethodHandle,
        location: Location,
    ) -> usize {
        if !self.is_enabled(EventKind::Breakpoint) {
            return 0;
        }
        self.post(
            EventKind::Breakpoint,
            thread,
            &EventPayload::Location { method, location },
        )
    }

    fn interp_state(&self, thread: ThreadRef) -> Option<std::sync::Arc<ThreadEventState>> {
        self.index()
            .threads()
            .get(thread.key)
            .filter(|state| state.is_interp_only())
    }

    /// Method entry. Only threads in interpreter-only mode track depth and
    /// report entries.
    pub fn post_method_entry(&self, thread: ThreadRef, method: MethodHandle) -> usize {
        let Some(state) = self.interp_state(thread) else {
            return 0;
        };
        state.incr_stack_depth();
        if !state.is_enabled(EventKind::MethodEntry) {
            return 0;
        }
        self.post(EventKind::MethodEntry, thread, &EventPayload::Method { method })
    }

    /// Method exit, followed by frame pop for every environment that asked
    /// for this frame.
    pub fn post_method_exit(
        &self,
        thread: ThreadRef,
        method: MethodHandle,
        return_value: Value,
    ) -> usize {
        let Some(state) = self.interp_state(thread) else {
            return 0;
        };
        self.method_exit_inner(&state, thread, method, false, return_value)
    }

    fn method_exit_inner(
        &self,
        state: &ThreadEventState,
        thread: ThreadRef,
        method: MethodHandle,
        exception_exit: bool,
        return_value: Value,
    ) -> usize {
        let depth = state.cur_stack_depth(self.collaborators().stack.as_ref());
        let mut delivered = self.post(
            EventKind::MethodExit,
            thread,
            &EventPayload::MethodExit {
                method,
                exception_exit,
                return_value,
            },
        );

        let popped: Vec<EnvironmentId> = {
            let mut locals = state.lock_envs();
            locals
                .iter_mut()
                .enumerate()
                .filter_map(|(index, ets)| {
                    let requested = ets.take_frame_pop(depth);
                    if exception_exit {
                        ets.clear_frame_pops_above(depth - 1);
                    }
                    requested.then_some(EnvironmentId(index as u32))
                })
                .collect()
        };
        if !popped.is_empty() {
            delivered += self.dispatcher().post_filtered(
                EventKind::FramePop,
                thread,
                &EventPayload::FramePop {
                    method,
                    exception_exit,
                },
                |env| popped.contains(&env.id()),
            );
        }

        state.decr_stack_depth();
        delivered
    }

    // Exceptions

    /// An exception was thrown at `method`/`location`. Reported once per
    /// exception; rethrows while the first is still detected are ignored.
    pub fn post_exception_throw(
        &self,
        thread: ThreadRef,
        method: MethodHandle,
        location: Location,
        exception: ObjectHandle,
    ) -> usize {
        if !self.is_enabled(EventKind::Exception) && !self.is_enabled(EventKind::ExceptionCatch) {
            return 0;
        }
        let state = self.state_for(thread);
        state.invalidate_stack_depth();
        if state.is_exception_detected() {
            return 0;
        }
        state.set_exception_state(ExceptionState::Detected);
        if !state.is_enabled(EventKind::Exception) {
            return 0;
        }

        // The handler search may itself raise events; none are posted.
        let catch = {
            let _hidden = state.hide_events();
            self.collaborators()
                .stack
                .find_exception_handler(&thread, exception)
        };
        let payload = EventPayload::Exception {
            method,
            location,
            exception,
            catch_method: catch.map(|site| site.method),
            catch_location: catch.map_or(Location(0), |site| site.location),
        };
        self.post(EventKind::Exception, thread, &payload)
    }

    /// The detected exception unwound into `method`. In the handler frame
    /// this reports the catch; otherwise the frame is exiting.
    pub fn notice_unwind_due_to_exception(
        &self,
        thread: ThreadRef,
        method: MethodHandle,
        location: Location,
        exception: ObjectHandle,
        in_handler_frame: bool,
    ) -> usize {
        let Some(state) = self.index().threads().get(thread.key) else {
            return 0;
        };
        if !state.is_exception_detected() {
            return 0;
        }
        state.invalidate_stack_depth();

        if in_handler_frame {
            state.set_exception_state(ExceptionState::Caught);
            if !state.is_enabled(EventKind::ExceptionCatch) {
                return 0;
            }
            return self.post(
                EventKind::ExceptionCatch,
                thread,
                &EventPayload::ExceptionCatch {
                    method,
                    location,
                    exception,
                },
            );
        }

        if !state.is_interp_only() {
            return 0;
        }
        let delivered = self.method_exit_inner(&state, thread, method, true, Value::Void);
        state.invalidate_stack_depth();
        delivered
    }

    pub fn clear_detected_exception(&self, thread: ThreadRef) {
        if let Some(state) = self.index().threads().get(thread.key) {
            state.set_exception_state(ExceptionState::Cleared);
        }
    }

    // Fields and monitors

    pub fn post_field_access(
        &self,
        thread: ThreadRef,
        method: MethodHandle,
        location: Location,
        field_class: ClassHandle,
        object: Option<ObjectHandle>,
        field: FieldId,
    ) -> usize {
        if !self.is_enabled(EventKind::FieldAccess) {
            return 0;
        }
        let payload = EventPayload::Field {
            method,
            location,
            field_class,
            object,
            field,
            new_value: None,
        };
        self.post(EventKind::FieldAccess, thread, &payload)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn post_field_modification(
        &self,
        thread: ThreadRef,
        method: MethodHandle,
        location: Location,
        field_class: ClassHandle,
        object: Option<ObjectHandle>,
        field: FieldId,
        new_value: Value,
    ) -> usize {
        if !self.is_enabled(EventKind::FieldModification) {
            return 0;
        }
        let payload = EventPayload::Field {
            method,
            location,
            field_class,
            object,
            field,
            new_value: Some(new_value),
        };
        self.post(EventKind::FieldModification, thread, &payload)
    }

    pub fn post_monitor_contended_enter(&self, thread: ThreadRef, object: ObjectHandle) -> usize {
        self.post_monitor(EventKind::MonitorContendedEnter, thread, object)
    }

    pub fn post_monitor_contended_entered(&self, thread: ThreadRef, object: ObjectHandle) -> usize {
        self.post_monitor(EventKind::MonitorContendedEntered, thread, object)
    }

    fn post_monitor(&self, kind: EventKind, thread: ThreadRef, object: ObjectHandle) -> usize {
        if !self.is_enabled(kind) {
            return 0;
        }
        self.post(kind, thread, &EventPayload::Monitor { object })
    }

    pub fn post_monitor_wait(
        &self,
        thread: ThreadRef,
        object: ObjectHandle,
        timeout_ms: i64,
    ) -> usize {
        if !self.is_enabled(EventKind::MonitorWait) {
            return 0;
        }
        self.post(
            EventKind::MonitorWait,
            thread,
            &EventPayload::MonitorWait { object, timeout_ms },
        )
    }

    pub fn post_monitor_waited(
        &self,
        thread: ThreadRef,
        object: ObjectHandle,
        timed_out: bool,
    ) -> usize {
        if !self.is_enabled(EventKind::MonitorWaited) {
            return 0;
        }
        self.post(
            EventKind::MonitorWaited,
            thread,
            &EventPayload::MonitorWaited { object, timed_out },
        )
    }

    // Virtual threads

    pub fn post_virtual_thread_mount(&self, thread: ThreadRef, vthread: ObjectHandle) -> usize {
        if !self.is_enabled(EventKind::VirtualThreadMount) {
            return 0;
        }
        self.post(
            EventKind::VirtualThreadMount,
            thread,
            &EventPayload::VirtualThread { vthread },
        )
    }

    pub fn post_virtual_thread_unmount(&self, thread: ThreadRef, vthread: ObjectHandle) -> usize {
        if !self.is_enabled(EventKind::VirtualThreadUnmount) {
            return 0;
        }
        self.post(
            EventKind::VirtualThreadUnmount,
            thread,
            &EventPayload::VirtualThread { vthread },
        )
    }

    // Allocation

    /// An object allocated by the runtime on the thread's behalf. Buffered
    /// when a collector is active, otherwise posted directly.
    pub fn post_vm_object_alloc(&self, thread: ThreadRef, object: ObjectHandle) -> usize {
        if !self.is_enabled(EventKind::VmObjectAlloc) {
            return 0;
        }
        match self.record_allocation(thread, object) {
            RecordOutcome::Buffered | RecordOutcome::Discarded => 0,
            RecordOutcome::NoCollector => {
                let identity = &self.collaborators().identity;
                if identity.is_class_mirror(object) {
                    return 0;
                }
                let payload = EventPayload::Allocation {
                    object,
                    class: identity.class_of(object),
                    size: identity.object_size(object),
                };
                self.post(EventKind::VmObjectAlloc, thread, &payload)
            }
        }
    }

    /// A sampled allocation. Threads that cannot run managed code never
    /// report samples.
    pub fn post_sampled_object_alloc(&self, thread: ThreadRef, object: ObjectHandle) -> usize {
        if !self.is_enabled(EventKind::SampledObjectAlloc) || !thread.can_run_managed_code() {
            return 0;
        }
        match self.record_sampled_allocation(thread, object) {
            RecordOutcome::Buffered | RecordOutcome::Discarded => 0,
            RecordOutcome::NoCollector => {
                let identity = &self.collaborators().identity;
                let payload = EventPayload::Allocation {
                    object,
                    class: identity.class_of(object),
                    size: identity.object_size(object),
                };
                self.post(EventKind::SampledObjectAlloc, thread, &payload)
            }
        }
    }

    /// Objects tagged by `env` were freed.
    pub fn post_object_free(&self, env: EnvironmentId, thread: ThreadRef, tags: &[i64]) -> usize {
        if !self.is_enabled(EventKind::ObjectFree) {
            return 0;
        }
        tags.iter()
            .map(|tag| {
                let payload = EventPayload::ObjectFree { tag: *tag };
                self.post_to(env, EventKind::ObjectFree, thread, &payload)
            })
            .sum()
    }

    /// Bracket a collection with start and finish events.
    pub fn gc_marker(&self, thread: ThreadRef) -> GcMarker<'_> {
        GcMarker::new(self, thread)
    }

    /// Logged regardless of subscribers. Threads that cannot run managed
    /// code do not post it.
    pub fn post_resource_exhausted(
        &self,
        thread: ThreadRef,
        flags: u32,
        description: &str,
    ) -> usize {
        tracing::error!(thread = %thread.key, flags, description, "resource exhausted");
        if !self.is_enabled(EventKind::ResourceExhausted) || !thread.can_run_managed_code() {
            return 0;
        }
        self.post(
            EventKind::ResourceExhausted,
            thread,
            &EventPayload::ResourceExhausted {
                flags,
                description: description.to_owned(),
            },
        )
    }

    // Code

    pub fn post_native_method_bind(
        &self,
        thread: ThreadRef,
        method: MethodHandle,
        address: usize,
    ) -> usize {
        if !self.is_enabled(EventKind::NativeMethodBind) {
            return 0;
        }
        self.post(
            EventKind::NativeMethodBind,
            thread,
            &EventPayload::NativeMethodBind { method, address },
        )
    }

    /// Generated code. Before ONLOAD there is no worker traffic yet and the
    /// post is synchronous; later it goes through the deferred queue.
    pub fn post_dynamic_code_generated(
        &self,
        thread: ThreadRef,
        name: &str,
        code_begin: usize,
        code_len: usize,
    ) -> EventResult<()> {
        if !self.is_enabled(EventKind::DynamicCodeGenerated) {
            return Ok(());
        }
        match self.phase() {
            Phase::Primordial | Phase::Start => {
                let payload = EventPayload::DynamicCode {
                    name: name.to_owned(),
                    code_begin,
                    code_len,
                };
                self.post(EventKind::DynamicCodeGenerated, thread, &payload);
                Ok(())
            }
            _ => self.enqueue(DeferredEvent::dynamic_code_generated(name, code_begin, code_len)),
        }
    }

    /// Generated code reported while the caller holds runtime locks. Goes
    /// into the thread's dynamic-code collector, or the deferred queue if
    /// none is active.
    pub fn post_dynamic_code_generated_while_holding_locks(
        &self,
        thread: ThreadRef,
        name: &str,
        code_begin: usize,
        code_len: usize,
    ) -> EventResult<()> {
        if !self.is_enabled(EventKind::DynamicCodeGenerated) {
            return Ok(());
        }
        let record = CollectedRecord::DynamicCode {
            name: name.to_owned(),
            code_begin,
            code_len,
        };
        match record_for_thread(self.dispatcher(), thread, CollectorKind::DynamicCode, record) {
            RecordOutcome::Buffered | RecordOutcome::Discarded => Ok(()),
            RecordOutcome::NoCollector => {
                self.enqueue(DeferredEvent::dynamic_code_generated(name, code_begin, code_len))
            }
        }
    }

    pub fn post_compiled_method_load(
        &self,
        thread: ThreadRef,
        method: MethodHandle,
        code_begin: usize,
        code_size: usize,
    ) -> usize {
        if !self.is_enabled(EventKind::CompiledMethodLoad) {
            return 0;
        }
        self.post(
            EventKind::CompiledMethodLoad,
            thread,
            &EventPayload::CompiledMethodLoad {
                method,
                code_begin,
                code_size,
            },
        )
    }

    /// Unloads happen during collection; always deferred.
    pub fn post_compiled_method_unload(
        &self,
        method: MethodHandle,
        code_begin: usize,
    ) -> EventResult<()> {
        if !self.is_enabled(EventKind::CompiledMethodUnload) {
            return Ok(());
        }
        self.enqueue(DeferredEvent::compiled_method_unload(method, code_begin))
    }
}

/// Posts garbage collection start on creation and finish on drop.
#[must_use = "the finish event is posted when the marker drops"]
pub struct GcMarker<'a> {
    system: &'a EventSystem,
    thread: ThreadRef,
}

impl<'a> GcMarker<'a> {
    pub fn new(system: &'a EventSystem, thread: ThreadRef) -> Self {
        if system.is_enabled(EventKind::GarbageCollectionStart) {
            system.post(EventKind::GarbageCollectionStart, thread, &EventPayload::Empty);
        }
        Self { system, thread }
    }
}

impl Drop for GcMarker<'_> {
    fn drop(&mut self) {
        if self.system.is_enabled(EventKind::GarbageCollectionFinish) {
            self.system
                .post(EventKind::GarbageCollectionFinish, self.thread, &EventPayload::Empty);
        }
    }
}

//! Deferred delivery through a single background worker.
//!
//! Events raised where a synchronous callback is unsafe (class unload after
//! the class metadata is gone, code generation while holding runtime locks)
//! are copied into a self-contained [`DeferredEvent`] and handed to the
//! worker over a channel. The worker replays them through the dispatcher in
//! enqueue order.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, Sender, TrySendError};

use crate::dispatch::Dispatcher;
use crate::environment::EnvironmentId;
use crate::error::{EventError, EventResult};
use crate::event::EventKind;
use crate::interfaces::{ThreadRef, WorkerHandle};
use crate::invariant;
use crate::payload::{EventPayload, MethodHandle};
use crate::phase::PhaseGate;
use crate::stats::EventCounters;

/// Identity the delivery worker posts under.
pub const SERVICE_THREAD: ThreadRef = ThreadRef::service(u64::MAX).hidden();

/// Owned copy of an event awaiting delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredEvent {
    pub kind: EventKind,
    pub payload: EventPayload,
    /// Deliver to this environment only
    pub target: Option<EnvironmentId>,
}

impl DeferredEvent {
    pub fn new(kind: EventKind, payload: EventPayload) -> Self {
        Self {
            kind,
            payload,
            target: None,
        }
    }

    pub fn for_env(mut self, env: EnvironmentId) -> Self {
        self.target = Some(env);
        self
    }

    /// The class name is captured now; the class itself may be gone by the
    /// time the worker runs.
    pub fn class_unload(name: impl Into<String>) -> Self {
        Self::new(
            EventKind::ClassUnload,
            EventPayload::ClassUnload { name: name.into() },
        )
    }

    pub fn dynamic_code_generated(
        name: impl Into<String>,
        code_begin: usize,
        code_len: usize,
    ) -> Self {
        Self::new(
            EventKind::DynamicCodeGenerated,
            EventPayload::DynamicCode {
                name: name.into(),
                code_begin,
                code_len,
            },
        )
    }

    pub fn compiled_method_load(method: MethodHandle, code_begin: usize, code_size: usize) -> Self {
        Self::new(
            EventKind::CompiledMethodLoad,
            EventPayload::CompiledMethodLoad {
                method,
                code_begin,
                code_size,
            },
        )
    }

    pub fn compiled_method_unload(method: MethodHandle, code_begin: usize) -> Self {
        Self::new(
            EventKind::CompiledMethodUnload,
            EventPayload::CompiledMethodUnload { method, code_begin },
        )
    }
}

enum Message {
    Event { seq: u64, event: DeferredEvent },
    Flush(Sender<()>),
    Shutdown,
}

/// FIFO handoff to the delivery worker.
pub struct DeferredQueue {
    sender: Sender<Message>,
    capacity: Option<usize>,
    drain_timeout: Option<Duration>,
    gate: Arc<PhaseGate>,
    counters: Arc<EventCounters>,
    next_seq: Mutex<u64>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl DeferredQueue {
    /// Create the queue and start its worker through the configured
    /// scheduler.
    pub fn start(dispatcher: Arc<Dispatcher>) -> EventResult<Self> {
        let config = dispatcher.config();
        let capacity = config.deferred_bound();
        let (sender, receiver) = match capacity {
            Some(bound) => flume::bounded(bound),
            None => flume::unbounded(),
        };

        let gate = Arc::clone(dispatcher.gate());
        let counters = Arc::clone(dispatcher.counters());
        let drain_timeout = config.drain_deadline();
        let name = config.worker_name.clone();
        let scheduler = Arc::clone(&dispatcher.collaborators().scheduler);

        let worker = DeliveryWorker {
            dispatcher,
            receiver,
            expected_seq: 0,
        };
        let handle = scheduler.spawn_worker(&name, Box::new(move || worker.run()))?;
        tracing::debug!(worker = %name, ?capacity, "delivery worker started");

        Ok(Self {
            sender,
            capacity,
            drain_timeout,
            gate,
            counters,
            next_seq: Mutex::new(0),
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Append an event. Never blocks; a full queue drops the event.
    pub fn enqueue(&self, event: DeferredEvent) -> EventResult<()> {
        if self.gate.is_dead() {
            return Err(EventError::RuntimeDead);
        }

        let mut seq = self.next_seq.lock();
        let kind = event.kind;
        match self.sender.try_send(Message::Event { seq: *seq, event }) {
            Ok(()) => {
                *seq += 1;
                self.counters.record_deferred_enqueued();
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.counters.record_deferred_dropped();
                let capacity = self.capacity.unwrap_or_default();
                tracing::warn!(event = ?kind, capacity, "deferred queue full; event dropped");
                Err(EventError::QueueFull { capacity })
            }
            Err(TrySendError::Disconnected(_)) => Err(EventError::WorkerUnavailable),
        }
    }

    /// Wait until everything enqueued so far has been delivered.
    pub fn drain(&self) -> EventResult<()> {
        let (ack, acked) = flume::bounded(1);
        self.sender
            .send(Message::Flush(ack))
            .map_err(|_| EventError::WorkerUnavailable)?;
        let result = match self.drain_timeout {
            Some(timeout) => acked.recv_timeout(timeout).map_err(|_| EventError::WorkerUnavailable),
            None => acked.recv().map_err(|_| EventError::WorkerUnavailable),
        };
        if result.is_err() {
            tracing::warn!(timeout = ?self.drain_timeout, "deferred queue did not drain");
        }
        result
    }

    /// Deliver what is queued, then stop and join the worker. Idempotent.
    pub fn shutdown(&self) -> EventResult<()> {
        let Some(handle) = self.worker.lock().take() else {
            return Ok(());
        };
        // The worker may already be gone; joining reports that.
        let _ = self.sender.send(Message::Shutdown);
        let joined = handle.join();
        tracing::debug!("delivery worker stopped");
        joined
    }

    /// Messages not yet consumed by the worker.
    pub fn pending(&self) -> usize {
        self.sender.len()
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }
}

impl Drop for DeferredQueue {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            tracing::warn!(%error, "delivery worker did not shut down cleanly");
        }
    }
}

impl std::fmt::Debug for DeferredQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredQueue")
            .field("capacity", &self.capacity)
            .field("pending", &self.pending())
            .field("running", &self.is_running())
            .finish()
    }
}

struct DeliveryWorker {
    dispatcher: Arc<Dispatcher>,
    receiver: Receiver<Message>,
    expected_seq: u64,
}

impl DeliveryWorker {
    fn run(mut self) {
        while let Ok(message) = self.receiver.recv() {
            match message {
                Message::Event { seq, event } => self.deliver(seq, event),
                Message::Flush(ack) => {
                    let _ = ack.send(());
                }
                Message::Shutdown => break,
            }
        }
    }

    fn deliver(&mut self, seq: u64, event: DeferredEvent) {
        let counters = self.dispatcher.counters();
        invariant!(
            counters,
            seq == self.expected_seq,
            "deferred record {} delivered out of order (expected {})",
            seq,
            self.expected_seq
        );
        self.expected_seq = seq + 1;

        if self.dispatcher.gate().is_dead() {
            counters.record_deferred_dropped();
            tracing::debug!(event = ?event.kind, seq, "discarding deferred event after teardown");
            return;
        }

        match event.target {
            Some(env) => self
                .dispatcher
                .post_to(env, event.kind, SERVICE_THREAD, &event.payload),
            None => self.dispatcher.post(event.kind, SERVICE_THREAD, &event.payload),
        };
        counters.record_deferred_delivered();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_fill_payloads() {
        let event = DeferredEvent::class_unload("com.example.Gone");
        assert_eq!(event.kind, EventKind::ClassUnload);
        assert_eq!(
            event.payload,
            EventPayload::ClassUnload {
                name: "com.example.Gone".into()
            }
        );
        assert_eq!(event.target, None);

        let targeted = DeferredEvent::dynamic_code_generated("stub", 0x1000, 64)
            .for_env(EnvironmentId(2));
        assert_eq!(targeted.target, Some(EnvironmentId(2)));
    }

    #[test]
    fn service_thread_is_hidden_service() {
        assert!(SERVICE_THREAD.hidden);
        assert!(SERVICE_THREAD.can_run_managed_code());
    }
}

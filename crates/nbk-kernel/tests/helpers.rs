//! Shared helpers for the kernel integration tests.
//!
//! Each integration test compiles this module separately, so some helpers look unused
//! from any single test binary.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use nbk_kernel::transport::{
    EnvelopeObserver, Forwarder, KernelEnvelopeReceiver, KernelEnvelopeSender, spawn_forwarder,
};
use nbk_kernel::{
    Kernel, KernelCommandHandler, KernelInvocation, SimpleKernel, Subscription, handler_fn,
};
use nbk_protocol::{
    CommandSucceeded, EventType, KernelEnvelope, KernelEventEnvelope,
};
use tokio::sync::mpsc;

/// Records every event a kernel emits.
pub struct EventLog {
    events: Arc<Mutex<Vec<KernelEventEnvelope>>>,
    _subscription: Subscription,
}

impl EventLog {
    pub fn attach(kernel: &dyn Kernel) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let log = events.clone();
        let subscription = kernel.subscribe_to_kernel_events(Arc::new(move |event| {
            log.lock().unwrap().push(event.clone());
        }));
        Self {
            events,
            _subscription: subscription,
        }
    }

    pub fn events(&self) -> Vec<KernelEventEnvelope> {
        self.events.lock().unwrap().clone()
    }

    pub fn types(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|event| event.event_type().to_string())
            .collect()
    }
}

/// A handler that publishes `CodeSubmissionReceived` and completes.
pub fn submission_handler() -> Arc<dyn KernelCommandHandler> {
    handler_fn(|invocation: KernelInvocation| async move {
        invocation.publish(
            EventType::CODE_SUBMISSION_RECEIVED,
            serde_json::json!({ "code": invocation.command_envelope.command().field("code") }),
        );
        Ok(())
    })
}

pub fn submit_code_kernel(name: &str) -> Arc<SimpleKernel> {
    let kernel = SimpleKernel::new(name);
    kernel.register_command_handler(nbk_protocol::CommandType::SUBMIT_CODE, submission_handler());
    kernel
}

/// Plays a remote kernel at `remote_uri`: every command seen on `receiver` is stamped
/// as handled there and answered with `CommandSucceeded` through `sender`.
pub fn answer_commands(
    receiver: &dyn KernelEnvelopeReceiver,
    sender: Arc<dyn KernelEnvelopeSender>,
    remote_uri: &'static str,
) -> (Subscription, tokio::task::JoinHandle<()>) {
    let (forwarder, task) = spawn_forwarder(sender);
    let subscription = receiver.subscribe(answering_observer(forwarder, remote_uri));
    (subscription, task)
}

fn answering_observer(forwarder: Forwarder, remote_uri: &'static str) -> EnvelopeObserver {
    Arc::new(move |envelope: &KernelEnvelope| {
        let KernelEnvelope::Command(command) = envelope else {
            return;
        };
        {
            let mut slip = command.routing_slip();
            slip.stamp_as_arrived(remote_uri).unwrap();
            slip.stamp(remote_uri).unwrap();
        }
        let done = KernelEventEnvelope::from_payload(&CommandSucceeded {}, Some(command.clone()));
        forwarder.forward(done.into()).unwrap();
    })
}

/// Buffers envelopes seen on a receiver so tests can await them.
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<KernelEnvelope>,
    _subscription: Subscription,
}

impl Inbox {
    pub fn attach(receiver: &dyn KernelEnvelopeReceiver) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = receiver.subscribe(Arc::new(move |envelope: &KernelEnvelope| {
            let _ = tx.send(envelope.clone());
        }));
        Self {
            rx,
            _subscription: subscription,
        }
    }

    /// Next event of `event_type`, skipping anything else.
    pub async fn next_event(&mut self, event_type: &str) -> KernelEventEnvelope {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match self.rx.recv().await {
                    Some(KernelEnvelope::Event(event)) if event.event_type().as_str() == event_type => {
                        return event;
                    }
                    Some(_) => continue,
                    None => panic!("transport closed while waiting for {event_type}"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {event_type}"))
    }
}

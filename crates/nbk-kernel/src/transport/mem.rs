//! In-process transport, used for loopback proxies and tests.

use async_trait::async_trait;
use nbk_protocol::KernelEnvelope;

use super::{EnvelopeObserver, KernelEnvelopeReceiver, KernelEnvelopeSender, TransportError};
use crate::subject::{Subject, Subscription};

/// Creates a one-way in-memory channel. Sent envelopes are deep-cloned, so the
/// receiving side never shares mutable state (routing slips, tokens) with the sender.
/// Delivery is synchronous: observers run before `send` returns.
pub fn channel() -> (MemSender, MemReceiver) {
    let subject = Subject::new();
    (
        MemSender {
            subject: subject.clone(),
        },
        MemReceiver { subject },
    )
}

/// Two connected channels: the first pair talks to the second pair's receiver and
/// vice versa.
pub fn pair() -> ((MemSender, MemReceiver), (MemSender, MemReceiver)) {
    let (a_to_b, b_from_a) = channel();
    let (b_to_a, a_from_b) = channel();
    ((a_to_b, a_from_b), (b_to_a, b_from_a))
}

#[derive(Clone)]
pub struct MemSender {
    subject: Subject<KernelEnvelope>,
}

#[async_trait]
impl KernelEnvelopeSender for MemSender {
    async fn send(&self, envelope: KernelEnvelope) -> Result<(), TransportError> {
        self.subject.next(&envelope.deep_clone());
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemReceiver {
    subject: Subject<KernelEnvelope>,
}

impl KernelEnvelopeReceiver for MemReceiver {
    fn subscribe(&self, observer: EnvelopeObserver) -> Subscription {
        self.subject.subscribe_shared(observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock;
    use nbk_protocol::{CommandType, KernelCommand, KernelCommandEnvelope};
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn sent_envelopes_are_independent_copies() {
        let (sender, receiver) = channel();
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = received.clone();
        let _subscription = receiver.subscribe(Arc::new(move |envelope| {
            lock(&log).push(envelope.clone());
        }));

        let command = KernelCommandEnvelope::new(CommandType::SUBMIT_CODE, KernelCommand::new());
        sender.send(command.clone().into()).await.unwrap();

        let received = lock(&received);
        let KernelEnvelope::Command(copy) = &received[0] else {
            panic!("expected a command");
        };
        assert_eq!(copy.token().unwrap(), command.token().unwrap());
        copy.routing_slip().stamp_as_arrived("kernel://remote/x").unwrap();
        assert!(command.routing_slip().is_empty());
    }
}

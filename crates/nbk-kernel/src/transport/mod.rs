//! Envelope transports between hosts.
//!
//! A transport is a pair of halves: a [`KernelEnvelopeSender`] that delivers
//! envelopes to the remote side, and a [`KernelEnvelopeReceiver`] that multicasts
//! whatever arrives from it.

pub mod mem;
pub mod ndjson;

use std::sync::Arc;

use async_trait::async_trait;
use nbk_protocol::{KernelEnvelope, ProtocolError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::subject::Subscription;

pub use mem::{MemReceiver, MemSender};
pub use ndjson::{NdjsonReceiver, NdjsonSender};

pub type EnvelopeObserver = Arc<dyn Fn(&KernelEnvelope) + Send + Sync>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] ProtocolError),
}

#[async_trait]
pub trait KernelEnvelopeSender: Send + Sync {
    async fn send(&self, envelope: KernelEnvelope) -> Result<(), TransportError>;
}

pub trait KernelEnvelopeReceiver: Send + Sync {
    /// Registers `observer` for every envelope received from now on.
    fn subscribe(&self, observer: EnvelopeObserver) -> Subscription;
}

/// Synchronous entry point into an async sender. Envelopes are delivered in the order
/// they were forwarded by a task spawned with [`spawn_forwarder`].
#[derive(Clone)]
pub struct Forwarder {
    tx: mpsc::UnboundedSender<KernelEnvelope>,
}

impl Forwarder {
    pub fn forward(&self, envelope: KernelEnvelope) -> Result<(), TransportError> {
        self.tx.send(envelope).map_err(|_| TransportError::Closed)
    }
}

/// Spawns the task that drains a [`Forwarder`] into `sender`. The task ends once every
/// forwarder clone has been dropped.
pub fn spawn_forwarder(sender: Arc<dyn KernelEnvelopeSender>) -> (Forwarder, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<KernelEnvelope>();
    let task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if let Err(err) = sender.send(envelope).await {
                warn!(%err, "failed to forward envelope");
            }
        }
        debug!("forwarder stopped");
    });
    (Forwarder { tx }, task)
}

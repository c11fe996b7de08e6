//! Newline-delimited JSON transport over any async byte stream (stdio, sockets, pipes).

use std::sync::Arc;

use async_trait::async_trait;
use nbk_protocol::KernelEnvelope;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{EnvelopeObserver, KernelEnvelopeReceiver, KernelEnvelopeSender, TransportError};
use crate::subject::{Subject, Subscription};

/// Writes one envelope per line, flushing after each.
pub struct NdjsonSender<W> {
    writer: Arc<Mutex<W>>,
}

impl<W> Clone for NdjsonSender<W> {
    fn clone(&self) -> Self {
        Self {
            writer: self.writer.clone(),
        }
    }
}

impl<W: AsyncWrite + Unpin + Send> NdjsonSender<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> KernelEnvelopeSender for NdjsonSender<W> {
    async fn send(&self, envelope: KernelEnvelope) -> Result<(), TransportError> {
        let mut line = envelope.to_json()?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Multicasts envelopes parsed from a line stream fed through [`NdjsonReceiver::read_from`].
#[derive(Clone, Default)]
pub struct NdjsonReceiver {
    subject: Subject<KernelEnvelope>,
}

impl NdjsonReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads until end of stream. Blank lines are ignored; lines that are not valid
    /// envelopes are logged and skipped.
    pub async fn read_from<R: AsyncRead + Unpin>(&self, reader: R) -> Result<(), TransportError> {
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match KernelEnvelope::from_json(line) {
                Ok(envelope) => self.subject.next(&envelope),
                Err(err) => warn!(%err, "skipping malformed envelope"),
            }
        }
        debug!("ndjson stream ended");
        Ok(())
    }
}

impl KernelEnvelopeReceiver for NdjsonReceiver {
    fn subscribe(&self, observer: EnvelopeObserver) -> Subscription {
        self.subject.subscribe_shared(observer)
    }
}

//! A transport plus the set of remote hosts known to be reachable through it.

use std::sync::{Arc, Mutex};

use indexmap::IndexSet;
use nbk_protocol::{KernelEnvelope, KernelInfoProduced, extract_host_and_normalize};
use tracing::debug;

use crate::lock;
use crate::subject::Subscription;
use crate::transport::{KernelEnvelopeReceiver, KernelEnvelopeSender};

/// Hosts are learned from traffic: the URI of any remote `KernelInfoProduced` and the
/// first routing-slip entry of any received event.
pub struct Connector {
    sender: Arc<dyn KernelEnvelopeSender>,
    receiver: Arc<dyn KernelEnvelopeReceiver>,
    remote_uris: Arc<Mutex<IndexSet<String>>>,
    _listener: Subscription,
}

impl Connector {
    pub fn new(
        sender: Arc<dyn KernelEnvelopeSender>,
        receiver: Arc<dyn KernelEnvelopeReceiver>,
        remote_uris: impl IntoIterator<Item = String>,
    ) -> Self {
        let known: IndexSet<String> = remote_uris
            .into_iter()
            .filter_map(|uri| extract_host_and_normalize(&uri))
            .collect();
        let remote_uris = Arc::new(Mutex::new(known));

        let learned = remote_uris.clone();
        let listener = receiver.subscribe(Arc::new(move |envelope: &KernelEnvelope| {
            let KernelEnvelope::Event(event) = envelope else {
                return;
            };
            let mut hosts = Vec::new();
            if let Ok(produced) = event.payload::<KernelInfoProduced>() {
                if produced.kernel_info.remote_uri.is_none() {
                    hosts.extend(extract_host_and_normalize(&produced.kernel_info.uri));
                }
            }
            if let Some(first) = event.routing_slip().as_slice().first() {
                hosts.extend(extract_host_and_normalize(first));
            }
            let mut known = lock(&learned);
            for host in hosts {
                if known.insert(host.clone()) {
                    debug!(%host, "learned remote host");
                }
            }
        }));

        Self {
            sender,
            receiver,
            remote_uris,
            _listener: listener,
        }
    }

    pub fn sender(&self) -> Arc<dyn KernelEnvelopeSender> {
        self.sender.clone()
    }

    pub fn receiver(&self) -> Arc<dyn KernelEnvelopeReceiver> {
        self.receiver.clone()
    }

    /// True when the scheme and authority of `uri` belong to a known remote host.
    pub fn can_reach(&self, uri: &str) -> bool {
        extract_host_and_normalize(uri).is_some_and(|host| lock(&self.remote_uris).contains(&host))
    }

    pub fn add_remote_host_uri(&self, uri: &str) {
        if let Some(host) = extract_host_and_normalize(uri) {
            lock(&self.remote_uris).insert(host);
        }
    }

    pub fn remote_host_uris(&self) -> Vec<String> {
        lock(&self.remote_uris).iter().cloned().collect()
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("remote_uris", &self.remote_host_uris())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mem;
    use nbk_protocol::{EventType, KernelEventEnvelope, KernelInfo};

    #[tokio::test]
    async fn learns_hosts_from_received_events() {
        let (remote_tx, from_remote) = mem::channel();
        let (to_remote, _unused) = mem::channel();
        let connector = Connector::new(
            Arc::new(to_remote),
            Arc::new(from_remote),
            ["kernel://seeded/root".to_string()],
        );
        assert!(connector.can_reach("kernel://seeded/other"));
        assert!(!connector.can_reach("kernel://browser/js"));

        let info = KernelInfo::new("js", "kernel://browser/js");
        let produced = KernelEventEnvelope::from_payload(&KernelInfoProduced { kernel_info: info }, None);
        remote_tx.send(produced.into()).await.unwrap();
        assert!(connector.can_reach("kernel://browser/js"));

        let event = KernelEventEnvelope::new(EventType::VALUE_PRODUCED, serde_json::json!({}), None);
        event.routing_slip().stamp("kernel://vscode/csharp").unwrap();
        remote_tx.send(event.into()).await.unwrap();
        assert!(connector.can_reach("kernel://vscode/fsharp"));

        assert_eq!(
            connector.remote_host_uris(),
            vec!["kernel://seeded", "kernel://browser", "kernel://vscode"]
        );
    }
}

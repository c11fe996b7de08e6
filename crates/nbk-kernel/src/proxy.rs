//! A kernel that forwards every command to a remote kernel over a transport.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use nbk_protocol::{
    CommandFailed, CommandType, KernelCommandEnvelope, KernelEnvelope, KernelEventEnvelope,
    KernelInfo, KernelInfoProduced, create_kernel_uri,
};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::context::KernelInvocationContext;
use crate::error::KernelError;
use crate::handler::{KernelCommandHandler, KernelInvocation};
use crate::kernel::{Kernel, KernelCore};
use crate::lock;
use crate::subject::Subscription;
use crate::transport::{KernelEnvelopeReceiver, KernelEnvelopeSender, TransportError};

/// Local stand-in for a kernel living behind a transport.
///
/// Every command type is accepted and forwarded; the remote side decides whether it
/// is supported. Events the remote produces for a forwarded command are relayed into
/// the local invocation until its terminal event arrives.
pub struct ProxyKernel {
    core: KernelCore,
    sender: Arc<dyn KernelEnvelopeSender>,
    receiver: Arc<dyn KernelEnvelopeReceiver>,
    handler: Arc<dyn KernelCommandHandler>,
    _info_listener: Subscription,
}

impl std::fmt::Debug for ProxyKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyKernel")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl ProxyKernel {
    pub fn new(
        name: impl Into<String>,
        sender: Arc<dyn KernelEnvelopeSender>,
        receiver: Arc<dyn KernelEnvelopeReceiver>,
        remote_uri: impl Into<String>,
    ) -> Arc<Self> {
        let name = name.into();
        let remote_uri = remote_uri.into();
        Arc::new_cyclic(|weak: &Weak<ProxyKernel>| {
            let core = KernelCore::new(name);
            let kernel: Weak<dyn Kernel> = weak.clone();
            core.bind(kernel);
            core.update_info(|info| {
                info.is_proxy = true;
                info.remote_uri = Some(remote_uri);
            });

            let listener = weak.clone();
            let info_listener = receiver.subscribe(Arc::new(move |envelope: &KernelEnvelope| {
                if let Some(proxy) = listener.upgrade() {
                    proxy.absorb_unsolicited_info(envelope);
                }
            }));

            Self {
                core,
                sender,
                receiver,
                handler: Arc::new(ProxyCommandHandler {
                    proxy: weak.clone(),
                }),
                _info_listener: info_listener,
            }
        })
    }

    pub fn remote_uri(&self) -> Option<String> {
        self.core.kernel_info().remote_uri
    }

    pub fn set_remote_uri(&self, remote_uri: impl Into<String>) {
        let remote_uri = remote_uri.into();
        self.core.update_info(|info| info.remote_uri = Some(remote_uri));
    }

    /// Remote kernels announce descriptor changes with command-less `KernelInfoProduced`
    /// events; those describing our remote are merged and republished here.
    fn absorb_unsolicited_info(&self, envelope: &KernelEnvelope) {
        let KernelEnvelope::Event(event) = envelope else {
            return;
        };
        if event.command().is_some() {
            return;
        }
        let Ok(produced) = event.payload::<KernelInfoProduced>() else {
            return;
        };
        if let Some(kernel_info) = merge_remote_info(&self.core, &produced.kernel_info) {
            debug!(kernel = %self.core.name(), "merged unsolicited remote kernel info");
            self.core.publish(KernelEventEnvelope::from_payload(
                &KernelInfoProduced { kernel_info },
                None,
            ));
        }
    }

    async fn forward(
        &self,
        envelope: &KernelCommandEnvelope,
        context: &Arc<KernelInvocationContext>,
    ) -> Result<(), KernelError> {
        let token = envelope.get_or_create_token();
        let own_uri = self.core.uri();
        let remote_uri = self.remote_uri();
        let destination = envelope.update_command(|command| {
            command.origin_uri.get_or_insert_with(|| own_uri.clone());
            if command.destination_uri.is_none() {
                command.destination_uri = remote_uri.clone();
            }
            command.destination_uri.clone()
        });

        if envelope.command_type().as_str() == CommandType::REQUEST_KERNEL_INFO {
            let already_there = destination
                .as_deref()
                .is_some_and(|destination| envelope.routing_slip().contains(destination, true));
            if already_there {
                debug!(kernel = %self.core.name(), "kernel info already gathered from remote");
                return Ok(());
            }
        }

        let (tx, rx) = oneshot::channel();
        let relay = Arc::new(Relay {
            core: self.core.clone(),
            command: envelope.clone(),
            context: context.clone(),
            token,
            completion: Mutex::new(Some(tx)),
        });
        let _subscription = self
            .receiver
            .subscribe(Arc::new(move |incoming: &KernelEnvelope| relay.on_envelope(incoming)));

        debug!(kernel = %self.core.name(), command_type = %envelope.command_type(), destination = ?destination, "forwarding command");
        // The transport gets its own copy; stamps on either side stay local.
        self.sender.send(envelope.deep_clone().into()).await?;
        let terminal = rx.await.map_err(|_| TransportError::Closed)?;

        if let Ok(failed) = terminal.payload::<CommandFailed>() {
            context.fail(Some(failed.message));
        }
        Ok(())
    }
}

#[async_trait]
impl Kernel for ProxyKernel {
    fn core(&self) -> &KernelCore {
        &self.core
    }

    fn command_handler(&self, _command_type: &CommandType) -> Option<Arc<dyn KernelCommandHandler>> {
        Some(self.handler.clone())
    }
}

struct ProxyCommandHandler {
    proxy: Weak<ProxyKernel>,
}

#[async_trait]
impl KernelCommandHandler for ProxyCommandHandler {
    async fn handle(&self, invocation: KernelInvocation) -> anyhow::Result<()> {
        let proxy = self
            .proxy
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("proxy kernel was dropped"))?;
        let result = proxy
            .forward(&invocation.command_envelope, &invocation.context)
            .await;
        if let Err(err) = result {
            warn!(kernel = %proxy.core.name(), %err, "forwarding failed");
            invocation.context.fail(Some(err.to_string()));
        }
        Ok(())
    }
}

/// Per-forward view of the receiver stream.
struct Relay {
    core: KernelCore,
    command: KernelCommandEnvelope,
    context: Arc<KernelInvocationContext>,
    token: String,
    completion: Mutex<Option<oneshot::Sender<KernelEventEnvelope>>>,
}

impl Relay {
    fn on_envelope(&self, incoming: &KernelEnvelope) {
        let KernelEnvelope::Event(event) = incoming else {
            return;
        };
        let Some(token) = event.command().and_then(|command| command.token().ok()) else {
            return;
        };
        let exact = token == self.token;
        if !exact && !token.starts_with(&format!("{}.", self.token)) {
            return;
        }

        if exact {
            self.merge_routing_slip(event);
        }

        if let Ok(produced) = event.payload::<KernelInfoProduced>() {
            if let Some(kernel_info) = merge_remote_info(&self.core, &produced.kernel_info) {
                let local = KernelEventEnvelope::from_payload(
                    &KernelInfoProduced { kernel_info },
                    Some(self.command.clone()),
                );
                self.delegate(&local);
                self.delegate(event);
                return;
            }
        }

        if exact && event.event_type().is_terminal() {
            if let Some(completion) = lock(&self.completion).take() {
                let _ = completion.send(event.clone());
            }
            return;
        }
        self.delegate(event);
    }

    fn merge_routing_slip(&self, event: &KernelEventEnvelope) {
        let Some(remote) = event.command() else {
            return;
        };
        let remote_slip = remote.routing_slip().to_vec();
        let merged = self.command.routing_slip().continue_with(&remote_slip);
        if let Err(err) = merged {
            warn!(kernel = %self.core.name(), %err, "failed to merge remote routing slip");
        }
    }

    /// Republishes a remote event in the local invocation, at most once per proxy.
    fn delegate(&self, event: &KernelEventEnvelope) {
        let own_uri = self.core.uri();
        let already_seen = {
            let mut slip = event.routing_slip();
            if slip.contains(&own_uri, true) {
                true
            } else {
                if let Err(err) = slip.stamp(&own_uri) {
                    warn!(kernel = %self.core.name(), %err, "failed to stamp relayed event");
                }
                false
            }
        };
        let origin = event.command().and_then(|command| command.origin_uri());
        let same_origin =
            origin.is_none_or(|origin| create_kernel_uri(&origin) == create_kernel_uri(&own_uri));
        if same_origin && !already_seen {
            self.context.publish(event.clone());
        }
    }
}

/// Merges `remote` into the proxy descriptor when it describes the proxy's remote
/// kernel, returning the updated descriptor.
fn merge_remote_info(core: &KernelCore, remote: &KernelInfo) -> Option<KernelInfo> {
    core.update_info(|info| {
        let matches = info
            .remote_uri
            .as_deref()
            .is_some_and(|remote_uri| create_kernel_uri(remote_uri) == create_kernel_uri(&remote.uri));
        matches.then(|| {
            info.merge_from_remote(remote);
            info.clone()
        })
    })
}

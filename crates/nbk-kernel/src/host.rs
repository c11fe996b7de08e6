//! The host: owns the root composite kernel and connects it to the outside world.

use std::sync::{Arc, Mutex};

use nbk_protocol::{KernelCommandEnvelope, KernelEnvelope, KernelEventEnvelope, KernelReady};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::composite::CompositeKernel;
use crate::config::HostConfig;
use crate::connector::Connector;
use crate::error::KernelError;
use crate::kernel::{Kernel, KernelExt};
use crate::lock;
use crate::proxy::ProxyKernel;
use crate::scheduler::KernelScheduler;
use crate::subject::Subscription;
use crate::transport::{Forwarder, KernelEnvelopeReceiver, KernelEnvelopeSender, spawn_forwarder};

#[derive(Default)]
struct Connection {
    subscriptions: Vec<Subscription>,
    forwarder: Option<Forwarder>,
    task: Option<JoinHandle<()>>,
}

pub struct KernelHost {
    kernel: Arc<CompositeKernel>,
    config: HostConfig,
    scheduler: KernelScheduler<KernelCommandEnvelope>,
    default_connector: Arc<Connector>,
    connectors: Mutex<Vec<Arc<Connector>>>,
    connection: Mutex<Connection>,
}

impl KernelHost {
    /// Binds `kernel` to this host. The composite takes the configured host URI and
    /// `sender`/`receiver` become the default connector.
    pub fn new(
        kernel: Arc<CompositeKernel>,
        sender: Arc<dyn KernelEnvelopeSender>,
        receiver: Arc<dyn KernelEnvelopeReceiver>,
        config: HostConfig,
    ) -> Arc<Self> {
        kernel.set_host_uri(&config.uri);

        let scheduler = KernelScheduler::new();
        let trampolined = config.trampoline_commands.clone();
        scheduler.set_must_trampoline(move |command: &KernelCommandEnvelope| {
            trampolined.contains(command.command_type())
        });

        let default_connector = Arc::new(Connector::new(sender, receiver, Vec::new()));
        info!(uri = %config.uri, kernel = %kernel.name(), "kernel host created");
        Arc::new(Self {
            kernel,
            config,
            scheduler,
            connectors: Mutex::new(vec![default_connector.clone()]),
            default_connector,
            connection: Mutex::new(Connection::default()),
        })
    }

    pub fn uri(&self) -> String {
        self.kernel.uri()
    }

    pub fn kernel(&self) -> &Arc<CompositeKernel> {
        &self.kernel
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn default_connector(&self) -> Arc<Connector> {
        self.default_connector.clone()
    }

    pub fn add_connector(&self, connector: Arc<Connector>) {
        lock(&self.connectors).push(connector);
    }

    pub fn connectors(&self) -> Vec<Arc<Connector>> {
        lock(&self.connectors).clone()
    }

    /// The first connector that can reach `remote_uri`.
    pub fn try_get_connector(&self, remote_uri: &str) -> Option<Arc<Connector>> {
        lock(&self.connectors)
            .iter()
            .find(|connector| connector.can_reach(remote_uri))
            .cloned()
    }

    /// Adds a proxy for the kernel at `remote_uri`, wired to a connector that can reach it.
    pub fn connect_proxy_kernel(
        &self,
        local_name: &str,
        remote_uri: &str,
        aliases: &[&str],
    ) -> Result<Arc<ProxyKernel>, KernelError> {
        let connector = self
            .try_get_connector(remote_uri)
            .ok_or_else(|| KernelError::NoConnector(remote_uri.to_string()))?;
        let proxy = ProxyKernel::new(
            local_name,
            connector.sender(),
            connector.receiver(),
            remote_uri,
        );
        self.kernel.add(proxy.clone(), aliases)?;
        info!(kernel = %local_name, %remote_uri, "connected proxy kernel");
        Ok(proxy)
    }

    /// Starts serving the default connector: kernel events flow out, inbound commands
    /// are queued into the root kernel, and `KernelReady` is announced.
    pub fn connect(self: &Arc<Self>) -> Result<KernelReady, KernelError> {
        let (forwarder, task) = spawn_forwarder(self.default_connector.sender());
        let mut subscriptions = Vec::new();

        if self.config.forward_kernel_events {
            let outbound = forwarder.clone();
            subscriptions.push(self.kernel.subscribe_to_kernel_events(Arc::new(
                move |event: &KernelEventEnvelope| {
                    if let Err(err) = outbound.forward(event.deep_clone().into()) {
                        warn!(%err, "failed to forward kernel event");
                    }
                },
            )));
        }

        let host = Arc::downgrade(self);
        subscriptions.push(self.default_connector.receiver().subscribe(Arc::new(
            move |envelope: &KernelEnvelope| {
                let KernelEnvelope::Command(command) = envelope else {
                    return;
                };
                if let Some(host) = host.upgrade() {
                    host.schedule_inbound(command.clone());
                }
            },
        )));

        let mut kernel_infos = vec![self.kernel.kernel_info()];
        kernel_infos.extend(
            self.kernel
                .child_kernels()
                .iter()
                .map(|kernel| kernel.kernel_info())
                .filter(|info| !info.is_proxy),
        );
        let ready = KernelReady { kernel_infos };
        let event = KernelEventEnvelope::from_payload(&ready, None);
        event.routing_slip().stamp(&self.kernel.uri())?;
        forwarder.forward(event.into())?;

        *lock(&self.connection) = Connection {
            subscriptions,
            forwarder: Some(forwarder),
            task: Some(task),
        };
        info!(uri = %self.uri(), kernels = ready.kernel_infos.len(), "kernel host connected");
        Ok(ready)
    }

    fn schedule_inbound(&self, command: KernelCommandEnvelope) {
        debug!(command_type = %command.command_type(), "scheduling inbound command");
        let kernel = self.kernel.clone();
        let completion = self
            .scheduler
            .run_async(command, move |command| async move { kernel.send(command).await });
        tokio::spawn(async move {
            if let Err(err) = completion.await {
                warn!(%err, "inbound command did not complete");
            }
        });
    }

    /// Picks the kernel an inbound command is meant for: by destination URI, then
    /// origin URI, then target name, falling back to the root kernel.
    pub fn get_kernel(&self, envelope: &KernelCommandEnvelope) -> Arc<dyn Kernel> {
        let command = envelope.command();
        let found = command
            .destination_uri
            .as_deref()
            .and_then(|uri| self.kernel.find_kernel_by_uri(uri))
            .or_else(|| {
                command
                    .origin_uri
                    .as_deref()
                    .and_then(|uri| self.kernel.find_kernel_by_uri(uri))
            })
            .or_else(|| {
                command
                    .target_kernel_name
                    .as_deref()
                    .and_then(|name| self.kernel.find_kernel_by_name(name))
            });
        match found {
            Some(kernel) => {
                debug!(kernel = %kernel.name(), command_type = %envelope.command_type(), "resolved kernel for command");
                kernel
            }
            None => {
                debug!(kernel = %self.kernel.name(), command_type = %envelope.command_type(), "defaulting to root kernel");
                self.kernel.clone()
            }
        }
    }

    /// Waits for queued inbound commands, then stops forwarding.
    pub async fn shutdown(&self) {
        self.scheduler.wait_idle().await;
        let task = {
            let mut connection = lock(&self.connection);
            connection.subscriptions.clear();
            connection.forwarder = None;
            connection.task.take()
        };
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(%err, "forwarder task failed");
            }
        }
        info!(uri = %self.uri(), "kernel host stopped");
    }
}

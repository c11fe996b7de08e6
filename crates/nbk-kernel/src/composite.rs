//! A kernel that owns named child kernels and routes commands among them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use nbk_protocol::{
    CommandType, KernelCommand, KernelCommandEnvelope, KernelEventEnvelope, KernelInfoProduced,
    create_kernel_uri,
};
use tracing::{debug, error, warn};

use crate::collection::KernelCollection;
use crate::context::KernelInvocationContext;
use crate::error::KernelError;
use crate::handler::{KernelCommandHandler, KernelInvocation};
use crate::kernel::{Kernel, KernelCore, KernelTarget, handle_with_registered_handler};
use crate::lock;
use crate::subject::Subscription;

pub struct CompositeKernel {
    core: KernelCore,
    children: Mutex<KernelCollection>,
    default_kernel_name: Mutex<Option<String>>,
    default_targets: Mutex<HashMap<CommandType, String>>,
    host_uri: Mutex<Option<String>>,
    child_subscriptions: Mutex<Vec<Subscription>>,
}

impl CompositeKernel {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|weak: &Weak<CompositeKernel>| {
            let core = KernelCore::new(name);
            let kernel: Weak<dyn Kernel> = weak.clone();
            core.bind(kernel);
            core.update_info(|info| info.is_composite = true);
            core.register_command_handler(
                CommandType::REQUEST_KERNEL_INFO,
                Arc::new(CompositeKernelInfoHandler {
                    composite: weak.clone(),
                }),
            );
            Self {
                core,
                children: Mutex::new(KernelCollection::new()),
                default_kernel_name: Mutex::new(None),
                default_targets: Mutex::new(HashMap::new()),
                host_uri: Mutex::new(None),
                child_subscriptions: Mutex::new(Vec::new()),
            }
        })
    }

    pub fn register_command_handler(
        &self,
        command_type: impl Into<CommandType>,
        handler: Arc<dyn KernelCommandHandler>,
    ) {
        self.core.register_command_handler(command_type, handler);
    }

    /// Adds a child kernel under its name plus `aliases`. The child's events are
    /// re-stamped with this kernel's URI and republished here, and the first child
    /// added becomes the default target.
    pub fn add(&self, kernel: Arc<dyn Kernel>, aliases: &[&str]) -> Result<(), KernelError> {
        let name = kernel.name();
        let mut merged = kernel.kernel_info().aliases;
        for alias in aliases {
            if !merged.iter().any(|existing| existing == alias) {
                merged.push(alias.to_string());
            }
        }
        lock(&self.children).validate(&name, &merged)?;

        lock(&self.default_kernel_name).get_or_insert_with(|| name.clone());
        kernel.core().set_parent(&self.core);

        let core = self.core.clone();
        let subscription = kernel
            .subscribe_to_kernel_events(Arc::new(move |event| core.stamp_and_republish(event)));

        kernel
            .core()
            .update_info(|info| info.add_aliases(merged.iter().cloned()));
        if let Some(host_uri) = lock(&self.host_uri).clone() {
            kernel
                .core()
                .set_uri(format!("{}/{name}", host_uri.trim_end_matches('/')));
        }
        lock(&self.children).add(kernel.clone())?;
        lock(&self.child_subscriptions).push(subscription);

        debug!(composite = %self.core.name(), kernel = %name, uri = %kernel.uri(), "added kernel");
        self.core.publish(KernelEventEnvelope::from_payload(
            &KernelInfoProduced {
                kernel_info: kernel.kernel_info(),
            },
            None,
        ));
        Ok(())
    }

    /// Binds this kernel to a host: this kernel takes the host URI and every child is
    /// re-addressed beneath it.
    pub fn set_host_uri(&self, host_uri: &str) {
        *lock(&self.host_uri) = Some(host_uri.to_string());
        self.core.set_uri(host_uri);
        lock(&self.children).notify_that_host_was_set(host_uri);
    }

    pub fn host_uri(&self) -> Option<String> {
        lock(&self.host_uri).clone()
    }

    pub fn default_kernel_name(&self) -> Option<String> {
        lock(&self.default_kernel_name).clone()
    }

    pub fn set_default_kernel_name(&self, name: impl Into<String>) {
        *lock(&self.default_kernel_name) = Some(name.into());
    }

    /// Routes untargeted commands of `command_type` to `kernel_name`.
    pub fn set_default_target_for_command(
        &self,
        command_type: impl Into<CommandType>,
        kernel_name: impl Into<String>,
    ) {
        lock(&self.default_targets).insert(command_type.into(), kernel_name.into());
    }

    pub fn child_kernels(&self) -> Vec<Arc<dyn Kernel>> {
        lock(&self.children).iter().cloned().collect()
    }

    /// This kernel or a child addressed by `uri` (local or, for proxies, remote).
    pub fn find_kernel_by_uri(&self, uri: &str) -> Option<Arc<dyn Kernel>> {
        if create_kernel_uri(uri) == create_kernel_uri(&self.core.uri()) {
            return self.core.kernel();
        }
        lock(&self.children).try_get_by_uri(uri)
    }

    /// This kernel or a child known by `name` or alias.
    pub fn find_kernel_by_name(&self, name: &str) -> Option<Arc<dyn Kernel>> {
        if name == self.core.name() {
            return self.core.kernel();
        }
        lock(&self.children).try_get_by_alias(name)
    }

    fn resolve(
        &self,
        envelope: &KernelCommandEnvelope,
        context: Option<&KernelInvocationContext>,
    ) -> Result<KernelTarget, KernelError> {
        let command = envelope.command();

        if let Some(destination) = command.destination_uri.as_deref() {
            if let Some(kernel) = lock(&self.children).try_get_by_uri(destination) {
                return Ok(KernelTarget::Child(kernel));
            }
        }

        let mut target = command.target_kernel_name.clone();
        if target.is_none() {
            if self.can_handle(envelope) {
                return Ok(KernelTarget::This);
            }
            target = lock(&self.default_targets)
                .get(envelope.command_type())
                .cloned()
                .or_else(|| self.default_kernel_name());
        }

        if let Some(name) = target {
            if name == self.core.name() {
                return Ok(KernelTarget::This);
            }
            return match lock(&self.children).try_get_by_alias(&name) {
                Some(kernel) => Ok(KernelTarget::Child(kernel)),
                None => {
                    error!(composite = %self.core.name(), kernel = %name, "kernel not found");
                    Err(KernelError::KernelNotFound(name))
                }
            };
        }

        if let Some(kernel) = lock(&self.children).single() {
            return Ok(KernelTarget::Child(kernel));
        }

        if let Some(kernel) = context.and_then(|context| context.handling_kernel()) {
            if kernel.core().ptr_eq(&self.core) {
                return Ok(KernelTarget::This);
            }
            return Ok(KernelTarget::Child(kernel));
        }

        Ok(KernelTarget::This)
    }

    async fn dispatch(
        &self,
        envelope: &KernelCommandEnvelope,
        context: &Arc<KernelInvocationContext>,
    ) -> Result<(), KernelError> {
        let targets_self =
            envelope.target_kernel_name().as_deref() == Some(self.core.name());
        let target = if targets_self {
            Ok(KernelTarget::This)
        } else {
            self.handling_kernel(envelope, Some(context))
        };

        match target {
            Ok(KernelTarget::This) => handle_with_registered_handler(self, envelope, context).await,
            Ok(KernelTarget::Child(child)) => {
                let uri = child.uri();
                let arrived = envelope.routing_slip().stamp_as_arrived(&uri);
                if let Err(err) = arrived {
                    warn!(kernel = %child.name(), %err, "command already arrived at kernel");
                }
                debug!(composite = %self.core.name(), kernel = %child.name(), command_type = %envelope.command_type(), "routing command to child");
                let result = child.handle_command(envelope, context).await;
                let departed = envelope.routing_slip().stamp(&uri);
                if let Err(err) = departed {
                    warn!(kernel = %child.name(), %err, "failed to stamp command departure");
                }
                result
            }
            Err(err) => {
                self.fail_as_root(envelope, context, &err);
                Err(err)
            }
        }
    }

    /// Fails the invocation so that, for a root command, the failure also reaches
    /// this kernel's event stream.
    fn fail_as_root(
        &self,
        envelope: &KernelCommandEnvelope,
        context: &KernelInvocationContext,
        err: &KernelError,
    ) {
        let subscription = context.is_root(envelope).then(|| {
            let core = self.core.clone();
            context.subscribe(move |event| core.stamp_and_republish(event))
        });
        context.fail(Some(err.to_string()));
        drop(subscription);
    }
}

#[async_trait]
impl Kernel for CompositeKernel {
    fn core(&self) -> &KernelCore {
        &self.core
    }

    fn handling_kernel(
        &self,
        envelope: &KernelCommandEnvelope,
        context: Option<&KernelInvocationContext>,
    ) -> Result<KernelTarget, KernelError> {
        self.resolve(envelope, context)
    }

    async fn handle_command(
        &self,
        envelope: &KernelCommandEnvelope,
        context: &Arc<KernelInvocationContext>,
    ) -> Result<(), KernelError> {
        let previous = context.handling_kernel();
        let result = self.dispatch(envelope, context).await;
        context.set_handling_kernel(previous);
        result
    }
}

/// Publishes the composite's own descriptor, then asks every child that supports
/// `RequestKernelInfo` for its descriptor within the same invocation.
struct CompositeKernelInfoHandler {
    composite: Weak<CompositeKernel>,
}

#[async_trait]
impl KernelCommandHandler for CompositeKernelInfoHandler {
    async fn handle(&self, invocation: KernelInvocation) -> anyhow::Result<()> {
        let composite = self
            .composite
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("composite kernel was dropped"))?;
        let envelope = &invocation.command_envelope;
        invocation.context.publish(KernelEventEnvelope::from_payload(
            &KernelInfoProduced {
                kernel_info: composite.kernel_info(),
            },
            Some(envelope.clone()),
        ));

        let request_kernel_info = CommandType::from(CommandType::REQUEST_KERNEL_INFO);
        for child in composite.child_kernels() {
            if !child.supports_command(&request_kernel_info) {
                continue;
            }
            let child_command = KernelCommandEnvelope::new(
                request_kernel_info.clone(),
                KernelCommand::targeting(child.name()),
            );
            child_command.set_parent(envelope)?;
            let slip = envelope.routing_slip().to_vec();
            child_command.routing_slip().continue_with(&slip)?;
            child.handle_command(&child_command, &invocation.context).await?;
        }
        Ok(())
    }
}

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use nbk_protocol::{KernelCommandEnvelope, KernelEventEnvelope};

use crate::context::KernelInvocationContext;

/// What a command handler receives: the command being handled and its invocation.
#[derive(Clone, Debug)]
pub struct KernelInvocation {
    pub command_envelope: KernelCommandEnvelope,
    pub context: Arc<KernelInvocationContext>,
}

impl KernelInvocation {
    /// Publishes an event attributed to the command being handled.
    pub fn publish(&self, event_type: &str, event: serde_json::Value) {
        self.context.publish(KernelEventEnvelope::new(
            event_type,
            event,
            Some(self.command_envelope.clone()),
        ));
    }
}

/// Handles one command type for a kernel. Returning `Err` fails the invocation with
/// the error's message.
#[async_trait]
pub trait KernelCommandHandler: Send + Sync {
    async fn handle(&self, invocation: KernelInvocation) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> KernelCommandHandler for FnHandler<F>
where
    F: Fn(KernelInvocation) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, invocation: KernelInvocation) -> anyhow::Result<()> {
        (self.0)(invocation).await
    }
}

/// Wraps an async closure as a [`KernelCommandHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn KernelCommandHandler>
where
    F: Fn(KernelInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

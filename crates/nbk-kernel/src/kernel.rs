//! The kernel abstraction and its base dispatch algorithm.
//!
//! Every kernel owns a [`KernelCore`] (name, descriptor, handler table, event stream,
//! parent link, scheduler) and implements [`Kernel`], overriding only the capabilities
//! it changes. [`handle_with_registered_handler`] is the shared dispatch step that
//! composite and proxy kernels fall back to.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use async_trait::async_trait;
use nbk_protocol::{
    CommandType, KernelCommandEnvelope, KernelCommandEnvelopeModel, KernelEventEnvelope,
    KernelInfo, KernelInfoProduced, create_kernel_uri,
};
use tracing::{debug, warn};

use crate::context::KernelInvocationContext;
use crate::error::KernelError;
use crate::handler::{KernelCommandHandler, KernelInvocation};
use crate::lock;
use crate::scheduler::KernelScheduler;
use crate::subject::{Subject, Subscription};

pub type KernelEventObserver = Arc<dyn Fn(&KernelEventEnvelope) + Send + Sync>;

/// Where a command should be handled, as resolved by [`Kernel::handling_kernel`].
#[derive(Clone)]
pub enum KernelTarget {
    This,
    Child(Arc<dyn Kernel>),
}

impl std::fmt::Debug for KernelTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelTarget::This => f.write_str("This"),
            KernelTarget::Child(kernel) => write!(f, "Child({})", kernel.name()),
        }
    }
}

#[async_trait]
pub trait Kernel: Send + Sync + 'static {
    fn core(&self) -> &KernelCore;

    fn name(&self) -> String {
        self.core().name().to_string()
    }

    fn uri(&self) -> String {
        self.core().uri()
    }

    fn kernel_info(&self) -> KernelInfo {
        self.core().kernel_info()
    }

    fn command_handler(&self, command_type: &CommandType) -> Option<Arc<dyn KernelCommandHandler>> {
        self.core().command_handler(command_type)
    }

    fn supports_command(&self, command_type: &CommandType) -> bool {
        self.core().supports_command(command_type)
    }

    /// False when the command names a different target kernel or destination;
    /// otherwise whether this kernel supports the command type.
    fn can_handle(&self, envelope: &KernelCommandEnvelope) -> bool {
        let command = envelope.command();
        if command
            .target_kernel_name
            .as_deref()
            .is_some_and(|target| target != self.name())
        {
            return false;
        }
        if command
            .destination_uri
            .as_deref()
            .is_some_and(|destination| create_kernel_uri(destination) != create_kernel_uri(&self.uri()))
        {
            return false;
        }
        self.supports_command(envelope.command_type())
    }

    fn handling_kernel(
        &self,
        _envelope: &KernelCommandEnvelope,
        _context: Option<&KernelInvocationContext>,
    ) -> Result<KernelTarget, KernelError> {
        Ok(KernelTarget::This)
    }

    /// Handles `envelope` within `context`. Resolves or fails exactly once; a failing
    /// handler both fails the invocation and returns the error.
    async fn handle_command(
        &self,
        envelope: &KernelCommandEnvelope,
        context: &Arc<KernelInvocationContext>,
    ) -> Result<(), KernelError> {
        handle_with_registered_handler(self, envelope, context).await
    }

    fn subscribe_to_kernel_events(&self, observer: KernelEventObserver) -> Subscription {
        self.core().events().subscribe_shared(observer)
    }
}

/// Base dispatch: runs the registered handler for `envelope` with this kernel marked as
/// the handling kernel, then completes or fails the invocation.
///
/// While the root command is handled, invocation events are stamped with this kernel's
/// URI and republished on its own event stream.
pub async fn handle_with_registered_handler<K: Kernel + ?Sized>(
    kernel: &K,
    envelope: &KernelCommandEnvelope,
    context: &Arc<KernelInvocationContext>,
) -> Result<(), KernelError> {
    let previous = context.set_handling_kernel(kernel.core().kernel());
    let root_subscription = context.is_root(envelope).then(|| {
        let core = kernel.core().clone();
        context.subscribe(move |event| core.stamp_and_republish(event))
    });

    let result = match kernel.command_handler(envelope.command_type()) {
        Some(handler) => {
            debug!(kernel = %kernel.name(), command_type = %envelope.command_type(), "handling command");
            let invocation = KernelInvocation {
                command_envelope: envelope.clone(),
                context: context.clone(),
            };
            match handler.handle(invocation).await {
                Ok(()) => {
                    context.complete(envelope);
                    Ok(())
                }
                Err(err) => {
                    context.fail(Some(err.to_string()));
                    Err(KernelError::Handler(err))
                }
            }
        }
        None if envelope.command_type().is_language_service_request() => {
            context.complete(envelope);
            Ok(())
        }
        None => {
            let err = KernelError::NoHandler(envelope.command_type().clone());
            context.fail(Some(err.to_string()));
            Err(err)
        }
    };

    context.set_handling_kernel(previous);
    drop(root_subscription);
    result
}

/// Entry point behind [`KernelExt::send`].
///
/// Outside an invocation the command is queued on the kernel tree's scheduler and
/// runs with a fresh ambient context. Sent from inside a running handler it joins that
/// invocation and runs inline.
pub async fn send_command(
    kernel: Arc<dyn Kernel>,
    envelope: KernelCommandEnvelope,
) -> Result<(), KernelError> {
    let nested = KernelInvocationContext::current().is_some_and(|context| !context.is_complete());
    let context = KernelInvocationContext::get_or_create_ambient(&envelope)?;
    let uri = kernel.uri();
    let arrived = envelope.routing_slip().stamp_as_arrived(&uri);
    if let Err(err) = arrived {
        warn!(kernel = %kernel.name(), %err, "command already arrived at kernel");
    }

    if nested {
        debug!(kernel = %kernel.name(), command_type = %envelope.command_type(), "running nested command inline");
        execute_command(kernel.as_ref(), &envelope, &context).await;
        stamp_departure(&envelope, &uri);
        return Ok(());
    }

    let scheduler = kernel.core().scheduler();
    scheduler
        .run_async(envelope, move |envelope| async move {
            KernelInvocationContext::scope(context.clone(), async {
                execute_command(kernel.as_ref(), &envelope, &context).await;
            })
            .await;
            stamp_departure(&envelope, &uri);
            context.dispose();
            Ok(())
        })
        .await
}

/// Runs `handle_command`, converting a returned error into a failed invocation.
pub async fn execute_command(
    kernel: &dyn Kernel,
    envelope: &KernelCommandEnvelope,
    context: &Arc<KernelInvocationContext>,
) {
    let previous = context.handling_kernel();
    let result = kernel.handle_command(envelope, context).await;
    context.set_handling_kernel(previous);
    if let Err(err) = result {
        context.fail(Some(err.to_string()));
    }
}

fn stamp_departure(envelope: &KernelCommandEnvelope, uri: &str) {
    if let Err(err) = envelope.routing_slip().stamp(uri) {
        warn!(%uri, %err, "failed to stamp command departure");
    }
}

#[async_trait]
pub trait KernelExt {
    async fn send(&self, envelope: KernelCommandEnvelope) -> Result<(), KernelError>;

    /// Accepts the wire form of a command.
    async fn send_model(&self, model: KernelCommandEnvelopeModel) -> Result<(), KernelError> {
        self.send(KernelCommandEnvelope::from_model(model)?).await
    }
}

#[async_trait]
impl<K: Kernel> KernelExt for Arc<K> {
    async fn send(&self, envelope: KernelCommandEnvelope) -> Result<(), KernelError> {
        send_command(self.clone(), envelope).await
    }
}

#[async_trait]
impl KernelExt for Arc<dyn Kernel> {
    async fn send(&self, envelope: KernelCommandEnvelope) -> Result<(), KernelError> {
        send_command(self.clone(), envelope).await
    }
}

/// State shared by every kernel kind. Cloning shares the same kernel.
#[derive(Clone)]
pub struct KernelCore {
    inner: Arc<CoreInner>,
}

struct CoreInner {
    name: String,
    info: Mutex<KernelInfo>,
    handlers: Mutex<HashMap<CommandType, Arc<dyn KernelCommandHandler>>>,
    events: Subject<KernelEventEnvelope>,
    parent: Mutex<Option<Weak<CoreInner>>>,
    scheduler: Mutex<Option<KernelScheduler<KernelCommandEnvelope>>>,
    kernel: OnceLock<Weak<dyn Kernel>>,
}

impl KernelCore {
    /// Creates the core with URI `kernel://local/{name}` and a `RequestKernelInfo`
    /// handler that reports this kernel's descriptor.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let info = KernelInfo::new(name.clone(), format!("kernel://local/{name}"));
        let core = Self {
            inner: Arc::new(CoreInner {
                name,
                info: Mutex::new(info),
                handlers: Mutex::new(HashMap::new()),
                events: Subject::new(),
                parent: Mutex::new(None),
                scheduler: Mutex::new(None),
                kernel: OnceLock::new(),
            }),
        };
        core.install_handler(
            CommandType::REQUEST_KERNEL_INFO.into(),
            Arc::new(RequestKernelInfoHandler {
                core: Arc::downgrade(&core.inner),
            }),
        );
        core
    }

    /// Records the kernel that owns this core; called once from the kernel's constructor.
    pub fn bind(&self, kernel: Weak<dyn Kernel>) {
        let _ = self.inner.kernel.set(kernel);
    }

    pub fn kernel(&self) -> Option<Arc<dyn Kernel>> {
        self.inner.kernel.get().and_then(Weak::upgrade)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kernel_info(&self) -> KernelInfo {
        lock(&self.inner.info).clone()
    }

    pub fn uri(&self) -> String {
        lock(&self.inner.info).uri.clone()
    }

    pub fn set_uri(&self, uri: impl Into<String>) {
        lock(&self.inner.info).uri = uri.into();
    }

    pub fn update_info<R>(&self, f: impl FnOnce(&mut KernelInfo) -> R) -> R {
        f(&mut lock(&self.inner.info))
    }

    pub fn ptr_eq(&self, other: &KernelCore) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Registers `handler`, replacing any earlier one for the same command type. The
    /// first registration for a type announces the new capability with `KernelInfoProduced`.
    pub fn register_command_handler(
        &self,
        command_type: impl Into<CommandType>,
        handler: Arc<dyn KernelCommandHandler>,
    ) {
        if self.install_handler(command_type.into(), handler) {
            let info = self.kernel_info();
            self.publish(KernelEventEnvelope::from_payload(
                &KernelInfoProduced { kernel_info: info },
                None,
            ));
        }
    }

    fn install_handler(
        &self,
        command_type: CommandType,
        handler: Arc<dyn KernelCommandHandler>,
    ) -> bool {
        lock(&self.inner.info).add_supported_command(&command_type);
        lock(&self.inner.handlers)
            .insert(command_type, handler)
            .is_none()
    }

    pub fn command_handler(
        &self,
        command_type: &CommandType,
    ) -> Option<Arc<dyn KernelCommandHandler>> {
        lock(&self.inner.handlers).get(command_type).cloned()
    }

    pub fn supports_command(&self, command_type: &CommandType) -> bool {
        lock(&self.inner.handlers).contains_key(command_type)
            || lock(&self.inner.info).supports(command_type)
    }

    pub fn events(&self) -> &Subject<KernelEventEnvelope> {
        &self.inner.events
    }

    /// Publishes through the ambient invocation when there is one, otherwise straight
    /// onto this kernel's event stream.
    pub fn publish(&self, event: KernelEventEnvelope) {
        match KernelInvocationContext::current() {
            Some(context) if !context.is_complete() => context.publish(event),
            _ => self.inner.events.next(&event),
        }
    }

    /// Stamps this kernel's URI onto `event` (when missing) and emits it on this
    /// kernel's event stream.
    pub fn stamp_and_republish(&self, event: &KernelEventEnvelope) {
        let uri = self.uri();
        {
            let mut slip = event.routing_slip();
            if !slip.contains(&uri, false) {
                if let Err(err) = slip.stamp(&uri) {
                    warn!(%uri, %err, "failed to stamp event routing slip");
                }
            }
        }
        self.inner.events.next(event);
    }

    pub fn set_parent(&self, parent: &KernelCore) {
        *lock(&self.inner.parent) = Some(Arc::downgrade(&parent.inner));
    }

    pub fn parent(&self) -> Option<KernelCore> {
        lock(&self.inner.parent)
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| KernelCore { inner })
    }

    /// The scheduler shared by the whole kernel tree, created lazily at the root.
    pub fn scheduler(&self) -> KernelScheduler<KernelCommandEnvelope> {
        if let Some(parent) = self.parent() {
            return parent.scheduler();
        }
        lock(&self.inner.scheduler)
            .get_or_insert_with(KernelScheduler::new)
            .clone()
    }
}

impl std::fmt::Debug for KernelCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelCore")
            .field("name", &self.inner.name)
            .field("uri", &self.uri())
            .finish()
    }
}

struct RequestKernelInfoHandler {
    core: Weak<CoreInner>,
}

#[async_trait]
impl KernelCommandHandler for RequestKernelInfoHandler {
    async fn handle(&self, invocation: KernelInvocation) -> anyhow::Result<()> {
        let inner = self
            .core
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("kernel was dropped"))?;
        let kernel_info = lock(&inner.info).clone();
        invocation.context.publish(KernelEventEnvelope::from_payload(
            &KernelInfoProduced { kernel_info },
            Some(invocation.command_envelope.clone()),
        ));
        Ok(())
    }
}

/// A kernel that only runs its registered handlers.
pub struct SimpleKernel {
    core: KernelCore,
}

impl SimpleKernel {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|weak: &Weak<SimpleKernel>| {
            let core = KernelCore::new(name);
            let weak: Weak<dyn Kernel> = weak.clone();
            core.bind(weak);
            Self { core }
        })
    }

    pub fn register_command_handler(
        &self,
        command_type: impl Into<CommandType>,
        handler: Arc<dyn KernelCommandHandler>,
    ) {
        self.core.register_command_handler(command_type, handler);
    }

    pub fn update_info<R>(&self, f: impl FnOnce(&mut KernelInfo) -> R) -> R {
        self.core.update_info(f)
    }
}

impl Kernel for SimpleKernel {
    fn core(&self) -> &KernelCore {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use nbk_protocol::{CommandFailed, EventType, KernelCommand};

    fn record(kernel: &dyn Kernel) -> (Arc<Mutex<Vec<KernelEventEnvelope>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let subscription = kernel.subscribe_to_kernel_events(Arc::new(move |event| {
            lock(&log).push(event.clone());
        }));
        (seen, subscription)
    }

    fn types(events: &Mutex<Vec<KernelEventEnvelope>>) -> Vec<String> {
        lock(events)
            .iter()
            .map(|event| event.event_type().to_string())
            .collect()
    }

    #[tokio::test]
    async fn first_registration_announces_kernel_info() {
        let kernel = SimpleKernel::new("js");
        let (seen, _subscription) = record(kernel.as_ref());
        let handler = handler_fn(|_| async { Ok(()) });
        kernel.register_command_handler(CommandType::SUBMIT_CODE, handler.clone());
        kernel.register_command_handler(CommandType::SUBMIT_CODE, handler);

        assert_eq!(types(&seen), vec![EventType::KERNEL_INFO_PRODUCED]);
        assert!(kernel.supports_command(&CommandType::from(CommandType::SUBMIT_CODE)));
        assert!(
            kernel
                .kernel_info()
                .supports(&CommandType::from(CommandType::REQUEST_KERNEL_INFO))
        );
    }

    #[tokio::test]
    async fn send_publishes_handler_events_then_success() {
        let kernel = SimpleKernel::new("js");
        kernel.register_command_handler(
            CommandType::SUBMIT_CODE,
            handler_fn(|invocation: KernelInvocation| async move {
                invocation.publish(EventType::CODE_SUBMISSION_RECEIVED, serde_json::json!({}));
                Ok(())
            }),
        );
        let (seen, _subscription) = record(kernel.as_ref());

        let command = KernelCommandEnvelope::new(CommandType::SUBMIT_CODE, KernelCommand::new());
        kernel.send(command.clone()).await.unwrap();

        assert_eq!(
            types(&seen),
            vec![EventType::CODE_SUBMISSION_RECEIVED, EventType::COMMAND_SUCCEEDED]
        );
        assert_eq!(
            command.routing_slip().to_vec(),
            vec!["kernel://local/js?tag=arrived", "kernel://local/js"]
        );
        for event in lock(&seen).iter() {
            assert!(event.routing_slip().contains("kernel://local/js", false));
        }
    }

    #[tokio::test]
    async fn already_arrived_command_still_runs() {
        let kernel = SimpleKernel::new("js");
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        kernel.register_command_handler(
            CommandType::SUBMIT_CODE,
            handler_fn(move |_| {
                let flag = flag.clone();
                async move {
                    *lock(&flag) = true;
                    Ok(())
                }
            }),
        );
        let (seen, _subscription) = record(kernel.as_ref());

        let command = KernelCommandEnvelope::new(CommandType::SUBMIT_CODE, KernelCommand::new());
        command
            .routing_slip()
            .stamp_as_arrived("kernel://local/js")
            .unwrap();
        kernel.send(command.clone()).await.unwrap();

        assert!(*lock(&ran));
        assert_eq!(types(&seen), vec![EventType::COMMAND_SUCCEEDED]);
        assert_eq!(
            command.routing_slip().to_vec(),
            vec!["kernel://local/js?tag=arrived", "kernel://local/js"]
        );
    }

    #[tokio::test]
    async fn handler_errors_become_command_failed() {
        let kernel = SimpleKernel::new("js");
        kernel.register_command_handler(
            CommandType::SUBMIT_CODE,
            handler_fn(|_| async { Err(anyhow::anyhow!("syntax error")) }),
        );
        let (seen, _subscription) = record(kernel.as_ref());

        let command = KernelCommandEnvelope::new(CommandType::SUBMIT_CODE, KernelCommand::new());
        kernel.send(command).await.unwrap();

        let events = lock(&seen);
        assert_eq!(events.len(), 1);
        let failed = events[0].payload::<CommandFailed>().unwrap();
        assert_eq!(failed.message, "syntax error");
    }

    #[tokio::test]
    async fn handle_command_rejects_unknown_command_types() {
        let kernel = SimpleKernel::new("js");
        let command = KernelCommandEnvelope::new(CommandType::SUBMIT_CODE, KernelCommand::new());
        let context = KernelInvocationContext::get_or_create_ambient(&command).unwrap();
        let err = kernel.handle_command(&command, &context).await.unwrap_err();
        assert_eq!(err.to_string(), "No handler found for command type SubmitCode");
        assert!(context.is_complete());
    }

    #[tokio::test]
    async fn language_service_requests_without_handler_succeed() {
        let kernel = SimpleKernel::new("js");
        let (seen, _subscription) = record(kernel.as_ref());
        let command =
            KernelCommandEnvelope::new(CommandType::REQUEST_HOVER_TEXT, KernelCommand::new());
        kernel.send(command).await.unwrap();
        assert_eq!(types(&seen), vec![EventType::COMMAND_SUCCEEDED]);
    }

    #[tokio::test]
    async fn nested_send_joins_the_running_invocation() {
        let kernel = SimpleKernel::new("js");
        let inner = Arc::downgrade(&kernel);
        kernel.register_command_handler(
            CommandType::SUBMIT_CODE,
            handler_fn(move |_| {
                let inner = inner.clone();
                async move {
                    let kernel = inner.upgrade().ok_or_else(|| anyhow::anyhow!("gone"))?;
                    let nested = KernelCommandEnvelope::new(
                        CommandType::REQUEST_KERNEL_INFO,
                        KernelCommand::new(),
                    );
                    kernel.send(nested).await?;
                    Ok(())
                }
            }),
        );
        let (seen, _subscription) = record(kernel.as_ref());

        let command = KernelCommandEnvelope::new(CommandType::SUBMIT_CODE, KernelCommand::new());
        kernel.send(command.clone()).await.unwrap();

        assert_eq!(
            types(&seen),
            vec![EventType::KERNEL_INFO_PRODUCED, EventType::COMMAND_SUCCEEDED]
        );
        let info_command = lock(&seen)[0].command().unwrap();
        assert!(info_command.is_self_or_descendant_of(&command).unwrap());
        assert!(!KernelCommandEnvelope::are_commands_the_same(&info_command, &command));
    }
}

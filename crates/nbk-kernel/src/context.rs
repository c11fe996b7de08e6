//! Per-root-command invocation state.
//!
//! A context is created for the first command sent from outside any invocation and
//! is then made ambient for the task executing it. Commands sent while it is ambient
//! join it as descendants instead of opening a new invocation.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nbk_protocol::{
    CommandFailed, CommandSucceeded, KernelCommandEnvelope, KernelEventEnvelope,
};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::lock;
use crate::subject::{Subject, Subscription};

tokio::task_local! {
    static AMBIENT: Arc<KernelInvocationContext>;
}

pub struct KernelInvocationContext {
    command: KernelCommandEnvelope,
    child_commands: Mutex<Vec<KernelCommandEnvelope>>,
    events: Subject<KernelEventEnvelope>,
    handling_kernel: Mutex<Option<Arc<dyn Kernel>>>,
    complete: AtomicBool,
    completion: watch::Sender<bool>,
}

impl KernelInvocationContext {
    fn new(command: KernelCommandEnvelope) -> Self {
        let (completion, _) = watch::channel(false);
        Self {
            command,
            child_commands: Mutex::new(Vec::new()),
            events: Subject::new(),
            handling_kernel: Mutex::new(None),
            complete: AtomicBool::new(false),
            completion,
        }
    }

    /// The ambient context of the current task, if any.
    pub fn current() -> Option<Arc<Self>> {
        AMBIENT.try_with(|context| context.clone()).ok()
    }

    /// Runs `future` with `context` as the ambient context.
    pub async fn scope<F: Future>(context: Arc<Self>, future: F) -> F::Output {
        AMBIENT.scope(context, future).await
    }

    /// Joins the ambient context when it is still running, otherwise opens a new
    /// invocation rooted at `command`.
    ///
    /// Joining parents `command` under the root (when it has no parent yet) and tracks
    /// it as a descendant.
    pub fn get_or_create_ambient(command: &KernelCommandEnvelope) -> Result<Arc<Self>, KernelError> {
        if let Some(context) = Self::current().filter(|context| !context.is_complete()) {
            if !context.is_root(command) && !context.is_parent_of_command(command) {
                if command.parent().is_none() {
                    command.set_parent(&context.command)?;
                }
                lock(&context.child_commands).push(command.clone());
            }
            return Ok(context);
        }
        command.get_or_create_token();
        debug!(command_type = %command.command_type(), "opening invocation context");
        Ok(Arc::new(Self::new(command.clone())))
    }

    /// The root command of this invocation.
    pub fn command(&self) -> &KernelCommandEnvelope {
        &self.command
    }

    pub fn is_root(&self, command: &KernelCommandEnvelope) -> bool {
        KernelCommandEnvelope::are_commands_the_same(&self.command, command)
    }

    pub fn is_parent_of_command(&self, command: &KernelCommandEnvelope) -> bool {
        lock(&self.child_commands)
            .iter()
            .any(|child| KernelCommandEnvelope::are_commands_the_same(child, command))
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    pub fn handling_kernel(&self) -> Option<Arc<dyn Kernel>> {
        lock(&self.handling_kernel).clone()
    }

    /// Replaces the handling kernel and returns the previous one so callers can restore it.
    pub fn set_handling_kernel(&self, kernel: Option<Arc<dyn Kernel>>) -> Option<Arc<dyn Kernel>> {
        std::mem::replace(&mut *lock(&self.handling_kernel), kernel)
    }

    /// Completes the invocation when `command` is the root; otherwise stops tracking the
    /// descendant. Ignored once the invocation is complete.
    pub fn complete(&self, command: &KernelCommandEnvelope) {
        if self.is_complete() {
            return;
        }
        if self.is_root(command) {
            if self.complete.swap(true, Ordering::SeqCst) {
                return;
            }
            let succeeded =
                KernelEventEnvelope::from_payload(&CommandSucceeded {}, Some(self.command.clone()));
            self.internal_publish(succeeded);
            self.completion.send_replace(true);
        } else {
            lock(&self.child_commands)
                .retain(|child| !KernelCommandEnvelope::are_commands_the_same(child, command));
        }
    }

    /// Fails the whole invocation with `message` (default "Command Failed").
    /// Ignored once the invocation is complete.
    pub fn fail(&self, message: Option<String>) {
        if self.complete.swap(true, Ordering::SeqCst) {
            return;
        }
        let failed = message.map(CommandFailed::new).unwrap_or_default();
        debug!(command_type = %self.command.command_type(), message = %failed.message, "command failed");
        let event = KernelEventEnvelope::from_payload(&failed, Some(self.command.clone()));
        self.internal_publish(event);
        self.completion.send_replace(true);
    }

    /// Publishes `event` to this invocation's subscribers. No-op once complete.
    pub fn publish(&self, event: KernelEventEnvelope) {
        if !self.is_complete() {
            self.internal_publish(event);
        }
    }

    fn internal_publish(&self, event: KernelEventEnvelope) {
        event.set_command_if_absent(&self.command);

        if let Some(kernel) = self.handling_kernel() {
            let uri = kernel.uri();
            let mut slip = event.routing_slip();
            if !slip.contains(&uri, false) {
                if let Err(err) = slip.stamp(&uri) {
                    warn!(%err, "failed to stamp event routing slip");
                }
            }
        }

        if self.is_visible(&event) {
            self.events.next(&event);
        }
    }

    /// Only events caused by this invocation's command tree are delivered.
    fn is_visible(&self, event: &KernelEventEnvelope) -> bool {
        let Some(command) = event.command() else {
            return true;
        };
        self.is_root(&command)
            || self.is_parent_of_command(&command)
            || command
                .is_self_or_descendant_of(&self.command)
                .unwrap_or(false)
            || command
                .has_same_root_command_as(&self.command)
                .unwrap_or(false)
    }

    pub fn kernel_events(&self) -> &Subject<KernelEventEnvelope> {
        &self.events
    }

    pub fn subscribe(
        &self,
        observer: impl Fn(&KernelEventEnvelope) + Send + Sync + 'static,
    ) -> Subscription {
        self.events.subscribe(observer)
    }

    /// Resolves once the invocation has completed or failed.
    pub async fn completed(&self) {
        let mut completion = self.completion.subscribe();
        let _ = completion.wait_for(|complete| *complete).await;
    }

    /// Forces completion of the root command if nothing else completed it.
    pub fn dispose(&self) {
        if !self.is_complete() {
            self.complete(&self.command);
        }
    }
}

impl std::fmt::Debug for KernelInvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelInvocationContext")
            .field("command", &self.command)
            .field("complete", &self.is_complete())
            .finish()
    }
}

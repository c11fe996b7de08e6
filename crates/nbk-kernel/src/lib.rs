//! Kernel dispatch core: invocation contexts, the single-flight scheduler, simple,
//! composite and proxy kernels, and the host that connects a kernel tree to a transport.

mod collection;
mod composite;
mod config;
mod connector;
mod context;
mod error;
mod handler;
mod host;
mod kernel;
mod proxy;
mod scheduler;
mod subject;
pub mod transport;

pub use collection::KernelCollection;
pub use composite::CompositeKernel;
pub use config::{DEFAULT_HOST_URI, HostConfig};
pub use connector::Connector;
pub use context::KernelInvocationContext;
pub use error::KernelError;
pub use handler::{KernelCommandHandler, KernelInvocation, handler_fn};
pub use host::KernelHost;
pub use kernel::{
    Kernel, KernelCore, KernelEventObserver, KernelExt, KernelTarget, SimpleKernel,
    execute_command, handle_with_registered_handler, send_command,
};
pub use proxy::ProxyKernel;
pub use scheduler::KernelScheduler;
pub use subject::{Subject, Subscription};
pub use transport::TransportError;

pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

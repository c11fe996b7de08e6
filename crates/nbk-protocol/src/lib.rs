//! Envelope, routing-slip and kernel-info types shared by kernels, hosts and transports.

mod command;
mod envelope;
mod error;
mod event;
mod kernel_info;
pub mod model;
pub mod routing_slip;
pub mod uri;

pub use command::{CommandType, KernelCommand};
pub use envelope::{KernelCommandEnvelope, KernelEnvelope, KernelEventEnvelope};
pub use error::ProtocolError;
pub use event::{
    CommandFailed, CommandSucceeded, EventType, KernelEventPayload, KernelInfoProduced,
    KernelReady,
};
pub use kernel_info::{KernelCommandInfo, KernelInfo};
pub use model::{KernelCommandEnvelopeModel, KernelEnvelopeModel, KernelEventEnvelopeModel};
pub use routing_slip::{CommandRoutingSlip, EventRoutingSlip};
pub use uri::{create_kernel_uri, create_kernel_uri_with_query, extract_host_and_normalize};

pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

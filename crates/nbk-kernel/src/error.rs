use nbk_protocol::{CommandType, ProtocolError};
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// A command handler failed; displayed as the handler's own message.
    #[error("{0}")]
    Handler(#[from] anyhow::Error),
    #[error("No handler found for command type {0}")]
    NoHandler(CommandType),
    #[error("Kernel not found: {0}")]
    KernelNotFound(String),
    #[error("kernel with name {0} already exists")]
    DuplicateKernelName(String),
    #[error("kernel with alias {0} already exists")]
    DuplicateAlias(String),
    #[error("Cannot find connector to reach {0}")]
    NoConnector(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation dropped before completion")]
    OperationDropped,
    #[error("operation executor panicked")]
    ExecutorPanicked,
}

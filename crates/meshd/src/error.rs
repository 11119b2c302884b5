//! Errors returned by the local mesh API

use crate::local::ClientId;
use mesh_core::{ChannelNumber, Port};
use thiserror::Error;

/// Result type alias using MeshError
pub type Result<T> = std::result::Result<T, MeshError>;

/// Local API misuse
///
/// Problems caused by remote peers never surface here; they are logged,
/// counted in [`crate::stats::MeshStats`] and dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MeshError {
    #[error("Unknown client: {0}")]
    UnknownClient(ClientId),
    #[error("Unknown channel: {0}")]
    UnknownChannel(ChannelNumber),
    #[error("Port already open: {0}")]
    PortInUse(Port),
    #[error("Port not open by this client: {0}")]
    PortNotOpen(Port),
    #[error("Client not allowed to send on channel {0}")]
    NotAllowed(ChannelNumber),
    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

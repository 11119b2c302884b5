//! meshd - multi-hop mesh transport daemon
//!
//! This daemon provides:
//! - Hop-by-hop connections along explicit paths, with flow control
//! - Encrypted tunnels to remote peers over redundant connections
//! - Reliable or unreliable, ordered or unordered channels between local clients
//! - Loopback channels between clients of the same peer

pub mod channel;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod flow;
pub mod local;
pub mod mesh;
pub mod path;
pub mod peer;
pub mod reliability;
pub mod server;
pub mod stats;
pub mod timers;
pub mod tunnel;

#[cfg(test)]
mod sim;

pub use channel::ChannelState;
pub use config::{Config, MeshConfig};
pub use error::MeshError;
pub use local::{ClientEvent, ClientId, LocalClient};
pub use mesh::Mesh;
pub use server::Server;
pub use tunnel::TunnelState;

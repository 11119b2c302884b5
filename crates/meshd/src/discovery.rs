//! Path discovery collaborator
//!
//! The engine asks for paths to a peer and stops asking once a tunnel has
//! enough connections. Answers come back through
//! [`Mesh::handle_path_found`](crate::mesh::Mesh::handle_path_found).

use mesh_core::PeerId;
use tokio::sync::mpsc;
use tracing::debug;

/// Asynchronous path lookup
pub trait PathDiscovery: Send {
    /// Begin looking for paths to `peer`
    fn start_search(&mut self, peer: PeerId);

    /// Stop looking for paths to `peer`
    fn stop_search(&mut self, peer: PeerId);
}

/// Search request as seen by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryRequest {
    Start(PeerId),
    Stop(PeerId),
}

/// Hands search requests to the driver loop
pub struct ChannelDiscovery {
    tx: mpsc::UnboundedSender<DiscoveryRequest>,
}

impl ChannelDiscovery {
    pub fn new(tx: mpsc::UnboundedSender<DiscoveryRequest>) -> Self {
        Self { tx }
    }
}

impl PathDiscovery for ChannelDiscovery {
    fn start_search(&mut self, peer: PeerId) {
        if self.tx.send(DiscoveryRequest::Start(peer)).is_err() {
            debug!("Discovery loop gone, search for {} not started", peer);
        }
    }

    fn stop_search(&mut self, peer: PeerId) {
        if self.tx.send(DiscoveryRequest::Stop(peer)).is_err() {
            debug!("Discovery loop gone, search for {} not stopped", peer);
        }
    }
}

//! Neighbor identity and address book entries

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

pub use mesh_core::PeerId;

/// Information about a directly reachable peer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer identifier
    pub id: PeerId,
    /// Network addresses
    pub addrs: Vec<SocketAddr>,
    /// Last seen timestamp (unix millis)
    pub last_seen: u64,
}

impl PeerInfo {
    /// Create new peer info
    pub fn new(public_key: [u8; 32], addrs: Vec<SocketAddr>) -> Self {
        Self {
            id: PeerId::from_public_key(&public_key),
            addrs,
            last_seen: 0,
        }
    }

    /// Remember another address for this peer
    pub fn add_addr(&mut self, addr: SocketAddr) {
        if !self.addrs.contains(&addr) {
            self.addrs.push(addr);
        }
    }

    /// Update last seen time
    pub fn touch(&mut self) {
        use std::time::{SystemTime, UNIX_EPOCH};
        self.last_seen = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_addr_deduplicates() {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let mut info = PeerInfo::new([1; 32], vec![addr]);
        info.add_addr(addr);
        info.add_addr("127.0.0.1:4001".parse().unwrap());
        assert_eq!(info.addrs.len(), 2);
    }

    #[test]
    fn test_touch_sets_last_seen() {
        let mut info = PeerInfo::new([1; 32], vec![]);
        info.touch();
        assert!(info.last_seen > 0);
    }
}

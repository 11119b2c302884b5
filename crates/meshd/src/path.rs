//! Paths: ordered peer lists from the local peer to a destination

use mesh_core::crypto::path_digest;
use mesh_core::{encoding, Bytes32, PeerId};
use std::sync::Arc;

/// Cost of one hop when ranking paths
pub const PATH_COST_UNIT: u32 = 100;

/// Immutable hop list, shared between peer records and connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    peers: Vec<PeerId>,
    digest: Bytes32,
}

impl Path {
    /// Build a path, rejecting loops and paths shorter than two peers
    pub fn new(peers: Vec<PeerId>) -> mesh_core::Result<Arc<Self>> {
        encoding::validate_path(&peers)?;
        let digest = path_digest(&peers);
        Ok(Arc::new(Self { peers, digest }))
    }

    /// Normalize a discovery result for `me` reaching `destination`.
    ///
    /// A path that already passes through `me` loses everything before it;
    /// a path that does not is assumed to start at a neighbor of `me`.
    pub fn from_discovery(
        me: PeerId,
        destination: PeerId,
        mut peers: Vec<PeerId>,
    ) -> Option<Arc<Self>> {
        match peers.iter().position(|p| *p == me) {
            Some(pos) => {
                peers.drain(..pos);
            }
            None => peers.insert(0, me),
        }
        if peers.last() != Some(&destination) {
            return None;
        }
        Self::new(peers).ok()
    }

    pub fn peers(&self) -> &[PeerId] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn digest(&self) -> &Bytes32 {
        &self.digest
    }

    /// First peer (the origin)
    pub fn origin(&self) -> PeerId {
        self.peers[0]
    }

    /// Last peer (the destination)
    pub fn destination(&self) -> PeerId {
        self.peers[self.peers.len() - 1]
    }

    /// Position of `peer` in the path
    pub fn position(&self, peer: &PeerId) -> Option<usize> {
        self.peers.iter().position(|p| p == peer)
    }

    /// Does the path contain the adjacency `a`-`b`, in either order?
    pub fn uses_link(&self, a: &PeerId, b: &PeerId) -> bool {
        self.peers
            .windows(2)
            .any(|w| (w[0] == *a && w[1] == *b) || (w[0] == *b && w[1] == *a))
    }

    /// Sub-path from `pos` to the end
    pub fn suffix(&self, pos: usize) -> Option<Arc<Self>> {
        Self::new(self.peers[pos..].to_vec()).ok()
    }

    /// Sub-path from `pos` back to the origin
    pub fn reversed_prefix(&self, pos: usize) -> Option<Arc<Self>> {
        let mut peers = self.peers[..=pos].to_vec();
        peers.reverse();
        Self::new(peers).ok()
    }

    /// Ranking cost: length plus intermediate hops already used by `used`, times the unit
    pub fn cost<'a>(&self, used: impl IntoIterator<Item = &'a Path>) -> u32 {
        let used: Vec<&Path> = used.into_iter().collect();
        let inner = if self.peers.len() > 2 {
            &self.peers[1..self.peers.len() - 1]
        } else {
            &[][..]
        };
        let overlap = inner
            .iter()
            .filter(|hop| used.iter().any(|p| p.peers.contains(*hop)))
            .count();
        (self.peers.len() + overlap) as u32 * PATH_COST_UNIT
    }
}

//! Hash derivations for the mesh transport
//!
//! All derivations use BLAKE3 with domain separation prefixes.

use crate::types::*;
use blake3::Hasher;

// =============================================================================
// DOMAIN SEPARATION PREFIXES
// =============================================================================

/// Domain prefix for the tunnel key-exchange context
pub const DOMAIN_TUNNEL: &[u8] = b"mesh-tunnel";
/// Domain prefix for path digests
pub const DOMAIN_PATH: &[u8] = b"mesh-path";

// =============================================================================
// TUNNEL CONTEXT
// =============================================================================

/// Derive the context string binding a tunnel's session keys to both endpoints.
///
/// `ctx = BLAKE3("mesh-tunnel" || min(a, b) || max(a, b))`
///
/// Both ends compute the same value regardless of which one initiated.
pub fn derive_tunnel_context(a: &PeerId, b: &PeerId) -> Bytes32 {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };

    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_TUNNEL);
    hasher.update(low.as_bytes());
    hasher.update(high.as_bytes());

    *hasher.finalize().as_bytes()
}

// =============================================================================
// PATHS
// =============================================================================

/// Digest of an ordered peer list, used to detect duplicate paths.
///
/// `digest = BLAKE3("mesh-path" || len_le32 || peer_0 || ... || peer_n)`
pub fn path_digest(path: &[PeerId]) -> Bytes32 {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_PATH);
    hasher.update(&(path.len() as u32).to_le_bytes());
    for peer in path {
        hasher.update(peer.as_bytes());
    }
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_context_order_independent() {
        let a = PeerId([1u8; 32]);
        let b = PeerId([2u8; 32]);
        assert_eq!(derive_tunnel_context(&a, &b), derive_tunnel_context(&b, &a));
    }

    #[test]
    fn test_tunnel_context_differs_per_pair() {
        let a = PeerId([1u8; 32]);
        let b = PeerId([2u8; 32]);
        let c = PeerId([3u8; 32]);
        assert_ne!(derive_tunnel_context(&a, &b), derive_tunnel_context(&a, &c));
    }

    #[test]
    fn test_path_digest_is_order_sensitive() {
        let a = PeerId([1u8; 32]);
        let b = PeerId([2u8; 32]);
        assert_eq!(path_digest(&[a, b]), path_digest(&[a, b]));
        assert_ne!(path_digest(&[a, b]), path_digest(&[b, a]));
    }
}

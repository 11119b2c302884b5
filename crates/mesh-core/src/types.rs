//! Identifier types for the mesh transport
//!
//! All types here are plain values with postcard-friendly serde derives.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte fixed-size array used for keys and identifiers.
pub type Bytes32 = [u8; 32];

/// Destination port a local client listens on.
pub type Port = u32;

// =============================================================================
// PEERS AND CONNECTIONS
// =============================================================================

/// Unique peer identifier (the peer's Ed25519 public key)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub Bytes32);

impl PeerId {
    /// Create from transport public key
    pub fn from_public_key(public_key: &Bytes32) -> Self {
        Self(*public_key)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &Bytes32 {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Connection identifier: random token chosen by the connection origin
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Bytes32);

impl ConnectionId {
    /// Draw a fresh random connection id
    pub fn random() -> Self {
        let mut id = [0u8; 32];
        rand::thread_rng().fill(&mut id);
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

// =============================================================================
// CHANNELS
// =============================================================================

/// Channel number, either global (inside a tunnel) or local (inside a client)
///
/// Numeric ranges:
/// - `[0, 0x8000_0000)`: global ids, unique within a tunnel
/// - `[0x8000_0000, 0xB000_0000)`: local ids of channels a client created
/// - `[0xB000_0000, u32::MAX]`: local ids of channels the service handed to a client
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelNumber(pub u32);

impl ChannelNumber {
    /// First local id for client-originated channels
    pub const LOCAL_CLIENT_BASE: u32 = 0x8000_0000;
    /// First local id for service-originated (incoming) channels
    pub const LOCAL_SERVICE_BASE: u32 = 0xB000_0000;

    /// Is this a tunnel-global channel number?
    pub fn is_global(self) -> bool {
        self.0 < Self::LOCAL_CLIENT_BASE
    }

    /// Is this a local id of a channel the client created?
    pub fn is_client_local(self) -> bool {
        (Self::LOCAL_CLIENT_BASE..Self::LOCAL_SERVICE_BASE).contains(&self.0)
    }

    /// Is this a local id of an incoming channel?
    pub fn is_service_local(self) -> bool {
        self.0 >= Self::LOCAL_SERVICE_BASE
    }

    /// Next global id, wrapping inside the global range
    pub fn next_global(self) -> Self {
        Self(self.0.wrapping_add(1) & !Self::LOCAL_CLIENT_BASE)
    }
}

impl fmt::Display for ChannelNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}

/// Channel option bit field
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelOptions(pub u32);

impl ChannelOptions {
    /// Minimum latency: no buffering towards the client
    pub const NOBUFFER: u32 = 0x1;
    /// Retransmit until acknowledged, deliver in order
    pub const RELIABLE: u32 = 0x2;
    /// Deliver reliable traffic as soon as it arrives
    pub const OUT_OF_ORDER: u32 = 0x4;

    /// Reliable, buffered, in-order channel
    pub fn reliable() -> Self {
        Self(Self::RELIABLE)
    }

    /// Unreliable, buffered channel
    pub fn unreliable() -> Self {
        Self(0)
    }

    /// Add an option bit
    pub fn with(self, bit: u32) -> Self {
        Self(self.0 | bit)
    }

    pub fn is_reliable(&self) -> bool {
        self.0 & Self::RELIABLE != 0
    }

    pub fn is_nobuffer(&self) -> bool {
        self.0 & Self::NOBUFFER != 0
    }

    pub fn is_out_of_order(&self) -> bool {
        self.0 & Self::OUT_OF_ORDER != 0
    }
}

// =============================================================================
// DIRECTION
// =============================================================================

/// Traffic direction along a connection or channel
///
/// `Fwd` runs from the origin (root) towards the destination, `Bck` the other way.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Fwd,
    Bck,
}

impl Direction {
    /// The opposite direction
    pub fn reverse(self) -> Self {
        match self {
            Direction::Fwd => Direction::Bck,
            Direction::Bck => Direction::Fwd,
        }
    }

    pub fn is_fwd(self) -> bool {
        self == Direction::Fwd
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Fwd => write!(f, "FWD"),
            Direction::Bck => write!(f, "BCK"),
        }
    }
}

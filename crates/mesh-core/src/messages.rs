//! Wire messages of the mesh transport
//!
//! Two sum types, decoded once at the boundary:
//! - [`ConnectionMessage`]: hop-by-hop traffic between neighbors
//! - [`ChannelMessage`]: end-to-end traffic carried inside encrypted frames

use crate::types::*;
use serde::{Deserialize, Serialize};

/// Initial hop limit of encrypted frames
pub const DEFAULT_TTL: u32 = 64;

/// Longest path a CONNECTION_CREATE may announce
pub const MAX_PATH_LENGTH: usize = 64;

/// Largest application payload carried by a single DATA message
pub const MAX_PAYLOAD_SIZE: usize = 63 * 1024;

/// Encrypted channel traffic as seen by relays
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedFrame {
    /// Connection this frame travels on
    pub cid: ConnectionId,
    /// Per-connection, per-direction packet id
    pub pid: u32,
    /// Remaining hops
    pub ttl: u32,
    /// Nonce counter of the tunnel cipher
    pub iv: u64,
    /// Sealed [`ChannelMessage`]
    pub ciphertext: Vec<u8>,
}

/// Hop-by-hop messages exchanged between neighbors
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionMessage {
    /// Path announcement, origin first
    Create {
        cid: ConnectionId,
        path: Vec<PeerId>,
    },
    /// Create confirmation (SYN-ACK going back, final ACK going forward)
    Ack { cid: ConnectionId },
    /// `peer1` lost adjacency to `peer2`
    Broken {
        cid: ConnectionId,
        peer1: PeerId,
        peer2: PeerId,
    },
    /// Teardown notice
    Destroy { cid: ConnectionId },
    /// Encrypted traffic travelling origin -> destination
    Fwd(EncryptedFrame),
    /// Encrypted traffic travelling destination -> origin
    Bck(EncryptedFrame),
    /// Credit advertisement: highest pid the neighbor may use next
    FlowAck { cid: ConnectionId, ack: u32 },
    /// Probe for a lost credit advertisement
    Poll { cid: ConnectionId, pid: u32 },
    /// Liveness refresh
    Keepalive {
        cid: ConnectionId,
        direction: Direction,
    },
    /// Tunnel key exchange: sender's ephemeral X25519 public key
    Kx {
        cid: ConnectionId,
        direction: Direction,
        ephemeral: Bytes32,
        /// The receiver must answer with its own KX
        force_reply: bool,
    },
}

impl ConnectionMessage {
    /// Connection this message belongs to
    pub fn cid(&self) -> ConnectionId {
        match self {
            ConnectionMessage::Create { cid, .. }
            | ConnectionMessage::Ack { cid }
            | ConnectionMessage::Broken { cid, .. }
            | ConnectionMessage::Destroy { cid }
            | ConnectionMessage::FlowAck { cid, .. }
            | ConnectionMessage::Poll { cid, .. }
            | ConnectionMessage::Keepalive { cid, .. }
            | ConnectionMessage::Kx { cid, .. } => *cid,
            ConnectionMessage::Fwd(frame) | ConnectionMessage::Bck(frame) => frame.cid,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionMessage::Create { .. } => "CONNECTION_CREATE",
            ConnectionMessage::Ack { .. } => "CONNECTION_ACK",
            ConnectionMessage::Broken { .. } => "CONNECTION_BROKEN",
            ConnectionMessage::Destroy { .. } => "CONNECTION_DESTROY",
            ConnectionMessage::Fwd(_) => "FWD",
            ConnectionMessage::Bck(_) => "BCK",
            ConnectionMessage::FlowAck { .. } => "ACK",
            ConnectionMessage::Poll { .. } => "POLL",
            ConnectionMessage::Keepalive { .. } => "KEEPALIVE",
            ConnectionMessage::Kx { .. } => "KX",
        }
    }

    /// Encrypted payload frame (subject to the credit window)
    pub fn is_payload(&self) -> bool {
        matches!(self, ConnectionMessage::Fwd(_) | ConnectionMessage::Bck(_))
    }

    /// Flow-control message (bypasses the credit window)
    pub fn is_flow_control(&self) -> bool {
        matches!(
            self,
            ConnectionMessage::FlowAck { .. } | ConnectionMessage::Poll { .. }
        )
    }

    /// Wrap an encrypted frame for the given direction
    pub fn encrypted(direction: Direction, frame: EncryptedFrame) -> Self {
        match direction {
            Direction::Fwd => ConnectionMessage::Fwd(frame),
            Direction::Bck => ConnectionMessage::Bck(frame),
        }
    }
}

/// End-to-end messages carried inside encrypted frames
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelMessage {
    /// Open a channel to `port` at the destination
    Create {
        chid: ChannelNumber,
        port: Port,
        options: ChannelOptions,
    },
    /// Channel confirmed
    Ack { chid: ChannelNumber },
    /// Nobody listens on the requested port
    Nack { chid: ChannelNumber },
    /// Channel closed by the remote end
    Destroy { chid: ChannelNumber },
    /// Application payload
    Data {
        chid: ChannelNumber,
        mid: u32,
        payload: Vec<u8>,
    },
    /// Cumulative ack `mid` plus bitmap of further held ids (bit k = `mid + 1 + k`)
    DataAck {
        chid: ChannelNumber,
        mid: u32,
        futures: u64,
    },
}

impl ChannelMessage {
    /// Global channel number this message is about
    pub fn chid(&self) -> ChannelNumber {
        match self {
            ChannelMessage::Create { chid, .. }
            | ChannelMessage::Ack { chid }
            | ChannelMessage::Nack { chid }
            | ChannelMessage::Destroy { chid }
            | ChannelMessage::Data { chid, .. }
            | ChannelMessage::DataAck { chid, .. } => *chid,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelMessage::Create { .. } => "CHANNEL_CREATE",
            ChannelMessage::Ack { .. } => "CHANNEL_ACK",
            ChannelMessage::Nack { .. } => "CHANNEL_NACK",
            ChannelMessage::Destroy { .. } => "CHANNEL_DESTROY",
            ChannelMessage::Data { .. } => "DATA",
            ChannelMessage::DataAck { .. } => "DATA_ACK",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_message_cid() {
        let cid = ConnectionId([7u8; 32]);
        let frame = EncryptedFrame {
            cid,
            pid: 0,
            ttl: DEFAULT_TTL,
            iv: 0,
            ciphertext: vec![],
        };
        assert_eq!(ConnectionMessage::Fwd(frame).cid(), cid);
        assert_eq!(ConnectionMessage::Poll { cid, pid: 3 }.cid(), cid);
    }

    #[test]
    fn test_message_classes() {
        let cid = ConnectionId([1u8; 32]);
        assert!(ConnectionMessage::FlowAck { cid, ack: 0 }.is_flow_control());
        assert!(!ConnectionMessage::Destroy { cid }.is_flow_control());
        let frame = EncryptedFrame {
            cid,
            pid: 0,
            ttl: 1,
            iv: 0,
            ciphertext: vec![],
        };
        let msg = ConnectionMessage::encrypted(Direction::Bck, frame);
        assert!(msg.is_payload());
        assert_eq!(msg.kind(), "BCK");
    }

    #[test]
    fn test_channel_message_chid() {
        let msg = ChannelMessage::DataAck {
            chid: ChannelNumber(9),
            mid: 1,
            futures: 0b10,
        };
        assert_eq!(msg.chid(), ChannelNumber(9));
        assert_eq!(msg.kind(), "DATA_ACK");
    }
}

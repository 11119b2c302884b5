//! Networking primitives for the mesh transport
//!
//! This crate provides:
//! - Length-prefixed framing of connection messages
//! - Identity keys, tunnel key exchange and frame encryption
//! - A neighbor address book
//! - A TCP transport linking directly connected peers

pub mod crypto;
pub mod framing;
pub mod peer;
pub mod transport;

pub use crypto::{CryptoError, EphemeralKeyExchange, FrameCipher, KeyPair, SessionKeys};
pub use framing::{Frame, FrameCodec, FrameError, FrameType};
pub use peer::{PeerId, PeerInfo};
pub use transport::{Transport, TransportError, TransportEvent};

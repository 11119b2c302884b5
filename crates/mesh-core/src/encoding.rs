//! Binary encoding for mesh messages
//!
//! All messages use postcard serialization. Decoding is followed by a
//! structural check so malformed input is rejected at the boundary:
//! - Paths must hold at least two peers and no repeated peer
//! - Payloads must fit the maximum message size
//! - Channel messages must name a global channel number

use crate::error::{Error, Result};
use crate::messages::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;

/// Serialize a value to bytes using postcard.
pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Deserialize a value from postcard bytes.
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    postcard::from_bytes(bytes).map_err(Error::from)
}

/// Check a path announcement for length and loops.
pub fn validate_path(path: &[crate::types::PeerId]) -> Result<()> {
    if path.len() < 2 {
        return Err(Error::PathTooShort(path.len()));
    }
    if path.len() > MAX_PATH_LENGTH {
        return Err(Error::PathTooLong(path.len()));
    }
    let mut seen = HashSet::with_capacity(path.len());
    for peer in path {
        if !seen.insert(peer) {
            return Err(Error::PathLoop(peer.to_string()));
        }
    }
    Ok(())
}

impl ConnectionMessage {
    /// Encode for the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        to_bytes(self)
    }

    /// Decode and validate
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let msg: Self = from_bytes(bytes)?;
        msg.validate()?;
        Ok(msg)
    }

    /// Structural validation of a decoded message
    pub fn validate(&self) -> Result<()> {
        match self {
            ConnectionMessage::Create { path, .. } => validate_path(path),
            ConnectionMessage::Fwd(frame) | ConnectionMessage::Bck(frame) => {
                // AEAD tag plus framing overhead on top of the payload
                let max = MAX_PAYLOAD_SIZE + 1024;
                if frame.ciphertext.len() > max {
                    return Err(Error::PayloadTooLarge {
                        size: frame.ciphertext.len(),
                        max,
                    });
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl ChannelMessage {
    /// Encode as tunnel plaintext
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        to_bytes(self)
    }

    /// Decode and validate tunnel plaintext
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let msg: Self = from_bytes(bytes)?;
        msg.validate()?;
        Ok(msg)
    }

    /// Structural validation of a decoded message
    pub fn validate(&self) -> Result<()> {
        let chid = self.chid();
        if !chid.is_global() {
            return Err(Error::NotGlobalChannel(chid.0));
        }
        if let ChannelMessage::Data { payload, .. } = self {
            if payload.len() > MAX_PAYLOAD_SIZE {
                return Err(Error::PayloadTooLarge {
                    size: payload.len(),
                    max: MAX_PAYLOAD_SIZE,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;

    fn peer(b: u8) -> PeerId {
        PeerId([b; 32])
    }

    #[test]
    fn test_encoding_deterministic() {
        let msg = ChannelMessage::Data {
            chid: ChannelNumber(1),
            mid: 42,
            payload: b"x".to_vec(),
        };
        assert_eq!(msg.to_bytes().unwrap(), msg.to_bytes().unwrap());
    }

    #[test]
    fn test_create_with_short_path_rejected() {
        let msg = ConnectionMessage::Create {
            cid: ConnectionId([0; 32]),
            path: vec![peer(1)],
        };
        let bytes = msg.to_bytes().unwrap();
        assert!(matches!(
            ConnectionMessage::from_bytes(&bytes),
            Err(Error::PathTooShort(1))
        ));
    }

    #[test]
    fn test_path_with_loop_rejected() {
        assert!(validate_path(&[peer(1), peer(2), peer(1)]).is_err());
        assert!(validate_path(&[peer(1), peer(2), peer(3)]).is_ok());
    }

    #[test]
    fn test_truncated_bytes_rejected() {
        let msg = ConnectionMessage::Create {
            cid: ConnectionId([3; 32]),
            path: vec![peer(1), peer(2), peer(3)],
        };
        let bytes = msg.to_bytes().unwrap();
        assert!(ConnectionMessage::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn test_local_channel_number_rejected_on_wire() {
        let msg = ChannelMessage::Ack {
            chid: ChannelNumber(ChannelNumber::LOCAL_CLIENT_BASE),
        };
        let bytes = msg.to_bytes().unwrap();
        assert!(matches!(
            ChannelMessage::from_bytes(&bytes),
            Err(Error::NotGlobalChannel(_))
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let msg = ChannelMessage::Data {
            chid: ChannelNumber(1),
            mid: 0,
            payload: vec![0u8; MAX_PAYLOAD_SIZE + 1],
        };
        assert!(msg.validate().is_err());
    }
}

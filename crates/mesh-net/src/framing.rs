//! Message framing for neighbor links
//!
//! Every connection message travels in a length-prefixed frame whose type
//! byte mirrors the message variant, so a reader can classify traffic
//! without decoding the payload.

use bytes::{Buf, BufMut, BytesMut};
use mesh_core::ConnectionMessage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (1 MB)
const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Frame type {frame_type:?} does not match message {kind}")]
    TypeMismatch {
        frame_type: FrameType,
        kind: &'static str,
    },
}

impl From<mesh_core::Error> for FrameError {
    fn from(e: mesh_core::Error) -> Self {
        FrameError::Serialization(e.to_string())
    }
}

/// A framed message
#[derive(Clone, Debug)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Payload bytes
    pub payload: Vec<u8>,
}

/// Frame types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Link handshake
    Hello = 0,
    /// Connection create
    ConnectionCreate = 10,
    /// Connection ack
    ConnectionAck = 11,
    /// Connection broken
    ConnectionBroken = 12,
    /// Connection destroy
    ConnectionDestroy = 13,
    /// Encrypted frame, origin to destination
    Fwd = 20,
    /// Encrypted frame, destination to origin
    Bck = 21,
    /// Flow-control credit
    Ack = 30,
    /// Flow-control poll
    Poll = 31,
    /// Connection keepalive
    Keepalive = 32,
    /// Tunnel key exchange
    Kx = 40,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Hello),
            10 => Ok(Self::ConnectionCreate),
            11 => Ok(Self::ConnectionAck),
            12 => Ok(Self::ConnectionBroken),
            13 => Ok(Self::ConnectionDestroy),
            20 => Ok(Self::Fwd),
            21 => Ok(Self::Bck),
            30 => Ok(Self::Ack),
            31 => Ok(Self::Poll),
            32 => Ok(Self::Keepalive),
            40 => Ok(Self::Kx),
            _ => Err(FrameError::Serialization(format!("Unknown frame type: {}", value))),
        }
    }
}

impl FrameType {
    /// Frame type carrying the given message
    pub fn of(message: &ConnectionMessage) -> Self {
        match message {
            ConnectionMessage::Create { .. } => Self::ConnectionCreate,
            ConnectionMessage::Ack { .. } => Self::ConnectionAck,
            ConnectionMessage::Broken { .. } => Self::ConnectionBroken,
            ConnectionMessage::Destroy { .. } => Self::ConnectionDestroy,
            ConnectionMessage::Fwd(_) => Self::Fwd,
            ConnectionMessage::Bck(_) => Self::Bck,
            ConnectionMessage::FlowAck { .. } => Self::Ack,
            ConnectionMessage::Poll { .. } => Self::Poll,
            ConnectionMessage::Keepalive { .. } => Self::Keepalive,
            ConnectionMessage::Kx { .. } => Self::Kx,
        }
    }
}

/// Codec for length-prefixed frames
///
/// Wire format:
/// - 4 bytes: length (big-endian, includes type byte)
/// - 1 byte: frame type
/// - N bytes: payload
#[derive(Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 5 bytes (4 length + 1 type)
        if src.len() < 5 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        if length == 0 {
            return Err(FrameError::Serialization("empty frame".into()));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);

        let frame_type = FrameType::try_from(src[0])?;
        src.advance(1);

        let payload = src.split_to(length - 1).to_vec();

        Ok(Some(Frame { frame_type, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = 1 + item.payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }

        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(item.frame_type as u8);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

impl Frame {
    /// Create a new frame
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self { frame_type, payload }
    }

    /// Frame a connection message
    pub fn from_message(message: &ConnectionMessage) -> Result<Self, FrameError> {
        Ok(Self::new(FrameType::of(message), message.to_bytes()?))
    }

    /// Decode and validate the connection message inside this frame
    pub fn to_message(&self) -> Result<ConnectionMessage, FrameError> {
        let message = ConnectionMessage::from_bytes(&self.payload)?;
        if FrameType::of(&message) != self.frame_type {
            return Err(FrameError::TypeMismatch {
                frame_type: self.frame_type,
                kind: message.kind(),
            });
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::{ConnectionId, PeerId};

    #[test]
    fn test_message_survives_codec() {
        let mut codec = FrameCodec::new();
        let message = ConnectionMessage::Create {
            cid: ConnectionId([5; 32]),
            path: vec![PeerId([1; 32]), PeerId([2; 32])],
        };

        let mut buf = BytesMut::new();
        codec.encode(Frame::from_message(&message).unwrap(), &mut buf).unwrap();

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::ConnectionCreate);
        assert_eq!(frame.to_message().unwrap(), message);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(FrameType::Hello, vec![1, 2, 3, 4]), &mut buf)
            .unwrap();

        let mut head = buf.split_to(6);
        assert!(codec.decode(&mut head).unwrap().is_none());
        head.unsplit(buf);
        assert_eq!(codec.decode(&mut head).unwrap().unwrap().payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_unknown_frame_type_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(99);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_mismatched_type_rejected() {
        let message = ConnectionMessage::Destroy {
            cid: ConnectionId([1; 32]),
        };
        let mut frame = Frame::from_message(&message).unwrap();
        frame.frame_type = FrameType::Poll;
        assert!(matches!(
            frame.to_message(),
            Err(FrameError::TypeMismatch { .. })
        ));
    }
}

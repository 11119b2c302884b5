//! Mesh Core Library
//!
//! This crate provides the identifiers, sequence arithmetic and wire messages
//! shared by every layer of the mesh transport.
//!
//! # Modules
//!
//! - [`types`]: Identifier newtypes (PeerId, ConnectionId, ChannelNumber, ...)
//! - [`seq`]: Wraparound-aware 32-bit sequence comparisons
//! - [`messages`]: Connection-level and channel-level message sum types
//! - [`encoding`]: Postcard encoding and structural validation
//! - [`crypto`]: Domain-separated BLAKE3 derivations
//! - [`error`]: Error types

pub mod crypto;
pub mod encoding;
pub mod error;
pub mod messages;
pub mod seq;
pub mod types;

pub use error::{Error, Result};
pub use messages::*;
pub use types::*;

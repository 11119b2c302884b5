//! Error types for the mesh core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Mesh core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Path announcement shorter than two peers
    #[error("path too short: {0} peers")]
    PathTooShort(usize),

    /// Path announcement longer than the protocol allows
    #[error("path too long: {0} peers")]
    PathTooLong(usize),

    /// Same peer listed twice in a path
    #[error("path contains a loop at {0}")]
    PathLoop(String),

    /// Payload exceeds the maximum message size
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Channel number outside the global range
    #[error("channel number not global: {0:#x}")]
    NotGlobalChannel(u32),
}

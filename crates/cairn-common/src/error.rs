//! Error types for Cairn
//!
//! This module defines the error type shared by the common types and the
//! configuration loader.

use thiserror::Error;

/// Common result type for Cairn operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Cairn
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid object address: {0}")]
    InvalidAddress(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this error means the input bytes could not be decoded
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Deserialization(_) | Self::InvalidAddress(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_corruption() {
        assert!(Error::Deserialization("bad".into()).is_corruption());
        assert!(Error::InvalidAddress("bad".into()).is_corruption());
        assert!(!Error::configuration("x").is_corruption());
    }

    #[test]
    fn test_error_display() {
        let err = Error::configuration("no shards");
        assert_eq!(err.to_string(), "configuration error: no shards");
    }
}

use thiserror::Error;

use crate::shm::MapError;
use crate::wire::{DecodeError, EncodeError};

/// Error types for the shared memory relay system
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    #[error("Response body too large: {size} bytes (max: {limit})")]
    BodyTooLarge { size: u64, limit: u64 },

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Shared memory error: {0}")]
    Region(#[from] MapError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Type alias for Results using RelayError
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RelayError::InvalidMessage("test".to_string());
        assert_eq!(err.to_string(), "Invalid message format: test");

        let err = RelayError::Timeout;
        assert_eq!(err.to_string(), "Timeout waiting for response");
    }

    #[test]
    fn test_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json");
        assert!(json_err.is_err());

        let relay_err: RelayError = json_err.unwrap_err().into();
        assert!(matches!(relay_err, RelayError::SerializationError(_)));
    }

    #[test]
    fn test_decode_error_conversion() {
        let decode_err = DecodeError::Truncated {
            offset: 4,
            needed: 8,
        };
        let relay_err: RelayError = decode_err.into();
        assert!(matches!(relay_err, RelayError::Decode(_)));
    }
}

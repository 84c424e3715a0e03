use thiserror::Error;

use crate::codec::CodecError;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Peer not connected: {0}")]
    PeerNotConnected(String),

    #[error("Connection limit reached")]
    ConnectionLimit,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Transport is shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, NetworkError>;

impl From<serde_json::Error> for NetworkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for NetworkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_display() {
        let err = NetworkError::Bind {
            addr: "0.0.0.0:19370".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(err.to_string(), "Failed to bind 0.0.0.0:19370: in use");
    }

    #[test]
    fn test_codec_error_converts() {
        let err: NetworkError = CodecError::UnknownType(0x42).into();
        assert!(matches!(err, NetworkError::Codec(CodecError::UnknownType(0x42))));
    }
}

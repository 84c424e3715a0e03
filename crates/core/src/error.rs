use thiserror::Error;

#[derive(Error, Debug)]
pub enum MumbleChatError {
    #[error("Invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("Invalid wallet address: {0}")]
    InvalidAddress(String),

    #[error("Invalid tier: {0}")]
    InvalidTier(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Timeout")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, MumbleChatError>;

impl From<serde_json::Error> for MumbleChatError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_invalid_node_id() {
        let err = MumbleChatError::InvalidNodeId("zz".to_string());
        assert_eq!(err.to_string(), "Invalid node id: zz");
    }

    #[test]
    fn test_error_display_invalid_tier() {
        let err = MumbleChatError::InvalidTier("DIAMOND".to_string());
        assert_eq!(err.to_string(), "Invalid tier: DIAMOND");
    }

    #[test]
    fn test_error_display_invalid_signature() {
        assert_eq!(MumbleChatError::InvalidSignature.to_string(), "Invalid signature");
    }

    #[test]
    fn test_from_serde_error() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("not json");
        let err: MumbleChatError = parse.unwrap_err().into();
        assert!(matches!(err, MumbleChatError::SerializationError(_)));
    }
}

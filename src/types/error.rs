//! Error types for docbus
//!
//! Pattern adapted from the gateway error type: one enum, string payloads,
//! and a mapping onto the code carried by failure replies.

/// Code attached to every failure reply sent over the bus
pub const FAILURE_CODE: u16 = 500;

/// Main error type for docbus operations
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure reply received from another address; the message is kept verbatim
    #[error("{0}")]
    Remote(String),

    #[error("Gateway is closed")]
    Closed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BusError {
    /// Code sent with a failure reply
    pub fn reply_code(&self) -> u16 {
        FAILURE_CODE
    }

    /// Message sent with a failure reply
    pub fn reply_message(&self) -> String {
        self.to_string()
    }

    /// Whether the failure originated on another hop
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<mongodb::error::Error> for BusError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<bson::extjson::de::Error> for BusError {
    fn from(err: bson::extjson::de::Error) -> Self {
        Self::BadRequest(format!("Extended JSON error: {}", err))
    }
}

impl From<bson::de::Error> for BusError {
    fn from(err: bson::de::Error) -> Self {
        Self::BadRequest(format!("BSON error: {}", err))
    }
}

impl From<async_nats::Error> for BusError {
    fn from(err: async_nats::Error) -> Self {
        Self::Bus(err.to_string())
    }
}

/// Result type alias for docbus operations
pub type Result<T> = std::result::Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_code_is_fixed() {
        assert_eq!(BusError::Database("down".into()).reply_code(), 500);
        assert_eq!(BusError::BadRequest("bad".into()).reply_code(), 500);
        assert_eq!(BusError::Remote("x".into()).reply_code(), 500);
    }

    #[test]
    fn test_remote_message_is_verbatim() {
        let err = BusError::Remote("transformation failed".into());
        assert_eq!(err.reply_message(), "transformation failed");
        assert!(err.is_remote());
    }

    #[test]
    fn test_local_message_has_prefix() {
        let err = BusError::Database("connection refused".into());
        assert_eq!(err.reply_message(), "Database error: connection refused");
        assert!(!err.is_remote());
    }
}

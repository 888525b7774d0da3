/// Error types for the chat synchronization engine
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Not authenticated")]
    AuthenticationMissing,

    #[error("Conversation not found")]
    ConversationNotFound,

    #[error("Message is empty")]
    EmptyMessage,

    #[error("No chat is open")]
    NoActiveChat,

    #[error("A message is already being sent")]
    SendInFlight,

    #[error("Message not found: {0}")]
    MessageNotFound(String),
}

impl ChatError {
    /// Timeouts, connectivity loss and server-side failures. Polling retries these on the
    /// next tick; sends never retry them automatically.
    pub fn is_transient(&self) -> bool {
        match self {
            ChatError::Timeout(_) | ChatError::Network(_) => true,
            ChatError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ChatError::Timeout("poll".into()).is_transient());
        assert!(ChatError::Network("reset".into()).is_transient());
        assert!(ChatError::Http { status: 503, body: "down".into() }.is_transient());

        assert!(!ChatError::Http { status: 404, body: "missing".into() }.is_transient());
        assert!(!ChatError::AuthenticationMissing.is_transient());
        assert!(!ChatError::EmptyMessage.is_transient());
    }

    #[test]
    fn test_http_error_display() {
        let err = ChatError::Http { status: 502, body: "gateway failed".into() };
        assert_eq!(err.to_string(), "HTTP 502: gateway failed");
    }
}

// ABOUTME: Error taxonomy for the chat kernel.
// ABOUTME: Every failure belongs to one ErrorKind so integrators can branch UI behavior.

use crate::thread::ThreadState;
use thiserror::Error;
use uuid::Uuid;

/// Coarse classification of a [`ChatError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller misuse; fatal to the operation, never retried
    Usage,
    /// Socket-level failure; retried by the reconnection orchestrator
    Transport,
    /// Authorization flow failure; needs an explicit reconnect
    Authorization,
    /// Invalid or incomplete user input
    Validation,
    /// Remote resource failure; retry is calling again
    Resource,
    /// Local failure that retrying cannot fix
    Local,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("Operation requires an established connection; call connect first")]
    NotConnected,

    #[error("OAuth authorization selected but no authorization code was supplied")]
    MissingAuthorizationCode,

    #[error("Operation not supported: {0}")]
    UnsupportedOperation(String),

    #[error("Unknown thread {0}")]
    UnknownThread(Uuid),

    #[error("Thread {0} is closed")]
    ThreadClosed(Uuid),

    #[error("Invalid thread transition from {from:?} to {to:?}")]
    InvalidTransition { from: ThreadState, to: ThreadState },

    #[error("Socket connection refused: {0}")]
    SocketRefused(String),

    #[error("Socket dropped: {0}")]
    SocketDropped(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Reconnection failed after {attempts} attempts")]
    ReconnectionExhausted { attempts: u32 },

    #[error("Anonymous authorization failed: {0}")]
    AnonymousAuthorizationFailed(String),

    #[error("OAuth authorization failed: {0}")]
    OAuthAuthorizationFailed(String),

    #[error("Authorization succeeded but no access token was returned")]
    MissingAccessToken,

    #[error("Stored access token was rejected: {0}")]
    TokenRejected(String),

    #[error("Failed to associate customer with visitor: {0}")]
    CustomerAssociationFailed(String),

    #[error("Invalid value for field '{field}': {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("Missing required fields: {}", .labels.join(", "))]
    MissingRequiredFields { labels: Vec<String> },

    #[error("Attachment upload failed: {0}")]
    AttachmentSendFailed(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Malformed URL: {0}")]
    MalformedUrl(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
}

impl ChatError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotConnected
            | Self::MissingAuthorizationCode
            | Self::UnsupportedOperation(_)
            | Self::UnknownThread(_)
            | Self::ThreadClosed(_)
            | Self::InvalidTransition { .. } => ErrorKind::Usage,
            Self::SocketRefused(_)
            | Self::SocketDropped(_)
            | Self::Timeout(_)
            | Self::ReconnectionExhausted { .. } => ErrorKind::Transport,
            Self::AnonymousAuthorizationFailed(_)
            | Self::OAuthAuthorizationFailed(_)
            | Self::MissingAccessToken
            | Self::TokenRejected(_)
            | Self::CustomerAssociationFailed(_) => ErrorKind::Authorization,
            Self::InvalidFieldValue { .. } | Self::MissingRequiredFields { .. } => {
                ErrorKind::Validation
            }
            Self::AttachmentSendFailed(_) | Self::ServerError(_) => ErrorKind::Resource,
            Self::MalformedUrl(_) | Self::MalformedFrame(_) => ErrorKind::Local,
        }
    }

    /// Whether the reconnection orchestrator may retry after this error.
    ///
    /// Exhaustion is itself terminal even though it is a transport error.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transport && !matches!(self, Self::ReconnectionExhausted { .. })
    }

    /// Whether offering a "try again" affordance makes sense to the user
    pub fn suggests_retry(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Resource)
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::MalformedFrame(e.to_string())
    }
}

pub type Result<T, E = ChatError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(ChatError::NotConnected.kind(), ErrorKind::Usage);
        assert_eq!(ChatError::MissingAuthorizationCode.kind(), ErrorKind::Usage);
        assert_eq!(
            ChatError::SocketDropped("eof".into()).kind(),
            ErrorKind::Transport
        );
        assert_eq!(ChatError::MissingAccessToken.kind(), ErrorKind::Authorization);
        assert_eq!(
            ChatError::MissingRequiredFields { labels: vec![] }.kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            ChatError::AttachmentSendFailed("500".into()).kind(),
            ErrorKind::Resource
        );
        assert_eq!(ChatError::MalformedUrl("x".into()).kind(), ErrorKind::Local);
    }

    #[test]
    fn test_only_transport_errors_retry() {
        assert!(ChatError::SocketRefused("nope".into()).is_retryable());
        assert!(ChatError::Timeout("open".into()).is_retryable());
        assert!(!ChatError::ReconnectionExhausted { attempts: 3 }.is_retryable());
        assert!(!ChatError::OAuthAuthorizationFailed("denied".into()).is_retryable());
        assert!(!ChatError::MissingAuthorizationCode.is_retryable());
    }

    #[test]
    fn test_local_failures_do_not_suggest_retry() {
        assert!(!ChatError::MalformedUrl("ftp://x".into()).suggests_retry());
        assert!(ChatError::AttachmentSendFailed("503".into()).suggests_retry());
    }

    #[test]
    fn test_missing_required_message_lists_labels() {
        let err = ChatError::MissingRequiredFields {
            labels: vec!["Selector".into(), "Hierarchy".into()],
        };
        assert_eq!(err.to_string(), "Missing required fields: Selector, Hierarchy");
    }
}

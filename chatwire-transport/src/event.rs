// ABOUTME: Lifecycle and data events delivered by a socket transport.
// ABOUTME: Frames are raw text; decoding happens in chatwire-core.

use serde::{Deserialize, Serialize};

/// Events emitted by a transport after `open` succeeds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportEvent {
    /// Socket handshake completed
    Opened,

    /// A text frame arrived from the server
    Frame(String),

    /// Socket closed, either by us or by the peer
    Closed {
        /// WebSocket close code (1000 = normal, 1006 = abnormal)
        code: u16,
        /// Close reason supplied by whichever side closed
        reason: String,
    },

    /// Socket failed without a clean close
    Failed {
        /// Human-readable failure description
        message: String,
    },
}

impl TransportEvent {
    /// Create a Frame event
    pub fn frame(text: impl Into<String>) -> Self {
        Self::Frame(text.into())
    }

    /// True once the connection can deliver nothing further
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed { .. } | Self::Failed { .. })
    }

    /// True for a close the client did not ask for
    pub fn is_unexpected_drop(&self) -> bool {
        match self {
            Self::Closed { code, .. } => *code != 1000,
            Self::Failed { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_events() {
        assert!(!TransportEvent::Opened.is_terminal());
        assert!(!TransportEvent::frame("{}").is_terminal());
        assert!(TransportEvent::Closed {
            code: 1000,
            reason: String::new()
        }
        .is_terminal());
        assert!(TransportEvent::Failed {
            message: "reset".into()
        }
        .is_terminal());
    }

    #[test]
    fn test_normal_close_is_not_a_drop() {
        let normal = TransportEvent::Closed {
            code: 1000,
            reason: "bye".into(),
        };
        let abnormal = TransportEvent::Closed {
            code: 1006,
            reason: String::new(),
        };
        assert!(!normal.is_unexpected_drop());
        assert!(abnormal.is_unexpected_drop());
        assert!(TransportEvent::Failed {
            message: "refused".into()
        }
        .is_unexpected_drop());
    }
}

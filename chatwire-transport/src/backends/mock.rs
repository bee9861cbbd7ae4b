// ABOUTME: Mock transport for testing - replies to sent frames with scripted server frames.
// ABOUTME: Allows deterministic session tests without a real socket.
//!
//! # Example
//!
//! ```no_run
//! use chatwire_transport::backends::mock::MockTransport;
//! use chatwire_transport::TransportEvent;
//!
//! # async fn example() {
//! let mock = MockTransport::new()
//!     .on_send("AuthorizeCustomer")
//!     .reply_frame(r#"{"postback":{"type":"ConsumerAuthorized","data":{}}}"#);
//! let controller = mock.controller();
//!
//! let handle = mock.into_handle();
//! let mut events = handle.open("wss://chat.example.com").await.unwrap();
//! assert_eq!(events.recv().await, Some(TransportEvent::Opened));
//!
//! handle.send(r#"{"action":"AuthorizeCustomer"}"#).await.unwrap();
//! assert!(matches!(events.recv().await, Some(TransportEvent::Frame(_))));
//! assert_eq!(controller.sent_frames().len(), 1);
//! # }
//! ```

use crate::event::TransportEvent;
use crate::handle::TransportHandle;
use crate::traits::Transport;
use anyhow::Result;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Mock transport for testing
pub struct MockTransport {
    state: Arc<MockState>,
}

#[derive(Default)]
struct MockState {
    rules: Mutex<VecDeque<Rule>>,
    sent: Mutex<Vec<String>>,
    urls: Mutex<Vec<String>>,
    refusals: Mutex<u32>,
    inbound: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

struct Rule {
    pattern: String,
    frames: Vec<String>,
}

impl MockTransport {
    /// Create a new mock transport with no scripted replies
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState::default()),
        }
    }

    /// Set up a reply for the next sent frame containing `pattern`
    pub fn on_send(self, pattern: &str) -> ReplyBuilder {
        ReplyBuilder {
            transport: self,
            pattern: pattern.to_string(),
        }
    }

    /// Refuse the next `count` open attempts
    pub fn refuse_opens(self, count: u32) -> Self {
        *self.state.refusals.lock().unwrap_or_else(|e| e.into_inner()) = count;
        self
    }

    /// Get a controller that can inspect and drive this transport after it is spawned
    pub fn controller(&self) -> MockController {
        MockController {
            state: Arc::clone(&self.state),
        }
    }

    /// Convert this backend into a TransportHandle
    pub fn into_handle(self) -> TransportHandle {
        TransportHandle::spawn(self)
    }

    /// Factory for the registry. Honors `{"refuse_opens": n}` in the options.
    pub fn factory() -> crate::registry::TransportFactory {
        Box::new(|options| {
            let refusals = match options.get("refuse_opens") {
                None | Some(serde_json::Value::Null) => 0,
                Some(value) => value
                    .as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| {
                        anyhow::anyhow!("refuse_opens must be a small unsigned integer, got: {}", value)
                    })?,
            };
            Ok(MockTransport::new().refuse_opens(refusals).into_handle())
        })
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<BoxStream<'static, TransportEvent>>> {
        Box::pin(async move {
            self.state.lock_urls().push(url.to_string());
            {
                let mut refusals = self.state.refusals.lock().unwrap_or_else(|e| e.into_inner());
                if *refusals > 0 {
                    *refusals -= 1;
                    anyhow::bail!("Connection refused: {}", url);
                }
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(TransportEvent::Opened);
            *self.state.lock_inbound() = Some(tx);
            Ok(UnboundedReceiverStream::new(rx).boxed())
        })
    }

    fn send<'a>(&'a self, frame: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let inbound = self.state.lock_inbound().clone();
            let Some(inbound) = inbound else {
                anyhow::bail!("Socket is not open");
            };
            self.state.lock_sent().push(frame.to_string());

            // Oldest matching rule is consumed first
            let frames = {
                let mut rules = self.state.rules.lock().unwrap_or_else(|e| e.into_inner());
                rules
                    .iter()
                    .position(|r| frame.contains(&r.pattern))
                    .and_then(|i| rules.remove(i))
                    .map(|r| r.frames)
            };

            for reply in frames.unwrap_or_default() {
                let _ = inbound.send(TransportEvent::Frame(reply));
            }
            Ok(())
        })
    }

    fn close<'a>(&'a self) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Some(tx) = self.state.lock_inbound().take() {
                let _ = tx.send(TransportEvent::Closed {
                    code: 1000,
                    reason: "closed by client".to_string(),
                });
            }
            Ok(())
        })
    }
}

impl MockState {
    fn lock_sent(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_urls(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.urls.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_inbound(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<TransportEvent>>> {
        self.inbound.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Builder for scripted replies with a fluent API
pub struct ReplyBuilder {
    transport: MockTransport,
    pattern: String,
}

impl ReplyBuilder {
    /// Reply with a list of server frames
    pub fn reply_frames(self, frames: Vec<String>) -> MockTransport {
        self.transport
            .state
            .rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Rule {
                pattern: self.pattern,
                frames,
            });
        self.transport
    }

    /// Reply with a single server frame
    pub fn reply_frame(self, frame: &str) -> MockTransport {
        self.reply_frames(vec![frame.to_string()])
    }

    /// Accept the frame without replying
    pub fn no_reply(self) -> MockTransport {
        self.reply_frames(Vec::new())
    }
}

/// Inspects and drives a spawned MockTransport
#[derive(Clone)]
pub struct MockController {
    state: Arc<MockState>,
}

impl MockController {
    /// Frames sent by the client so far, in order
    pub fn sent_frames(&self) -> Vec<String> {
        self.state.lock_sent().clone()
    }

    /// URLs passed to every open attempt, including refused ones
    pub fn opened_urls(&self) -> Vec<String> {
        self.state.lock_urls().clone()
    }

    /// Whether a socket is currently open
    pub fn is_open(&self) -> bool {
        self.state.lock_inbound().is_some()
    }

    /// Push an unsolicited server frame. Returns false if no socket is open.
    pub fn push_frame(&self, frame: &str) -> bool {
        match self.state.lock_inbound().as_ref() {
            Some(tx) => tx.send(TransportEvent::Frame(frame.to_string())).is_ok(),
            None => false,
        }
    }

    /// Simulate the server dropping the connection
    pub fn drop_connection(&self) {
        if let Some(tx) = self.state.lock_inbound().take() {
            let _ = tx.send(TransportEvent::Closed {
                code: 1006,
                reason: "abnormal closure".to_string(),
            });
        }
    }

    /// Refuse the next `count` open attempts
    pub fn refuse_opens(&self, count: u32) {
        *self.state.refusals.lock().unwrap_or_else(|e| e.into_inner()) = count;
    }

    /// Script a reply on an already spawned transport
    pub fn on_send(&self, pattern: &str, frames: Vec<String>) {
        self.state
            .rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Rule {
                pattern: pattern.to_string(),
                frames,
            });
    }
}

// ABOUTME: TransportHandle provides a Send+Sync, cloneable front for a transport backend.
// ABOUTME: Uses channels to talk to the single worker task that owns the backend.

use crate::{Transport, TransportEvent};
use anyhow::Result;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// How long `close` waits for the backend's event stream to end
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Commands sent from TransportHandle to the backend worker
#[derive(Debug)]
pub enum Command {
    Open {
        url: String,
        event_tx: mpsc::Sender<TransportEvent>,
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        frame: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Send + Sync handle that the session interacts with.
///
/// All commands are serialized through one worker task, so frames leave the
/// backend in the order `send` was called.
#[derive(Clone)]
pub struct TransportHandle {
    tx: mpsc::Sender<Command>,
    name: &'static str,
}

impl TransportHandle {
    /// Create a new TransportHandle with the given command channel and backend name
    pub fn new(tx: mpsc::Sender<Command>, name: &'static str) -> Self {
        Self { tx, name }
    }

    /// Spawn a worker task that owns `backend` and return a handle to it
    pub fn spawn<T: Transport>(backend: T) -> Self {
        let (tx, mut rx) = mpsc::channel::<Command>(32);
        let name = backend.name();
        let backend = Arc::new(backend);

        tokio::spawn(async move {
            let mut pump: Option<JoinHandle<()>> = None;

            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Open {
                        url,
                        event_tx,
                        reply,
                    } => {
                        if let Some(previous) = pump.take() {
                            previous.abort();
                        }
                        match backend.open(&url).await {
                            Ok(mut stream) => {
                                pump = Some(tokio::spawn(async move {
                                    while let Some(event) = stream.next().await {
                                        if event_tx.send(event).await.is_err() {
                                            break;
                                        }
                                    }
                                }));
                                let _ = reply.send(Ok(()));
                            }
                            Err(e) => {
                                tracing::debug!(backend = name, url = %url, error = %e, "Transport open failed");
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                    Command::Send { frame, reply } => {
                        let _ = reply.send(backend.send(&frame).await);
                    }
                    Command::Close { reply } => {
                        let result = backend.close().await;
                        // Let the pump flush the Closed event before it is dropped
                        if let Some(mut p) = pump.take() {
                            if tokio::time::timeout(CLOSE_GRACE, &mut p).await.is_err() {
                                p.abort();
                            }
                        }
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::trace!(backend = name, "Transport worker stopped");
        });

        Self::new(tx, name)
    }

    /// Get the backend name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Open the socket and receive its events via EventReceiver
    pub async fn open(&self, url: &str) -> Result<EventReceiver> {
        let (event_tx, event_rx) = mpsc::channel(1024);
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(Command::Open {
                url: url.to_string(),
                event_tx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Transport worker closed"))?;

        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("Transport worker dropped reply channel"))??;

        Ok(EventReceiver::new(event_rx))
    }

    /// Send a text frame
    pub async fn send(&self, frame: impl Into<String>) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Send {
                frame: frame.into(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Transport worker closed"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("Transport worker dropped reply channel"))?
    }

    /// Close the socket
    pub async fn close(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Close { reply: reply_tx })
            .await
            .map_err(|_| anyhow::anyhow!("Transport worker closed"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("Transport worker dropped reply channel"))?
    }
}

/// Receiver for events from an open socket.
///
/// This is `Send` so it can be moved into the session's inbound worker.
pub struct EventReceiver {
    rx: mpsc::Receiver<TransportEvent>,
}

impl EventReceiver {
    /// Create a new EventReceiver wrapping the given channel
    pub fn new(rx: mpsc::Receiver<TransportEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next event, or None once the socket is gone
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Option<TransportEvent> {
        self.rx.try_recv().ok()
    }
}

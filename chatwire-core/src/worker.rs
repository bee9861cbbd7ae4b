// ABOUTME: The two session workers: inbound frame dispatch and outbound frame sending.
// ABOUTME: One task each, so inbound mutation is single-writer and callers never block on I/O.

use crate::chain::FrameSink;
use crate::error::{ChatError, Result};
use crate::router::EventRouter;
use chatwire_transport::{EventReceiver, TransportEvent, TransportHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

struct SendJob {
    frame: String,
    reply: oneshot::Sender<Result<()>>,
}

/// Queue in front of the outbound worker
#[derive(Clone)]
pub struct OutboundQueue {
    tx: mpsc::Sender<SendJob>,
}

impl OutboundQueue {
    /// Spawn the worker that owns sending on `transport`
    pub fn spawn(transport: TransportHandle, capacity: usize, timeout: Duration) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<SendJob>(capacity);

        let task = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = match tokio::time::timeout(timeout, transport.send(job.frame)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(ChatError::SocketDropped(e.to_string())),
                    Err(_) => Err(ChatError::Timeout("outbound frame".to_string())),
                };
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "Outbound frame not sent");
                }
                let _ = job.reply.send(result);
            }
            tracing::trace!("Outbound worker stopped");
        });

        (Self { tx }, task)
    }

    /// Queue `frame` and wait until the transport accepted it
    pub async fn send(&self, frame: String) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(SendJob { frame, reply })
            .await
            .map_err(|_| ChatError::SocketDropped("outbound worker stopped".to_string()))?;
        done.await
            .map_err(|_| ChatError::SocketDropped("outbound worker dropped reply".to_string()))?
    }
}

/// Queue in front of the inbound worker. Lives as long as the session,
/// across socket generations.
#[derive(Clone)]
pub struct InboundQueue {
    tx: mpsc::UnboundedSender<String>,
}

impl InboundQueue {
    /// Spawn the worker that routes every frame through `router`, in arrival order
    pub fn spawn(router: Arc<EventRouter>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                router.route_text(&frame);
            }
            tracing::trace!("Inbound worker stopped");
        });

        (Self { tx }, task)
    }

    pub fn push(&self, frame: String) -> bool {
        self.tx.send(frame).is_ok()
    }
}

impl FrameSink for InboundQueue {
    fn emit(&self, frame: String) -> bool {
        self.push(frame)
    }
}

/// A socket generation ended without the client asking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDrop {
    pub generation: u64,
    pub reason: String,
}

/// Forward one socket generation's frames into the inbound queue and report
/// an unexpected end on `drops`.
pub fn spawn_pump(
    mut events: EventReceiver,
    generation: u64,
    inbound: InboundQueue,
    drops: mpsc::UnboundedSender<ConnectionDrop>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reason = loop {
            match events.recv().await {
                Some(TransportEvent::Opened) => {
                    tracing::debug!(generation, "Socket opened");
                }
                Some(TransportEvent::Frame(frame)) => {
                    if !inbound.push(frame) {
                        return;
                    }
                }
                Some(event @ (TransportEvent::Closed { .. } | TransportEvent::Failed { .. })) => {
                    if !event.is_unexpected_drop() {
                        tracing::debug!(generation, "Socket closed by client");
                        return;
                    }
                    break match event {
                        TransportEvent::Closed { code, reason } => format!("closed with {}: {}", code, reason),
                        TransportEvent::Failed { message } => message,
                        _ => String::new(),
                    };
                }
                None => break "event stream ended".to_string(),
            }
        };
        tracing::warn!(generation, reason = %reason, "Socket dropped");
        let _ = drops.send(ConnectionDrop { generation, reason });
    })
}

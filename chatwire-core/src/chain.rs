// ABOUTME: Thread action handler chain: socket sender at the core, decorators around it.
// ABOUTME: ArchivalHandler intercepts Archive and forwards every other action untouched.

use crate::blueprint::{EventBlueprint, EventType, OutboundFrame};
use crate::context::SharedContext;
use crate::error::{ChatError, Result};
use crate::machine::ThreadStateMachine;
use crate::thread::CustomField;
use crate::worker::OutboundQueue;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Completion callback, invoked once the action left the client
pub type OnSent = Box<dyn FnOnce() + Send>;

/// Everything a customer can do to a thread
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadAction {
    SendMessage {
        message_id: Uuid,
        text: String,
    },
    SendAttachment {
        message_id: Uuid,
        file_url: String,
        file_name: String,
        mime_type: String,
    },
    LoadMoreMessages {
        scroll_token: String,
    },
    RecoverThread,
    LoadMetadata,
    TypingStarted,
    TypingEnded,
    MarkRead,
    Archive,
    Rename(String),
    SetCustomFields(Vec<CustomField>),
    EndContact,
}

impl ThreadAction {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::SendMessage { .. } | Self::SendAttachment { .. } => EventType::SendMessage,
            Self::LoadMoreMessages { .. } => EventType::LoadMoreMessages,
            Self::RecoverThread => EventType::RecoverThread,
            Self::LoadMetadata => EventType::LoadThreadMetadata,
            Self::TypingStarted => EventType::SenderTypingStarted,
            Self::TypingEnded => EventType::SenderTypingEnded,
            Self::MarkRead => EventType::MessageSeenByCustomer,
            Self::Archive => EventType::ArchiveThread,
            Self::Rename(_) => EventType::UpdateThread,
            Self::SetCustomFields(_) => EventType::SetContactCustomFields,
            Self::EndContact => EventType::EndContact,
        }
    }

    /// Action-specific part of the outbound payload
    pub fn data(&self, thread_id: Uuid) -> Value {
        let thread = json!({"idOnExternalPlatform": thread_id});
        match self {
            Self::SendMessage { message_id, text } => json!({
                "thread": thread,
                "idOnExternalPlatform": message_id,
                "messageContent": {"type": "TEXT", "payload": {"text": text}},
            }),
            Self::SendAttachment {
                message_id,
                file_url,
                file_name,
                mime_type,
            } => json!({
                "thread": thread,
                "idOnExternalPlatform": message_id,
                "messageContent": {"type": "TEXT", "payload": {"text": ""}},
                "attachments": [{"url": file_url, "friendlyName": file_name, "mimeType": mime_type}],
            }),
            Self::LoadMoreMessages { scroll_token } => json!({
                "thread": thread,
                "scrollToken": scroll_token,
            }),
            Self::Rename(name) => json!({
                "thread": {"idOnExternalPlatform": thread_id, "threadName": name},
            }),
            Self::SetCustomFields(fields) => json!({
                "thread": thread,
                "customFields": fields
                    .iter()
                    .map(|f| json!({"ident": f.id, "value": f.value}))
                    .collect::<Vec<_>>(),
            }),
            Self::RecoverThread
            | Self::LoadMetadata
            | Self::TypingStarted
            | Self::TypingEnded
            | Self::MarkRead
            | Self::Archive
            | Self::EndContact => json!({"thread": thread}),
        }
    }
}

#[async_trait]
pub trait ThreadEventHandler: Send + Sync {
    /// Perform `action`. `on_sent` runs once the action has left the client.
    async fn trigger(&self, action: ThreadAction, on_sent: Option<OnSent>) -> Result<()>;
}

/// Feedback path that injects frames into the session's own inbound stream
pub trait FrameSink: Send + Sync {
    /// Returns false once the inbound stream is gone
    fn emit(&self, frame: String) -> bool;
}

/// Innermost handler: serialises the action and hands it to the outbound worker
pub struct SocketThreadHandler {
    thread_id: Uuid,
    context: SharedContext,
    outbound: OutboundQueue,
}

impl SocketThreadHandler {
    pub fn new(thread_id: Uuid, context: SharedContext, outbound: OutboundQueue) -> Self {
        Self {
            thread_id,
            context,
            outbound,
        }
    }

    fn frame(&self, action: &ThreadAction) -> Result<String> {
        let mut data = action.data(self.thread_id);
        if let (Value::Object(map), Value::Object(identity)) = (&mut data, self.context.get().identity()) {
            for (key, value) in identity {
                map.entry(key).or_insert(value);
            }
        }
        OutboundFrame::new(action.event_type(), data).to_text()
    }
}

#[async_trait]
impl ThreadEventHandler for SocketThreadHandler {
    async fn trigger(&self, action: ThreadAction, on_sent: Option<OnSent>) -> Result<()> {
        let frame = self.frame(&action)?;
        tracing::debug!(thread_id = %self.thread_id, event_type = ?action.event_type(), "Sending thread action");
        self.outbound.send(frame).await?;
        if let Some(on_sent) = on_sent {
            on_sent();
        }
        Ok(())
    }
}

/// Decorator that turns a sent archive request into local state.
///
/// For `Archive` the order is: inner trigger completes, one `ThreadUpdated`
/// frame is emitted on the feedback path, `on_sent` runs, then the thread
/// stops accepting messages.
pub struct ArchivalHandler {
    inner: Arc<dyn ThreadEventHandler>,
    machine: ThreadStateMachine,
    feedback: Arc<dyn FrameSink>,
}

impl ArchivalHandler {
    pub fn new(
        inner: Arc<dyn ThreadEventHandler>,
        machine: ThreadStateMachine,
        feedback: Arc<dyn FrameSink>,
    ) -> Self {
        Self {
            inner,
            machine,
            feedback,
        }
    }
}

#[async_trait]
impl ThreadEventHandler for ArchivalHandler {
    async fn trigger(&self, action: ThreadAction, on_sent: Option<OnSent>) -> Result<()> {
        match action {
            ThreadAction::Archive => {
                self.inner.trigger(ThreadAction::Archive, None).await?;

                let thread_id = self.machine.id();
                if !self.feedback.emit(EventBlueprint::thread_updated(thread_id)) {
                    tracing::warn!(thread_id = %thread_id, "Feedback path closed, archive update not looped back");
                }
                if let Some(on_sent) = on_sent {
                    on_sent();
                }
                self.machine.archive()?;
                tracing::info!(thread_id = %thread_id, "Thread archived");
                Ok(())
            }
            ThreadAction::SendMessage { .. }
            | ThreadAction::SendAttachment { .. }
            | ThreadAction::LoadMoreMessages { .. }
            | ThreadAction::RecoverThread
            | ThreadAction::LoadMetadata
            | ThreadAction::TypingStarted
            | ThreadAction::TypingEnded
            | ThreadAction::MarkRead
            | ThreadAction::Rename(_)
            | ThreadAction::SetCustomFields(_)
            | ThreadAction::EndContact => self.inner.trigger(action, on_sent).await,
        }
    }
}

/// Outermost decorator: a closed thread accepts no further actions
pub struct ClosedThreadGuard {
    inner: Arc<dyn ThreadEventHandler>,
    machine: ThreadStateMachine,
}

impl ClosedThreadGuard {
    pub fn new(inner: Arc<dyn ThreadEventHandler>, machine: ThreadStateMachine) -> Self {
        Self { inner, machine }
    }
}

#[async_trait]
impl ThreadEventHandler for ClosedThreadGuard {
    async fn trigger(&self, action: ThreadAction, on_sent: Option<OnSent>) -> Result<()> {
        if self.machine.state().is_closed() {
            return Err(ChatError::ThreadClosed(self.machine.id()));
        }
        self.inner.trigger(action, on_sent).await
    }
}

/// Standard chain for one thread: guard, archival, socket
pub fn thread_chain(
    machine: ThreadStateMachine,
    context: SharedContext,
    outbound: OutboundQueue,
    feedback: Arc<dyn FrameSink>,
) -> Arc<dyn ThreadEventHandler> {
    let socket: Arc<dyn ThreadEventHandler> =
        Arc::new(SocketThreadHandler::new(machine.id(), context, outbound));
    let archival: Arc<dyn ThreadEventHandler> =
        Arc::new(ArchivalHandler::new(socket, machine.clone(), feedback));
    Arc::new(ClosedThreadGuard::new(archival, machine))
}

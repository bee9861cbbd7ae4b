// ABOUTME: ChatSession composes router, workers, orchestrator, threads and upload cache for one context.
// ABOUTME: This is the integrator-facing API; every operation needs a prior connect.

use crate::api::{AttachmentUpload, ChannelConfiguration, ChatApi};
use crate::auth::{Authorizer, ReplyWaiter, SocketAuthorizer};
use crate::blueprint::{EventType, OutboundFrame};
use crate::chain::{thread_chain, FrameSink, ThreadAction, ThreadEventHandler};
use crate::config::ChatConfig;
use crate::context::{ConnectionContext, Environment, SharedContext};
use crate::error::{ChatError, Result};
use crate::events::{ThreadEvent, ThreadList, THREAD_EVENT_TYPES};
use crate::fields::FieldDefinitionValidator;
use crate::machine::ThreadStateMachine;
use crate::orchestrator::{ConnectionState, OrchestratorSettings, ReconnectionOrchestrator};
use crate::router::EventRouter;
use crate::storage::ValueStorage;
use crate::survey::PreChatSurveyResponse;
use crate::thread::{ChatThread, CustomField, Message, MessageContent, ThreadState};
use crate::upload::AttachmentUploadCache;
use crate::worker::{InboundQueue, OutboundQueue};
use chatwire_transport::{TransportHandle, TransportRegistry};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Clone)]
struct ThreadEntry {
    machine: ThreadStateMachine,
    handler: Arc<dyn ThreadEventHandler>,
}

struct SessionInner {
    config: ChatConfig,
    storage: Arc<dyn ValueStorage>,
    api: Arc<dyn ChatApi>,
    router: Arc<EventRouter>,
    inbound: InboundQueue,
    outbound: OutboundQueue,
    orchestrator: Arc<ReconnectionOrchestrator>,
    uploads: AttachmentUploadCache,
    context: SharedContext,
    threads: Mutex<HashMap<Uuid, ThreadEntry>>,
    channel: RwLock<Option<ChannelConfiguration>>,
    updates: broadcast::Sender<Uuid>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One chat connection and the threads it owns. Cheap to clone.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

impl ChatSession {
    /// Build a session that authorizes over the socket.
    ///
    /// Must be called inside a tokio runtime; the session workers start here.
    pub fn new(
        config: ChatConfig,
        transport: TransportHandle,
        storage: Arc<dyn ValueStorage>,
        api: Arc<dyn ChatApi>,
    ) -> Self {
        Self::build(config, transport, storage, api, None)
    }

    /// Build a session with a custom authorizer
    pub fn with_authorizer(
        config: ChatConfig,
        transport: TransportHandle,
        storage: Arc<dyn ValueStorage>,
        api: Arc<dyn ChatApi>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self::build(config, transport, storage, api, Some(authorizer))
    }

    /// Build a session whose transport is created by name from `config.network.transport`
    pub fn from_registry(
        config: ChatConfig,
        registry: &TransportRegistry,
        storage: Arc<dyn ValueStorage>,
        api: Arc<dyn ChatApi>,
    ) -> Result<Self> {
        let transport = registry
            .create(&config.network.transport, &Value::Null)
            .map_err(|e| ChatError::UnsupportedOperation(e.to_string()))?;
        Ok(Self::new(config, transport, storage, api))
    }

    fn build(
        config: ChatConfig,
        transport: TransportHandle,
        storage: Arc<dyn ValueStorage>,
        api: Arc<dyn ChatApi>,
        authorizer: Option<Arc<dyn Authorizer>>,
    ) -> Self {
        let router = Arc::new(EventRouter::new());
        let (inbound, inbound_task) = InboundQueue::spawn(Arc::clone(&router));
        let (outbound, outbound_task) = OutboundQueue::spawn(
            transport.clone(),
            config.network.outbound_capacity,
            config.network_timeout(),
        );

        let authorizer: Arc<dyn Authorizer> = match authorizer {
            Some(authorizer) => authorizer,
            None => {
                let replies = ReplyWaiter::new();
                replies.install(&router);
                Arc::new(SocketAuthorizer::new(
                    outbound.clone(),
                    replies,
                    Arc::clone(&api),
                ))
            }
        };

        let context = SharedContext::new(
            ConnectionContext::new(
                config.brand_id,
                config.channel_id.clone(),
                storage.visitor_id(),
                storage.destination_id(),
                Environment::from_config(&config.environment),
            )
            .with_customer_id(storage.customer_id()),
        );

        let (orchestrator, mut drops) = ReconnectionOrchestrator::new(
            OrchestratorSettings::from_config(&config),
            transport,
            authorizer,
            Arc::clone(&storage),
            context.clone(),
            inbound.clone(),
        );
        let orchestrator = Arc::new(orchestrator);

        let drop_task = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                while let Some(dropped) = drops.recv().await {
                    if let Err(e) = orchestrator.handle_drop(dropped).await {
                        tracing::error!(error = %e, "Session lost its connection");
                    }
                }
            })
        };

        let (updates, _) = broadcast::channel(256);
        let inner = Arc::new(SessionInner {
            uploads: AttachmentUploadCache::new(Arc::clone(&api)),
            config,
            storage,
            api,
            router,
            inbound,
            outbound,
            orchestrator,
            context,
            threads: Mutex::new(HashMap::new()),
            channel: RwLock::new(None),
            updates,
            tasks: Mutex::new(vec![inbound_task, outbound_task, drop_task]),
        });
        SessionInner::register_handlers(&inner);

        Self { inner }
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Fetch the channel configuration, connect, authorize and ask for threads
    pub async fn connect(&self) -> Result<()> {
        self.inner.load_channel_configuration().await?;
        self.inner.orchestrator.connect().await?;
        self.inner.request_threads().await
    }

    pub async fn disconnect(&self) {
        self.inner.orchestrator.disconnect().await;
    }

    /// Disconnect, drop every handler and stop the workers
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.inner.router.clear();
        for task in self.inner.lock_tasks().drain(..) {
            task.abort();
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.orchestrator.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.orchestrator.subscribe()
    }

    /// Ids of threads whose snapshot changed from a server or loopback event
    pub fn subscribe_thread_updates(&self) -> broadcast::Receiver<Uuid> {
        self.inner.updates.subscribe()
    }

    pub fn set_authorization_code(&self, code: impl Into<String>, verifier: Option<String>) {
        self.inner.orchestrator.set_authorization_code(code, verifier);
    }

    pub fn context(&self) -> ConnectionContext {
        self.inner.context.get()
    }

    pub fn last_failure(&self) -> Option<ChatError> {
        self.inner.orchestrator.last_failure()
    }

    pub fn set_welcome_message(&self, message: &str) {
        self.inner.storage.set_welcome_message(message);
    }

    /// Refresh the channel configuration from the REST API
    pub async fn fetch_channel_configuration(&self) -> Result<ChannelConfiguration> {
        if self.state() != ConnectionState::Connected {
            return Err(ChatError::NotConnected);
        }
        self.inner.load_channel_configuration().await
    }

    // =========================================================================
    // Threads
    // =========================================================================

    /// Create a local thread, ready for its first message
    pub async fn create_thread(&self) -> Result<ThreadStateMachine> {
        self.inner.orchestrator.ensure_authorized().await?;

        if !self.inner.channel().is_multithread && !self.inner.lock_threads().is_empty() {
            return Err(ChatError::UnsupportedOperation(
                "channel supports a single thread".to_string(),
            ));
        }

        let machine = ThreadStateMachine::new_local(ChatThread::new(Uuid::new_v4(), ThreadState::Pending));
        let welcome = self.inner.storage.welcome_message();
        if !welcome.is_empty() {
            machine.add_messages(vec![Message::inbound_text(machine.id(), welcome)])?;
        }
        machine.transition(ThreadState::Ready)?;
        self.inner.insert_thread(machine.clone());
        tracing::info!(thread_id = %machine.id(), "Created thread");
        Ok(machine)
    }

    pub fn thread(&self, thread_id: Uuid) -> Option<ThreadStateMachine> {
        self.inner
            .lock_threads()
            .get(&thread_id)
            .map(|e| e.machine.clone())
    }

    pub fn threads(&self) -> Vec<ChatThread> {
        let mut threads: Vec<ChatThread> = self
            .inner
            .lock_threads()
            .values()
            .map(|e| e.machine.snapshot())
            .collect();
        threads.sort_by_key(|t| t.id);
        threads
    }

    async fn ready_entry(&self, thread_id: Uuid) -> Result<ThreadEntry> {
        self.inner.orchestrator.ensure_authorized().await?;
        self.inner
            .lock_threads()
            .get(&thread_id)
            .cloned()
            .ok_or(ChatError::UnknownThread(thread_id))
    }

    pub async fn send_message(&self, thread_id: Uuid, text: &str) -> Result<Message> {
        let entry = self.ready_entry(thread_id).await?;
        if !entry.machine.snapshot().can_add_more_messages {
            return Err(ChatError::UnsupportedOperation(format!(
                "thread {} no longer accepts messages",
                thread_id
            )));
        }

        let message = Message::outbound_text(thread_id, text);
        entry
            .handler
            .trigger(
                ThreadAction::SendMessage {
                    message_id: message.id,
                    text: text.to_string(),
                },
                None,
            )
            .await?;
        entry.machine.add_messages(vec![message.clone()])?;
        Ok(message)
    }

    /// Upload through the dedup cache and return the file URL
    pub async fn upload_attachment(&self, upload: &AttachmentUpload) -> Result<String> {
        self.inner.orchestrator.ensure_authorized().await?;
        let config = &self.inner.config;
        self.inner
            .uploads
            .upload(upload, config.brand_id, &config.channel_id)
            .await
    }

    /// Upload an attachment and post it to the thread
    pub async fn send_attachment(&self, thread_id: Uuid, upload: &AttachmentUpload) -> Result<Message> {
        let entry = self.ready_entry(thread_id).await?;
        let file_url = self.upload_attachment(upload).await?;

        let message = Message {
            content: MessageContent::Attachment {
                file_url: file_url.clone(),
                file_name: upload.file_name.clone(),
                mime_type: upload.mime_type.clone(),
            },
            ..Message::outbound_text(thread_id, "")
        };
        entry
            .handler
            .trigger(
                ThreadAction::SendAttachment {
                    message_id: message.id,
                    file_url,
                    file_name: upload.file_name.clone(),
                    mime_type: upload.mime_type.clone(),
                },
                None,
            )
            .await?;
        entry.machine.add_messages(vec![message.clone()])?;
        Ok(message)
    }

    /// Ask for the next older page. Returns false when there is nothing left.
    pub async fn load_more_messages(&self, thread_id: Uuid) -> Result<bool> {
        let entry = self.ready_entry(thread_id).await?;
        let thread = entry.machine.snapshot();
        if !thread.has_more_messages_to_load() {
            return Ok(false);
        }
        entry
            .handler
            .trigger(
                ThreadAction::LoadMoreMessages {
                    scroll_token: thread.scroll_token,
                },
                None,
            )
            .await?;
        Ok(true)
    }

    pub async fn report_typing(&self, thread_id: Uuid, typing: bool) -> Result<()> {
        let entry = self.ready_entry(thread_id).await?;
        let action = if typing {
            ThreadAction::TypingStarted
        } else {
            ThreadAction::TypingEnded
        };
        entry.handler.trigger(action, None).await
    }

    pub async fn mark_read(&self, thread_id: Uuid) -> Result<()> {
        let entry = self.ready_entry(thread_id).await?;
        entry.handler.trigger(ThreadAction::MarkRead, None).await?;
        entry.machine.mark_read()?;
        Ok(())
    }

    pub async fn archive_thread(&self, thread_id: Uuid) -> Result<()> {
        let entry = self.ready_entry(thread_id).await?;
        if !self.inner.channel().is_multithread {
            return Err(ChatError::UnsupportedOperation(
                "archiving needs a multi-thread channel".to_string(),
            ));
        }
        entry.handler.trigger(ThreadAction::Archive, None).await
    }

    pub async fn rename_thread(&self, thread_id: Uuid, name: &str) -> Result<()> {
        let entry = self.ready_entry(thread_id).await?;
        entry
            .handler
            .trigger(ThreadAction::Rename(name.to_string()), None)
            .await?;
        entry.machine.set_name(Some(name.to_string()))?;
        Ok(())
    }

    /// Validate pre-chat answers and attach them to the thread as custom fields
    pub async fn submit_pre_chat(
        &self,
        thread_id: Uuid,
        responses: &[PreChatSurveyResponse],
    ) -> Result<Vec<CustomField>> {
        let entry = self.ready_entry(thread_id).await?;
        let survey = self.inner.channel().pre_chat_survey.ok_or_else(|| {
            ChatError::UnsupportedOperation("channel has no pre-chat survey".to_string())
        })?;
        let fields = survey.accept(responses)?;
        self.push_fields(&entry, fields).await
    }

    /// Validate and set contact custom fields on a thread
    pub async fn set_contact_fields(
        &self,
        thread_id: Uuid,
        answers: &HashMap<String, String>,
    ) -> Result<Vec<CustomField>> {
        let entry = self.ready_entry(thread_id).await?;
        let validator = FieldDefinitionValidator::new(self.inner.channel().contact_custom_fields);
        for field_id in answers.keys() {
            if !validator.contains_field(field_id) {
                return Err(ChatError::InvalidFieldValue {
                    field: field_id.clone(),
                    reason: "not a contact field of this channel".to_string(),
                });
            }
        }
        validator.validate(answers)?;

        let mut fields: Vec<CustomField> = answers
            .iter()
            .map(|(id, value)| CustomField::new(id.as_str(), value.as_str()))
            .collect();
        fields.sort_by(|a, b| a.id.cmp(&b.id));
        self.push_fields(&entry, fields).await
    }

    async fn push_fields(&self, entry: &ThreadEntry, fields: Vec<CustomField>) -> Result<Vec<CustomField>> {
        entry
            .handler
            .trigger(ThreadAction::SetCustomFields(fields.clone()), None)
            .await?;
        entry.machine.update_fields(fields.clone())?;
        Ok(fields)
    }

    /// End the contact; the thread becomes closed
    pub async fn end_contact(&self, thread_id: Uuid) -> Result<()> {
        let entry = self.ready_entry(thread_id).await?;
        entry.handler.trigger(ThreadAction::EndContact, None).await?;
        entry.machine.close()
    }
}

impl SessionInner {
    fn lock_threads(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ThreadEntry>> {
        self.threads.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Latest channel configuration, default before the first fetch
    fn channel(&self) -> ChannelConfiguration {
        self.channel
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_default()
    }

    async fn load_channel_configuration(&self) -> Result<ChannelConfiguration> {
        let configuration = tokio::time::timeout(
            self.config.network_timeout(),
            self.api
                .channel_configuration(self.config.brand_id, &self.config.channel_id),
        )
        .await
        .map_err(|_| ChatError::Timeout("channel configuration".to_string()))??;

        tracing::debug!(multithread = configuration.is_multithread, "Loaded channel configuration");
        *self.channel.write().unwrap_or_else(|e| e.into_inner()) = Some(configuration.clone());
        Ok(configuration)
    }

    fn insert_thread(&self, machine: ThreadStateMachine) -> ThreadEntry {
        let feedback: Arc<dyn FrameSink> = Arc::new(self.inbound.clone());
        let entry = ThreadEntry {
            handler: thread_chain(machine.clone(), self.context.clone(), self.outbound.clone(), feedback),
            machine,
        };
        self.lock_threads()
            .entry(entry.machine.id())
            .or_insert(entry)
            .clone()
    }

    fn register_handlers(inner: &Arc<SessionInner>) {
        for event_type in THREAD_EVENT_TYPES {
            let session = Arc::downgrade(inner);
            inner
                .router
                .register(event_type, move |payload: &Value| -> anyhow::Result<()> {
                    with_session(&session, |s| s.on_thread_event(event_type, payload))
                });
        }

        let session = Arc::downgrade(inner);
        inner.router.register(
            EventType::ThreadListFetched,
            move |payload: &Value| -> anyhow::Result<()> {
                with_session(&session, |s| s.on_thread_list(payload))
            },
        );
    }

    fn on_thread_event(&self, event_type: EventType, payload: &Value) -> Result<()> {
        let Some(event) = ThreadEvent::decode(event_type, payload)? else {
            return Ok(());
        };
        let thread_id = event.thread_id();

        let existing = self.lock_threads().get(&thread_id).map(|e| e.machine.clone());
        let machine = match existing {
            Some(machine) => machine,
            // The server may start a thread (recovery, agent-initiated message)
            None if matches!(event, ThreadEvent::Recovered { .. } | ThreadEvent::MessageCreated { .. }) => {
                let machine = ThreadStateMachine::from_server(ChatThread::new(thread_id, ThreadState::Received));
                self.insert_thread(machine).machine
            }
            None => {
                tracing::debug!(thread_id = %thread_id, event_type = ?event_type, "Event for unknown thread");
                return Ok(());
            }
        };

        machine.apply(event)?;
        let _ = self.updates.send(thread_id);
        Ok(())
    }

    fn on_thread_list(&self, payload: &Value) -> Result<()> {
        let list: ThreadList = serde_json::from_value(payload.clone())?;
        tracing::debug!(count = list.threads.len(), "Thread list fetched");

        for summary in list.threads {
            if self.lock_threads().contains_key(&summary.id) {
                continue;
            }
            let mut thread = ChatThread::new(summary.id, ThreadState::Received);
            thread.name = summary.name;
            let entry = self.insert_thread(ThreadStateMachine::from_server(thread));

            tokio::spawn(async move {
                if let Err(e) = entry.handler.trigger(ThreadAction::RecoverThread, None).await {
                    tracing::warn!(thread_id = %entry.machine.id(), error = %e, "Thread recovery request failed");
                }
            });
            let _ = self.updates.send(summary.id);
        }
        Ok(())
    }

    /// Multi-thread channels list their threads; single-thread channels recover the one thread
    async fn request_threads(&self) -> Result<()> {
        let event_type = if self.channel().is_multithread {
            EventType::FetchThreadList
        } else {
            EventType::RecoverThread
        };
        let frame = OutboundFrame::new(event_type, self.context.get().identity()).to_text()?;
        self.outbound.send(frame).await
    }
}

fn with_session<F>(session: &Weak<SessionInner>, f: F) -> anyhow::Result<()>
where
    F: FnOnce(&SessionInner) -> Result<()>,
{
    match session.upgrade() {
        Some(inner) => Ok(f(&inner)?),
        None => Ok(()),
    }
}

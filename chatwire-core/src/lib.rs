// ABOUTME: Real-time chat protocol kernel for chatwire.
// ABOUTME: Event routing, thread lifecycle, handler chain, reconnection, upload dedup and field validation.

pub mod api;
pub mod auth;
pub mod blueprint;
pub mod chain;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod fields;
pub mod machine;
pub mod orchestrator;
pub mod paths;
pub mod reconnect;
pub mod router;
pub mod session;
pub mod storage;
pub mod survey;
pub mod thread;
pub mod upload;
pub mod worker;

pub use error::{ChatError, ErrorKind, Result};

// Re-export the types most integrations touch
pub use api::{AttachmentUpload, ChannelConfiguration, ChatApi, MockChatApi};
pub use auth::{AuthMode, Authorizer};
pub use blueprint::{EventBlueprint, EventType, Postback};
pub use chain::{ArchivalHandler, ThreadAction, ThreadEventHandler};
pub use config::ChatConfig;
pub use context::{ConnectionContext, Environment};
pub use events::ThreadEvent;
pub use fields::{FieldDefinition, FieldDefinitionValidator};
pub use machine::{Subscription, ThreadStateMachine};
pub use orchestrator::{ConnectionState, ReconnectionOrchestrator};
pub use router::EventRouter;
pub use session::ChatSession;
pub use storage::{MemoryStorage, StorageKey, ValueStorage};
pub use survey::{PreChatSurvey, PreChatSurveyResponse};
pub use thread::{Agent, ChatThread, CustomField, Message, ThreadState};
pub use upload::AttachmentUploadCache;

// Re-export transport types
pub use chatwire_transport::{TransportEvent, TransportHandle};

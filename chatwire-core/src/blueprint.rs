// ABOUTME: Wire envelopes: inbound EventBlueprint classification and outbound frames.
// ABOUTME: The resolved event type prefers the explicit type over the postback type.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Every event type the kernel knows, inbound and outbound.
///
/// Unrecognised type strings decode to `Unknown` so an envelope from a newer
/// server still parses and is simply dropped by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    // Inbound
    ConsumerAuthorized,
    CustomerAuthorizationFailed,
    CustomerReconnected,
    TokenRefreshed,
    TokenRefreshingFailed,
    MessageCreated,
    MoreMessagesLoaded,
    ThreadRecovered,
    ThreadListFetched,
    ThreadMetadataLoaded,
    ThreadArchived,
    ThreadUpdated,
    AssignedAgentChanged,
    SenderTypingStarted,
    SenderTypingEnded,
    SetPositionInQueue,
    ContactStatusChanged,
    LivechatRecovered,
    // Outbound
    AuthorizeCustomer,
    ReconnectCustomer,
    SendMessage,
    LoadMoreMessages,
    RecoverThread,
    FetchThreadList,
    LoadThreadMetadata,
    ArchiveThread,
    UpdateThread,
    MessageSeenByCustomer,
    SetContactCustomFields,
    EndContact,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Postback {
    #[serde(rename = "type", default)]
    pub event_type: Option<EventType>,
    #[serde(default)]
    pub data: Value,
}

/// Inbound envelope as received on the socket
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBlueprint {
    #[serde(default, alias = "type")]
    pub event: Option<EventType>,
    #[serde(default)]
    pub postback: Option<Postback>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub event_id: Option<String>,
}

impl EventBlueprint {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Explicit type, else postback type, else none. `Unknown` counts as absent.
    pub fn any_type(&self) -> Option<EventType> {
        self.event
            .filter(|t| *t != EventType::Unknown)
            .or_else(|| self.postback.as_ref().and_then(|p| p.event_type))
            .filter(|t| *t != EventType::Unknown)
    }

    /// Postback data when present, otherwise the top-level data
    pub fn payload(&self) -> &Value {
        match &self.postback {
            Some(p) if !p.data.is_null() => &p.data,
            _ => &self.data,
        }
    }

    /// Loopback frame announcing that a thread changed locally
    pub fn thread_updated(thread_id: Uuid) -> String {
        json!({
            "postback": {
                "type": EventType::ThreadUpdated,
                "data": {"thread": {"id": thread_id}},
            }
        })
        .to_string()
    }
}

/// Outbound envelope sent to the server
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundFrame {
    pub event_id: Uuid,
    pub action: &'static str,
    pub postback: Postback,
}

impl OutboundFrame {
    pub const ACTION: &'static str = "chatWindowEvent";

    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            action: Self::ACTION,
            postback: Postback {
                event_type: Some(event_type),
                data,
            },
        }
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

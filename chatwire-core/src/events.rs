// ABOUTME: Typed thread events decoded from inbound envelope payloads.
// ABOUTME: Each variant maps to one or more ThreadStateMachine mutations.

use crate::blueprint::EventType;
use crate::error::Result;
use crate::thread::{Agent, CustomField, Message};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum ThreadEvent {
    MessageCreated {
        thread_id: Uuid,
        message: Message,
    },
    Recovered {
        thread_id: Uuid,
        name: Option<String>,
        messages: Vec<Message>,
        agent: Option<Agent>,
        scroll_token: String,
        fields: Vec<CustomField>,
    },
    MoreMessagesLoaded {
        thread_id: Uuid,
        messages: Vec<Message>,
        scroll_token: String,
    },
    MetadataLoaded {
        thread_id: Uuid,
        name: Option<String>,
    },
    Archived {
        thread_id: Uuid,
    },
    Updated {
        thread_id: Uuid,
        name: Option<String>,
    },
    AgentChanged {
        thread_id: Uuid,
        agent: Option<Agent>,
    },
    AgentTyping {
        thread_id: Uuid,
        typing: bool,
    },
    PositionInQueue {
        thread_id: Uuid,
        position: u32,
        agent_available: Option<bool>,
    },
    ContactClosed {
        thread_id: Uuid,
    },
}

#[derive(Deserialize)]
struct ThreadRef {
    #[serde(alias = "idOnExternalPlatform")]
    id: Uuid,
    #[serde(default, alias = "threadName")]
    name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageCreatedWire {
    message: Message,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecoveredWire {
    thread: ThreadRef,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    inbox_assignee: Option<Agent>,
    #[serde(default)]
    scroll_token: String,
    #[serde(default)]
    custom_fields: Vec<CustomField>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoreMessagesWire {
    thread_id: Uuid,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    scroll_token: String,
}

#[derive(Deserialize)]
struct ThreadWire {
    thread: ThreadRef,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentChangedWire {
    thread_id: Uuid,
    #[serde(default)]
    inbox_assignee: Option<Agent>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadIdWire {
    thread_id: Uuid,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueWire {
    thread_id: Uuid,
    position_in_queue: u32,
    #[serde(default)]
    is_agent_available: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContactStatusWire {
    thread_id: Uuid,
    status: String,
}

impl ThreadEvent {
    /// Decode the payload of a thread-scoped event.
    ///
    /// Returns `Ok(None)` for event types that do not touch a thread.
    pub fn decode(event_type: EventType, payload: &Value) -> Result<Option<Self>> {
        let event = match event_type {
            EventType::MessageCreated => {
                let wire: MessageCreatedWire = serde_json::from_value(payload.clone())?;
                Self::MessageCreated {
                    thread_id: wire.message.thread_id,
                    message: wire.message,
                }
            }
            EventType::ThreadRecovered | EventType::LivechatRecovered => {
                let wire: RecoveredWire = serde_json::from_value(payload.clone())?;
                Self::Recovered {
                    thread_id: wire.thread.id,
                    name: wire.thread.name,
                    messages: wire.messages,
                    agent: wire.inbox_assignee,
                    scroll_token: wire.scroll_token,
                    fields: wire.custom_fields,
                }
            }
            EventType::MoreMessagesLoaded => {
                let wire: MoreMessagesWire = serde_json::from_value(payload.clone())?;
                Self::MoreMessagesLoaded {
                    thread_id: wire.thread_id,
                    messages: wire.messages,
                    scroll_token: wire.scroll_token,
                }
            }
            EventType::ThreadMetadataLoaded => {
                let wire: ThreadWire = serde_json::from_value(payload.clone())?;
                Self::MetadataLoaded {
                    thread_id: wire.thread.id,
                    name: wire.thread.name,
                }
            }
            EventType::ThreadArchived => {
                let wire: ThreadWire = serde_json::from_value(payload.clone())?;
                Self::Archived {
                    thread_id: wire.thread.id,
                }
            }
            EventType::ThreadUpdated => {
                let wire: ThreadWire = serde_json::from_value(payload.clone())?;
                Self::Updated {
                    thread_id: wire.thread.id,
                    name: wire.thread.name,
                }
            }
            EventType::AssignedAgentChanged => {
                let wire: AgentChangedWire = serde_json::from_value(payload.clone())?;
                Self::AgentChanged {
                    thread_id: wire.thread_id,
                    agent: wire.inbox_assignee,
                }
            }
            EventType::SenderTypingStarted | EventType::SenderTypingEnded => {
                let wire: ThreadIdWire = serde_json::from_value(payload.clone())?;
                Self::AgentTyping {
                    thread_id: wire.thread_id,
                    typing: event_type == EventType::SenderTypingStarted,
                }
            }
            EventType::SetPositionInQueue => {
                let wire: QueueWire = serde_json::from_value(payload.clone())?;
                Self::PositionInQueue {
                    thread_id: wire.thread_id,
                    position: wire.position_in_queue,
                    agent_available: wire.is_agent_available,
                }
            }
            EventType::ContactStatusChanged => {
                let wire: ContactStatusWire = serde_json::from_value(payload.clone())?;
                if !wire.status.eq_ignore_ascii_case("closed") {
                    return Ok(None);
                }
                Self::ContactClosed {
                    thread_id: wire.thread_id,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn thread_id(&self) -> Uuid {
        match self {
            Self::MessageCreated { thread_id, .. }
            | Self::Recovered { thread_id, .. }
            | Self::MoreMessagesLoaded { thread_id, .. }
            | Self::MetadataLoaded { thread_id, .. }
            | Self::Archived { thread_id }
            | Self::Updated { thread_id, .. }
            | Self::AgentChanged { thread_id, .. }
            | Self::AgentTyping { thread_id, .. }
            | Self::PositionInQueue { thread_id, .. }
            | Self::ContactClosed { thread_id } => *thread_id,
        }
    }
}

/// One entry of a fetched thread list
#[derive(Debug, Clone, Deserialize)]
pub struct ThreadSummary {
    #[serde(alias = "idOnExternalPlatform")]
    pub id: Uuid,
    #[serde(default, alias = "threadName")]
    pub name: Option<String>,
}

/// Payload of `ThreadListFetched`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThreadList {
    #[serde(default)]
    pub threads: Vec<ThreadSummary>,
}

/// The event types that decode into a [`ThreadEvent`]
pub const THREAD_EVENT_TYPES: [EventType; 12] = [
    EventType::MessageCreated,
    EventType::ThreadRecovered,
    EventType::LivechatRecovered,
    EventType::MoreMessagesLoaded,
    EventType::ThreadMetadataLoaded,
    EventType::ThreadArchived,
    EventType::ThreadUpdated,
    EventType::AssignedAgentChanged,
    EventType::SenderTypingStarted,
    EventType::SenderTypingEnded,
    EventType::SetPositionInQueue,
    EventType::ContactStatusChanged,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;
    use serde_json::json;

    #[test]
    fn test_decode_recovered() {
        let id = Uuid::new_v4();
        let payload = json!({
            "thread": {"id": id, "threadName": "Billing"},
            "messages": [],
            "inboxAssignee": {"id": 3, "firstName": "Grace", "lastName": "Hopper"},
            "scrollToken": "abc",
            "customFields": [{"id": "plan", "value": "pro", "updatedAt": "2024-01-01T00:00:00Z"}]
        });
        let event = ThreadEvent::decode(EventType::ThreadRecovered, &payload)
            .unwrap()
            .unwrap();
        match event {
            ThreadEvent::Recovered {
                thread_id,
                name,
                agent,
                scroll_token,
                fields,
                ..
            } => {
                assert_eq!(thread_id, id);
                assert_eq!(name.as_deref(), Some("Billing"));
                assert_eq!(agent.unwrap().full_name(), "Grace Hopper");
                assert_eq!(scroll_token, "abc");
                assert_eq!(fields.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_recovered_with_external_thread_id() {
        let id = Uuid::new_v4();
        let payload = json!({
            "thread": {"idOnExternalPlatform": id},
            "messages": []
        });
        let event = ThreadEvent::decode(EventType::ThreadRecovered, &payload)
            .unwrap()
            .unwrap();
        match event {
            ThreadEvent::Recovered { thread_id, name, .. } => {
                assert_eq!(thread_id, id);
                assert!(name.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_typing_and_queue() {
        let id = Uuid::new_v4();
        let typing = ThreadEvent::decode(EventType::SenderTypingEnded, &json!({"threadId": id}))
            .unwrap()
            .unwrap();
        assert_eq!(typing, ThreadEvent::AgentTyping { thread_id: id, typing: false });

        let queue = ThreadEvent::decode(
            EventType::SetPositionInQueue,
            &json!({"threadId": id, "positionInQueue": 4, "isAgentAvailable": true}),
        )
        .unwrap()
        .unwrap();
        assert_eq!(queue.thread_id(), id);
    }

    #[test]
    fn test_open_contact_status_is_ignored() {
        let id = Uuid::new_v4();
        let decoded = ThreadEvent::decode(
            EventType::ContactStatusChanged,
            &json!({"threadId": id, "status": "open"}),
        )
        .unwrap();
        assert_eq!(decoded, None);
    }

    #[test]
    fn test_non_thread_types_decode_to_none() {
        assert_eq!(
            ThreadEvent::decode(EventType::ConsumerAuthorized, &json!({})).unwrap(),
            None
        );
    }

    #[test]
    fn test_bad_payload_is_malformed_frame() {
        let err = ThreadEvent::decode(EventType::ThreadArchived, &json!({"thread": 5})).unwrap_err();
        assert!(matches!(err, ChatError::MalformedFrame(_)));
    }
}

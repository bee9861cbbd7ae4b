// ABOUTME: Chat thread data model: thread snapshot, messages, agents and custom fields.
// ABOUTME: Snapshots are plain values; only the ThreadStateMachine produces new ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Lifecycle tag of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadState {
    /// Created locally, not yet known to the server
    Pending,
    /// Server acknowledged the thread exists
    Received,
    /// Metadata fetched
    Loaded,
    /// Details recovered, usable
    Ready,
    /// Terminal
    Closed,
}

impl ThreadState {
    /// Whether `self -> next` is a defined edge. Staying put is handled by the caller.
    pub fn can_transition_to(self, next: ThreadState) -> bool {
        use ThreadState::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Received)
                | (Received, Loaded)
                | (Loaded, Ready)
                | (Pending | Received | Loaded | Ready, Closed)
        )
    }

    pub fn is_closed(self) -> bool {
        self == ThreadState::Closed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    /// Agent to customer
    Inbound,
    /// Customer to agent
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum MessageContent {
    Text {
        text: String,
    },
    Attachment {
        file_url: String,
        file_name: String,
        mime_type: String,
    },
    /// Rich content rendered by the integrator; kept opaque
    Plugin {
        #[serde(default)]
        text: String,
        payload: serde_json::Value,
    },
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAuthor {
    pub id: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub image_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub direction: MessageDirection,
    pub content: MessageContent,
    #[serde(default)]
    pub author: Option<MessageAuthor>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub seen_by_customer: bool,
}

impl Message {
    /// A customer-authored text message created now
    pub fn outbound_text(thread_id: Uuid, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            thread_id,
            direction: MessageDirection::Outbound,
            content: MessageContent::text(text),
            author: None,
            created_at: Utc::now(),
            seen_by_customer: true,
        }
    }

    /// An agent-side text message created now
    pub fn inbound_text(thread_id: Uuid, text: impl Into<String>) -> Self {
        Self {
            direction: MessageDirection::Inbound,
            seen_by_customer: false,
            ..Self::outbound_text(thread_id, text)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: i64,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub is_bot_user: bool,
    #[serde(default)]
    pub is_survey_user: bool,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub is_typing: bool,
}

impl Agent {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomField {
    pub id: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

impl CustomField {
    pub fn new(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
            updated_at: Utc::now(),
        }
    }
}

/// Custom fields keyed by id. Writing an existing id replaces its value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CustomFields(BTreeMap<String, CustomField>);

impl CustomFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, field: CustomField) {
        self.0.insert(field.id.clone(), field);
    }

    pub fn get(&self, id: &str) -> Option<&CustomField> {
        self.0.get(id)
    }

    pub fn value(&self, id: &str) -> Option<&str> {
        self.0.get(id).map(|f| f.value.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CustomField> {
        self.0.values()
    }
}

impl FromIterator<CustomField> for CustomFields {
    fn from_iter<I: IntoIterator<Item = CustomField>>(iter: I) -> Self {
        let mut fields = Self::new();
        for field in iter {
            fields.upsert(field);
        }
        fields
    }
}

/// Immutable snapshot of one chat thread
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatThread {
    pub id: Uuid,
    pub name: Option<String>,
    pub messages: Vec<Message>,
    pub assigned_agent: Option<Agent>,
    pub can_add_more_messages: bool,
    pub scroll_token: String,
    pub fields: CustomFields,
    pub state: ThreadState,
    pub position_in_queue: Option<u32>,
    pub agent_available: Option<bool>,
    pub agent_typing: bool,
}

impl ChatThread {
    /// Empty thread in the given state
    pub fn new(id: Uuid, state: ThreadState) -> Self {
        Self {
            id,
            name: None,
            messages: Vec::new(),
            assigned_agent: None,
            can_add_more_messages: true,
            scroll_token: String::new(),
            fields: CustomFields::new(),
            state,
            position_in_queue: None,
            agent_available: None,
            agent_typing: false,
        }
    }

    pub fn has_more_messages_to_load(&self) -> bool {
        !self.scroll_token.is_empty()
    }

    pub fn unread_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.direction == MessageDirection::Inbound && !m.seen_by_customer)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use ThreadState::*;
        assert!(Pending.can_transition_to(Ready));
        assert!(Pending.can_transition_to(Received));
        assert!(Received.can_transition_to(Loaded));
        assert!(Loaded.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Closed));
        assert!(Received.can_transition_to(Closed));

        assert!(!Received.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Pending));
        assert!(!Closed.can_transition_to(Ready));
        assert!(!Closed.can_transition_to(Closed));
    }

    #[test]
    fn test_copy_with_no_changes_is_equal() {
        let mut thread = ChatThread::new(Uuid::new_v4(), ThreadState::Ready);
        thread.name = Some("Support".into());
        thread.scroll_token = "token".into();
        thread.messages.push(Message::outbound_text(thread.id, "hello"));
        thread.fields.upsert(CustomField::new("email", "a@b.co"));

        let copy = ChatThread { ..thread.clone() };
        assert_eq!(copy, thread);
    }

    #[test]
    fn test_has_more_messages_follows_scroll_token() {
        let mut thread = ChatThread::new(Uuid::new_v4(), ThreadState::Ready);
        assert!(!thread.has_more_messages_to_load());
        thread.scroll_token = "next".into();
        assert!(thread.has_more_messages_to_load());
    }

    #[test]
    fn test_custom_fields_latest_write_wins() {
        let mut fields = CustomFields::new();
        fields.upsert(CustomField::new("plan", "free"));
        fields.upsert(CustomField::new("plan", "pro"));
        fields.upsert(CustomField::new("age", "42"));

        assert_eq!(fields.len(), 2);
        assert_eq!(fields.value("plan"), Some("pro"));
        let ids: Vec<_> = fields.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["age", "plan"]);
    }

    #[test]
    fn test_agent_full_name_is_trimmed() {
        let agent: Agent = serde_json::from_value(serde_json::json!({
            "id": 7,
            "firstName": "Ada",
            "lastName": ""
        }))
        .unwrap();
        assert_eq!(agent.full_name(), "Ada");
        assert!(!agent.is_bot_user);
    }

    #[test]
    fn test_message_wire_shape() {
        let thread_id = Uuid::new_v4();
        let json = serde_json::json!({
            "id": Uuid::new_v4(),
            "threadId": thread_id,
            "direction": "inbound",
            "content": {"type": "attachment", "fileUrl": "https://f/x.png", "fileName": "x.png", "mimeType": "image/png"},
            "createdAt": "2024-01-01T00:00:00Z"
        });
        let message: Message = serde_json::from_value(json).unwrap();
        assert_eq!(message.thread_id, thread_id);
        assert!(matches!(message.content, MessageContent::Attachment { .. }));
        assert!(!message.seen_by_customer);
    }
}

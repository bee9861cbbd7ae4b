// ABOUTME: ValueStorage contract for persisted session values plus an in-memory implementation.
// ABOUTME: Typed accessors sit on the trait; backends only implement raw get/set by key.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Persisted keys, namespaced under `chatwire.`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
    AuthToken,
    /// Epoch millis
    AuthTokenExpiry,
    VisitorId,
    CustomerId,
    WelcomeMessage,
}

impl StorageKey {
    pub const ALL: [StorageKey; 5] = [
        StorageKey::AuthToken,
        StorageKey::AuthTokenExpiry,
        StorageKey::VisitorId,
        StorageKey::CustomerId,
        StorageKey::WelcomeMessage,
    ];

    pub fn key(self) -> &'static str {
        match self {
            StorageKey::AuthToken => "chatwire.auth_token",
            StorageKey::AuthTokenExpiry => "chatwire.auth_token_expiry",
            StorageKey::VisitorId => "chatwire.visitor_id",
            StorageKey::CustomerId => "chatwire.customer_id",
            StorageKey::WelcomeMessage => "chatwire.welcome_message",
        }
    }
}

/// Key-value persistence supplied by the integrator.
///
/// Implementations must be safe to call from any task. Writing `None`
/// removes the key.
pub trait ValueStorage: Send + Sync {
    fn get(&self, key: StorageKey) -> Option<String>;

    fn set(&self, key: StorageKey, value: Option<String>);

    fn clear_all(&self);

    /// Per-process id; never written to the backing store
    fn destination_id(&self) -> Uuid;

    fn auth_token(&self) -> Option<String> {
        self.get(StorageKey::AuthToken)
    }

    fn set_auth_token(&self, token: Option<String>) {
        self.set(StorageKey::AuthToken, token);
    }

    fn auth_token_expiry(&self) -> Option<DateTime<Utc>> {
        let raw = self.get(StorageKey::AuthTokenExpiry)?;
        let millis = raw.parse::<i64>().ok()?;
        Utc.timestamp_millis_opt(millis).single()
    }

    fn set_auth_token_expiry(&self, expiry: Option<DateTime<Utc>>) {
        self.set(
            StorageKey::AuthTokenExpiry,
            expiry.map(|e| e.timestamp_millis().to_string()),
        );
    }

    /// Stable visitor id, generated and persisted on first read
    fn visitor_id(&self) -> Uuid {
        if let Some(id) = self
            .get(StorageKey::VisitorId)
            .and_then(|raw| Uuid::parse_str(&raw).ok())
        {
            return id;
        }
        let id = Uuid::new_v4();
        tracing::debug!(visitor_id = %id, "Generated new visitor id");
        self.set(StorageKey::VisitorId, Some(id.to_string()));
        id
    }

    fn customer_id(&self) -> Option<String> {
        self.get(StorageKey::CustomerId)
    }

    fn set_customer_id(&self, customer_id: Option<String>) {
        self.set(StorageKey::CustomerId, customer_id);
    }

    fn welcome_message(&self) -> String {
        self.get(StorageKey::WelcomeMessage).unwrap_or_default()
    }

    fn set_welcome_message(&self, message: &str) {
        let value = (!message.is_empty()).then(|| message.to_string());
        self.set(StorageKey::WelcomeMessage, value);
    }
}

/// Volatile storage, used by tests and short-lived sessions
#[derive(Debug)]
pub struct MemoryStorage {
    values: Mutex<HashMap<StorageKey, String>>,
    destination_id: Uuid,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            destination_id: Uuid::new_v4(),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueStorage for MemoryStorage {
    fn get(&self, key: StorageKey) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()
    }

    fn set(&self, key: StorageKey, value: Option<String>) {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        match value {
            Some(v) => values.insert(key, v),
            None => values.remove(&key),
        };
    }

    fn clear_all(&self) {
        self.values.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn destination_id(&self) -> Uuid {
        self.destination_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visitor_id_is_stable() {
        let storage = MemoryStorage::new();
        let first = storage.visitor_id();
        assert_eq!(storage.visitor_id(), first);
        assert_eq!(storage.get(StorageKey::VisitorId), Some(first.to_string()));
    }

    #[test]
    fn test_expiry_round_trips_through_millis() {
        let storage = MemoryStorage::new();
        let expiry = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        storage.set_auth_token_expiry(Some(expiry));
        assert_eq!(
            storage.get(StorageKey::AuthTokenExpiry).as_deref(),
            Some("1700000000123")
        );
        assert_eq!(storage.auth_token_expiry(), Some(expiry));
    }

    #[test]
    fn test_garbage_expiry_reads_as_none() {
        let storage = MemoryStorage::new();
        storage.set(StorageKey::AuthTokenExpiry, Some("tomorrow".into()));
        assert_eq!(storage.auth_token_expiry(), None);
    }

    #[test]
    fn test_welcome_message_defaults_empty() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.welcome_message(), "");
        storage.set_welcome_message("Hi there");
        assert_eq!(storage.welcome_message(), "Hi there");
        storage.set_welcome_message("");
        assert_eq!(storage.get(StorageKey::WelcomeMessage), None);
    }

    #[test]
    fn test_clear_all_keeps_destination() {
        let storage = MemoryStorage::new();
        let destination = storage.destination_id();
        storage.set_auth_token(Some("t".into()));
        storage.set_customer_id(Some("c".into()));
        storage.clear_all();
        assert_eq!(storage.auth_token(), None);
        assert_eq!(storage.customer_id(), None);
        assert_eq!(storage.destination_id(), destination);
    }
}

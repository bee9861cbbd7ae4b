// ABOUTME: Connection identity: brand, channel, visitor, customer and environment.
// ABOUTME: ConnectionContext is immutable; variants are produced by copying.

use crate::error::{ChatError, Result};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Endpoints of one deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub name: String,
    pub chat_url: String,
    pub socket_url: String,
}

impl Environment {
    pub fn from_config(config: &crate::config::EnvironmentConfig) -> Self {
        Self {
            name: config.name.clone(),
            chat_url: config.chat_url.clone(),
            socket_url: config.socket_url.clone(),
        }
    }

    /// Socket URL with the identity query for one visitor
    pub fn socket_endpoint(&self, brand_id: i64, channel_id: &str, visitor_id: Uuid) -> Result<String> {
        let base = self.socket_url.trim_end_matches('/');
        if !(base.starts_with("ws://") || base.starts_with("wss://")) {
            return Err(ChatError::MalformedUrl(self.socket_url.clone()));
        }
        if base.contains('?') || channel_id.chars().any(|c| !c.is_ascii_alphanumeric() && c != '_' && c != '-') {
            return Err(ChatError::MalformedUrl(format!("{}?channelId={}", base, channel_id)));
        }
        Ok(format!(
            "{}/?brandId={}&channelId={}&sdkPlatform=rust&visitorId={}",
            base, brand_id, channel_id, visitor_id
        ))
    }

    /// REST base for one brand/channel pair
    pub fn channel_url(&self, brand_id: i64, channel_id: &str) -> String {
        format!(
            "{}/brand/{}/channel/{}",
            self.chat_url.trim_end_matches('/'),
            brand_id,
            channel_id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub brand_id: i64,
    pub channel_id: String,
    pub first_name: String,
    pub last_name: String,
    pub customer_id: Option<String>,
    pub visitor_id: Uuid,
    /// Per-process id, never persisted
    pub destination_id: Uuid,
    pub environment: Environment,
}

impl ConnectionContext {
    pub fn new(
        brand_id: i64,
        channel_id: impl Into<String>,
        visitor_id: Uuid,
        destination_id: Uuid,
        environment: Environment,
    ) -> Self {
        Self {
            brand_id,
            channel_id: channel_id.into(),
            first_name: String::new(),
            last_name: String::new(),
            customer_id: None,
            visitor_id,
            destination_id,
            environment,
        }
    }

    pub fn with_customer_id(&self, customer_id: Option<String>) -> Self {
        Self {
            customer_id,
            ..self.clone()
        }
    }

    pub fn with_names(&self, first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
            ..self.clone()
        }
    }

    pub fn socket_endpoint(&self) -> Result<String> {
        self.environment
            .socket_endpoint(self.brand_id, &self.channel_id, self.visitor_id)
    }

    /// Identity block carried in every outbound envelope
    pub fn identity(&self) -> serde_json::Value {
        serde_json::json!({
            "brand": {"id": self.brand_id},
            "channel": {"id": self.channel_id},
            "customer": {
                "idOnExternalPlatform": self.customer_id.clone().unwrap_or_else(|| self.visitor_id.to_string()),
                "firstName": self.first_name,
                "lastName": self.last_name,
            },
            "visitor": {"id": self.visitor_id},
            "destination": {"id": self.destination_id},
        })
    }
}

/// Shared slot holding the current context snapshot.
///
/// Readers take a clone; writers swap the whole value.
#[derive(Debug, Clone)]
pub struct SharedContext(Arc<RwLock<ConnectionContext>>);

impl SharedContext {
    pub fn new(context: ConnectionContext) -> Self {
        Self(Arc::new(RwLock::new(context)))
    }

    pub fn get(&self) -> ConnectionContext {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn replace(&self, context: ConnectionContext) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = context;
    }
}

// ABOUTME: Authorization contract and its socket implementation.
// ABOUTME: Requests go out as frames; replies come back through the router into a ReplyWaiter.

use crate::api::ChatApi;
use crate::blueprint::{EventType, OutboundFrame};
use crate::context::ConnectionContext;
use crate::error::{ChatError, ErrorKind, Result};
use crate::router::{EventRouter, HandlerId};
use crate::worker::OutboundQueue;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Visitor identity only
    #[default]
    Anonymous,
    /// Requires an authorization code from the integrator's login flow
    OAuth,
}

impl FromStr for AuthMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anonymous" => Ok(AuthMode::Anonymous),
            "oauth" => Ok(AuthMode::OAuth),
            other => anyhow::bail!("Unknown auth mode '{}', expected anonymous or oauth", other),
        }
    }
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMode::Anonymous => write!(f, "anonymous"),
            AuthMode::OAuth => write!(f, "oauth"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    /// Usable at `now` if it outlives the lookahead window. Unknown expiry counts as usable.
    pub fn is_fresh(&self, now: DateTime<Utc>, lookahead: chrono::Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at > now + lookahead,
            None => true,
        }
    }

    fn from_wire(value: &Value) -> Option<Self> {
        let token = value.get("token")?.as_str()?.to_string();
        if token.is_empty() {
            return None;
        }
        let expires_at = value
            .get("expiresIn")
            .and_then(Value::as_i64)
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        Some(Self { token, expires_at })
    }
}

#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub mode: AuthMode,
    pub authorization_code: Option<String>,
    pub code_verifier: Option<String>,
    pub context: ConnectionContext,
}

/// Result of a successful authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub customer_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub access_token: Option<AccessToken>,
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Full authorization. Failures are mode-specific authorization errors.
    async fn authorize(&self, request: &AuthorizationRequest) -> Result<Authorization>;

    /// Resume with a stored token. A rejected token is `ChatError::TokenRejected`.
    async fn reconnect(&self, context: &ConnectionContext, token: &AccessToken) -> Result<AccessToken>;

    /// Link an authenticated customer to the existing visitor
    async fn associate(&self, context: &ConnectionContext, customer_id: &str) -> Result<()>;
}

/// Reply types the socket authorizer waits for
pub const REPLY_TYPES: [EventType; 5] = [
    EventType::ConsumerAuthorized,
    EventType::CustomerAuthorizationFailed,
    EventType::CustomerReconnected,
    EventType::TokenRefreshed,
    EventType::TokenRefreshingFailed,
];

struct PendingReply {
    types: Vec<EventType>,
    tx: oneshot::Sender<(EventType, Value)>,
}

/// Matches request/reply pairs over the event stream.
///
/// Call `expect` before sending the request so a fast reply is not missed.
#[derive(Default)]
pub struct ReplyWaiter {
    pending: Mutex<Vec<PendingReply>>,
}

impl ReplyWaiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register on `router` for every reply type
    pub fn install(self: &Arc<Self>, router: &EventRouter) -> Vec<HandlerId> {
        REPLY_TYPES
            .iter()
            .map(|&event_type| {
                let waiter = Arc::clone(self);
                router.register(event_type, move |payload: &Value| -> anyhow::Result<()> {
                    waiter.deliver(event_type, payload);
                    Ok(())
                })
            })
            .collect()
    }

    pub fn expect(&self, types: &[EventType]) -> oneshot::Receiver<(EventType, Value)> {
        let (tx, rx) = oneshot::channel();
        self.lock().push(PendingReply {
            types: types.to_vec(),
            tx,
        });
        rx
    }

    /// Hand the payload to the oldest live waiter for this type
    pub fn deliver(&self, event_type: EventType, payload: &Value) -> bool {
        let mut pending = self.lock();
        pending.retain(|p| !p.tx.is_closed());
        let Some(index) = pending.iter().position(|p| p.types.contains(&event_type)) else {
            tracing::debug!(event_type = ?event_type, "Reply without a waiter");
            return false;
        };
        let waiter = pending.remove(index);
        waiter.tx.send((event_type, payload.clone())).is_ok()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PendingReply>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Authorizer speaking the socket protocol
pub struct SocketAuthorizer {
    outbound: OutboundQueue,
    replies: Arc<ReplyWaiter>,
    api: Arc<dyn ChatApi>,
}

impl SocketAuthorizer {
    pub fn new(outbound: OutboundQueue, replies: Arc<ReplyWaiter>, api: Arc<dyn ChatApi>) -> Self {
        Self {
            outbound,
            replies,
            api,
        }
    }

    async fn request(
        &self,
        event_type: EventType,
        data: Value,
        replies: &[EventType],
    ) -> Result<(EventType, Value)> {
        let reply = self.replies.expect(replies);
        let frame = OutboundFrame::new(event_type, data).to_text()?;
        self.outbound.send(frame).await?;
        reply
            .await
            .map_err(|_| ChatError::SocketDropped(format!("no reply to {:?}", event_type)))
    }
}

fn failure_reason(payload: &Value) -> String {
    payload
        .get("errorCode")
        .or_else(|| payload.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("rejected by server")
        .to_string()
}

fn with_identity(context: &ConnectionContext, extra: Value) -> Value {
    let mut data = context.identity();
    if let (Value::Object(map), Value::Object(extra)) = (&mut data, extra) {
        map.extend(extra);
    }
    data
}

#[async_trait]
impl Authorizer for SocketAuthorizer {
    async fn authorize(&self, request: &AuthorizationRequest) -> Result<Authorization> {
        let data = with_identity(
            &request.context,
            json!({
                "authorization": {
                    "authorizationCode": request.authorization_code.clone().unwrap_or_default(),
                    "codeVerifier": request.code_verifier.clone().unwrap_or_default(),
                }
            }),
        );
        let (reply, payload) = self
            .request(
                EventType::AuthorizeCustomer,
                data,
                &[EventType::ConsumerAuthorized, EventType::CustomerAuthorizationFailed],
            )
            .await?;

        if reply != EventType::ConsumerAuthorized {
            let reason = failure_reason(&payload);
            return Err(match request.mode {
                AuthMode::Anonymous => ChatError::AnonymousAuthorizationFailed(reason),
                AuthMode::OAuth => ChatError::OAuthAuthorizationFailed(reason),
            });
        }

        let identity = payload.get("consumerIdentity").cloned().unwrap_or(Value::Null);
        let text = |key: &str| identity.get(key).and_then(Value::as_str).map(str::to_string);
        Ok(Authorization {
            customer_id: text("idOnExternalPlatform"),
            first_name: text("firstName"),
            last_name: text("lastName"),
            access_token: payload.get("accessToken").and_then(AccessToken::from_wire),
        })
    }

    async fn reconnect(&self, context: &ConnectionContext, token: &AccessToken) -> Result<AccessToken> {
        let data = with_identity(context, json!({"accessToken": {"token": token.token}}));
        let (reply, payload) = self
            .request(
                EventType::ReconnectCustomer,
                data,
                &[
                    EventType::CustomerReconnected,
                    EventType::TokenRefreshed,
                    EventType::TokenRefreshingFailed,
                ],
            )
            .await?;

        if reply == EventType::TokenRefreshingFailed {
            return Err(ChatError::TokenRejected(failure_reason(&payload)));
        }
        Ok(payload
            .get("accessToken")
            .and_then(AccessToken::from_wire)
            .unwrap_or_else(|| token.clone()))
    }

    async fn associate(&self, context: &ConnectionContext, customer_id: &str) -> Result<()> {
        match self
            .api
            .associate_visitor(context.brand_id, context.visitor_id, customer_id)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::Transport => Err(e),
            Err(e) => Err(ChatError::CustomerAssociationFailed(e.to_string())),
        }
    }
}

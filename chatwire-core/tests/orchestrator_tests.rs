// ABOUTME: Integration tests for connect, authorization, association and reconnection
// ABOUTME: Uses a scripted Authorizer and the mock transport; backoff runs on paused time

use async_trait::async_trait;
use chatwire_core::auth::{AccessToken, Authorization, AuthorizationRequest};
use chatwire_core::context::SharedContext;
use chatwire_core::orchestrator::OrchestratorSettings;
use chatwire_core::reconnect::BackoffConfig;
use chatwire_core::worker::{ConnectionDrop, InboundQueue};
use chatwire_core::{
    AuthMode, Authorizer, ChatError, ConnectionContext, ConnectionState, Environment, ErrorKind, EventRouter,
    MemoryStorage, ReconnectionOrchestrator, ValueStorage,
};
use chatwire_transport::backends::mock::{MockController, MockTransport};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Authorizer with queued results; unscripted calls succeed
#[derive(Default)]
struct ScriptedAuthorizer {
    authorize_results: Mutex<VecDeque<chatwire_core::Result<Authorization>>>,
    reconnect_results: Mutex<VecDeque<chatwire_core::Result<AccessToken>>>,
    associate_results: Mutex<VecDeque<chatwire_core::Result<()>>>,
    authorize_requests: Mutex<Vec<AuthorizationRequest>>,
    reconnect_tokens: Mutex<Vec<String>>,
    associated: Mutex<Vec<String>>,
}

impl ScriptedAuthorizer {
    fn authorized(customer_id: Option<&str>, token: Option<&str>) -> Authorization {
        Authorization {
            customer_id: customer_id.map(str::to_string),
            first_name: Some("Ada".into()),
            last_name: Some("Lovelace".into()),
            access_token: token.map(|t| AccessToken {
                token: t.to_string(),
                expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
            }),
        }
    }

    fn push_authorize(&self, result: chatwire_core::Result<Authorization>) {
        self.authorize_results.lock().unwrap().push_back(result);
    }

    fn push_reconnect(&self, result: chatwire_core::Result<AccessToken>) {
        self.reconnect_results.lock().unwrap().push_back(result);
    }

    fn push_associate(&self, result: chatwire_core::Result<()>) {
        self.associate_results.lock().unwrap().push_back(result);
    }

    fn authorize_count(&self) -> usize {
        self.authorize_requests.lock().unwrap().len()
    }

    fn reconnect_count(&self) -> usize {
        self.reconnect_tokens.lock().unwrap().len()
    }
}

#[async_trait]
impl Authorizer for ScriptedAuthorizer {
    async fn authorize(&self, request: &AuthorizationRequest) -> chatwire_core::Result<Authorization> {
        self.authorize_requests.lock().unwrap().push(request.clone());
        let scripted = self.authorize_results.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(Self::authorized(Some("customer-1"), Some("token-1"))))
    }

    async fn reconnect(&self, _context: &ConnectionContext, token: &AccessToken) -> chatwire_core::Result<AccessToken> {
        self.reconnect_tokens.lock().unwrap().push(token.token.clone());
        let scripted = self.reconnect_results.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(token.clone()))
    }

    async fn associate(&self, _context: &ConnectionContext, customer_id: &str) -> chatwire_core::Result<()> {
        self.associated.lock().unwrap().push(customer_id.to_string());
        let scripted = self.associate_results.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(()))
    }
}

struct Harness {
    orchestrator: ReconnectionOrchestrator,
    drops: mpsc::UnboundedReceiver<ConnectionDrop>,
    authorizer: Arc<ScriptedAuthorizer>,
    storage: Arc<MemoryStorage>,
    context: SharedContext,
    controller: MockController,
}

fn settings(mode: AuthMode) -> OrchestratorSettings {
    OrchestratorSettings {
        mode,
        network_timeout: Duration::from_secs(5),
        refresh_lookahead: chrono::Duration::seconds(60),
        backoff: BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2,
            max_retries: 2,
        },
    }
}

fn harness(mode: AuthMode) -> Harness {
    let mock = MockTransport::new();
    let controller = mock.controller();
    let authorizer = Arc::new(ScriptedAuthorizer::default());
    let storage = Arc::new(MemoryStorage::new());
    let environment = Environment {
        name: "test".into(),
        chat_url: "https://chat.example.com".into(),
        socket_url: "wss://socket.example.com".into(),
    };
    let context = SharedContext::new(ConnectionContext::new(
        1386,
        "chat_15bf",
        storage.visitor_id(),
        storage.destination_id(),
        environment,
    ));
    let (inbound, _task) = InboundQueue::spawn(Arc::new(EventRouter::new()));

    let (orchestrator, drops) = ReconnectionOrchestrator::new(
        settings(mode),
        mock.into_handle(),
        authorizer.clone(),
        storage.clone(),
        context.clone(),
        inbound,
    );
    Harness {
        orchestrator,
        drops,
        authorizer,
        storage,
        context,
        controller,
    }
}

#[tokio::test]
async fn test_anonymous_connect_authorizes_and_associates() {
    let h = harness(AuthMode::Anonymous);
    let mut states = h.orchestrator.subscribe();

    h.orchestrator.connect().await.unwrap();

    assert_eq!(h.orchestrator.state(), ConnectionState::Connected);
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);
    assert_eq!(h.storage.auth_token().as_deref(), Some("token-1"));
    assert!(h.storage.auth_token_expiry().is_some());
    assert_eq!(h.storage.customer_id().as_deref(), Some("customer-1"));
    assert_eq!(*h.authorizer.associated.lock().unwrap(), vec!["customer-1"]);

    let context = h.context.get();
    assert_eq!(context.customer_id.as_deref(), Some("customer-1"));
    assert_eq!(context.first_name, "Ada");

    let urls = h.controller.opened_urls();
    assert_eq!(urls.len(), 1);
    assert!(urls[0].contains(&format!("visitorId={}", h.storage.visitor_id())));
}

#[tokio::test]
async fn test_connect_twice_is_a_no_op() {
    let h = harness(AuthMode::Anonymous);
    h.orchestrator.connect().await.unwrap();
    h.orchestrator.connect().await.unwrap();
    assert_eq!(h.authorizer.authorize_count(), 1);
    assert_eq!(h.controller.opened_urls().len(), 1);
}

#[tokio::test]
async fn test_oauth_without_code_fails_before_network() {
    let h = harness(AuthMode::OAuth);

    let err = h.orchestrator.connect().await.unwrap_err();

    assert_eq!(err, ChatError::MissingAuthorizationCode);
    assert_eq!(err.kind(), ErrorKind::Usage);
    assert!(h.controller.opened_urls().is_empty());
    assert_eq!(h.orchestrator.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_oauth_passes_code_and_verifier() {
    let h = harness(AuthMode::OAuth);
    h.orchestrator
        .set_authorization_code("auth-code", Some("verifier".into()));

    h.orchestrator.connect().await.unwrap();

    let requests = h.authorizer.authorize_requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].mode, AuthMode::OAuth);
    assert_eq!(requests[0].authorization_code.as_deref(), Some("auth-code"));
    assert_eq!(requests[0].code_verifier.as_deref(), Some("verifier"));
}

#[tokio::test]
async fn test_missing_access_token_is_distinct_failure() {
    let h = harness(AuthMode::Anonymous);
    h.authorizer
        .push_authorize(Ok(ScriptedAuthorizer::authorized(Some("customer-1"), None)));

    let err = h.orchestrator.connect().await.unwrap_err();

    assert_eq!(err, ChatError::MissingAccessToken);
    assert_eq!(h.orchestrator.state(), ConnectionState::Disconnected);
    assert!(h.authorizer.associated.lock().unwrap().is_empty());
    assert!(!h.controller.is_open());
}

#[tokio::test]
async fn test_authorization_failure_is_reported_as_is() {
    let h = harness(AuthMode::Anonymous);
    h.authorizer
        .push_authorize(Err(ChatError::AnonymousAuthorizationFailed("bad visitor".into())));

    let err = h.orchestrator.connect().await.unwrap_err();

    assert!(matches!(err, ChatError::AnonymousAuthorizationFailed(_)));
    assert_eq!(err.kind(), ErrorKind::Authorization);
    assert_eq!(h.orchestrator.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_association_failure_is_distinct_from_authorization() {
    let h = harness(AuthMode::Anonymous);
    h.authorizer
        .push_associate(Err(ChatError::CustomerAssociationFailed("409".into())));

    let err = h.orchestrator.connect().await.unwrap_err();

    assert!(matches!(err, ChatError::CustomerAssociationFailed(_)));
    assert_eq!(h.orchestrator.state(), ConnectionState::Disconnected);
    assert_eq!(h.storage.customer_id(), None);
}

#[tokio::test]
async fn test_refused_socket_fails_connect() {
    let h = harness(AuthMode::Anonymous);
    h.controller.refuse_opens(1);

    let err = h.orchestrator.connect().await.unwrap_err();

    assert!(matches!(err, ChatError::SocketRefused(_)));
    assert_eq!(h.authorizer.authorize_count(), 0);
}

#[tokio::test]
async fn test_fresh_stored_token_is_reused() {
    let h = harness(AuthMode::OAuth);
    h.storage.set_auth_token(Some("stored".into()));
    h.storage
        .set_auth_token_expiry(Some(Utc::now() + chrono::Duration::hours(2)));

    h.orchestrator.connect().await.unwrap();

    assert_eq!(*h.authorizer.reconnect_tokens.lock().unwrap(), vec!["stored"]);
    assert_eq!(h.authorizer.authorize_count(), 0);
}

#[tokio::test]
async fn test_unknown_expiry_counts_as_fresh() {
    let h = harness(AuthMode::Anonymous);
    h.storage.set_auth_token(Some("stored".into()));

    assert!(h.orchestrator.token_is_fresh(Utc::now()));
    h.orchestrator.connect().await.unwrap();
    assert_eq!(h.authorizer.reconnect_count(), 1);
    assert_eq!(h.authorizer.authorize_count(), 0);
}

#[tokio::test]
async fn test_token_inside_lookahead_is_treated_as_expired() {
    let h = harness(AuthMode::Anonymous);
    h.storage.set_auth_token(Some("stale".into()));
    h.storage
        .set_auth_token_expiry(Some(Utc::now() + chrono::Duration::seconds(30)));

    assert!(!h.orchestrator.token_is_fresh(Utc::now()));
    h.orchestrator.connect().await.unwrap();

    assert_eq!(h.authorizer.reconnect_count(), 0);
    assert_eq!(h.authorizer.authorize_count(), 1);
    assert_eq!(h.storage.auth_token().as_deref(), Some("token-1"));
}

#[tokio::test]
async fn test_rejected_token_falls_back_to_full_authorization() {
    let h = harness(AuthMode::Anonymous);
    h.storage.set_auth_token(Some("revoked".into()));
    h.authorizer
        .push_reconnect(Err(ChatError::TokenRejected("revoked".into())));

    h.orchestrator.connect().await.unwrap();

    assert_eq!(h.authorizer.reconnect_count(), 1);
    assert_eq!(h.authorizer.authorize_count(), 1);
    assert_eq!(h.storage.auth_token().as_deref(), Some("token-1"));
}

#[tokio::test]
async fn test_ensure_authorized_requires_connection() {
    let h = harness(AuthMode::Anonymous);
    assert_eq!(
        h.orchestrator.ensure_authorized().await.unwrap_err(),
        ChatError::NotConnected
    );
}

#[tokio::test]
async fn test_ensure_authorized_refreshes_expiring_token() {
    let h = harness(AuthMode::Anonymous);
    h.orchestrator.connect().await.unwrap();
    h.orchestrator.ensure_authorized().await.unwrap();
    assert_eq!(h.authorizer.authorize_count(), 1);

    h.storage
        .set_auth_token_expiry(Some(Utc::now() + chrono::Duration::seconds(10)));
    h.authorizer
        .push_authorize(Ok(ScriptedAuthorizer::authorized(Some("customer-1"), Some("token-2"))));
    h.orchestrator.ensure_authorized().await.unwrap();

    assert_eq!(h.authorizer.authorize_count(), 2);
    // Full authorization, not a stored-token reconnect
    assert_eq!(h.authorizer.reconnect_count(), 0);
    assert_eq!(h.storage.auth_token().as_deref(), Some("token-2"));
    assert_eq!(h.orchestrator.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_drop_reconnects_with_stored_token() {
    let mut h = harness(AuthMode::Anonymous);
    h.orchestrator.connect().await.unwrap();

    h.controller.drop_connection();
    let dropped = h.drops.recv().await.unwrap();
    h.orchestrator.handle_drop(dropped).await.unwrap();

    assert_eq!(h.orchestrator.state(), ConnectionState::Connected);
    assert_eq!(h.controller.opened_urls().len(), 2);
    assert_eq!(*h.authorizer.reconnect_tokens.lock().unwrap(), vec!["token-1"]);
    assert_eq!(h.authorizer.authorize_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_retries_with_backoff_then_succeeds() {
    let mut h = harness(AuthMode::Anonymous);
    h.orchestrator.connect().await.unwrap();

    h.controller.refuse_opens(2);
    h.controller.drop_connection();
    let dropped = h.drops.recv().await.unwrap();
    h.orchestrator.handle_drop(dropped).await.unwrap();

    assert_eq!(h.orchestrator.state(), ConnectionState::Connected);
    assert_eq!(h.controller.opened_urls().len(), 4);
    assert!(h.orchestrator.last_failure().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_gives_up_after_max_retries() {
    let mut h = harness(AuthMode::Anonymous);
    h.orchestrator.connect().await.unwrap();

    h.controller.refuse_opens(100);
    h.controller.drop_connection();
    let dropped = h.drops.recv().await.unwrap();
    let err = h.orchestrator.handle_drop(dropped).await.unwrap_err();

    assert_eq!(err, ChatError::ReconnectionExhausted { attempts: 3 });
    assert!(!err.is_retryable());
    assert_eq!(h.orchestrator.state(), ConnectionState::Disconnected);
    assert_eq!(h.orchestrator.last_failure(), Some(err));
    // One initial open plus three reconnect attempts
    assert_eq!(h.controller.opened_urls().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_error_stops_reconnection() {
    let mut h = harness(AuthMode::Anonymous);
    h.orchestrator.connect().await.unwrap();
    h.authorizer
        .push_reconnect(Err(ChatError::AnonymousAuthorizationFailed("gone".into())));

    h.controller.drop_connection();
    let dropped = h.drops.recv().await.unwrap();
    let err = h.orchestrator.handle_drop(dropped).await.unwrap_err();

    assert!(matches!(err, ChatError::AnonymousAuthorizationFailed(_)));
    assert_eq!(h.orchestrator.state(), ConnectionState::Disconnected);
    assert_eq!(h.controller.opened_urls().len(), 2);
}

#[tokio::test]
async fn test_stale_drop_is_ignored() {
    let h = harness(AuthMode::Anonymous);
    h.orchestrator.connect().await.unwrap();

    h.orchestrator
        .handle_drop(ConnectionDrop {
            generation: 999,
            reason: "old socket".into(),
        })
        .await
        .unwrap();

    assert_eq!(h.orchestrator.state(), ConnectionState::Connected);
    assert_eq!(h.controller.opened_urls().len(), 1);
}

#[tokio::test]
async fn test_disconnect_closes_without_reporting_a_drop() {
    let mut h = harness(AuthMode::Anonymous);
    h.orchestrator.connect().await.unwrap();

    h.orchestrator.disconnect().await;

    assert_eq!(h.orchestrator.state(), ConnectionState::Disconnected);
    assert!(!h.controller.is_open());
    tokio::task::yield_now().await;
    assert!(h.drops.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_interrupts_reconnection() {
    let Harness {
        orchestrator,
        mut drops,
        controller,
        ..
    } = harness(AuthMode::Anonymous);
    orchestrator.connect().await.unwrap();

    controller.refuse_opens(100);
    controller.drop_connection();
    let dropped = drops.recv().await.unwrap();

    let orchestrator = Arc::new(orchestrator);
    let mut states = orchestrator.subscribe();
    let recovery = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.handle_drop(dropped).await }
    });
    states
        .wait_for(|s| *s == ConnectionState::Reconnecting)
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    orchestrator.disconnect().await;
    // Returned before the first backoff wait ran out
    assert!(started.elapsed() < Duration::from_millis(100));

    recovery.await.unwrap().unwrap();
    let opens = controller.opened_urls().len();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(controller.opened_urls().len(), opens);
    assert_eq!(orchestrator.state(), ConnectionState::Disconnected);
    assert!(orchestrator.last_failure().is_none());
}

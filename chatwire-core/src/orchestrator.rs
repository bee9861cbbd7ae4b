// ABOUTME: Drives socket open, authorization, customer association and reconnection.
// ABOUTME: One authorization flow at a time per session; every network leg has a timeout.

use crate::auth::{AccessToken, AuthMode, Authorization, AuthorizationRequest, Authorizer};
use crate::config::ChatConfig;
use crate::context::SharedContext;
use crate::error::{ChatError, Result};
use crate::reconnect::{BackoffConfig, BackoffState};
use crate::storage::ValueStorage;
use crate::worker::{spawn_pump, ConnectionDrop, InboundQueue};
use chatwire_transport::TransportHandle;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authorizing,
    Associating,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub mode: AuthMode,
    pub network_timeout: Duration,
    pub refresh_lookahead: chrono::Duration,
    pub backoff: BackoffConfig,
}

impl OrchestratorSettings {
    pub fn from_config(config: &ChatConfig) -> Self {
        Self {
            mode: config.auth.mode,
            network_timeout: config.network_timeout(),
            refresh_lookahead: config.refresh_lookahead(),
            backoff: config.reconnect.backoff(),
        }
    }
}

#[derive(Debug, Clone)]
struct AuthorizationCode {
    code: String,
    verifier: Option<String>,
}

pub struct ReconnectionOrchestrator {
    settings: OrchestratorSettings,
    transport: TransportHandle,
    authorizer: Arc<dyn Authorizer>,
    storage: Arc<dyn ValueStorage>,
    context: SharedContext,
    inbound: InboundQueue,
    drops: mpsc::UnboundedSender<ConnectionDrop>,
    state: watch::Sender<ConnectionState>,
    auth_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    /// Bumped by `disconnect` to end a reconnect run mid-wait
    cancel: watch::Sender<u64>,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
    code: std::sync::Mutex<Option<AuthorizationCode>>,
    last_failure: std::sync::Mutex<Option<ChatError>>,
}

impl ReconnectionOrchestrator {
    /// Build an orchestrator. The returned receiver yields unexpected socket
    /// drops; feed them to `handle_drop`.
    pub fn new(
        settings: OrchestratorSettings,
        transport: TransportHandle,
        authorizer: Arc<dyn Authorizer>,
        storage: Arc<dyn ValueStorage>,
        context: SharedContext,
        inbound: InboundQueue,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionDrop>) {
        let (drops, drop_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let orchestrator = Self {
            settings,
            transport,
            authorizer,
            storage,
            context,
            inbound,
            drops,
            state,
            auth_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            cancel: watch::channel(0).0,
            pump: std::sync::Mutex::new(None),
            code: std::sync::Mutex::new(None),
            last_failure: std::sync::Mutex::new(None),
        };
        (orchestrator, drop_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Last error that ended a connection without a caller to return it to
    pub fn last_failure(&self) -> Option<ChatError> {
        self.last_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Supply the OAuth authorization code obtained by the integrator
    pub fn set_authorization_code(&self, code: impl Into<String>, verifier: Option<String>) {
        *self.code.lock().unwrap_or_else(|e| e.into_inner()) = Some(AuthorizationCode {
            code: code.into(),
            verifier,
        });
    }

    fn authorization_code(&self) -> Option<AuthorizationCode> {
        self.code.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "Connection state changed");
        }
    }

    fn stored_token(&self) -> Option<AccessToken> {
        self.storage.auth_token().map(|token| AccessToken {
            token,
            expires_at: self.storage.auth_token_expiry(),
        })
    }

    /// Whether the stored token is usable at `now`
    pub fn token_is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.stored_token()
            .is_some_and(|t| t.is_fresh(now, self.settings.refresh_lookahead))
    }

    fn fresh_token(&self) -> Option<AccessToken> {
        self.stored_token()
            .filter(|t| t.is_fresh(Utc::now(), self.settings.refresh_lookahead))
    }

    fn store_token(&self, token: &AccessToken) {
        self.storage.set_auth_token(Some(token.token.clone()));
        self.storage.set_auth_token_expiry(token.expires_at);
    }

    fn clear_token(&self) {
        self.storage.set_auth_token(None);
        self.storage.set_auth_token_expiry(None);
    }

    async fn with_timeout<T, F>(&self, leg: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.settings.network_timeout, fut)
            .await
            .map_err(|_| ChatError::Timeout(leg.to_string()))?
    }

    /// Open the socket, authorize and associate the customer
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.auth_lock.lock().await;

        if self.state() == ConnectionState::Connected {
            tracing::debug!("Already connected");
            return Ok(());
        }
        if self.settings.mode == AuthMode::OAuth
            && self.authorization_code().is_none()
            && self.fresh_token().is_none()
        {
            return Err(ChatError::MissingAuthorizationCode);
        }

        self.set_state(ConnectionState::Connecting);
        let result = async {
            self.open_socket().await?;
            self.authenticate(true).await
        }
        .await;

        match result {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                tracing::info!(mode = %self.settings.mode, "Connected");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Connect failed");
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn open_socket(&self) -> Result<()> {
        let url = self.context.get().socket_endpoint()?;
        let events = match tokio::time::timeout(self.settings.network_timeout, self.transport.open(&url)).await {
            Ok(Ok(events)) => events,
            Ok(Err(e)) => return Err(ChatError::SocketRefused(e.to_string())),
            Err(_) => return Err(ChatError::Timeout("socket open".to_string())),
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let pump = spawn_pump(events, generation, self.inbound.clone(), self.drops.clone());
        if let Some(previous) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).replace(pump) {
            previous.abort();
        }
        tracing::debug!(generation, transport = self.transport.name(), "Socket open");
        Ok(())
    }

    /// Resume with a fresh stored token, else authorize from scratch
    async fn authenticate(&self, announce: bool) -> Result<()> {
        if announce {
            self.set_state(ConnectionState::Authorizing);
        }

        if let Some(token) = self.fresh_token() {
            let context = self.context.get();
            match self
                .with_timeout("token reconnect", self.authorizer.reconnect(&context, &token))
                .await
            {
                Ok(token) => {
                    self.store_token(&token);
                    tracing::debug!("Resumed with stored token");
                    return Ok(());
                }
                Err(ChatError::TokenRejected(reason)) => {
                    tracing::warn!(reason = %reason, "Stored token rejected, re-authorizing");
                    self.clear_token();
                }
                Err(e) => return Err(e),
            }
        }

        self.authorize(announce).await
    }

    async fn authorize(&self, announce: bool) -> Result<()> {
        let code = self.authorization_code();
        if self.settings.mode == AuthMode::OAuth && code.is_none() {
            return Err(ChatError::MissingAuthorizationCode);
        }

        let request = AuthorizationRequest {
            mode: self.settings.mode,
            authorization_code: code.as_ref().map(|c| c.code.clone()),
            code_verifier: code.and_then(|c| c.verifier),
            context: self.context.get(),
        };
        let authorization = self
            .with_timeout("authorization", self.authorizer.authorize(&request))
            .await?;
        let Authorization {
            customer_id,
            first_name,
            last_name,
            access_token,
        } = authorization;
        let token = access_token.ok_or(ChatError::MissingAccessToken)?;
        self.store_token(&token);

        if announce {
            self.set_state(ConnectionState::Associating);
        }
        let Some(customer_id) = customer_id else {
            tracing::debug!("Authorization returned no customer identity, skipping association");
            return Ok(());
        };

        let mut context = request.context.with_customer_id(Some(customer_id.clone()));
        if let (Some(first), Some(last)) = (first_name, last_name) {
            context = context.with_names(first, last);
        }
        self.with_timeout(
            "customer association",
            self.authorizer.associate(&context, &customer_id),
        )
        .await?;

        self.storage.set_customer_id(Some(customer_id));
        self.context.replace(context);
        Ok(())
    }

    /// Re-authorize if the stored token expires within the lookahead window
    pub async fn ensure_authorized(&self) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(ChatError::NotConnected);
        }
        if self.fresh_token().is_some() {
            return Ok(());
        }

        let _guard = self.auth_lock.lock().await;
        // Another caller may have refreshed while we waited
        if self.fresh_token().is_some() {
            return Ok(());
        }

        tracing::info!("Access token expired or expiring, re-authorizing");
        self.set_state(ConnectionState::Authorizing);
        match self.authorize(true).await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Token refresh failed");
                self.teardown().await;
                Err(e)
            }
        }
    }

    /// Recover from an unexpected socket drop with bounded backoff.
    ///
    /// Drops from older socket generations, or arriving after a disconnect,
    /// are ignored. The auth lock is held per attempt, never across a wait,
    /// so `disconnect` ends the run between attempts.
    pub async fn handle_drop(&self, dropped: ConnectionDrop) -> Result<()> {
        let mut cancelled = self.cancel.subscribe();
        {
            let _guard = self.auth_lock.lock().await;
            if dropped.generation != self.generation.load(Ordering::SeqCst)
                || self.state() != ConnectionState::Connected
            {
                tracing::debug!(generation = dropped.generation, "Ignoring stale socket drop");
                return Ok(());
            }
            tracing::warn!(reason = %dropped.reason, "Connection lost, reconnecting");
            self.set_state(ConnectionState::Reconnecting);
        }

        let mut backoff = BackoffState::new(self.settings.backoff.clone());
        while let Some(delay) = backoff.next_attempt() {
            if !delay.is_zero() {
                tracing::debug!(
                    attempt = backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Waiting to reconnect"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancelled.changed() => {
                        tracing::info!("Reconnection cancelled");
                        return Ok(());
                    }
                }
            }

            let _guard = self.auth_lock.lock().await;
            if self.state() != ConnectionState::Reconnecting {
                tracing::info!("Reconnection cancelled");
                return Ok(());
            }

            let attempt = async {
                self.open_socket().await?;
                self.authenticate(false).await
            }
            .await;

            match attempt {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected);
                    tracing::info!(attempt = backoff.attempts(), "Reconnected");
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(attempt = backoff.attempts(), error = %e, "Reconnect attempt failed");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Reconnect failed with non-retryable error");
                    self.fail(e.clone()).await;
                    return Err(e);
                }
            }
        }

        let _guard = self.auth_lock.lock().await;
        if self.state() != ConnectionState::Reconnecting {
            return Ok(());
        }
        let error = backoff.exhausted();
        tracing::error!(error = %error, "Giving up on reconnection");
        self.fail(error.clone()).await;
        Err(error)
    }

    async fn fail(&self, error: ChatError) {
        *self.last_failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(error);
        self.teardown().await;
    }

    /// Close the socket and go to Disconnected
    pub async fn disconnect(&self) {
        self.cancel.send_modify(|n| *n = n.wrapping_add(1));
        let _guard = self.auth_lock.lock().await;
        self.teardown().await;
        tracing::info!("Disconnected");
    }

    async fn teardown(&self) {
        self.set_state(ConnectionState::Disconnected);
        // Any drop still in flight now belongs to a stale generation
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.transport.close().await {
            tracing::debug!(error = %e, "Transport close failed");
        }
        if let Some(pump) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pump.abort();
        }
    }
}

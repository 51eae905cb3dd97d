use reqwest::Client;
use std::sync::Arc;

use super::clock::{Countdown, ScheduledAction, SessionClock, Timebase};
use super::coordinator::RefreshCoordinator;
use super::credentials::CredentialStore;
use super::refresh::AuthBackend;
use super::types::{SessionPolicy, SessionSnapshot};
use crate::error::Result;
use crate::http_client::RequestGateway;
use crate::log_sink::LogSink;

/// Session facade
/// Composes the credential store, refresh coordinator, session clock and
/// request gateway behind login / logout / current session.
pub struct SessionManager {
    /// Token storage (single access point for reads and writes)
    store: Arc<dyn CredentialStore>,

    /// Login and renewal endpoints
    backend: Arc<dyn AuthBackend>,

    /// Single-flight renewal
    coordinator: RefreshCoordinator,

    /// Expiry tracking and the scheduled refresh/logout
    clock: Arc<SessionClock>,

    /// Outbound requests with automatic 401 handling
    gateway: RequestGateway,

    /// External log collector
    sink: Arc<dyn LogSink>,
}

impl SessionManager {
    /// Wire up all components. `client` is shared by the gateway for
    /// outbound requests against `api_url`.
    pub fn new(
        client: Client,
        api_url: &str,
        policy: SessionPolicy,
        timebase: Timebase,
        store: Arc<dyn CredentialStore>,
        backend: Arc<dyn AuthBackend>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        let coordinator = RefreshCoordinator::new(store.clone(), backend.clone(), sink.clone());
        let clock = SessionClock::new(
            store.clone(),
            coordinator.clone(),
            policy,
            timebase,
            sink.clone(),
        );
        let gateway = RequestGateway::new(client, api_url, store.clone(), coordinator.clone());

        tracing::debug!(
            refresh_margin = policy.refresh_margin,
            auto_renewal = policy.auto_renewal,
            "Session manager initialized"
        );

        Self {
            store,
            backend,
            coordinator,
            clock,
            gateway,
            sink,
        }
    }

    /// Pick up whatever session the credential store already holds
    pub fn restore(&self) -> Result<SessionSnapshot> {
        self.clock.sync()?;
        Ok(self.current_session())
    }

    /// Exchange credentials for tokens and start the session.
    ///
    /// Login failures are returned as-is and leave the current session
    /// untouched; they are never retried.
    pub async fn login(&self, username: &str, password: &str) -> Result<SessionSnapshot> {
        let pair = match self.backend.login(username, password).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(username, error = %e, "Login failed");
                self.sink.error(&e, "login failed");
                return Err(e);
            }
        };

        // A renewal started for the previous session must not land on this one
        self.coordinator.invalidate();
        self.store.set(&pair.access_token, &pair.refresh_token)?;
        self.clock.sync()?;

        let session = self.current_session();
        tracing::info!(
            subject = session.subject.as_deref().unwrap_or_default(),
            seconds_remaining = session.seconds_remaining,
            "Login successful"
        );
        self.sink.info("login success");
        Ok(session)
    }

    /// End the session. Safe to call when already logged out.
    pub fn logout(&self) {
        self.clock.logout();
    }

    /// Identity and remaining lifetime for the UI
    pub fn current_session(&self) -> SessionSnapshot {
        self.clock.snapshot()
    }

    /// Pending refresh/logout action, if any
    pub fn scheduled(&self) -> Option<ScheduledAction> {
        self.clock.scheduled()
    }

    /// Start the one-second display countdown
    pub fn start_countdown(&self) -> Countdown {
        self.clock.start_countdown()
    }

    /// Gateway for authenticated outbound requests
    pub fn gateway(&self) -> &RequestGateway {
        &self.gateway
    }

    /// Force a renewal now (joins any renewal already in flight)
    pub async fn refresh(&self) -> Result<String> {
        self.coordinator.refresh().await
    }
}

// Login and token renewal endpoints

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::clock::Timebase;
use super::codec;
use super::types::{Claims, LoginRequest, RefreshRequest, TokenPair};
use crate::error::{Result, SessionError};

/// Fallback lifetime for locally issued tokens
const DEFAULT_LIFETIME_MINUTES: u64 = 60;

/// Refresh token handed out by the mock backend
pub const MOCK_REFRESH_TOKEN: &str = "mock-refresh";

/// Remote side of authentication: exchanges credentials for tokens
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Exchange username/password for a token pair.
    /// Fails with `InvalidCredentials` when the server rejects them.
    async fn login(&self, username: &str, password: &str) -> Result<TokenPair>;

    /// Exchange a refresh token for a new token pair
    async fn renew(&self, refresh_token: &str) -> Result<TokenPair>;
}

/// Talks to `POST {base}/auth/login` and `POST {base}/auth/refresh`.
///
/// Uses its own client, never the request gateway, so a renewal can not
/// recurse into another renewal.
pub struct HttpAuthBackend {
    client: Client,
    base_url: String,
}

impl HttpAuthBackend {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn login_url(&self) -> String {
        format!("{}/auth/login", self.base_url)
    }

    fn refresh_url(&self) -> String {
        format!("{}/auth/refresh", self.base_url)
    }
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn login(&self, username: &str, password: &str) -> Result<TokenPair> {
        tracing::info!(username, "Logging in...");

        let response = self
            .client
            .post(self.login_url())
            .json(&LoginRequest { username, password })
            .send()
            .await?;

        let status = response.status();
        if matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            tracing::warn!(status = %status, "Login rejected");
            return Err(SessionError::InvalidCredentials);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SessionError::from_status(status, &body));
        }

        let pair: TokenPair = response.json().await?;
        if pair.access_token.is_empty() {
            return Err(SessionError::MalformedToken(
                "login response does not contain accessToken".to_string(),
            ));
        }
        Ok(pair)
    }

    async fn renew(&self, refresh_token: &str) -> Result<TokenPair> {
        tracing::info!("Refreshing access token via renewal endpoint...");

        let response = self
            .client
            .post(self.refresh_url())
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| SessionError::RefreshFailed(SessionError::from(e).to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %error_text, "Token renewal failed");
            return Err(SessionError::RefreshFailed(
                SessionError::from_status(status, &error_text).to_string(),
            ));
        }

        let pair: TokenPair = response.json().await.map_err(|e| {
            SessionError::RefreshFailed(format!("Failed to parse renewal response: {}", e))
        })?;

        if pair.access_token.is_empty() {
            return Err(SessionError::RefreshFailed(
                "renewal response does not contain accessToken".to_string(),
            ));
        }

        Ok(pair)
    }
}

/// Offline backend that accepts one configured user and issues unsigned
/// tokens valid for `lifetime_minutes`.
pub struct MockAuthBackend {
    username: String,
    password: String,
    lifetime_secs: i64,
    timebase: Timebase,
    renewals: AtomicUsize,
}

impl MockAuthBackend {
    pub fn new(username: &str, password: &str, lifetime_minutes: u64, timebase: Timebase) -> Self {
        let minutes = if lifetime_minutes == 0 {
            DEFAULT_LIFETIME_MINUTES
        } else {
            lifetime_minutes
        };
        Self {
            username: username.to_string(),
            password: password.to_string(),
            lifetime_secs: i64::try_from(minutes.saturating_mul(60)).unwrap_or(i64::MAX),
            timebase,
            renewals: AtomicUsize::new(0),
        }
    }

    /// Number of renewals served so far
    pub fn renewals(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }

    fn issue(&self, subject: &str) -> TokenPair {
        let claims = Claims {
            sub: subject.to_string(),
            exp: self.timebase.now().saturating_add(self.lifetime_secs),
        };
        TokenPair {
            access_token: codec::encode_unsigned(&claims),
            refresh_token: MOCK_REFRESH_TOKEN.to_string(),
        }
    }
}

#[async_trait]
impl AuthBackend for MockAuthBackend {
    async fn login(&self, username: &str, password: &str) -> Result<TokenPair> {
        if username == self.username && password == self.password {
            Ok(self.issue(username))
        } else {
            Err(SessionError::InvalidCredentials)
        }
    }

    async fn renew(&self, refresh_token: &str) -> Result<TokenPair> {
        if refresh_token != MOCK_REFRESH_TOKEN {
            return Err(SessionError::RefreshFailed(
                "unknown refresh token".to_string(),
            ));
        }
        self.renewals.fetch_add(1, Ordering::SeqCst);
        Ok(self.issue(&self.username))
    }
}

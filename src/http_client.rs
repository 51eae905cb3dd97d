use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Request, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::auth::{CredentialStore, RefreshCoordinator};
use crate::error::{Result, SessionError};

/// Outbound HTTP gateway.
///
/// Looks the access token up in the credential store at send time, and on a
/// 401 asks the refresh coordinator for a new one and replays the request
/// exactly once.
#[derive(Clone)]
pub struct RequestGateway {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Base URL that relative paths are resolved against
    base_url: String,

    store: Arc<dyn CredentialStore>,
    coordinator: RefreshCoordinator,
}

impl RequestGateway {
    pub fn new(
        client: Client,
        base_url: &str,
        store: Arc<dyn CredentialStore>,
        coordinator: RefreshCoordinator,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            store,
            coordinator,
        }
    }

    /// Resolve `path` against the base URL; absolute URLs pass through
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.client.get(self.url(path))
    }

    /// GET `path` and decode the JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let request = self.get(path).build()?;
        let response = self.send(request).await?;
        Ok(response.json().await?)
    }

    /// Send a request with the current credentials.
    ///
    /// A 401 triggers one refresh and one replay. If the refresh fails, its
    /// error is returned instead of the 401. A replay that is rejected again
    /// fails with `Unauthorized`.
    pub async fn send(&self, request: Request) -> Result<Response> {
        let method = request.method().clone();
        let url = request.url().clone();
        tracing::debug!(method = %method, url = %url, "Sending HTTP request");

        let seen = self.store.get()?.access_token;
        let response = self.execute(&request, seen.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Self::finish(response).await;
        }

        tracing::warn!(method = %method, url = %url, "Received 401, refreshing token and retrying...");
        let token = self.coordinator.refresh_stale(seen.as_deref()).await.map_err(|e| {
            tracing::error!(error = %e, url = %url, "Token refresh failed, abandoning request");
            e
        })?;

        let response = self.execute(&request, Some(&token)).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::error!(method = %method, url = %url, "Request rejected again after refresh");
        }
        Self::finish(response).await
    }

    async fn execute(&self, request: &Request, token: Option<&str>) -> Result<Response> {
        let mut req = request.try_clone().ok_or_else(|| {
            SessionError::InvalidRequest("Request body is not cloneable".to_string())
        })?;

        if let Some(token) = token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| SessionError::InvalidRequest(format!("Invalid token: {}", e)))?;
            value.set_sensitive(true);
            req.headers_mut().insert(AUTHORIZATION, value);
        }

        let response = self.client.execute(req).await.map_err(|e| {
            tracing::warn!(error = %e, url = %request.url(), "HTTP request error");
            SessionError::from(e)
        })?;
        tracing::debug!(status = %response.status(), "Received HTTP response");
        Ok(response)
    }

    async fn finish(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error_text = response.text().await.unwrap_or_default();
        tracing::error!(
            status = status.as_u16(),
            response_body = %error_text,
            "HTTP request failed with error response"
        );
        Err(SessionError::from_status(status, &error_text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::coordinator::testing::ScriptedBackend;
    use crate::auth::MemoryStore;
    use crate::log_sink::DiscardSink;

    fn gateway(base_url: &str) -> RequestGateway {
        let store: Arc<dyn CredentialStore> = Arc::new(MemoryStore::new());
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            Arc::new(ScriptedBackend::default()),
            Arc::new(DiscardSink),
        );
        RequestGateway::new(Client::new(), base_url, store, coordinator)
    }

    #[test]
    fn test_url_resolution() {
        let gw = gateway("http://localhost:4000/");
        assert_eq!(gw.url("/people/1"), "http://localhost:4000/people/1");
        assert_eq!(gw.url("people/1"), "http://localhost:4000/people/1");
        assert_eq!(
            gw.url("https://swapi.dev/api/films/"),
            "https://swapi.dev/api/films/"
        );
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        // Port 9 (discard) is closed on any sane test host
        let gw = gateway("http://127.0.0.1:9");
        let request = gw.get("/people").build().unwrap();
        let err = gw.send(request).await.unwrap_err();
        assert!(matches!(err, SessionError::Network(_)));
    }
}

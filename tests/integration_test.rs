// Integration tests for Session Keeper
//
// These tests run the request gateway, HTTP auth backend and log sink
// against a mock HTTP server.

use futures::future::join_all;
use mockito::{Matcher, Server};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use session_keeper::{
    auth::{
        codec, Claims, CredentialStore, HttpAuthBackend, MemoryStore, SessionManager,
        SessionPolicy, StoredTokens, Timebase,
    },
    error::SessionError,
    log_sink::{DiscardSink, HttpLogSink, LogSink},
};

// ==================================================================================================
// Test Helpers
// ==================================================================================================

fn jwt(sub: &str, lifetime_secs: i64) -> String {
    codec::encode_unsigned(&Claims {
        sub: sub.to_string(),
        exp: chrono::Utc::now().timestamp() + lifetime_secs,
    })
}

fn session_with_sink(url: &str, store: Arc<MemoryStore>, sink: Arc<dyn LogSink>) -> SessionManager {
    let client = reqwest::Client::new();
    SessionManager::new(
        client.clone(),
        url,
        SessionPolicy::default(),
        Timebase::system(),
        store,
        Arc::new(HttpAuthBackend::new(client, url)),
        sink,
    )
}

fn session(url: &str, store: Arc<MemoryStore>) -> SessionManager {
    session_with_sink(url, store, Arc::new(DiscardSink))
}

fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

// ==================================================================================================
// Gateway Tests
// ==================================================================================================

#[tokio::test]
async fn test_gateway_attaches_current_token() {
    let mut server = Server::new_async().await;
    let access = jwt("luke", 3600);

    let people = server
        .mock("GET", "/people/1")
        .match_header("authorization", bearer(&access).as_str())
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"name":"Luke Skywalker"}"#)
        .expect(1)
        .create_async()
        .await;

    let store = Arc::new(MemoryStore::new());
    store.set(&access, "refresh-1").unwrap();
    let session = session(&server.url(), store);

    let body: Value = session.gateway().get_json("/people/1").await.unwrap();
    assert_eq!(body["name"], "Luke Skywalker");
    people.assert_async().await;
}

#[tokio::test]
async fn test_gateway_without_token_sends_no_header() {
    let mut server = Server::new_async().await;
    let films = server
        .mock("GET", "/films")
        .match_header("authorization", Matcher::Missing)
        .with_status(200)
        .with_body("[]")
        .expect(1)
        .create_async()
        .await;

    let session = session(&server.url(), Arc::new(MemoryStore::new()));
    let request = session.gateway().get("/films").build().unwrap();
    let response = session.gateway().send(request).await.unwrap();

    assert_eq!(response.status(), 200);
    films.assert_async().await;
}

#[tokio::test]
async fn test_gateway_refreshes_on_401_and_replays() {
    let mut server = Server::new_async().await;
    let old = jwt("luke", 3600);
    let new = jwt("luke", 7200);

    let rejected = server
        .mock("GET", "/data")
        .match_header("authorization", bearer(&old).as_str())
        .with_status(401)
        .expect(1)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/auth/refresh")
        .match_body(Matcher::Json(json!({ "refreshToken": "refresh-old" })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "accessToken": new, "refreshToken": "refresh-new" }).to_string())
        .expect(1)
        .create_async()
        .await;
    let accepted = server
        .mock("GET", "/data")
        .match_header("authorization", bearer(&new).as_str())
        .with_status(200)
        .with_body("ok")
        .expect(1)
        .create_async()
        .await;

    let store = Arc::new(MemoryStore::new());
    store.set(&old, "refresh-old").unwrap();
    let session = session(&server.url(), store.clone());
    session.restore().unwrap();

    let request = session.gateway().get("/data").build().unwrap();
    let response = session.gateway().send(request).await.unwrap();
    assert_eq!(response.text().await.unwrap(), "ok");

    rejected.assert_async().await;
    refresh.assert_async().await;
    accepted.assert_async().await;

    assert_eq!(
        store.get().unwrap(),
        StoredTokens {
            access_token: Some(new.clone()),
            refresh_token: Some("refresh-new".to_string()),
        }
    );
    // The clock re-synced from the renewed token
    let current = session.current_session();
    assert!(current.is_authenticated);
    assert!(current.seconds_remaining > 3600);
}

#[tokio::test]
async fn test_concurrent_401s_share_one_refresh() {
    let mut server = Server::new_async().await;
    let old = jwt("leia", 3600);
    let new = jwt("leia", 7200);

    let rejected = server
        .mock("GET", Matcher::Regex(r"^/people/\d+$".to_string()))
        .match_header("authorization", bearer(&old).as_str())
        .with_status(401)
        .expect(3)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/auth/refresh")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "accessToken": new, "refreshToken": "refresh-new" }).to_string())
        .expect(1)
        .create_async()
        .await;
    let accepted = server
        .mock("GET", Matcher::Regex(r"^/people/\d+$".to_string()))
        .match_header("authorization", bearer(&new).as_str())
        .with_status(200)
        .with_body("ok")
        .expect(3)
        .create_async()
        .await;

    let store = Arc::new(MemoryStore::new());
    store.set(&old, "refresh-old").unwrap();
    let session = session(&server.url(), store);

    let gateway = session.gateway();
    let requests = (1..=3).map(|id| {
        let request = gateway.get(&format!("/people/{}", id)).build().unwrap();
        gateway.send(request)
    });

    for result in join_all(requests).await {
        assert_eq!(result.unwrap().status(), 200);
    }

    rejected.assert_async().await;
    refresh.assert_async().await;
    accepted.assert_async().await;
}

#[tokio::test]
async fn test_refresh_rejection_fails_request_and_logs_out() {
    let mut server = Server::new_async().await;
    let old = jwt("han", 3600);

    server
        .mock("GET", "/data")
        .with_status(401)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/auth/refresh")
        .with_status(401)
        .with_body("refresh token revoked")
        .expect(1)
        .create_async()
        .await;

    let store = Arc::new(MemoryStore::new());
    store.set(&old, "refresh-old").unwrap();
    let session = session(&server.url(), store.clone());
    assert!(session.restore().unwrap().is_authenticated);

    let request = session.gateway().get("/data").build().unwrap();
    let err = session.gateway().send(request).await.unwrap_err();

    // Root cause surfaces instead of the original 401
    assert!(matches!(err, SessionError::RefreshFailed(_)), "got {:?}", err);
    refresh.assert_async().await;
    assert_eq!(store.get().unwrap(), StoredTokens::default());
    assert!(!session.current_session().is_authenticated);
    assert!(session.scheduled().is_none());
}

#[tokio::test]
async fn test_second_401_is_not_retried_again() {
    let mut server = Server::new_async().await;
    let old = jwt("chewie", 3600);
    let new = jwt("chewie", 7200);

    let data = server
        .mock("GET", "/data")
        .with_status(401)
        .expect(2)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/auth/refresh")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "accessToken": new, "refreshToken": "refresh-new" }).to_string())
        .expect(1)
        .create_async()
        .await;

    let store = Arc::new(MemoryStore::new());
    store.set(&old, "refresh-old").unwrap();
    let session = session(&server.url(), store);

    let request = session.gateway().get("/data").build().unwrap();
    let err = session.gateway().send(request).await.unwrap_err();

    assert_eq!(err, SessionError::Unauthorized);
    data.assert_async().await;
    refresh.assert_async().await;
}

#[tokio::test]
async fn test_non_auth_errors_pass_through() {
    let mut server = Server::new_async().await;
    let refresh = server
        .mock("POST", "/auth/refresh")
        .expect(0)
        .create_async()
        .await;
    server
        .mock("GET", "/missing")
        .with_status(404)
        .with_body("not here")
        .create_async()
        .await;

    let store = Arc::new(MemoryStore::new());
    store.set(&jwt("r2", 3600), "refresh").unwrap();
    let session = session(&server.url(), store);

    let request = session.gateway().get("/missing").build().unwrap();
    let err = session.gateway().send(request).await.unwrap_err();

    assert_eq!(
        err,
        SessionError::Api {
            status: 404,
            message: "not here".to_string()
        }
    );
    refresh.assert_async().await;
}

// ==================================================================================================
// Login Tests
// ==================================================================================================

#[tokio::test]
async fn test_login_against_endpoint() {
    let mut server = Server::new_async().await;
    let access = jwt("luke", 300);

    let login = server
        .mock("POST", "/auth/login")
        .match_body(Matcher::Json(
            json!({ "username": "luke", "password": "skywalker" }),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "accessToken": access, "refreshToken": "refresh-1" }).to_string())
        .expect(1)
        .create_async()
        .await;

    let store = Arc::new(MemoryStore::new());
    let session = session(&server.url(), store.clone());

    let snapshot = session.login("luke", "skywalker").await.unwrap();
    assert!(snapshot.is_authenticated);
    assert_eq!(snapshot.subject.as_deref(), Some("luke"));
    assert!(snapshot.seconds_remaining <= 300 && snapshot.seconds_remaining >= 298);
    assert!(session.scheduled().is_some());
    assert_eq!(store.get().unwrap().refresh_token.as_deref(), Some("refresh-1"));
    login.assert_async().await;

    session.logout();
    assert!(!session.current_session().is_authenticated);
    assert!(session.scheduled().is_none());
}

#[tokio::test]
async fn test_login_rejected() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/auth/login")
        .with_status(401)
        .create_async()
        .await;

    let store = Arc::new(MemoryStore::new());
    let session = session(&server.url(), store.clone());

    let err = session.login("luke", "vader").await.unwrap_err();
    assert_eq!(err, SessionError::InvalidCredentials);
    assert_eq!(store.get().unwrap(), StoredTokens::default());
    assert!(!session.current_session().is_authenticated);
}

#[tokio::test]
async fn test_login_with_malformed_token_is_cleared() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/auth/login")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"accessToken":"only.two","refreshToken":"r"}"#)
        .create_async()
        .await;

    let store = Arc::new(MemoryStore::new());
    let session = session(&server.url(), store.clone());

    let err = session.login("luke", "skywalker").await.unwrap_err();
    assert!(matches!(err, SessionError::MalformedToken(_)));
    assert_eq!(store.get().unwrap(), StoredTokens::default());
    assert!(!session.current_session().is_authenticated);
}

// ==================================================================================================
// Log Sink Tests
// ==================================================================================================

async fn wait_until_matched(mock: &mockito::Mock) -> bool {
    for _ in 0..100 {
        if mock.matched_async().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_refresh_failure_is_reported_to_log_proxy() {
    let mut server = Server::new_async().await;
    let report = server
        .mock("POST", "/api/errors")
        .match_body(Matcher::PartialJson(json!({ "info": "Failed to refresh token" })))
        .with_status(201)
        .expect(1)
        .create_async()
        .await;
    server
        .mock("GET", "/data")
        .with_status(401)
        .create_async()
        .await;
    server
        .mock("POST", "/auth/refresh")
        .with_status(500)
        .create_async()
        .await;

    let sink = Arc::new(HttpLogSink::new(reqwest::Client::new(), &server.url(), false));
    let store = Arc::new(MemoryStore::new());
    store.set(&jwt("lando", 3600), "refresh").unwrap();
    let session = session_with_sink(&server.url(), store, sink);

    let request = session.gateway().get("/data").build().unwrap();
    assert!(session.gateway().send(request).await.is_err());

    assert!(wait_until_matched(&report).await, "error report never arrived");
}

#[tokio::test]
async fn test_verbose_info_is_shipped() {
    let mut server = Server::new_async().await;
    let info = server
        .mock("POST", "/api/info")
        .match_body(Matcher::PartialJson(json!({ "message": "hello" })))
        .with_status(201)
        .expect(1)
        .create_async()
        .await;

    let sink = HttpLogSink::new(reqwest::Client::new(), &server.url(), true);
    sink.info("hello");

    assert!(wait_until_matched(&info).await, "info report never arrived");
}

//! Common test utilities for E2E tests
//!
//! `TestServer` runs a fedispatch node on a random local port.
//! `FakeRemote` plays a remote pump server: host-meta, lrdd, client
//! registration (with dialback back to the sender) and an OAuth-checked inbox.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use fedispatch::data::{ItemKind, LocalUser};
use fedispatch::federation::{AudienceEntry, Identity, parse_dialback_header, verify_oauth1};
use fedispatch::{AppState, config};
use serde::Deserialize;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance with workers running
    pub async fn new() -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        // Bind first: the node's domain must be the address peers dial back to
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = test_config(&addr.to_string(), db_path);

        // Initialize app state
        let state = AppState::new(config).await.unwrap();
        state.start_workers();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        let app = fedispatch::build_router(state.clone());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Create a local user
    pub async fn create_user(&self, username: &str) -> LocalUser {
        self.state
            .db
            .insert_local_user(username, Some(username))
            .await
            .unwrap()
    }

    /// Audience entry for a single address (`alice` or `bob@host`)
    pub async fn entry(&self, address: &str) -> AudienceEntry {
        let mut identities = self
            .state
            .classifier
            .audience_from_addresses(address)
            .await
            .unwrap();
        assert_eq!(identities.len(), 1, "{} did not resolve", address);
        AudienceEntry::Identity(identities.remove(0))
    }

    pub async fn remote_identity(&self, webfinger: &str) -> Identity {
        match self.entry(webfinger).await {
            AudienceEntry::Identity(identity) => identity,
            other => panic!("unexpected entry {:?}", other),
        }
    }

    /// Activity ids in a user's inbox, oldest first
    pub async fn inbox(&self, user: &LocalUser) -> Vec<String> {
        self.state
            .db
            .get_collection_items(&user.inbox_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|item| item.item_kind == ItemKind::Activity.as_str())
            .map(|item| item.item_id)
            .collect()
    }

    /// Wait for every queued job (including retries) to finish
    pub async fn wait_idle(&self) {
        assert!(
            self.state.queue.wait_idle(Duration::from_secs(15)).await,
            "queue did not drain"
        );
    }
}

/// Node configuration with fast retries
pub fn test_config(domain: &str, db_path: std::path::PathBuf) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: domain.to_string(),
            protocol: "http".to_string(),
        },
        database: config::DatabaseConfig { path: db_path },
        federation: config::FederationConfig {
            http_timeout_secs: 5,
            user_agent: "fedispatch-test".to_string(),
            application_name: "fedispatch-test".to_string(),
            dialback_secret: "test-dialback-secret-32-bytes-long!!".to_string(),
        },
        queue: config::QueueConfig {
            workers: 2,
            max_attempts: 3,
            base_backoff_ms: 10,
            max_backoff_ms: 50,
        },
        logging: config::LoggingConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        },
    }
}

// =============================================================================
// Fake remote server
// =============================================================================

/// Knobs and observations for a `FakeRemote`
pub struct RemoteState {
    pub addr: SocketAddr,
    /// Advertise an lrdd template in host-meta
    pub serve_lrdd: bool,
    /// Inbox answers 503 this many times before accepting
    pub inbox_failures: AtomicUsize,
    pub inbox_attempts: AtomicUsize,
    pub registrations: AtomicUsize,
    /// Dialback verifications that succeeded
    pub dialbacks: AtomicUsize,
    /// client_id -> client_secret
    pub clients: Mutex<HashMap<String, String>>,
    /// (username, body) of every accepted activity
    pub received: Mutex<Vec<(String, Value)>>,
    http: reqwest::Client,
}

pub struct FakeRemote {
    pub state: Arc<RemoteState>,
}

impl FakeRemote {
    pub async fn start() -> Self {
        Self::start_with(true, 0).await
    }

    pub async fn start_with(serve_lrdd: bool, inbox_failures: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let state = Arc::new(RemoteState {
            addr,
            serve_lrdd,
            inbox_failures: AtomicUsize::new(inbox_failures),
            inbox_attempts: AtomicUsize::new(0),
            registrations: AtomicUsize::new(0),
            dialbacks: AtomicUsize::new(0),
            clients: Mutex::new(HashMap::new()),
            received: Mutex::new(Vec::new()),
            http: reqwest::Client::new(),
        });

        let app = Router::new()
            .route("/.well-known/host-meta", get(remote_host_meta))
            .route("/api/lrdd", get(remote_lrdd))
            .route("/api/client/register", post(remote_register))
            .route("/api/user/:username/inbox", post(remote_inbox))
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { state }
    }

    /// Handle of an account on this server
    pub fn handle(&self, username: &str) -> String {
        format!("{}@{}", username, self.state.addr)
    }

    pub fn registrations(&self) -> usize {
        self.state.registrations.load(Ordering::SeqCst)
    }

    pub fn inbox_attempts(&self) -> usize {
        self.state.inbox_attempts.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<(String, Value)> {
        self.state.received.lock().unwrap().clone()
    }
}

async fn remote_host_meta(State(state): State<Arc<RemoteState>>) -> Json<Value> {
    let mut links = vec![json!({
        "rel": "registration_endpoint",
        "href": format!("http://{}/api/client/register", state.addr),
    })];
    if state.serve_lrdd {
        links.push(json!({
            "rel": "lrdd",
            "type": "application/json",
            "template": format!("http://{}/api/lrdd?resource={{uri}}", state.addr),
        }));
    }
    Json(json!({ "links": links }))
}

#[derive(Deserialize)]
struct ResourceQuery {
    resource: String,
}

async fn remote_lrdd(
    State(state): State<Arc<RemoteState>>,
    Query(query): Query<ResourceQuery>,
) -> Json<Value> {
    let resource = query.resource.trim_start_matches("acct:");
    let username = resource.split('@').next().unwrap_or_default();
    Json(json!({
        "subject": format!("acct:{}", resource),
        "links": [{
            "rel": "activity-inbox",
            "href": format!("http://{}/api/user/{}/inbox", state.addr, username),
        }],
    }))
}

/// Client registration: dials back to the sender's host before issuing
/// credentials.
async fn remote_register(
    State(state): State<Arc<RemoteState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    if body["type"] != "client_associate" {
        return Err(StatusCode::BAD_REQUEST);
    }

    let authorization = header(&headers, "authorization").ok_or(StatusCode::UNAUTHORIZED)?;
    let date = header(&headers, "date").ok_or(StatusCode::UNAUTHORIZED)?;
    let dialback = parse_dialback_header(&authorization).map_err(|_| StatusCode::UNAUTHORIZED)?;
    let host = dialback
        .webfinger
        .rsplit_once('@')
        .map(|(_, host)| host.to_string())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let form = format!(
        "webfinger={}&token={}&date={}&url={}",
        urlencoding::encode(&dialback.webfinger),
        urlencoding::encode(&dialback.token),
        urlencoding::encode(&date),
        urlencoding::encode(&format!("http://{}/api/client/register", state.addr)),
    );
    let verified = state
        .http
        .post(format!("http://{}/api/dialback", host))
        .header("content-type", "application/x-www-form-urlencoded")
        .body(form)
        .send()
        .await
        .map_err(|_| StatusCode::UNAUTHORIZED)?;
    if verified.status() != reqwest::StatusCode::OK {
        return Err(StatusCode::UNAUTHORIZED);
    }
    state.dialbacks.fetch_add(1, Ordering::SeqCst);

    let n = state.registrations.fetch_add(1, Ordering::SeqCst) + 1;
    let client_id = format!("client-{}", n);
    let client_secret = format!("secret-{}", n);
    state
        .clients
        .lock()
        .unwrap()
        .insert(client_id.clone(), client_secret.clone());

    Ok(Json(json!({
        "client_id": client_id,
        "client_secret": client_secret,
        "expires_at": 0,
    })))
}

async fn remote_inbox(
    State(state): State<Arc<RemoteState>>,
    Path(username): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    state.inbox_attempts.fetch_add(1, Ordering::SeqCst);

    let Some(authorization) = header(&headers, "authorization") else {
        return StatusCode::UNAUTHORIZED;
    };
    let Ok(params) = fedispatch::federation::parse_oauth_header(&authorization) else {
        return StatusCode::UNAUTHORIZED;
    };
    let Some(secret) = params
        .get("oauth_consumer_key")
        .and_then(|key| state.clients.lock().unwrap().get(key).cloned())
    else {
        return StatusCode::UNAUTHORIZED;
    };

    let url = format!("http://{}/api/user/{}/inbox", state.addr, username);
    if verify_oauth1(&authorization, &secret, "POST", &url, Some(&body)).is_err() {
        return StatusCode::UNAUTHORIZED;
    }

    let failures_left = state.inbox_failures.load(Ordering::SeqCst);
    if failures_left > 0 {
        state.inbox_failures.store(failures_left - 1, Ordering::SeqCst);
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    let Ok(activity) = serde_json::from_slice::<Value>(&body) else {
        return StatusCode::BAD_REQUEST;
    };
    state.received.lock().unwrap().push((username, activity));
    StatusCode::OK
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
}

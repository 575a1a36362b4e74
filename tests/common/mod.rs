// Shared test harness: an auth engine wired to in-memory stores plus a
// stub provider server that records every token request it receives.

#![allow(dead_code)]

use axum::{extract::State, http::HeaderMap, response::IntoResponse, routing::post, Router};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use junction::config::Config;
use junction::connection::ConnectionStore;
use junction::flow::AuthEngine;
use junction::hooks::{HookRunner, NoopScheduler};
use junction::notify::{Notifier, WebhookSender, WsClients};
use junction::probe::{DirectProxy, VerificationProber};
use junction::provider::{Environment, IntegrationConfig, ProviderRegistry, TenantRegistry};
use junction::refresh::{RefreshCoordinator, RefreshPolicy};
use junction::session::SessionStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One recorded request to the stub provider.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub path: String,
    pub body: String,
    pub authorization: Option<String>,
}

#[derive(Clone)]
struct StubState {
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    response: Arc<Mutex<(u16, String, String)>>,
    delay_ms: Arc<AtomicUsize>,
}

/// In-process provider endpoint. Every POST is recorded and answered with
/// the configured response.
pub struct StubProvider {
    pub url: String,
    state: StubState,
}

impl StubProvider {
    pub async fn spawn() -> Self {
        let state = StubState {
            hits: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
            response: Arc::new(Mutex::new((
                200,
                "application/json".to_string(),
                r#"{"access_token":"t"}"#.to_string(),
            ))),
            delay_ms: Arc::new(AtomicUsize::new(0)),
        };

        let app = Router::new()
            .route("/*path", post(record))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{addr}"),
            state,
        }
    }

    pub fn set_json_response(&self, status: u16, body: serde_json::Value) {
        *self.state.response.lock().unwrap() =
            (status, "application/json".to_string(), body.to_string());
    }

    pub fn set_form_response(&self, status: u16, body: &str) {
        *self.state.response.lock().unwrap() = (
            status,
            "application/x-www-form-urlencoded".to_string(),
            body.to_string(),
        );
    }

    pub fn set_delay_ms(&self, delay: usize) {
        self.state.delay_ms.store(delay, Ordering::SeqCst);
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> RecordedRequest {
        self.requests().last().cloned().expect("no request recorded")
    }
}

async fn record(
    State(state): State<StubState>,
    axum::extract::Path(path): axum::extract::Path<String>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    state.requests.lock().unwrap().push(RecordedRequest {
        path,
        body,
        authorization: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    });

    let delay = state.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(delay as u64)).await;
    }

    let (status, content_type, body) = state.response.lock().unwrap().clone();
    (
        axum::http::StatusCode::from_u16(status).unwrap(),
        [("content-type", content_type)],
        body,
    )
}

pub struct TestHarness {
    pub engine: Arc<AuthEngine>,
    pub sessions: Arc<SessionStore>,
    pub connections: Arc<ConnectionStore>,
    pub tenants: Arc<TenantRegistry>,
    pub providers: Arc<ProviderRegistry>,
    pub notifier: Arc<Notifier>,
    pub hooks: Arc<HookRunner>,
    pub http: reqwest::Client,
}

pub fn test_key() -> String {
    BASE64.encode([0u8; 32])
}

pub fn test_environment() -> Environment {
    Environment {
        id: 1,
        secret_key: "sk-test".to_string(),
        public_key: "pk-test".to_string(),
        hmac_enabled: false,
        hmac_key: None,
        webhook_url: None,
        webhook_secret: None,
    }
}

pub fn github_integration() -> IntegrationConfig {
    IntegrationConfig {
        provider_config_key: "github-prod".to_string(),
        provider: "github".to_string(),
        oauth_client_id: "abc".to_string(),
        oauth_client_secret: "shh".to_string(),
        oauth_scopes: Some("repo,user".to_string()),
        app_link: None,
        custom: None,
    }
}

/// Builds an engine over in-memory stores for the given provider YAML and
/// integrations.
pub fn build_harness(providers_yaml: &str, integrations: Vec<IntegrationConfig>) -> TestHarness {
    let providers = Arc::new(ProviderRegistry::from_yaml(providers_yaml).unwrap());

    let mut tenants = TenantRegistry::new();
    tenants.add_environment(test_environment());
    for integration in integrations {
        tenants.add_integration(1, integration);
    }
    let tenants = Arc::new(tenants);

    let sessions = Arc::new(SessionStore::new(":memory:").unwrap());
    let connections = Arc::new(ConnectionStore::new(":memory:", &test_key()).unwrap());
    let http = reqwest::Client::new();

    let notifier = Arc::new(Notifier::new(WsClients::new(), false));
    let hooks = Arc::new(HookRunner::new(
        Arc::clone(&connections),
        Arc::new(NoopScheduler),
        WebhookSender::new(http.clone()),
        Arc::clone(&notifier),
        None,
    ));
    let prober = Arc::new(VerificationProber::new(Box::new(DirectProxy::new(
        http.clone(),
    ))));

    let config = Config {
        encryption_key: test_key(),
        server_url: "https://broker.example.com".to_string(),
        db_path: ":memory:".to_string(),
        port: 3003,
        log_level: "info".to_string(),
        websockets_path: "/ws".to_string(),
        telemetry: false,
        connections_with_scripts_cap: None,
        upstream_timeout_secs: 30,
        refresh_skew_secs: 900,
    };

    let engine = Arc::new(AuthEngine {
        providers: Arc::clone(&providers),
        tenants: Arc::clone(&tenants),
        sessions: Arc::clone(&sessions),
        connections: Arc::clone(&connections),
        hooks: Arc::clone(&hooks),
        notifier: Arc::clone(&notifier),
        prober,
        http: http.clone(),
        config,
    });

    TestHarness {
        engine,
        sessions,
        connections,
        tenants,
        providers,
        notifier,
        hooks,
        http,
    }
}

impl TestHarness {
    pub fn refresh_coordinator(&self, policy: RefreshPolicy) -> RefreshCoordinator {
        RefreshCoordinator::new(
            Arc::clone(&self.connections),
            Arc::clone(&self.providers),
            Arc::clone(&self.tenants),
            Arc::clone(&self.hooks),
            Arc::clone(&self.notifier),
            self.http.clone(),
            policy,
        )
    }
}

/// Pulls one query parameter out of a URL.
pub fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=')?;
        if key == name {
            return Some(urlencoding::decode(value).unwrap().to_string());
        }
    }
    None
}

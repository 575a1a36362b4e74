//! HTTP authorization surface.
//!
//! Routes:
//! - `GET /oauth/connect/:provider_config_key` — start an interactive
//!   handshake, 302 to the provider (errors go to the UI websocket client
//!   when one is attached).
//! - `GET /oauth/callback` — provider redirect target; always 200, the
//!   outcome is published to the originating websocket client.
//! - `POST /oauth2/cc/:provider_config_key` — synchronous client
//!   credentials exchange.
//! - `POST /{api,basic,jwt,signature,tableau,two-step,bill,tba}-auth/:provider_config_key`
//!   — synchronous credential creation for the non-redirect modes.
//! - `GET <websockets path>` — UI event channel.

mod callback;
mod websocket;

pub use websocket::ws_handler;

use crate::auth::verify_digest;
use crate::error::AuthError;
use crate::flow::{AuthEngine, CredentialInput, StartOutcome, StartRequest};
use crate::provider::{AuthMode, Environment};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Redirect, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Shared state for the authorization API.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AuthEngine>,
}

/// Builds the authorization router.
pub fn create_auth_router(state: AppState, websockets_path: &str) -> Router {
    Router::new()
        .route("/oauth/connect/:provider_config_key", get(oauth_connect))
        .route("/oauth/callback", get(callback::oauth_callback))
        .route("/oauth2/cc/:provider_config_key", post(oauth2_client_credentials))
        .route("/api-auth/:provider_config_key", post(credential_auth))
        .route("/basic-auth/:provider_config_key", post(credential_auth))
        .route("/jwt-auth/:provider_config_key", post(credential_auth))
        .route("/signature-auth/:provider_config_key", post(credential_auth))
        .route("/tableau-auth/:provider_config_key", post(credential_auth))
        .route("/two-step-auth/:provider_config_key", post(credential_auth))
        .route("/bill-auth/:provider_config_key", post(credential_auth))
        .route("/tba-auth/:provider_config_key", post(credential_auth))
        .route(websockets_path, get(ws_handler))
        .with_state(Arc::new(state))
}

/// JSON error body: stable code plus user-facing message.
pub(crate) fn error_response(error: &AuthError) -> Response {
    let body = Json(json!({
        "error": {
            "code": error.code(),
            "message": error.to_string(),
        }
    }));
    (error.status(), body).into_response()
}

/// Query parameters accepted by `/oauth/connect`.
#[derive(Debug, Deserialize)]
pub(crate) struct ConnectQuery {
    connection_id: Option<String>,
    ws_client_id: Option<String>,
    user_scope: Option<String>,
    /// JSON-encoded map of connection config entries.
    params: Option<String>,
    /// JSON-encoded map of authorization param overrides.
    authorization_params: Option<String>,
    /// JSON-encoded map; accepts `oauth_client_id_override` and
    /// `oauth_client_secret_override`.
    credentials: Option<String>,
    hmac: Option<String>,
    public_key: Option<String>,
}

/// Resolves the environment from a public key (browser flows) or a bearer
/// secret key (server flows).
pub(crate) fn resolve_environment(
    engine: &AuthEngine,
    headers: &HeaderMap,
    public_key: Option<&str>,
) -> Result<Environment, AuthError> {
    if let Some(key) = public_key {
        return engine
            .tenants
            .environment_by_public_key(key)
            .cloned()
            .ok_or_else(|| AuthError::Unknown(anyhow::anyhow!("unknown public key")));
    }

    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    match bearer {
        Some(secret) => engine
            .tenants
            .environment_by_secret_key(secret)
            .cloned()
            .ok_or_else(|| AuthError::Unknown(anyhow::anyhow!("unknown secret key"))),
        None => Err(AuthError::Unknown(anyhow::anyhow!("missing credentials"))),
    }
}

/// Enforces the tenant's HMAC policy on a start call.
pub(crate) fn check_hmac(
    environment: &Environment,
    supplied: Option<&str>,
    provider_config_key: &str,
    connection_id: Option<&str>,
) -> Result<(), AuthError> {
    if !environment.hmac_enabled {
        return Ok(());
    }
    let secret = environment.hmac_key.as_deref().unwrap_or_default();
    verify_digest(secret, supplied, provider_config_key, connection_id)
}

fn parse_json_map(raw: Option<&str>) -> Result<Map<String, Value>, AuthError> {
    match raw {
        None | Some("") => Ok(Map::new()),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| AuthError::Unknown(anyhow::anyhow!("malformed JSON parameter: {e}"))),
    }
}

/// GET /oauth/connect/:provider_config_key
async fn oauth_connect(
    State(state): State<Arc<AppState>>,
    Path(provider_config_key): Path<String>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
) -> Response {
    let engine = &state.engine;
    let ws_client_id = query.ws_client_id.clone();

    match start_connect(engine, &provider_config_key, query, &headers).await {
        Ok(StartOutcome::Redirect { url }) => Redirect::temporary(&url).into_response(),
        Ok(StartOutcome::Completed(completion)) => Json(json!({
            "providerConfigKey": completion.provider_config_key,
            "connectionId": completion.connection_id,
        }))
        .into_response(),
        Err(error) => {
            // The UI client, when present, is the primary error channel.
            engine.notifier.publish_error(ws_client_id.as_deref(), &error);
            error_response(&error)
        }
    }
}

async fn start_connect(
    engine: &AuthEngine,
    provider_config_key: &str,
    query: ConnectQuery,
    headers: &HeaderMap,
) -> Result<StartOutcome, AuthError> {
    let environment = resolve_environment(engine, headers, query.public_key.as_deref())?;
    check_hmac(
        &environment,
        query.hmac.as_deref(),
        provider_config_key,
        query.connection_id.as_deref(),
    )?;

    let ctx = engine.resolve(&environment, provider_config_key)?;

    let params = parse_json_map(query.params.as_deref())?;
    let authorization_params: HashMap<String, Value> =
        parse_json_map(query.authorization_params.as_deref())?
            .into_iter()
            .collect();
    let credentials = parse_json_map(query.credentials.as_deref())?;

    let connection_id = query
        .connection_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    debug!(provider_config_key, connection_id = %connection_id, "Connect request accepted");

    let request = StartRequest {
        connection_id,
        params,
        authorization_params,
        user_scope: query.user_scope,
        ws_client_id: query.ws_client_id,
        client_id_override: credentials
            .get("oauth_client_id_override")
            .and_then(Value::as_str)
            .map(str::to_string),
        client_secret_override: credentials
            .get("oauth_client_secret_override")
            .and_then(Value::as_str)
            .map(str::to_string),
        activity_log_id: Uuid::new_v4().to_string(),
    };

    engine.start(&ctx, request).await
}

/// Body of `POST /oauth2/cc/:provider_config_key`.
#[derive(Debug, Deserialize)]
struct ClientCredentialsBody {
    client_id: String,
    client_secret: String,
    #[serde(default)]
    params: Option<Map<String, Value>>,
    #[serde(default)]
    connection_id: Option<String>,
    #[serde(default)]
    hmac: Option<String>,
}

/// POST /oauth2/cc/:provider_config_key
async fn oauth2_client_credentials(
    State(state): State<Arc<AppState>>,
    Path(provider_config_key): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ClientCredentialsBody>,
) -> Response {
    let engine = &state.engine;
    let result: Result<_, AuthError> = async {
        let environment = resolve_environment(engine, &headers, None)?;
        check_hmac(
            &environment,
            body.hmac.as_deref(),
            &provider_config_key,
            body.connection_id.as_deref(),
        )?;

        let ctx = engine.resolve(&environment, &provider_config_key)?;
        if ctx.provider.auth_mode != AuthMode::OAuth2Cc {
            return Err(AuthError::InvalidAuthMode(ctx.provider.auth_mode.to_string()));
        }

        let connection_id = body
            .connection_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        engine
            .client_credentials(
                &ctx,
                &connection_id,
                &body.client_id,
                &body.client_secret,
                body.params.clone().unwrap_or_default(),
            )
            .await
    }
    .await;

    match result {
        Ok(completion) => Json(json!({
            "providerConfigKey": completion.provider_config_key,
            "connectionId": completion.connection_id,
        }))
        .into_response(),
        Err(error) => error_response(&error),
    }
}

/// Body of the credential auth endpoints: mode-specific fields plus common
/// plumbing.
#[derive(Debug, Deserialize)]
struct CredentialAuthBody {
    #[serde(default)]
    connection_id: Option<String>,
    #[serde(default)]
    params: Option<Map<String, Value>>,
    #[serde(default)]
    hmac: Option<String>,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

/// POST /{mode}-auth/:provider_config_key
async fn credential_auth(
    State(state): State<Arc<AppState>>,
    Path(provider_config_key): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CredentialAuthBody>,
) -> Response {
    let engine = &state.engine;
    let result: Result<_, AuthError> = async {
        let environment = resolve_environment(engine, &headers, None)?;
        check_hmac(
            &environment,
            body.hmac.as_deref(),
            &provider_config_key,
            body.connection_id.as_deref(),
        )?;

        let ctx = engine.resolve(&environment, &provider_config_key)?;
        if ctx.provider.auth_mode.is_interactive() || ctx.provider.auth_mode == AuthMode::OAuth2Cc {
            return Err(AuthError::InvalidAuthMode(ctx.provider.auth_mode.to_string()));
        }

        let connection_id = body
            .connection_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        engine
            .create_credential_connection(
                &ctx,
                &connection_id,
                body.params.clone().unwrap_or_default(),
                CredentialInput::new(body.fields.clone()),
            )
            .await
    }
    .await;

    match result {
        Ok(completion) => (
            StatusCode::OK,
            Json(json!({
                "providerConfigKey": completion.provider_config_key,
                "connectionId": completion.connection_id,
            })),
        )
            .into_response(),
        Err(error) => error_response(&error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn environment(hmac_enabled: bool) -> Environment {
        Environment {
            id: 1,
            secret_key: "sk".to_string(),
            public_key: "pk".to_string(),
            hmac_enabled,
            hmac_key: Some("hmac-secret".to_string()),
            webhook_url: None,
            webhook_secret: None,
        }
    }

    #[test]
    fn test_hmac_disabled_skips_check() {
        assert!(check_hmac(&environment(false), None, "key", None).is_ok());
    }

    #[test]
    fn test_hmac_enabled_requires_digest() {
        let err = check_hmac(&environment(true), None, "key", None).unwrap_err();
        assert_eq!(err.code(), "missing_hmac");
    }

    #[test]
    fn test_hmac_enabled_accepts_valid_digest() {
        let digest = crate::auth::compute_digest("hmac-secret", "key", Some("conn"));
        assert!(check_hmac(&environment(true), Some(&digest), "key", Some("conn")).is_ok());
    }

    #[test]
    fn test_parse_json_map() {
        assert!(parse_json_map(None).unwrap().is_empty());
        assert!(parse_json_map(Some("")).unwrap().is_empty());
        let map = parse_json_map(Some(r#"{"subdomain":"acme"}"#)).unwrap();
        assert_eq!(map["subdomain"], "acme");
        assert!(parse_json_map(Some("not-json")).is_err());
    }

    #[test]
    fn test_credential_body_flattens_mode_fields() {
        let body: CredentialAuthBody = serde_json::from_str(
            r#"{"connection_id": "c1", "api_key": "sk-123", "params": {"region": "eu"}}"#,
        )
        .unwrap();
        assert_eq!(body.connection_id.as_deref(), Some("c1"));
        assert_eq!(body.fields["api_key"], "sk-123");
        assert_eq!(body.params.unwrap()["region"], "eu");
    }
}

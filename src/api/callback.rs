//! Provider callback endpoint.
//!
//! `GET /oauth/callback` is the redirect target registered with every
//! provider. It completes with 200 regardless of outcome; success and
//! failure are published to the originating UI websocket client so no
//! handshake state leaks to whoever controls the redirect.

use super::AppState;
use crate::error::AuthError;
use crate::flow::CallbackParams;
use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{Html, IntoResponse, Redirect, Response},
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

const CLOSE_PAGE: &str =
    "<html><body>Authorization complete. You can close this window.</body></html>";

/// GET /oauth/callback
pub(crate) async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Query(raw): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let engine = Arc::clone(&state.engine);
    let callback = to_callback_params(&raw);

    // Provider-side denial: the user backed out of the consent screen.
    if let Some(error) = raw.get("error") {
        warn!(error = %error, "Provider returned an authorization error");
        engine
            .notifier
            .publish_error(None, &AuthError::InvalidCallbackOauth2);
        return Html(CLOSE_PAGE).into_response();
    }

    // A GitHub-style app update posts back without a fresh handshake; send
    // the user where they came from.
    if callback.setup_action.as_deref() == Some("update") {
        if let Some(referer) = headers.get("referer").and_then(|v| v.to_str().ok()) {
            debug!("App update callback; redirecting to referer");
            return Redirect::temporary(referer).into_response();
        }
        return Html(CLOSE_PAGE).into_response();
    }

    // The upsert and hook pipeline are server-authoritative: run them to
    // completion even if the user agent disconnects mid-callback.
    let notifier = Arc::clone(&engine.notifier);
    let handle = tokio::spawn(async move {
        match engine.finish(callback).await {
            Ok(completion) => {
                notifier.publish_success(
                    completion.web_socket_client_id.as_deref(),
                    &completion.provider_config_key,
                    &completion.connection_id,
                );
            }
            Err(error) => {
                // The session is gone; the websocket target went with it.
                notifier.publish_error(None, &error);
            }
        }
    });
    let _ = handle.await;

    Html(CLOSE_PAGE).into_response()
}

fn to_callback_params(raw: &HashMap<String, String>) -> CallbackParams {
    let mut all = Map::new();
    for (key, value) in raw {
        all.insert(key.clone(), Value::String(value.clone()));
    }
    CallbackParams {
        state: raw.get("state").cloned(),
        code: raw.get("code").cloned(),
        oauth_token: raw.get("oauth_token").cloned(),
        oauth_verifier: raw.get("oauth_verifier").cloned(),
        installation_id: raw.get("installation_id").cloned(),
        setup_action: raw.get("setup_action").cloned(),
        all,
    }
}

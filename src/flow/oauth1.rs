//! OAuth 1.0a driver (RFC 5849, HMAC-SHA1).
//!
//! Three-legged flow: obtain a request token, send the user to authorize
//! it, exchange the verified token for an access token. The request-token
//! secret lives in the session between the two legs.

use super::{
    interpolation_ctx, AuthEngine, CallbackParams, FinishResult, FlowContext, StartOutcome,
    StartRequest,
};
use crate::connection::Credentials;
use crate::error::AuthError;
use crate::interpolate::{interpolate, Encode};
use crate::session::OAuthSession;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::Map;
use sha1::Sha1;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

type HmacSha1 = Hmac<Sha1>;

/// Starts the OAuth1 handshake: fetch a request token, persist the session
/// with its secret, redirect to the authorize page.
pub(crate) async fn start(
    engine: &AuthEngine,
    ctx: &FlowContext,
    request: StartRequest,
) -> Result<StartOutcome, AuthError> {
    let provider = &ctx.provider;
    let mut connection_config = request.params.clone();
    super::stash_overrides(&mut connection_config, &request);
    let ictx = interpolation_ctx(&connection_config, &ctx.integration);

    let request_url = interpolate(
        provider.request_url.as_deref().expect("validated at load time"),
        &ictx,
        Encode::None,
    )?;
    let authorize_url = interpolate(
        provider
            .authorization_url
            .as_deref()
            .expect("validated at load time"),
        &ictx,
        Encode::None,
    )?;

    let mut session = OAuthSession::new(
        ctx.environment.id,
        &ctx.integration.provider_config_key,
        &ctx.integration.provider,
        provider.auth_mode,
        &request.connection_id,
        &engine.config.callback_url(),
        connection_config,
        request.ws_client_id.clone(),
        &request.activity_log_id,
    );

    // The state rides inside oauth_callback; OAuth1 providers echo the
    // callback URL untouched.
    let callback = format!("{}?state={}", session.callback_url, session.id);
    let oauth_params = vec![("oauth_callback".to_string(), callback)];

    let body = signed_request(
        engine,
        &request_url,
        oauth_params,
        &ctx.integration.oauth_client_id,
        &ctx.integration.oauth_client_secret,
        None,
        None,
    )
    .await
    .map_err(|e| match e {
        AuthError::UpstreamTimeout => AuthError::UpstreamTimeout,
        other => AuthError::TokenExternalError(other.to_string()),
    })?;

    let fields: HashMap<String, String> = serde_urlencoded::from_str(&body)
        .map_err(|e| AuthError::TokenParsingError(e.to_string()))?;
    let oauth_token = fields
        .get("oauth_token")
        .ok_or_else(|| AuthError::TokenParsingError("request token response has no oauth_token".to_string()))?
        .clone();
    let token_secret = fields
        .get("oauth_token_secret")
        .ok_or_else(|| {
            AuthError::TokenParsingError("request token response has no oauth_token_secret".to_string())
        })?
        .clone();

    session.request_token_secret = Some(token_secret);
    engine.sessions.create(&session).map_err(AuthError::Unknown)?;

    let separator = if authorize_url.contains('?') { '&' } else { '?' };
    let url = format!(
        "{authorize_url}{separator}oauth_token={}",
        urlencoding::encode(&oauth_token)
    );
    debug!(session_id = %session.id, "Redirecting to OAuth1 authorize endpoint");
    Ok(StartOutcome::Redirect { url })
}

/// Exchanges the verified request token for an access token.
pub(crate) async fn finish(
    engine: &AuthEngine,
    ctx: &FlowContext,
    session: &OAuthSession,
    callback: &CallbackParams,
) -> Result<FinishResult, AuthError> {
    let oauth_token = callback
        .oauth_token
        .as_deref()
        .ok_or(AuthError::InvalidCallbackOauth1)?;
    let oauth_verifier = callback
        .oauth_verifier
        .as_deref()
        .ok_or(AuthError::InvalidCallbackOauth1)?;
    let request_token_secret = session
        .request_token_secret
        .as_deref()
        .ok_or(AuthError::InvalidCallbackOauth1)?;

    let ictx = interpolation_ctx(&session.connection_config, &ctx.integration);
    let access_url = super::oauth2::token_endpoint(&ctx.provider, &ictx, ctx.provider.auth_mode)?;

    let oauth_params = vec![
        ("oauth_token".to_string(), oauth_token.to_string()),
        ("oauth_verifier".to_string(), oauth_verifier.to_string()),
    ];
    let body = signed_request(
        engine,
        &access_url,
        oauth_params,
        &ctx.integration.oauth_client_id,
        &ctx.integration.oauth_client_secret,
        Some(oauth_token),
        Some(request_token_secret),
    )
    .await?;

    let fields: HashMap<String, String> = serde_urlencoded::from_str(&body)
        .map_err(|e| AuthError::TokenParsingError(e.to_string()))?;
    let access_token = fields
        .get("oauth_token")
        .ok_or_else(|| AuthError::TokenParsingError("access token response has no oauth_token".to_string()))?;
    let access_secret = fields.get("oauth_token_secret").ok_or_else(|| {
        AuthError::TokenParsingError("access token response has no oauth_token_secret".to_string())
    })?;

    Ok(FinishResult {
        credentials: Credentials::OAuth1 {
            oauth_token: access_token.clone(),
            oauth_token_secret: access_secret.clone(),
        },
        connection_config: session.connection_config.clone(),
        metadata: Map::new(),
        pending: false,
    })
}

/// POSTs to an OAuth1 endpoint with a signed Authorization header and
/// returns the response body.
async fn signed_request(
    engine: &AuthEngine,
    url: &str,
    extra_params: Vec<(String, String)>,
    consumer_key: &str,
    consumer_secret: &str,
    token: Option<&str>,
    token_secret: Option<&str>,
) -> Result<String, AuthError> {
    let header = authorization_header(
        "POST",
        url,
        extra_params,
        consumer_key,
        consumer_secret,
        token,
        token_secret,
        &Uuid::new_v4().simple().to_string(),
        Utc::now().timestamp(),
    );

    let response = engine
        .http
        .post(url)
        .header("Authorization", header)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                AuthError::UpstreamTimeout
            } else {
                AuthError::TokenExternalError(e.to_string())
            }
        })?;

    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(AuthError::TokenExternalError(format!("status {status}: {text}")));
    }
    Ok(text)
}

/// Builds the `Authorization: OAuth ...` header for one request.
#[allow(clippy::too_many_arguments)]
fn authorization_header(
    method: &str,
    url: &str,
    extra_params: Vec<(String, String)>,
    consumer_key: &str,
    consumer_secret: &str,
    token: Option<&str>,
    token_secret: Option<&str>,
    nonce: &str,
    timestamp: i64,
) -> String {
    let mut params: Vec<(String, String)> = vec![
        ("oauth_consumer_key".to_string(), consumer_key.to_string()),
        ("oauth_nonce".to_string(), nonce.to_string()),
        ("oauth_signature_method".to_string(), "HMAC-SHA1".to_string()),
        ("oauth_timestamp".to_string(), timestamp.to_string()),
        ("oauth_version".to_string(), "1.0".to_string()),
    ];
    if let Some(token) = token {
        params.push(("oauth_token".to_string(), token.to_string()));
    }
    params.extend(extra_params);

    let signature = sign(method, url, &params, consumer_secret, token_secret);
    params.push(("oauth_signature".to_string(), signature));

    let fields = params
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("OAuth {fields}")
}

/// HMAC-SHA1 signature over the RFC 5849 base string.
fn sign(
    method: &str,
    url: &str,
    params: &[(String, String)],
    consumer_secret: &str,
    token_secret: Option<&str>,
) -> String {
    // Parameters are percent-encoded, then sorted by encoded name/value.
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (percent_encode(k), percent_encode(v)))
        .collect();
    encoded.sort();

    let normalized = encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    let base = format!(
        "{}&{}&{}",
        method.to_uppercase(),
        percent_encode(url),
        percent_encode(&normalized)
    );

    let signing_key = format!(
        "{}&{}",
        percent_encode(consumer_secret),
        percent_encode(token_secret.unwrap_or(""))
    );
    let mut mac = HmacSha1::new_from_slice(signing_key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(base.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// RFC 3986 strict percent encoding (the RFC 5849 variant: unreserved
/// characters only, everything else escaped, space never `+`).
fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

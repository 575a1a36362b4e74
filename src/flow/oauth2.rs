//! OAuth 2.0 authorization-code and client-credentials drivers.

use super::{
    client_settings, interpolation_ctx, pkce, stash_overrides, AuthEngine, CallbackParams,
    Completion, FinishResult, FlowContext, StartOutcome, StartRequest,
};
use crate::connection::{ConfigOverride, Credentials, OAuth2Credentials};
use crate::error::AuthError;
use crate::interpolate::{interpolate, missing_keys, Encode};
use crate::provider::{AuthMode, BodyFormat, Provider, TokenRequestAuthMethod};
use crate::session::OAuthSession;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

/// Starts the authorization-code handshake: validates templates, persists
/// the session, returns the provider authorize URL.
pub(crate) async fn start(
    engine: &AuthEngine,
    ctx: &FlowContext,
    request: StartRequest,
) -> Result<StartOutcome, AuthError> {
    let provider = &ctx.provider;

    let mut connection_config = request.params.clone();
    stash_overrides(&mut connection_config, &request);
    let ictx = interpolation_ctx(&connection_config, &ctx.integration);

    // Every template must resolve before any state is persisted.
    validate_templates(provider, &ictx)?;

    if let Some(grant_type) = provider
        .token_params
        .as_ref()
        .and_then(|p| p.get("grant_type"))
    {
        if grant_type != "authorization_code" {
            return Err(AuthError::UnknownGrantType(grant_type.clone()));
        }
    }

    // Provider-declared authorization params, overridden by the caller's.
    // A null override removes the parameter.
    let mut auth_params: Vec<(String, String)> = Vec::new();
    if let Some(declared) = &provider.authorization_params {
        let mut keys: Vec<&String> = declared.keys().collect();
        keys.sort();
        for key in keys {
            let value = interpolate(&declared[key], &ictx, Encode::None)?;
            auth_params.push((key.clone(), value));
        }
    }
    for (key, value) in &request.authorization_params {
        auth_params.retain(|(k, _)| k != key);
        match value {
            Value::Null => {}
            Value::String(s) => auth_params.push((key.clone(), s.clone())),
            other => auth_params.push((key.clone(), other.to_string())),
        }
    }

    let session = OAuthSession::new(
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

    if !provider.disable_pkce {
        auth_params.push(("code_challenge".to_string(), pkce::code_challenge(&session.code_verifier)));
        auth_params.push(("code_challenge_method".to_string(), "S256".to_string()));
    }
    if ctx.integration.provider == "slack" {
        if let Some(user_scope) = &request.user_scope {
            auth_params.push(("user_scope".to_string(), user_scope.clone()));
        }
    }

    engine.sessions.create(&session).map_err(AuthError::Unknown)?;

    let settings = client_settings(&ctx.integration, &session.connection_config);
    let url = build_authorize_url(provider, &ictx, &settings.client_id, &session, &settings.scopes, &auth_params)?;

    debug!(session_id = %session.id, "Redirecting to provider authorize endpoint");
    Ok(StartOutcome::Redirect { url })
}

/// Assembles the authorize URL: standard query parameters, then the
/// provider/caller extras, then the fragment and literal-replacement
/// transforms.
fn build_authorize_url(
    provider: &Provider,
    ictx: &Map<String, Value>,
    client_id: &str,
    session: &OAuthSession,
    scopes: &[String],
    extra_params: &[(String, String)],
) -> Result<String, AuthError> {
    let encode = if provider.authorization_url_encode {
        Encode::UrlComponent
    } else {
        Encode::None
    };
    let base = interpolate(
        provider
            .authorization_url
            .as_deref()
            .expect("validated at load time"),
        ictx,
        encode,
    )?;

    let mut pairs: Vec<(String, String)> = vec![
        ("client_id".to_string(), client_id.to_string()),
        ("redirect_uri".to_string(), session.callback_url.clone()),
    ];
    if !scopes.is_empty() {
        pairs.push(("scope".to_string(), scopes.join(provider.scope_separator())));
    }
    pairs.push(("response_type".to_string(), "code".to_string()));
    pairs.push(("state".to_string(), session.id.clone()));
    pairs.extend(extra_params.iter().cloned());

    let query = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let mut url = match &provider.authorization_url_fragment {
        // The query rides after the fragment marker for providers that
        // require it.
        Some(fragment) => format!("{base}#{fragment}?{query}"),
        None if base.contains('?') => format!("{base}&{query}"),
        None => format!("{base}?{query}"),
    };

    if let Some(replacements) = &provider.authorization_url_replacements {
        for (from, to) in replacements {
            url = url.replace(from, to);
        }
    }

    Ok(url)
}

/// Fails with `invalid_connection_config` naming the first template that
/// does not fully resolve.
fn validate_templates(provider: &Provider, ictx: &Map<String, Value>) -> Result<(), AuthError> {
    let mut templates: Vec<&str> = Vec::new();
    if let Some(url) = &provider.authorization_url {
        templates.push(url);
    }
    if let Some(url) = provider.token_url_for(provider.auth_mode) {
        templates.push(url);
    }
    for params in [&provider.authorization_params, &provider.token_params]
        .into_iter()
        .flatten()
    {
        templates.extend(params.values().map(String::as_str));
    }

    for template in templates {
        let missing = missing_keys(template, ictx);
        if !missing.is_empty() {
            return Err(AuthError::InvalidConnectionConfig {
                template: template.to_string(),
                keys: missing,
            });
        }
    }
    Ok(())
}

/// Completes the authorization-code handshake. The session has already been
/// consumed; any failure from here on is terminal for this attempt.
pub(crate) async fn finish(
    engine: &AuthEngine,
    ctx: &FlowContext,
    session: &OAuthSession,
    callback: &CallbackParams,
) -> Result<FinishResult, AuthError> {
    let code = callback.code.as_deref().ok_or(AuthError::InvalidCallbackOauth2)?;

    let settings = client_settings(&ctx.integration, &session.connection_config);
    let ictx = interpolation_ctx(&session.connection_config, &ctx.integration);
    let provider = &ctx.provider;

    let mut params: Vec<(String, String)> = Vec::new();
    if let Some(declared) = &provider.token_params {
        for (key, value) in declared {
            // The driver appends the grant type itself.
            if key == "grant_type" {
                continue;
            }
            params.push((key.clone(), interpolate(value, &ictx, Encode::None)?));
        }
    }
    params.push(("grant_type".to_string(), "authorization_code".to_string()));
    params.push(("code".to_string(), code.to_string()));
    params.push(("redirect_uri".to_string(), session.callback_url.clone()));
    if !provider.disable_pkce {
        params.push(("code_verifier".to_string(), session.code_verifier.clone()));
    }

    let raw = token_request(
        engine,
        provider,
        // CUSTOM descriptors key their token endpoint under OAUTH2.
        token_endpoint(provider, &ictx, AuthMode::OAuth2)?,
        params,
        &settings.client_id,
        &settings.client_secret,
        false,
    )
    .await?;

    let parsed = parse_token_response(raw)?;

    let mut connection_config = session.connection_config.clone();
    let mut metadata = Map::new();
    let callback_map = Value::Object(callback.all.clone());
    harvest(&mut connection_config, &parsed.raw, provider.token_response_metadata.as_deref());
    harvest(&mut connection_config, &callback_map, provider.redirect_uri_metadata.as_deref());

    let mut pending = false;
    if provider.auth_mode == AuthMode::Custom {
        let installation_id = callback
            .installation_id
            .clone()
            .or_else(|| connection_config.get("installation_id").and_then(Value::as_str).map(str::to_string));
        match installation_id {
            Some(id) => {
                connection_config.insert("installation_id".to_string(), Value::String(id));
            }
            None => {
                // App not installed yet: connection exists but stays pending
                // until the provider posts back the installation id.
                pending = true;
                metadata.insert("pending".to_string(), Value::Bool(true));
            }
        }
    }

    Ok(FinishResult {
        credentials: Credentials::OAuth2(OAuth2Credentials {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_at: parsed.expires_at,
            raw: parsed.raw,
            config_override: settings.config_override,
        }),
        connection_config,
        metadata,
        pending,
    })
}

/// Synchronous client-credentials grant (OAUTH2_CC).
pub(crate) async fn client_credentials(
    engine: &AuthEngine,
    ctx: &FlowContext,
    connection_id: &str,
    client_id: &str,
    client_secret: &str,
    params: Map<String, Value>,
) -> Result<Completion, AuthError> {
    let provider = &ctx.provider;
    let ictx = interpolation_ctx(&params, &ctx.integration);

    let mut body: Vec<(String, String)> = Vec::new();
    if let Some(declared) = &provider.token_params {
        for (key, value) in declared {
            if key == "grant_type" {
                continue;
            }
            body.push((key.clone(), interpolate(value, &ictx, Encode::None)?));
        }
    }
    body.push(("grant_type".to_string(), "client_credentials".to_string()));
    let scopes = ctx.integration.scopes();
    if !scopes.is_empty() {
        body.push(("scope".to_string(), scopes.join(provider.scope_separator())));
    }

    let raw = token_request(
        engine,
        provider,
        token_endpoint(provider, &ictx, AuthMode::OAuth2Cc)?,
        body,
        client_id,
        client_secret,
        true,
    )
    .await?;
    let parsed = parse_token_response(raw).map_err(|e| AuthError::Oauth2CcError(e.to_string()))?;

    let credentials = Credentials::OAuth2(OAuth2Credentials {
        access_token: parsed.access_token,
        refresh_token: parsed.refresh_token,
        expires_at: parsed.expires_at,
        raw: parsed.raw,
        // The caller's credentials are what refreshes must use.
        config_override: Some(ConfigOverride {
            oauth_client_id: Some(client_id.to_string()),
            oauth_client_secret: Some(client_secret.to_string()),
            oauth_scopes: None,
        }),
    });

    let session = OAuthSession::new(
        ctx.environment.id,
        &ctx.integration.provider_config_key,
        &ctx.integration.provider,
        AuthMode::OAuth2Cc,
        connection_id,
        "",
        params.clone(),
        None,
        &uuid::Uuid::new_v4().to_string(),
    );
    engine
        .persist_and_notify(
            ctx,
            &session,
            FinishResult {
                credentials,
                connection_config: params,
                metadata: Map::new(),
                pending: false,
            },
        )
        .await
}

/// Interpolated token endpoint for `mode`.
pub(crate) fn token_endpoint(
    provider: &Provider,
    ictx: &Map<String, Value>,
    mode: AuthMode,
) -> Result<String, AuthError> {
    let encode = if provider.token_url_encode {
        Encode::UrlComponent
    } else {
        Encode::None
    };
    let raw = provider
        .token_url_for(mode)
        .ok_or_else(|| AuthError::InvalidAuthMode(mode.to_string()))?;
    interpolate(raw, ictx, encode)
}

/// POSTs a token request, presenting client credentials per the provider's
/// declared auth method and encoding the body per its body format.
pub(crate) async fn token_request(
    engine: &AuthEngine,
    provider: &Provider,
    url: String,
    mut params: Vec<(String, String)>,
    client_id: &str,
    client_secret: &str,
    client_credentials_grant: bool,
) -> Result<Value, AuthError> {
    let mut request = engine.http.post(&url).header("Accept", "application/json");

    match provider.token_request_auth_method {
        TokenRequestAuthMethod::Basic => {
            let token = BASE64.encode(format!("{client_id}:{client_secret}"));
            request = request.header("Authorization", format!("Basic {token}"));
        }
        TokenRequestAuthMethod::Body => {
            params.push(("client_id".to_string(), client_id.to_string()));
            params.push(("client_secret".to_string(), client_secret.to_string()));
        }
    }

    let body: HashMap<String, String> = params.into_iter().collect();
    request = match provider.body_format {
        BodyFormat::Form => request.form(&body),
        BodyFormat::Json => request.json(&body),
    };

    debug!(url = %url, "Token exchange request");
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            AuthError::UpstreamTimeout
        } else if client_credentials_grant {
            AuthError::Oauth2CcError(e.to_string())
        } else {
            AuthError::TokenExternalError(e.to_string())
        }
    })?;

    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    if !status.is_success() {
        let message = format!("status {status}: {text}");
        return Err(if client_credentials_grant {
            AuthError::Oauth2CcError(message)
        } else {
            AuthError::TokenExternalError(message)
        });
    }

    serde_json::from_str(&text).map_err(|e| AuthError::TokenParsingError(e.to_string()))
}

#[derive(Debug)]
pub(crate) struct ParsedTokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub raw: Value,
}

/// Pulls the OAuth2 credential fields out of a token endpoint response.
/// `expires_in` is accepted as a number or a numeric string.
pub(crate) fn parse_token_response(raw: Value) -> Result<ParsedTokenResponse, AuthError> {
    let access_token = raw
        .get("access_token")
        .and_then(Value::as_str)
        .ok_or_else(|| AuthError::TokenParsingError("response has no access_token".to_string()))?
        .to_string();

    let refresh_token = raw
        .get("refresh_token")
        .and_then(Value::as_str)
        .map(str::to_string);

    let expires_at = expires_in_seconds(&raw).map(|secs| Utc::now() + Duration::seconds(secs));

    Ok(ParsedTokenResponse {
        access_token,
        refresh_token,
        expires_at,
        raw,
    })
}

pub(crate) fn expires_in_seconds(raw: &Value) -> Option<i64> {
    match raw.get("expires_in") {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

/// Copies declared metadata keys out of a response or callback map into the
/// connection config.
pub(crate) fn harvest(target: &mut Map<String, Value>, source: &Value, keys: Option<&[String]>) {
    let Some(keys) = keys else { return };
    for key in keys {
        if let Some(value) = source.get(key) {
            target.insert(key.clone(), value.clone());
        }
    }
}

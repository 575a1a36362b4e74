//! Synchronous drivers for the non-redirect auth modes.
//!
//! API key, basic, token-based-auth and the exchanged modes (JWT,
//! signature, Tableau, bill-style two-step) all complete in one call:
//! validate the supplied credential shape, optionally perform the mode's
//! exchange, probe when the provider declares a verification request, then
//! persist.

use super::{
    interpolation_ctx, oauth2, AuthEngine, Completion, FinishResult, FlowContext,
};
use crate::connection::{Credentials, ExchangedCredentials};
use crate::error::AuthError;
use crate::provider::AuthMode;
use crate::session::OAuthSession;
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Map, Value};
use tracing::debug;

/// Raw credential fields supplied by the caller.
#[derive(Debug, Default, Clone)]
pub struct CredentialInput {
    pub fields: Map<String, Value>,
}

impl CredentialInput {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    fn required(&self, field: &str) -> Result<String, AuthError> {
        self.fields
            .get(field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| AuthError::InvalidConnectionConfig {
                template: format!("${{{field}}}"),
                keys: vec![field.to_string()],
            })
    }

    fn optional(&self, field: &str) -> Option<String> {
        self.fields
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// Creates a connection for a non-redirect mode.
pub(crate) async fn create(
    engine: &AuthEngine,
    ctx: &FlowContext,
    connection_id: &str,
    params: Map<String, Value>,
    input: CredentialInput,
) -> Result<Completion, AuthError> {
    let mode = ctx.provider.auth_mode;

    // Interpolation sees the connection config and the supplied fields.
    let mut ictx = interpolation_ctx(&params, &ctx.integration);
    for (key, value) in &input.fields {
        ictx.insert(key.clone(), value.clone());
    }

    let credentials = match mode {
        AuthMode::ApiKey => Credentials::ApiKey {
            api_key: input.required("api_key")?,
        },
        AuthMode::Basic => Credentials::Basic {
            username: input.required("username")?,
            password: input.optional("password").unwrap_or_default(),
        },
        AuthMode::Tba => Credentials::Tba {
            token_id: input.required("token_id")?,
            token_secret: input.required("token_secret")?,
        },
        AuthMode::Jwt => Credentials::Jwt(signed_jwt(&input)?),
        AuthMode::Signature => {
            // Shape is provider-defined; the broker carries it opaquely.
            Credentials::Signature(ExchangedCredentials {
                token: input.optional("token"),
                expires_at: None,
                raw: Value::Object(input.fields.clone()),
            })
        }
        AuthMode::Tableau | AuthMode::TwoStep | AuthMode::Bill => {
            let exchanged = two_step_exchange(engine, ctx, &ictx, &input).await?;
            match mode {
                AuthMode::Tableau => Credentials::Tableau(exchanged),
                AuthMode::Bill => Credentials::Bill(exchanged),
                _ => Credentials::TwoStep(exchanged),
            }
        }
        other => return Err(AuthError::InvalidAuthMode(other.to_string())),
    };

    // New non-OAuth credentials are probed before anything is persisted.
    if let Some(verification) = ctx.provider.proxy.as_ref().and_then(|p| p.verification.as_ref()) {
        engine
            .prober
            .verify(verification, &credentials, &ictx)
            .await?;
    }

    let session = OAuthSession::new(
        ctx.environment.id,
        &ctx.integration.provider_config_key,
        &ctx.integration.provider,
        mode,
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

/// Signs a JWT from the supplied key material and returns it as the bearer
/// token. Key fields: `private_key` (PEM, or `id:secret` with a hex
/// secret), optional `algorithm`, `issuer`, `key_id`, `audience`,
/// `token_ttl_secs`.
fn signed_jwt(input: &CredentialInput) -> Result<ExchangedCredentials, AuthError> {
    let private_key = input.required("private_key")?;
    let algorithm = match input.optional("algorithm").as_deref() {
        None | Some("HS256") => Algorithm::HS256,
        Some("RS256") => Algorithm::RS256,
        Some("ES256") => Algorithm::ES256,
        Some(other) => {
            return Err(AuthError::TokenParsingError(format!(
                "unsupported JWT algorithm '{other}'"
            )))
        }
    };

    let mut header = Header::new(algorithm);
    let (encoding_key, key_id) = if private_key.contains("-----BEGIN") {
        let key = match algorithm {
            Algorithm::RS256 => EncodingKey::from_rsa_pem(private_key.as_bytes()),
            Algorithm::ES256 => EncodingKey::from_ec_pem(private_key.as_bytes()),
            _ => Ok(EncodingKey::from_secret(private_key.as_bytes())),
        }
        .map_err(|e| AuthError::TokenParsingError(format!("invalid private key: {e}")))?;
        (key, input.optional("key_id"))
    } else if let Some((id, secret)) = private_key.split_once(':') {
        let secret_bytes = hex::decode(secret)
            .map_err(|e| AuthError::TokenParsingError(format!("invalid key secret: {e}")))?;
        (EncodingKey::from_secret(&secret_bytes), Some(id.to_string()))
    } else {
        (EncodingKey::from_secret(private_key.as_bytes()), input.optional("key_id"))
    };
    header.kid = key_id;

    let ttl = input
        .fields
        .get("token_ttl_secs")
        .and_then(Value::as_i64)
        .unwrap_or(3600);
    let now = Utc::now();
    let expires_at = now + Duration::seconds(ttl);

    let mut claims = json!({
        "iat": now.timestamp(),
        "exp": expires_at.timestamp(),
    });
    if let Some(issuer) = input.optional("issuer") {
        claims["iss"] = Value::String(issuer);
    }
    if let Some(audience) = input.optional("audience") {
        claims["aud"] = Value::String(audience);
    }

    let token = encode(&header, &claims, &encoding_key)
        .map_err(|e| AuthError::TokenParsingError(format!("JWT signing failed: {e}")))?;

    Ok(ExchangedCredentials {
        token: Some(token),
        expires_at: Some(expires_at),
        raw: Value::Object(input.fields.clone()),
    })
}

/// Response fields promoted to the bearer token, in preference order.
const TOKEN_FIELDS: &[&str] = &["access_token", "token", "sessionId", "session_id"];

/// Bill-style two-step exchange: POST the supplied credentials to the token
/// endpoint and promote the returned token.
async fn two_step_exchange(
    engine: &AuthEngine,
    ctx: &FlowContext,
    ictx: &Map<String, Value>,
    input: &CredentialInput,
) -> Result<ExchangedCredentials, AuthError> {
    let provider = &ctx.provider;
    let url = oauth2::token_endpoint(provider, ictx, provider.auth_mode)?;

    // Declared token_params are the request body; without them the supplied
    // fields are sent as-is.
    let body: Map<String, Value> = match &provider.token_params {
        Some(declared) => {
            let mut body = Map::new();
            for (key, template) in declared {
                let value = crate::interpolate::interpolate(template, ictx, crate::interpolate::Encode::None)?;
                body.insert(key.clone(), Value::String(value));
            }
            body
        }
        None => input.fields.clone(),
    };

    debug!(url = %url, "Two-step credential exchange");
    let request = engine.http.post(&url).header("Accept", "application/json");
    let request = match provider.body_format {
        crate::provider::BodyFormat::Json => request.json(&body),
        crate::provider::BodyFormat::Form => {
            let form: std::collections::HashMap<String, String> = body
                .iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()),
                    )
                })
                .collect();
            request.form(&form)
        }
    };

    let response = request.send().await.map_err(|e| {
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
    let raw: Value =
        serde_json::from_str(&text).map_err(|e| AuthError::TokenParsingError(e.to_string()))?;

    let token = TOKEN_FIELDS
        .iter()
        .find_map(|field| raw.get(*field).and_then(Value::as_str))
        .map(str::to_string);
    if token.is_none() {
        return Err(AuthError::TokenParsingError(
            "exchange response carried no recognizable token field".to_string(),
        ));
    }

    let expires_at =
        oauth2::expires_in_seconds(&raw).map(|secs| Utc::now() + Duration::seconds(secs));

    Ok(ExchangedCredentials {
        token,
        expires_at,
        raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(fields: Value) -> CredentialInput {
        CredentialInput::new(fields.as_object().unwrap().clone())
    }

    #[test]
    fn test_required_field_missing_names_the_field() {
        let input = input(json!({}));
        let err = input.required("api_key").unwrap_err();
        match err {
            AuthError::InvalidConnectionConfig { keys, .. } => {
                assert_eq!(keys, vec!["api_key".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_required_field_rejects_empty() {
        let input = input(json!({"api_key": ""}));
        assert!(input.required("api_key").is_err());
    }

    #[test]
    fn test_signed_jwt_hs256_with_split_key() {
        let input = input(json!({
            "private_key": "key-id:aabbccdd",
            "issuer": "tenant-1"
        }));
        let exchanged = signed_jwt(&input).unwrap();
        let token = exchanged.token.unwrap();
        // JWT shape: three base64url segments.
        assert_eq!(token.split('.').count(), 3);
        assert!(exchanged.expires_at.unwrap() > Utc::now());
    }

    #[test]
    fn test_signed_jwt_rejects_unknown_algorithm() {
        let input = input(json!({
            "private_key": "secret",
            "algorithm": "none"
        }));
        assert!(signed_jwt(&input).is_err());
    }

    #[test]
    fn test_signed_jwt_rejects_bad_hex_secret() {
        let input = input(json!({"private_key": "id:not-hex!"}));
        assert!(signed_jwt(&input).is_err());
    }

    #[test]
    fn test_signed_jwt_honors_ttl() {
        let input = input(json!({
            "private_key": "plain-secret",
            "token_ttl_secs": 60
        }));
        let exchanged = signed_jwt(&input).unwrap();
        let delta = exchanged.expires_at.unwrap() - Utc::now();
        assert!(delta <= Duration::seconds(60));
        assert!(delta > Duration::seconds(50));
    }
}

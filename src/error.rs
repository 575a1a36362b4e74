//! Caller-facing authorization errors.
//!
//! Every recoverable per-request failure is surfaced as an [`AuthError`]
//! carrying a stable snake_case code. Handlers serialize the code plus a
//! user-facing message; the originating UI channel receives the same code
//! as a structured error event. Unexpected conditions are wrapped into
//! [`AuthError::Unknown`] after being logged.

use axum::http::StatusCode;
use thiserror::Error;

/// Authorization subsystem error with a stable wire code.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing HMAC digest in request")]
    MissingHmac,

    #[error("HMAC digest did not match")]
    InvalidHmac,

    #[error("No connection found for '{0}'")]
    MissingConnection(String),

    #[error("No integration configured for provider config key '{0}'")]
    UnknownProviderConfig(String),

    #[error("No provider template named '{0}'")]
    UnknownProviderTemplate(String),

    #[error("Auth mode '{0}' cannot be used with this operation")]
    InvalidAuthMode(String),

    #[error("Template '{template}' references missing connection config keys: {}", keys.join(", "))]
    InvalidConnectionConfig { template: String, keys: Vec<String> },

    #[error("Provider declares grant_type '{0}'; only authorization_code is supported here")]
    UnknownGrantType(String),

    #[error("OAuth2 callback is missing required parameters")]
    InvalidCallbackOauth2,

    #[error("OAuth1 callback is missing required parameters")]
    InvalidCallbackOauth1,

    #[error("Invalid or expired state parameter")]
    InvalidState,

    #[error("Token endpoint returned an error: {0}")]
    TokenExternalError(String),

    #[error("Could not parse token endpoint response: {0}")]
    TokenParsingError(String),

    #[error("Refresh exchange failed{}: {body}", status.map(|s| format!(" with status {s}")).unwrap_or_default())]
    RefreshTokenExternalError { status: Option<u16>, body: String },

    #[error("Could not parse refresh response: {0}")]
    RefreshTokenParsingError(String),

    #[error("Verification request failed{}", status.map(|s| format!(" with status {s}")).unwrap_or_default())]
    ConnectionTestFailed { status: Option<u16> },

    #[error("Upstream request timed out")]
    UpstreamTimeout,

    #[error("Client credentials exchange failed: {0}")]
    Oauth2CcError(String),

    #[error("Unexpected internal error")]
    Unknown(#[source] anyhow::Error),
}

impl AuthError {
    /// Stable wire code. These strings are part of the public contract and
    /// must never change for an existing variant.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingHmac => "missing_hmac",
            AuthError::InvalidHmac => "invalid_hmac",
            AuthError::MissingConnection(_) => "missing_connection",
            AuthError::UnknownProviderConfig(_) => "unknown_provider_config",
            AuthError::UnknownProviderTemplate(_) => "unknown_provider_template",
            AuthError::InvalidAuthMode(_) => "invalid_auth_mode",
            AuthError::InvalidConnectionConfig { .. } => "invalid_connection_config",
            AuthError::UnknownGrantType(_) => "unknown_grant_type",
            AuthError::InvalidCallbackOauth2 => "invalid_callback_oauth2",
            AuthError::InvalidCallbackOauth1 => "invalid_callback_oauth1",
            AuthError::InvalidState => "invalid_state",
            AuthError::TokenExternalError(_) => "token_external_error",
            AuthError::TokenParsingError(_) => "token_parsing_error",
            AuthError::RefreshTokenExternalError { .. } => "refresh_token_external_error",
            AuthError::RefreshTokenParsingError(_) => "refresh_token_parsing_error",
            AuthError::ConnectionTestFailed { .. } => "connection_test_failed",
            AuthError::UpstreamTimeout => "upstream_timeout",
            AuthError::Oauth2CcError(_) => "oauth2_cc_error",
            AuthError::Unknown(_) => "unknown_error",
        }
    }

    /// HTTP status used when the error is returned directly (endpoints that
    /// do not use the publish-to-websocket pattern).
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingHmac | AuthError::InvalidHmac => StatusCode::UNAUTHORIZED,
            AuthError::MissingConnection(_)
            | AuthError::UnknownProviderConfig(_)
            | AuthError::UnknownProviderTemplate(_) => StatusCode::NOT_FOUND,
            AuthError::InvalidAuthMode(_)
            | AuthError::InvalidConnectionConfig { .. }
            | AuthError::UnknownGrantType(_)
            | AuthError::InvalidCallbackOauth2
            | AuthError::InvalidCallbackOauth1
            | AuthError::InvalidState => StatusCode::BAD_REQUEST,
            AuthError::TokenExternalError(_)
            | AuthError::RefreshTokenExternalError { .. }
            | AuthError::Oauth2CcError(_)
            | AuthError::ConnectionTestFailed { .. } => StatusCode::BAD_GATEWAY,
            AuthError::TokenParsingError(_) | AuthError::RefreshTokenParsingError(_) => {
                StatusCode::BAD_GATEWAY
            }
            AuthError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            AuthError::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Maps a reqwest transport failure onto the auth error taxonomy.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AuthError::UpstreamTimeout
        } else {
            AuthError::TokenExternalError(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(AuthError::MissingHmac.code(), "missing_hmac");
        assert_eq!(AuthError::InvalidState.code(), "invalid_state");
        assert_eq!(
            AuthError::InvalidConnectionConfig {
                template: "https://${subdomain}.api.com".into(),
                keys: vec!["subdomain".into()],
            }
            .code(),
            "invalid_connection_config"
        );
        assert_eq!(
            AuthError::Unknown(anyhow::anyhow!("boom")).code(),
            "unknown_error"
        );
    }

    #[test]
    fn test_invalid_connection_config_names_keys() {
        let err = AuthError::InvalidConnectionConfig {
            template: "https://${subdomain}.api.com/oauth/token".into(),
            keys: vec!["subdomain".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("subdomain"));
        assert!(msg.contains("https://${subdomain}.api.com/oauth/token"));
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(AuthError::InvalidState.status(), StatusCode::BAD_REQUEST);
        assert_eq!(AuthError::MissingHmac.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AuthError::UpstreamTimeout.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}

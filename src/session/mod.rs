//! Pending-handshake sessions.
//!
//! A session binds a redirect-based handshake to its originating request:
//! tenant, provider, code verifier, callback URL and log correlator. The
//! session id doubles as the OAuth `state` parameter, so consuming the
//! session on callback is the replay-protection anchor: `find_and_delete`
//! is atomic and succeeds at most once per id.

mod store;

pub use store::{run_session_sweeper, SessionStore};

use crate::provider::AuthMode;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Sessions live for 30 minutes before the sweeper reclaims them.
pub const SESSION_TTL_SECS: i64 = 30 * 60;

/// Transient single-use record for an in-flight handshake.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OAuthSession {
    /// Opaque id; equals the OAuth `state` parameter.
    pub id: String,
    pub environment_id: i64,
    pub provider_config_key: String,
    pub provider: String,
    pub auth_mode: AuthMode,
    pub connection_id: String,
    pub callback_url: String,
    /// PKCE verifier: 24 random bytes, hex-encoded (48 chars).
    pub code_verifier: String,
    pub connection_config: Map<String, Value>,
    pub web_socket_client_id: Option<String>,
    /// Log correlator carried across the redirect round-trip.
    pub activity_log_id: String,
    /// OAuth1 request-token secret, set between `start` and `finish`.
    pub request_token_secret: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OAuthSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        environment_id: i64,
        provider_config_key: &str,
        provider: &str,
        auth_mode: AuthMode,
        connection_id: &str,
        callback_url: &str,
        connection_config: Map<String, Value>,
        web_socket_client_id: Option<String>,
        activity_log_id: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            environment_id,
            provider_config_key: provider_config_key.to_string(),
            provider: provider.to_string(),
            auth_mode,
            connection_id: connection_id.to_string(),
            callback_url: callback_url.to_string(),
            code_verifier: generate_code_verifier(),
            connection_config,
            web_socket_client_id,
            activity_log_id: activity_log_id.to_string(),
            request_token_secret: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > chrono::Duration::seconds(SESSION_TTL_SECS)
    }
}

/// Generates a PKCE code verifier: 24 random bytes, hex-encoded.
pub fn generate_code_verifier() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn sample() -> OAuthSession {
        OAuthSession::new(
            1,
            "github-prod",
            "github",
            AuthMode::OAuth2,
            "user-1",
            "https://broker.example.com/oauth/callback",
            Map::new(),
            None,
            "log-123",
        )
    }

    #[test]
    fn test_id_is_uuid_like() {
        let session = sample();
        assert_eq!(session.id.len(), 36);
        assert!(Uuid::parse_str(&session.id).is_ok());
    }

    #[test]
    fn test_code_verifier_is_48_hex_chars() {
        let session = sample();
        assert_eq!(session.code_verifier.len(), 48);
        assert!(session.code_verifier.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_verifiers_are_random() {
        assert_ne!(generate_code_verifier(), generate_code_verifier());
    }

    #[test]
    fn test_expiry_window() {
        let mut session = sample();
        assert!(!session.is_expired(Utc::now()));
        session.created_at = Utc::now() - chrono::Duration::seconds(SESSION_TTL_SECS + 1);
        assert!(session.is_expired(Utc::now()));
    }
}

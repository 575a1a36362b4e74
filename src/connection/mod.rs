//! Connections and their credentials.
//!
//! A connection is one installation of one provider for one end-user,
//! uniquely identified by `(environment_id, provider_config_key,
//! connection_id)`. Credentials are a tagged union over auth modes; the
//! `type` discriminator is what goes to and comes from storage.

mod encryption;
mod store;

pub use store::{ConnectionStore, UpsertOperation};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Per-start client credential overrides, persisted so refresh cycles can
/// re-apply them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_scopes: Option<String>,
}

impl ConfigOverride {
    pub fn is_empty(&self) -> bool {
        self.oauth_client_id.is_none()
            && self.oauth_client_secret.is_none()
            && self.oauth_scopes.is_none()
    }
}

/// OAuth2 credential payload.
#[derive(Clone, Serialize, Deserialize)]
pub struct OAuth2Credentials {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Always UTC. Absent when the provider did not report a lifetime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Full token endpoint response.
    #[serde(default)]
    pub raw: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_override: Option<ConfigOverride>,
}

/// Credentials for every supported auth mode. Serialized with an explicit
/// `type` discriminator matching the auth mode's wire name.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Credentials {
    #[serde(rename = "OAUTH2")]
    OAuth2(OAuth2Credentials),

    #[serde(rename = "OAUTH1")]
    OAuth1 {
        oauth_token: String,
        oauth_token_secret: String,
    },

    #[serde(rename = "API_KEY")]
    ApiKey { api_key: String },

    #[serde(rename = "BASIC")]
    Basic { username: String, password: String },

    #[serde(rename = "TBA")]
    Tba {
        token_id: String,
        token_secret: String,
    },

    /// Modes whose shape is provider-defined: the exchanged bearer token
    /// (when one exists) is promoted, everything else rides in `raw`.
    #[serde(rename = "JWT")]
    Jwt(ExchangedCredentials),
    #[serde(rename = "SIGNATURE")]
    Signature(ExchangedCredentials),
    #[serde(rename = "TABLEAU")]
    Tableau(ExchangedCredentials),
    #[serde(rename = "BILL")]
    Bill(ExchangedCredentials),
    #[serde(rename = "TWO_STEP")]
    TwoStep(ExchangedCredentials),
    #[serde(rename = "APP_STORE")]
    AppStore(ExchangedCredentials),
    #[serde(rename = "APP")]
    App(ExchangedCredentials),
}

/// Opaque-mode payload: optional derived token plus the raw material it was
/// derived from.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ExchangedCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub raw: Value,
}

impl Credentials {
    /// The auth mode this credential belongs to.
    pub fn auth_mode(&self) -> crate::provider::AuthMode {
        use crate::provider::AuthMode;
        match self {
            Credentials::OAuth2(_) => AuthMode::OAuth2,
            Credentials::OAuth1 { .. } => AuthMode::OAuth1,
            Credentials::ApiKey { .. } => AuthMode::ApiKey,
            Credentials::Basic { .. } => AuthMode::Basic,
            Credentials::Tba { .. } => AuthMode::Tba,
            Credentials::Jwt(_) => AuthMode::Jwt,
            Credentials::Signature(_) => AuthMode::Signature,
            Credentials::Tableau(_) => AuthMode::Tableau,
            Credentials::Bill(_) => AuthMode::Bill,
            Credentials::TwoStep(_) => AuthMode::TwoStep,
            Credentials::AppStore(_) => AuthMode::AppStore,
            Credentials::App(_) => AuthMode::App,
        }
    }
}

// Credentials never appear in logs; Debug prints the variant only.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credentials({})", self.auth_mode())
    }
}

impl std::fmt::Debug for OAuth2Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth2Credentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for ExchangedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangedCredentials")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// A persisted connection row.
#[derive(Clone, Debug)]
pub struct Connection {
    pub id: i64,
    pub environment_id: i64,
    pub provider_config_key: String,
    pub connection_id: String,
    pub provider: String,
    pub credentials: Credentials,
    pub connection_config: Map<String, Value>,
    pub metadata: Map<String, Value>,
    /// Set when the last refresh failed; cleared on the next success.
    pub last_auth_failure: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_discriminator_roundtrip() {
        let credentials = Credentials::OAuth2(OAuth2Credentials {
            access_token: "t".to_string(),
            refresh_token: Some("r".to_string()),
            expires_at: None,
            raw: json!({"access_token": "t"}),
            config_override: None,
        });

        let value = serde_json::to_value(&credentials).unwrap();
        assert_eq!(value["type"], "OAUTH2");

        let back: Credentials = serde_json::from_value(value).unwrap();
        match back {
            Credentials::OAuth2(oauth2) => {
                assert_eq!(oauth2.access_token, "t");
                assert_eq!(oauth2.refresh_token.as_deref(), Some("r"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_api_key_discriminator() {
        let value = serde_json::to_value(Credentials::ApiKey {
            api_key: "sk".to_string(),
        })
        .unwrap();
        assert_eq!(value["type"], "API_KEY");
    }

    #[test]
    fn test_auth_mode_mapping() {
        use crate::provider::AuthMode;
        let basic = Credentials::Basic {
            username: "u".to_string(),
            password: "p".to_string(),
        };
        assert_eq!(basic.auth_mode(), AuthMode::Basic);

        let two_step = Credentials::TwoStep(ExchangedCredentials::default());
        assert_eq!(two_step.auth_mode(), AuthMode::TwoStep);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let credentials = Credentials::OAuth2(OAuth2Credentials {
            access_token: "very-secret-token".to_string(),
            refresh_token: Some("even-more-secret".to_string()),
            expires_at: None,
            raw: json!({}),
            config_override: None,
        });
        let debug = format!("{credentials:?}");
        assert!(!debug.contains("very-secret-token"));
        assert!(!debug.contains("even-more-secret"));

        let inner = format!(
            "{:?}",
            OAuth2Credentials {
                access_token: "very-secret-token".to_string(),
                refresh_token: None,
                expires_at: None,
                raw: json!({}),
                config_override: None,
            }
        );
        assert!(!inner.contains("very-secret-token"));
    }

    #[test]
    fn test_config_override_survives_serde() {
        let credentials = Credentials::OAuth2(OAuth2Credentials {
            access_token: "t".to_string(),
            refresh_token: None,
            expires_at: None,
            raw: Value::Null,
            config_override: Some(ConfigOverride {
                oauth_client_id: Some("override-id".to_string()),
                oauth_client_secret: None,
                oauth_scopes: None,
            }),
        });

        let value = serde_json::to_value(&credentials).unwrap();
        let back: Credentials = serde_json::from_value(value).unwrap();
        match back {
            Credentials::OAuth2(oauth2) => {
                let ov = oauth2.config_override.unwrap();
                assert_eq!(ov.oauth_client_id.as_deref(), Some("override-id"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}

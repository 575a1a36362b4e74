//! Provider descriptors and tenant integration bindings.
//!
//! A [`Provider`] is the immutable, declarative description of how to talk
//! to one third-party API: which handshake it speaks, where its endpoints
//! live, and which extra parameters the handshake needs. Descriptors are
//! loaded from a `providers.yaml` file at startup and validated once there,
//! not at each use.
//!
//! An [`IntegrationConfig`] binds a provider to one tenant's concrete client
//! credentials under a tenant-local `provider_config_key`.

mod registry;

pub use registry::ProviderRegistry;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// The handshake protocol a provider speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthMode {
    #[serde(rename = "OAUTH1")]
    OAuth1,
    #[serde(rename = "OAUTH2")]
    OAuth2,
    #[serde(rename = "OAUTH2_CC")]
    OAuth2Cc,
    #[serde(rename = "APP")]
    App,
    #[serde(rename = "CUSTOM")]
    Custom,
    #[serde(rename = "APP_STORE")]
    AppStore,
    #[serde(rename = "BASIC")]
    Basic,
    #[serde(rename = "API_KEY")]
    ApiKey,
    #[serde(rename = "JWT")]
    Jwt,
    #[serde(rename = "SIGNATURE")]
    Signature,
    #[serde(rename = "TABLEAU")]
    Tableau,
    #[serde(rename = "TWO_STEP")]
    TwoStep,
    #[serde(rename = "BILL")]
    Bill,
    #[serde(rename = "TBA")]
    Tba,
}

impl AuthMode {
    /// Wire representation (matches the YAML serialization).
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::OAuth1 => "OAUTH1",
            AuthMode::OAuth2 => "OAUTH2",
            AuthMode::OAuth2Cc => "OAUTH2_CC",
            AuthMode::App => "APP",
            AuthMode::Custom => "CUSTOM",
            AuthMode::AppStore => "APP_STORE",
            AuthMode::Basic => "BASIC",
            AuthMode::ApiKey => "API_KEY",
            AuthMode::Jwt => "JWT",
            AuthMode::Signature => "SIGNATURE",
            AuthMode::Tableau => "TABLEAU",
            AuthMode::TwoStep => "TWO_STEP",
            AuthMode::Bill => "BILL",
            AuthMode::Tba => "TBA",
        }
    }

    /// Modes that hand out refresh tokens the coordinator can rotate.
    pub fn is_refreshable(&self) -> bool {
        matches!(self, AuthMode::OAuth2 | AuthMode::Custom)
    }

    /// Modes whose `start` returns a redirect rather than completing
    /// synchronously.
    pub fn is_interactive(&self) -> bool {
        matches!(
            self,
            AuthMode::OAuth1
                | AuthMode::OAuth2
                | AuthMode::App
                | AuthMode::Custom
                | AuthMode::AppStore
        )
    }
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token endpoint: a single URL, or one URL per auth mode for providers
/// that expose several handshakes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenUrl {
    Single(String),
    PerMode(HashMap<String, String>),
}

impl TokenUrl {
    /// Resolves the endpoint for `mode`, if declared.
    pub fn for_mode(&self, mode: AuthMode) -> Option<&str> {
        match self {
            TokenUrl::Single(url) => Some(url),
            TokenUrl::PerMode(map) => map.get(mode.as_str()).map(String::as_str),
        }
    }
}

/// How client credentials are presented on the token request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenRequestAuthMethod {
    /// `Authorization: Basic base64(client_id:client_secret)`.
    Basic,
    /// Credentials in the request body.
    #[default]
    Body,
}

/// Encoding of the token request body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyFormat {
    #[default]
    Form,
    Json,
}

/// Declarative verification probe issued through the downstream proxy when
/// non-OAuth credentials are created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyVerification {
    #[serde(default = "default_probe_method")]
    pub method: String,
    pub endpoint: String,
    #[serde(default)]
    pub base_url_override: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
}

fn default_probe_method() -> String {
    "GET".to_string()
}

/// Proxy section of a provider descriptor.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default)]
    pub verification: Option<ProxyVerification>,
}

/// Immutable per-provider descriptor, loaded from `providers.yaml`.
///
/// Every string field may carry `${...}` tokens which must resolve against
/// the union of the connection config, the tenant config, and the session
/// at the time of use.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Provider {
    pub auth_mode: AuthMode,

    #[serde(default)]
    pub authorization_url: Option<String>,
    #[serde(default)]
    pub token_url: Option<TokenUrl>,
    /// OAuth1 request-token endpoint.
    #[serde(default)]
    pub request_url: Option<String>,
    #[serde(default)]
    pub refresh_url: Option<String>,

    #[serde(default)]
    pub authorization_params: Option<HashMap<String, String>>,
    #[serde(default)]
    pub token_params: Option<HashMap<String, String>>,
    #[serde(default)]
    pub refresh_params: Option<HashMap<String, String>>,
    /// Literal substring replacements applied to the final authorize URL.
    #[serde(default)]
    pub authorization_url_replacements: Option<HashMap<String, String>>,

    #[serde(default)]
    pub token_url_encode: bool,
    #[serde(default)]
    pub authorization_url_encode: bool,
    #[serde(default)]
    pub disable_pkce: bool,
    /// When set, the authorize query string is carried after `#<fragment>`
    /// instead of `?`.
    #[serde(default)]
    pub authorization_url_fragment: Option<String>,

    #[serde(default)]
    pub token_request_auth_method: TokenRequestAuthMethod,
    #[serde(default)]
    pub body_format: BodyFormat,
    #[serde(default)]
    pub scope_separator: Option<String>,

    /// Callback query parameters harvested into the connection config.
    #[serde(default)]
    pub redirect_uri_metadata: Option<Vec<String>>,
    /// Token response fields harvested into the connection config.
    #[serde(default)]
    pub token_response_metadata: Option<Vec<String>>,

    #[serde(default)]
    pub proxy: Option<ProxySettings>,
    #[serde(default)]
    pub webhook_routing_script: Option<String>,
}

impl Provider {
    /// Scope separator, defaulting to a single space.
    pub fn scope_separator(&self) -> &str {
        self.scope_separator.as_deref().unwrap_or(" ")
    }

    /// Token endpoint for this descriptor's own auth mode.
    pub fn token_url_for(&self, mode: AuthMode) -> Option<&str> {
        self.token_url.as_ref().and_then(|t| t.for_mode(mode))
    }
}

/// Tenant-scoped binding of a provider to concrete client credentials.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntegrationConfig {
    /// Tenant-local name for this integration.
    pub provider_config_key: String,
    /// Provider template id this integration uses.
    pub provider: String,
    pub oauth_client_id: String,
    pub oauth_client_secret: String,
    /// Comma-separated scope list.
    #[serde(default)]
    pub oauth_scopes: Option<String>,
    /// Public app installation link (APP/APP_STORE modes).
    #[serde(default)]
    pub app_link: Option<String>,
    /// Free-form per-integration settings.
    #[serde(default)]
    pub custom: Option<Map<String, Value>>,
}

impl IntegrationConfig {
    /// Scopes split on commas, trimmed, empties dropped.
    pub fn scopes(&self) -> Vec<String> {
        self.oauth_scopes
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// An isolation boundary owning integrations, sessions and connections.
#[derive(Clone, Debug)]
pub struct Environment {
    pub id: i64,
    /// Bearer key callers authenticate with.
    pub secret_key: String,
    /// Key embedded in browser-initiated connect links.
    pub public_key: String,
    pub hmac_enabled: bool,
    pub hmac_key: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
}

/// In-process lookup of environments and their integrations. The durable
/// variants of these tables belong to an external collaborator; the broker
/// core only needs read access.
#[derive(Default)]
pub struct TenantRegistry {
    environments: Vec<Environment>,
    integrations: HashMap<(i64, String), IntegrationConfig>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_environment(&mut self, environment: Environment) {
        self.environments.push(environment);
    }

    pub fn add_integration(&mut self, environment_id: i64, config: IntegrationConfig) {
        self.integrations
            .insert((environment_id, config.provider_config_key.clone()), config);
    }

    pub fn environment(&self, id: i64) -> Option<&Environment> {
        self.environments.iter().find(|e| e.id == id)
    }

    pub fn environment_by_public_key(&self, key: &str) -> Option<&Environment> {
        self.environments.iter().find(|e| e.public_key == key)
    }

    pub fn environment_by_secret_key(&self, key: &str) -> Option<&Environment> {
        self.environments.iter().find(|e| e.secret_key == key)
    }

    pub fn integration(&self, environment_id: i64, provider_config_key: &str) -> Option<&IntegrationConfig> {
        self.integrations
            .get(&(environment_id, provider_config_key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scopes_split_and_trim() {
        let config = IntegrationConfig {
            provider_config_key: "github-prod".to_string(),
            provider: "github".to_string(),
            oauth_client_id: "abc".to_string(),
            oauth_client_secret: "shh".to_string(),
            oauth_scopes: Some("repo, user,".to_string()),
            app_link: None,
            custom: None,
        };
        assert_eq!(config.scopes(), vec!["repo".to_string(), "user".to_string()]);
    }

    #[test]
    fn test_token_url_per_mode() {
        let mut map = HashMap::new();
        map.insert("OAUTH2".to_string(), "https://a/token".to_string());
        map.insert("APP".to_string(), "https://a/app-token".to_string());
        let url = TokenUrl::PerMode(map);

        assert_eq!(url.for_mode(AuthMode::OAuth2), Some("https://a/token"));
        assert_eq!(url.for_mode(AuthMode::App), Some("https://a/app-token"));
        assert_eq!(url.for_mode(AuthMode::OAuth1), None);
    }

    #[test]
    fn test_auth_mode_serde_names() {
        assert_eq!(
            serde_json::to_string(&AuthMode::OAuth2Cc).unwrap(),
            "\"OAUTH2_CC\""
        );
        let mode: AuthMode = serde_json::from_str("\"TWO_STEP\"").unwrap();
        assert_eq!(mode, AuthMode::TwoStep);
    }

    #[test]
    fn test_refreshable_modes() {
        assert!(AuthMode::OAuth2.is_refreshable());
        assert!(!AuthMode::ApiKey.is_refreshable());
        assert!(!AuthMode::OAuth1.is_refreshable());
    }

    #[test]
    fn test_tenant_registry_lookup() {
        let mut registry = TenantRegistry::new();
        registry.add_environment(Environment {
            id: 1,
            secret_key: "sk-test".to_string(),
            public_key: "pk-test".to_string(),
            hmac_enabled: false,
            hmac_key: None,
            webhook_url: None,
            webhook_secret: None,
        });
        registry.add_integration(
            1,
            IntegrationConfig {
                provider_config_key: "github-prod".to_string(),
                provider: "github".to_string(),
                oauth_client_id: "abc".to_string(),
                oauth_client_secret: "shh".to_string(),
                oauth_scopes: None,
                app_link: None,
                custom: None,
            },
        );

        assert!(registry.environment_by_public_key("pk-test").is_some());
        assert!(registry.environment_by_secret_key("sk-test").is_some());
        assert!(registry.integration(1, "github-prod").is_some());
        assert!(registry.integration(1, "missing").is_none());
        assert!(registry.integration(2, "github-prod").is_none());
    }
}

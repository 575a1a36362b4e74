//! Declarative provider file loading.
//!
//! `providers.yaml` is a map from provider id to descriptor. An entry may
//! instead declare `alias: other-id`; aliases resolve transitively and the
//! aliasing entry inherits every field it does not set itself. Descriptors
//! are validated here, at load time.

use super::{AuthMode, Provider};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_yaml::Value as YamlValue;
use std::collections::HashMap;
use std::path::Path;

/// Raw YAML entry: either a full descriptor or an alias (possibly with
/// field overrides layered on top of the target).
#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default)]
    alias: Option<String>,
    #[serde(flatten)]
    rest: serde_yaml::Mapping,
}

/// Read-only lookup of provider descriptors.
pub struct ProviderRegistry {
    providers: HashMap<String, Provider>,
}

impl ProviderRegistry {
    /// Loads and validates `providers.yaml`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(&path).with_context(|| {
            format!("Failed to read provider file {}", path.as_ref().display())
        })?;
        Self::from_yaml(&contents)
    }

    /// Parses a provider map from YAML text.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let raw: HashMap<String, RawEntry> =
            serde_yaml::from_str(contents).context("Provider file is not a valid YAML map")?;

        let mut providers = HashMap::new();
        for id in raw.keys() {
            let merged = resolve_entry(&raw, id, 0)
                .with_context(|| format!("Failed to resolve provider '{id}'"))?;
            let provider: Provider = serde_yaml::from_value(YamlValue::Mapping(merged))
                .with_context(|| format!("Invalid descriptor for provider '{id}'"))?;
            validate(id, &provider)?;
            providers.insert(id.clone(), provider);
        }

        Ok(Self { providers })
    }

    pub fn get(&self, id: &str) -> Option<&Provider> {
        self.providers.get(id)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Follows the alias chain for `id`, merging overrides over the target's
/// fields. Chains longer than 10 links are treated as cycles.
fn resolve_entry(
    raw: &HashMap<String, RawEntry>,
    id: &str,
    depth: usize,
) -> Result<serde_yaml::Mapping> {
    if depth > 10 {
        bail!("Alias chain starting at '{id}' is too deep (cycle?)");
    }
    let entry = raw
        .get(id)
        .with_context(|| format!("Alias target '{id}' does not exist"))?;

    match &entry.alias {
        None => Ok(entry.rest.clone()),
        Some(target) => {
            let mut merged = resolve_entry(raw, target, depth + 1)?;
            for (key, value) in &entry.rest {
                merged.insert(key.clone(), value.clone());
            }
            Ok(merged)
        }
    }
}

/// Load-time sanity checks so per-request code never has to re-validate
/// descriptor structure.
fn validate(id: &str, provider: &Provider) -> Result<()> {
    match provider.auth_mode {
        AuthMode::OAuth2 | AuthMode::Custom => {
            if provider.authorization_url.is_none() {
                bail!("Provider '{id}' ({}) requires authorization_url", provider.auth_mode);
            }
            // CUSTOM descriptors key their token endpoint under OAUTH2: the
            // callback leg is an OAuth2 code exchange.
            if provider.token_url_for(AuthMode::OAuth2).is_none() {
                bail!("Provider '{id}' ({}) requires token_url", provider.auth_mode);
            }
        }
        AuthMode::OAuth1 => {
            if provider.authorization_url.is_none()
                || provider.request_url.is_none()
                || provider.token_url_for(AuthMode::OAuth1).is_none()
            {
                bail!("Provider '{id}' (OAUTH1) requires authorization_url, request_url and token_url");
            }
        }
        AuthMode::OAuth2Cc | AuthMode::TwoStep | AuthMode::Bill => {
            if provider.token_url_for(provider.auth_mode).is_none() {
                bail!("Provider '{id}' ({}) requires token_url", provider.auth_mode);
            }
        }
        // Installation and plain-credential modes carry no mandatory URL.
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
github:
  auth_mode: OAUTH2
  authorization_url: https://github.com/login/oauth/authorize
  token_url: https://github.com/login/oauth/access_token

github-enterprise:
  alias: github
  authorization_url: https://${host}/login/oauth/authorize
  token_url: https://${host}/login/oauth/access_token

notion:
  auth_mode: OAUTH2
  authorization_url: https://api.notion.com/v1/oauth/authorize
  token_url: https://api.notion.com/v1/oauth/token
  token_request_auth_method: basic
  body_format: json
  disable_pkce: true

stripe-keys:
  auth_mode: API_KEY
  proxy:
    verification:
      method: GET
      endpoint: /v1/customers
      base_url_override: https://api.stripe.com

github-app:
  auth_mode: CUSTOM
  authorization_url: ${appPublicLink}
  token_url:
    OAUTH2: https://github.com/login/oauth/access_token
"#;

    #[test]
    fn test_loads_plain_entry() {
        let registry = ProviderRegistry::from_yaml(SAMPLE).unwrap();
        let github = registry.get("github").unwrap();
        assert_eq!(github.auth_mode, AuthMode::OAuth2);
        assert_eq!(
            github.authorization_url.as_deref(),
            Some("https://github.com/login/oauth/authorize")
        );
        assert!(!github.disable_pkce);
    }

    #[test]
    fn test_alias_inherits_and_overrides() {
        let registry = ProviderRegistry::from_yaml(SAMPLE).unwrap();
        let enterprise = registry.get("github-enterprise").unwrap();
        // Inherited from github
        assert_eq!(enterprise.auth_mode, AuthMode::OAuth2);
        // Overridden locally
        assert_eq!(
            enterprise.authorization_url.as_deref(),
            Some("https://${host}/login/oauth/authorize")
        );
    }

    #[test]
    fn test_flags_and_methods_deserialize() {
        let registry = ProviderRegistry::from_yaml(SAMPLE).unwrap();
        let notion = registry.get("notion").unwrap();
        assert_eq!(
            notion.token_request_auth_method,
            crate::provider::TokenRequestAuthMethod::Basic
        );
        assert_eq!(notion.body_format, crate::provider::BodyFormat::Json);
        assert!(notion.disable_pkce);
    }

    #[test]
    fn test_verification_probe_parses() {
        let registry = ProviderRegistry::from_yaml(SAMPLE).unwrap();
        let stripe = registry.get("stripe-keys").unwrap();
        let probe = stripe
            .proxy
            .as_ref()
            .and_then(|p| p.verification.as_ref())
            .unwrap();
        assert_eq!(probe.method, "GET");
        assert_eq!(probe.endpoint, "/v1/customers");
        assert_eq!(probe.base_url_override.as_deref(), Some("https://api.stripe.com"));
    }

    #[test]
    fn test_custom_mode_accepts_oauth2_keyed_token_url() {
        let registry = ProviderRegistry::from_yaml(SAMPLE).unwrap();
        let app = registry.get("github-app").unwrap();
        assert_eq!(app.auth_mode, AuthMode::Custom);
        assert_eq!(
            app.token_url_for(AuthMode::OAuth2),
            Some("https://github.com/login/oauth/access_token")
        );
    }

    #[test]
    fn test_dangling_alias_is_load_error() {
        let yaml = "broken:\n  alias: nowhere\n";
        assert!(ProviderRegistry::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_alias_cycle_is_load_error() {
        let yaml = "a:\n  alias: b\nb:\n  alias: a\n";
        assert!(ProviderRegistry::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_missing_token_url_is_load_error() {
        let yaml = "incomplete:\n  auth_mode: OAUTH2\n  authorization_url: https://x/auth\n";
        assert!(ProviderRegistry::from_yaml(yaml).is_err());
    }
}

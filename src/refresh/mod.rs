//! Transparent credential refresh.
//!
//! Read paths (the proxy about to make a downstream call, a sync about to
//! start) ask for fresh credentials here instead of reading the store
//! directly. Staleness is decided per policy; the actual exchange is
//! de-duplicated per connection so a burst of concurrent readers produces
//! exactly one refresh, whose result every waiter observes by re-reading
//! the store after the winner commits.

use crate::connection::{Connection, ConnectionStore, Credentials, OAuth2Credentials};
use crate::error::AuthError;
use crate::flow::interpolation_ctx;
use crate::hooks::HookRunner;
use crate::interpolate::{interpolate, Encode};
use crate::notify::Notifier;
use crate::provider::{
    AuthMode, BodyFormat, IntegrationConfig, Provider, ProviderRegistry, TenantRegistry,
    TokenRequestAuthMethod,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// When credentials count as stale.
#[derive(Clone, Copy, Debug)]
pub struct RefreshPolicy {
    /// Refresh this long before the recorded expiry.
    pub skew: Duration,
    /// Refresh tokens with no recorded expiry whenever a refresh token is
    /// available.
    pub opportunistic: bool,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            skew: Duration::minutes(15),
            opportunistic: true,
        }
    }
}

impl RefreshPolicy {
    pub fn is_stale(&self, credentials: &OAuth2Credentials, now: DateTime<Utc>) -> bool {
        match credentials.expires_at {
            Some(expires_at) => expires_at - now < self.skew,
            None => self.opportunistic && credentials.refresh_token.is_some(),
        }
    }
}

/// Serializes refresh exchanges per connection and performs them.
pub struct RefreshCoordinator {
    connections: Arc<ConnectionStore>,
    providers: Arc<ProviderRegistry>,
    tenants: Arc<TenantRegistry>,
    hooks: Arc<HookRunner>,
    notifier: Arc<Notifier>,
    http: reqwest::Client,
    policy: RefreshPolicy,
    /// Process-local single-flight registry: connection row id to guard.
    inflight: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl RefreshCoordinator {
    pub fn new(
        connections: Arc<ConnectionStore>,
        providers: Arc<ProviderRegistry>,
        tenants: Arc<TenantRegistry>,
        hooks: Arc<HookRunner>,
        notifier: Arc<Notifier>,
        http: reqwest::Client,
        policy: RefreshPolicy,
    ) -> Self {
        Self {
            connections,
            providers,
            tenants,
            hooks,
            notifier,
            http,
            policy,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Returns credentials that are safe to use right now, refreshing them
    /// first when stale. Non-refreshable modes pass straight through.
    pub async fn get_fresh_credentials(
        &self,
        connection: &Connection,
    ) -> Result<Credentials, AuthError> {
        let Credentials::OAuth2(oauth2) = &connection.credentials else {
            return Ok(connection.credentials.clone());
        };
        if !self.policy.is_stale(oauth2, Utc::now()) {
            return Ok(connection.credentials.clone());
        }
        // Expired but nothing to refresh with: hand back what we have.
        if oauth2.refresh_token.is_none() {
            return Ok(connection.credentials.clone());
        }

        let guard = self.guard_for(connection.id);
        let _held = guard.lock().await;

        // Re-read under the guard: the winning refresher has already
        // committed by the time any waiter gets here.
        let current = self
            .connections
            .get(
                connection.environment_id,
                &connection.provider_config_key,
                &connection.connection_id,
            )
            .map_err(AuthError::Unknown)?
            .ok_or_else(|| AuthError::MissingConnection(connection.connection_id.clone()))?;

        let result = self.refresh_if_still_stale(connection, &current).await;
        // The slot is freed only after the winner's write is visible, so no
        // waiter can start a second exchange against the same row.
        self.release_guard(connection.id);
        result
    }

    async fn refresh_if_still_stale(
        &self,
        connection: &Connection,
        current: &Connection,
    ) -> Result<Credentials, AuthError> {
        let Credentials::OAuth2(current_oauth2) = &current.credentials else {
            return Ok(current.credentials.clone());
        };
        if !self.policy.is_stale(current_oauth2, Utc::now()) {
            debug!(connection_id = %connection.connection_id, "Refresh already done by concurrent caller");
            return Ok(current.credentials.clone());
        }
        if current_oauth2.refresh_token.is_none() {
            return Ok(current.credentials.clone());
        }

        let environment = self
            .tenants
            .environment(connection.environment_id)
            .cloned()
            .ok_or_else(|| AuthError::Unknown(anyhow::anyhow!("environment disappeared")))?;

        match self.refresh(current, current_oauth2).await {
            Ok(refreshed) => {
                let credentials = Credentials::OAuth2(refreshed);
                self.connections
                    .update_credentials(
                        current.environment_id,
                        &current.provider_config_key,
                        &current.connection_id,
                        &credentials,
                    )
                    .map_err(AuthError::Unknown)?;
                info!(connection_id = %current.connection_id, "Credentials refreshed");
                self.hooks.post_refresh(&environment, current).await;
                Ok(credentials)
            }
            Err(error) => {
                // Stored tokens stay in place so a later refresh can recover.
                self.notifier.publish_error(None, &error);
                self.hooks
                    .post_refresh_failure(&environment, current, &error)
                    .await;
                Err(error)
            }
        }
    }

    fn guard_for(&self, connection_row: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut inflight = self.inflight.lock().unwrap();
        Arc::clone(
            inflight
                .entry(connection_row)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn release_guard(&self, connection_row: i64) {
        let mut inflight = self.inflight.lock().unwrap();
        // Drop the slot once nobody else holds a clone; late arrivals
        // re-check staleness anyway.
        if let Some(guard) = inflight.get(&connection_row) {
            if Arc::strong_count(guard) <= 2 {
                inflight.remove(&connection_row);
            }
        }
    }

    /// Performs one refresh exchange and merges the response.
    async fn refresh(
        &self,
        connection: &Connection,
        current: &OAuth2Credentials,
    ) -> Result<OAuth2Credentials, AuthError> {
        let integration = self
            .tenants
            .integration(connection.environment_id, &connection.provider_config_key)
            .ok_or_else(|| AuthError::UnknownProviderConfig(connection.provider_config_key.clone()))?;
        let provider = self
            .providers
            .get(&integration.provider)
            .ok_or_else(|| AuthError::UnknownProviderTemplate(integration.provider.clone()))?;

        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or_else(|| AuthError::Unknown(anyhow::anyhow!("refresh without refresh_token")))?;

        // Per-start overrides stored with the credentials outlive every
        // refresh cycle.
        let (client_id, client_secret) = effective_client(integration, current);

        let ictx = interpolation_ctx(&connection.connection_config, integration);
        let endpoint_template = provider
            .refresh_url
            .as_deref()
            .or_else(|| provider.token_url_for(AuthMode::OAuth2))
            .ok_or_else(|| AuthError::InvalidAuthMode(provider.auth_mode.to_string()))?;
        let encode = if provider.token_url_encode {
            Encode::UrlComponent
        } else {
            Encode::None
        };
        let url = interpolate(endpoint_template, &ictx, encode)?;

        let mut params: Vec<(String, String)> = Vec::new();
        let declared = provider.refresh_params.as_ref().or(provider.token_params.as_ref());
        if let Some(declared) = declared {
            for (key, template) in declared {
                if key == "grant_type" {
                    continue;
                }
                params.push((key.clone(), interpolate(template, &ictx, Encode::None)?));
            }
        }
        params.push(("grant_type".to_string(), "refresh_token".to_string()));
        params.push(("refresh_token".to_string(), refresh_token.clone()));

        let mut request = self.http.post(&url).header("Accept", "application/json");
        match provider.token_request_auth_method {
            TokenRequestAuthMethod::Basic => {
                let token = BASE64.encode(format!("{client_id}:{client_secret}"));
                request = request.header("Authorization", format!("Basic {token}"));
            }
            TokenRequestAuthMethod::Body => {
                params.push(("client_id".to_string(), client_id));
                params.push(("client_secret".to_string(), client_secret));
            }
        }

        let body: HashMap<String, String> = params.into_iter().collect();
        request = match provider.body_format {
            BodyFormat::Form => request.form(&body),
            BodyFormat::Json => request.json(&body),
        };

        debug!(url = %url, connection_id = %connection.connection_id, "Refresh exchange request");
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AuthError::UpstreamTimeout
            } else {
                AuthError::RefreshTokenExternalError {
                    status: None,
                    body: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AuthError::RefreshTokenExternalError {
                status: Some(status.as_u16()),
                body: text,
            });
        }

        let raw: Value = serde_json::from_str(&text)
            .map_err(|e| AuthError::RefreshTokenParsingError(e.to_string()))?;
        let access_token = raw
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AuthError::RefreshTokenParsingError("response has no access_token".to_string())
            })?
            .to_string();

        Ok(merge_refresh(current, access_token, raw))
    }
}

/// Client credentials for the refresh: stored overrides win over the tenant
/// config.
fn effective_client(
    integration: &IntegrationConfig,
    current: &OAuth2Credentials,
) -> (String, String) {
    let override_ = current.config_override.as_ref();
    (
        override_
            .and_then(|o| o.oauth_client_id.clone())
            .unwrap_or_else(|| integration.oauth_client_id.clone()),
        override_
            .and_then(|o| o.oauth_client_secret.clone())
            .unwrap_or_else(|| integration.oauth_client_secret.clone()),
    )
}

/// Merge rules for a refresh response:
/// - a missing `refresh_token` preserves the prior one;
/// - a missing `expires_in` clears `expires_at` (no silent carry-over);
/// - `config_override` survives.
fn merge_refresh(current: &OAuth2Credentials, access_token: String, raw: Value) -> OAuth2Credentials {
    let refresh_token = raw
        .get("refresh_token")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| current.refresh_token.clone());

    let expires_at =
        crate::flow::expires_in_seconds(&raw).map(|secs| Utc::now() + Duration::seconds(secs));

    OAuth2Credentials {
        access_token,
        refresh_token,
        expires_at,
        raw,
        config_override: current.config_override.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn credentials(
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> OAuth2Credentials {
        OAuth2Credentials {
            access_token: "old".to_string(),
            refresh_token: refresh_token.map(str::to_string),
            expires_at,
            raw: json!({}),
            config_override: None,
        }
    }

    #[test]
    fn test_stale_when_inside_skew() {
        let policy = RefreshPolicy::default();
        let now = Utc::now();
        let soon = credentials(Some("r"), Some(now + Duration::minutes(5)));
        let later = credentials(Some("r"), Some(now + Duration::hours(2)));
        let past = credentials(Some("r"), Some(now - Duration::minutes(1)));

        assert!(policy.is_stale(&soon, now));
        assert!(!policy.is_stale(&later, now));
        assert!(policy.is_stale(&past, now));
    }

    #[test]
    fn test_opportunistic_refresh_without_expiry() {
        let now = Utc::now();
        let with_refresh = credentials(Some("r"), None);
        let without_refresh = credentials(None, None);

        let opportunistic = RefreshPolicy::default();
        assert!(opportunistic.is_stale(&with_refresh, now));
        assert!(!opportunistic.is_stale(&without_refresh, now));

        let conservative = RefreshPolicy {
            opportunistic: false,
            ..RefreshPolicy::default()
        };
        assert!(!conservative.is_stale(&with_refresh, now));
    }

    #[test]
    fn test_merge_preserves_refresh_token_when_omitted() {
        let current = credentials(Some("r1"), Some(Utc::now() - Duration::minutes(1)));
        let merged = merge_refresh(
            &current,
            "new".to_string(),
            json!({"access_token": "new", "expires_in": 3600}),
        );
        assert_eq!(merged.access_token, "new");
        assert_eq!(merged.refresh_token.as_deref(), Some("r1"));
        assert!(merged.expires_at.unwrap() > Utc::now());
    }

    #[test]
    fn test_merge_takes_rotated_refresh_token() {
        let current = credentials(Some("r1"), None);
        let merged = merge_refresh(
            &current,
            "new".to_string(),
            json!({"access_token": "new", "refresh_token": "r2"}),
        );
        assert_eq!(merged.refresh_token.as_deref(), Some("r2"));
    }

    #[test]
    fn test_merge_clears_expiry_when_response_lacks_it() {
        let current = credentials(Some("r1"), Some(Utc::now() + Duration::hours(1)));
        let merged = merge_refresh(&current, "new".to_string(), json!({"access_token": "new"}));
        assert!(merged.expires_at.is_none());
    }

    #[test]
    fn test_merge_keeps_config_override() {
        let mut current = credentials(Some("r1"), None);
        current.config_override = Some(crate::connection::ConfigOverride {
            oauth_client_id: Some("ov-id".to_string()),
            oauth_client_secret: Some("ov-secret".to_string()),
            oauth_scopes: None,
        });
        let merged = merge_refresh(&current, "new".to_string(), json!({"access_token": "new"}));
        assert_eq!(
            merged.config_override.unwrap().oauth_client_id.as_deref(),
            Some("ov-id")
        );
    }

    #[test]
    fn test_effective_client_prefers_override() {
        let integration = IntegrationConfig {
            provider_config_key: "k".to_string(),
            provider: "github".to_string(),
            oauth_client_id: "tenant-id".to_string(),
            oauth_client_secret: "tenant-secret".to_string(),
            oauth_scopes: None,
            app_link: None,
            custom: None,
        };

        let mut with_override = credentials(Some("r"), None);
        with_override.config_override = Some(crate::connection::ConfigOverride {
            oauth_client_id: Some("ov-id".to_string()),
            oauth_client_secret: Some("ov-secret".to_string()),
            oauth_scopes: None,
        });
        assert_eq!(
            effective_client(&integration, &with_override),
            ("ov-id".to_string(), "ov-secret".to_string())
        );

        let without = credentials(Some("r"), None);
        assert_eq!(
            effective_client(&integration, &without),
            ("tenant-id".to_string(), "tenant-secret".to_string())
        );
    }
}

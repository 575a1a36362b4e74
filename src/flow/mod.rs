//! Auth flow engine.
//!
//! One driver per auth mode, all behind the same two-method contract:
//! `start` validates the request and either returns a redirect (interactive
//! handshakes) or completes synchronously; `finish` consumes a provider
//! callback and turns it into stored credentials. The engine owns the
//! dispatch table and everything drivers share: session and connection
//! stores, the outbound HTTP client, hook runner and notifier.

mod app;
mod credential;
mod oauth1;
mod oauth2;
mod pkce;

pub use credential::CredentialInput;
pub(crate) use oauth2::expires_in_seconds;

use crate::config::Config;
use crate::connection::{ConfigOverride, Credentials, UpsertOperation};
use crate::error::AuthError;
use crate::hooks::HookRunner;
use crate::notify::Notifier;
use crate::probe::VerificationProber;
use crate::provider::{AuthMode, Environment, IntegrationConfig, Provider, ProviderRegistry, TenantRegistry};
use crate::session::{OAuthSession, SessionStore};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Session connection-config keys carrying per-start client overrides.
const CLIENT_ID_OVERRIDE_KEY: &str = "oauth_client_id_override";
const CLIENT_SECRET_OVERRIDE_KEY: &str = "oauth_client_secret_override";

/// What `start` hands back to the transport.
#[derive(Debug)]
pub enum StartOutcome {
    /// Send the user agent to the provider.
    Redirect { url: String },
    /// Non-interactive mode: the connection already exists.
    Completed(Completion),
}

/// Terminal result of a successful handshake.
#[derive(Clone, Debug)]
pub struct Completion {
    pub provider_config_key: String,
    pub connection_id: String,
    pub provider: String,
    pub auth_mode: AuthMode,
    pub operation: UpsertOperation,
    /// CUSTOM flow: connection exists but awaits the app installation id.
    pub pending: bool,
    pub web_socket_client_id: Option<String>,
}

/// Caller input to `start`.
#[derive(Debug, Default)]
pub struct StartRequest {
    pub connection_id: String,
    /// Caller-supplied connection config entries.
    pub params: Map<String, Value>,
    /// Caller overrides for authorization query params. A JSON null removes
    /// the parameter entirely.
    pub authorization_params: HashMap<String, Value>,
    pub user_scope: Option<String>,
    pub ws_client_id: Option<String>,
    pub client_id_override: Option<String>,
    pub client_secret_override: Option<String>,
    pub activity_log_id: String,
}

/// Normalized provider callback.
#[derive(Debug, Default, Clone)]
pub struct CallbackParams {
    pub state: Option<String>,
    pub code: Option<String>,
    pub oauth_token: Option<String>,
    pub oauth_verifier: Option<String>,
    pub installation_id: Option<String>,
    pub setup_action: Option<String>,
    /// Every query parameter, for `redirect_uri_metadata` harvesting.
    pub all: Map<String, Value>,
}

/// Immutable request context resolved by the transport layer.
#[derive(Clone, Debug)]
pub struct FlowContext {
    pub environment: Environment,
    pub integration: IntegrationConfig,
    pub provider_name: String,
    pub provider: Provider,
}

/// What a finish driver produces before the engine persists it.
pub(crate) struct FinishResult {
    pub credentials: Credentials,
    pub connection_config: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub pending: bool,
}

/// Effective OAuth client settings after per-start overrides.
#[derive(Clone, Debug)]
pub(crate) struct ClientSettings {
    pub client_id: String,
    pub client_secret: String,
    pub scopes: Vec<String>,
    pub config_override: Option<ConfigOverride>,
}

/// The per-auth-mode driver table plus everything drivers share.
pub struct AuthEngine {
    pub providers: Arc<ProviderRegistry>,
    pub tenants: Arc<TenantRegistry>,
    pub sessions: Arc<SessionStore>,
    pub connections: Arc<crate::connection::ConnectionStore>,
    pub hooks: Arc<HookRunner>,
    pub notifier: Arc<Notifier>,
    pub prober: Arc<VerificationProber>,
    pub http: reqwest::Client,
    pub config: Config,
}

impl AuthEngine {
    /// Resolves the provider descriptor and integration for a tenant key.
    pub fn resolve(
        &self,
        environment: &Environment,
        provider_config_key: &str,
    ) -> Result<FlowContext, AuthError> {
        let integration = self
            .tenants
            .integration(environment.id, provider_config_key)
            .ok_or_else(|| AuthError::UnknownProviderConfig(provider_config_key.to_string()))?
            .clone();
        let provider = self
            .providers
            .get(&integration.provider)
            .ok_or_else(|| AuthError::UnknownProviderTemplate(integration.provider.clone()))?
            .clone();
        Ok(FlowContext {
            environment: environment.clone(),
            provider_name: integration.provider.clone(),
            integration,
            provider,
        })
    }

    /// Drives `start` for the provider's auth mode.
    pub async fn start(
        &self,
        ctx: &FlowContext,
        request: StartRequest,
    ) -> Result<StartOutcome, AuthError> {
        info!(
            provider_config_key = %ctx.integration.provider_config_key,
            provider = %ctx.integration.provider,
            auth_mode = %ctx.provider.auth_mode,
            connection_id = %request.connection_id,
            "Authorization start"
        );

        match ctx.provider.auth_mode {
            AuthMode::OAuth2 => oauth2::start(self, ctx, request).await,
            AuthMode::OAuth1 => oauth1::start(self, ctx, request).await,
            // CUSTOM is the app-installation handshake: install URL out,
            // OAuth2-style token exchange back in.
            AuthMode::App | AuthMode::AppStore | AuthMode::Custom => {
                app::start(self, ctx, request).await
            }
            mode => Err(AuthError::InvalidAuthMode(mode.to_string())),
        }
    }

    /// Synchronous client-credentials exchange (OAUTH2_CC).
    pub async fn client_credentials(
        &self,
        ctx: &FlowContext,
        connection_id: &str,
        client_id: &str,
        client_secret: &str,
        params: Map<String, Value>,
    ) -> Result<Completion, AuthError> {
        oauth2::client_credentials(self, ctx, connection_id, client_id, client_secret, params).await
    }

    /// Synchronous credential creation for the non-redirect modes.
    pub async fn create_credential_connection(
        &self,
        ctx: &FlowContext,
        connection_id: &str,
        params: Map<String, Value>,
        input: CredentialInput,
    ) -> Result<Completion, AuthError> {
        credential::create(self, ctx, connection_id, params, input).await
    }

    /// Consumes a provider callback. The session lookup is the replay gate:
    /// it deletes the row before any token exchange happens.
    pub async fn finish(&self, callback: CallbackParams) -> Result<Completion, AuthError> {
        let state = callback.state.as_deref().ok_or(AuthError::InvalidState)?;
        let session = self
            .sessions
            .find_and_delete(state)
            .map_err(AuthError::Unknown)?
            .ok_or(AuthError::InvalidState)?;

        info!(
            session_id = %session.id,
            provider_config_key = %session.provider_config_key,
            auth_mode = %session.auth_mode,
            activity_log_id = %session.activity_log_id,
            "Authorization callback"
        );

        let environment = self
            .tenants
            .environment(session.environment_id)
            .ok_or_else(|| AuthError::Unknown(anyhow::anyhow!("environment disappeared")))?
            .clone();
        let ctx = self.resolve(&environment, &session.provider_config_key)?;

        let result = match session.auth_mode {
            AuthMode::OAuth2 | AuthMode::Custom => oauth2::finish(self, &ctx, &session, &callback).await,
            AuthMode::OAuth1 => oauth1::finish(self, &ctx, &session, &callback).await,
            AuthMode::App | AuthMode::AppStore => app::finish(self, &ctx, &session, &callback).await,
            mode => Err(AuthError::InvalidAuthMode(mode.to_string())),
        }?;

        self.persist_and_notify(&ctx, &session, result).await
    }

    /// Upserts the connection, runs hooks, publishes success. Shared by all
    /// finish paths and the synchronous modes.
    pub(crate) async fn persist_and_notify(
        &self,
        ctx: &FlowContext,
        session: &OAuthSession,
        result: FinishResult,
    ) -> Result<Completion, AuthError> {
        let operation = self
            .connections
            .upsert(
                session.environment_id,
                &session.provider_config_key,
                &session.connection_id,
                &ctx.integration.provider,
                &result.credentials,
                &result.connection_config,
                &result.metadata,
            )
            .map_err(AuthError::Unknown)?;

        let completion = Completion {
            provider_config_key: session.provider_config_key.clone(),
            connection_id: session.connection_id.clone(),
            provider: ctx.integration.provider.clone(),
            auth_mode: result.credentials.auth_mode(),
            operation,
            pending: result.pending,
            web_socket_client_id: session.web_socket_client_id.clone(),
        };

        if let Ok(Some(connection)) = self.connections.get(
            session.environment_id,
            &session.provider_config_key,
            &session.connection_id,
        ) {
            // Hooks are best-effort and server-authoritative: they run even
            // if the originating caller is long gone.
            self.hooks
                .post_connection(&ctx.environment, &connection, operation, !result.pending)
                .await;
        } else {
            warn!(
                provider_config_key = %session.provider_config_key,
                "Connection missing immediately after upsert; hooks skipped"
            );
        }

        Ok(completion)
    }
}

/// Effective client id/secret/scopes after per-start overrides.
pub(crate) fn client_settings(
    integration: &IntegrationConfig,
    session_config: &Map<String, Value>,
) -> ClientSettings {
    let id_override = session_config
        .get(CLIENT_ID_OVERRIDE_KEY)
        .and_then(Value::as_str)
        .map(str::to_string);
    let secret_override = session_config
        .get(CLIENT_SECRET_OVERRIDE_KEY)
        .and_then(Value::as_str)
        .map(str::to_string);

    let config_override = if id_override.is_some() || secret_override.is_some() {
        Some(ConfigOverride {
            oauth_client_id: id_override.clone(),
            oauth_client_secret: secret_override.clone(),
            oauth_scopes: None,
        })
    } else {
        None
    };

    ClientSettings {
        client_id: id_override.unwrap_or_else(|| integration.oauth_client_id.clone()),
        client_secret: secret_override.unwrap_or_else(|| integration.oauth_client_secret.clone()),
        scopes: integration.scopes(),
        config_override,
    }
}

/// Builds the interpolation context: integration `custom` entries overlaid
/// by the connection config.
pub(crate) fn interpolation_ctx(
    connection_config: &Map<String, Value>,
    integration: &IntegrationConfig,
) -> Map<String, Value> {
    let mut ctx = integration.custom.clone().unwrap_or_default();
    for (key, value) in connection_config {
        ctx.insert(key.clone(), value.clone());
    }
    ctx
}

/// Stashes per-start client overrides into the session connection config so
/// `finish` and later refreshes can re-apply them.
pub(crate) fn stash_overrides(config: &mut Map<String, Value>, request: &StartRequest) {
    if let Some(id) = &request.client_id_override {
        config.insert(CLIENT_ID_OVERRIDE_KEY.to_string(), Value::String(id.clone()));
    }
    if let Some(secret) = &request.client_secret_override {
        config.insert(
            CLIENT_SECRET_OVERRIDE_KEY.to_string(),
            Value::String(secret.clone()),
        );
    }
}

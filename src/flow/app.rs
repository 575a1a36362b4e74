//! App-installation driver (APP, APP_STORE; CUSTOM shares the start leg).
//!
//! These handshakes send the user to an installation page rather than a
//! consent screen. The session id rides along as `state` so the provider's
//! post-install redirect can be re-bound to its originating request. For
//! plain APP and APP_STORE the callback is the whole story: there is no
//! code exchange, the posted installation id plus the declared callback
//! metadata become the connection. (CUSTOM callbacks instead run the
//! OAuth2 finish leg, which layers a token exchange on top.)

use super::{
    interpolation_ctx, oauth2, stash_overrides, AuthEngine, CallbackParams, FinishResult,
    FlowContext, StartOutcome, StartRequest,
};
use crate::connection::{Credentials, ExchangedCredentials};
use crate::error::AuthError;
use crate::interpolate::{interpolate, missing_keys, Encode};
use crate::provider::AuthMode;
use crate::session::OAuthSession;
use serde_json::{Map, Value};
use tracing::debug;

pub(crate) async fn start(
    engine: &AuthEngine,
    ctx: &FlowContext,
    request: StartRequest,
) -> Result<StartOutcome, AuthError> {
    let provider = &ctx.provider;
    let template = provider
        .authorization_url
        .as_deref()
        .ok_or_else(|| AuthError::InvalidAuthMode(provider.auth_mode.to_string()))?;

    let mut connection_config = request.params.clone();
    stash_overrides(&mut connection_config, &request);

    // The public installation link is only known to the tenant config.
    let mut ictx = interpolation_ctx(&connection_config, &ctx.integration);
    if let Some(app_link) = &ctx.integration.app_link {
        ictx.insert("appPublicLink".to_string(), Value::String(app_link.clone()));
    }

    let missing = missing_keys(template, &ictx);
    if !missing.is_empty() {
        return Err(AuthError::InvalidConnectionConfig {
            template: template.to_string(),
            keys: missing,
        });
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
    engine.sessions.create(&session).map_err(AuthError::Unknown)?;

    let base = interpolate(template, &ictx, Encode::None)?;
    let separator = if base.contains('?') { '&' } else { '?' };
    let url = format!("{base}{separator}state={}", urlencoding::encode(&session.id));

    debug!(session_id = %session.id, "Redirecting to app installation page");
    Ok(StartOutcome::Redirect { url })
}

/// Completes an APP / APP_STORE installation. The provider's post-install
/// redirect must carry the installation id; the declared callback metadata
/// is harvested into the connection config alongside it.
pub(crate) async fn finish(
    _engine: &AuthEngine,
    ctx: &FlowContext,
    session: &OAuthSession,
    callback: &CallbackParams,
) -> Result<FinishResult, AuthError> {
    let installation_id = callback
        .installation_id
        .clone()
        .ok_or(AuthError::InvalidCallbackOauth2)?;

    let mut connection_config = session.connection_config.clone();
    let callback_map = Value::Object(callback.all.clone());
    oauth2::harvest(
        &mut connection_config,
        &callback_map,
        ctx.provider.redirect_uri_metadata.as_deref(),
    );
    connection_config.insert(
        "installation_id".to_string(),
        Value::String(installation_id),
    );

    let payload = ExchangedCredentials {
        token: None,
        expires_at: None,
        raw: callback_map,
    };
    let credentials = match ctx.provider.auth_mode {
        AuthMode::AppStore => Credentials::AppStore(payload),
        _ => Credentials::App(payload),
    };

    Ok(FinishResult {
        credentials,
        connection_config,
        metadata: Map::new(),
        pending: false,
    })
}

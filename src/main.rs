use anyhow::{Context, Result};
use junction::api::{create_auth_router, AppState};
use junction::config::Config;
use junction::connection::ConnectionStore;
use junction::flow::AuthEngine;
use junction::hooks::{HookRunner, NoopScheduler};
use junction::notify::{Notifier, WebhookSender, WsClients};
use junction::probe::{DirectProxy, VerificationProber};
use junction::provider::{Environment, IntegrationConfig, ProviderRegistry, TenantRegistry};
use junction::session::{run_session_sweeper, SessionStore};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("junction={}", config.log_level).into()),
        )
        .init();

    info!("Junction starting...");

    // Provider descriptors are validated once, here.
    let providers_path =
        std::env::var("JUNCTION_PROVIDERS_PATH").unwrap_or_else(|_| "providers.yaml".to_string());
    let providers = Arc::new(
        ProviderRegistry::from_file(&providers_path)
            .with_context(|| format!("Failed to load {providers_path}"))?,
    );
    info!(providers = providers.len(), "Provider registry loaded");

    let tenants = Arc::new(load_tenants()?);

    let sessions = Arc::new(SessionStore::new(&config.db_path)?);
    let connections = Arc::new(ConnectionStore::new(&config.db_path, &config.encryption_key)?);
    info!(db_path = %config.db_path, "Stores initialized");

    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(config.upstream_timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;

    let notifier = Arc::new(Notifier::new(WsClients::new(), config.telemetry));
    let hooks = Arc::new(HookRunner::new(
        Arc::clone(&connections),
        Arc::new(NoopScheduler),
        WebhookSender::new(http.clone()),
        Arc::clone(&notifier),
        config.connections_with_scripts_cap,
    ));
    let prober = Arc::new(VerificationProber::new(Box::new(DirectProxy::new(
        http.clone(),
    ))));

    let engine = Arc::new(AuthEngine {
        providers,
        tenants,
        sessions: Arc::clone(&sessions),
        connections,
        hooks,
        notifier,
        prober,
        http,
        config: config.clone(),
    });

    // Expired handshakes are reclaimed in the background.
    tokio::spawn(run_session_sweeper(sessions, 60));
    info!("Session sweeper started");

    let app = create_auth_router(AppState { engine }, &config.websockets_path);

    let addr = format!("0.0.0.0:{}", config.port);
    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Builds the tenant registry. A single environment is configured from the
/// process environment; integrations come from an optional YAML file (one
/// [`IntegrationConfig`] per entry).
fn load_tenants() -> Result<TenantRegistry> {
    let mut registry = TenantRegistry::new();

    let environment = Environment {
        id: 1,
        secret_key: std::env::var("JUNCTION_SECRET_KEY").unwrap_or_else(|_| "dev-secret".to_string()),
        public_key: std::env::var("JUNCTION_PUBLIC_KEY").unwrap_or_else(|_| "dev-public".to_string()),
        hmac_enabled: std::env::var("JUNCTION_HMAC_ENABLED")
            .map(|v| v == "true")
            .unwrap_or(false),
        hmac_key: std::env::var("JUNCTION_HMAC_KEY").ok(),
        webhook_url: std::env::var("JUNCTION_WEBHOOK_URL").ok(),
        webhook_secret: std::env::var("JUNCTION_WEBHOOK_SECRET").ok(),
    };
    registry.add_environment(environment);

    let integrations_path =
        std::env::var("JUNCTION_INTEGRATIONS_PATH").unwrap_or_else(|_| "integrations.yaml".to_string());
    match std::fs::read_to_string(&integrations_path) {
        Ok(contents) => {
            let integrations: Vec<IntegrationConfig> = serde_yaml::from_str(&contents)
                .with_context(|| format!("Invalid integrations file {integrations_path}"))?;
            info!(count = integrations.len(), "Integrations loaded");
            for integration in integrations {
                registry.add_integration(1, integration);
            }
        }
        Err(_) => {
            info!("No integrations file found; configure integrations via the registry");
        }
    }

    Ok(registry)
}

//! Post-connection hook pipeline.
//!
//! Runs after a connection reaches a terminal success state, in order:
//! initial sync scheduling, internal post-connect script, tenant-defined
//! external script, auth-failure cleanup, signed outbound webhook. Every
//! step is best-effort: a failing hook is logged and the pipeline
//! continues; nothing rolls back the stored connection.

use crate::connection::{Connection, ConnectionStore, UpsertOperation};
use crate::error::AuthError;
use crate::notify::{AuthWebhookPayload, Notifier, WebhookSender};
use crate::provider::Environment;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Orchestrator seam: schedules the initial sync for a new connection. The
/// real scheduler lives outside this crate.
#[async_trait]
pub trait SyncScheduler: Send + Sync {
    async fn schedule_initial_sync(&self, connection: &Connection) -> anyhow::Result<()>;
}

/// Provider- or tenant-defined script executed after a connection is
/// created. Tenant scripts run in an external sandbox behind this seam.
#[async_trait]
pub trait PostConnectionScript: Send + Sync {
    async fn run(&self, connection: &Connection) -> anyhow::Result<()>;
}

/// Scheduler used when no orchestrator is wired in.
pub struct NoopScheduler;

#[async_trait]
impl SyncScheduler for NoopScheduler {
    async fn schedule_initial_sync(&self, _connection: &Connection) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Runs the ordered post-connection pipeline.
pub struct HookRunner {
    connections: Arc<ConnectionStore>,
    scheduler: Arc<dyn SyncScheduler>,
    internal_script: Option<Arc<dyn PostConnectionScript>>,
    external_script: Option<Arc<dyn PostConnectionScript>>,
    webhooks: WebhookSender,
    notifier: Arc<Notifier>,
    /// Per-integration cap on connections that may trigger scripts/syncs.
    scripts_cap: Option<i64>,
}

impl HookRunner {
    pub fn new(
        connections: Arc<ConnectionStore>,
        scheduler: Arc<dyn SyncScheduler>,
        webhooks: WebhookSender,
        notifier: Arc<Notifier>,
        scripts_cap: Option<i64>,
    ) -> Self {
        Self {
            connections,
            scheduler,
            internal_script: None,
            external_script: None,
            webhooks,
            notifier,
            scripts_cap,
        }
    }

    pub fn with_internal_script(mut self, script: Arc<dyn PostConnectionScript>) -> Self {
        self.internal_script = Some(script);
        self
    }

    pub fn with_external_script(mut self, script: Arc<dyn PostConnectionScript>) -> Self {
        self.external_script = Some(script);
        self
    }

    /// Terminal-success pipeline. `initiate_sync` is false for pending app
    /// connections awaiting their installation id.
    pub async fn post_connection(
        &self,
        environment: &Environment,
        connection: &Connection,
        operation: UpsertOperation,
        initiate_sync: bool,
    ) {
        if operation == UpsertOperation::Creation && initiate_sync {
            match self.within_scripts_cap(connection) {
                true => {
                    if let Err(e) = self.scheduler.schedule_initial_sync(connection).await {
                        warn!(
                            connection_id = %connection.connection_id,
                            error = %e,
                            "Initial sync scheduling failed"
                        );
                    }
                }
                false => {
                    info!(
                        provider_config_key = %connection.provider_config_key,
                        "Connection cap reached; initial sync skipped"
                    );
                    self.notifier.telemetry("resource_capped");
                }
            }
        }

        for (label, script) in [
            ("internal", &self.internal_script),
            ("external", &self.external_script),
        ] {
            if let Some(script) = script {
                if let Err(e) = script.run(connection).await {
                    warn!(
                        connection_id = %connection.connection_id,
                        script = label,
                        error = %e,
                        "Post-connection script failed"
                    );
                }
            }
        }

        if let Err(e) = self.connections.clear_auth_failure(
            connection.environment_id,
            &connection.provider_config_key,
            &connection.connection_id,
        ) {
            warn!(error = %e, "Failed to clear auth failure record");
        }

        let operation_name = match operation {
            UpsertOperation::Creation => "creation",
            UpsertOperation::Update => "update",
        };
        self.send_webhook(environment, connection, operation_name, true, None)
            .await;

        debug!(
            connection_id = %connection.connection_id,
            operation = operation_name,
            "Post-connection hooks complete"
        );
    }

    /// Refresh-success path: clear any failure record and notify the tenant.
    pub async fn post_refresh(&self, environment: &Environment, connection: &Connection) {
        if let Err(e) = self.connections.clear_auth_failure(
            connection.environment_id,
            &connection.provider_config_key,
            &connection.connection_id,
        ) {
            warn!(error = %e, "Failed to clear auth failure record");
        }
        self.send_webhook(environment, connection, "refresh", true, None)
            .await;
    }

    /// Refresh-failure path: persist the failure record and notify.
    pub async fn post_refresh_failure(
        &self,
        environment: &Environment,
        connection: &Connection,
        error: &AuthError,
    ) {
        let record = serde_json::json!({
            "code": error.code(),
            "message": error.to_string(),
        });
        if let Err(e) = self.connections.set_auth_failure(
            connection.environment_id,
            &connection.provider_config_key,
            &connection.connection_id,
            &record,
        ) {
            warn!(error = %e, "Failed to persist auth failure record");
        }
        self.send_webhook(environment, connection, "refresh", false, Some(error.code()))
            .await;
    }

    fn within_scripts_cap(&self, connection: &Connection) -> bool {
        let Some(cap) = self.scripts_cap else {
            return true;
        };
        match self
            .connections
            .count_for_integration(connection.environment_id, &connection.provider_config_key)
        {
            Ok(count) => count <= cap,
            Err(e) => {
                warn!(error = %e, "Cap check failed; allowing sync");
                true
            }
        }
    }

    async fn send_webhook(
        &self,
        environment: &Environment,
        connection: &Connection,
        operation: &str,
        success: bool,
        error: Option<&str>,
    ) {
        let auth_mode = connection.credentials.auth_mode().to_string();
        let payload = AuthWebhookPayload {
            kind: "auth",
            connection_id: &connection.connection_id,
            provider_config_key: &connection.provider_config_key,
            auth_mode: &auth_mode,
            provider: &connection.provider,
            operation,
            success,
            error,
        };
        self.webhooks.send_auth_webhook(environment, &payload).await;
    }
}

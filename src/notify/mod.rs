//! Transport adapters for authorization outcomes.
//!
//! Three channels fan out of every terminal state transition: the
//! websocket event back to the UI client that initiated the handshake, the
//! structured log / telemetry stream, and the signed outbound webhook to
//! the tenant (sent by the hook runner).

use crate::error::AuthError;
use crate::provider::Environment;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::json;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Signature header on outbound webhooks.
pub const SIGNATURE_HEADER: &str = "X-Junction-Signature";

/// Registry of connected UI websocket clients, keyed by the opaque client
/// id handed out at upgrade time.
#[derive(Clone, Default)]
pub struct WsClients {
    senders: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<String>>>>,
}

impl WsClients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client and returns the receiving half for its socket task.
    pub fn register(&self, client_id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().insert(client_id.to_string(), tx);
        rx
    }

    pub fn unregister(&self, client_id: &str) {
        self.senders.lock().unwrap().remove(client_id);
    }

    /// Sends a serialized event; false when the client is gone.
    fn send(&self, client_id: &str, payload: String) -> bool {
        match self.senders.lock().unwrap().get(client_id) {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.senders.lock().unwrap().len()
    }
}

/// Publishes handshake outcomes to the originating UI client and the
/// structured log, and counts telemetry events.
pub struct Notifier {
    clients: WsClients,
    telemetry_enabled: bool,
}

impl Notifier {
    pub fn new(clients: WsClients, telemetry_enabled: bool) -> Self {
        Self {
            clients,
            telemetry_enabled,
        }
    }

    pub fn clients(&self) -> &WsClients {
        &self.clients
    }

    /// Success event to the originating client, if any is still connected.
    pub fn publish_success(
        &self,
        ws_client_id: Option<&str>,
        provider_config_key: &str,
        connection_id: &str,
    ) {
        info!(
            provider_config_key,
            connection_id, "Authorization succeeded"
        );
        self.telemetry("auth_success");

        let Some(client_id) = ws_client_id else { return };
        let payload = json!({
            "message_type": "success",
            "provider_config_key": provider_config_key,
            "connection_id": connection_id,
        });
        if !self.clients.send(client_id, payload.to_string()) {
            debug!(client_id, "UI client gone before success event");
        }
    }

    /// Error event: stable code plus user-facing message.
    pub fn publish_error(&self, ws_client_id: Option<&str>, error: &AuthError) {
        warn!(code = error.code(), error = %error, "Authorization failed");
        self.telemetry("auth_failure");

        let Some(client_id) = ws_client_id else { return };
        let payload = json!({
            "message_type": "error",
            "error_code": error.code(),
            "error_desc": error.to_string(),
        });
        if !self.clients.send(client_id, payload.to_string()) {
            debug!(client_id, "UI client gone before error event");
        }
    }

    /// Counts a named telemetry event when telemetry is enabled.
    pub fn telemetry(&self, event: &str) {
        if self.telemetry_enabled {
            info!(target: "telemetry", event, "telemetry event");
        }
    }
}

/// Outbound auth webhook payload.
#[derive(Debug, Serialize)]
pub struct AuthWebhookPayload<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(rename = "connectionId")]
    pub connection_id: &'a str,
    #[serde(rename = "providerConfigKey")]
    pub provider_config_key: &'a str,
    #[serde(rename = "authMode")]
    pub auth_mode: &'a str,
    pub provider: &'a str,
    pub operation: &'a str,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
}

/// Signs and delivers webhooks to tenant endpoints.
pub struct WebhookSender {
    http: reqwest::Client,
}

impl WebhookSender {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Hex HMAC-SHA256 of the serialized body under the tenant secret.
    pub fn signature(secret: &str, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Delivers an auth webhook to the environment's endpoint, if one is
    /// configured. Delivery failures are logged, never propagated.
    pub async fn send_auth_webhook(
        &self,
        environment: &Environment,
        payload: &AuthWebhookPayload<'_>,
    ) {
        let Some(url) = &environment.webhook_url else {
            return;
        };
        let body = match serde_json::to_string(payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed to serialize webhook payload");
                return;
            }
        };

        let mut request = self
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .body(body.clone());
        if let Some(secret) = &environment.webhook_secret {
            request = request.header(SIGNATURE_HEADER, Self::signature(secret, &body));
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url = %url, "Auth webhook delivered");
            }
            Ok(response) => {
                warn!(url = %url, status = %response.status(), "Auth webhook rejected");
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Auth webhook delivery failed");
            }
        }
    }
}

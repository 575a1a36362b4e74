//! Credential verification probe.
//!
//! When a provider declares `proxy.verification`, freshly minted non-OAuth
//! credentials are exercised once with a minimal request routed through the
//! downstream proxy. Any 2xx means the credentials work; everything else
//! surfaces as `connection_test_failed` with the upstream status attached.
//! The probe is read-only and never retried.

use crate::connection::Credentials;
use crate::error::AuthError;
use crate::interpolate::{interpolate, Encode};
use crate::provider::ProxyVerification;
use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Map, Value};
use tracing::debug;

/// The downstream proxy the probe is routed through. The production proxy
/// lives outside this crate; the default implementation below calls the
/// provider directly with the same semantics.
#[async_trait]
pub trait ProxyClient: Send + Sync {
    /// Issues the request and returns the upstream HTTP status code.
    async fn request(
        &self,
        method: &str,
        url: &str,
        headers: Vec<(String, String)>,
    ) -> anyhow::Result<u16>;
}

/// Direct HTTP proxy used when no external proxy collaborator is wired in.
pub struct DirectProxy {
    http: reqwest::Client,
}

impl DirectProxy {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ProxyClient for DirectProxy {
    async fn request(
        &self,
        method: &str,
        url: &str,
        headers: Vec<(String, String)>,
    ) -> anyhow::Result<u16> {
        let method = Method::from_bytes(method.as_bytes())?;
        let mut request = self.http.request(method, url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        Ok(response.status().as_u16())
    }
}

/// Issues provider-declared verification probes.
pub struct VerificationProber {
    proxy: Box<dyn ProxyClient>,
}

impl VerificationProber {
    pub fn new(proxy: Box<dyn ProxyClient>) -> Self {
        Self { proxy }
    }

    /// Probes the given credentials. `ictx` is the interpolation context the
    /// endpoint and headers resolve against (connection config plus the
    /// supplied credential fields).
    pub async fn verify(
        &self,
        verification: &ProxyVerification,
        credentials: &Credentials,
        ictx: &Map<String, Value>,
    ) -> Result<(), AuthError> {
        let base = verification
            .base_url_override
            .as_deref()
            .unwrap_or("")
            .trim_end_matches('/');
        let endpoint = interpolate(&verification.endpoint, ictx, Encode::None)?;
        let url = if endpoint.starts_with("http") {
            endpoint
        } else {
            format!("{base}{endpoint}")
        };

        let mut headers: Vec<(String, String)> = Vec::new();
        if let Some(declared) = &verification.headers {
            for (name, template) in declared {
                headers.push((name.clone(), interpolate(template, ictx, Encode::None)?));
            }
        } else if let Some(authorization) = default_authorization(credentials) {
            headers.push(("Authorization".to_string(), authorization));
        }

        debug!(url = %url, method = %verification.method, "Verification probe");
        match self.proxy.request(&verification.method, &url, headers).await {
            Ok(status) if (200..300).contains(&status) => Ok(()),
            Ok(status) => Err(AuthError::ConnectionTestFailed {
                status: Some(status),
            }),
            Err(_) => Err(AuthError::ConnectionTestFailed { status: None }),
        }
    }
}

/// Default Authorization header when the provider declares none.
fn default_authorization(credentials: &Credentials) -> Option<String> {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    match credentials {
        Credentials::ApiKey { api_key } => Some(format!("Bearer {api_key}")),
        Credentials::Basic { username, password } => Some(format!(
            "Basic {}",
            BASE64.encode(format!("{username}:{password}"))
        )),
        Credentials::Jwt(exchanged)
        | Credentials::Signature(exchanged)
        | Credentials::Tableau(exchanged)
        | Credentials::Bill(exchanged)
        | Credentials::TwoStep(exchanged)
        | Credentials::AppStore(exchanged)
        | Credentials::App(exchanged) => exchanged.token.as_ref().map(|t| format!("Bearer {t}")),
        _ => None,
    }
}

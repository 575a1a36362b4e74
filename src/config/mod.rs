//! Runtime configuration.
//!
//! All settings are read from environment variables once at startup. Missing
//! optional values fall back to the defaults below; a missing encryption key
//! is a hard startup error because connections cannot be persisted without it.

use anyhow::{Context, Result};

/// Complete broker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base64-encoded 32-byte master key for credential encryption
    /// (`JUNCTION_ENCRYPTION_KEY`).
    pub encryption_key: String,
    /// Publicly reachable base URL of this broker (`JUNCTION_SERVER_URL`).
    /// Used to build OAuth callback URLs.
    pub server_url: String,
    /// SQLite database path (`JUNCTION_DB_PATH`).
    pub db_path: String,
    /// HTTP listen port (`SERVER_PORT`).
    pub port: u16,
    /// Log level: debug, info, warn or error (`LOG_LEVEL`).
    pub log_level: String,
    /// Path the UI websocket endpoint is mounted at
    /// (`JUNCTION_SERVER_WEBSOCKETS_PATH`).
    pub websockets_path: String,
    /// Whether telemetry events are emitted (`TELEMETRY`).
    pub telemetry: bool,
    /// Per-integration cap on connections that trigger scripts
    /// (`CONNECTIONS_WITH_SCRIPTS_CAP_LIMIT`). None disables the cap.
    pub connections_with_scripts_cap: Option<i64>,
    /// Deadline for outbound HTTP calls, seconds (`UPSTREAM_TIMEOUT_SECS`).
    pub upstream_timeout_secs: u64,
    /// Refresh ahead-of-expiry window, seconds (`REFRESH_SKEW_SECS`).
    pub refresh_skew_secs: i64,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let encryption_key = std::env::var("JUNCTION_ENCRYPTION_KEY")
            .context("JUNCTION_ENCRYPTION_KEY is required (base64, 32 bytes)")?;

        let port = env_or("SERVER_PORT", "3003")
            .parse::<u16>()
            .context("SERVER_PORT must be an integer")?;

        let log_level = env_or("LOG_LEVEL", "info");
        if !matches!(log_level.as_str(), "debug" | "info" | "warn" | "error") {
            anyhow::bail!("LOG_LEVEL must be one of debug, info, warn, error");
        }

        let telemetry = env_or("TELEMETRY", "false").parse::<bool>().unwrap_or(false);

        let connections_with_scripts_cap = std::env::var("CONNECTIONS_WITH_SCRIPTS_CAP_LIMIT")
            .ok()
            .and_then(|v| v.parse::<i64>().ok());

        Ok(Self {
            encryption_key,
            server_url: env_or("JUNCTION_SERVER_URL", "http://localhost:3003"),
            db_path: env_or("JUNCTION_DB_PATH", "junction.db"),
            port,
            log_level,
            websockets_path: env_or("JUNCTION_SERVER_WEBSOCKETS_PATH", "/ws"),
            telemetry,
            connections_with_scripts_cap,
            upstream_timeout_secs: env_or("UPSTREAM_TIMEOUT_SECS", "30")
                .parse::<u64>()
                .context("UPSTREAM_TIMEOUT_SECS must be an integer")?,
            refresh_skew_secs: env_or("REFRESH_SKEW_SECS", "900")
                .parse::<i64>()
                .context("REFRESH_SKEW_SECS must be an integer")?,
        })
    }

    /// The callback URL providers redirect back to.
    pub fn callback_url(&self) -> String {
        format!("{}/oauth/callback", self.server_url.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_url_strips_trailing_slash() {
        let config = Config {
            encryption_key: String::new(),
            server_url: "https://broker.example.com/".to_string(),
            db_path: ":memory:".to_string(),
            port: 3003,
            log_level: "info".to_string(),
            websockets_path: "/ws".to_string(),
            telemetry: false,
            connections_with_scripts_cap: None,
            upstream_timeout_secs: 30,
            refresh_skew_secs: 900,
        };
        assert_eq!(
            config.callback_url(),
            "https://broker.example.com/oauth/callback"
        );
    }
}

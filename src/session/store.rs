//! Durable session storage.
//!
//! Sessions are shared across broker instances through the database, so the
//! single-use guarantee must hold there, not in process memory. The whole
//! row is serialized as JSON; only the id and expiry are indexed columns.

use super::OAuthSession;
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// SQLite-backed store for pending handshake sessions.
///
/// # Schema
/// ```sql
/// CREATE TABLE _junction_oauth_sessions (
///     id         TEXT PRIMARY KEY,
///     payload    TEXT NOT NULL,   -- session JSON
///     created_at TEXT NOT NULL    -- RFC 3339
/// );
/// ```
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    /// Opens (or creates) the session table at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open session database")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS _junction_oauth_sessions (
                id         TEXT PRIMARY KEY,
                payload    TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )
        .context("Failed to create session table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Persists a new session.
    pub fn create(&self, session: &OAuthSession) -> Result<()> {
        let payload = serde_json::to_string(session).context("Failed to serialize session")?;
        self.conn
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO _junction_oauth_sessions (id, payload, created_at) VALUES (?1, ?2, ?3)",
                params![session.id, payload, session.created_at.to_rfc3339()],
            )
            .context("Failed to persist session")?;
        Ok(())
    }

    /// Replaces a stored session's payload (OAuth1 stores the request-token
    /// secret between the two legs).
    pub fn update(&self, session: &OAuthSession) -> Result<()> {
        let payload = serde_json::to_string(session).context("Failed to serialize session")?;
        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE _junction_oauth_sessions SET payload = ?2 WHERE id = ?1",
                params![session.id, payload],
            )
            .context("Failed to update session")?;
        Ok(())
    }

    /// Atomically removes and returns the session for `id`.
    ///
    /// The DELETE-returning-row form makes the consume a single statement:
    /// for concurrent callers with the same id, at most one receives the
    /// session. Expired rows are consumed but reported as absent.
    pub fn find_and_delete(&self, id: &str) -> Result<Option<OAuthSession>> {
        let payload: Option<String> = self
            .conn
            .lock()
            .unwrap()
            .query_row(
                "DELETE FROM _junction_oauth_sessions WHERE id = ?1 RETURNING payload",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to consume session")?;

        let Some(payload) = payload else {
            return Ok(None);
        };
        let session: OAuthSession =
            serde_json::from_str(&payload).context("Stored session is corrupt")?;

        if session.is_expired(Utc::now()) {
            debug!(session_id = %id, "Consumed session was already expired");
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// Deletes every expired session. Returns the number removed.
    pub fn sweep_expired(&self) -> Result<usize> {
        let cutoff = (Utc::now() - chrono::Duration::seconds(super::SESSION_TTL_SECS)).to_rfc3339();
        let removed = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "DELETE FROM _junction_oauth_sessions WHERE created_at < ?1",
                params![cutoff],
            )
            .context("Failed to sweep sessions")?;
        Ok(removed)
    }

    /// Number of pending sessions (monitoring).
    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM _junction_oauth_sessions", [], |row| {
                row.get(0)
            })
            .context("Failed to count sessions")?;
        Ok(count as usize)
    }
}

/// Background task that periodically reclaims expired sessions.
pub async fn run_session_sweeper(store: Arc<SessionStore>, interval_secs: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
    loop {
        interval.tick().await;
        match store.sweep_expired() {
            Ok(removed) if removed > 0 => {
                debug!(removed, "Session sweep complete");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Session sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::AuthMode;
    use serde_json::Map;

    fn store() -> SessionStore {
        SessionStore::new(":memory:").expect("in-memory store failed")
    }

    fn sample() -> OAuthSession {
        OAuthSession::new(
            1,
            "github-prod",
            "github",
            AuthMode::OAuth2,
            "user-1",
            "https://broker.example.com/oauth/callback",
            Map::new(),
            Some("ws-1".to_string()),
            "log-1",
        )
    }

    #[test]
    fn test_create_and_consume() {
        let store = store();
        let session = sample();
        store.create(&session).unwrap();

        let found = store.find_and_delete(&session.id).unwrap().unwrap();
        assert_eq!(found.provider_config_key, "github-prod");
        assert_eq!(found.connection_id, "user-1");
        assert_eq!(found.code_verifier, session.code_verifier);
    }

    #[test]
    fn test_consume_is_single_use() {
        let store = store();
        let session = sample();
        store.create(&session).unwrap();

        assert!(store.find_and_delete(&session.id).unwrap().is_some());
        assert!(store.find_and_delete(&session.id).unwrap().is_none());
    }

    #[test]
    fn test_unknown_id_is_none() {
        let store = store();
        assert!(store.find_and_delete("no-such-state").unwrap().is_none());
    }

    #[test]
    fn test_expired_session_is_rejected_and_consumed() {
        let store = store();
        let mut session = sample();
        session.created_at = Utc::now() - chrono::Duration::seconds(super::super::SESSION_TTL_SECS + 60);
        store.create(&session).unwrap();

        assert!(store.find_and_delete(&session.id).unwrap().is_none());
        // The expired row is gone either way.
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_update_persists_request_token_secret() {
        let store = store();
        let mut session = sample();
        store.create(&session).unwrap();

        session.request_token_secret = Some("rts".to_string());
        store.update(&session).unwrap();

        let found = store.find_and_delete(&session.id).unwrap().unwrap();
        assert_eq!(found.request_token_secret.as_deref(), Some("rts"));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let store = store();
        let fresh = sample();
        let mut stale = sample();
        stale.created_at = Utc::now() - chrono::Duration::seconds(super::super::SESSION_TTL_SECS + 60);
        store.create(&fresh).unwrap();
        store.create(&stale).unwrap();

        let removed = store.sweep_expired().unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count().unwrap(), 1);
        assert!(store.find_and_delete(&fresh.id).unwrap().is_some());
    }
}

//! Encrypted connection storage.
//!
//! Credentials are sealed with AES-256-GCM before they touch the database;
//! the connection config and metadata maps are stored as plain JSON. The
//! `(environment_id, provider_config_key, connection_id)` triple is the
//! unique key; upserts report whether they created or updated so the hook
//! pipeline can distinguish first connections from re-authorizations.

use super::{encryption, Connection, Credentials};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection as DbConnection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Mutex;

/// Whether an upsert created a new row or replaced an existing one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertOperation {
    Creation,
    Update,
}

/// SQLite-backed store for connections.
///
/// # Schema
/// ```sql
/// CREATE TABLE _junction_connections (
///     id                  INTEGER PRIMARY KEY,
///     environment_id      INTEGER NOT NULL,
///     provider_config_key TEXT NOT NULL,
///     connection_id       TEXT NOT NULL,
///     provider            TEXT NOT NULL,
///     credentials         TEXT NOT NULL,   -- sealed JSON
///     credentials_nonce   TEXT NOT NULL,
///     connection_config   TEXT NOT NULL,   -- JSON
///     metadata            TEXT NOT NULL,   -- JSON
///     last_auth_failure   TEXT,            -- JSON
///     created_at          TEXT NOT NULL,
///     updated_at          TEXT NOT NULL,
///     UNIQUE(environment_id, provider_config_key, connection_id)
/// );
/// ```
pub struct ConnectionStore {
    conn: Mutex<DbConnection>,
    encryption_key: Vec<u8>,
}

impl ConnectionStore {
    /// Opens the store and validates the base64 master key.
    pub fn new<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self> {
        let key_bytes = encryption::validate_key(encryption_key).context("Invalid encryption key")?;
        let conn = DbConnection::open(db_path).context("Failed to open connection database")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS _junction_connections (
                id                  INTEGER PRIMARY KEY,
                environment_id      INTEGER NOT NULL,
                provider_config_key TEXT NOT NULL,
                connection_id       TEXT NOT NULL,
                provider            TEXT NOT NULL,
                credentials         TEXT NOT NULL,
                credentials_nonce   TEXT NOT NULL,
                connection_config   TEXT NOT NULL,
                metadata            TEXT NOT NULL,
                last_auth_failure   TEXT,
                created_at          TEXT NOT NULL,
                updated_at          TEXT NOT NULL,
                UNIQUE(environment_id, provider_config_key, connection_id)
            )",
            [],
        )
        .context("Failed to create connections table")?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_connection_triple
             ON _junction_connections(environment_id, provider_config_key, connection_id)",
            [],
        )
        .context("Failed to create connection index")?;

        Ok(Self {
            conn: Mutex::new(conn),
            encryption_key: key_bytes,
        })
    }

    /// Inserts or replaces the connection for its triple.
    ///
    /// Runs in one immediate transaction so the created/updated decision and
    /// the write are a single unit under concurrent brokers.
    pub fn upsert(
        &self,
        environment_id: i64,
        provider_config_key: &str,
        connection_id: &str,
        provider: &str,
        credentials: &Credentials,
        connection_config: &Map<String, Value>,
        metadata: &Map<String, Value>,
    ) -> Result<UpsertOperation> {
        let document = serde_json::to_value(credentials).context("Failed to serialize credentials")?;
        let (sealed, nonce) = encryption::seal(&document, &self.encryption_key)
            .context("Failed to encrypt credentials")?;
        let config_json = serde_json::to_string(connection_config)?;
        let metadata_json = serde_json::to_string(metadata)?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin upsert transaction")?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM _junction_connections
                 WHERE environment_id = ?1 AND provider_config_key = ?2 AND connection_id = ?3",
                params![environment_id, provider_config_key, connection_id],
                |row| row.get(0),
            )
            .optional()?;

        let operation = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE _junction_connections
                     SET provider = ?2, credentials = ?3, credentials_nonce = ?4,
                         connection_config = ?5, metadata = ?6, updated_at = ?7
                     WHERE id = ?1",
                    params![id, provider, sealed, nonce, config_json, metadata_json, now],
                )?;
                UpsertOperation::Update
            }
            None => {
                tx.execute(
                    "INSERT INTO _junction_connections (
                        environment_id, provider_config_key, connection_id, provider,
                        credentials, credentials_nonce, connection_config, metadata,
                        created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                    params![
                        environment_id,
                        provider_config_key,
                        connection_id,
                        provider,
                        sealed,
                        nonce,
                        config_json,
                        metadata_json,
                        now,
                    ],
                )?;
                UpsertOperation::Creation
            }
        };

        tx.commit().context("Failed to commit upsert")?;
        Ok(operation)
    }

    /// Reads and decrypts a connection.
    pub fn get(
        &self,
        environment_id: i64,
        provider_config_key: &str,
        connection_id: &str,
    ) -> Result<Option<Connection>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, provider, credentials, credentials_nonce, connection_config,
                        metadata, last_auth_failure, created_at, updated_at
                 FROM _junction_connections
                 WHERE environment_id = ?1 AND provider_config_key = ?2 AND connection_id = ?3",
                params![environment_id, provider_config_key, connection_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query connection")?;

        let Some((id, provider, sealed, nonce, config_json, metadata_json, failure, created, updated)) =
            row
        else {
            return Ok(None);
        };

        let document = encryption::open(&sealed, &nonce, &self.encryption_key)
            .context("Failed to decrypt credentials")?;
        let credentials: Credentials =
            serde_json::from_value(document).context("Stored credentials are corrupt")?;

        Ok(Some(Connection {
            id,
            environment_id,
            provider_config_key: provider_config_key.to_string(),
            connection_id: connection_id.to_string(),
            provider,
            credentials,
            connection_config: serde_json::from_str(&config_json)
                .context("Stored connection config is corrupt")?,
            metadata: serde_json::from_str(&metadata_json).context("Stored metadata is corrupt")?,
            last_auth_failure: failure.map(|f| serde_json::from_str(&f)).transpose()?,
            created_at: parse_timestamp(&created)?,
            updated_at: parse_timestamp(&updated)?,
        }))
    }

    /// Rewrites only the credentials of an existing connection (refresh
    /// path). The row-level write lock of the immediate transaction is the
    /// cross-process serialization point for concurrent refreshers.
    pub fn update_credentials(
        &self,
        environment_id: i64,
        provider_config_key: &str,
        connection_id: &str,
        credentials: &Credentials,
    ) -> Result<()> {
        let document = serde_json::to_value(credentials).context("Failed to serialize credentials")?;
        let (sealed, nonce) = encryption::seal(&document, &self.encryption_key)
            .context("Failed to encrypt credentials")?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE _junction_connections
             SET credentials = ?4, credentials_nonce = ?5, updated_at = ?6
             WHERE environment_id = ?1 AND provider_config_key = ?2 AND connection_id = ?3",
            params![
                environment_id,
                provider_config_key,
                connection_id,
                sealed,
                nonce,
                now
            ],
        )
        .context("Failed to update credentials")?;
        tx.commit()?;
        Ok(())
    }

    /// Records a refresh failure. Stored tokens are left untouched so a
    /// later successful refresh can recover.
    pub fn set_auth_failure(
        &self,
        environment_id: i64,
        provider_config_key: &str,
        connection_id: &str,
        failure: &Value,
    ) -> Result<()> {
        self.conn.lock().unwrap().execute(
            "UPDATE _junction_connections SET last_auth_failure = ?4
             WHERE environment_id = ?1 AND provider_config_key = ?2 AND connection_id = ?3",
            params![
                environment_id,
                provider_config_key,
                connection_id,
                serde_json::to_string(failure)?
            ],
        )?;
        Ok(())
    }

    /// Clears any recorded failure after a success.
    pub fn clear_auth_failure(
        &self,
        environment_id: i64,
        provider_config_key: &str,
        connection_id: &str,
    ) -> Result<()> {
        self.conn.lock().unwrap().execute(
            "UPDATE _junction_connections SET last_auth_failure = NULL
             WHERE environment_id = ?1 AND provider_config_key = ?2 AND connection_id = ?3",
            params![environment_id, provider_config_key, connection_id],
        )?;
        Ok(())
    }

    /// Number of connections for one integration (script cap accounting).
    pub fn count_for_integration(
        &self,
        environment_id: i64,
        provider_config_key: &str,
    ) -> Result<i64> {
        let count = self.conn.lock().unwrap().query_row(
            "SELECT COUNT(*) FROM _junction_connections
             WHERE environment_id = ?1 AND provider_config_key = ?2",
            params![environment_id, provider_config_key],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Deletes a connection. Returns whether a row existed.
    pub fn delete(
        &self,
        environment_id: i64,
        provider_config_key: &str,
        connection_id: &str,
    ) -> Result<bool> {
        let affected = self.conn.lock().unwrap().execute(
            "DELETE FROM _junction_connections
             WHERE environment_id = ?1 AND provider_config_key = ?2 AND connection_id = ?3",
            params![environment_id, provider_config_key, connection_id],
        )?;
        Ok(affected > 0)
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .context("Failed to parse stored timestamp")?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::OAuth2Credentials;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde_json::json;

    fn test_store() -> ConnectionStore {
        let key = BASE64.encode([0u8; 32]);
        ConnectionStore::new(":memory:", &key).expect("in-memory store failed")
    }

    fn oauth2_credentials(access: &str, refresh: Option<&str>) -> Credentials {
        Credentials::OAuth2(OAuth2Credentials {
            access_token: access.to_string(),
            refresh_token: refresh.map(str::to_string),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
            raw: json!({"access_token": access}),
            config_override: None,
        })
    }

    #[test]
    fn test_upsert_reports_creation_then_update() {
        let store = test_store();
        let credentials = oauth2_credentials("t1", Some("r1"));

        let first = store
            .upsert(1, "github-prod", "user-1", "github", &credentials, &Map::new(), &Map::new())
            .unwrap();
        assert_eq!(first, UpsertOperation::Creation);

        let second = store
            .upsert(1, "github-prod", "user-1", "github", &credentials, &Map::new(), &Map::new())
            .unwrap();
        assert_eq!(second, UpsertOperation::Update);
    }

    #[test]
    fn test_get_roundtrip() {
        let store = test_store();
        let mut config = Map::new();
        config.insert("subdomain".to_string(), json!("acme"));

        store
            .upsert(
                1,
                "github-prod",
                "user-1",
                "github",
                &oauth2_credentials("t1", Some("r1")),
                &config,
                &Map::new(),
            )
            .unwrap();

        let connection = store.get(1, "github-prod", "user-1").unwrap().unwrap();
        assert_eq!(connection.provider, "github");
        assert_eq!(connection.connection_config["subdomain"], json!("acme"));
        match connection.credentials {
            Credentials::OAuth2(oauth2) => {
                assert_eq!(oauth2.access_token, "t1");
                assert_eq!(oauth2.refresh_token.as_deref(), Some("r1"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_get_missing_is_none() {
        let store = test_store();
        assert!(store.get(1, "github-prod", "nobody").unwrap().is_none());
    }

    #[test]
    fn test_triple_isolation() {
        let store = test_store();
        let credentials = oauth2_credentials("t", None);
        store
            .upsert(1, "github-prod", "user-1", "github", &credentials, &Map::new(), &Map::new())
            .unwrap();

        assert!(store.get(2, "github-prod", "user-1").unwrap().is_none());
        assert!(store.get(1, "github-dev", "user-1").unwrap().is_none());
        assert!(store.get(1, "github-prod", "user-2").unwrap().is_none());
    }

    #[test]
    fn test_update_credentials_only_touches_credentials() {
        let store = test_store();
        let mut config = Map::new();
        config.insert("region".to_string(), json!("eu"));
        store
            .upsert(
                1,
                "github-prod",
                "user-1",
                "github",
                &oauth2_credentials("old", Some("r1")),
                &config,
                &Map::new(),
            )
            .unwrap();

        store
            .update_credentials(1, "github-prod", "user-1", &oauth2_credentials("new", Some("r1")))
            .unwrap();

        let connection = store.get(1, "github-prod", "user-1").unwrap().unwrap();
        assert_eq!(connection.connection_config["region"], json!("eu"));
        match connection.credentials {
            Credentials::OAuth2(oauth2) => assert_eq!(oauth2.access_token, "new"),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_auth_failure_set_and_clear() {
        let store = test_store();
        store
            .upsert(
                1,
                "github-prod",
                "user-1",
                "github",
                &oauth2_credentials("t", None),
                &Map::new(),
                &Map::new(),
            )
            .unwrap();

        let failure = json!({"code": "refresh_token_external_error", "status": 401});
        store.set_auth_failure(1, "github-prod", "user-1", &failure).unwrap();
        let connection = store.get(1, "github-prod", "user-1").unwrap().unwrap();
        assert_eq!(connection.last_auth_failure.unwrap()["status"], json!(401));

        store.clear_auth_failure(1, "github-prod", "user-1").unwrap();
        let connection = store.get(1, "github-prod", "user-1").unwrap().unwrap();
        assert!(connection.last_auth_failure.is_none());
    }

    #[test]
    fn test_count_for_integration() {
        let store = test_store();
        let credentials = oauth2_credentials("t", None);
        for user in ["a", "b", "c"] {
            store
                .upsert(1, "github-prod", user, "github", &credentials, &Map::new(), &Map::new())
                .unwrap();
        }
        store
            .upsert(1, "slack-prod", "a", "slack", &credentials, &Map::new(), &Map::new())
            .unwrap();

        assert_eq!(store.count_for_integration(1, "github-prod").unwrap(), 3);
        assert_eq!(store.count_for_integration(1, "slack-prod").unwrap(), 1);
        assert_eq!(store.count_for_integration(2, "github-prod").unwrap(), 0);
    }

    #[test]
    fn test_delete() {
        let store = test_store();
        store
            .upsert(
                1,
                "github-prod",
                "user-1",
                "github",
                &oauth2_credentials("t", None),
                &Map::new(),
                &Map::new(),
            )
            .unwrap();

        assert!(store.delete(1, "github-prod", "user-1").unwrap());
        assert!(!store.delete(1, "github-prod", "user-1").unwrap());
        assert!(store.get(1, "github-prod", "user-1").unwrap().is_none());
    }

    #[test]
    fn test_credentials_are_encrypted_at_rest() {
        let store = test_store();
        store
            .upsert(
                1,
                "github-prod",
                "user-1",
                "github",
                &oauth2_credentials("plaintext-token", None),
                &Map::new(),
                &Map::new(),
            )
            .unwrap();

        let raw: String = store
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT credentials FROM _junction_connections", [], |row| row.get(0))
            .unwrap();
        assert!(!raw.contains("plaintext-token"));
    }
}

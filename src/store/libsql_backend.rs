//! libSQL backend for [`CredentialStore`] and [`MemoryStore`].
//!
//! Secrets are encrypted with the injected [`SecretCipher`] before they touch
//! the database; a SHA-256 fingerprint of the plaintext is stored alongside
//! for duplicate detection.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::backends::Backend;
use crate::crypto::SecretCipher;
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    Credential, CredentialStatus, CredentialStore, MemoryEntry, MemoryKind, MemoryStore,
    QuarantineReason,
};

/// libSQL-backed store.
///
/// Holds a single connection reused for all operations.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    cipher: Arc<dyn SecretCipher>,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path, cipher: Arc<dyn SecretCipher>) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let store = Self::from_database(db, cipher).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory(cipher: Arc<dyn SecretCipher>) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db, cipher).await
    }

    async fn from_database(
        db: LibSqlDatabase,
        cipher: Arc<dyn SecretCipher>,
    ) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            cipher,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_credentials(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<Credential>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut out = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => out.push(row_to_credential(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(out)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_timestamp(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(dt.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

fn fingerprint(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

const CREDENTIAL_COLUMNS: &str = "id, owner_id, backend, status, quarantine_reason, quota_reset_at, last_used_at, tokens_used_today, created_at";

fn row_to_credential(row: &libsql::Row) -> Result<Credential, DatabaseError> {
    let parse_err = |e: libsql::Error| DatabaseError::Query(format!("credential row parse: {e}"));

    let backend_str: String = row.get(2).map_err(parse_err)?;
    let backend = backend_str
        .parse::<Backend>()
        .map_err(|e| DatabaseError::Query(format!("credential row parse: {e}")))?;
    let status_str: String = row.get(3).map_err(parse_err)?;
    let reason_str: Option<String> = row.get(4).ok();
    let reset_str: Option<String> = row.get(5).ok();
    let last_used_str: Option<String> = row.get(6).ok();
    let tokens: i64 = row.get(7).map_err(parse_err)?;
    let created_str: String = row.get(8).map_err(parse_err)?;

    Ok(Credential {
        id: row.get(0).map_err(parse_err)?,
        owner_id: row.get(1).map_err(parse_err)?,
        backend,
        status: status_str.parse().unwrap_or(CredentialStatus::Active),
        quarantine_reason: reason_str.and_then(|s| s.parse().ok()),
        quota_reset_at: reset_str.as_deref().map(parse_datetime),
        last_used_at: last_used_str.as_deref().map(parse_datetime),
        tokens_used_today: tokens.max(0) as u64,
        created_at: parse_datetime(&created_str),
    })
}

// ── CredentialStore ─────────────────────────────────────────────────

#[async_trait]
impl CredentialStore for LibSqlStore {
    async fn create(
        &self,
        owner_id: &str,
        backend: Backend,
        secret: &SecretString,
    ) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let fp = fingerprint(secret.expose_secret());

        let mut rows = conn
            .query(
                "SELECT id FROM credentials WHERE owner_id = ?1 AND backend = ?2 AND fingerprint = ?3",
                params![owner_id, backend.as_str(), fp.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create: {e}")))?;
        if let Ok(Some(_)) = rows.next().await {
            return Err(DatabaseError::Constraint(format!(
                "{backend} credential already stored for {owner_id}"
            )));
        }

        let blob = self.cipher.encrypt(secret.expose_secret().as_bytes())?;
        conn.execute(
            "INSERT INTO credentials (owner_id, backend, secret, fingerprint, status, created_at) VALUES (?1, ?2, ?3, ?4, 'active', ?5)",
            params![
                owner_id,
                backend.as_str(),
                libsql::Value::Blob(blob),
                fp,
                Utc::now().to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("create: {e}")))?;

        let id = conn.last_insert_rowid();
        debug!(credential_id = id, owner_id, backend = %backend, "Credential stored");
        Ok(id)
    }

    async fn list(&self, owner_id: &str) -> Result<Vec<Credential>, DatabaseError> {
        self.query_credentials(
            &format!("SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE owner_id = ?1 ORDER BY id"),
            params![owner_id],
            "list",
        )
        .await
    }

    async fn list_for_backend(
        &self,
        owner_id: &str,
        backend: Backend,
    ) -> Result<Vec<Credential>, DatabaseError> {
        self.query_credentials(
            &format!(
                "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE owner_id = ?1 AND backend = ?2 ORDER BY id"
            ),
            params![owner_id, backend.as_str()],
            "list_for_backend",
        )
        .await
    }

    async fn get(&self, id: i64) -> Result<Option<Credential>, DatabaseError> {
        let mut found = self
            .query_credentials(
                &format!("SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE id = ?1"),
                params![id],
                "get",
            )
            .await?;
        Ok(found.pop())
    }

    async fn fetch_secret(&self, id: i64) -> Result<SecretString, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT secret FROM credentials WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_secret: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => {
                return Err(DatabaseError::NotFound {
                    entity: "credential".to_string(),
                    id: id.to_string(),
                });
            }
            Err(e) => return Err(DatabaseError::Query(format!("fetch_secret: {e}"))),
        };
        let blob: Vec<u8> = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("fetch_secret row parse: {e}")))?;

        let plaintext = self.cipher.decrypt(&blob)?;
        let secret = String::from_utf8(plaintext).map_err(|_| {
            DatabaseError::Crypto(crate::error::CryptoError::Decrypt(
                "secret is not valid UTF-8".to_string(),
            ))
        })?;
        Ok(SecretString::from(secret))
    }

    async fn quarantine(
        &self,
        id: i64,
        reason: QuarantineReason,
        reset_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        let reset_at = if reason == QuarantineReason::Quota {
            reset_at
        } else {
            None
        };
        let conn = self.conn();
        let updated = conn
            .execute(
                "UPDATE credentials SET status = 'quarantined', quarantine_reason = ?1, quota_reset_at = ?2 WHERE id = ?3",
                params![reason.as_str(), opt_timestamp(reset_at), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("quarantine: {e}")))?;
        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "credential".to_string(),
                id: id.to_string(),
            });
        }

        conn.execute(
            "INSERT INTO credential_quarantine_log (credential_id, reason, quarantined_at, reset_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, reason.as_str(), Utc::now().to_rfc3339(), opt_timestamp(reset_at)],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("quarantine log: {e}")))?;

        debug!(credential_id = id, reason = %reason, "Credential quarantined");
        Ok(())
    }

    async fn restore(&self, id: i64) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE credentials SET status = 'active', quarantine_reason = NULL, quota_reset_at = NULL WHERE id = ?1",
            params![id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("restore: {e}")))?;
        conn.execute(
            "UPDATE credential_quarantine_log SET restored_at = ?1 WHERE credential_id = ?2 AND restored_at IS NULL",
            params![Utc::now().to_rfc3339(), id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("restore log: {e}")))?;

        debug!(credential_id = id, "Credential restored");
        Ok(())
    }

    async fn touch_used(&self, id: i64) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE credentials SET last_used_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("touch_used: {e}")))?;
        Ok(())
    }

    async fn add_tokens(&self, id: i64, tokens: u64) -> Result<(), DatabaseError> {
        let tokens = i64::try_from(tokens).unwrap_or(i64::MAX);
        let today = Utc::now().date_naive().to_string();
        self.conn()
            .execute(
                "UPDATE credentials SET tokens_used_today = CASE WHEN tokens_counted_on = ?1 THEN tokens_used_today + ?2 ELSE ?2 END, tokens_counted_on = ?1 WHERE id = ?3",
                params![today, tokens, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_tokens: {e}")))?;
        Ok(())
    }

    async fn list_quota_due(&self, now: DateTime<Utc>) -> Result<Vec<Credential>, DatabaseError> {
        // RFC 3339 strings from one writer compare correctly as text only when
        // offsets match, so filter in Rust after narrowing by status.
        let candidates = self
            .query_credentials(
                &format!(
                    "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE status = 'quarantined' AND quota_reset_at IS NOT NULL ORDER BY id"
                ),
                (),
                "list_quota_due",
            )
            .await?;
        Ok(candidates
            .into_iter()
            .filter(|c| c.quota_elapsed(now))
            .collect())
    }

    async fn reset_daily_tokens(&self, today: NaiveDate) -> Result<usize, DatabaseError> {
        // ISO dates order correctly as text.
        let count = self
            .conn()
            .execute(
                "UPDATE credentials SET tokens_used_today = 0, tokens_counted_on = ?1 WHERE tokens_used_today != 0 AND (tokens_counted_on IS NULL OR tokens_counted_on < ?1)",
                params![today.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_daily_tokens: {e}")))?;
        Ok(count as usize)
    }

    async fn erase_owner(&self, owner_id: &str) -> Result<usize, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM credential_quarantine_log WHERE credential_id IN (SELECT id FROM credentials WHERE owner_id = ?1)",
            params![owner_id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("erase_owner: {e}")))?;
        let count = conn
            .execute("DELETE FROM credentials WHERE owner_id = ?1", params![owner_id])
            .await
            .map_err(|e| DatabaseError::Query(format!("erase_owner: {e}")))?;
        conn.execute("DELETE FROM agent_memory WHERE owner_id = ?1", params![owner_id])
            .await
            .map_err(|e| DatabaseError::Query(format!("erase_owner: {e}")))?;

        info!(owner_id, credentials = count, "Owner data erased");
        Ok(count as usize)
    }
}

// ── MemoryStore ─────────────────────────────────────────────────────

#[async_trait]
impl MemoryStore for LibSqlStore {
    async fn save_memory(
        &self,
        owner_id: &str,
        kind: MemoryKind,
        key: &str,
        value: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO agent_memory (owner_id, kind, key, value, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (owner_id, kind, key) DO UPDATE SET value = ?4, updated_at = ?5",
                params![owner_id, kind.as_str(), key, value, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_memory: {e}")))?;
        Ok(())
    }

    async fn get_memories(
        &self,
        owner_id: &str,
        kind: MemoryKind,
    ) -> Result<Vec<MemoryEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT key, value, updated_at FROM agent_memory WHERE owner_id = ?1 AND kind = ?2 ORDER BY updated_at DESC, key",
                params![owner_id, kind.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_memories: {e}")))?;

        let mut entries = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let updated_str: String = row.get(2).unwrap_or_default();
                    entries.push(MemoryEntry {
                        kind,
                        key: row.get(0).unwrap_or_default(),
                        value: row.get(1).unwrap_or_default(),
                        updated_at: parse_datetime(&updated_str),
                    });
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("get_memories: {e}"))),
            }
        }
        Ok(entries)
    }
}

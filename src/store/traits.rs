//! Storage traits consumed by the router and the memory tools.
//!
//! Both are narrow CRUD seams so tests and alternative backends can stand in
//! for [`LibSqlStore`](super::LibSqlStore).

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::backends::Backend;
use crate::error::DatabaseError;

/// Health status of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    Quarantined,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Quarantined => "quarantined",
        }
    }
}

impl FromStr for CredentialStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "quarantined" => Ok(Self::Quarantined),
            other => Err(format!("unknown credential status: {other}")),
        }
    }
}

/// Why a credential was quarantined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineReason {
    Auth,
    Quota,
    Transient,
    DecryptionFailed,
}

impl QuarantineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Quota => "quota",
            Self::Transient => "transient",
            Self::DecryptionFailed => "decryption_failed",
        }
    }
}

impl fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuarantineReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auth" => Ok(Self::Auth),
            "quota" => Ok(Self::Quota),
            "transient" => Ok(Self::Transient),
            "decryption_failed" => Ok(Self::DecryptionFailed),
            other => Err(format!("unknown quarantine reason: {other}")),
        }
    }
}

/// Credential metadata. The secret itself is only reachable through
/// [`CredentialStore::fetch_secret`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Credential {
    pub id: i64,
    pub owner_id: String,
    pub backend: Backend,
    pub status: CredentialStatus,
    pub quarantine_reason: Option<QuarantineReason>,
    /// Only ever set alongside `QuarantineReason::Quota`.
    pub quota_reset_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub tokens_used_today: u64,
    pub created_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_quarantined(&self) -> bool {
        self.status == CredentialStatus::Quarantined
    }

    /// Quarantined for quota and the reset instant has passed.
    pub fn quota_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.is_quarantined() && self.quota_reset_at.is_some_and(|reset| reset <= now)
    }
}

/// Durable credential storage.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Encrypt and store a new active credential. Rejects a secret the owner
    /// already stored for the same backend with `DatabaseError::Constraint`.
    async fn create(
        &self,
        owner_id: &str,
        backend: Backend,
        secret: &SecretString,
    ) -> Result<i64, DatabaseError>;

    /// All credentials for an owner, oldest first.
    async fn list(&self, owner_id: &str) -> Result<Vec<Credential>, DatabaseError>;

    /// Credentials for one (owner, backend) pair.
    async fn list_for_backend(
        &self,
        owner_id: &str,
        backend: Backend,
    ) -> Result<Vec<Credential>, DatabaseError> {
        Ok(self
            .list(owner_id)
            .await?
            .into_iter()
            .filter(|c| c.backend == backend)
            .collect())
    }

    async fn get(&self, id: i64) -> Result<Option<Credential>, DatabaseError>;

    /// Decrypt a stored secret. `NotFound` for unknown ids, `Crypto` when the
    /// blob no longer decrypts.
    async fn fetch_secret(&self, id: i64) -> Result<SecretString, DatabaseError>;

    /// Mark quarantined. `reset_at` is dropped unless `reason` is `Quota`.
    async fn quarantine(
        &self,
        id: i64,
        reason: QuarantineReason,
        reset_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;

    /// Return to active, clearing reason and reset time.
    async fn restore(&self, id: i64) -> Result<(), DatabaseError>;

    async fn touch_used(&self, id: i64) -> Result<(), DatabaseError>;

    /// Add to today's counter. A counter last written on an earlier UTC day
    /// starts over from `tokens`.
    async fn add_tokens(&self, id: i64, tokens: u64) -> Result<(), DatabaseError>;

    /// Quarantined credentials (any owner) whose quota reset is at or before `now`.
    async fn list_quota_due(&self, now: DateTime<Utc>) -> Result<Vec<Credential>, DatabaseError>;

    /// Zero every non-zero `tokens_used_today` counter last written before
    /// `today`. Returns rows touched.
    async fn reset_daily_tokens(&self, today: NaiveDate) -> Result<usize, DatabaseError>;

    /// Delete everything stored for an owner. Returns credentials removed.
    async fn erase_owner(&self, owner_id: &str) -> Result<usize, DatabaseError>;
}

/// Kind of persistent agent memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Memory,
    Skill,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Skill => "skill",
        }
    }
}

/// One remembered fact or skill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryEntry {
    pub kind: MemoryKind,
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

/// Per-owner key/value memory used by the memory tools.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Insert or overwrite `key` for the owner.
    async fn save_memory(
        &self,
        owner_id: &str,
        kind: MemoryKind,
        key: &str,
        value: &str,
    ) -> Result<(), DatabaseError>;

    /// Entries of one kind, most recently updated first.
    async fn get_memories(
        &self,
        owner_id: &str,
        kind: MemoryKind,
    ) -> Result<Vec<MemoryEntry>, DatabaseError>;
}

//! Error types for Switchboard.

use std::time::Duration;

use crate::backends::Backend;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Secret storage failed: {0}")]
    Crypto(#[from] CryptoError),
}

/// Secret encryption errors.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption key must be {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Encryption key is not valid hex: {0}")]
    InvalidKeyEncoding(String),

    #[error("Failed to encrypt secret")]
    Encrypt,

    #[error("Failed to decrypt secret: {0}")]
    Decrypt(String),
}

/// Canonical backend failure kinds. Adapters translate every wire error into
/// exactly one of these; status codes never escape the adapter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("Authentication failed for {backend}: {reason}")]
    Auth { backend: Backend, reason: String },

    #[error("Quota exhausted for {backend}: {reason}")]
    Quota { backend: Backend, reason: String },

    #[error("Transient failure on {backend}: {reason}")]
    Transient { backend: Backend, reason: String },
}

impl BackendError {
    pub fn auth(backend: Backend, reason: impl Into<String>) -> Self {
        Self::Auth {
            backend,
            reason: reason.into(),
        }
    }

    pub fn quota(backend: Backend, reason: impl Into<String>) -> Self {
        Self::Quota {
            backend,
            reason: reason.into(),
        }
    }

    pub fn transient(backend: Backend, reason: impl Into<String>) -> Self {
        Self::Transient {
            backend,
            reason: reason.into(),
        }
    }

    /// Whether the failure is worth retrying against the same credential.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Credential router errors.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("No usable {backend} credential for user {user_id} after {attempts} attempts")]
    CredentialsExhausted {
        user_id: String,
        backend: Backend,
        attempts: usize,
    },

    #[error("All backends failed for user {user_id}: {}", format_failures(.failures))]
    AllBackendsFailed {
        user_id: String,
        failures: Vec<(Backend, String)>,
    },

    #[error("Credential limit reached for user {user_id}: {max}")]
    CredentialLimit { user_id: String, max: usize },

    #[error("No adapter registered for {0}")]
    UnsupportedBackend(Backend),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Store(#[from] DatabaseError),
}

fn format_failures(failures: &[(Backend, String)]) -> String {
    failures
        .iter()
        .map(|(backend, reason)| format!("{backend}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Task graph validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Node {node} depends on undeclared node {missing}")]
    DanglingDependency { node: String, missing: String },

    #[error("Dependency cycle through nodes: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("Plan has no nodes")]
    EmptyPlan,

    #[error("Plan has {count} nodes, maximum is {max}")]
    TooManyNodes { count: usize, max: usize },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),
}

/// Node-local failures. Converted into an errored `ExecutionResult`, never
/// propagated past the node boundary.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("unresolved dependency: {}", .0.join(", "))]
    UnresolvedDependency(Vec<String>),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Dispatch(#[from] RouterError),

    #[error("{0}")]
    Memory(#[from] DatabaseError),
}

/// Tool execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool {name} execution failed: {reason}")]
    ExecutionFailed { name: String, reason: String },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

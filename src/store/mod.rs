//! Persistence layer: credential records and agent memory.

mod libsql_backend;
mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::{
    Credential, CredentialStatus, CredentialStore, MemoryEntry, MemoryKind, MemoryStore,
    QuarantineReason,
};

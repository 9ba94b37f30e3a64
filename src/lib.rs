//! Switchboard: per-user credential routing across AI backends and
//! dependency-aware execution of multi-agent task graphs.

pub mod backends;
pub mod config;
pub mod crypto;
pub mod error;
pub mod graph;
pub mod keys;
pub mod progress;
pub mod router;
pub mod scheduler;
pub mod store;
pub mod tools;

pub use error::{Error, Result};

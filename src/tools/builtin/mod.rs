//! Built-in tools backed by the memory store.

pub mod memory;

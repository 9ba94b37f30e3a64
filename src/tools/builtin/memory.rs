//! Persistent memory tools.
//!
//! - `save_memory`: remember a fact, query `key | value`
//! - `save_skill`: remember a reusable snippet, query `name | description`
//! - `get_memories`: dump everything remembered for the user

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::store::{MemoryKind, MemoryStore};
use crate::tools::tool::{Tool, ToolContext, ToolError};

/// Split a `key | value` query on the first separator.
fn split_pair(query: &str) -> Option<(&str, &str)> {
    query
        .split_once(" | ")
        .map(|(key, value)| (key.trim(), value.trim()))
}

fn store_failed(name: &str, e: impl std::fmt::Display) -> ToolError {
    ToolError::ExecutionFailed {
        name: name.to_string(),
        reason: e.to_string(),
    }
}

// ── save_memory ─────────────────────────────────────────────────────

pub struct SaveMemoryTool {
    store: Arc<dyn MemoryStore>,
}

impl SaveMemoryTool {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for SaveMemoryTool {
    fn name(&self) -> &str {
        "save_memory"
    }

    fn description(&self) -> &str {
        "Save an important fact about the user. Format: \"key | value\""
    }

    async fn execute(&self, query: &str, ctx: &ToolContext) -> Result<String, ToolError> {
        let Some((key, value)) = split_pair(query) else {
            return Ok("Error: Use format 'key | value'".to_string());
        };
        self.store
            .save_memory(&ctx.user_id, MemoryKind::Memory, key, value)
            .await
            .map_err(|e| store_failed(self.name(), e))?;
        Ok(format!("Memory saved: {key}"))
    }
}

// ── save_skill ──────────────────────────────────────────────────────

pub struct SaveSkillTool {
    store: Arc<dyn MemoryStore>,
}

impl SaveSkillTool {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for SaveSkillTool {
    fn name(&self) -> &str {
        "save_skill"
    }

    fn description(&self) -> &str {
        "Save a useful snippet, prompt, or piece of knowledge. Format: \"name | description\""
    }

    async fn execute(&self, query: &str, ctx: &ToolContext) -> Result<String, ToolError> {
        let Some((key, value)) = split_pair(query) else {
            return Ok("Error: Use format 'name | description/code'".to_string());
        };
        self.store
            .save_memory(&ctx.user_id, MemoryKind::Skill, key, value)
            .await
            .map_err(|e| store_failed(self.name(), e))?;
        Ok(format!("Skill learned: {key}"))
    }
}

// ── get_memories ────────────────────────────────────────────────────

pub struct GetMemoriesTool {
    store: Arc<dyn MemoryStore>,
}

impl GetMemoriesTool {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for GetMemoriesTool {
    fn name(&self) -> &str {
        "get_memories"
    }

    fn description(&self) -> &str {
        "Retrieve all persistent memories and skills."
    }

    async fn execute(&self, _query: &str, ctx: &ToolContext) -> Result<String, ToolError> {
        let memories = memory_map(self.store.as_ref(), &ctx.user_id, MemoryKind::Memory)
            .await
            .map_err(|e| store_failed(self.name(), e))?;
        let skills = memory_map(self.store.as_ref(), &ctx.user_id, MemoryKind::Skill)
            .await
            .map_err(|e| store_failed(self.name(), e))?;

        let render = |map: &BTreeMap<String, String>| {
            serde_json::to_string_pretty(map).unwrap_or_else(|_| "{}".to_string())
        };
        Ok(format!(
            "PERSISTENT MEMORIES:\n{}\n\nPERSISTENT SKILLS:\n{}",
            render(&memories),
            render(&skills)
        ))
    }
}

/// Entries of one kind as a sorted key/value map.
pub async fn memory_map(
    store: &dyn MemoryStore,
    user_id: &str,
    kind: MemoryKind,
) -> Result<BTreeMap<String, String>, crate::error::DatabaseError> {
    Ok(store
        .get_memories(user_id, kind)
        .await?
        .into_iter()
        .map(|entry| (entry.key, entry.value))
        .collect())
}

//! Tool registry for managing available tools.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::store::MemoryStore;
use crate::tools::builtin::memory::{GetMemoriesTool, SaveMemoryTool, SaveSkillTool};
use crate::tools::tool::{Tool, ToolContext};

/// Tools every node may call regardless of what it declares.
pub const MEMORY_TOOL_NAMES: &[&str] = &["save_memory", "get_memories", "save_skill"];

/// Registry of available tools. Built once per process and passed to the
/// scheduler explicitly.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    /// Names registered as built-in (protected from shadowing).
    builtin_names: RwLock<HashSet<String>>,
}

impl ToolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            builtin_names: RwLock::new(HashSet::new()),
        }
    }

    /// Registry with the memory tools bound to `store`.
    pub fn with_memory_tools(store: Arc<dyn MemoryStore>) -> Self {
        let registry = Self::new();
        registry.register_builtin(Arc::new(SaveMemoryTool::new(Arc::clone(&store))));
        registry.register_builtin(Arc::new(SaveSkillTool::new(Arc::clone(&store))));
        registry.register_builtin(Arc::new(GetMemoriesTool::new(store)));
        registry
    }

    /// Register a tool. Rejects tools that try to shadow a built-in name.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.builtin_names.read().await.contains(&name) {
            tracing::warn!(
                tool = %name,
                "Rejected tool registration: would shadow a built-in tool"
            );
            return;
        }
        self.tools.write().await.insert(name.clone(), tool);
        tracing::debug!("Registered tool: {}", name);
    }

    /// Register a built-in tool during startup (sync, protected from shadowing).
    fn register_builtin(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if let Ok(mut tools) = self.tools.try_write() {
            tools.insert(name.clone(), tool);
            if let Ok(mut builtins) = self.builtin_names.try_write() {
                builtins.insert(name.clone());
            }
            tracing::debug!("Registered built-in tool: {}", name);
        }
    }

    /// Get a tool by name.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    /// Check if a tool exists.
    pub async fn has(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    /// All tool names, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get the number of registered tools.
    pub fn count(&self) -> usize {
        self.tools.try_read().map(|t| t.len()).unwrap_or(0)
    }

    /// Run `name` for a node that declared `declared`. Always yields text:
    /// unknown or undeclared tools and tool failures become error strings
    /// the node feeds back to the model.
    pub async fn invoke(
        &self,
        name: &str,
        query: &str,
        ctx: &ToolContext,
        declared: &BTreeSet<String>,
    ) -> String {
        let permitted = declared.contains(name) || MEMORY_TOOL_NAMES.contains(&name);
        let tool = if permitted { self.get(name).await } else { None };

        let Some(tool) = tool else {
            tracing::debug!(tool = name, node_id = %ctx.node_id, "Tool not available");
            return format!("Error: Tool {name} not found.");
        };

        match tool.execute(query, ctx).await {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(tool = name, node_id = %ctx.node_id, error = %e, "Tool execution failed");
                format!("Error executing {name}: {e}")
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolError;
    use crate::tools::FnTool;

    fn declared(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn ctx() -> ToolContext {
        ToolContext::new("u1", "researcher")
    }

    #[tokio::test]
    async fn invoke_declared_tool() {
        let registry = ToolRegistry::new();
        registry
            .register(Arc::new(FnTool::new("wikipedia_search", "Wiki", |q: String| async move {
                Ok(format!("article about {q}"))
            })))
            .await;

        let out = registry
            .invoke("wikipedia_search", "rust", &ctx(), &declared(&["wikipedia_search"]))
            .await;
        assert_eq!(out, "article about rust");
    }

    #[tokio::test]
    async fn undeclared_or_unknown_tool_is_not_found() {
        let registry = ToolRegistry::new();
        registry
            .register(Arc::new(FnTool::new("curl", "Fetch", |_q: String| async move {
                Ok("page".to_string())
            })))
            .await;

        assert_eq!(
            registry.invoke("curl", "x", &ctx(), &declared(&[])).await,
            "Error: Tool curl not found."
        );
        assert_eq!(
            registry.invoke("teleport", "x", &ctx(), &declared(&["teleport"])).await,
            "Error: Tool teleport not found."
        );
    }

    #[tokio::test]
    async fn tool_failure_becomes_text() {
        let registry = ToolRegistry::new();
        registry
            .register(Arc::new(FnTool::new("curl", "Fetch", |_q: String| async move {
                Err(ToolError::ExecutionFailed {
                    name: "curl".into(),
                    reason: "ssl handshake".into(),
                })
            })))
            .await;

        let out = registry.invoke("curl", "x", &ctx(), &declared(&["curl"])).await;
        assert!(out.starts_with("Error executing curl:"), "{out}");
        assert!(out.contains("ssl handshake"));
    }

    #[tokio::test]
    async fn builtins_cannot_be_shadowed() {
        let store = crate::tools::builtin::memory::tests::memory_store().await;
        let registry = ToolRegistry::with_memory_tools(store);
        assert_eq!(registry.count(), 3);

        registry
            .register(Arc::new(FnTool::new("save_memory", "Fake", |_q: String| async move {
                Ok("shadowed".to_string())
            })))
            .await;
        let out = registry.invoke("save_memory", "k | v", &ctx(), &declared(&[])).await;
        assert_eq!(out, "Memory saved: k");
    }
}

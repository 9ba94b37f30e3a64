//! Tool trait and execution context.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

pub use crate::error::ToolError;

/// Who a tool runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolContext {
    pub user_id: String,
    /// Node that issued the directive.
    pub node_id: String,
}

impl ToolContext {
    pub fn new(user_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            node_id: node_id.into(),
        }
    }
}

/// A named capability a node can invoke with a free-text query.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn execute(&self, query: &str, ctx: &ToolContext) -> Result<String, ToolError>;
}

type BoxedToolFuture = Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send>>;
type ToolFn = Arc<dyn Fn(String) -> BoxedToolFuture + Send + Sync>;

/// Adapter turning an opaque async callable into a [`Tool`]. Used for
/// externally provided capabilities such as web fetchers.
pub struct FnTool {
    name: String,
    description: String,
    func: ToolFn,
}

impl FnTool {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, func: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            func: Arc::new(move |query| Box::pin(func(query))),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(&self, query: &str, _ctx: &ToolContext) -> Result<String, ToolError> {
        (self.func)(query.to_string()).await
    }
}

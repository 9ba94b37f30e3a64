//! Execution of a single node: prompt assembly, the first dispatch, and the
//! optional tool round-trip.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::backends::{ChatMessage, CompletionRequest};
use crate::error::NodeError;
use crate::graph::TaskNode;
use crate::progress::ProgressReporter;
use crate::store::{MemoryKind, MemoryStore};
use crate::tools::builtin::memory::memory_map;
use crate::tools::{MEMORY_TOOL_NAMES, ToolContext, ToolRegistry};

use super::{Dispatcher, RunInput};

static TOOL_DIRECTIVE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?is)TOOL:\s*(\w+)\s*\|\s*QUERY:\s*(.*)").ok());

/// Outcome of one node. Exactly one of `output` and `error` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub node_id: String,
    pub output: Option<String>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_used: Option<String>,
}

impl ExecutionResult {
    pub fn done(node_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            output: Some(output.into()),
            error: None,
            tool_used: None,
        }
    }

    pub fn errored(node_id: impl Into<String>, error: impl Display) -> Self {
        Self {
            node_id: node_id.into(),
            output: None,
            error: Some(error.to_string()),
            tool_used: None,
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool_used = Some(tool.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// A parsed `TOOL: <name> | QUERY: <text>` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDirective {
    pub name: String,
    pub query: String,
}

pub fn parse_tool_directive(text: &str) -> Option<ToolDirective> {
    let caps = TOOL_DIRECTIVE.as_ref()?.captures(text)?;
    Some(ToolDirective {
        name: caps.get(1)?.as_str().trim().to_string(),
        query: caps.get(2)?.as_str().trim().to_string(),
    })
}

/// Everything a node needs from the surrounding run.
pub(crate) struct NodeEnv<'a> {
    pub dispatcher: &'a dyn Dispatcher,
    pub tools: &'a ToolRegistry,
    pub memory: Option<&'a dyn MemoryStore>,
    pub progress: Option<&'a ProgressReporter>,
    pub input: &'a RunInput,
    pub model: &'a str,
}

impl NodeEnv<'_> {
    fn report(&self, node_id: &str, text: &str) {
        if let Some(progress) = self.progress {
            progress.update(node_id, text);
        }
    }
}

/// Run one node against a read-only snapshot of earlier results.
pub(crate) async fn execute(
    node: &TaskNode,
    results: &BTreeMap<String, ExecutionResult>,
    env: &NodeEnv<'_>,
) -> Result<ExecutionResult, NodeError> {
    let (memories, skills) = match env.memory {
        Some(store) => (
            memory_map(store, &env.input.user_id, MemoryKind::Memory).await?,
            memory_map(store, &env.input.user_id, MemoryKind::Skill).await?,
        ),
        None => Default::default(),
    };
    let system = system_message(node, &memories, &skills, results);

    let first_system = if node.tool_names.is_empty() {
        system.clone()
    } else {
        with_tool_instructions(&system, node)
    };
    let request = CompletionRequest::new(
        env.model,
        vec![
            ChatMessage::system(first_system),
            ChatMessage::user(format!(
                "Task Context: {}\n\nSpecific Task: {}",
                env.input.full_context, env.input.message
            )),
        ],
    );
    let reply = env
        .dispatcher
        .complete(&env.input.user_id, &request)
        .await?
        .output;

    if node.tool_names.is_empty() {
        return Ok(ExecutionResult::done(&node.id, reply));
    }
    let Some(directive) = parse_tool_directive(&reply) else {
        return Ok(ExecutionResult::done(&node.id, reply));
    };

    tracing::debug!(node_id = %node.id, tool = %directive.name, "Node requested tool");
    env.report(&node.id, &format!("running: using {}...", directive.name));
    let ctx = ToolContext::new(&env.input.user_id, &node.id);
    let tool_result = env
        .tools
        .invoke(&directive.name, &directive.query, &ctx, &node.tool_names)
        .await;

    let follow_up = CompletionRequest::new(
        env.model,
        vec![
            ChatMessage::system(system),
            ChatMessage::user(format!(
                "Task: {}\n\nTool Result ({}): {}\n\nFinal response:",
                env.input.message, directive.name, tool_result
            )),
        ],
    );
    let output = env
        .dispatcher
        .complete(&env.input.user_id, &follow_up)
        .await?
        .output;

    Ok(ExecutionResult::done(&node.id, output).with_tool(directive.name))
}

fn system_message(
    node: &TaskNode,
    memories: &BTreeMap<String, String>,
    skills: &BTreeMap<String, String>,
    results: &BTreeMap<String, ExecutionResult>,
) -> String {
    let mut message = node.instructions.clone();

    if !memories.is_empty() {
        message.push_str("\n\nYOUR PERSISTENT MEMORIES:\n");
        message.push_str(&serde_json::to_string(memories).unwrap_or_default());
    }
    if !skills.is_empty() {
        message.push_str("\n\nYOUR PERSISTENT SKILLS:\n");
        message.push_str(&serde_json::to_string(skills).unwrap_or_default());
    }
    if !node.depends_on.is_empty() {
        let context: BTreeMap<&str, &str> = node
            .depends_on
            .iter()
            .map(|dep| {
                let output = results
                    .get(dep)
                    .and_then(|r| r.output.as_deref())
                    .unwrap_or("Not available");
                (dep.as_str(), output)
            })
            .collect();
        message.push_str("\n\nCONTEXT FROM TEAMMATES:\n");
        message.push_str(&serde_json::to_string_pretty(&context).unwrap_or_default());
    }
    message
}

fn with_tool_instructions(system: &str, node: &TaskNode) -> String {
    let declared: Vec<&str> = node.tool_names.iter().map(String::as_str).collect();
    format!(
        "{system}\n\nYou have access to these tools: {}, {}.\n\
         If you need a tool, reply ONLY with: TOOL: tool_name | QUERY: your query\n\
         Otherwise, provide your final response.",
        declared.join(", "),
        MEMORY_TOOL_NAMES.join(", ")
    )
}

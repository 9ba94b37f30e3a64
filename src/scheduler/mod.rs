//! Dependency-aware execution of task graphs.
//!
//! Nodes run in waves. A wave is every pending node whose dependencies all
//! have results; its nodes run concurrently against an immutable snapshot of
//! earlier waves' results, and the next wave is computed only once every node
//! in the current one is terminal. Nodes whose dependencies can never be
//! satisfied are errored when no further wave can be formed. Failures stay
//! inside the node that raised them.

mod node;
mod state;

pub use node::{ExecutionResult, ToolDirective, parse_tool_directive};
pub use state::NodeState;

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::backends::{ChatMessage, CompletionRequest, CompletionResponse};
use crate::config::SchedulerConfig;
use crate::error::{NodeError, RouterError};
use crate::graph::{ModelPreference, TaskGraph, TaskNode};
use crate::progress::ProgressReporter;
use crate::router::CredentialRouter;
use crate::store::MemoryStore;
use crate::tools::ToolRegistry;

use node::NodeEnv;

/// Issues completions on behalf of a user. The scheduler's only route to a
/// backend.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn complete(
        &self,
        user_id: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, RouterError>;
}

#[async_trait]
impl Dispatcher for CredentialRouter {
    async fn complete(
        &self,
        user_id: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, RouterError> {
        let (backend, response) = self.dispatch_any(user_id, request).await?;
        tracing::debug!(user_id, backend = %backend, "Completion served");
        Ok(response)
    }
}

/// The request a graph is run for.
#[derive(Debug, Clone)]
pub struct RunInput {
    pub user_id: String,
    /// The user's message.
    pub message: String,
    /// Conversation context handed to every node.
    pub full_context: String,
}

impl RunInput {
    pub fn new(user_id: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            user_id: user_id.into(),
            full_context: message.clone(),
            message,
        }
    }

    pub fn with_context(mut self, full_context: impl Into<String>) -> Self {
        self.full_context = full_context.into();
        self
    }
}

/// Results of one run, one entry per node.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub results: BTreeMap<String, ExecutionResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn output(&self, node_id: &str) -> Option<&str> {
        self.results.get(node_id)?.output.as_deref()
    }

    pub fn errored(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.results.values().filter(|r| !r.is_ok())
    }
}

pub struct TaskScheduler {
    dispatcher: Arc<dyn Dispatcher>,
    tools: Arc<ToolRegistry>,
    memory: Option<Arc<dyn MemoryStore>>,
    config: SchedulerConfig,
}

impl TaskScheduler {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, tools: Arc<ToolRegistry>, config: SchedulerConfig) -> Self {
        Self {
            dispatcher,
            tools,
            memory: None,
            config,
        }
    }

    /// Inject persistent memories and skills into every node prompt.
    pub fn with_memory(mut self, store: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(store);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn model_for(&self, node: &TaskNode) -> &str {
        match node.model_preference {
            ModelPreference::Fast => &self.config.fast_model,
            ModelPreference::Smart => &self.config.smart_model,
        }
    }

    /// Run every node of `graph` to a terminal state.
    pub async fn run(
        &self,
        graph: &TaskGraph,
        input: &RunInput,
        progress: Option<&ProgressReporter>,
    ) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let report = |id: &str, text: &str| {
            if let Some(progress) = progress {
                progress.update(id, text);
            }
        };

        let mut states: HashMap<&str, NodeState> = graph
            .nodes()
            .iter()
            .map(|n| (n.id.as_str(), NodeState::Pending))
            .collect();
        let mut results: BTreeMap<String, ExecutionResult> = BTreeMap::new();
        let mut wave = 0usize;

        loop {
            let ready: Vec<&TaskNode> = graph
                .nodes()
                .iter()
                .filter(|n| states.get(n.id.as_str()) == Some(&NodeState::Pending))
                .filter(|n| n.depends_on.iter().all(|d| results.contains_key(d)))
                .collect();
            if ready.is_empty() {
                break;
            }

            tracing::info!(
                %run_id,
                user_id = %input.user_id,
                wave,
                nodes = ready.len(),
                "Starting wave"
            );
            for node in &ready {
                transition(&mut states, &node.id, NodeState::Running);
                report(&node.id, "running...");
            }

            let snapshot = &results;
            let outcomes = join_all(
                ready
                    .iter()
                    .map(|node| self.run_node(node, snapshot, input, progress)),
            )
            .await;

            for (node, result) in ready.iter().zip(outcomes) {
                match &result.error {
                    None => {
                        transition(&mut states, &node.id, NodeState::Done);
                        report(&node.id, "done");
                    }
                    Some(e) => {
                        transition(&mut states, &node.id, NodeState::Errored);
                        report(&node.id, &format!("error: {e}"));
                    }
                }
                results.insert(node.id.clone(), result);
            }
            wave += 1;
        }

        for node in graph.nodes() {
            if states.get(node.id.as_str()).is_none_or(|s| s.is_terminal()) {
                continue;
            }
            let missing: Vec<String> = node
                .depends_on
                .iter()
                .filter(|d| !results.contains_key(*d))
                .cloned()
                .collect();
            let error = NodeError::UnresolvedDependency(missing);
            tracing::warn!(node_id = %node.id, error = %error, "Node cannot be scheduled");
            transition(&mut states, &node.id, NodeState::Errored);
            report(&node.id, &format!("error: {error}"));
            results.insert(node.id.clone(), ExecutionResult::errored(&node.id, error));
        }

        RunReport {
            run_id,
            results,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn run_node(
        &self,
        node: &TaskNode,
        results: &BTreeMap<String, ExecutionResult>,
        input: &RunInput,
        progress: Option<&ProgressReporter>,
    ) -> ExecutionResult {
        let env = NodeEnv {
            dispatcher: self.dispatcher.as_ref(),
            tools: self.tools.as_ref(),
            memory: self.memory.as_deref(),
            progress,
            input,
            model: self.model_for(node),
        };
        let work = AssertUnwindSafe(node::execute(node, results, &env)).catch_unwind();
        let span = tracing::info_span!("node", node_id = %node.id);

        let result = match tokio::time::timeout(self.config.node_timeout, work)
            .instrument(span)
            .await
        {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(e))) => ExecutionResult::errored(&node.id, e),
            Ok(Err(_)) => ExecutionResult::errored(&node.id, "node panicked"),
            Err(_) => ExecutionResult::errored(&node.id, NodeError::Timeout(self.config.node_timeout)),
        };
        match &result.error {
            None => tracing::info!(node_id = %node.id, tool = ?result.tool_used, "Node done"),
            Some(e) => tracing::warn!(node_id = %node.id, error = %e, "Node errored"),
        }
        result
    }

    /// Combine a run's results into one reply.
    pub async fn synthesize(
        &self,
        persona: &str,
        synthesis_prompt: &str,
        report: &RunReport,
        input: &RunInput,
    ) -> Result<String, RouterError> {
        let findings = serde_json::to_string_pretty(&report.results).unwrap_or_default();
        let request = CompletionRequest::new(
            &self.config.smart_model,
            vec![
                ChatMessage::system(format!(
                    "{persona}\n\nUse the following research findings to answer the user. \
                     Do not echo them verbatim.\n\nRESEARCH_FINDINGS:\n{findings}"
                )),
                ChatMessage::user(format!(
                    "{}\n\nPrompt: {synthesis_prompt}",
                    input.full_context
                )),
            ],
        );
        let reply = self.dispatcher.complete(&input.user_id, &request).await?.output;
        Ok(strip_findings(&reply))
    }
}

/// Drop anything from the first leaked findings marker onwards.
fn strip_findings(reply: &str) -> String {
    let cut = ["RESEARCH_FINDINGS", "Internal Research Findings"]
        .iter()
        .filter_map(|marker| reply.find(marker))
        .min()
        .unwrap_or(reply.len());
    reply[..cut].trim().to_string()
}

fn transition(states: &mut HashMap<&str, NodeState>, id: &str, target: NodeState) {
    if let Some(state) = states.get_mut(id) {
        debug_assert!(state.can_transition_to(target), "{state} -> {target}");
        *state = target;
    }
}

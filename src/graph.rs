//! Task graphs and planner output.
//!
//! A [`TaskGraph`] indexes its nodes and resolves `depends_on` ids to
//! positions once, at construction. [`TaskGraph::new`] rejects duplicate ids,
//! dangling dependencies and cycles before anything runs;
//! [`TaskGraph::new_unchecked`] accepts whatever the planner produced and
//! leaves unresolvable nodes to the scheduler's stall handling.

use std::collections::{BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Which class of model a node would like.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelPreference {
    Fast,
    #[default]
    Smart,
}

/// One unit of work in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: String,
    /// System prompt for the node.
    #[serde(rename = "system_prompt", default)]
    pub instructions: String,
    #[serde(rename = "tools", default)]
    pub tool_names: BTreeSet<String>,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub model_preference: ModelPreference,
}

impl TaskNode {
    pub fn new(id: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            role: String::new(),
            instructions: instructions.into(),
            tool_names: BTreeSet::new(),
            depends_on: BTreeSet::new(),
            model_preference: ModelPreference::default(),
        }
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tool_names.extend(names.into_iter().map(Into::into));
        self
    }
}

/// Immutable set of task nodes with index-based adjacency.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
    index: HashMap<String, usize>,
    /// `deps[i]`: positions of the declared nodes `i` depends on.
    deps: Vec<Vec<usize>>,
}

impl TaskGraph {
    /// Build and validate a graph.
    pub fn new(nodes: Vec<TaskNode>) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
        }
        for node in &nodes {
            if let Some(missing) = node.depends_on.iter().find(|d| !index.contains_key(*d)) {
                return Err(GraphError::DanglingDependency {
                    node: node.id.clone(),
                    missing: missing.clone(),
                });
            }
        }

        let graph = Self::assemble(nodes, index);
        let cyclic = graph.unsortable();
        if !cyclic.is_empty() {
            return Err(GraphError::Cycle(cyclic));
        }
        Ok(graph)
    }

    /// Build without validation. Later duplicates of an id are dropped.
    pub fn new_unchecked(nodes: Vec<TaskNode>) -> Self {
        let mut index = HashMap::with_capacity(nodes.len());
        let mut kept = Vec::with_capacity(nodes.len());
        for node in nodes {
            if index.contains_key(&node.id) {
                tracing::warn!(node_id = %node.id, "Dropping duplicate node id");
                continue;
            }
            index.insert(node.id.clone(), kept.len());
            kept.push(node);
        }
        Self::assemble(kept, index)
    }

    fn assemble(nodes: Vec<TaskNode>, index: HashMap<String, usize>) -> Self {
        let deps = nodes
            .iter()
            .map(|node| {
                node.depends_on
                    .iter()
                    .filter_map(|d| index.get(d).copied())
                    .collect()
            })
            .collect();
        Self { nodes, index, deps }
    }

    /// Ids left over after Kahn's algorithm, sorted. Empty for a DAG.
    fn unsortable(&self) -> Vec<String> {
        let n = self.nodes.len();
        let mut in_degree: Vec<usize> = self.deps.iter().map(Vec::len).collect();
        let mut dependents = vec![Vec::new(); n];
        for (i, deps) in self.deps.iter().enumerate() {
            for &d in deps {
                dependents[d].push(i);
            }
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut visited = 0;
        while let Some(i) = queue.pop_front() {
            visited += 1;
            for &j in &dependents[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    queue.push_back(j);
                }
            }
        }
        if visited == n {
            return Vec::new();
        }

        let mut remaining: Vec<String> = (0..n)
            .filter(|&i| in_degree[i] > 0)
            .map(|i| self.nodes[i].id.clone())
            .collect();
        remaining.sort();
        remaining
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn get(&self, id: &str) -> Option<&TaskNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }
}

/// Planner output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPlan {
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub agents: Vec<TaskNode>,
    #[serde(default)]
    pub final_synthesis_prompt: Option<String>,
}

impl TaskPlan {
    /// Parse a plan from model text, tolerating prose around the JSON object.
    pub fn from_model_output(text: &str, max_nodes: usize) -> Result<Self, GraphError> {
        let json = match (text.find('{'), text.rfind('}')) {
            (Some(start), Some(end)) if start < end => &text[start..=end],
            _ => return Err(GraphError::InvalidPlan("no JSON object in output".to_string())),
        };
        let plan: TaskPlan =
            serde_json::from_str(json).map_err(|e| GraphError::InvalidPlan(e.to_string()))?;

        if plan.agents.len() > max_nodes {
            return Err(GraphError::TooManyNodes {
                count: plan.agents.len(),
                max: max_nodes,
            });
        }
        if plan.agents.is_empty() && plan.final_synthesis_prompt.is_none() {
            return Err(GraphError::EmptyPlan);
        }
        Ok(plan)
    }

    /// Single general-purpose node used when planning fails.
    pub fn fallback(system_prompt: &str) -> Self {
        Self {
            reasoning: "Planning failed. Falling back to a direct reply.".to_string(),
            agents: vec![TaskNode {
                name: "Assistant".to_string(),
                role: "Assistant".to_string(),
                ..TaskNode::new("fallback_agent", system_prompt)
                    .with_tools(["wikipedia_search", "curl", "get_memories"])
            }],
            final_synthesis_prompt: Some("Synthesize the findings for the user.".to_string()),
        }
    }

    /// Validate into a graph.
    pub fn into_graph(self) -> Result<TaskGraph, GraphError> {
        TaskGraph::new(self.agents)
    }
}

//! End-to-end runs: a real libSQL store, the credential router with a stub
//! adapter, the scheduler, memory tools and the progress reporter together.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};

use switchboard::backends::{
    AdapterRegistry, Backend, BackendAdapter, ChunkStream, CompletionRequest, CompletionResponse,
    Usage,
};
use switchboard::config::{ProgressConfig, RouterConfig, SchedulerConfig};
use switchboard::crypto::AesGcmCipher;
use switchboard::error::{BackendError, GraphError};
use switchboard::graph::{TaskGraph, TaskNode, TaskPlan};
use switchboard::progress::{ProgressReporter, ProgressSink};
use switchboard::router::CredentialRouter;
use switchboard::scheduler::{RunInput, TaskScheduler};
use switchboard::store::{
    CredentialStatus, CredentialStore, LibSqlStore, MemoryKind, MemoryStore, QuarantineReason,
};
use switchboard::tools::ToolRegistry;

/// Groq stand-in. Secrets containing `exhausted` always hit their quota.
struct StubAdapter {
    secret: String,
}

#[async_trait]
impl BackendAdapter for StubAdapter {
    fn backend(&self) -> Backend {
        Backend::Groq
    }

    async fn request(&self, request: &CompletionRequest) -> Result<CompletionResponse, BackendError> {
        if self.secret.contains("exhausted") {
            return Err(BackendError::quota(Backend::Groq, "daily token limit"));
        }
        let system = &request.messages[0].content;
        let user = &request.messages[1].content;
        let output = if user.contains("Tool Result (save_memory)") {
            "Noted the user's favourite language.".to_string()
        } else if system.contains("You have access to these tools") {
            "TOOL: save_memory | QUERY: favourite language | Rust".to_string()
        } else if system.contains("CONTEXT FROM TEAMMATES") {
            "Summary: the user likes Rust.".to_string()
        } else {
            format!("reply to {user}")
        };
        Ok(CompletionResponse {
            output,
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
        })
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, BackendError> {
        let output = self.request(request).await?.output;
        Ok(Box::pin(futures::stream::iter(vec![Ok(output)])))
    }

    async fn test_credential(&self) -> Result<bool, BackendError> {
        Ok(!self.secret.contains("exhausted"))
    }
}

#[derive(Default)]
struct RecordingSink {
    renders: Mutex<Vec<String>>,
}

#[async_trait]
impl ProgressSink for RecordingSink {
    async fn render(&self, text: &str) {
        self.renders.lock().unwrap().push(text.to_string());
    }
}

async fn store() -> Arc<LibSqlStore> {
    let cipher = Arc::new(AesGcmCipher::new(&[42u8; 32]).unwrap());
    Arc::new(LibSqlStore::new_memory(cipher).await.unwrap())
}

fn router(store: Arc<LibSqlStore>) -> Arc<CredentialRouter> {
    let mut adapters = AdapterRegistry::new();
    adapters.register(
        Backend::Groq,
        Arc::new(|secret: SecretString| {
            Arc::new(StubAdapter {
                secret: secret.expose_secret().to_string(),
            }) as Arc<dyn BackendAdapter>
        }),
    );
    Arc::new(CredentialRouter::new(store, adapters, RouterConfig::default()))
}

#[tokio::test]
async fn plan_runs_with_failover_tools_and_progress() {
    let store = store().await;
    let router = router(store.clone());
    let exhausted = router
        .add_credential("alice", Backend::Groq, &SecretString::from("gsk_exhausted_0001"))
        .await
        .unwrap();
    let working = router
        .add_credential("alice", Backend::Groq, &SecretString::from("gsk_working_0002"))
        .await
        .unwrap();

    let plan = TaskPlan::from_model_output(
        r#"{"reasoning": "remember, then summarise",
            "agents": [
              {"id": "researcher", "system_prompt": "Learn about the user.", "tools": ["curl"]},
              {"id": "writer", "system_prompt": "Summarise.", "depends_on": ["researcher"]}
            ],
            "final_synthesis_prompt": "Reply warmly"}"#,
        6,
    )
    .unwrap();
    let graph = plan.into_graph().unwrap();

    let memory: Arc<dyn MemoryStore> = store.clone();
    let tools = Arc::new(ToolRegistry::with_memory_tools(Arc::clone(&memory)));
    let scheduler = TaskScheduler::new(router, tools, SchedulerConfig::default()).with_memory(Arc::clone(&memory));

    let sink = Arc::new(RecordingSink::default());
    let progress = ProgressReporter::start(&ProgressConfig::default(), sink.clone());
    let input = RunInput::new("alice", "What do I like?").with_context("alice: hi\nalice: What do I like?");

    let report = scheduler.run(&graph, &input, Some(&progress)).await;
    progress.stop().await;

    assert_eq!(report.errored().count(), 0, "{:?}", report.results);
    let researcher = &report.results["researcher"];
    assert_eq!(researcher.tool_used.as_deref(), Some("save_memory"));
    assert_eq!(report.output("writer"), Some("Summary: the user likes Rust."));

    let memories = memory.get_memories("alice", MemoryKind::Memory).await.unwrap();
    assert_eq!(memories.len(), 1);
    assert_eq!(memories[0].key, "favourite language");
    assert_eq!(memories[0].value, "Rust");

    let exhausted = store.get(exhausted).await.unwrap().unwrap();
    assert_eq!(exhausted.status, CredentialStatus::Quarantined);
    assert_eq!(exhausted.quarantine_reason, Some(QuarantineReason::Quota));
    assert!(exhausted.quota_reset_at.unwrap() > Utc::now());

    let working = store.get(working).await.unwrap().unwrap();
    assert_eq!(working.status, CredentialStatus::Active);
    assert_eq!(working.tokens_used_today, 45);
    assert!(working.last_used_at.is_some());

    let last = sink.renders.lock().unwrap().last().cloned().unwrap();
    assert!(last.contains("[+] researcher: done"), "{last}");
    assert!(last.contains("[+] writer: done"), "{last}");
}

#[tokio::test]
async fn user_without_credentials_gets_errored_nodes() {
    let store = store().await;
    let scheduler = TaskScheduler::new(
        router(store),
        Arc::new(ToolRegistry::new()),
        SchedulerConfig::default(),
    );
    let graph = TaskGraph::new(vec![TaskNode::new("solo", "Answer.")]).unwrap();

    let report = scheduler.run(&graph, &RunInput::new("nobody", "hi"), None).await;

    let error = report.results["solo"].error.as_deref().unwrap();
    assert!(error.contains("groq"), "{error}");
}

#[tokio::test]
async fn cyclic_plan_is_rejected_before_running() {
    let plan = TaskPlan::from_model_output(
        r#"{"reasoning": "loop",
            "agents": [
              {"id": "x", "system_prompt": "x", "depends_on": ["y"]},
              {"id": "y", "system_prompt": "y", "depends_on": ["x"]}
            ]}"#,
        6,
    )
    .unwrap();
    assert_eq!(
        plan.into_graph().unwrap_err(),
        GraphError::Cycle(vec!["x".into(), "y".into()])
    );
}

#[tokio::test]
async fn erasing_a_user_removes_credentials_and_memories() {
    let store = store().await;
    let router = router(store.clone());
    let outcomes = router
        .import("bob", "groq: gsk_working_import_key and gemini=AIzaSyExampleKey123")
        .await;
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.result.is_ok()));
    store
        .save_memory("bob", MemoryKind::Memory, "city", "Lisbon")
        .await
        .unwrap();

    let erased = store.erase_owner("bob").await.unwrap();
    assert!(erased >= 2);
    assert!(store.list("bob").await.unwrap().is_empty());
    assert!(store.get_memories("bob", MemoryKind::Memory).await.unwrap().is_empty());
}

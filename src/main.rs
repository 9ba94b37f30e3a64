use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use switchboard::backends::AdapterRegistry;
use switchboard::config::AppConfig;
use switchboard::crypto::AesGcmCipher;
use switchboard::graph::{TaskGraph, TaskPlan};
use switchboard::progress::{ProgressReporter, StderrSink};
use switchboard::router::{CredentialRouter, QuotaSweeper};
use switchboard::scheduler::{RunInput, TaskScheduler};
use switchboard::store::{CredentialStore, LibSqlStore, MemoryStore};
use switchboard::tools::ToolRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;

    // ── Logging ──────────────────────────────────────────────────────────
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, _log_guard) = match &config.log_path {
        Some(path) => {
            let dir = path.parent().unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .context("SWITCHBOARD_LOG_PATH must name a file")?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .init();

    eprintln!("switchboard v{}", env!("CARGO_PKG_VERSION"));

    // ── Storage ──────────────────────────────────────────────────────────
    let cipher = Arc::new(AesGcmCipher::from_hex(&config.encryption_key)?);
    let store = Arc::new(
        LibSqlStore::new_local(&config.db_path, cipher)
            .await
            .with_context(|| format!("opening database at {}", config.db_path.display()))?,
    );
    let credentials: Arc<dyn CredentialStore> = store.clone();
    let memory: Arc<dyn MemoryStore> = store;

    // ── Routing ──────────────────────────────────────────────────────────
    let adapters = AdapterRegistry::with_defaults(reqwest::Client::new(), &config.router.default_model);
    let router = Arc::new(CredentialRouter::new(
        Arc::clone(&credentials),
        adapters,
        config.router.clone(),
    ));

    let user_id = std::env::var("SWITCHBOARD_USER").unwrap_or_else(|_| "local".to_string());
    if let Ok(text) = std::env::var("SWITCHBOARD_IMPORT_KEYS") {
        for outcome in router.import(&user_id, &text).await {
            match outcome.result {
                Ok(id) => tracing::info!(credential_id = id, backend = %outcome.backend, "Imported credential"),
                Err(e) => tracing::warn!(label = %outcome.label, error = %e, "Credential not imported"),
            }
        }
    }
    if credentials.list(&user_id).await?.is_empty() {
        tracing::warn!(user_id = %user_id, "No credentials stored; every dispatch will fail");
    }

    let sweeper = Arc::new(QuotaSweeper::new(
        Arc::clone(&credentials),
        &config.router,
        config.sweep_interval,
    ))
    .spawn();

    // ── Plan ─────────────────────────────────────────────────────────────
    let args: Vec<String> = std::env::args().collect();
    let plan = match args.get(1) {
        Some(path) => load_plan(Path::new(path), config.scheduler.max_nodes, &config.system_prompt),
        None => TaskPlan::fallback(&config.system_prompt),
    };
    let message = match args.get(2) {
        Some(message) => message.clone(),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading message from stdin")?;
            buf.trim().to_string()
        }
    };

    let synthesis_prompt = plan.final_synthesis_prompt.clone();
    let reasoning = plan.reasoning.clone();
    let graph = match plan.into_graph() {
        Ok(graph) => graph,
        Err(e) => {
            tracing::warn!(error = %e, "Plan rejected, using fallback");
            TaskGraph::new(TaskPlan::fallback(&config.system_prompt).agents)?
        }
    };

    // ── Run ──────────────────────────────────────────────────────────────
    let tools = Arc::new(ToolRegistry::with_memory_tools(Arc::clone(&memory)));
    let scheduler = TaskScheduler::new(router, tools, config.scheduler.clone()).with_memory(memory);
    let input = RunInput::new(&user_id, message);

    let progress = ProgressReporter::start(&config.progress, Arc::new(StderrSink));
    progress.update("plan", &format!("Plan: {reasoning}"));
    let report = scheduler.run(&graph, &input, Some(&progress)).await;

    let reply = match synthesis_prompt {
        Some(prompt) => {
            progress.update("synthesis", "running...");
            match scheduler
                .synthesize(&config.system_prompt, &prompt, &report, &input)
                .await
            {
                Ok(reply) => {
                    progress.update("synthesis", "done");
                    Some(reply)
                }
                Err(e) => {
                    progress.update("synthesis", &format!("error: {e}"));
                    None
                }
            }
        }
        None => None,
    };
    progress.stop().await;

    let output = serde_json::json!({
        "reasoning": reasoning,
        "report": report,
        "reply": reply,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    sweeper.stop().await;
    Ok(())
}

/// Read a plan file, falling back to the single-node plan when it is
/// unreadable or malformed.
fn load_plan(path: &Path, max_nodes: usize, system_prompt: &str) -> TaskPlan {
    let parsed = std::fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|text| TaskPlan::from_model_output(&text, max_nodes).map_err(|e| e.to_string()));
    match parsed {
        Ok(plan) => plan,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Planning failed, using fallback");
            TaskPlan::fallback(system_prompt)
        }
    }
}

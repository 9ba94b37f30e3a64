//! Throttled rendering of per-node status.
//!
//! `update` only records the new status and pokes a queue. A single consumer
//! task drains the queue, waits out the rest of the throttle interval since
//! its previous render, folds in whatever else arrived meanwhile, and renders
//! the whole board once.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ProgressConfig;

/// Destination for rendered boards.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn render(&self, text: &str);
}

/// Writes each render to stderr.
pub struct StderrSink;

#[async_trait]
impl ProgressSink for StderrSink {
    async fn render(&self, text: &str) {
        eprintln!("{text}\n");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Changed,
    Stop,
}

#[derive(Debug, Default)]
struct Board {
    /// In first-update order.
    entries: Vec<(String, String)>,
    version: u64,
}

pub struct ProgressReporter {
    board: Arc<Mutex<Board>>,
    header: String,
    signals: mpsc::UnboundedSender<Signal>,
    consumer: JoinHandle<()>,
}

impl ProgressReporter {
    /// Start the consumer task. Must be called inside a tokio runtime.
    pub fn start(config: &ProgressConfig, sink: Arc<dyn ProgressSink>) -> Self {
        let board = Arc::new(Mutex::new(Board::default()));
        let (signals, rx) = mpsc::unbounded_channel();
        let consumer = tokio::spawn(consume(
            Arc::clone(&board),
            config.header.clone(),
            config.throttle,
            sink,
            rx,
        ));
        Self {
            board,
            header: config.header.clone(),
            signals,
            consumer,
        }
    }

    /// Set the status of `id`. New ids are appended to the board.
    pub fn update(&self, id: &str, text: &str) {
        {
            let mut board = self.board.lock().unwrap_or_else(PoisonError::into_inner);
            match board.entries.iter_mut().find(|(key, _)| key == id) {
                Some((_, status)) => *status = text.to_string(),
                None => board.entries.push((id.to_string(), text.to_string())),
            }
            board.version += 1;
        }
        let _ = self.signals.send(Signal::Changed);
    }

    /// Current board as it would be rendered.
    pub fn render(&self) -> String {
        let board = self.board.lock().unwrap_or_else(PoisonError::into_inner);
        render_board(&self.header, &board.entries)
    }

    /// Flush pending updates, stop the consumer, and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.signals.send(Signal::Stop);
        if let Err(e) = self.consumer.await {
            tracing::warn!(error = %e, "Progress consumer panicked");
        }
    }
}

async fn consume(
    board: Arc<Mutex<Board>>,
    header: String,
    throttle: Duration,
    sink: Arc<dyn ProgressSink>,
    mut rx: mpsc::UnboundedReceiver<Signal>,
) {
    let mut last_render: Option<Instant> = None;
    let mut rendered_version = 0u64;

    while let Some(signal) = rx.recv().await {
        let mut stopping = signal == Signal::Stop;

        if let Some(last) = last_render {
            let elapsed = last.elapsed();
            if elapsed < throttle {
                tokio::time::sleep(throttle - elapsed).await;
            }
        }
        while let Ok(signal) = rx.try_recv() {
            stopping |= signal == Signal::Stop;
        }

        let snapshot = {
            let board = board.lock().unwrap_or_else(PoisonError::into_inner);
            (board.version != rendered_version)
                .then(|| (board.version, render_board(&header, &board.entries)))
        };
        if let Some((version, text)) = snapshot {
            sink.render(&text).await;
            rendered_version = version;
            last_render = Some(Instant::now());
        }

        if stopping {
            break;
        }
    }
    tracing::debug!("Progress consumer stopped");
}

/// Status icon by keyword. Later rules win.
fn icon(status: &str) -> &'static str {
    let status = status.to_lowercase();
    let mut icon = "[ ]";
    if status.contains("running") {
        icon = "[~]";
    }
    if status.contains("done") || status.contains("stored") {
        icon = "[+]";
    }
    if status.contains("error") {
        icon = "[!]";
    }
    icon
}

fn render_board(header: &str, entries: &[(String, String)]) -> String {
    let mut out = format!("{header}\n\nAgents:");
    for (id, status) in entries {
        out.push_str(&format!("\n{} {id}: {status}", icon(status)));
    }
    out
}

//! Scripted in-process adapters for router and scheduler tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::{
    AdapterFactory, AdapterRegistry, Backend, BackendAdapter, ChunkStream, CompletionRequest,
    CompletionResponse, Usage,
};
use crate::error::BackendError;

/// One scripted outcome.
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(String),
    /// Use the script's responder.
    Respond,
    Auth,
    Quota,
    Transient,
}

/// A recorded adapter call.
#[derive(Debug, Clone)]
pub struct Call {
    pub backend: Backend,
    pub secret: String,
    pub request: CompletionRequest,
}

type Responder = Box<dyn Fn(&CompletionRequest) -> String + Send + Sync>;

/// Outcomes keyed by secret. A queue is consumed front to back; its last
/// entry repeats forever. Secrets without a queue use the responder.
pub struct Script {
    per_secret: Mutex<HashMap<String, VecDeque<Scripted>>>,
    responder: Responder,
    calls: Mutex<Vec<Call>>,
}

impl Script {
    pub fn new() -> Arc<Self> {
        Self::with_responder(|_| "ok".to_string())
    }

    pub fn with_responder(
        responder: impl Fn(&CompletionRequest) -> String + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            per_secret: Mutex::new(HashMap::new()),
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn on(&self, secret: &str, outcomes: Vec<Scripted>) {
        self.per_secret
            .lock()
            .unwrap()
            .insert(secret.to_string(), outcomes.into());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_secrets(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.secret).collect()
    }

    /// Registry serving scripted adapters for `backends`.
    pub fn registry(self: &Arc<Self>, backends: &[Backend]) -> AdapterRegistry {
        let mut registry = AdapterRegistry::new();
        for &backend in backends {
            let script = Arc::clone(self);
            let factory: AdapterFactory = Arc::new(move |secret: SecretString| {
                Arc::new(ScriptedAdapter {
                    backend,
                    secret: secret.expose_secret().to_string(),
                    script: Arc::clone(&script),
                }) as Arc<dyn BackendAdapter>
            });
            registry.register(backend, factory);
        }
        registry
    }

    fn next(&self, secret: &str) -> Scripted {
        let mut map = self.per_secret.lock().unwrap();
        match map.get_mut(secret) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Scripted::Respond),
            Some(queue) => queue.front().cloned().unwrap_or(Scripted::Respond),
            None => Scripted::Respond,
        }
    }

    fn outcome(
        &self,
        backend: Backend,
        secret: &str,
        request: &CompletionRequest,
    ) -> Result<String, BackendError> {
        self.calls.lock().unwrap().push(Call {
            backend,
            secret: secret.to_string(),
            request: request.clone(),
        });
        match self.next(secret) {
            Scripted::Reply(text) => Ok(text),
            Scripted::Respond => Ok((self.responder)(request)),
            Scripted::Auth => Err(BackendError::auth(backend, "401 invalid key")),
            Scripted::Quota => Err(BackendError::quota(backend, "429 quota exceeded")),
            Scripted::Transient => Err(BackendError::transient(backend, "503 unavailable")),
        }
    }
}

struct ScriptedAdapter {
    backend: Backend,
    secret: String,
    script: Arc<Script>,
}

#[async_trait]
impl BackendAdapter for ScriptedAdapter {
    fn backend(&self) -> Backend {
        self.backend
    }

    async fn request(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, BackendError> {
        let output = self.script.outcome(self.backend, &self.secret, request)?;
        Ok(CompletionResponse {
            output,
            usage: Usage {
                prompt_tokens: 7,
                completion_tokens: 3,
                total_tokens: 10,
            },
        })
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, BackendError> {
        let output = self.script.outcome(self.backend, &self.secret, request)?;
        let chunks: Vec<Result<String, BackendError>> =
            output.chars().map(|c| Ok(c.to_string())).collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn test_credential(&self) -> Result<bool, BackendError> {
        let probe = CompletionRequest::new("", Vec::new());
        self.script
            .outcome(self.backend, &self.secret, &probe)
            .map(|_| true)
    }
}

//! Backend adapters for external AI inference providers.
//!
//! Every adapter speaks the same request/response shape and collapses its
//! wire errors into [`BackendError`]'s three kinds. Adapters are built per
//! credential from an [`AdapterRegistry`] owned by the router.

mod gemini;
mod http;
mod openai_compat;
#[cfg(test)]
pub(crate) mod testing;

pub use gemini::GeminiAdapter;
pub use openai_compat::OpenAiCompatAdapter;

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Supported inference backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Gemini,
    OpenRouter,
    Groq,
    OpenAi,
    Anthropic,
}

impl Backend {
    pub const ALL: [Backend; 5] = [
        Backend::Gemini,
        Backend::OpenRouter,
        Backend::Groq,
        Backend::OpenAi,
        Backend::Anthropic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::OpenRouter => "openrouter",
            Self::Groq => "groq",
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = String;

    /// Parse a backend name, accepting aliases (`google` is Gemini).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" | "google" => Ok(Self::Gemini),
            "openrouter" => Ok(Self::OpenRouter),
            "groq" => Ok(Self::Groq),
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Wire-independent completion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Token accounting reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Normalized completion response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub output: String,
    pub usage: Usage,
}

/// Lazy, finite stream of text chunks. Dropping it cancels the request.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

/// Capability set implemented by every backend.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Which backend this adapter talks to.
    fn backend(&self) -> Backend;

    /// Issue a single completion request.
    async fn request(&self, request: &CompletionRequest)
    -> Result<CompletionResponse, BackendError>;

    /// Open a streaming completion.
    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, BackendError>;

    /// Cheap probe that the credential is accepted.
    async fn test_credential(&self) -> Result<bool, BackendError>;
}

/// Constructor for an adapter bound to one secret.
pub type AdapterFactory = Arc<dyn Fn(SecretString) -> Arc<dyn BackendAdapter> + Send + Sync>;

/// Table of adapter constructors keyed by backend, built once at startup.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: HashMap<Backend, AdapterFactory>,
}

impl AdapterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the HTTP adapters for every supported backend.
    pub fn with_defaults(client: reqwest::Client, default_model: &str) -> Self {
        let mut registry = Self::new();
        for backend in Backend::ALL {
            let client = client.clone();
            let default_model = default_model.to_string();
            let factory: AdapterFactory = match backend {
                Backend::Gemini => Arc::new(move |secret: SecretString| {
                    Arc::new(GeminiAdapter::new(client.clone(), secret, &default_model))
                        as Arc<dyn BackendAdapter>
                }),
                other => Arc::new(move |secret: SecretString| {
                    Arc::new(OpenAiCompatAdapter::for_backend(other, client.clone(), secret))
                        as Arc<dyn BackendAdapter>
                }),
            };
            registry.register(backend, factory);
        }
        registry
    }

    /// Register (or replace) the constructor for a backend.
    pub fn register(&mut self, backend: Backend, factory: AdapterFactory) {
        self.factories.insert(backend, factory);
    }

    /// Build an adapter for `backend` bound to `secret`.
    pub fn build(&self, backend: Backend, secret: SecretString) -> Option<Arc<dyn BackendAdapter>> {
        self.factories.get(&backend).map(|factory| factory(secret))
    }

    pub fn contains(&self, backend: Backend) -> bool {
        self.factories.contains_key(&backend)
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut backends: Vec<_> = self.factories.keys().collect();
        backends.sort();
        f.debug_struct("AdapterRegistry")
            .field("backends", &backends)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_aliases() {
        assert_eq!("google".parse::<Backend>().unwrap(), Backend::Gemini);
        assert_eq!("Gemini".parse::<Backend>().unwrap(), Backend::Gemini);
        assert_eq!(" GROQ ".parse::<Backend>().unwrap(), Backend::Groq);
        assert!("mistral".parse::<Backend>().is_err());
    }

    #[test]
    fn backend_display_matches_parse() {
        for backend in Backend::ALL {
            assert_eq!(backend.to_string().parse::<Backend>().unwrap(), backend);
        }
    }

    #[test]
    fn request_serializes_without_empty_max_tokens() {
        let request = CompletionRequest::new("m", vec![ChatMessage::user("hi")]);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["messages"][0]["role"], "user");
        assert!(json.get("max_tokens").is_none());

        let json = serde_json::to_value(request.with_max_tokens(5)).unwrap();
        assert_eq!(json["max_tokens"], 5);
    }

    #[test]
    fn default_registry_covers_every_backend() {
        let registry = AdapterRegistry::with_defaults(reqwest::Client::new(), "gemini-2.0-flash");
        for backend in Backend::ALL {
            let adapter = registry
                .build(backend, SecretString::from("k"))
                .expect("adapter registered");
            assert_eq!(adapter.backend(), backend);
        }
    }
}

//! Adapter for backends exposing the OpenAI chat-completions wire format
//! (OpenRouter, Groq, OpenAI, Anthropic's compatibility endpoint).

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::http::{response_error, sse_stream, transport_error};
use super::{Backend, BackendAdapter, ChunkStream, CompletionRequest, CompletionResponse, Usage};
use crate::error::BackendError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// How `test_credential` checks a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    /// `GET /v1/models`
    ListModels,
    /// Tiny chat completion against the default model.
    Chat,
}

/// OpenAI-compatible chat-completions adapter.
pub struct OpenAiCompatAdapter {
    backend: Backend,
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    default_model: &'static str,
    probe: Probe,
}

impl OpenAiCompatAdapter {
    /// Adapter preconfigured for one of the OpenAI-compatible backends.
    /// Base URLs can be overridden with `<BACKEND>_BASE_URL`.
    pub fn for_backend(backend: Backend, client: reqwest::Client, api_key: SecretString) -> Self {
        let (default_base, default_model, probe) = match backend {
            Backend::Groq => ("https://api.groq.com/openai", "llama-3.3-70b-versatile", Probe::Chat),
            Backend::OpenRouter => (
                "https://openrouter.ai/api",
                "openrouter/auto",
                Probe::ListModels,
            ),
            Backend::Anthropic => ("https://api.anthropic.com", "claude-3-5-haiku-latest", Probe::Chat),
            Backend::OpenAi | Backend::Gemini => {
                ("https://api.openai.com", "gpt-4o-mini", Probe::ListModels)
            }
        };
        let env_key = format!("{}_BASE_URL", backend.as_str().to_ascii_uppercase());
        let base_url = std::env::var(env_key).unwrap_or_else(|_| default_base.to_string());

        Self {
            backend,
            client,
            base_url,
            api_key,
            default_model,
            probe,
        }
    }

    /// Point the adapter at a different base URL (tests, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    /// Substitute the backend default when the requested model clearly
    /// belongs to another provider's family.
    fn resolve_model(&self, requested: &str) -> String {
        let lower = requested.to_ascii_lowercase();
        let foreign = match self.backend {
            Backend::Groq => {
                lower.is_empty() || lower.contains("gemini") || lower.contains("gpt")
            }
            Backend::OpenAi => {
                lower.is_empty() || lower.contains("gemini") || lower.contains("llama")
            }
            Backend::Anthropic => lower.is_empty() || !lower.starts_with("claude"),
            // OpenRouter routes any namespaced model itself.
            Backend::OpenRouter | Backend::Gemini => lower.is_empty(),
        };
        if foreign {
            self.default_model.to_string()
        } else {
            requested.to_string()
        }
    }

    fn body(&self, request: &CompletionRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.resolve_model(&request.model),
            "messages": request.messages,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = max_tokens.into();
        }
        if stream {
            body["stream"] = true.into();
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

impl From<WireUsage> for Usage {
    fn from(wire: WireUsage) -> Self {
        let total = if wire.total_tokens > 0 {
            wire.total_tokens
        } else {
            wire.prompt_tokens + wire.completion_tokens
        };
        Usage {
            prompt_tokens: wire.prompt_tokens,
            completion_tokens: wire.completion_tokens,
            total_tokens: total,
        }
    }
}

fn delta_content(value: &serde_json::Value) -> Option<String> {
    value["choices"][0]["delta"]["content"]
        .as_str()
        .map(str::to_string)
}

#[async_trait]
impl BackendAdapter for OpenAiCompatAdapter {
    fn backend(&self) -> Backend {
        self.backend
    }

    async fn request(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, BackendError> {
        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(self.api_key.expose_secret())
            .timeout(REQUEST_TIMEOUT)
            .json(&self.body(request, false))
            .send()
            .await
            .map_err(|e| transport_error(self.backend, e))?;

        tracing::debug!(backend = %self.backend, status = %response.status(), "Completion response");
        if !response.status().is_success() {
            return Err(response_error(self.backend, response).await);
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| transport_error(self.backend, e))?;

        let output = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.and_then(|m| m.content).or(choice.text))
            .unwrap_or_default();

        Ok(CompletionResponse {
            output,
            usage: completion.usage.unwrap_or_default().into(),
        })
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, BackendError> {
        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(self.api_key.expose_secret())
            .json(&self.body(request, true))
            .send()
            .await
            .map_err(|e| transport_error(self.backend, e))?;

        if !response.status().is_success() {
            return Err(response_error(self.backend, response).await);
        }
        Ok(sse_stream(self.backend, response, delta_content))
    }

    async fn test_credential(&self) -> Result<bool, BackendError> {
        let request = match self.probe {
            Probe::ListModels => self
                .client
                .get(format!("{}/v1/models", self.base_url)),
            Probe::Chat => self.client.post(self.completions_url()).json(&serde_json::json!({
                "model": self.default_model,
                "messages": [{"role": "user", "content": "hi"}],
                "max_tokens": 5,
            })),
        };

        let response = request
            .bearer_auth(self.api_key.expose_secret())
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| transport_error(self.backend, e))?;

        if response.status().is_success() {
            return Ok(true);
        }
        Err(response_error(self.backend, response).await)
    }
}

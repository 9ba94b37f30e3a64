//! Google Gemini adapter (Generative Language REST API).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::http::{response_error, sse_stream, status_error, transport_error, truncate_body};
use super::{Backend, BackendAdapter, ChunkStream, CompletionRequest, CompletionResponse, Role, Usage};
use crate::error::BackendError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const API_KEY_HEADER: &str = "x-goog-api-key";

/// Gemini adapter.
pub struct GeminiAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    default_model: String,
}

impl GeminiAdapter {
    pub fn new(client: reqwest::Client, api_key: SecretString, default_model: &str) -> Self {
        let base_url = std::env::var("GEMINI_BASE_URL")
            .unwrap_or_else(|_| "https://generativelanguage.googleapis.com".to_string());
        let default_model = if default_model.to_ascii_lowercase().contains("gemini") {
            default_model.to_string()
        } else {
            "gemini-2.0-flash".to_string()
        };
        Self {
            client,
            base_url,
            api_key,
            default_model,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Non-Gemini or empty model names fall back to the default.
    fn resolve_model(&self, requested: &str) -> String {
        let bare = requested.trim().trim_start_matches("models/");
        if bare.to_ascii_lowercase().starts_with("gemini") {
            bare.to_string()
        } else {
            self.default_model.clone()
        }
    }

    fn body(request: &CompletionRequest) -> serde_json::Value {
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let contents: Vec<serde_json::Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let role = if m.role == Role::Assistant { "model" } else { "user" };
                serde_json::json!({"role": role, "parts": [{"text": m.content}]})
            })
            .collect();

        let mut body = serde_json::json!({ "contents": contents });
        if !system.is_empty() {
            body["systemInstruction"] = serde_json::json!({"parts": [{"text": system.join("\n\n")}]});
        }
        if let Some(max_tokens) = request.max_tokens {
            body["generationConfig"] = serde_json::json!({"maxOutputTokens": max_tokens});
        }
        body
    }

    async fn generate(
        &self,
        model: &str,
        request: &CompletionRequest,
    ) -> Result<reqwest::Response, BackendError> {
        self.client
            .post(format!(
                "{}/v1beta/models/{}:generateContent",
                self.base_url, model
            ))
            .header(API_KEY_HEADER, self.api_key.expose_secret())
            .timeout(REQUEST_TIMEOUT)
            .json(&Self::body(request))
            .send()
            .await
            .map_err(|e| transport_error(Backend::Gemini, e))
    }
}

/// Gemini reports a malformed key as 400 INVALID_ARGUMENT.
async fn gemini_error(response: reqwest::Response) -> BackendError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::BAD_REQUEST
        && (body.contains("API_KEY_INVALID") || body.contains("API key not valid"))
    {
        return BackendError::auth(Backend::Gemini, truncate_body(&body));
    }
    status_error(Backend::Gemini, status, &body)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: u64,
}

fn stream_delta(value: &serde_json::Value) -> Option<String> {
    let parts = value["candidates"][0]["content"]["parts"].as_array()?;
    Some(
        parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<String>(),
    )
}

#[async_trait]
impl BackendAdapter for GeminiAdapter {
    fn backend(&self) -> Backend {
        Backend::Gemini
    }

    async fn request(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, BackendError> {
        let model = self.resolve_model(&request.model);
        let mut response = self.generate(&model, request).await?;

        // Unknown model: retry once on the default before giving up.
        if response.status() == StatusCode::NOT_FOUND && model != self.default_model {
            tracing::info!(original = %model, fallback = %self.default_model, "Gemini model fallback");
            response = self.generate(&self.default_model, request).await?;
        }
        if !response.status().is_success() {
            return Err(gemini_error(response).await);
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| transport_error(Backend::Gemini, e))?;

        let output = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<String>()
            })
            .unwrap_or_default();
        let usage = parsed.usage_metadata.unwrap_or_default();

        Ok(CompletionResponse {
            output,
            usage: Usage {
                prompt_tokens: usage.prompt_token_count,
                completion_tokens: usage.candidates_token_count,
                total_tokens: usage.total_token_count,
            },
        })
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, BackendError> {
        let model = self.resolve_model(&request.model);
        let response = self
            .client
            .post(format!(
                "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
                self.base_url, model
            ))
            .header(API_KEY_HEADER, self.api_key.expose_secret())
            .json(&Self::body(request))
            .send()
            .await
            .map_err(|e| transport_error(Backend::Gemini, e))?;

        if !response.status().is_success() {
            return Err(gemini_error(response).await);
        }
        Ok(sse_stream(Backend::Gemini, response, stream_delta))
    }

    async fn test_credential(&self) -> Result<bool, BackendError> {
        let response = self
            .client
            .get(format!("{}/v1beta/models", self.base_url))
            .header(API_KEY_HEADER, self.api_key.expose_secret())
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| transport_error(Backend::Gemini, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        // An exhausted key is still a valid key.
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Ok(true);
        }
        if status == StatusCode::BAD_REQUEST {
            return Err(gemini_error(response).await);
        }
        Err(response_error(Backend::Gemini, response).await)
    }
}

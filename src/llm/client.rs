//! Provider traits and the HTTP chat-completions client.
//!
//! The concrete provider speaks the OpenAI-compatible chat-completions
//! dialect served by NVIDIA's inference endpoints; embeddings use the
//! asymmetric query/passage variant of the same API.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

use super::types::{
    CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, TokenUsage,
};

/// Chat-completion provider seam.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Complete a prompt synchronously.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Complete a prompt, streaming raw text chunks.
    async fn complete_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<mpsc::Receiver<Result<String>>>;

    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Context window of the default model, in tokens.
    fn context_window(&self) -> usize;
}

/// Embedding provider seam.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse>;

    /// Dimensionality of produced vectors.
    fn dimensions(&self) -> usize;
}

/// Configuration for the HTTP provider client.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// API key
    pub api_key: String,
    /// Base URL override
    pub base_url: Option<String>,
    /// Default chat model
    pub default_model: String,
    /// Default embedding model
    pub embedding_model: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Context window of the default model
    pub context_window: usize,
}

impl ProviderConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            default_model: "meta/llama-3.1-70b-instruct".to_string(),
            embedding_model: "nvidia/nv-embedqa-e5-v5".to_string(),
            timeout_secs: 120,
            context_window: 128_000,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

fn build_http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| Error::Internal(format!("failed to create HTTP client: {e}")))
}

/// OpenAI-compatible chat/embeddings client for NVIDIA inference endpoints.
pub struct NimClient {
    config: ProviderConfig,
    http: Client,
}

impl NimClient {
    const DEFAULT_BASE_URL: &'static str = "https://integrate.api.nvidia.com";

    pub fn new(config: ProviderConfig) -> Result<Self> {
        let http = build_http_client(config.timeout_secs)?;
        Ok(Self { config, http })
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }

    fn build_request_body(&self, request: &CompletionRequest, stream: bool) -> ChatRequest {
        ChatRequest {
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.config.default_model.clone()),
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stop: request.stop.clone(),
            stream,
        }
    }

    fn map_send_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout {
                duration_ms: self.config.timeout_secs * 1000,
            }
        } else {
            Error::llm_api(self.name(), format!("connection failed: {e}"))
        }
    }
}

// Wire types for the OpenAI-compatible API.
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: Option<String>,
    choices: Vec<ChatChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Serialize)]
struct EmbeddingWireRequest {
    model: String,
    input: Vec<String>,
    input_type: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingWireResponse {
    data: Vec<EmbeddingDatum>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
    index: usize,
}

#[async_trait]
impl LlmProvider for NimClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let body = self.build_request_body(&request, false);
        let url = format!("{}/v1/chat/completions", self.base_url());

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::llm_api(self.name(), format!("failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(Error::llm_api(
                self.name(),
                format!("HTTP {}: {}", status.as_u16(), truncate_body(&text)),
            ));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| Error::llm_api(self.name(), format!("invalid response JSON: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::llm_api(self.name(), "response contained no choices"))?;

        Ok(CompletionResponse {
            content,
            model: parsed.model.unwrap_or(body.model),
            usage: parsed
                .usage
                .map(|u| TokenUsage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                })
                .unwrap_or_default(),
        })
    }

    async fn complete_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        use futures::StreamExt;

        let body = self.build_request_body(&request, true);
        let url = format!("{}/v1/chat/completions", self.base_url());

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::llm_api(
                self.name(),
                format!("HTTP {}: {}", status.as_u16(), truncate_body(&text)),
            ));
        }

        let (tx, rx) = mpsc::channel(32);
        let provider = self.name().to_string();

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(Error::llm_api(&provider, format!("stream error: {e}"))))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                // SSE frames are newline-delimited "data: {...}" lines.
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);

                    let Some(payload) = line.strip_prefix("data:").map(str::trim) else {
                        continue;
                    };
                    if payload == "[DONE]" {
                        return;
                    }
                    if let Ok(chunk) = serde_json::from_str::<StreamChunk>(payload) {
                        for choice in chunk.choices {
                            if let Some(content) = choice.delta.content {
                                if !content.is_empty() && tx.send(Ok(content)).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    fn name(&self) -> &str {
        "nvidia"
    }

    fn context_window(&self) -> usize {
        self.config.context_window
    }
}

#[async_trait]
impl EmbeddingProvider for NimClient {
    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse> {
        let body = EmbeddingWireRequest {
            model: request
                .model
                .unwrap_or_else(|| self.config.embedding_model.clone()),
            input: request.texts,
            input_type: match request.input_type {
                super::types::EmbeddingInputType::Query => "query".to_string(),
                super::types::EmbeddingInputType::Passage => "passage".to_string(),
            },
        };
        let url = format!("{}/v1/embeddings", self.base_url());

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Embedding(format!("connection failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Embedding(format!("failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(Error::Embedding(format!(
                "HTTP {}: {}",
                status.as_u16(),
                truncate_body(&text)
            )));
        }

        let mut parsed: EmbeddingWireResponse = serde_json::from_str(&text)
            .map_err(|e| Error::Embedding(format!("invalid response JSON: {e}")))?;

        parsed.data.sort_by_key(|d| d.index);

        Ok(EmbeddingResponse {
            embeddings: parsed.data.into_iter().map(|d| d.embedding).collect(),
            usage: parsed
                .usage
                .map(|u| TokenUsage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                })
                .unwrap_or_default(),
        })
    }

    fn dimensions(&self) -> usize {
        1024
    }
}

fn truncate_body(body: &str) -> &str {
    let end = body
        .char_indices()
        .nth(500)
        .map(|(i, _)| i)
        .unwrap_or(body.len());
    &body[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::ChatMessage;

    #[test]
    fn test_request_body_uses_default_model() {
        let client = NimClient::new(ProviderConfig::new("key")).unwrap();
        let request = CompletionRequest::new().with_message(ChatMessage::user("hi"));
        let body = client.build_request_body(&request, false);
        assert_eq!(body.model, "meta/llama-3.1-70b-instruct");
        assert!(!body.stream);
    }

    #[test]
    fn test_request_body_honors_override() {
        let client = NimClient::new(ProviderConfig::new("key")).unwrap();
        let request = CompletionRequest::new()
            .with_model("other-model")
            .with_message(ChatMessage::user("hi"));
        let body = client.build_request_body(&request, true);
        assert_eq!(body.model, "other-model");
        assert!(body.stream);
    }

    #[test]
    fn test_truncate_body_respects_char_boundaries() {
        let long = "é".repeat(600);
        let out = truncate_body(&long);
        assert_eq!(out.chars().count(), 500);
    }
}

//! LLM infrastructure: provider seams, rate limiting, retries, fallback,
//! response caching, and think-tag filtering.
//!
//! [`LlmService`] is the single entry point the pipeline uses for text
//! generation. Each call runs the full contract: pre-flight prompt-size
//! check, optional injection screen, per-user sliding-window rate limit,
//! provider call with exponential backoff on transient errors, optional
//! fallback model on model-specific failures, and structured token-usage
//! logging.

mod cache;
mod client;
mod ratelimit;
mod sanitize;
mod stream;
mod types;

pub use cache::ResponseCache;
pub use client::{EmbeddingProvider, LlmProvider, NimClient, ProviderConfig};
pub use ratelimit::{
    RateLimiter, ANONYMOUS_RATE_LIMIT_REQUESTS, DEFAULT_RATE_LIMIT_REQUESTS,
    DEFAULT_RATE_LIMIT_WINDOW,
};
pub use sanitize::{sanitize_prompt, RiskLevel, SanitizeOutcome};
pub use stream::{strip_thinking_tags, ThinkTagFilter};
pub use types::{
    cosine_similarity, ChatMessage, ChatRole, CompletionRequest, CompletionResponse,
    EmbeddingInputType, EmbeddingRequest, EmbeddingResponse, TokenUsage,
};

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::kv::KvStore;

/// Options for one generation call.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub system: Option<String>,
    pub user_id: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub model: Option<String>,
    /// Skip the injection screen (for internally assembled prompts).
    pub trusted: bool,
}

impl GenerateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn trusted(mut self) -> Self {
        self.trusted = true;
        self
    }
}

/// Estimate tokens for a text: `ceil(len/4)`.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Estimate tokens for a message list: per-message overhead of 10 tokens.
pub fn estimate_messages_tokens(messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .map(|m| estimate_tokens(&m.content) + 10)
        .sum()
}

/// The process-wide LLM front end.
///
/// Built once at startup and shared via `Arc`; holds the provider, the KV
/// store backing rate limits, and the relevant configuration.
pub struct LlmService {
    provider: Arc<dyn LlmProvider>,
    kv: Arc<dyn KvStore>,
    config: CoreConfig,
}

impl LlmService {
    pub fn new(provider: Arc<dyn LlmProvider>, kv: Arc<dyn KvStore>, config: CoreConfig) -> Self {
        Self {
            provider,
            kv,
            config,
        }
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Fail fast when the assembled prompt would blow the context budget.
    fn validate_prompt_size(&self, messages: &[ChatMessage]) -> Result<usize> {
        let tokens = estimate_messages_tokens(messages);
        let limit = ((self.provider.context_window() as f64 * 0.85) as usize)
            .min(self.config.max_prompt_tokens);
        if tokens > limit {
            return Err(Error::PromptTooLarge { tokens, limit });
        }
        Ok(tokens)
    }

    fn screen_injection(&self, prompt: &str, trusted: bool) -> Result<String> {
        if trusted {
            return Ok(prompt.to_string());
        }
        let outcome = sanitize_prompt(prompt);
        if let Some(risk) = outcome.risk {
            if self.config.reject_prompt_injection && risk >= RiskLevel::High {
                return Err(Error::PromptInjection {
                    risk: risk.as_str().to_string(),
                    pattern: outcome.matched.unwrap_or_default(),
                });
            }
            warn!(risk = risk.as_str(), "prompt injection patterns sanitized");
        }
        Ok(outcome.text)
    }

    async fn wait_rate_limit(&self, user_id: Option<&str>) -> Result<()> {
        let limiter = RateLimiter::new(
            self.kv.clone(),
            user_id,
            Some(match user_id {
                Some(id) if !id.is_empty() && id != "anonymous" => self.config.rate_limit_requests,
                _ => self.config.anonymous_rate_limit_requests,
            }),
            Some(self.config.rate_limit_window_secs),
        );
        limiter
            .wait_for_slot(Duration::from_secs(self.config.rate_limit_wait_secs))
            .await
    }

    fn backoff_delay(attempt: u32) -> Duration {
        let base = 1.0f64 * 2.0f64.powi(attempt as i32);
        let jitter: f64 = rand::thread_rng().gen_range(0.0..0.5);
        Duration::from_secs_f64((base + jitter).min(30.0))
    }

    fn log_usage(&self, model: &str, usage: &TokenUsage, streaming: bool) {
        info!(
            model,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            total_tokens = usage.total(),
            streaming,
            "llm token usage"
        );
    }

    /// Call the provider with backoff retries on transient errors.
    async fn call_with_retries(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let mut last_err: Option<Error> = None;
        for attempt in 0..=self.config.max_retries {
            match self.provider.complete(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = Self::backoff_delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retryable provider error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Internal("retry loop exhausted".into())))
    }

    fn build_request(&self, prompt: String, options: &GenerateOptions) -> CompletionRequest {
        let mut request = CompletionRequest::new();
        if let Some(system) = &options.system {
            request = request.with_message(ChatMessage::system(system));
        }
        request = request.with_message(ChatMessage::user(prompt));
        request.model = options.model.clone().or_else(|| Some(self.config.model.clone()));
        request.temperature = options.temperature;
        request.max_tokens = options.max_tokens;
        request
    }

    /// Generate a completion under the full infrastructure contract.
    ///
    /// Think-tag regions are stripped from the returned content; callers
    /// that need the raw reasoning should use the provider directly.
    pub async fn generate(
        &self,
        prompt: impl Into<String>,
        options: GenerateOptions,
    ) -> Result<CompletionResponse> {
        let prompt = self.screen_injection(&prompt.into(), options.trusted)?;
        let request = self.build_request(prompt, &options);
        self.validate_prompt_size(&request.messages)?;
        self.wait_rate_limit(options.user_id.as_deref()).await?;

        let result = self.call_with_retries(&request).await;

        let mut response = match result {
            Ok(response) => response,
            Err(e) if e.should_fallback() && self.config.fallback_model.is_some() => {
                let fallback = self.config.fallback_model.clone().unwrap_or_default();
                warn!(error = %e, fallback_model = %fallback, "primary model failed, trying fallback");
                let mut fb_request = request.clone();
                fb_request.model = Some(fallback);
                // The fallback's error, if any, is the one surfaced.
                self.call_with_retries(&fb_request).await?
            }
            Err(e) => return Err(e),
        };

        self.log_usage(&response.model, &response.usage, false);
        response.content = strip_thinking_tags(&response.content);
        Ok(response)
    }

    /// Generate a completion as a stream of visible-text chunks.
    ///
    /// `<think>` regions are filtered across chunk boundaries before
    /// chunks reach the caller.
    pub async fn generate_stream(
        &self,
        prompt: impl Into<String>,
        options: GenerateOptions,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        let prompt = self.screen_injection(&prompt.into(), options.trusted)?;
        let request = self.build_request(prompt, &options);
        self.validate_prompt_size(&request.messages)?;
        self.wait_rate_limit(options.user_id.as_deref()).await?;

        let mut raw = self.provider.complete_stream(request).await?;
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let mut filter = ThinkTagFilter::new();
            while let Some(item) = raw.recv().await {
                match item {
                    Ok(chunk) => {
                        let visible = filter.feed(&chunk);
                        if !visible.is_empty() && tx.send(Ok(visible)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
            let tail = filter.finish();
            if !tail.is_empty() {
                let _ = tx.send(Ok(tail)).await;
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted providers for pipeline tests.

    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Provider that replays a scripted queue of responses.
    pub struct StaticProvider {
        responses: Mutex<VecDeque<String>>,
        pub calls: Mutex<Vec<CompletionRequest>>,
        /// Errors returned before any scripted response is served.
        fail_first: Mutex<VecDeque<Error>>,
    }

    impl StaticProvider {
        pub fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(String::from).collect()),
                calls: Mutex::new(Vec::new()),
                fail_first: Mutex::new(VecDeque::new()),
            }
        }

        pub fn failing_first(self, errors: Vec<Error>) -> Self {
            *self.fail_first.lock().unwrap() = errors.into();
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LlmProvider for StaticProvider {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
            self.calls.lock().unwrap().push(request);
            if let Some(err) = self.fail_first.lock().unwrap().pop_front() {
                return Err(err);
            }
            let content = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "[]".to_string());
            Ok(CompletionResponse {
                content,
                model: "static-test-model".to_string(),
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
            })
        }

        async fn complete_stream(
            &self,
            request: CompletionRequest,
        ) -> Result<mpsc::Receiver<Result<String>>> {
            let response = self.complete(request).await?;
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                // Emit in small chunks to exercise boundary handling.
                for chunk in response.content.as_bytes().chunks(7) {
                    let text = String::from_utf8_lossy(chunk).into_owned();
                    if tx.send(Ok(text)).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }

        fn name(&self) -> &str {
            "static"
        }

        fn context_window(&self) -> usize {
            128_000
        }
    }

    /// Deterministic embedder: hashes text into a fixed-dimension vector.
    pub struct StaticEmbedder {
        pub dims: usize,
    }

    impl StaticEmbedder {
        pub fn new() -> Self {
            Self { dims: 16 }
        }

        pub fn vector_for(&self, text: &str) -> Vec<f32> {
            use sha2::{Digest, Sha256};
            let digest = Sha256::digest(text.to_lowercase().as_bytes());
            let mut v: Vec<f32> = digest
                .iter()
                .cycle()
                .take(self.dims)
                .map(|b| (*b as f32 - 128.0) / 128.0)
                .collect();
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                for x in &mut v {
                    *x /= norm;
                }
            }
            v
        }
    }

    impl Default for StaticEmbedder {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl EmbeddingProvider for StaticEmbedder {
        async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse> {
            Ok(EmbeddingResponse {
                embeddings: request.texts.iter().map(|t| self.vector_for(t)).collect(),
                usage: TokenUsage::default(),
            })
        }

        fn dimensions(&self) -> usize {
            self.dims
        }
    }
}

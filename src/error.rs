//! Error types for dkg-core.

use thiserror::Error;

/// Result type alias using dkg-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during knowledge-graph operations.
#[derive(Error, Debug)]
pub enum Error {
    /// LLM provider API error
    #[error("LLM API error: {provider} - {message}")]
    LlmApi { provider: String, message: String },

    /// Assembled prompt exceeds the provider context budget
    #[error("prompt too large: {tokens} tokens (limit {limit})")]
    PromptTooLarge { tokens: usize, limit: usize },

    /// Prompt-injection screen rejected the input
    #[error("prompt injection detected ({risk} risk): {pattern}")]
    PromptInjection { risk: String, pattern: String },

    /// Per-user rate limit exhausted
    #[error("rate limit exceeded for {user_id}, retry after {retry_after_secs:.1}s")]
    RateLimited {
        user_id: String,
        retry_after_secs: f64,
    },

    /// Timeout during operation
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Embedding provider error
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Graph store error
    #[error("graph storage error: {0}")]
    GraphStorage(String),

    /// Relational store error
    #[error("relational storage error: {0}")]
    RelationalStorage(String),

    /// Key-value store error
    #[error("kv store error: {0}")]
    KvStorage(String),

    /// LLM output could not be parsed
    #[error("parse error: {0}")]
    Parse(String),

    /// Log file could not be read or decoded
    #[error("ingest error: {0}")]
    Ingest(String),

    /// An import job is already running
    #[error("job conflict: {0}")]
    JobConflict(String),

    /// Requested record does not exist (or belongs to another user)
    #[error("not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an LLM API error.
    pub fn llm_api(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LlmApi {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Whether the error is transient and worth a backoff retry.
    ///
    /// Covers connection failures, timeouts, and the retryable HTTP
    /// statuses (429, 500, 502, 503, 504) surfaced by the provider.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::LlmApi { message, .. } => {
                let msg = message.to_lowercase();
                msg.contains("connection")
                    || msg.contains("timed out")
                    || msg.contains("timeout")
                    || ["429", "500", "502", "503", "504"]
                        .iter()
                        .any(|code| msg.contains(code))
            }
            _ => false,
        }
    }

    /// Whether the error indicates the *model* (rather than the network)
    /// is unavailable and a fallback model should be tried.
    pub fn should_fallback(&self) -> bool {
        match self {
            Self::LlmApi { message, .. } => {
                let msg = message.to_lowercase();
                msg.contains("503")
                    || msg.contains("529")
                    || msg.contains("overloaded")
                    || msg.contains("capacity")
                    || msg.contains("unavailable")
            }
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::GraphStorage(e.to_string())
    }
}

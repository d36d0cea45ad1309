//! Configuration for the knowledge-graph core.
//!
//! A single [`CoreConfig`] carries the tunables for every pipeline stage:
//! model selection, prompt budgets, similarity thresholds, rate limits,
//! cache TTLs, and the staleness/dormancy knobs. Values can be overridden
//! with builder methods or loaded from environment variables.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// How calibrated confidence is computed from a raw extraction score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationMethod {
    /// `0.4·raw + 0.3·completeness + 0.2·evidence + 0.1·source_fidelity`
    Composite,
    /// `raw^(1/T)` with a light completeness penalty
    Temperature,
}

/// Weights for the dormant-alternative reconsider score.
#[derive(Debug, Clone, Copy)]
pub struct DormantWeights {
    /// Weight of normalized age in the score.
    pub age: f64,
    /// Weight of the original confidence penalty (1 - confidence).
    pub confidence_penalty: f64,
}

impl Default for DormantWeights {
    fn default() -> Self {
        Self {
            age: 0.6,
            confidence_penalty: 0.4,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Primary chat model id.
    pub model: String,
    /// Fallback model tried on model-specific failures (503/529/overloaded).
    pub fallback_model: Option<String>,
    /// Embedding model id.
    pub embedding_model: String,
    /// Provider context window, in tokens.
    pub context_limit: usize,
    /// Hard cap on assembled prompt tokens (before the 0.85 context margin).
    pub max_prompt_tokens: usize,
    /// Sampling temperature for extraction calls.
    pub extraction_temperature: f64,
    /// Version tag mixed into response-cache keys.
    pub prompt_version: String,

    /// Cosine similarity threshold for SIMILAR_TO edges.
    pub similarity_threshold: f64,
    /// Above this, a SIMILAR_TO edge is tiered `high` instead of `moderate`.
    pub high_confidence_similarity_threshold: f64,
    /// Pre-calibration confidence above which the verify pass is skipped.
    pub high_confidence_threshold: f64,
    /// Calibrated confidence below which a decision is dropped.
    pub min_confidence: f64,
    /// Confidence floor for saving pair-analyzer verdicts.
    pub pair_confidence_threshold: f64,
    /// How calibrated confidence is computed.
    pub calibration: CalibrationMethod,

    /// Global fuzzy-match ratio threshold (per-type overrides apply).
    pub fuzzy_match_threshold: f64,
    /// Global embedding similarity threshold for entity resolution.
    pub embedding_similarity_threshold: f64,

    /// Requests per window for authenticated users.
    pub rate_limit_requests: u32,
    /// Requests per window for the shared anonymous key.
    pub anonymous_rate_limit_requests: u32,
    /// Rate-limit window in seconds.
    pub rate_limit_window_secs: u64,
    /// Longest a caller waits for a rate-limit slot before failing.
    pub rate_limit_wait_secs: u64,

    /// Max retries on transient provider errors.
    pub max_retries: u32,
    /// Whether the prompt-injection screen rejects HIGH/CRITICAL inputs.
    pub reject_prompt_injection: bool,

    /// Entity-resolution cache TTL, seconds.
    pub entity_cache_ttl_secs: u64,
    /// LLM response cache TTL, seconds.
    pub response_cache_ttl_secs: u64,

    /// Root directory for conversation logs.
    pub logs_root: PathBuf,
    /// Minutes of silence that force an episode boundary.
    pub episode_gap_minutes: f64,

    /// Minimum age before a rejected option counts as dormant, days.
    pub dormant_min_age_days: i64,
    /// Dormant-alternative score weights.
    pub dormant_weights: DormantWeights,

    /// Token budget for focused agent context (≈4 chars/token).
    pub agent_context_token_budget: usize,
    /// Number of top hits sent to the reranker.
    pub reranking_top_k: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            model: "meta/llama-3.1-70b-instruct".to_string(),
            fallback_model: Some("meta/llama-3.1-8b-instruct".to_string()),
            embedding_model: "nvidia/nv-embedqa-e5-v5".to_string(),
            context_limit: 128_000,
            max_prompt_tokens: 24_000,
            extraction_temperature: 0.3,
            prompt_version: "v5".to_string(),

            similarity_threshold: 0.7,
            high_confidence_similarity_threshold: 0.85,
            high_confidence_threshold: 0.85,
            min_confidence: 0.3,
            pair_confidence_threshold: 0.6,
            calibration: CalibrationMethod::Composite,

            fuzzy_match_threshold: 0.85,
            embedding_similarity_threshold: 0.90,

            rate_limit_requests: 30,
            anonymous_rate_limit_requests: 10,
            rate_limit_window_secs: 60,
            rate_limit_wait_secs: 30,

            max_retries: 3,
            reject_prompt_injection: false,

            entity_cache_ttl_secs: 300,
            response_cache_ttl_secs: 86_400,

            logs_root: PathBuf::from("logs"),
            episode_gap_minutes: 10.0,

            dormant_min_age_days: 14,
            dormant_weights: DormantWeights::default(),

            agent_context_token_budget: 4_000,
            reranking_top_k: 20,
        }
    }
}

impl CoreConfig {
    /// Load overrides from `DKG_*` environment variables on top of defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(model) = std::env::var("DKG_MODEL") {
            config.model = model;
        }
        if let Ok(model) = std::env::var("DKG_FALLBACK_MODEL") {
            config.fallback_model = if model.is_empty() { None } else { Some(model) };
        }
        if let Ok(model) = std::env::var("DKG_EMBEDDING_MODEL") {
            config.embedding_model = model;
        }
        if let Ok(root) = std::env::var("DKG_LOGS_ROOT") {
            config.logs_root = PathBuf::from(root);
        }
        if let Ok(v) = std::env::var("DKG_SIMILARITY_THRESHOLD") {
            config.similarity_threshold = v
                .parse()
                .map_err(|_| Error::Config(format!("invalid DKG_SIMILARITY_THRESHOLD: {v}")))?;
        }
        if let Ok(v) = std::env::var("DKG_RATE_LIMIT_REQUESTS") {
            config.rate_limit_requests = v
                .parse()
                .map_err(|_| Error::Config(format!("invalid DKG_RATE_LIMIT_REQUESTS: {v}")))?;
        }
        if let Ok(v) = std::env::var("DKG_PROMPT_VERSION") {
            config.prompt_version = v;
        }

        Ok(config)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_logs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.logs_root = root.into();
        self
    }

    pub fn with_similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn with_calibration(mut self, method: CalibrationMethod) -> Self {
        self.calibration = method;
        self
    }

    /// Effective prompt budget: the provider context with a safety margin,
    /// clamped by the configured cap.
    pub fn effective_prompt_budget(&self) -> usize {
        ((self.context_limit as f64 * 0.85) as usize).min(self.max_prompt_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_prompt_budget_takes_minimum() {
        let config = CoreConfig::default();
        assert_eq!(config.effective_prompt_budget(), 24_000);

        let config = CoreConfig {
            context_limit: 8_000,
            max_prompt_tokens: 24_000,
            ..CoreConfig::default()
        };
        assert_eq!(config.effective_prompt_budget(), 6_800);
    }

    #[test]
    fn test_builder_overrides() {
        let config = CoreConfig::default()
            .with_model("custom-model")
            .with_similarity_threshold(0.8);
        assert_eq!(config.model, "custom-model");
        assert!((config.similarity_threshold - 0.8).abs() < f64::EPSILON);
    }
}

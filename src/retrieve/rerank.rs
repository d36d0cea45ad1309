//! Reranking seam and the HTTP cross-encoder client.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Scores candidate documents against a query, higher is better.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// One score per document, in input order.
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f64>>;
}

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: RerankText<'a>,
    passages: Vec<RerankText<'a>>,
}

#[derive(Debug, Serialize)]
struct RerankText<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    rankings: Vec<Ranking>,
}

#[derive(Debug, Deserialize)]
struct Ranking {
    index: usize,
    logit: f64,
}

/// NVIDIA reranking-API client.
pub struct NimReranker {
    http: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl NimReranker {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Internal(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: "https://ai.api.nvidia.com/v1/retrieval".to_string(),
            model: "nvidia/nv-rerankqa-mistral-4b-v3".to_string(),
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[async_trait]
impl Reranker for NimReranker {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f64>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let body = RerankRequest {
            model: &self.model,
            query: RerankText { text: query },
            passages: documents.iter().map(|d| RerankText { text: d }).collect(),
        };
        let url = format!("{}/{}/reranking", self.base_url, self.model);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::llm_api("nvidia-rerank", format!("connection failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::llm_api("nvidia-rerank", format!("failed to read response: {e}")))?;
        if !status.is_success() {
            return Err(Error::llm_api(
                "nvidia-rerank",
                format!("HTTP {}: {text:.200}", status.as_u16()),
            ));
        }

        let parsed: RerankResponse = serde_json::from_str(&text)
            .map_err(|e| Error::llm_api("nvidia-rerank", format!("invalid response JSON: {e}")))?;

        // Logits become [0, 1] scores so they compose with combined scores.
        let mut scores = vec![0.0f64; documents.len()];
        for ranking in parsed.rankings {
            if ranking.index < scores.len() {
                scores[ranking.index] = 1.0 / (1.0 + (-ranking.logit).exp());
            }
        }
        Ok(scores)
    }
}

//! Response caching for LLM calls, keyed by prompt content.
//!
//! Keys follow `llm:<prompt_version>:<type>:<md5(text)>` so that a prompt
//! revision invalidates the whole cache without a sweep. Values are either
//! raw completion text or a JSON string, at the caller's discretion.
//! Callers populate the cache only after validation, so garbage
//! extractions are never replayed.

use md5::{Digest, Md5};
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::kv::KvStore;

/// Content-addressed LLM response cache over the KV store.
#[derive(Clone)]
pub struct ResponseCache {
    kv: Arc<dyn KvStore>,
    prompt_version: String,
    ttl_secs: u64,
}

impl ResponseCache {
    pub fn new(kv: Arc<dyn KvStore>, prompt_version: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            kv,
            prompt_version: prompt_version.into(),
            ttl_secs,
        }
    }

    /// Cache key for a call type over the given source text.
    pub fn key(&self, call_type: &str, text: &str) -> String {
        let mut hasher = Md5::new();
        hasher.update(text.as_bytes());
        let digest = hasher.finalize();
        format!(
            "llm:{}:{}:{:x}",
            self.prompt_version, call_type, digest
        )
    }

    pub async fn get(&self, call_type: &str, text: &str) -> Result<Option<String>> {
        let key = self.key(call_type, text);
        let hit = self.kv.get(&key).await?;
        if hit.is_some() {
            debug!(call_type, "llm response cache hit");
        }
        Ok(hit)
    }

    pub async fn put(&self, call_type: &str, text: &str, response: &str) -> Result<()> {
        let key = self.key(call_type, text);
        self.kv.set(&key, response, Some(self.ttl_secs)).await
    }

    /// Drop every entry for the current prompt version.
    pub async fn invalidate_all(&self) -> Result<u64> {
        self.kv
            .delete_prefix(&format!("llm:{}:", self.prompt_version))
            .await
    }
}

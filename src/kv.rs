//! Key-value store seam for caching, rate limiting, and job state.
//!
//! The concrete store is an external collaborator (typically Redis); this
//! module defines the trait the core depends on plus an in-process
//! implementation used in tests and single-binary deployments. The trait
//! covers exactly the shapes the pipeline consumes: string values with TTL,
//! sorted sets for sliding windows, and hash maps for job state.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::Result;

/// Minimal key-value interface the core requires.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Set a string value, optionally with a TTL in seconds.
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()>;

    /// Get a string value, honoring expiry.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete a key of any shape. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete every key starting with `prefix`; returns the count removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// Add a member with a score to a sorted set.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// Remove members with scores in `[min, max]`; returns the count removed.
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64>;

    /// Number of members in a sorted set.
    async fn zcard(&self, key: &str) -> Result<u64>;

    /// Lowest score in a sorted set, if non-empty.
    async fn zmin_score(&self, key: &str) -> Result<Option<f64>>;

    /// Replace all fields of a hash map.
    async fn hset_all(&self, key: &str, fields: &HashMap<String, String>) -> Result<()>;

    /// Read all fields of a hash map.
    async fn hgetall(&self, key: &str) -> Result<Option<HashMap<String, String>>>;

    /// Set or refresh a TTL on an existing key.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()>;
}

enum Entry {
    Value(String),
    SortedSet(BTreeMap<String, f64>),
    Hash(HashMap<String, String>),
}

struct Slot {
    entry: Entry,
    expires_at: Option<DateTime<Utc>>,
}

impl Slot {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process [`KvStore`] with per-key expiry.
#[derive(Clone)]
pub struct MemoryKvStore {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn ttl_to_deadline(ttl_secs: Option<u64>) -> Option<DateTime<Utc>> {
        ttl_secs.map(|s| Utc::now() + Duration::seconds(s as i64))
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let mut slots = self.slots.lock().await;
        slots.insert(
            key.to_string(),
            Slot {
                entry: Entry::Value(value.to_string()),
                expires_at: Self::ttl_to_deadline(ttl_secs),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut slots = self.slots.lock().await;
        let now = Utc::now();
        match slots.get(key) {
            Some(slot) if slot.is_expired(now) => {
                slots.remove(key);
                Ok(None)
            }
            Some(Slot {
                entry: Entry::Value(v),
                ..
            }) => Ok(Some(v.clone())),
            _ => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut slots = self.slots.lock().await;
        Ok(slots.remove(key).is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut slots = self.slots.lock().await;
        let keys: Vec<String> = slots
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        let count = keys.len() as u64;
        for key in keys {
            slots.remove(&key);
        }
        Ok(count)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut slots = self.slots.lock().await;
        let now = Utc::now();
        let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
            entry: Entry::SortedSet(BTreeMap::new()),
            expires_at: None,
        });
        if slot.is_expired(now) {
            slot.entry = Entry::SortedSet(BTreeMap::new());
            slot.expires_at = None;
        }
        if let Entry::SortedSet(set) = &mut slot.entry {
            set.insert(member.to_string(), score);
        } else {
            slot.entry = Entry::SortedSet(BTreeMap::from([(member.to_string(), score)]));
        }
        Ok(())
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.get_mut(key) else {
            return Ok(0);
        };
        if let Entry::SortedSet(set) = &mut slot.entry {
            let before = set.len();
            set.retain(|_, score| *score < min || *score > max);
            Ok((before - set.len()) as u64)
        } else {
            Ok(0)
        }
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut slots = self.slots.lock().await;
        let now = Utc::now();
        match slots.get(key) {
            Some(slot) if slot.is_expired(now) => {
                slots.remove(key);
                Ok(0)
            }
            Some(Slot {
                entry: Entry::SortedSet(set),
                ..
            }) => Ok(set.len() as u64),
            _ => Ok(0),
        }
    }

    async fn zmin_score(&self, key: &str) -> Result<Option<f64>> {
        let slots = self.slots.lock().await;
        match slots.get(key) {
            Some(Slot {
                entry: Entry::SortedSet(set),
                ..
            }) => Ok(set
                .values()
                .fold(None, |min: Option<f64>, &s| {
                    Some(min.map_or(s, |m| m.min(s)))
                })),
            _ => Ok(None),
        }
    }

    async fn hset_all(&self, key: &str, fields: &HashMap<String, String>) -> Result<()> {
        let mut slots = self.slots.lock().await;
        let expires_at = slots.get(key).and_then(|s| s.expires_at);
        slots.insert(
            key.to_string(),
            Slot {
                entry: Entry::Hash(fields.clone()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        let mut slots = self.slots.lock().await;
        let now = Utc::now();
        match slots.get(key) {
            Some(slot) if slot.is_expired(now) => {
                slots.remove(key);
                Ok(None)
            }
            Some(Slot {
                entry: Entry::Hash(map),
                ..
            }) => Ok(Some(map.clone())),
            _ => Ok(None),
        }
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get_mut(key) {
            slot.expires_at = Self::ttl_to_deadline(Some(ttl_secs));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let kv = MemoryKvStore::new();
        kv.set("a", "1", None).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some("1".to_string()));
        assert!(kv.delete("a").await.unwrap());
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let kv = MemoryKvStore::new();
        kv.set("a", "1", Some(0)).await.unwrap();
        // Zero TTL expires immediately.
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let kv = MemoryKvStore::new();
        kv.set("cache:entity:u1:name:redis", "x", None).await.unwrap();
        kv.set("cache:entity:u1:name:postgres", "y", None).await.unwrap();
        kv.set("cache:agent:u1:summary", "z", None).await.unwrap();

        let removed = kv.delete_prefix("cache:entity:u1:").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(kv.get("cache:agent:u1:summary").await.unwrap(), Some("z".into()));
    }

    #[tokio::test]
    async fn test_sorted_set_window_ops() {
        let kv = MemoryKvStore::new();
        for (i, score) in [1.0, 2.0, 3.0, 10.0].iter().enumerate() {
            kv.zadd("win", &format!("m{i}"), *score).await.unwrap();
        }
        assert_eq!(kv.zcard("win").await.unwrap(), 4);
        assert_eq!(kv.zmin_score("win").await.unwrap(), Some(1.0));

        let removed = kv.zremrangebyscore("win", 0.0, 2.5).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(kv.zcard("win").await.unwrap(), 2);
        assert_eq!(kv.zmin_score("win").await.unwrap(), Some(3.0));
    }

    #[tokio::test]
    async fn test_hash_roundtrip() {
        let kv = MemoryKvStore::new();
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), "running".to_string());
        fields.insert("processed_files".to_string(), "3".to_string());
        kv.hset_all("import:current_job", &fields).await.unwrap();
        kv.expire("import:current_job", 3600).await.unwrap();

        let read = kv.hgetall("import:current_job").await.unwrap().unwrap();
        assert_eq!(read.get("status").map(String::as_str), Some("running"));
    }
}

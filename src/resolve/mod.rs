//! Entity resolution: collapsing name variants onto one graph node.
//!
//! The cascade runs cheapest-first and returns on the first hit:
//! exact (user-scoped, then global) → canonical-name rewrite → alias set →
//! fuzzy token-sort ratio over full-text candidates (paged scan fallback)
//! → embedding similarity → create new. Per-type thresholds keep files
//! near-exact while concepts tolerate phrasing drift. Results are cached
//! in the KV store for five minutes, misses included; any entity write
//! invalidates the cache.

mod fuzzy;
mod merge;
mod registry;

pub use fuzzy::token_sort_ratio;
pub use merge::{merge_duplicate_entities, MergeReport};
pub use registry::RegistryLookup;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::graph::{Entity, GraphStore};
use crate::kv::KvStore;
use crate::llm::{cosine_similarity, EmbeddingProvider, EmbeddingRequest};
use crate::ontology::{get_canonical_name, normalize_entity_name, EntityType};

const CACHE_TTL_SECS: u64 = 300;
const NEGATIVE_MARKER: &str = "__miss__";
const SCAN_BATCH: u64 = 100;
const SCAN_CAP: u64 = 500;

/// How a name was matched to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Cached,
    Exact,
    Canonical,
    Alias,
    Fuzzy,
    Embedding,
    New,
}

impl MatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::Exact => "exact",
            Self::Canonical => "canonical",
            Self::Alias => "alias",
            Self::Fuzzy => "fuzzy",
            Self::Embedding => "embedding",
            Self::New => "new",
        }
    }
}

/// Result of resolving one `(name, type)` input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedEntity {
    pub id: String,
    pub name: String,
    pub entity_type: EntityType,
    pub is_new: bool,
    pub match_method: MatchMethod,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_name: Option<String>,
    pub aliases: Vec<String>,
}

impl ResolvedEntity {
    fn from_entity(entity: &Entity, method: MatchMethod, confidence: f64) -> Self {
        Self {
            id: entity.id.clone(),
            name: entity.name.clone(),
            entity_type: entity.entity_type,
            is_new: false,
            match_method: method,
            confidence,
            canonical_name: None,
            aliases: entity.aliases.clone(),
        }
    }
}

/// Multi-stage entity resolver, scoped to one user.
pub struct EntityResolver {
    store: Arc<GraphStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    kv: Arc<dyn KvStore>,
    user_id: String,
}

impl EntityResolver {
    pub fn new(
        store: Arc<GraphStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        kv: Arc<dyn KvStore>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            embedder,
            kv,
            user_id: user_id.into(),
        }
    }

    fn cache_key(&self, kind: &str, norm: &str) -> String {
        format!("cache:entity:{}:{kind}:{norm}", self.user_id)
    }

    async fn cache_get(&self, norm: &str, entity_type: EntityType) -> Option<ResolvedEntity> {
        let value = self.kv.get(&self.cache_key("name", norm)).await.ok()??;
        if value == NEGATIVE_MARKER {
            return None;
        }
        let mut resolved: ResolvedEntity = serde_json::from_str(&value).ok()?;
        // A cached resolution of the same name under a different type does
        // not answer this request; fall through to the cascade.
        if resolved.entity_type != entity_type {
            return None;
        }
        resolved.match_method = MatchMethod::Cached;
        resolved.is_new = false;
        Some(resolved)
    }

    async fn cache_put(&self, norm: &str, resolved: &ResolvedEntity) {
        if let Ok(json) = serde_json::to_string(resolved) {
            let _ = self
                .kv
                .set(&self.cache_key("name", norm), &json, Some(CACHE_TTL_SECS))
                .await;
        }
    }

    async fn cache_put_negative(&self, norm: &str) {
        let _ = self
            .kv
            .set(
                &self.cache_key("name", norm),
                NEGATIVE_MARKER,
                Some(CACHE_TTL_SECS),
            )
            .await;
    }

    /// Drop all of this user's entity-resolution cache entries.
    pub async fn invalidate_cache(&self) -> Result<u64> {
        self.kv
            .delete_prefix(&format!("cache:entity:{}:", self.user_id))
            .await
    }

    /// Steps 1-5 of the cascade: find an existing entity for `(name, type)`
    /// without creating one.
    async fn find_existing(
        &self,
        name: &str,
        entity_type: EntityType,
    ) -> Result<Option<ResolvedEntity>> {
        let norm = normalize_entity_name(name);

        // 1. Exact: user-scoped, then global.
        if let Some(e) = self.store.find_entity_exact(&self.user_id, &norm, true)? {
            return Ok(Some(ResolvedEntity::from_entity(&e, MatchMethod::Exact, 1.0)));
        }
        if let Some(e) = self.store.find_entity_exact(&self.user_id, &norm, false)? {
            return Ok(Some(ResolvedEntity::from_entity(&e, MatchMethod::Exact, 1.0)));
        }

        // 2. Canonical rewrite, then exact again.
        let canonical = get_canonical_name(name);
        let canonical_norm = normalize_entity_name(&canonical);
        if canonical_norm != norm {
            if let Some(e) = self
                .store
                .find_entity_exact(&self.user_id, &canonical_norm, false)?
            {
                let mut resolved =
                    ResolvedEntity::from_entity(&e, MatchMethod::Canonical, 1.0);
                resolved.canonical_name = Some(canonical.clone());
                return Ok(Some(resolved));
            }
        }

        // 3. Alias sets.
        if let Some(e) = self.store.find_entity_by_alias(&self.user_id, &norm)? {
            return Ok(Some(ResolvedEntity::from_entity(&e, MatchMethod::Alias, 0.95)));
        }

        // 4. Fuzzy over full-text candidates, paged scan as fallback.
        let threshold = entity_type.fuzzy_threshold();
        let mut candidates = self
            .store
            .entity_candidates_fulltext(&self.user_id, name, SCAN_BATCH)?;
        if candidates.is_empty() {
            let mut offset = 0u64;
            while offset < SCAN_CAP {
                let page = self.store.entities_page(&self.user_id, offset, SCAN_BATCH)?;
                if page.is_empty() {
                    break;
                }
                offset += page.len() as u64;
                candidates.extend(page);
            }
        }
        let mut best: Option<(Entity, f64)> = None;
        for candidate in candidates
            .into_iter()
            .filter(|c| c.entity_type == entity_type)
        {
            let score = token_sort_ratio(&norm, &normalize_entity_name(&candidate.name));
            if score >= threshold && best.as_ref().map_or(true, |(_, s)| score > *s) {
                best = Some((candidate, score));
            }
        }
        if let Some((entity, score)) = best {
            debug!(name, matched = %entity.name, score, "fuzzy entity match");
            return Ok(Some(ResolvedEntity::from_entity(
                &entity,
                MatchMethod::Fuzzy,
                score,
            )));
        }

        // 5. Embedding similarity over stored entity vectors.
        let embed_threshold = entity_type.embedding_threshold();
        let query_text = format!("{entity_type}: {name}");
        if let Ok(response) = self.embedder.embed(EmbeddingRequest::query(query_text)).await {
            if let Some(query) = response.embeddings.first() {
                let mut best: Option<(Entity, f64)> = None;
                for candidate in self
                    .store
                    .entities_with_embeddings(&self.user_id)?
                    .into_iter()
                    .filter(|c| c.entity_type == entity_type)
                {
                    let Some(embedding) = candidate.embedding.as_deref() else {
                        continue;
                    };
                    let score = cosine_similarity(query, embedding);
                    if score >= embed_threshold
                        && best.as_ref().map_or(true, |(_, s)| score > *s)
                    {
                        best = Some((candidate, score));
                    }
                }
                if let Some((entity, score)) = best {
                    debug!(name, matched = %entity.name, score, "embedding entity match");
                    return Ok(Some(ResolvedEntity::from_entity(
                        &entity,
                        MatchMethod::Embedding,
                        score,
                    )));
                }
            }
        }

        Ok(None)
    }

    /// Find an existing entity without creating one. Misses are cached
    /// negatively to suppress repeated cascades.
    pub async fn lookup(
        &self,
        name: &str,
        entity_type: EntityType,
    ) -> Result<Option<ResolvedEntity>> {
        let norm = normalize_entity_name(name);
        if let Some(hit) = self.cache_get(&norm, entity_type).await {
            return Ok(Some(hit));
        }
        match self.find_existing(name, entity_type).await? {
            Some(resolved) => {
                self.cache_put(&norm, &resolved).await;
                Ok(Some(resolved))
            }
            None => {
                self.cache_put_negative(&norm).await;
                Ok(None)
            }
        }
    }

    /// Full cascade: resolve `(name, type)`, creating the entity when no
    /// stage matches. Idempotent: a second call returns the same id via
    /// the cache or an exact hit.
    pub async fn resolve(&self, name: &str, entity_type: EntityType) -> Result<ResolvedEntity> {
        let norm = normalize_entity_name(name);
        if let Some(hit) = self.cache_get(&norm, entity_type).await {
            return Ok(hit);
        }

        if let Some(resolved) = self.find_existing(name, entity_type).await? {
            self.cache_put(&norm, &resolved).await;
            return Ok(resolved);
        }

        // 6. New entity, under its canonical name when one exists.
        let canonical = get_canonical_name(name);
        let mut entity = Entity::new(canonical.clone(), entity_type);
        entity.user_id = Some(self.user_id.clone());
        if normalize_entity_name(&canonical) != norm {
            entity.aliases.push(name.to_string());
        }
        if let Ok(response) = self
            .embedder
            .embed(EmbeddingRequest::passages(vec![entity.embedding_text()]))
            .await
        {
            entity.embedding = response.embeddings.into_iter().next();
        }
        self.store.insert_entity(&entity)?;
        debug!(name, id = %entity.id, "created new entity");

        let resolved = ResolvedEntity {
            id: entity.id.clone(),
            name: entity.name.clone(),
            entity_type,
            is_new: true,
            match_method: MatchMethod::New,
            confidence: 1.0,
            canonical_name: (canonical != name).then_some(canonical),
            aliases: entity.aliases.clone(),
        };
        self.cache_put(&norm, &resolved).await;
        Ok(resolved)
    }

    /// Resolve a batch, memoizing on normalized and canonical forms so
    /// "postgres" and "PostgreSQL" in one batch hit the store once.
    pub async fn resolve_batch(
        &self,
        inputs: &[(String, EntityType)],
    ) -> Result<Vec<ResolvedEntity>> {
        let mut seen: HashMap<String, ResolvedEntity> = HashMap::new();
        let mut results = Vec::with_capacity(inputs.len());

        for (name, entity_type) in inputs {
            let norm = normalize_entity_name(name);
            let canonical_norm = normalize_entity_name(&get_canonical_name(name));

            if let Some(hit) = seen.get(&norm).or_else(|| seen.get(&canonical_norm)) {
                results.push(hit.clone());
                continue;
            }
            let resolved = self.resolve(name, *entity_type).await?;
            seen.insert(norm, resolved.clone());
            seen.insert(canonical_norm, resolved.clone());
            results.push(resolved);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use crate::llm::testing::StaticEmbedder;
    use pretty_assertions::assert_eq;

    fn resolver() -> (EntityResolver, Arc<GraphStore>) {
        let store = Arc::new(GraphStore::in_memory().unwrap());
        let resolver = EntityResolver::new(
            store.clone(),
            Arc::new(StaticEmbedder::new()),
            Arc::new(MemoryKvStore::new()),
            "u1",
        );
        (resolver, store)
    }

    #[tokio::test]
    async fn test_new_then_exact_then_cached() {
        let (resolver, store) = resolver();

        let first = resolver
            .resolve("PostgreSQL", EntityType::Technology)
            .await
            .unwrap();
        assert!(first.is_new);
        assert_eq!(first.match_method, MatchMethod::New);
        assert_eq!(store.count_entities("u1").unwrap(), 1);

        // Idempotence: same id, no new node, resolved from the cache.
        let second = resolver
            .resolve("PostgreSQL", EntityType::Technology)
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert!(matches!(
            second.match_method,
            MatchMethod::Cached | MatchMethod::Exact
        ));
        assert_eq!(store.count_entities("u1").unwrap(), 1);

        // After a cache flush it still resolves exactly.
        resolver.invalidate_cache().await.unwrap();
        let third = resolver
            .resolve("PostgreSQL", EntityType::Technology)
            .await
            .unwrap();
        assert_eq!(third.id, first.id);
        assert_eq!(third.match_method, MatchMethod::Exact);
    }

    #[tokio::test]
    async fn test_canonical_collapses_variants() {
        let (resolver, store) = resolver();

        let created = resolver
            .resolve("postgres", EntityType::Technology)
            .await
            .unwrap();
        // Created under the canonical name with the input as alias.
        assert_eq!(created.name, "PostgreSQL");
        assert_eq!(created.aliases, vec!["postgres".to_string()]);

        let variant = resolver
            .resolve("PostgreSQL", EntityType::Technology)
            .await
            .unwrap();
        assert_eq!(variant.id, created.id);
        assert_eq!(store.count_entities("u1").unwrap(), 1);

        // A different alias goes through the canonical rewrite.
        let pg = resolver.resolve("pg", EntityType::Technology).await.unwrap();
        assert_eq!(pg.id, created.id);
        assert_eq!(pg.match_method, MatchMethod::Canonical);
    }

    #[tokio::test]
    async fn test_fuzzy_matches_same_type_only() {
        let (resolver, store) = resolver();
        let mut existing = Entity::new("repository pattern", EntityType::Pattern);
        existing.user_id = Some("u1".into());
        store.insert_entity(&existing).unwrap();

        let hit = resolver
            .resolve("pattern repository", EntityType::Pattern)
            .await
            .unwrap();
        assert_eq!(hit.id, existing.id);
        assert_eq!(hit.match_method, MatchMethod::Fuzzy);

        // Same words typed as a different entity type resolve to a new node.
        let other = resolver
            .resolve("pattern repository", EntityType::System)
            .await
            .unwrap();
        assert_ne!(other.id, existing.id);
    }

    #[tokio::test]
    async fn test_alias_match() {
        let (resolver, store) = resolver();
        let mut e = Entity::new("Kubernetes", EntityType::Technology);
        e.user_id = Some("u1".into());
        e.aliases = vec!["kube".into()];
        store.insert_entity(&e).unwrap();

        let hit = resolver.resolve("kube", EntityType::Technology).await.unwrap();
        assert_eq!(hit.id, e.id);
        assert_eq!(hit.match_method, MatchMethod::Alias);
    }

    #[tokio::test]
    async fn test_lookup_caches_negative() {
        let (resolver, _store) = resolver();
        assert!(resolver
            .lookup("never-seen", EntityType::Technology)
            .await
            .unwrap()
            .is_none());
        // Second lookup hits the negative marker (still a miss).
        assert!(resolver
            .lookup("never-seen", EntityType::Technology)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_batch_memoizes_canonical_variants() {
        let (resolver, store) = resolver();
        let inputs = vec![
            ("postgres".to_string(), EntityType::Technology),
            ("PostgreSQL".to_string(), EntityType::Technology),
            ("Redis".to_string(), EntityType::Technology),
        ];
        let resolved = resolver.resolve_batch(&inputs).await.unwrap();
        assert_eq!(resolved.len(), 3);
        assert_eq!(resolved[0].id, resolved[1].id);
        assert_eq!(store.count_entities("u1").unwrap(), 2);
    }
}

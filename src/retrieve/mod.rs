//! Hybrid retrieval: lexical + semantic fusion with optional graph
//! expansion and reranking.
//!
//! Lexical scores come from the full-text index (raw score / 10, clipped
//! to [0,1]); semantic scores from a cosine scan over stored embeddings.
//! `alpha` mixes the two: 1.0 is lexical-only, 0.0 semantic-only. Graph
//! expansion pulls 1-2 hop neighbors in at a 0.7 discount; reranking
//! replaces the combined score for the top slice with a cross-encoder
//! verdict. Plain semantic search is the `alpha = 0`, depth 0, no-rerank
//! specialization.

mod rerank;

pub use rerank::{NimReranker, Reranker};

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::graph::{DecisionTrace, Entity, GraphStore, NodeKind};
use crate::llm::{cosine_similarity, EmbeddingProvider, EmbeddingRequest};
use crate::ontology::RelationType;

const LEXICAL_CANDIDATES: u64 = 50;

/// A hybrid search request.
#[derive(Debug, Clone)]
pub struct HybridQuery {
    pub query: String,
    pub top_k: usize,
    /// Combined-score floor; hits below are dropped.
    pub threshold: f64,
    /// Lexical/semantic mix in [0, 1]: `α·lexical + (1-α)·semantic`.
    pub alpha: f64,
    pub include_decisions: bool,
    pub include_entities: bool,
    /// 0 = no expansion; 1-2 = neighbor hops.
    pub graph_depth: u8,
    pub rerank: bool,
}

impl Default for HybridQuery {
    fn default() -> Self {
        Self {
            query: String::new(),
            top_k: 10,
            threshold: 0.0,
            alpha: 0.5,
            include_decisions: true,
            include_entities: true,
            graph_depth: 0,
            rerank: false,
        }
    }
}

impl HybridQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    /// The plain semantic-search specialization.
    pub fn semantic(query: impl Into<String>, top_k: usize, threshold: f64) -> Self {
        Self {
            query: query.into(),
            top_k,
            threshold,
            alpha: 0.0,
            graph_depth: 0,
            rerank: false,
            ..Self::default()
        }
    }
}

/// One retrieval result.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalHit {
    pub id: String,
    pub kind: NodeKind,
    pub title: String,
    pub combined: f64,
    pub lexical: f64,
    pub semantic: f64,
    pub matched_fields: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionTrace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<Entity>,
}

/// Blend a lexical and a semantic score.
pub fn combine_scores(lexical: f64, semantic: f64, alpha: f64) -> f64 {
    let a = alpha.clamp(0.0, 1.0);
    a * lexical + (1.0 - a) * semantic
}

/// Normalize a raw full-text score: divide by 10, clip to [0, 1].
fn normalize_lexical(raw: f64) -> f64 {
    (raw / 10.0).clamp(0.0, 1.0)
}

fn decision_matched_fields(decision: &DecisionTrace, query: &str) -> BTreeSet<String> {
    let terms: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(String::from)
        .collect();
    let mut fields = BTreeSet::new();
    for (name, text) in [
        ("trigger", &decision.trigger),
        ("decision", &decision.agent_decision),
        ("context", &decision.context),
        ("rationale", &decision.agent_rationale),
    ] {
        let lower = text.to_lowercase();
        if terms.iter().any(|t| lower.contains(t)) {
            fields.insert(name.to_string());
        }
    }
    fields
}

/// Lexical + vector search over one user's graph.
pub struct HybridRetriever {
    store: Arc<GraphStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    reranker: Option<Arc<dyn Reranker>>,
    reranking_top_k: usize,
}

impl HybridRetriever {
    pub fn new(
        store: Arc<GraphStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        reranking_top_k: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            reranker: None,
            reranking_top_k,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Execute a hybrid query for `user_id`.
    pub async fn search(&self, user_id: &str, query: &HybridQuery) -> Result<Vec<RetrievalHit>> {
        if query.query.trim().is_empty() {
            return Ok(Vec::new());
        }

        // Embed the query; a failed embedding degrades to lexical-only.
        let query_embedding = match self
            .embedder
            .embed(EmbeddingRequest::query(query.query.clone()))
            .await
        {
            Ok(response) => response.embeddings.into_iter().next(),
            Err(e) => {
                warn!(error = %e, "query embedding failed, lexical-only search");
                None
            }
        };

        let mut hits: HashMap<String, RetrievalHit> = HashMap::new();

        // Lexical pass.
        if query.include_decisions {
            for (decision, raw) in
                self.store
                    .fulltext_decisions(user_id, &query.query, LEXICAL_CANDIDATES)?
            {
                let entry = hits.entry(decision.id.clone()).or_insert_with(|| {
                    RetrievalHit {
                        id: decision.id.clone(),
                        kind: NodeKind::Decision,
                        title: decision.agent_decision.clone(),
                        combined: 0.0,
                        lexical: 0.0,
                        semantic: 0.0,
                        matched_fields: decision_matched_fields(&decision, &query.query),
                        decision: Some(decision.clone()),
                        entity: None,
                    }
                });
                entry.lexical = normalize_lexical(raw);
            }
        }
        if query.include_entities {
            for (entity, raw) in
                self.store
                    .fulltext_entities(user_id, &query.query, LEXICAL_CANDIDATES)?
            {
                let entry = hits.entry(entity.id.clone()).or_insert_with(|| RetrievalHit {
                    id: entity.id.clone(),
                    kind: NodeKind::Entity,
                    title: entity.name.clone(),
                    combined: 0.0,
                    lexical: 0.0,
                    semantic: 0.0,
                    matched_fields: BTreeSet::from(["name".to_string()]),
                    decision: None,
                    entity: Some(entity.clone()),
                });
                entry.lexical = normalize_lexical(raw);
            }
        }

        // Semantic pass: manual cosine scan over stored embeddings.
        if let Some(embedding) = query_embedding.as_deref() {
            if query.include_decisions {
                for decision in self.store.decisions_with_embeddings(user_id)? {
                    let Some(vector) = decision.embedding.as_deref() else {
                        continue;
                    };
                    let score = cosine_similarity(embedding, vector);
                    if score <= 0.0 {
                        continue;
                    }
                    let entry = hits.entry(decision.id.clone()).or_insert_with(|| {
                        RetrievalHit {
                            id: decision.id.clone(),
                            kind: NodeKind::Decision,
                            title: decision.agent_decision.clone(),
                            combined: 0.0,
                            lexical: 0.0,
                            semantic: 0.0,
                            matched_fields: BTreeSet::new(),
                            decision: Some(decision.clone()),
                            entity: None,
                        }
                    });
                    entry.semantic = score;
                }
            }
            if query.include_entities {
                for entity in self.store.entities_with_embeddings(user_id)? {
                    let Some(vector) = entity.embedding.as_deref() else {
                        continue;
                    };
                    let score = cosine_similarity(embedding, vector);
                    if score <= 0.0 {
                        continue;
                    }
                    let entry =
                        hits.entry(entity.id.clone()).or_insert_with(|| RetrievalHit {
                            id: entity.id.clone(),
                            kind: NodeKind::Entity,
                            title: entity.name.clone(),
                            combined: 0.0,
                            lexical: 0.0,
                            semantic: 0.0,
                            matched_fields: BTreeSet::new(),
                            decision: None,
                            entity: Some(entity.clone()),
                        });
                    entry.semantic = score;
                }
            }
        }

        // Combine, then expand the neighborhood of what scored.
        for hit in hits.values_mut() {
            hit.combined = combine_scores(hit.lexical, hit.semantic, query.alpha);
        }
        if query.graph_depth > 0 {
            self.expand_graph(user_id, &mut hits, query.graph_depth)?;
        }

        let mut results: Vec<RetrievalHit> = hits
            .into_values()
            .filter(|h| h.combined >= query.threshold)
            .collect();
        results.sort_by(|a, b| {
            b.combined
                .partial_cmp(&a.combined)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if query.rerank {
            if let Some(reranker) = &self.reranker {
                let slice = query.top_k.min(self.reranking_top_k).min(results.len());
                let documents: Vec<String> =
                    results[..slice].iter().map(rerank_text).collect();
                match reranker.rerank(&query.query, &documents).await {
                    Ok(scores) => {
                        for (hit, score) in results[..slice].iter_mut().zip(scores) {
                            hit.combined = score;
                        }
                        results.sort_by(|a, b| {
                            b.combined
                                .partial_cmp(&a.combined)
                                .unwrap_or(std::cmp::Ordering::Equal)
                        });
                    }
                    Err(e) => warn!(error = %e, "reranking failed, keeping fused order"),
                }
            }
        }

        results.truncate(query.top_k);
        debug!(
            query = %query.query,
            alpha = query.alpha,
            results = results.len(),
            "hybrid search completed"
        );
        Ok(results)
    }

    /// Plain semantic search endpoint.
    pub async fn semantic_search(
        &self,
        user_id: &str,
        query: &str,
        top_k: usize,
        threshold: f64,
    ) -> Result<Vec<RetrievalHit>> {
        self.search(user_id, &HybridQuery::semantic(query, top_k, threshold))
            .await
    }

    /// Pull 1-2 hop neighbors of current hits into the result set at a
    /// 0.7 score discount per hop.
    fn expand_graph(
        &self,
        user_id: &str,
        hits: &mut HashMap<String, RetrievalHit>,
        depth: u8,
    ) -> Result<()> {
        let relations = [
            RelationType::Involves,
            RelationType::Follows,
            RelationType::Precedes,
            RelationType::RelatedTo,
        ];

        let mut frontier: Vec<(String, f64)> = hits
            .values()
            .map(|h| (h.id.clone(), h.combined))
            .collect();

        for _ in 0..depth.min(2) {
            let mut next_frontier = Vec::new();
            for (origin_id, origin_score) in &frontier {
                for neighbor in self.store.neighbors(origin_id, Some(&relations), 25)? {
                    if hits.contains_key(&neighbor.other_id) {
                        continue;
                    }
                    let score = origin_score * 0.7;
                    let hit = match neighbor.other_kind {
                        NodeKind::Decision => {
                            let Some(decision) =
                                self.store.get_decision(user_id, &neighbor.other_id)?
                            else {
                                continue;
                            };
                            RetrievalHit {
                                id: decision.id.clone(),
                                kind: NodeKind::Decision,
                                title: decision.agent_decision.clone(),
                                combined: score,
                                lexical: 0.0,
                                semantic: 0.0,
                                matched_fields: BTreeSet::from(["graph_expansion".to_string()]),
                                decision: Some(decision),
                                entity: None,
                            }
                        }
                        NodeKind::Entity => {
                            let Some(entity) =
                                self.store.get_entity(user_id, &neighbor.other_id)?
                            else {
                                continue;
                            };
                            RetrievalHit {
                                id: entity.id.clone(),
                                kind: NodeKind::Entity,
                                title: entity.name.clone(),
                                combined: score,
                                lexical: 0.0,
                                semantic: 0.0,
                                matched_fields: BTreeSet::from(["graph_expansion".to_string()]),
                                decision: None,
                                entity: Some(entity),
                            }
                        }
                        _ => continue,
                    };
                    next_frontier.push((hit.id.clone(), score));
                    hits.insert(hit.id.clone(), hit);
                }
            }
            frontier = next_frontier;
            if frontier.is_empty() {
                break;
            }
        }
        Ok(())
    }
}

/// Concatenated candidate text for the reranker.
fn rerank_text(hit: &RetrievalHit) -> String {
    match &hit.decision {
        Some(d) => format!(
            "Trigger: {} Decision: {} Rationale: {} Context: {}",
            d.trigger, d.agent_decision, d.agent_rationale, d.context
        ),
        None => hit.title.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::rerank::testing::WordOverlapReranker;
    use super::*;
    use crate::llm::testing::StaticEmbedder;
    use crate::ontology::EntityType;
    use pretty_assertions::assert_eq;

    fn retriever() -> (HybridRetriever, Arc<GraphStore>, StaticEmbedder) {
        let store = Arc::new(GraphStore::in_memory().unwrap());
        let embedder = StaticEmbedder::new();
        let retriever = HybridRetriever::new(
            store.clone(),
            Arc::new(StaticEmbedder::new()),
            20,
        );
        (retriever, store, embedder)
    }

    fn decision(store: &GraphStore, trigger: &str, text: &str, embedding: Option<Vec<f32>>) -> DecisionTrace {
        let mut d = DecisionTrace::new(trigger, text);
        d.user_id = Some("u1".into());
        d.embedding = embedding;
        store.insert_decision(&d).unwrap();
        d
    }

    #[test]
    fn test_combine_scores_scenario() {
        // D1: lexical-only (0.9, 0.1); D2: semantic-only (0.1, 0.9).
        let d1 = |alpha| combine_scores(0.9, 0.1, alpha);
        let d2 = |alpha| combine_scores(0.1, 0.9, alpha);

        // α = 0.3 favors semantics: D2 wins 0.66 vs 0.34.
        assert!((d2(0.3) - 0.66).abs() < 1e-9);
        assert!((d1(0.3) - 0.34).abs() < 1e-9);
        assert!(d2(0.3) > d1(0.3));

        // α = 0.8 favors lexical: D1 wins 0.74 vs 0.26.
        assert!((d1(0.8) - 0.74).abs() < 1e-9);
        assert!((d2(0.8) - 0.26).abs() < 1e-9);
        assert!(d1(0.8) > d2(0.8));
    }

    #[tokio::test]
    async fn test_alpha_extremes_flip_ranking() {
        let (retriever, store, embedder) = retriever();
        // Lexical match for "message broker" with an embedding unrelated
        // to the query text.
        decision(
            &store,
            "Need a message broker",
            "Adopt Kafka as the broker",
            Some(embedder.vector_for("totally unrelated topic")),
        );
        // No lexical overlap, but embedded exactly like the query.
        let semantic_twin = decision(
            &store,
            "Queueing infrastructure",
            "Introduce an event log",
            Some(embedder.vector_for("message broker")),
        );

        let mut query = HybridQuery::new("message broker");
        query.alpha = 0.0;
        let semantic_first = retriever.search("u1", &query).await.unwrap();
        assert_eq!(semantic_first[0].id, semantic_twin.id);

        query.alpha = 1.0;
        let lexical_first = retriever.search("u1", &query).await.unwrap();
        assert_eq!(lexical_first[0].title, "Adopt Kafka as the broker");
        assert!(lexical_first[0].matched_fields.contains("trigger"));
    }

    #[tokio::test]
    async fn test_threshold_drops_weak_hits() {
        let (retriever, store, embedder) = retriever();
        decision(
            &store,
            "Logging format",
            "Use structured logs",
            Some(embedder.vector_for("structured logging")),
        );

        let mut query = HybridQuery::new("zebra migration patterns");
        query.threshold = 0.95;
        let results = retriever.search("u1", &query).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_graph_expansion_discounts_neighbors() {
        let (retriever, store, embedder) = retriever();
        let d = decision(
            &store,
            "Need a message broker",
            "Adopt Kafka as the broker",
            Some(embedder.vector_for("message broker")),
        );
        let mut entity = Entity::new("Apache Kafka", EntityType::Technology);
        entity.user_id = Some("u1".into());
        store.insert_entity(&entity).unwrap();
        store
            .merge_edge(&crate::graph::Edge::new(
                d.id.clone(),
                NodeKind::Decision,
                entity.id.clone(),
                NodeKind::Entity,
                RelationType::Involves,
            ))
            .unwrap();

        let mut query = HybridQuery::new("message broker");
        query.include_entities = false; // entity only reachable via expansion
        query.graph_depth = 1;
        let results = retriever.search("u1", &query).await.unwrap();

        let origin = results.iter().find(|h| h.id == d.id).unwrap();
        let expanded = results.iter().find(|h| h.id == entity.id).unwrap();
        assert!(expanded.matched_fields.contains("graph_expansion"));
        assert!((expanded.combined - origin.combined * 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reranker_overrides_fused_order() {
        let (retriever, store, embedder) = retriever();
        let retriever = retriever.with_reranker(Arc::new(WordOverlapReranker));
        decision(
            &store,
            "Rate limiting approach",
            "Sliding window rate limiting in Redis",
            Some(embedder.vector_for("rate limiting")),
        );
        decision(
            &store,
            "Rate limiting approach",
            "No limits for now",
            Some(embedder.vector_for("rate limiting")),
        );

        let mut query = HybridQuery::new("sliding window rate limiting");
        query.rerank = true;
        let results = retriever.search("u1", &query).await.unwrap();
        assert_eq!(results[0].title, "Sliding window rate limiting in Redis");
        // Reranker scores are word-overlap fractions.
        assert!(results[0].combined > results[1].combined);
    }

    #[tokio::test]
    async fn test_semantic_endpoint_is_alpha_zero() {
        let (retriever, store, embedder) = retriever();
        let d = decision(
            &store,
            "Caching",
            "Use Redis for caching",
            Some(embedder.vector_for("cache layer")),
        );
        let results = retriever
            .semantic_search("u1", "cache layer", 5, 0.5)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, d.id);
        assert!(results[0].lexical == 0.0 || results[0].combined == results[0].semantic);
    }

    #[cfg(test)]
    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Increasing alpha moves every combined score monotonically
            // from its semantic toward its lexical score.
            #[test]
            fn alpha_monotonicity(
                lexical in 0.0f64..=1.0,
                semantic in 0.0f64..=1.0,
                a1 in 0.0f64..=1.0,
                a2 in 0.0f64..=1.0,
            ) {
                let (lo, hi) = if a1 <= a2 { (a1, a2) } else { (a2, a1) };
                let at_lo = combine_scores(lexical, semantic, lo);
                let at_hi = combine_scores(lexical, semantic, hi);
                if lexical >= semantic {
                    prop_assert!(at_hi >= at_lo - 1e-12);
                } else {
                    prop_assert!(at_hi <= at_lo + 1e-12);
                }
                prop_assert!((combine_scores(lexical, semantic, 0.0) - semantic).abs() < 1e-12);
                prop_assert!((combine_scores(lexical, semantic, 1.0) - lexical).abs() < 1e-12);
            }
        }
    }
}

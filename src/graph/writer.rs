//! Graph assembly: writing a decision and its edge neighborhood.
//!
//! `save_decision` performs the full write pipeline: embedding, node
//! insert, entity resolution with INVOLVES edges, matrix-validated
//! entity-entity relationships, SIMILAR_TO / INFLUENCED_BY /
//! FOLLOWS-PRECEDES derivation, CandidateDecision nodes for rejected
//! options, and ground-truth AFFECTS edges. Everything through AFFECTS is
//! written before the call returns; save listeners (cross-user scans,
//! analytics events) are fired afterwards and never block or fail the
//! write. Derived-edge failures are logged and skipped, never fatal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::extract::{DecisionExtractor, ExtractedEntity};
use crate::llm::{EmbeddingProvider, EmbeddingRequest};
use crate::ontology::{validate_entity_relationship, RelationType};
use crate::repo::code_entity_from_path;
use crate::resolve::{EntityResolver, ResolvedEntity};

use super::store::GraphStore;
use super::types::{CandidateDecision, DecisionTrace, Edge, NodeKind};

/// Fire-and-forget hook invoked after a decision lands in the graph.
#[async_trait]
pub trait SaveListener: Send + Sync {
    async fn on_decision_saved(&self, decision: DecisionTrace);
}

/// Save listener that emits a structured analytics event per save.
///
/// Stands in for an external analytics provider; swap in a real sink by
/// implementing [`SaveListener`] against its client.
pub struct AnalyticsEvents;

#[async_trait]
impl SaveListener for AnalyticsEvents {
    async fn on_decision_saved(&self, decision: DecisionTrace) {
        info!(
            event = "decision_saved",
            decision_id = %decision.id,
            project = decision.project_name.as_deref().unwrap_or(""),
            scope = decision.scope.as_str(),
            source = %decision.source.as_string(),
            confidence = decision.confidence,
            "analytics event"
        );
    }
}

/// What a save produced, for callers that surface it (agent remember).
#[derive(Debug, Clone)]
pub struct SaveOutcome {
    pub decision_id: String,
    pub entities: Vec<ResolvedEntity>,
    /// `(decision id, cosine score)` of linked similar decisions.
    pub similar: Vec<(String, f64)>,
}

/// Writes decisions and their derived edges into the graph store.
pub struct GraphWriter {
    store: Arc<GraphStore>,
    resolver: Arc<EntityResolver>,
    extractor: Arc<DecisionExtractor>,
    embedder: Arc<dyn EmbeddingProvider>,
    user_id: String,
    similarity_threshold: f64,
    high_similarity_threshold: f64,
    listeners: Vec<Arc<dyn SaveListener>>,
}

impl GraphWriter {
    pub fn new(
        store: Arc<GraphStore>,
        resolver: Arc<EntityResolver>,
        extractor: Arc<DecisionExtractor>,
        embedder: Arc<dyn EmbeddingProvider>,
        user_id: impl Into<String>,
        similarity_threshold: f64,
        high_similarity_threshold: f64,
    ) -> Self {
        Self {
            store,
            resolver,
            extractor,
            embedder,
            user_id: user_id.into(),
            similarity_threshold,
            high_similarity_threshold,
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn SaveListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Save a decision and derive its edges. `entities` may be supplied
    /// by the caller; otherwise they are extracted from the decision text.
    pub async fn save_decision(
        &self,
        mut decision: DecisionTrace,
        entities: Option<Vec<ExtractedEntity>>,
    ) -> Result<SaveOutcome> {
        decision.user_id = Some(self.user_id.clone());

        // 1. Decision-level embedding.
        if decision.embedding.is_none() {
            match self
                .embedder
                .embed(EmbeddingRequest::passages(vec![decision.embedding_text()]))
                .await
            {
                Ok(response) => decision.embedding = response.embeddings.into_iter().next(),
                Err(e) => warn!(error = %e, "decision embedding failed, saving without"),
            }
        }

        // 2. The node itself. This is the only step allowed to fail the save.
        self.store.insert_decision(&decision)?;

        // 3. Entities and INVOLVES edges.
        let extracted = match entities {
            Some(list) => list,
            None => self
                .extractor
                .extract_entities(&decision.embedding_text())
                .await
                .unwrap_or_default(),
        };
        let resolved = self.link_entities(&decision, &extracted).await;

        // 4. Entity-entity relationships, validated against the matrix.
        if let Err(e) = self.link_entity_relationships(&decision, &resolved).await {
            warn!(error = %e, "entity relationship extraction failed");
        }

        // 5. SIMILAR_TO.
        let similar = self.link_similar(&decision).unwrap_or_else(|e| {
            warn!(error = %e, "similarity linking failed");
            Vec::new()
        });

        // 6. INFLUENCED_BY.
        if let Err(e) = self.link_influences(&decision) {
            warn!(error = %e, "influence linking failed");
        }

        // 7. FOLLOWS / PRECEDES within the project conversation order.
        if let Err(e) = self.link_temporal_order(&decision) {
            warn!(error = %e, "temporal ordering failed");
        }

        // 8. CandidateDecision nodes for rejected options.
        if let Err(e) = self.record_rejected_options(&decision) {
            warn!(error = %e, "candidate recording failed");
        }

        // 9. Ground-truth AFFECTS edges from tool-call paths.
        if let Err(e) = self.link_affected_files(&decision) {
            warn!(error = %e, "code entity linking failed");
        }

        // 10. Fire-and-forget listeners.
        for listener in &self.listeners {
            let listener = listener.clone();
            let snapshot = decision.clone();
            tokio::spawn(async move {
                listener.on_decision_saved(snapshot).await;
            });
        }

        info!(
            decision_id = %decision.id,
            entities = resolved.len(),
            similar = similar.len(),
            "decision saved"
        );

        Ok(SaveOutcome {
            decision_id: decision.id,
            entities: resolved,
            similar,
        })
    }

    async fn link_entities(
        &self,
        decision: &DecisionTrace,
        extracted: &[ExtractedEntity],
    ) -> Vec<ResolvedEntity> {
        let mut resolved = Vec::new();
        for entity in extracted {
            match self.resolver.resolve(&entity.name, entity.entity_type).await {
                Ok(r) => {
                    let edge = Edge::new(
                        decision.id.clone(),
                        NodeKind::Decision,
                        r.id.clone(),
                        NodeKind::Entity,
                        RelationType::Involves,
                    )
                    .with_confidence(entity.confidence)
                    .with_weight(entity.confidence)
                    .with_valid_at(decision.created_at);
                    if let Err(e) = self.store.merge_edge(&edge) {
                        warn!(error = %e, entity = %r.name, "INVOLVES edge failed");
                    }
                    resolved.push(r);
                }
                Err(e) => warn!(error = %e, entity = %entity.name, "entity resolution failed"),
            }
        }
        resolved
    }

    async fn link_entity_relationships(
        &self,
        decision: &DecisionTrace,
        resolved: &[ResolvedEntity],
    ) -> Result<()> {
        if resolved.len() < 2 {
            return Ok(());
        }
        let names: Vec<String> = resolved.iter().map(|r| r.name.clone()).collect();
        let proposals = self
            .extractor
            .extract_entity_relationships(&decision.embedding_text(), &names)
            .await?;

        for proposal in proposals {
            let Some(source) = resolved
                .iter()
                .find(|r| r.name.eq_ignore_ascii_case(&proposal.from))
            else {
                continue;
            };
            let Some(target) = resolved
                .iter()
                .find(|r| r.name.eq_ignore_ascii_case(&proposal.to))
            else {
                continue;
            };
            if source.id == target.id {
                continue;
            }
            let Some(proposed) = RelationType::parse(&proposal.rel_type) else {
                debug!(rel = %proposal.rel_type, "unknown relationship type skipped");
                continue;
            };
            if !proposed.is_entity_only() && proposed != RelationType::RelatedTo {
                continue;
            }

            let validated = validate_entity_relationship(
                source.entity_type,
                proposed,
                target.entity_type,
                proposal.confidence,
            );
            if validated.downgraded {
                debug!(
                    from = %source.name,
                    to = %target.name,
                    proposed = %proposed,
                    "relationship downgraded to RELATED_TO"
                );
            }

            let edge = Edge::new(
                source.id.clone(),
                NodeKind::Entity,
                target.id.clone(),
                NodeKind::Entity,
                validated.relation,
            )
            .with_confidence(validated.confidence)
            .with_valid_at(decision.created_at);
            if let Err(e) = self.store.merge_edge(&edge) {
                warn!(error = %e, "entity relationship edge failed");
            }
        }
        Ok(())
    }

    fn link_similar(&self, decision: &DecisionTrace) -> Result<Vec<(String, f64)>> {
        let Some(embedding) = decision.embedding.as_deref() else {
            return Ok(Vec::new());
        };
        let similar = self.store.similar_decisions(
            &self.user_id,
            embedding,
            self.similarity_threshold,
            5,
            Some(&decision.id),
        )?;

        let mut linked = Vec::new();
        for (other, score) in similar {
            let tier = if score >= self.high_similarity_threshold {
                "high"
            } else {
                "moderate"
            };
            let edge = Edge::new(
                decision.id.clone(),
                NodeKind::Decision,
                other.id.clone(),
                NodeKind::Decision,
                RelationType::SimilarTo,
            )
            .with_confidence(score)
            .with_property("score", json!(score))
            .with_property("tier", json!(tier));
            self.store.merge_edge(&edge)?;
            linked.push((other.id, score));
        }
        Ok(linked)
    }

    fn link_influences(&self, decision: &DecisionTrace) -> Result<()> {
        let sharing = self
            .store
            .decisions_sharing_entities(&self.user_id, &decision.id, 2)?;
        for (other_id, shared) in sharing {
            let Some(other) = self.store.get_decision(&self.user_id, &other_id)? else {
                continue;
            };
            if other.created_at >= decision.created_at {
                continue;
            }
            let edge = Edge::new(
                decision.id.clone(),
                NodeKind::Decision,
                other_id,
                NodeKind::Decision,
                RelationType::InfluencedBy,
            )
            .with_property("shared_entities", json!(shared));
            self.store.merge_edge(&edge)?;
        }
        Ok(())
    }

    fn link_temporal_order(&self, decision: &DecisionTrace) -> Result<()> {
        let (Some(turn_index), Some(project)) =
            (decision.turn_index, decision.project_name.as_deref())
        else {
            return Ok(());
        };
        for earlier in self
            .store
            .earlier_decisions_in_project(&self.user_id, project, turn_index)?
        {
            self.store.merge_edge(&Edge::new(
                decision.id.clone(),
                NodeKind::Decision,
                earlier.id.clone(),
                NodeKind::Decision,
                RelationType::Follows,
            ))?;
            self.store.merge_edge(&Edge::new(
                earlier.id,
                NodeKind::Decision,
                decision.id.clone(),
                NodeKind::Decision,
                RelationType::Precedes,
            ))?;
        }
        Ok(())
    }

    fn record_rejected_options(&self, decision: &DecisionTrace) -> Result<()> {
        for option in decision.rejected_options() {
            let candidate = CandidateDecision {
                id: Uuid::new_v4().to_string(),
                user_id: Some(self.user_id.clone()),
                text: option.to_string(),
                rejected_at: decision.created_at,
                rejected_by_decision_id: decision.id.clone(),
            };
            self.store.insert_candidate(&candidate)?;
            self.store.merge_edge(&Edge::new(
                candidate.id,
                NodeKind::Candidate,
                decision.id.clone(),
                NodeKind::Decision,
                RelationType::RejectedBy,
            ))?;
        }
        Ok(())
    }

    fn link_affected_files(&self, decision: &DecisionTrace) -> Result<()> {
        for path in &decision.tool_file_paths {
            let code = code_entity_from_path(path, Some(&self.user_id));
            let code_id = self.store.upsert_code_entity(&code)?;
            let edge = Edge::new(
                decision.id.clone(),
                NodeKind::Decision,
                code_id,
                NodeKind::Code,
                RelationType::Affects,
            )
            .with_confidence(1.0)
            .with_valid_at(decision.created_at);
            self.store.merge_edge(&edge)?;
        }
        Ok(())
    }

    /// Link a git commit to the decisions it implemented and the files it
    /// touched.
    pub fn record_commit(
        &self,
        commit_hash: &str,
        message: &str,
        decision_ids: &[String],
        file_paths: &[String],
    ) -> Result<String> {
        let commit = super::types::CommitNode {
            id: Uuid::new_v4().to_string(),
            user_id: Some(self.user_id.clone()),
            commit_hash: commit_hash.to_string(),
            message: message.to_string(),
            created_at: Utc::now(),
        };
        let commit_id = self.store.upsert_commit(&commit)?;

        for decision_id in decision_ids {
            self.store.merge_edge(&Edge::new(
                decision_id.clone(),
                NodeKind::Decision,
                commit_id.clone(),
                NodeKind::Commit,
                RelationType::ImplementedBy,
            ))?;
        }
        for path in file_paths {
            let code = code_entity_from_path(path, Some(&self.user_id));
            let code_id = self.store.upsert_code_entity(&code)?;
            self.store.merge_edge(&Edge::new(
                commit_id.clone(),
                NodeKind::Commit,
                code_id,
                NodeKind::Code,
                RelationType::Touches,
            ))?;
        }
        Ok(commit_id)
    }

    /// Record that `newer` supersedes `older`: MERGE the edge, stamp the
    /// older decision's expiry, and close its INVOLVES edges so
    /// point-in-time queries see the old world before the handover.
    pub fn apply_supersedes(
        &self,
        newer_id: &str,
        older_id: &str,
        newer_created_at: DateTime<Utc>,
        confidence: f64,
        reason: Option<&str>,
    ) -> Result<()> {
        let mut edge = Edge::new(
            newer_id,
            NodeKind::Decision,
            older_id,
            NodeKind::Decision,
            RelationType::Supersedes,
        )
        .with_confidence(confidence)
        .with_valid_at(newer_created_at);
        if let Some(reason) = reason {
            edge = edge.with_reasoning(reason);
        }
        self.store.merge_edge(&edge)?;
        self.store.set_decision_expired(older_id, newer_created_at)?;
        self.store.invalidate_involves(older_id, newer_created_at)?;
        Ok(())
    }
}

//! Agent context service: the operations AI clients consume.
//!
//! Four user-scoped operations: a graph summary, focused context for a
//! query (with a token budget and optional markdown), per-entity context,
//! and remember (programmatic decision capture). Responses are cached in
//! the KV store under `cache:agent:<user>:<op>:<extra>` with per-op TTLs;
//! remember invalidates the lot.

mod render;

pub use render::render_markdown;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::analysis::PairAnalyzer;
use crate::error::Result;
use crate::graph::{DecisionSource, DecisionTrace, GraphStore, GraphWriter, NodeKind};
use crate::kv::KvStore;
use crate::ontology::EntityType;
use crate::resolve::EntityResolver;
use crate::retrieve::{HybridQuery, HybridRetriever};

const SUMMARY_TTL_SECS: u64 = 120;
const CONTEXT_TTL_SECS: u64 = 30;
const ENTITY_TTL_SECS: u64 = 60;
/// Focused-context budget assumes ~4 characters per token.
const CHARS_PER_TOKEN: usize = 4;

/// One entity in the summary, with its most-connected neighbors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySummary {
    pub name: String,
    pub entity_type: EntityType,
    pub decision_count: u64,
    pub related: Vec<String>,
}

/// One ranked decision in the summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedDecision {
    pub id: String,
    pub trigger: String,
    pub decision: String,
    pub confidence: f64,
    pub score: f64,
    pub is_current: bool,
}

/// Entity types with thin or shaky coverage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeGap {
    pub entity_type: EntityType,
    pub decision_count: u64,
    pub avg_confidence: f64,
}

/// The graph summary handed to agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub decision_count: u64,
    pub entity_count: u64,
    pub top_entities: Vec<EntitySummary>,
    pub top_decisions: Vec<RankedDecision>,
    pub unresolved_contradictions: Vec<(String, String)>,
    pub knowledge_gaps: Vec<KnowledgeGap>,
}

/// One decision inside focused context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextDecision {
    pub id: String,
    pub trigger: String,
    pub agent_decision: String,
    pub context: String,
    pub rationale: String,
    pub confidence: f64,
    pub superseded: bool,
    pub entities: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Focused context for one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FocusedContext {
    pub query: String,
    pub decisions: Vec<ContextDecision>,
    /// Supersession chains touching the hit set, oldest first.
    pub supersession_chains: Vec<Vec<String>>,
    /// Contradiction pairs touching the hit set, as decision texts.
    pub contradictions: Vec<(String, String)>,
    /// True when the token budget cut the decision list.
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markdown: Option<String>,
}

/// One timeline entry for an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub date: DateTime<Utc>,
    pub decision_id: String,
    pub summary: String,
    pub superseded: bool,
}

/// Per-entity context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityContext {
    pub name: String,
    pub entity_type: EntityType,
    pub decisions: Vec<ContextDecision>,
    pub related: Vec<(String, String)>,
    pub timeline: Vec<TimelineEvent>,
}

/// Input to remember.
#[derive(Debug, Clone, Deserialize)]
pub struct RememberRequest {
    /// Name of the calling agent; recorded as `agent:<name>`.
    pub agent_name: String,
    pub trigger: String,
    pub decision: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// What remember produced.
#[derive(Debug, Clone, Serialize)]
pub struct RememberOutcome {
    pub decision_id: String,
    pub entities: Vec<String>,
    pub similar: Vec<(String, f64)>,
    pub potential_supersedes: Vec<String>,
    pub potential_contradictions: Vec<String>,
}

/// The agent-facing front end over retrieval, analysis, and the writer.
pub struct AgentContextService {
    store: Arc<GraphStore>,
    retriever: Arc<HybridRetriever>,
    writer: Arc<GraphWriter>,
    resolver: Arc<EntityResolver>,
    pair_analyzer: Arc<PairAnalyzer>,
    kv: Arc<dyn KvStore>,
    user_id: String,
    token_budget: usize,
}

impl AgentContextService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<GraphStore>,
        retriever: Arc<HybridRetriever>,
        writer: Arc<GraphWriter>,
        resolver: Arc<EntityResolver>,
        pair_analyzer: Arc<PairAnalyzer>,
        kv: Arc<dyn KvStore>,
        user_id: impl Into<String>,
        token_budget: usize,
    ) -> Self {
        Self {
            store,
            retriever,
            writer,
            resolver,
            pair_analyzer,
            kv,
            user_id: user_id.into(),
            token_budget,
        }
    }

    fn cache_key(&self, op: &str, extra: &str) -> String {
        format!("cache:agent:{}:{op}:{extra}", self.user_id)
    }

    async fn cached<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.kv.get(key).await.ok()??;
        serde_json::from_str(&value).ok()
    }

    async fn store_cached<T: Serialize>(&self, key: &str, value: &T, ttl: u64) {
        if let Ok(json) = serde_json::to_string(value) {
            let _ = self.kv.set(key, &json, Some(ttl)).await;
        }
    }

    /// Invalidate every agent-cache entry for this user.
    pub async fn invalidate_cache(&self) -> Result<u64> {
        self.kv
            .delete_prefix(&format!("cache:agent:{}:", self.user_id))
            .await
    }

    /// Graph summary: counts, top entities, top decisions, open
    /// contradictions, knowledge gaps. Cached 120 s.
    pub async fn summary(&self) -> Result<AgentSummary> {
        let key = self.cache_key("summary", "");
        if let Some(hit) = self.cached::<AgentSummary>(&key).await {
            debug!("agent summary served from cache");
            return Ok(hit);
        }

        let superseded = self.store.superseded_decision_ids()?;

        let mut top_entities = Vec::new();
        for (entity, count) in self.store.entities_by_decision_count(&self.user_id, 15)? {
            let related: Vec<String> = self
                .store
                .neighbors(&entity.id, None, 25)?
                .into_iter()
                .filter(|n| n.other_kind == NodeKind::Entity)
                .take(5)
                .filter_map(|n| {
                    self.store
                        .get_entity(&self.user_id, &n.other_id)
                        .ok()
                        .flatten()
                        .map(|e| e.name)
                })
                .collect();
            top_entities.push(EntitySummary {
                name: entity.name,
                entity_type: entity.entity_type,
                decision_count: count,
                related,
            });
        }

        let decisions = self.store.all_decisions(&self.user_id)?;
        let mut ranked: Vec<RankedDecision> = Vec::new();
        for decision in &decisions {
            let entity_count = self.store.entities_of_decision(&decision.id)?.len() as f64;
            let has_timestamp = decision.created_at.timestamp() > 0;
            let score = 0.4 * decision.confidence
                + 0.3 * (entity_count / 10.0).min(1.0)
                + 0.3 * if has_timestamp { 1.0 } else { 0.0 };
            ranked.push(RankedDecision {
                id: decision.id.clone(),
                trigger: decision.trigger.clone(),
                decision: decision.agent_decision.clone(),
                confidence: decision.confidence,
                score,
                is_current: !superseded.contains(&decision.id),
            });
        }
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(10);

        let unresolved: Vec<(String, String)> = self
            .store
            .contradiction_pairs(&self.user_id)?
            .into_iter()
            .filter(|(a, b)| !superseded.contains(a) && !superseded.contains(b))
            .collect();

        // Coverage per entity type: thin or shaky types are gaps.
        let mut per_type: HashMap<EntityType, (u64, f64)> = HashMap::new();
        for decision in &decisions {
            for entity in self.store.entities_of_decision(&decision.id)? {
                let slot = per_type.entry(entity.entity_type).or_insert((0, 0.0));
                slot.0 += 1;
                slot.1 += decision.confidence;
            }
        }
        let knowledge_gaps: Vec<KnowledgeGap> = per_type
            .into_iter()
            .map(|(entity_type, (count, sum))| KnowledgeGap {
                entity_type,
                decision_count: count,
                avg_confidence: if count > 0 { sum / count as f64 } else { 0.0 },
            })
            .filter(|gap| gap.decision_count <= 2 || gap.avg_confidence < 0.6)
            .collect();

        let summary = AgentSummary {
            decision_count: self.store.count_decisions(&self.user_id)?,
            entity_count: self.store.count_entities(&self.user_id)?,
            top_entities,
            top_decisions: ranked,
            unresolved_contradictions: unresolved,
            knowledge_gaps,
        };
        self.store_cached(&key, &summary, SUMMARY_TTL_SECS).await;
        Ok(summary)
    }

    fn context_decision(&self, decision: &DecisionTrace, superseded: bool) -> Result<ContextDecision> {
        let entities = self
            .store
            .entities_of_decision(&decision.id)?
            .into_iter()
            .map(|e| e.name)
            .collect();
        Ok(ContextDecision {
            id: decision.id.clone(),
            trigger: decision.trigger.clone(),
            agent_decision: decision.agent_decision.clone(),
            context: decision.context.clone(),
            rationale: decision.agent_rationale.clone(),
            confidence: decision.confidence,
            superseded,
            entities,
            created_at: decision.created_at,
        })
    }

    /// Focused context for a query: hybrid hits annotated with
    /// supersession and entities, plus chains and contradictions touching
    /// the hit set, under the token budget. Cached 30 s.
    pub async fn focused_context(
        &self,
        query: &str,
        top_k: usize,
        markdown: bool,
    ) -> Result<FocusedContext> {
        let key = self.cache_key("context", &format!("{query}:{top_k}:{markdown}"));
        if let Some(hit) = self.cached::<FocusedContext>(&key).await {
            return Ok(hit);
        }

        let hits = self
            .retriever
            .search(
                &self.user_id,
                &HybridQuery {
                    query: query.to_string(),
                    top_k,
                    include_entities: false,
                    ..HybridQuery::default()
                },
            )
            .await?;
        let superseded = self.store.superseded_decision_ids()?;

        let mut decisions = Vec::new();
        let mut hit_ids = Vec::new();
        for hit in &hits {
            let Some(decision) = &hit.decision else { continue };
            hit_ids.push(decision.id.clone());
            decisions.push(self.context_decision(decision, superseded.contains(&decision.id))?);
        }

        // Enforce the token budget by truncating the decision list.
        let budget_chars = self.token_budget * CHARS_PER_TOKEN;
        let mut used = 0usize;
        let mut kept = Vec::new();
        let mut truncated = false;
        for decision in decisions {
            let cost = decision.trigger.len()
                + decision.agent_decision.len()
                + decision.context.len()
                + decision.rationale.len();
            if used + cost > budget_chars && !kept.is_empty() {
                truncated = true;
                break;
            }
            used += cost;
            kept.push(decision);
        }

        // Chains and contradictions that touch the hit set.
        let mut chains = Vec::new();
        for id in &hit_ids {
            if let Some(evolution) = crate::analysis::decision_evolution(
                &self.store,
                &self.user_id,
                id,
            )? {
                if !evolution.supersedes.is_empty() || !evolution.superseded_by.is_empty() {
                    let mut chain: Vec<String> = evolution
                        .supersedes
                        .iter()
                        .rev()
                        .map(|d| d.agent_decision.clone())
                        .collect();
                    chain.push(evolution.decision.agent_decision.clone());
                    chain.extend(
                        evolution
                            .superseded_by
                            .iter()
                            .map(|d| d.agent_decision.clone()),
                    );
                    if !chains.contains(&chain) {
                        chains.push(chain);
                    }
                }
            }
        }
        let mut contradictions = Vec::new();
        for id in &hit_ids {
            for (other, _edge) in
                crate::analysis::contradictions_for_decision(&self.store, &self.user_id, id)?
            {
                if let Some(decision) = self.store.get_decision(&self.user_id, id)? {
                    let pair = (decision.agent_decision, other.agent_decision);
                    if !contradictions.contains(&pair) {
                        contradictions.push(pair);
                    }
                }
            }
        }

        let mut context = FocusedContext {
            query: query.to_string(),
            decisions: kept,
            supersession_chains: chains,
            contradictions,
            truncated,
            markdown: None,
        };
        if markdown {
            context.markdown = Some(render_markdown(&context));
        }
        self.store_cached(&key, &context, CONTEXT_TTL_SECS).await;
        Ok(context)
    }

    /// Context for one entity: its decisions newest-first, related
    /// entities, and a timeline. Cached 60 s.
    pub async fn entity_context(&self, name: &str) -> Result<Option<EntityContext>> {
        let key = self.cache_key("entity", &crate::ontology::normalize_entity_name(name));
        if let Some(hit) = self.cached::<Option<EntityContext>>(&key).await {
            return Ok(hit);
        }

        // Resolution without creation: unknown entities stay unknown.
        let mut found = None;
        for entity_type in [
            EntityType::Technology,
            EntityType::Concept,
            EntityType::Pattern,
            EntityType::System,
            EntityType::Person,
            EntityType::Organization,
            EntityType::File,
        ] {
            if let Some(resolved) = self.resolver.lookup(name, entity_type).await? {
                found = Some(resolved);
                break;
            }
        }
        let Some(resolved) = found else {
            self.store_cached(&key, &None::<EntityContext>, ENTITY_TTL_SECS)
                .await;
            return Ok(None);
        };

        let superseded = self.store.superseded_decision_ids()?;
        let decisions = self
            .store
            .decisions_involving_entity(&self.user_id, &resolved.id)?;

        let mut context_decisions = Vec::new();
        let mut timeline = Vec::new();
        for decision in &decisions {
            let is_superseded = superseded.contains(&decision.id);
            context_decisions.push(self.context_decision(decision, is_superseded)?);
            timeline.push(TimelineEvent {
                date: decision.created_at,
                decision_id: decision.id.clone(),
                summary: decision.agent_decision.clone(),
                superseded: is_superseded,
            });
        }
        timeline.sort_by_key(|e| e.date);

        let related: Vec<(String, String)> = self
            .store
            .neighbors(&resolved.id, None, 50)?
            .into_iter()
            .filter(|n| n.other_kind == NodeKind::Entity)
            .filter_map(|n| {
                self.store
                    .get_entity(&self.user_id, &n.other_id)
                    .ok()
                    .flatten()
                    .map(|e| (e.name, n.edge.relation.as_str().to_string()))
            })
            .collect();

        let context = Some(EntityContext {
            name: resolved.name,
            entity_type: resolved.entity_type,
            decisions: context_decisions,
            related,
            timeline,
        });
        self.store_cached(&key, &context, ENTITY_TTL_SECS).await;
        Ok(context)
    }

    /// Prior-art check: similar decisions and their conflict status for a
    /// proposed course of action.
    pub async fn check(&self, proposal: &str, top_k: usize) -> Result<Vec<ContextDecision>> {
        let superseded = self.store.superseded_decision_ids()?;
        let hits = self
            .retriever
            .search(
                &self.user_id,
                &HybridQuery {
                    query: proposal.to_string(),
                    top_k,
                    include_entities: false,
                    alpha: 0.3,
                    ..HybridQuery::default()
                },
            )
            .await?;
        hits.iter()
            .filter_map(|h| h.decision.as_ref())
            .map(|d| self.context_decision(d, superseded.contains(&d.id)))
            .collect()
    }

    /// Create a decision on behalf of an agent and report its neighbors.
    pub async fn remember(&self, request: RememberRequest) -> Result<RememberOutcome> {
        let mut decision = DecisionTrace::new(request.trigger, request.decision);
        decision.context = request.context;
        decision.agent_rationale = request.rationale;
        decision.options = if request.options.is_empty() {
            vec![decision.agent_decision.clone()]
        } else {
            request.options
        };
        decision.project_name = request.project_name;
        decision.assumptions = request.assumptions;
        if let Some(confidence) = request.confidence {
            decision.confidence = confidence.clamp(0.0, 1.0);
            decision.raw_confidence = decision.confidence;
        }
        decision.source = DecisionSource::Agent(request.agent_name);

        let outcome = self.writer.save_decision(decision, None).await?;

        // Pair-check the closest neighbors for supersession/contradiction.
        let mut potential_supersedes = Vec::new();
        let mut potential_contradictions = Vec::new();
        let saved = self
            .store
            .get_decision(&self.user_id, &outcome.decision_id)?;
        if let Some(saved) = saved {
            for (other_id, _score) in outcome.similar.iter().take(3) {
                let Some(other) = self.store.get_decision(&self.user_id, other_id)? else {
                    continue;
                };
                match self.pair_analyzer.analyze_pair(&saved, &other).await {
                    Some(verdict) => match verdict.relation {
                        crate::analysis::PairRelation::Supersedes => {
                            potential_supersedes.push(other.id)
                        }
                        crate::analysis::PairRelation::Contradicts => {
                            potential_contradictions.push(other.id)
                        }
                        crate::analysis::PairRelation::None => {}
                    },
                    None => continue,
                }
            }
        }

        if let Err(e) = self.invalidate_cache().await {
            warn!(error = %e, "agent cache invalidation failed");
        }

        Ok(RememberOutcome {
            decision_id: outcome.decision_id,
            entities: outcome.entities.into_iter().map(|e| e.name).collect(),
            similar: outcome.similar,
            potential_supersedes,
            potential_contradictions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::extract::DecisionExtractor;
    use crate::graph::{Edge, Entity};
    use crate::kv::MemoryKvStore;
    use crate::llm::testing::{StaticEmbedder, StaticProvider};
    use crate::llm::{LlmService, ResponseCache};
    use crate::ontology::RelationType;
    use pretty_assertions::assert_eq;

    fn service(provider: StaticProvider) -> (AgentContextService, Arc<GraphStore>, StaticEmbedder) {
        let store = Arc::new(GraphStore::in_memory().unwrap());
        let kv = Arc::new(MemoryKvStore::new());
        let embedder = Arc::new(StaticEmbedder::new());
        let llm = Arc::new(LlmService::new(
            Arc::new(provider),
            kv.clone(),
            CoreConfig::default(),
        ));
        let extractor = Arc::new(DecisionExtractor::new(
            llm.clone(),
            ResponseCache::new(kv.clone(), "v5", 3600),
        ));
        let resolver = Arc::new(EntityResolver::new(
            store.clone(),
            embedder.clone(),
            kv.clone(),
            "u1",
        ));
        let writer = Arc::new(GraphWriter::new(
            store.clone(),
            resolver.clone(),
            extractor,
            embedder.clone(),
            "u1",
            0.7,
            0.85,
        ));
        let retriever = Arc::new(HybridRetriever::new(store.clone(), embedder, 20));
        let service = AgentContextService::new(
            store.clone(),
            retriever,
            writer,
            resolver,
            Arc::new(PairAnalyzer::new(llm, 0.6)),
            kv,
            "u1",
            4000,
        );
        (service, store, StaticEmbedder::new())
    }

    fn seed_decision(store: &GraphStore, trigger: &str, text: &str, confidence: f64) -> DecisionTrace {
        let mut d = DecisionTrace::new(trigger, text);
        d.user_id = Some("u1".into());
        d.confidence = confidence;
        d.embedding = Some(StaticEmbedder::new().vector_for(text));
        store.insert_decision(&d).unwrap();
        d
    }

    fn involve(store: &GraphStore, d: &DecisionTrace, name: &str, entity_type: EntityType) -> Entity {
        let mut e = Entity::new(name, entity_type);
        e.user_id = Some("u1".into());
        store.insert_entity(&e).unwrap();
        store
            .merge_edge(&Edge::new(
                d.id.clone(),
                NodeKind::Decision,
                e.id.clone(),
                NodeKind::Entity,
                RelationType::Involves,
            ))
            .unwrap();
        e
    }

    #[tokio::test]
    async fn test_summary_ranks_and_flags_currency() {
        let (service, store, _) = service(StaticProvider::new(vec![]));
        let old = seed_decision(&store, "storage", "Use SQLite for storage", 0.9);
        let new = seed_decision(&store, "storage", "Use PostgreSQL for storage", 0.9);
        involve(&store, &new, "PostgreSQL", EntityType::Technology);
        store
            .merge_edge(&Edge::new(
                new.id.clone(),
                NodeKind::Decision,
                old.id.clone(),
                NodeKind::Decision,
                RelationType::Supersedes,
            ))
            .unwrap();

        let summary = service.summary().await.unwrap();
        assert_eq!(summary.decision_count, 2);
        let old_ranked = summary
            .top_decisions
            .iter()
            .find(|d| d.id == old.id)
            .unwrap();
        assert!(!old_ranked.is_current);
        let new_ranked = summary
            .top_decisions
            .iter()
            .find(|d| d.id == new.id)
            .unwrap();
        assert!(new_ranked.is_current);
        // Entity involvement contributes to the ranking score.
        assert!(new_ranked.score > old_ranked.score);

        // Technology appears as a knowledge gap: only one decision.
        assert!(summary
            .knowledge_gaps
            .iter()
            .any(|g| g.entity_type == EntityType::Technology));

        // Second call is served from cache even after new writes.
        seed_decision(&store, "x", "Another decision entirely", 0.5);
        let cached = service.summary().await.unwrap();
        assert_eq!(cached.decision_count, 2);
    }

    #[tokio::test]
    async fn test_focused_context_annotates_supersession() {
        let (service, store, embedder) = service(StaticProvider::new(vec![]));
        let old = seed_decision(&store, "pick storage", "Use SQLite for app storage", 0.8);
        let mut new = DecisionTrace::new("pick storage", "Use PostgreSQL for app storage");
        new.user_id = Some("u1".into());
        new.embedding = Some(embedder.vector_for("Use PostgreSQL for app storage"));
        store.insert_decision(&new).unwrap();
        store
            .merge_edge(&Edge::new(
                new.id.clone(),
                NodeKind::Decision,
                old.id.clone(),
                NodeKind::Decision,
                RelationType::Supersedes,
            ))
            .unwrap();

        let context = service
            .focused_context("app storage", 10, true)
            .await
            .unwrap();
        assert!(!context.decisions.is_empty());
        let old_hit = context.decisions.iter().find(|d| d.id == old.id).unwrap();
        assert!(old_hit.superseded);
        assert!(!context.supersession_chains.is_empty());
        assert!(context.markdown.as_deref().unwrap().contains("## Decisions"));
    }

    #[tokio::test]
    async fn test_entity_context_timeline() {
        let (service, store, _) = service(StaticProvider::new(vec![]));
        let d1 = seed_decision(&store, "db", "Use PostgreSQL as primary", 0.9);
        let entity = involve(&store, &d1, "PostgreSQL", EntityType::Technology);
        let d2 = seed_decision(&store, "replication", "Enable PostgreSQL replication", 0.8);
        store
            .merge_edge(&Edge::new(
                d2.id.clone(),
                NodeKind::Decision,
                entity.id.clone(),
                NodeKind::Entity,
                RelationType::Involves,
            ))
            .unwrap();

        let context = service.entity_context("PostgreSQL").await.unwrap().unwrap();
        assert_eq!(context.name, "PostgreSQL");
        assert_eq!(context.decisions.len(), 2);
        assert_eq!(context.timeline.len(), 2);
        // Timeline ascends; the decision list is newest-first.
        assert!(context.timeline[0].date <= context.timeline[1].date);

        assert!(service.entity_context("NeverMentioned").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remember_saves_and_reports_conflicts() {
        // Responses: entity extraction for the saved decision, then one
        // pair-analysis verdict for the similar neighbor.
        let (service, store, _) = service(StaticProvider::new(vec![
            r#"{"entities": [{"name": "MongoDB", "type": "technology", "confidence": 0.9}]}"#,
            r#"{"relationship": "CONTRADICTS", "confidence": 0.8, "reasoning": "opposite storage choices"}"#,
        ]));
        // Existing decision whose embedding matches what the writer will
        // embed for the remembered decision.
        let mut twin = DecisionTrace::new("standard database", "All projects use PostgreSQL");
        twin.user_id = Some("u1".into());
        twin.context = "platform consistency".into();
        twin.options = vec!["All projects use PostgreSQL".into()];
        twin.agent_rationale = "one engine to operate".into();
        twin.embedding = Some(StaticEmbedder::new().vector_for(&twin.embedding_text()));
        store.insert_decision(&twin).unwrap();

        let outcome = service
            .remember(RememberRequest {
                agent_name: "planner".into(),
                trigger: "standard database".into(),
                decision: "All projects use PostgreSQL".into(),
                context: "platform consistency".into(),
                rationale: "one engine to operate".into(),
                options: vec![],
                project_name: None,
                assumptions: vec![],
                confidence: Some(0.9),
            })
            .await
            .unwrap();

        let saved = store.get_decision("u1", &outcome.decision_id).unwrap().unwrap();
        assert_eq!(saved.source.as_string(), "agent:planner");
        assert_eq!(outcome.entities, vec!["MongoDB".to_string()]);
        // The identical existing decision is similar; the scripted
        // verdict flags it as a potential contradiction.
        assert_eq!(outcome.similar.len(), 1);
        assert_eq!(outcome.potential_contradictions.len(), 1);
    }
}

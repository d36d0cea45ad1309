//! Pairwise decision analysis: SUPERSEDES / CONTRADICTS detection.
//!
//! Direction for SUPERSEDES is decided by temporal order, not by the LLM:
//! the newer decision supersedes the older. Timestamps compare as RFC 3339
//! strings, which orders correctly for UTC ISO-8601 values. Verdicts below
//! the confidence floor are discarded.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::extract::extract_json;
use crate::graph::{DecisionTrace, Edge, GraphStore, GraphWriter, NodeKind};
use crate::llm::{GenerateOptions, LlmService};
use crate::ontology::RelationType;

/// Relationship classes the analyzer can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairRelation {
    #[serde(rename = "SUPERSEDES")]
    Supersedes,
    #[serde(rename = "CONTRADICTS")]
    Contradicts,
    #[serde(rename = "NONE")]
    None,
}

/// A saved-worthy verdict on a decision pair.
#[derive(Debug, Clone)]
pub struct PairVerdict {
    pub relation: PairRelation,
    pub confidence: f64,
    pub reasoning: String,
    /// For SUPERSEDES: `(newer_id, older_id)` by creation order.
    pub newer_id: String,
    pub older_id: String,
}

#[derive(Debug, Deserialize)]
struct PairResponse {
    relationship: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

fn default_confidence() -> f64 {
    0.5
}

fn pair_prompt(a: &DecisionTrace, b: &DecisionTrace) -> String {
    format!(
        r#"Analyze if these two decisions have a significant relationship.

Types:
- SUPERSEDES: The newer decision explicitly replaces or changes the older decision
- CONTRADICTS: The decisions fundamentally conflict (choosing opposite approaches)
- NONE: No significant relationship (different topics or compatible decisions)

## Decision A ({a_created}):
Trigger: {a_trigger}
Decision: {a_decision}
Rationale: {a_rationale}

## Decision B ({b_created}):
Trigger: {b_trigger}
Decision: {b_decision}
Rationale: {b_rationale}

Important guidelines:
- SUPERSEDES means the newer decision explicitly changes or replaces the older one
- CONTRADICTS means the decisions are fundamentally incompatible
- If decisions are about different topics or are compatible, return NONE
- Consider temporal order: only newer decisions can supersede older ones

Return a JSON object:
{{
  "relationship": "SUPERSEDES" | "CONTRADICTS" | "NONE",
  "confidence": 0.0-1.0,
  "reasoning": "Brief explanation"
}}

Return ONLY valid JSON, no markdown or explanation."#,
        a_created = a.created_at.to_rfc3339(),
        a_trigger = a.trigger,
        a_decision = a.agent_decision,
        a_rationale = a.agent_rationale,
        b_created = b.created_at.to_rfc3339(),
        b_trigger = b.trigger,
        b_decision = b.agent_decision,
        b_rationale = b.agent_rationale,
    )
}

/// LLM-backed analyzer over decision pairs.
pub struct PairAnalyzer {
    llm: Arc<LlmService>,
    confidence_floor: f64,
}

impl PairAnalyzer {
    pub fn new(llm: Arc<LlmService>, confidence_floor: f64) -> Self {
        Self {
            llm,
            confidence_floor,
        }
    }

    /// Classify a pair. Returns `None` for NONE verdicts, sub-floor
    /// confidence, or any LLM/parse failure.
    pub async fn analyze_pair(
        &self,
        a: &DecisionTrace,
        b: &DecisionTrace,
    ) -> Option<PairVerdict> {
        let response = match self
            .llm
            .generate(
                pair_prompt(a, b),
                GenerateOptions::new().with_temperature(0.3).trusted(),
            )
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "pair analysis LLM call failed");
                return None;
            }
        };

        let parsed: PairResponse = match extract_json(&response.content)
            .and_then(|v| serde_json::from_value(v).map_err(crate::error::Error::from))
        {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to parse pair analysis response");
                return None;
            }
        };

        let relation = match parsed.relationship.to_uppercase().as_str() {
            "SUPERSEDES" => PairRelation::Supersedes,
            "CONTRADICTS" => PairRelation::Contradicts,
            _ => return None,
        };
        if parsed.confidence < self.confidence_floor {
            debug!(
                confidence = parsed.confidence,
                "pair verdict below confidence floor"
            );
            return None;
        }

        // String comparison of RFC 3339 timestamps decides direction.
        let (newer, older) = if a.created_at.to_rfc3339() >= b.created_at.to_rfc3339() {
            (a, b)
        } else {
            (b, a)
        };

        Some(PairVerdict {
            relation,
            confidence: parsed.confidence,
            reasoning: parsed.reasoning,
            newer_id: newer.id.clone(),
            older_id: older.id.clone(),
        })
    }

    /// Persist a verdict: SUPERSEDES goes through the writer (bi-temporal
    /// stamping); CONTRADICTS is a plain merged edge.
    pub fn save_verdict(
        &self,
        writer: &GraphWriter,
        verdict: &PairVerdict,
        newer_created_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        match verdict.relation {
            PairRelation::Supersedes => writer.apply_supersedes(
                &verdict.newer_id,
                &verdict.older_id,
                newer_created_at,
                verdict.confidence,
                Some(&verdict.reasoning),
            ),
            PairRelation::Contradicts => writer.store().merge_edge(
                &Edge::new(
                    verdict.newer_id.clone(),
                    NodeKind::Decision,
                    verdict.older_id.clone(),
                    NodeKind::Decision,
                    RelationType::Contradicts,
                )
                .with_confidence(verdict.confidence)
                .with_reasoning(verdict.reasoning.clone()),
            ),
            PairRelation::None => Ok(()),
        }
    }

    /// Batch mode: group decisions whose entity sets intersect by ≥ 2 and
    /// analyze each intra-group pair once. Returns saved verdicts.
    pub async fn analyze_all_pairs(
        &self,
        store: &GraphStore,
        writer: &GraphWriter,
        user_id: &str,
    ) -> Result<Vec<PairVerdict>> {
        let decisions = store.all_decisions(user_id)?;
        let by_id: HashMap<&str, &DecisionTrace> =
            decisions.iter().map(|d| (d.id.as_str(), d)).collect();

        let mut entity_sets: HashMap<&str, HashSet<String>> = HashMap::new();
        for d in &decisions {
            let set: HashSet<String> = store
                .entities_of_decision(&d.id)?
                .into_iter()
                .map(|e| e.id)
                .collect();
            entity_sets.insert(d.id.as_str(), set);
        }

        let mut analyzed: HashSet<(String, String)> = HashSet::new();
        let mut saved = Vec::new();
        for i in 0..decisions.len() {
            for j in (i + 1)..decisions.len() {
                let (a, b) = (&decisions[i], &decisions[j]);
                let shared = entity_sets[a.id.as_str()]
                    .intersection(&entity_sets[b.id.as_str()])
                    .count();
                if shared < 2 {
                    continue;
                }
                let key = if a.id < b.id {
                    (a.id.clone(), b.id.clone())
                } else {
                    (b.id.clone(), a.id.clone())
                };
                if !analyzed.insert(key) {
                    continue;
                }

                if let Some(verdict) = self.analyze_pair(a, b).await {
                    let newer_created = by_id
                        .get(verdict.newer_id.as_str())
                        .map(|d| d.created_at)
                        .unwrap_or(a.created_at);
                    if let Err(e) = self.save_verdict(writer, &verdict, newer_created) {
                        warn!(error = %e, "failed to save pair verdict");
                        continue;
                    }
                    saved.push(verdict);
                }
            }
        }
        info!(pairs_saved = saved.len(), "batch pair analysis completed");
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::kv::MemoryKvStore;
    use crate::llm::testing::StaticProvider;
    use chrono::Duration;

    fn analyzer(provider: StaticProvider) -> PairAnalyzer {
        let llm = Arc::new(LlmService::new(
            Arc::new(provider),
            Arc::new(MemoryKvStore::new()),
            CoreConfig::default(),
        ));
        PairAnalyzer::new(llm, 0.6)
    }

    fn decision(trigger: &str, text: &str, offset_secs: i64) -> DecisionTrace {
        let mut d = DecisionTrace::new(trigger, text);
        d.created_at = d.created_at + Duration::seconds(offset_secs);
        d
    }

    #[tokio::test]
    async fn test_supersedes_direction_follows_time() {
        let verdict_json =
            r#"{"relationship": "SUPERSEDES", "confidence": 0.8, "reasoning": "storage migration"}"#;
        let analyzer = analyzer(StaticProvider::new(vec![verdict_json]));

        let older = decision("primary storage", "Using PostgreSQL for primary storage", 0);
        let newer = decision(
            "storage scaling",
            "Migrating to MongoDB for horizontal scaling",
            3600,
        );

        // Order of arguments must not matter for direction.
        let verdict = analyzer.analyze_pair(&older, &newer).await.unwrap();
        assert_eq!(verdict.relation, PairRelation::Supersedes);
        assert_eq!(verdict.newer_id, newer.id);
        assert_eq!(verdict.older_id, older.id);
    }

    #[tokio::test]
    async fn test_none_and_low_confidence_discarded() {
        let analyzer = analyzer(StaticProvider::new(vec![
            r#"{"relationship": "NONE", "confidence": 0.9, "reasoning": "unrelated"}"#,
            r#"{"relationship": "CONTRADICTS", "confidence": 0.4, "reasoning": "weak signal"}"#,
        ]));
        let a = decision("a", "Use tabs for indentation", 0);
        let b = decision("b", "Use spaces for indentation", 10);

        assert!(analyzer.analyze_pair(&a, &b).await.is_none());
        assert!(analyzer.analyze_pair(&a, &b).await.is_none());
    }

    #[tokio::test]
    async fn test_llm_failure_returns_none() {
        let provider = StaticProvider::new(vec!["not json at all"]);
        let analyzer = analyzer(provider);
        let a = decision("a", "x", 0);
        let b = decision("b", "y", 5);
        assert!(analyzer.analyze_pair(&a, &b).await.is_none());
    }
}

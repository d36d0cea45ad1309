//! Assumption monitoring.
//!
//! Decisions record the assumptions they rest on ("single-tenant",
//! "team of 2"). When a later decision in the same project contradicts
//! one of those clauses, the original decision deserves a review even if
//! nothing superseded it directly.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::error::Result;
use crate::extract::extract_json;
use crate::graph::{DecisionTrace, GraphStore};
use crate::llm::{GenerateOptions, LlmService};

/// One assumption broken by a later decision.
#[derive(Debug, Clone, Serialize)]
pub struct AssumptionViolation {
    pub decision_id: String,
    pub decision_trigger: String,
    pub assumption: String,
    pub violated_by_decision_id: String,
    pub violated_by_text: String,
    pub confidence: f64,
    pub reasoning: String,
}

#[derive(Debug, Deserialize)]
struct ViolationResponse {
    #[serde(default)]
    violated: bool,
    #[serde(default)]
    assumption: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

fn default_confidence() -> f64 {
    0.5
}

fn violation_prompt(assumptions: &[String], later: &DecisionTrace) -> String {
    format!(
        r#"An earlier decision rests on these assumptions:
{}

A later decision in the same project says:
Trigger: {}
Decision: {}
Rationale: {}

Does the later decision contradict any of the listed assumptions?

Return a JSON object:
{{"violated": true/false, "assumption": "the broken clause or empty", "confidence": 0.0-1.0, "reasoning": "one short sentence"}}

Return ONLY valid JSON."#,
        assumptions
            .iter()
            .map(|a| format!("- {a}"))
            .collect::<Vec<_>>()
            .join("\n"),
        later.trigger,
        later.agent_decision,
        later.agent_rationale,
    )
}

/// Checks stored assumptions against later same-project decisions.
pub struct AssumptionMonitor {
    llm: Arc<LlmService>,
    confidence_floor: f64,
}

impl AssumptionMonitor {
    pub fn new(llm: Arc<LlmService>, confidence_floor: f64) -> Self {
        Self {
            llm,
            confidence_floor,
        }
    }

    /// Scan one user's decisions for violated assumptions.
    pub async fn scan(
        &self,
        store: &GraphStore,
        user_id: &str,
    ) -> Result<Vec<AssumptionViolation>> {
        let decisions = store.all_decisions(user_id)?;
        let mut violations = Vec::new();

        for decision in &decisions {
            if decision.assumptions.is_empty() {
                continue;
            }
            let later: Vec<&DecisionTrace> = decisions
                .iter()
                .filter(|other| {
                    other.id != decision.id
                        && other.project_name == decision.project_name
                        && other.created_at > decision.created_at
                })
                .collect();

            for other in later {
                let Some(result) = self.check_pair(decision, other).await else {
                    continue;
                };
                violations.push(result);
            }
        }
        Ok(violations)
    }

    async fn check_pair(
        &self,
        decision: &DecisionTrace,
        later: &DecisionTrace,
    ) -> Option<AssumptionViolation> {
        let response = match self
            .llm
            .generate(
                violation_prompt(&decision.assumptions, later),
                GenerateOptions::new().with_temperature(0.2).trusted(),
            )
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "assumption check LLM call failed");
                return None;
            }
        };

        let parsed: ViolationResponse = extract_json(&response.content)
            .ok()
            .and_then(|v| serde_json::from_value(v).ok())?;

        if !parsed.violated || parsed.confidence < self.confidence_floor {
            return None;
        }
        Some(AssumptionViolation {
            decision_id: decision.id.clone(),
            decision_trigger: decision.trigger.clone(),
            assumption: parsed.assumption,
            violated_by_decision_id: later.id.clone(),
            violated_by_text: later.agent_decision.clone(),
            confidence: parsed.confidence,
            reasoning: parsed.reasoning,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::kv::MemoryKvStore;
    use crate::llm::testing::StaticProvider;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn monitor(provider: StaticProvider) -> AssumptionMonitor {
        let llm = Arc::new(LlmService::new(
            Arc::new(provider),
            Arc::new(MemoryKvStore::new()),
            CoreConfig::default(),
        ));
        AssumptionMonitor::new(llm, 0.6)
    }

    #[tokio::test]
    async fn test_violation_detected() {
        let store = GraphStore::in_memory().unwrap();
        let mut earlier = DecisionTrace::new("sizing", "Run everything on one VM");
        earlier.user_id = Some("u1".into());
        earlier.project_name = Some("demo".into());
        earlier.assumptions = vec!["single-tenant deployment".into()];
        store.insert_decision(&earlier).unwrap();

        let mut later = DecisionTrace::new("tenancy", "Support multi-tenant accounts");
        later.user_id = Some("u1".into());
        later.project_name = Some("demo".into());
        later.created_at = earlier.created_at + Duration::hours(1);
        store.insert_decision(&later).unwrap();

        let monitor = monitor(StaticProvider::new(vec![
            r#"{"violated": true, "assumption": "single-tenant deployment", "confidence": 0.85, "reasoning": "multi-tenancy breaks the single-tenant premise"}"#,
        ]));
        let violations = monitor.scan(&store, "u1").await.unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].decision_id, earlier.id);
        assert_eq!(violations[0].violated_by_decision_id, later.id);
    }

    #[tokio::test]
    async fn test_compatible_decisions_pass() {
        let store = GraphStore::in_memory().unwrap();
        let mut earlier = DecisionTrace::new("sizing", "Run everything on one VM");
        earlier.user_id = Some("u1".into());
        earlier.project_name = Some("demo".into());
        earlier.assumptions = vec!["low traffic".into()];
        store.insert_decision(&earlier).unwrap();

        let mut later = DecisionTrace::new("logging", "Adopt structured logging");
        later.user_id = Some("u1".into());
        later.project_name = Some("demo".into());
        later.created_at = earlier.created_at + Duration::hours(1);
        store.insert_decision(&later).unwrap();

        let monitor = monitor(StaticProvider::new(vec![
            r#"{"violated": false, "assumption": "", "confidence": 0.9, "reasoning": "unrelated"}"#,
        ]));
        assert!(monitor.scan(&store, "u1").await.unwrap().is_empty());
    }
}

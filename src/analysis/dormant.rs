//! Dormant-alternative detection.
//!
//! A rejected option that nobody has revisited after a configured window
//! may deserve reconsideration, especially when the original decision was
//! made with low confidence. The score blends normalized age with the
//! parent decision's confidence penalty; weights are configuration.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::DormantWeights;
use crate::error::Result;
use crate::graph::GraphStore;

/// One rejected option worth a second look.
#[derive(Debug, Clone, Serialize)]
pub struct DormantAlternative {
    pub candidate_id: String,
    pub text: String,
    pub decision_id: String,
    pub decision_trigger: String,
    pub age_days: i64,
    pub reconsider_score: f64,
}

/// Whether any later decision revisits the rejected option by name.
fn revisited(
    store: &GraphStore,
    user_id: &str,
    option_text: &str,
    rejected_at: DateTime<Utc>,
) -> Result<bool> {
    let needle = option_text.to_lowercase();
    for decision in store.all_decisions(user_id)? {
        if decision.created_at <= rejected_at {
            continue;
        }
        if decision.agent_decision.to_lowercase().contains(&needle)
            || decision
                .options
                .iter()
                .any(|o| o.to_lowercase() == needle)
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Find dormant alternatives, ranked by reconsider score.
pub fn find_dormant_alternatives(
    store: &GraphStore,
    user_id: &str,
    min_age_days: i64,
    weights: DormantWeights,
    now: DateTime<Utc>,
) -> Result<Vec<DormantAlternative>> {
    let mut dormant = Vec::new();

    for candidate in store.candidates_for_user(user_id)? {
        let age_days = (now - candidate.rejected_at).num_days();
        if age_days < min_age_days {
            continue;
        }
        if revisited(store, user_id, &candidate.text, candidate.rejected_at)? {
            continue;
        }

        let parent = store.get_decision(user_id, &candidate.rejected_by_decision_id)?;
        let (trigger, parent_confidence) = match &parent {
            Some(d) => (d.trigger.clone(), d.confidence),
            None => (String::new(), 0.5),
        };

        // Age saturates at one year; low parent confidence raises the score.
        let age_factor = (age_days as f64 / 365.0).min(1.0);
        let confidence_penalty = 1.0 - parent_confidence.clamp(0.0, 1.0);
        let score = weights.age * age_factor + weights.confidence_penalty * confidence_penalty;

        dormant.push(DormantAlternative {
            candidate_id: candidate.id,
            text: candidate.text,
            decision_id: candidate.rejected_by_decision_id,
            decision_trigger: trigger,
            age_days,
            reconsider_score: (score * 1000.0).round() / 1000.0,
        });
    }

    dormant.sort_by(|a, b| {
        b.reconsider_score
            .partial_cmp(&a.reconsider_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(dormant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CandidateDecision, DecisionTrace};
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn seed_decision(store: &GraphStore, confidence: f64, age_days: i64) -> DecisionTrace {
        let mut d = DecisionTrace::new("pick a database", "Use PostgreSQL everywhere");
        d.user_id = Some("u1".into());
        d.confidence = confidence;
        d.created_at = Utc::now() - Duration::days(age_days);
        store.insert_decision(&d).unwrap();
        d
    }

    fn seed_candidate(store: &GraphStore, decision: &DecisionTrace, text: &str, age_days: i64) {
        store
            .insert_candidate(&CandidateDecision {
                id: Uuid::new_v4().to_string(),
                user_id: Some("u1".into()),
                text: text.to_string(),
                rejected_at: Utc::now() - Duration::days(age_days),
                rejected_by_decision_id: decision.id.clone(),
            })
            .unwrap();
    }

    #[test]
    fn test_young_candidates_excluded() {
        let store = GraphStore::in_memory().unwrap();
        let d = seed_decision(&store, 0.9, 5);
        seed_candidate(&store, &d, "MongoDB", 5);

        let dormant = find_dormant_alternatives(
            &store,
            "u1",
            14,
            DormantWeights::default(),
            Utc::now(),
        )
        .unwrap();
        assert!(dormant.is_empty());
    }

    #[test]
    fn test_revisited_candidates_excluded() {
        let store = GraphStore::in_memory().unwrap();
        let d = seed_decision(&store, 0.9, 60);
        seed_candidate(&store, &d, "MongoDB", 60);

        // A newer decision picked the rejected option up again.
        let mut newer = DecisionTrace::new("revisit storage", "Migrate to MongoDB for scale");
        newer.user_id = Some("u1".into());
        store.insert_decision(&newer).unwrap();

        let dormant = find_dormant_alternatives(
            &store,
            "u1",
            14,
            DormantWeights::default(),
            Utc::now(),
        )
        .unwrap();
        assert!(dormant.is_empty());
    }

    #[test]
    fn test_low_confidence_parent_ranks_higher() {
        let store = GraphStore::in_memory().unwrap();
        let shaky = seed_decision(&store, 0.4, 60);
        seed_candidate(&store, &shaky, "CockroachDB", 60);
        let solid = seed_decision(&store, 0.95, 60);
        seed_candidate(&store, &solid, "DynamoDB", 60);

        let dormant = find_dormant_alternatives(
            &store,
            "u1",
            14,
            DormantWeights::default(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(dormant.len(), 2);
        assert_eq!(dormant[0].text, "CockroachDB");
        assert!(dormant[0].reconsider_score > dormant[1].reconsider_score);
    }
}

//! Staleness detection: decisions past their scope's half-life.
//!
//! A decision ages from its last review (or creation). The threshold is a
//! function of scope: strategic decisions live for years, operational
//! ones for days. Reviewing a decision resets the clock without editing
//! the record.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::graph::GraphStore;
use crate::ontology::Scope;

/// One decision due for review.
#[derive(Debug, Clone, Serialize)]
pub struct StaleDecision {
    pub decision_id: String,
    pub trigger: String,
    pub scope: Scope,
    pub days_since_anchor: i64,
    pub threshold_days: i64,
    /// How far past the threshold, for ranking.
    pub overdue_days: i64,
}

/// All stale decisions for a user, most overdue first.
pub fn find_stale_decisions(
    store: &GraphStore,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<StaleDecision>> {
    let mut stale = Vec::new();
    for decision in store.all_decisions(user_id)? {
        let threshold = decision.scope.staleness_threshold_days();
        let days = (now - decision.staleness_anchor()).num_days();
        if days > threshold {
            stale.push(StaleDecision {
                decision_id: decision.id,
                trigger: decision.trigger,
                scope: decision.scope,
                days_since_anchor: days,
                threshold_days: threshold,
                overdue_days: days - threshold,
            });
        }
    }
    stale.sort_by_key(|s| std::cmp::Reverse(s.overdue_days));
    Ok(stale)
}

/// Reset a decision's staleness clock. Scope mismatch reports not-found.
pub fn mark_reviewed(store: &GraphStore, user_id: &str, decision_id: &str) -> Result<()> {
    if !store.mark_reviewed(user_id, decision_id, Utc::now())? {
        return Err(crate::error::Error::NotFound(format!(
            "decision {decision_id}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DecisionTrace;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn decision(store: &GraphStore, scope: Scope, age_days: i64) -> DecisionTrace {
        let mut d = DecisionTrace::new(format!("{scope} decision"), "some choice text");
        d.user_id = Some("u1".into());
        d.scope = scope;
        d.created_at = Utc::now() - Duration::days(age_days);
        store.insert_decision(&d).unwrap();
        d
    }

    #[test]
    fn test_scope_thresholds_drive_staleness() {
        let store = GraphStore::in_memory().unwrap();
        decision(&store, Scope::Operational, 20); // threshold 14 → stale
        decision(&store, Scope::Config, 40); // threshold 30 → stale
        decision(&store, Scope::Architectural, 40); // threshold 180 → fresh
        decision(&store, Scope::Strategic, 365); // threshold 730 → fresh

        let stale = find_stale_decisions(&store, "u1", Utc::now()).unwrap();
        assert_eq!(stale.len(), 2);
        // Sorted by overdue margin: config is 10 days over, operational 6.
        assert_eq!(stale[0].scope, Scope::Config);
        assert_eq!(stale[0].overdue_days, 10);
        assert_eq!(stale[1].scope, Scope::Operational);
    }

    #[test]
    fn test_review_resets_the_clock() {
        let store = GraphStore::in_memory().unwrap();
        let d = decision(&store, Scope::Operational, 30);
        assert_eq!(find_stale_decisions(&store, "u1", Utc::now()).unwrap().len(), 1);

        mark_reviewed(&store, "u1", &d.id).unwrap();
        assert!(find_stale_decisions(&store, "u1", Utc::now())
            .unwrap()
            .is_empty());

        // Another user cannot review it.
        assert!(mark_reviewed(&store, "u2", "missing-id").is_err());
    }
}

//! Background analyzers: pairwise supersession/contradiction, cycle
//! detection and integrity validation, staleness, dormant alternatives,
//! assumption monitoring, and the cross-user contradiction scan.

mod assumptions;
mod cross_user;
mod cycles;
mod dormant;
mod pair;
mod staleness;
mod validate;

pub use assumptions::{AssumptionMonitor, AssumptionViolation};
pub use cross_user::CrossUserScanner;
pub use cycles::{
    detect_all_cycles, detect_cycles, CyclePath, DEFAULT_MAX_DEPTH, MAX_CYCLES_PER_TYPE,
};
pub use dormant::{find_dormant_alternatives, DormantAlternative};
pub use pair::{PairAnalyzer, PairRelation, PairVerdict};
pub use staleness::{find_stale_decisions, mark_reviewed, StaleDecision};
pub use validate::{GraphValidator, IssueSeverity, IssueType, ValidationIssue};

use crate::error::Result;
use crate::graph::{DecisionTrace, Edge, GraphStore};
use crate::ontology::RelationType;

/// The SUPERSEDES ancestry and descendants of a decision.
#[derive(Debug, Clone)]
pub struct DecisionEvolution {
    pub decision: DecisionTrace,
    /// Older decisions this one (transitively) superseded, oldest last.
    pub supersedes: Vec<DecisionTrace>,
    /// Newer decisions that superseded this one, newest last.
    pub superseded_by: Vec<DecisionTrace>,
}

/// Walk the SUPERSEDES chain in both directions from a decision.
pub fn decision_evolution(
    store: &GraphStore,
    user_id: &str,
    decision_id: &str,
) -> Result<Option<DecisionEvolution>> {
    let Some(decision) = store.get_decision(user_id, decision_id)? else {
        return Ok(None);
    };

    let mut supersedes = Vec::new();
    let mut cursor = decision.id.clone();
    let mut hops = 0;
    while hops < 50 {
        let edges = store.edges_from(&cursor, Some(&[RelationType::Supersedes]))?;
        let Some(edge) = edges.first() else { break };
        let Some(older) = store.get_decision(user_id, &edge.dst_id)? else {
            break;
        };
        cursor = older.id.clone();
        supersedes.push(older);
        hops += 1;
    }

    let mut superseded_by = Vec::new();
    let mut cursor = decision.id.clone();
    let mut hops = 0;
    while hops < 50 {
        let edges = store.edges_to(&cursor, Some(&[RelationType::Supersedes]))?;
        let Some(edge) = edges.first() else { break };
        let Some(newer) = store.get_decision(user_id, &edge.src_id)? else {
            break;
        };
        cursor = newer.id.clone();
        superseded_by.push(newer);
        hops += 1;
    }

    Ok(Some(DecisionEvolution {
        decision,
        supersedes,
        superseded_by,
    }))
}

/// CONTRADICTS partners of one decision, with the connecting edges.
pub fn contradictions_for_decision(
    store: &GraphStore,
    user_id: &str,
    decision_id: &str,
) -> Result<Vec<(DecisionTrace, Edge)>> {
    let mut out = Vec::new();
    for edge in store.edges_from(decision_id, Some(&[RelationType::Contradicts]))? {
        if let Some(other) = store.get_decision(user_id, &edge.dst_id)? {
            out.push((other, edge));
        }
    }
    for edge in store.edges_to(decision_id, Some(&[RelationType::Contradicts]))? {
        if let Some(other) = store.get_decision(user_id, &edge.src_id)? {
            out.push((other, edge));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeKind;
    use pretty_assertions::assert_eq;

    fn decision(store: &GraphStore, text: &str) -> DecisionTrace {
        let mut d = DecisionTrace::new("storage", text);
        d.user_id = Some("u1".into());
        store.insert_decision(&d).unwrap();
        d
    }

    #[test]
    fn test_evolution_chain_walks_both_directions() {
        let store = GraphStore::in_memory().unwrap();
        let v1 = decision(&store, "Use files on disk");
        let v2 = decision(&store, "Use SQLite");
        let v3 = decision(&store, "Use PostgreSQL");
        for (newer, older) in [(&v2, &v1), (&v3, &v2)] {
            store
                .merge_edge(&Edge::new(
                    newer.id.clone(),
                    NodeKind::Decision,
                    older.id.clone(),
                    NodeKind::Decision,
                    RelationType::Supersedes,
                ))
                .unwrap();
        }

        let evolution = decision_evolution(&store, "u1", &v2.id).unwrap().unwrap();
        assert_eq!(evolution.supersedes.len(), 1);
        assert_eq!(evolution.supersedes[0].id, v1.id);
        assert_eq!(evolution.superseded_by.len(), 1);
        assert_eq!(evolution.superseded_by[0].id, v3.id);

        // Scope mismatch reports as absent.
        assert!(decision_evolution(&store, "u2", &v2.id).unwrap().is_none());
    }

    #[test]
    fn test_contradictions_listing() {
        let store = GraphStore::in_memory().unwrap();
        let a = decision(&store, "Use tabs");
        let b = decision(&store, "Use spaces");
        store
            .merge_edge(
                &Edge::new(
                    a.id.clone(),
                    NodeKind::Decision,
                    b.id.clone(),
                    NodeKind::Decision,
                    RelationType::Contradicts,
                )
                .with_confidence(0.9),
            )
            .unwrap();

        let from_a = contradictions_for_decision(&store, "u1", &a.id).unwrap();
        assert_eq!(from_a.len(), 1);
        assert_eq!(from_a[0].0.id, b.id);
        // Symmetric from the other side.
        let from_b = contradictions_for_decision(&store, "u1", &b.id).unwrap();
        assert_eq!(from_b.len(), 1);
        assert_eq!(from_b[0].0.id, a.id);
    }
}

//! Confidence calibration for extracted decisions.
//!
//! Raw LLM confidence is optimistic and uncalibrated. The composite method
//! blends it with observable signals: field completeness, whether the
//! claimed verbatim quote actually appears in the source, and the fidelity
//! of the rationale's origin. Temperature scaling is a selectable
//! alternative that sharpens the raw score instead.

use crate::graph::RationaleAuthor;

use super::RawDecision;

/// Fraction of the five core fields carrying ≥ 20 meaningful characters.
///
/// Decisions under 0.6 get a gleaning pass.
pub fn completeness_score(d: &RawDecision) -> f64 {
    let mut filled = 0usize;
    for text in [&d.trigger, &d.context, &d.decision, &d.rationale] {
        if text.trim().len() >= 20 {
            filled += 1;
        }
    }
    if d.options.iter().any(|o| o.len() >= 5) {
        filled += 1;
    }
    filled as f64 / 5.0
}

/// Evidence score: does the decision's verbatim quote appear in the source?
///
/// 1.0 for an exact (whitespace-normalized, case-insensitive) hit, 0.5 when
/// at least 60% of the quote's words appear, 0.2 otherwise. A decision with
/// no verbatim quote at all scores a neutral 0.35.
pub fn evidence_score(d: &RawDecision, conversation_text: &str) -> f64 {
    let quote = d
        .verbatim_decision
        .as_deref()
        .or(d.verbatim_trigger.as_deref());
    let Some(quote) = quote.filter(|q| !q.trim().is_empty()) else {
        return 0.35;
    };

    let normalized_quote = normalize_ws(quote).to_lowercase();
    let normalized_source = normalize_ws(conversation_text).to_lowercase();
    if normalized_source.contains(&normalized_quote) {
        return 1.0;
    }

    let words: Vec<&str> = normalized_quote.split(' ').filter(|w| !w.is_empty()).collect();
    if words.is_empty() {
        return 0.2;
    }
    let hits = words
        .iter()
        .filter(|w| normalized_source.contains(*w))
        .count();
    if hits as f64 / words.len() as f64 >= 0.6 {
        0.5
    } else {
        0.2
    }
}

/// Composite calibration:
/// `0.4·raw + 0.3·completeness + 0.2·evidence + 0.1·source_fidelity`.
pub fn calibrate_composite(
    d: &RawDecision,
    rationale_author: RationaleAuthor,
    conversation_text: &str,
) -> f64 {
    let raw = d.confidence.clamp(0.0, 1.0);
    let completeness = completeness_score(d);
    let evidence = evidence_score(d, conversation_text);
    let source = rationale_author.fidelity();

    let calibrated = raw * 0.4 + completeness * 0.3 + evidence * 0.2 + source * 0.1;
    (calibrated.clamp(0.0, 1.0) * 1000.0).round() / 1000.0
}

/// Temperature scaling: `raw^(1/T)` with a light completeness penalty.
pub fn calibrate_temperature(d: &RawDecision, temperature: f64) -> f64 {
    let raw = d.confidence.clamp(0.0, 1.0);
    if raw <= 0.0 {
        return 0.0;
    }
    let t = if temperature > 0.0 { temperature } else { 1.0 };
    let mut calibrated = raw.powf(1.0 / t);

    let missing = 5 - (completeness_score(d) * 5.0).round() as i32;
    calibrated *= 1.0 - missing as f64 * 0.05;
    (calibrated.clamp(0.0, 1.0) * 1000.0).round() / 1000.0
}

fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_decision() -> RawDecision {
        RawDecision {
            trigger: "Need to select a primary datastore".into(),
            context: "Team has deep SQL experience and relational data".into(),
            options: vec!["PostgreSQL".into(), "MongoDB".into()],
            decision: "Use PostgreSQL as the primary database".into(),
            rationale: "Better fit for relational data, team knows SQL".into(),
            confidence: 0.9,
            ..RawDecision::default()
        }
    }

    #[test]
    fn test_completeness_full_and_empty() {
        assert!((completeness_score(&full_decision()) - 1.0).abs() < 1e-9);
        let sparse = RawDecision {
            decision: "Use PostgreSQL everywhere".into(),
            ..RawDecision::default()
        };
        assert!(completeness_score(&sparse) < 0.6);
    }

    #[test]
    fn test_evidence_exact_partial_none() {
        let mut d = full_decision();
        d.verbatim_decision = Some("let's go with PostgreSQL".into());
        let source = "We compared options.  Let's go   with PostgreSQL.";
        assert!((evidence_score(&d, source) - 1.0).abs() < 1e-9);

        d.verbatim_decision = Some("let's definitely go with PostgreSQL today".into());
        assert!((evidence_score(&d, source) - 0.5).abs() < 1e-9);

        d.verbatim_decision = Some("completely unrelated quotation".into());
        assert!((evidence_score(&d, "nothing in common here") - 0.2).abs() < 1e-9);

        d.verbatim_decision = None;
        d.verbatim_trigger = None;
        assert!((evidence_score(&d, source) - 0.35).abs() < 1e-9);
    }

    #[test]
    fn test_composite_weights() {
        let mut d = full_decision();
        d.verbatim_decision = Some("use postgresql as the primary database".into());
        let source = "user: Use PostgreSQL as the primary database";
        // raw=0.9, completeness=1.0, evidence=1.0, fidelity(thinking)=1.0
        let score = calibrate_composite(&d, RationaleAuthor::Thinking, source);
        assert!((score - (0.9 * 0.4 + 1.0 * 0.3 + 1.0 * 0.2 + 1.0 * 0.1)).abs() < 1e-6);
    }

    #[test]
    fn test_temperature_scaling_sharpens() {
        let d = full_decision();
        let scaled = calibrate_temperature(&d, 1.5);
        // 0.9^(1/1.5) > 0.9, no completeness penalty
        assert!(scaled > 0.9);
        assert!(scaled <= 1.0);

        let zero = RawDecision {
            confidence: 0.0,
            ..RawDecision::default()
        };
        assert_eq!(calibrate_temperature(&zero, 1.5), 0.0);
    }

    #[cfg(test)]
    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn composite_always_in_unit_interval(
                raw in 0.0f64..=1.0,
                trigger in ".*",
                rationale in ".*",
            ) {
                let d = RawDecision {
                    trigger,
                    rationale,
                    confidence: raw,
                    ..RawDecision::default()
                };
                for author in [
                    RationaleAuthor::Thinking,
                    RationaleAuthor::User,
                    RationaleAuthor::Assistant,
                ] {
                    let c = calibrate_composite(&d, author, "some source text");
                    prop_assert!((0.0..=1.0).contains(&c));
                }
            }

            #[test]
            fn temperature_always_in_unit_interval(
                raw in 0.0f64..=1.0,
                temperature in 0.5f64..=3.0,
            ) {
                let d = RawDecision {
                    confidence: raw,
                    ..RawDecision::default()
                };
                let c = calibrate_temperature(&d, temperature);
                prop_assert!((0.0..=1.0).contains(&c));
            }
        }
    }
}

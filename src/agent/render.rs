//! Markdown rendering of focused context for LLM consumption.

use super::{ContextDecision, FocusedContext};

fn render_decision(d: &ContextDecision) -> String {
    let mut lines = vec![format!(
        "### {}{}",
        d.agent_decision,
        if d.superseded { " (superseded)" } else { "" }
    )];
    lines.push(format!("- Trigger: {}", d.trigger));
    if !d.context.is_empty() {
        lines.push(format!("- Context: {}", d.context));
    }
    if !d.rationale.is_empty() {
        lines.push(format!("- Rationale: {}", d.rationale));
    }
    if !d.entities.is_empty() {
        lines.push(format!("- Involves: {}", d.entities.join(", ")));
    }
    lines.push(format!("- Confidence: {:.2}", d.confidence));
    lines.join("\n")
}

/// Render a focused context block as markdown.
pub fn render_markdown(context: &FocusedContext) -> String {
    let mut sections = vec![format!("## Decisions relevant to: {}", context.query)];

    if context.decisions.is_empty() {
        sections.push("_No relevant decisions recorded._".to_string());
    }
    for decision in &context.decisions {
        sections.push(render_decision(decision));
    }

    if !context.supersession_chains.is_empty() {
        let mut block = vec!["## Evolution".to_string()];
        for chain in &context.supersession_chains {
            block.push(format!("- {}", chain.join(" → ")));
        }
        sections.push(block.join("\n"));
    }

    if !context.contradictions.is_empty() {
        let mut block = vec!["## Open contradictions".to_string()];
        for (a, b) in &context.contradictions {
            block.push(format!("- \"{a}\" vs \"{b}\""));
        }
        sections.push(block.join("\n"));
    }

    sections.join("\n\n")
}

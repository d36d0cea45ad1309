//! Prompt templates for decision, entity, and relationship extraction.

use std::sync::OnceLock;

/// Category of decision, used to pick a specialized few-shot prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecisionType {
    Architecture,
    Technology,
    Process,
    General,
}

impl DecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Architecture => "architecture",
            Self::Technology => "technology",
            Self::Process => "process",
            Self::General => "general",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "architecture" => Some(Self::Architecture),
            "technology" => Some(Self::Technology),
            "process" => Some(Self::Process),
            "general" => Some(Self::General),
            _ => None,
        }
    }
}

/// Exact trigger strings from the few-shot examples below. An extraction
/// whose trigger matches one of these has hallucinated an example rather
/// than read the conversation; the validation gate rejects it outright.
pub const KNOWN_EXAMPLE_TRIGGERS: [&str; 4] = [
    "need to select a database for the project",
    "need to choose frontend framework",
    "need to choose a styling approach",
    "need for better type safety in component",
];

/// Placeholder applied when the LLM omits the trigger entirely.
pub const DEFAULT_TRIGGER: &str = "Unknown trigger";

const GENERAL_PROMPT: &str = r#"Analyze this conversation and extract any technical decisions made.

## What constitutes a decision?
A decision is a choice that affects the project direction, architecture, or implementation:
- **Explicit decisions**: "Should we use X or Y? Let's use X because..."
- **Implicit decisions**: "Let's use X for this" (even without stated alternatives)
- **Technical choices**: Framework selections, architecture patterns, tool adoptions
- **Implementation strategies**: How to solve a problem, approach to take

## Examples

### Example 1: Single clear decision
Conversation:
"We need to pick a database. I looked at PostgreSQL and MongoDB. PostgreSQL seems better for our relational data needs and the team already knows SQL. Let's go with PostgreSQL."

Output:
```json
[
  {
    "trigger": "Need to select a database for the project",
    "context": "Team has SQL experience, data is relational in nature",
    "options": ["PostgreSQL", "MongoDB"],
    "decision": "Use PostgreSQL as the primary database",
    "rationale": "Better fit for relational data and team already has SQL expertise",
    "confidence": 0.95,
    "scope": "architectural",
    "assumptions": ["team has existing SQL expertise", "data model is relational"]
  }
]
```

### Example 2: Multiple decisions in one conversation
Conversation:
"For the frontend, React makes sense since we're already using it elsewhere. For styling, I considered Tailwind vs CSS modules. Tailwind will speed up development, so let's use that."

Output:
```json
[
  {"trigger": "Need to choose frontend framework", "context": "Team already using React in other projects", "options": ["React"], "decision": "Use React for the frontend", "rationale": "Consistency with existing projects", "confidence": 0.9, "scope": "library", "assumptions": []},
  {"trigger": "Need to choose a styling approach", "context": "Building frontend with React", "options": ["Tailwind CSS", "CSS modules"], "decision": "Use Tailwind CSS for styling", "rationale": "Faster development with utility classes", "confidence": 0.85, "scope": "library", "assumptions": []}
]
```

### Example 3: Implicit decision (no alternatives stated)
Conversation:
"Let's add TypeScript to this component for better type safety."

Output:
```json
[
  {"trigger": "Need for better type safety in component", "context": "Existing component lacks type checking", "options": ["TypeScript"], "decision": "Add TypeScript to the component", "rationale": "Improves type safety and code quality", "confidence": 0.85, "scope": "config", "assumptions": []}
]
```

### Example 4: No decisions (just discussion)
Conversation:
"What do you think about microservices? We should probably discuss this more with the team before deciding anything."

Output:
```json
[]
```

## Instructions
For each decision found, provide:
- trigger: What prompted the decision (be specific)
- context: Relevant background (constraints, requirements, team situation)
- options: Alternatives considered (can be just [chosen_option] if none mentioned)
- decision: What was decided (clear statement)
- rationale: Why this choice (or "Not explicitly stated" if unclear)
- confidence: 0.0-1.0 (how clear/complete the decision is)
- verbatim_trigger: EXACT quote from the conversation for the trigger
- verbatim_decision: EXACT quote for the decision
- verbatim_rationale: EXACT quote for the rationale (if available)
- turn_index: Which conversation turn (0-indexed) this decision came from
- scope: One of "strategic", "architectural", "library", "config", "operational"
- assumptions: Explicit assumptions this decision relies on

**Important**:
- Extract both explicit decisions (X vs Y) and implicit ones ("Let's use X")
- If only one option is mentioned, that's still a decision
- If no clear decisions are found, return an empty array []
- VERBATIM PRESERVATION: preserve qualifiers like "everywhere", "always", "never" exactly as written

## Conversation to analyze:
{conversation_text}

Return ONLY valid JSON, no markdown code blocks or explanation."#;

const ARCHITECTURE_PROMPT: &str = r#"Analyze this conversation for ARCHITECTURE DECISIONS.

Focus on: system structure, scalability, communication patterns, tradeoffs.

## Example
Conversation: "We decided to start with a modular monolith given our small team."
Output:
```json
[{"trigger": "Deciding on system architecture", "context": "Small team", "options": ["Microservices", "Monolith"], "decision": "Modular monolith", "rationale": "Reduced complexity for small team", "confidence": 0.9, "decision_type": "architecture"}]
```

## Conversation to analyze:
{conversation_text}

Return ONLY valid JSON, no markdown code blocks or explanation."#;

const TECHNOLOGY_PROMPT: &str = r#"Analyze this conversation for TECHNOLOGY CHOICE DECISIONS.

Focus on: tools, frameworks, alternatives considered, compatibility, team skills.

## Example
Conversation: "We chose PostgreSQL over MongoDB for ACID compliance."
Output:
```json
[{"trigger": "Selecting database", "context": "Need ACID compliance", "options": ["PostgreSQL", "MongoDB"], "decision": "PostgreSQL", "rationale": "Better transactional support", "confidence": 0.95, "decision_type": "technology"}]
```

## Conversation to analyze:
{conversation_text}

Return ONLY valid JSON, no markdown code blocks or explanation."#;

const PROCESS_PROMPT: &str = r#"Analyze this conversation for PROCESS and WORKFLOW DECISIONS.

Focus on: team workflows, deployment practices, quality assurance, collaboration.

## Example
Conversation: "We are implementing mandatory code reviews with CODEOWNERS."
Output:
```json
[{"trigger": "Establishing code review practices", "context": "Need quality improvement", "options": ["Optional reviews", "Mandatory reviews"], "decision": "Mandatory reviews with CODEOWNERS", "rationale": "Ensures expert review", "confidence": 0.85, "decision_type": "process"}]
```

## Conversation to analyze:
{conversation_text}

Return ONLY valid JSON, no markdown code blocks or explanation."#;

const TYPE_DETECTION_PROMPT: &str = r#"Analyze this conversation and classify the PRIMARY type of decision being made.

Decision types:
- architecture: System structure, scalability, communication patterns, architectural tradeoffs
- technology: Tool/framework/library selection, technology choices, compatibility decisions
- process: Team workflows, deployment practices, quality assurance, collaboration processes
- general: Other types of decisions or unclear/mixed types

## Examples

Conversation: "We decided to use microservices architecture for better scalability."
Classification: architecture

Conversation: "Choosing PostgreSQL over MongoDB for ACID compliance."
Classification: technology

Conversation: "Implementing mandatory code reviews with CODEOWNERS."
Classification: process

## Conversation to analyze:
{conversation_text}

Return ONLY the decision type (one word: architecture, technology, process, or general), no explanation."#;

const ENTITY_PROMPT: &str = r#"Extract technical entities from this decision text.

## Entity Types
- technology: Specific tools, languages, frameworks, databases (e.g., PostgreSQL, React, Python)
- concept: Abstract ideas, principles, methodologies (e.g., microservices, REST API, caching)
- pattern: Design and architectural patterns (e.g., singleton, repository pattern, CQRS)
- system: Software systems, services, components (e.g., authentication system, payment gateway)
- person: People mentioned (team members, stakeholders)
- organization: Companies, teams, departments

## Example
Input: "We chose React over Vue for the frontend"
Output:
{
  "entities": [
    {"name": "React", "type": "technology", "confidence": 0.95},
    {"name": "Vue", "type": "technology", "confidence": 0.95},
    {"name": "frontend", "type": "concept", "confidence": 0.85}
  ]
}

## Decision text:
{decision_text}

Return ONLY valid JSON with an "entities" list, no explanation."#;

const RELATIONSHIP_PROMPT: &str = r#"Identify relationships between these entities based on the decision text.

## Relationship types
- IS_A: X is a type/category of Y (PostgreSQL IS_A database)
- PART_OF: X is a component of Y (React PART_OF frontend)
- DEPENDS_ON: X requires Y to function (Next.js DEPENDS_ON React)
- ALTERNATIVE_TO: X can substitute for Y (MongoDB ALTERNATIVE_TO PostgreSQL)
- ENABLES: X makes Y possible (Docker ENABLES containerization)
- PREVENTS: X blocks Y (Rate limiting PREVENTS abuse)
- REQUIRES: X strictly needs Y (OAuth REQUIRES HTTPS)
- REFINES: X is a more specific version of Y (FastAPI REFINES Starlette)
- RELATED_TO: general association when nothing stronger applies

## Example
Entities: Next.js, React, TypeScript, frontend
Decision text: "Next.js with TypeScript for the frontend since it builds on React"
Output:
{
  "relationships": [
    {"from": "Next.js", "to": "React", "type": "DEPENDS_ON", "confidence": 0.95},
    {"from": "Next.js", "to": "frontend", "type": "PART_OF", "confidence": 0.9},
    {"from": "TypeScript", "to": "frontend", "type": "PART_OF", "confidence": 0.85}
  ]
}

## Entities:
{entities}

## Decision text:
{decision_text}

Identify relationships. Only include relationships you're confident about (>0.7 confidence).
Return ONLY valid JSON with a "relationships" list, no explanation."#;

/// Keyword lists for the fallback classifier.
fn type_keywords() -> &'static [(DecisionType, &'static [&'static str])] {
    static KEYWORDS: OnceLock<Vec<(DecisionType, &'static [&'static str])>> = OnceLock::new();
    KEYWORDS.get_or_init(|| {
        vec![
            (
                DecisionType::Architecture,
                &[
                    "architecture",
                    "microservice",
                    "monolith",
                    "distributed",
                    "scalability",
                    "api gateway",
                    "event-driven",
                    "message queue",
                    "load balancer",
                ][..],
            ),
            (
                DecisionType::Technology,
                &[
                    "framework",
                    "library",
                    "database",
                    "postgres",
                    "mongodb",
                    "redis",
                    "react",
                    "vue",
                    "python",
                    "typescript",
                    "aws",
                    "docker",
                ][..],
            ),
            (
                DecisionType::Process,
                &[
                    "workflow",
                    "process",
                    "ci/cd",
                    "deployment",
                    "code review",
                    "branching",
                    "agile",
                    "sprint",
                    "release",
                ][..],
            ),
        ]
    })
}

/// Keyword-count fallback classifier: requires at least two hits.
pub fn detect_decision_type_keywords(text: &str) -> DecisionType {
    let lower = text.to_lowercase();
    let mut best = DecisionType::General;
    let mut best_score = 0usize;
    for (dtype, keywords) in type_keywords() {
        let score = keywords.iter().filter(|k| lower.contains(*k)).count();
        if score > best_score {
            best_score = score;
            best = *dtype;
        }
    }
    if best_score >= 2 {
        best
    } else {
        DecisionType::General
    }
}

pub fn extraction_prompt(decision_type: DecisionType, conversation_text: &str) -> String {
    let template = match decision_type {
        DecisionType::Architecture => ARCHITECTURE_PROMPT,
        DecisionType::Technology => TECHNOLOGY_PROMPT,
        DecisionType::Process => PROCESS_PROMPT,
        DecisionType::General => GENERAL_PROMPT,
    };
    template.replace("{conversation_text}", conversation_text)
}

/// Rough token estimate of the extraction template itself.
pub fn extraction_prompt_overhead(decision_type: DecisionType) -> usize {
    let template = match decision_type {
        DecisionType::Architecture => ARCHITECTURE_PROMPT,
        DecisionType::Technology => TECHNOLOGY_PROMPT,
        DecisionType::Process => PROCESS_PROMPT,
        DecisionType::General => GENERAL_PROMPT,
    };
    template.len() / 4
}

pub fn type_detection_prompt(conversation_text: &str) -> String {
    TYPE_DETECTION_PROMPT.replace("{conversation_text}", conversation_text)
}

pub fn entity_prompt(decision_text: &str) -> String {
    ENTITY_PROMPT.replace("{decision_text}", decision_text)
}

pub fn relationship_prompt(entities: &[String], decision_text: &str) -> String {
    RELATIONSHIP_PROMPT
        .replace("{entities}", &entities.join(", "))
        .replace("{decision_text}", decision_text)
}

pub fn verify_prompt(source_excerpt: &str, decision_json: &str) -> String {
    format!(
        r#"You are verifying a decision extracted from a conversation.

Source conversation (excerpt):
{source_excerpt}

Extracted decision:
{decision_json}

Verify:
1. Does the decision text actually appear or is it clearly inferable from the source? (yes/no)
2. Is this from the IMPLEMENTED path (not an abandoned/rejected alternative)? (yes/no)
3. Are the options[] actual alternatives considered, not just mentions? (yes/no)
4. What is the appropriate confidence (0.0-1.0) based on evidence?
5. Are there any corrections needed for trigger, decision, or rationale fields?

Respond as JSON:
{{"is_valid": true/false, "on_implemented_path": true/false, "issues": ["..."], "corrected_fields": {{}}, "evidence_confidence": 0.0-1.0}}"#
    )
}

pub fn glean_prompt(source_excerpt: &str, partials_json: &str) -> String {
    format!(
        "Below is a partial decision extraction from a conversation. \
         Several fields are missing or too short. \
         Re-extract ONLY the missing fields for each decision.\n\n\
         ORIGINAL CONVERSATION (excerpt):\n{source_excerpt}\n\n\
         PARTIAL EXTRACTIONS:\n{partials_json}\n\n\
         For each partial decision, fill in any missing: context, options, rationale, \
         scope, assumptions. Return a JSON list with the same indices, containing ONLY \
         the filled-in fields. Return: [{{\"idx\": 0, \"context\": \"...\"}}]"
    )
}

pub fn retry_prompt(rejection_reason: &str, partial_json: &str, source_excerpt: &str) -> String {
    format!(
        "The following decision extraction failed validation: {rejection_reason}\n\n\
         Partial extraction:\n{partial_json}\n\n\
         Source conversation (excerpt):\n{source_excerpt}\n\n\
         Please re-extract this single decision with all required fields \
         (trigger min 10 chars, decision min 10 chars, confidence 0.3-1.0). \
         Return a JSON object (not a list)."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_detection_requires_two_hits() {
        assert_eq!(
            detect_decision_type_keywords("We discussed the database briefly"),
            DecisionType::General
        );
        assert_eq!(
            detect_decision_type_keywords("Choosing a database: postgres vs mongodb"),
            DecisionType::Technology
        );
        assert_eq!(
            detect_decision_type_keywords(
                "The architecture debate: microservice or monolith for scalability"
            ),
            DecisionType::Architecture
        );
    }

    #[test]
    fn test_prompt_substitution() {
        let prompt = extraction_prompt(DecisionType::General, "user: pick a db");
        assert!(prompt.contains("user: pick a db"));
        assert!(!prompt.contains("{conversation_text}"));

        let ep = entity_prompt("We chose Kafka");
        assert!(ep.contains("We chose Kafka"));

        let rp = relationship_prompt(&["Kafka".into(), "messaging".into()], "Kafka for messaging");
        assert!(rp.contains("Kafka, messaging"));
    }

    #[test]
    fn test_known_triggers_match_examples() {
        let prompt = extraction_prompt(DecisionType::General, "x");
        for trigger in KNOWN_EXAMPLE_TRIGGERS {
            // Each guard string appears (case-insensitively) in the few-shots.
            assert!(
                prompt.to_lowercase().contains(trigger),
                "guard trigger missing from prompt: {trigger}"
            );
        }
    }
}

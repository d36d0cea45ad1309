//! Decision extraction: turning conversations into validated, calibrated
//! decision traces.
//!
//! The pipeline per conversation: pick a specialized few-shot prompt via a
//! cached type-detection call (keyword fallback), budget and truncate the
//! prompt keeping the most recent turns, consult the response cache, run
//! the extraction call, glean missing fields once, retry gate failures
//! once, calibrate confidence, verify low-confidence decisions
//! concurrently, gate, and ground verbatim quotes to character spans.
//! Connection failures and unparseable responses yield an empty list; the
//! cache is populated only with decisions that survived validation.

mod calibrate;
mod json;
mod prompts;
mod verbatim;

pub use calibrate::{
    calibrate_composite, calibrate_temperature, completeness_score, evidence_score,
};
pub use json::{extract_json, extract_json_list};
pub use prompts::{
    detect_decision_type_keywords, DecisionType, DEFAULT_TRIGGER, KNOWN_EXAMPLE_TRIGGERS,
};
pub use verbatim::find_text_span;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::CalibrationMethod;
use crate::error::{Error, Result};
use crate::graph::{DecisionSource, DecisionTrace, Provenance, RationaleAuthor};
use crate::llm::{estimate_tokens, GenerateOptions, LlmService, ResponseCache};
use crate::ontology::EntityType;
use crate::parser::{Conversation, Episode, Message, Role};

/// One decision as returned by the LLM, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDecision {
    #[serde(default)]
    pub trigger: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub decision: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default = "RawDecision::default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub verbatim_trigger: Option<String>,
    #[serde(default)]
    pub verbatim_decision: Option<String>,
    #[serde(default)]
    pub verbatim_rationale: Option<String>,
    #[serde(default)]
    pub turn_index: Option<i64>,
    #[serde(default)]
    pub decision_type: Option<String>,
    #[serde(skip)]
    pub raw_confidence: f64,
    #[serde(skip)]
    pub verify_rejected: bool,
}

impl Default for RawDecision {
    fn default() -> Self {
        Self {
            trigger: String::new(),
            context: String::new(),
            options: Vec::new(),
            decision: String::new(),
            rationale: String::new(),
            confidence: Self::default_confidence(),
            scope: None,
            assumptions: Vec::new(),
            verbatim_trigger: None,
            verbatim_decision: None,
            verbatim_rationale: None,
            turn_index: None,
            decision_type: None,
            raw_confidence: Self::default_confidence(),
            verify_rejected: false,
        }
    }
}

impl RawDecision {
    fn default_confidence() -> f64 {
        0.5
    }

    /// Tolerant construction from an LLM JSON value: `options` given as a
    /// bare string becomes a one-element list, stray fields are dropped.
    pub fn from_value(mut value: Value) -> Option<Self> {
        let obj = value.as_object_mut()?;
        if let Some(options) = obj.get_mut("options") {
            if let Value::String(s) = options {
                *options = Value::Array(vec![Value::String(std::mem::take(s))]);
            } else if !options.is_array() {
                *options = Value::Array(Vec::new());
            }
        }
        serde_json::from_value(value).ok()
    }

    /// Fill placeholder defaults for missing fields.
    fn apply_defaults(&mut self) {
        if self.trigger.trim().is_empty() {
            self.trigger = DEFAULT_TRIGGER.to_string();
        }
    }

    /// Merge non-empty fields of a gleaning/retry patch into empty slots.
    fn merge_patch(&mut self, patch: &serde_json::Map<String, Value>) {
        for (key, value) in patch {
            match (key.as_str(), value) {
                ("context", Value::String(s)) if self.context.trim().is_empty() && !s.is_empty() => {
                    self.context = s.clone();
                }
                ("rationale", Value::String(s))
                    if self.rationale.trim().is_empty() && !s.is_empty() =>
                {
                    self.rationale = s.clone();
                }
                ("trigger", Value::String(s)) if !s.is_empty() => {
                    if self.trigger.trim().is_empty() || self.trigger == DEFAULT_TRIGGER {
                        self.trigger = s.clone();
                    }
                }
                ("decision", Value::String(s)) if self.decision.trim().is_empty() && !s.is_empty() => {
                    self.decision = s.clone();
                }
                ("options", Value::Array(items)) if self.options.is_empty() => {
                    self.options = items
                        .iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect();
                }
                ("assumptions", Value::Array(items)) if self.assumptions.is_empty() => {
                    self.assumptions = items
                        .iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect();
                }
                ("scope", Value::String(s)) if self.scope.is_none() && !s.is_empty() => {
                    self.scope = Some(s.clone());
                }
                ("confidence", Value::Number(n)) => {
                    if let Some(c) = n.as_f64() {
                        self.confidence = c;
                    }
                }
                _ => {}
            }
        }
    }
}

/// Strict validation gate before storage. Returns the rejection reason.
pub fn validate_decision(d: &RawDecision) -> std::result::Result<(), String> {
    let decision_text = d.decision.trim();
    let trigger_text = d.trigger.trim();

    if KNOWN_EXAMPLE_TRIGGERS.contains(&trigger_text.to_lowercase().as_str()) {
        return Err(format!(
            "trigger matches known few-shot example (hallucination): '{trigger_text}'"
        ));
    }
    if decision_text.is_empty() {
        return Err("empty decision field".to_string());
    }
    if decision_text.len() < 10 {
        return Err(format!(
            "decision too short ({} chars): '{decision_text}'",
            decision_text.len()
        ));
    }
    if trigger_text.is_empty() {
        return Err("empty trigger field".to_string());
    }
    if trigger_text == DEFAULT_TRIGGER {
        return Err("trigger is placeholder".to_string());
    }
    if d.confidence < 0.3 {
        return Err(format!("confidence too low ({:.2} < 0.3)", d.confidence));
    }
    if d.verify_rejected {
        return Err("rejected by verify pass".to_string());
    }
    Ok(())
}

/// Who supplied the rationale: thinking block beats user phrasing beats
/// assistant paraphrase.
pub fn detect_rationale_author(rationale: &str, messages: &[Message]) -> RationaleAuthor {
    if messages.iter().any(|m| m.thinking.is_some()) {
        return RationaleAuthor::Thinking;
    }
    let rationale = rationale.trim().to_lowercase();
    if rationale.len() > 10 {
        let probe: String = rationale.chars().take(50).collect();
        for msg in messages {
            if msg.role == Role::User && msg.content.to_lowercase().contains(&probe) {
                return RationaleAuthor::User;
            }
        }
    }
    RationaleAuthor::Assistant
}

/// A typed entity mention extracted from decision text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    #[serde(default = "ExtractedEntity::default_confidence")]
    pub confidence: f64,
}

impl ExtractedEntity {
    fn default_confidence() -> f64 {
        0.8
    }
}

/// An entity-entity relationship proposed by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedRelationship {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    #[serde(default = "ExtractedEntity::default_confidence")]
    pub confidence: f64,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    #[serde(default = "default_true")]
    is_valid: bool,
    #[serde(default = "default_true")]
    on_implemented_path: bool,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    corrected_fields: serde_json::Map<String, Value>,
    #[serde(default)]
    evidence_confidence: Option<f64>,
}

fn default_true() -> bool {
    true
}

/// The extraction front end.
pub struct DecisionExtractor {
    llm: Arc<LlmService>,
    cache: ResponseCache,
}

impl DecisionExtractor {
    pub fn new(llm: Arc<LlmService>, cache: ResponseCache) -> Self {
        Self { llm, cache }
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Detect the conversation's decision type with a small cached LLM
    /// call; fall back to keyword counting on any failure.
    pub async fn detect_decision_type(&self, text: &str) -> DecisionType {
        let prefix: String = text.chars().take(2000).collect();

        if let Ok(Some(cached)) = self.cache.get("decision_type", &prefix).await {
            if let Some(dtype) = DecisionType::parse(&cached) {
                return dtype;
            }
        }

        let prompt = prompts::type_detection_prompt(&prefix);
        match self
            .llm
            .generate(
                prompt,
                GenerateOptions::new()
                    .with_temperature(0.3)
                    .with_max_tokens(200)
                    .trusted(),
            )
            .await
        {
            Ok(response) => {
                let word = response.content.trim().to_lowercase();
                match DecisionType::parse(&word) {
                    Some(dtype) => {
                        let _ = self.cache.put("decision_type", &prefix, dtype.as_str()).await;
                        dtype
                    }
                    None => {
                        warn!(raw = %word, "invalid decision type from LLM, using keywords");
                        detect_decision_type_keywords(text)
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "decision type detection failed, using keywords");
                detect_decision_type_keywords(text)
            }
        }
    }

    /// Truncate the conversation text to the prompt budget, keeping the
    /// most recent messages and a marker for what was dropped.
    fn budget_conversation_text(
        &self,
        conversation: &Conversation,
        structured: String,
        thinking_len: usize,
    ) -> String {
        let budget = self.llm.config().effective_prompt_budget();
        let template_overhead = prompts::extraction_prompt_overhead(DecisionType::General);
        let available = budget
            .saturating_sub(template_overhead)
            .saturating_sub(thinking_len / 4)
            .saturating_sub(1000);

        if estimate_tokens(&structured) <= available {
            return structured;
        }

        let target_chars = available.saturating_sub(500) * 4;
        warn!(
            tokens = estimate_tokens(&structured),
            available, "conversation too large, truncating to recent messages"
        );

        let mut kept: Vec<String> = Vec::new();
        let mut current_len = 0usize;
        let total = conversation.messages.len();
        for msg in conversation.messages.iter().rev() {
            let rendered = render_message(msg);
            if current_len + rendered.len() > target_chars {
                kept.insert(
                    0,
                    format!(
                        "[TRUNCATED: {} earlier messages removed to fit token limit]",
                        total - kept.len()
                    ),
                );
                break;
            }
            current_len += rendered.len() + 2;
            kept.insert(0, rendered);
        }
        kept.join("\n\n")
    }

    /// Extract decision traces from a conversation.
    pub async fn extract_decisions(
        &self,
        conversation: &Conversation,
    ) -> Result<Vec<DecisionTrace>> {
        let episode_thinking: String = conversation
            .messages
            .iter()
            .filter_map(|m| m.thinking.as_deref())
            .collect::<Vec<_>>()
            .join("\n\n");

        let structured = structured_text_of(conversation);
        let conversation_text =
            self.budget_conversation_text(conversation, structured, episode_thinking.len());
        let full_text = conversation.full_text();

        let decision_type = self.detect_decision_type(&full_text).await;
        debug!(decision_type = decision_type.as_str(), "extracting decisions");

        // Cache hit: replay the validated extraction.
        let cache_text = format!("{}:{}", decision_type.as_str(), full_text);
        if let Some(cached) = self.cache.get("decisions", &cache_text).await? {
            if let Ok(values) = serde_json::from_str::<Vec<Value>>(&cached) {
                info!(count = values.len(), "using cached decision extraction");
                let raws: Vec<RawDecision> = values
                    .into_iter()
                    .filter_map(RawDecision::from_value)
                    .map(|mut d| {
                        d.raw_confidence = d.confidence;
                        d.apply_defaults();
                        d
                    })
                    .collect();
                return Ok(self.build_traces(raws, conversation, &episode_thinking));
            }
        }

        // Core call.
        let mut prompt = prompts::extraction_prompt(decision_type, &conversation_text);
        if !episode_thinking.is_empty() {
            let thinking: String = episode_thinking.chars().take(4000).collect();
            prompt.push_str(&format!(
                "\n<thinking_blocks>\n{thinking}\n</thinking_blocks>\n\
                 Use the above internal reasoning (if present) as ground truth for the rationale field.\n"
            ));
        }

        let response = match self
            .llm
            .generate(
                prompt,
                GenerateOptions::new()
                    .with_temperature(self.llm.config().extraction_temperature)
                    .with_max_tokens(8192)
                    .trusted(),
            )
            .await
        {
            Ok(r) => r,
            Err(e @ (Error::Timeout { .. } | Error::LlmApi { .. })) => {
                warn!(error = %e, "LLM unavailable during extraction, returning empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut raws: Vec<RawDecision> = match extract_json_list(&response.content) {
            Ok(values) => values
                .into_iter()
                .filter_map(RawDecision::from_value)
                .collect(),
            Err(e) => {
                warn!(error = %e, "failed to parse extraction response");
                return Ok(Vec::new());
            }
        };

        if raws.is_empty() {
            return Ok(Vec::new());
        }

        self.glean_incomplete(&mut raws, &conversation_text).await;
        self.retry_invalid(&mut raws, &conversation_text).await;

        // Calibrate. The raw score is preserved for the verify threshold.
        let episode_author = detect_rationale_author("", &conversation.messages);
        for d in &mut raws {
            d.raw_confidence = d.confidence;
            d.confidence = match self.llm.config().calibration {
                CalibrationMethod::Composite => {
                    calibrate_composite(d, episode_author, &full_text)
                }
                CalibrationMethod::Temperature => calibrate_temperature(d, 1.5),
            };
        }

        self.verify_low_confidence(&mut raws, &full_text).await;

        let avg: f64 =
            raws.iter().map(|d| d.confidence).sum::<f64>() / raws.len().max(1) as f64;
        info!(
            count = raws.len(),
            decision_type = decision_type.as_str(),
            avg_confidence = avg,
            has_thinking = !episode_thinking.is_empty(),
            "decision extraction completed"
        );

        // Cache only what survived the gate.
        let validated: Vec<&RawDecision> = raws
            .iter()
            .map(|d| {
                let mut copy = d.clone();
                copy.apply_defaults();
                (d, copy)
            })
            .filter(|(_, copy)| validate_decision(copy).is_ok())
            .map(|(d, _)| d)
            .collect();
        if !validated.is_empty() {
            let payload = serde_json::to_string(&validated)?;
            self.cache.put("decisions", &cache_text, &payload).await?;
        }

        Ok(self.build_traces(raws, conversation, &episode_thinking))
    }

    /// Segment the conversation into episodes and extract per episode.
    pub async fn extract_by_episode(
        &self,
        conversation: &Conversation,
        gap_minutes: f64,
    ) -> Result<Vec<DecisionTrace>> {
        let episodes =
            crate::parser::segment_into_episodes(&conversation.messages, gap_minutes);
        let mut all = Vec::new();
        for episode in &episodes {
            let sub = episode_as_conversation(episode, conversation);
            let mut traces = self.extract_decisions(&sub).await?;
            all.append(&mut traces);
        }
        Ok(all)
    }

    /// One gleaning pass: ask for only the missing fields of incomplete
    /// decisions and merge the patches back by index.
    async fn glean_incomplete(&self, raws: &mut [RawDecision], conversation_text: &str) {
        let incomplete: Vec<(usize, &RawDecision)> = raws
            .iter()
            .enumerate()
            .filter(|(_, d)| completeness_score(d) < 0.6)
            .collect();
        if incomplete.is_empty() {
            return;
        }

        let partials: Vec<Value> = incomplete
            .iter()
            .map(|(i, d)| {
                let mut v = serde_json::to_value(d).unwrap_or(Value::Null);
                if let Some(obj) = v.as_object_mut() {
                    obj.insert("idx".to_string(), Value::from(*i));
                }
                v
            })
            .collect();
        let partials_json: String = serde_json::to_string_pretty(&partials)
            .unwrap_or_default()
            .chars()
            .take(2000)
            .collect();
        let excerpt: String = conversation_text.chars().take(3000).collect();

        let response = match self
            .llm
            .generate(
                prompts::glean_prompt(&excerpt, &partials_json),
                GenerateOptions::new().with_temperature(0.2).trusted(),
            )
            .await
        {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "gleaning pass failed");
                return;
            }
        };

        if let Ok(patches) = extract_json_list(&response.content) {
            let mut patched = 0usize;
            for patch in patches {
                let Some(obj) = patch.as_object() else { continue };
                let Some(idx) = obj.get("idx").and_then(Value::as_u64) else {
                    continue;
                };
                if let Some(d) = raws.get_mut(idx as usize) {
                    d.merge_patch(obj);
                    patched += 1;
                }
            }
            debug!(patched, "gleaning pass patched incomplete decisions");
        }
    }

    /// One targeted retry for a decision failing the gate with usable
    /// confidence.
    async fn retry_invalid(&self, raws: &mut [RawDecision], conversation_text: &str) {
        let mut retried = false;
        for d in raws.iter_mut() {
            if retried {
                break;
            }
            let mut gated = d.clone();
            gated.apply_defaults();
            let Err(reason) = validate_decision(&gated) else {
                continue;
            };
            if d.confidence < 0.4 {
                continue;
            }

            let partial: String = serde_json::to_string_pretty(&d)
                .unwrap_or_default()
                .chars()
                .take(500)
                .collect();
            let excerpt: String = conversation_text.chars().take(2000).collect();
            match self
                .llm
                .generate(
                    prompts::retry_prompt(&reason, &partial, &excerpt),
                    GenerateOptions::new().with_temperature(0.2).trusted(),
                )
                .await
            {
                Ok(response) => {
                    if let Ok(value) = extract_json(&response.content) {
                        if let Some(obj) = value.as_object() {
                            d.merge_patch(obj);
                            retried = true;
                        }
                    }
                }
                Err(e) => debug!(error = %e, "extraction retry failed"),
            }
        }
    }

    /// Verify decisions whose pre-calibration confidence is below the
    /// high-confidence threshold. All verify calls run concurrently.
    async fn verify_low_confidence(&self, raws: &mut [RawDecision], full_text: &str) {
        let threshold = self.llm.config().high_confidence_threshold;
        let excerpt: String = full_text.chars().take(4000).collect();

        let targets: Vec<usize> = raws
            .iter()
            .enumerate()
            .filter(|(_, d)| d.raw_confidence < threshold)
            .map(|(i, _)| i)
            .collect();
        if targets.is_empty() {
            return;
        }

        let futures = targets.iter().map(|&i| {
            let decision_json =
                serde_json::to_string_pretty(&raws[i]).unwrap_or_default();
            let prompt = prompts::verify_prompt(&excerpt, &decision_json);
            let llm = self.llm.clone();
            async move {
                let response = llm
                    .generate(
                        prompt,
                        GenerateOptions::new().with_temperature(0.1).trusted(),
                    )
                    .await?;
                let value = extract_json(&response.content)?;
                let parsed: VerifyResponse = serde_json::from_value(value)?;
                Ok::<VerifyResponse, Error>(parsed)
            }
        });

        let results = join_all(futures).await;
        for (&i, result) in targets.iter().zip(results) {
            match result {
                Ok(verdict) => {
                    if !verdict.is_valid || !verdict.on_implemented_path {
                        debug!(issues = ?verdict.issues, "decision rejected by verify pass");
                        raws[i].verify_rejected = true;
                        raws[i].confidence = 0.1;
                    } else {
                        if let Some(ev) = verdict.evidence_confidence {
                            // Evidence-based confidence refines the calibrated score.
                            raws[i].confidence =
                                ((raws[i].confidence + ev.clamp(0.0, 1.0)) / 2.0 * 1000.0)
                                    .round()
                                    / 1000.0;
                        }
                        if !verdict.corrected_fields.is_empty() {
                            raws[i].merge_patch(&verdict.corrected_fields);
                        }
                    }
                }
                Err(e) => debug!(error = %e, "verify call failed, keeping decision"),
            }
        }
    }

    /// Gate survivors into full decision traces with provenance.
    fn build_traces(
        &self,
        raws: Vec<RawDecision>,
        conversation: &Conversation,
        episode_thinking: &str,
    ) -> Vec<DecisionTrace> {
        let tool_paths: Vec<String> = {
            let mut set = std::collections::BTreeSet::new();
            for msg in &conversation.messages {
                for tc in &msg.tool_calls {
                    set.extend(tc.file_paths());
                }
            }
            set.into_iter().collect()
        };

        let mut traces = Vec::new();
        for mut raw in raws {
            raw.apply_defaults();
            if let Err(reason) = validate_decision(&raw) {
                debug!(
                    reason = %reason,
                    trigger = %raw.trigger.chars().take(80).collect::<String>(),
                    "decision rejected by validation gate"
                );
                continue;
            }

            let mut trace = DecisionTrace::new(raw.trigger.clone(), raw.decision.clone());
            trace.context = raw.context.clone();
            trace.options = if raw.options.is_empty() {
                vec![raw.decision.clone()]
            } else {
                raw.options.clone()
            };
            trace.agent_rationale = raw.rationale.clone();
            trace.confidence = raw.confidence;
            trace.raw_confidence = raw.raw_confidence;
            trace.scope = raw
                .scope
                .as_deref()
                .map(crate::ontology::Scope::parse)
                .unwrap_or(crate::ontology::Scope::Unknown);
            trace.source = DecisionSource::ClaudeLogs;
            trace.project_name = if conversation.project_name.is_empty() {
                None
            } else {
                Some(conversation.project_name.clone())
            };
            trace.assumptions = raw.assumptions.clone();
            trace.turn_index = raw.turn_index;
            trace.raw_rationale = if episode_thinking.is_empty() {
                None
            } else {
                Some(episode_thinking.to_string())
            };
            trace.rationale_author =
                detect_rationale_author(&raw.rationale, &conversation.messages);

            trace.verbatim_trigger = raw
                .verbatim_trigger
                .as_deref()
                .and_then(|v| find_text_span(conversation, v, raw.turn_index));
            trace.verbatim_decision = raw
                .verbatim_decision
                .as_deref()
                .and_then(|v| find_text_span(conversation, v, raw.turn_index));
            trace.verbatim_rationale = raw
                .verbatim_rationale
                .as_deref()
                .and_then(|v| find_text_span(conversation, v, raw.turn_index));

            trace.provenance = Some(Provenance {
                source_type: "claude_logs".to_string(),
                source_path: Some(conversation.file_path.clone()),
                model: Some(self.llm.config().model.clone()),
                prompt_version: Some(self.llm.config().prompt_version.clone()),
                extraction_method: Some("llm_episode".to_string()),
                created_by: None,
                message_index: raw.turn_index,
                confidence: Some(raw.confidence),
            });
            trace.tool_file_paths = tool_paths.clone();

            traces.push(trace);
        }
        traces
    }

    /// Extract typed entities from decision text (cached).
    pub async fn extract_entities(&self, text: &str) -> Result<Vec<ExtractedEntity>> {
        if let Some(cached) = self.cache.get("entities", text).await? {
            if let Ok(entities) = serde_json::from_str(&cached) {
                return Ok(entities);
            }
        }

        let response = match self
            .llm
            .generate(
                prompts::entity_prompt(text),
                GenerateOptions::new().with_temperature(0.3).trusted(),
            )
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "entity extraction failed");
                return Ok(Vec::new());
            }
        };

        let entities = match extract_json(&response.content) {
            Ok(value) => parse_entities(&value),
            Err(e) => {
                warn!(error = %e, "failed to parse entity response");
                Vec::new()
            }
        };

        if !entities.is_empty() {
            let payload = serde_json::to_string(&entities)?;
            self.cache.put("entities", text, &payload).await?;
        }
        Ok(entities)
    }

    /// Extract entity-entity relationships from decision text (cached).
    /// Returned triples are unvalidated; the writer checks them against
    /// the ontology matrix.
    pub async fn extract_entity_relationships(
        &self,
        decision_text: &str,
        entity_names: &[String],
    ) -> Result<Vec<ExtractedRelationship>> {
        if entity_names.len() < 2 {
            return Ok(Vec::new());
        }
        let cache_text = format!("{}|{}", entity_names.join(","), decision_text);
        if let Some(cached) = self.cache.get("relationships", &cache_text).await? {
            if let Ok(rels) = serde_json::from_str(&cached) {
                return Ok(rels);
            }
        }

        let response = match self
            .llm
            .generate(
                prompts::relationship_prompt(entity_names, decision_text),
                GenerateOptions::new().with_temperature(0.3).trusted(),
            )
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "relationship extraction failed");
                return Ok(Vec::new());
            }
        };

        let rels: Vec<ExtractedRelationship> = match extract_json(&response.content) {
            Ok(value) => value
                .get("relationships")
                .or(Some(&value))
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| serde_json::from_value(v.clone()).ok())
                        .collect()
                })
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };

        if !rels.is_empty() {
            let payload = serde_json::to_string(&rels)?;
            self.cache.put("relationships", &cache_text, &payload).await?;
        }
        Ok(rels)
    }
}

fn parse_entities(value: &Value) -> Vec<ExtractedEntity> {
    let items = value
        .get("entities")
        .and_then(|v| v.as_array())
        .or_else(|| value.as_array());
    let Some(items) = items else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let name = obj.get("name")?.as_str()?.trim();
            if name.is_empty() {
                return None;
            }
            let entity_type = obj
                .get("type")
                .and_then(|v| v.as_str())
                .and_then(EntityType::parse)
                .unwrap_or(EntityType::Concept);
            Some(ExtractedEntity {
                name: name.to_string(),
                entity_type,
                confidence: obj
                    .get("confidence")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.8),
            })
        })
        .collect()
}

/// Render a message the way structured text does, for truncation math.
fn render_message(msg: &Message) -> String {
    let mut sections = vec![format!("[Turn {} | {}]", msg.turn_index, msg.role.as_str())];
    if let Some(thinking) = &msg.thinking {
        sections.push(format!("<thinking>\n{thinking}\n</thinking>"));
    }
    for tc in &msg.tool_calls {
        let params = tc.params_summary(120);
        let line = format!("Tool: {}({params})", tc.name);
        match &tc.result {
            Some(result) if result.len() > 500 => {
                let cut: String = result.chars().take(500).collect();
                sections.push(format!("{line}\nResult: {cut}…"));
            }
            Some(result) => sections.push(format!("{line}\nResult: {result}")),
            None => sections.push(line),
        }
    }
    if !msg.content.is_empty() {
        sections.push(format!("Response: {}", msg.content));
    }
    sections.join("\n")
}

fn structured_text_of(conversation: &Conversation) -> String {
    conversation
        .messages
        .iter()
        .map(render_message)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// View an episode as a standalone conversation for extraction.
fn episode_as_conversation(episode: &Episode, parent: &Conversation) -> Conversation {
    let mut sub = Conversation::new(
        episode.messages.clone(),
        parent.file_path.clone(),
        parent.project_name.clone(),
    );
    sub.ingested_at = parent.ingested_at;
    sub
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::kv::MemoryKvStore;
    use crate::llm::testing::StaticProvider;
    use pretty_assertions::assert_eq;

    fn extractor_with(provider: StaticProvider) -> DecisionExtractor {
        let kv = Arc::new(MemoryKvStore::new());
        let llm = Arc::new(LlmService::new(
            Arc::new(provider),
            kv.clone(),
            CoreConfig::default(),
        ));
        DecisionExtractor::new(llm, ResponseCache::new(kv, "v5", 3600))
    }

    fn conversation(turns: &[(&str, Role)]) -> Conversation {
        let messages = turns
            .iter()
            .enumerate()
            .map(|(i, (content, role))| Message {
                role: *role,
                content: content.to_string(),
                timestamp: None,
                tool_calls: vec![],
                thinking: None,
                turn_index: i,
            })
            .collect();
        Conversation::new(messages, "/logs/-home-u-demo/a.jsonl", "demo")
    }

    const DB_EXTRACTION: &str = r#"[{
        "trigger": "Need to pick a database for the service",
        "context": "Relational data, team knows SQL",
        "options": ["PostgreSQL", "MongoDB"],
        "decision": "Use PostgreSQL as the primary database",
        "rationale": "Better fit for relational data and the team knows SQL",
        "confidence": 0.95,
        "scope": "architectural",
        "verbatim_decision": "Let's go with PostgreSQL",
        "turn_index": 0
    }]"#;

    #[tokio::test]
    async fn test_single_decision_strong_evidence() {
        // First response answers type detection, second the extraction.
        let extractor = extractor_with(StaticProvider::new(vec!["technology", DB_EXTRACTION]));
        let conv = conversation(&[
            (
                "Need to pick a database. Looked at PostgreSQL vs MongoDB. \
                 PostgreSQL is better fit for our relational data and the team \
                 knows SQL. Let's go with PostgreSQL.",
                Role::User,
            ),
            ("Acknowledged.", Role::Assistant),
        ]);

        let traces = extractor.extract_decisions(&conv).await.unwrap();
        assert_eq!(traces.len(), 1);
        let d = &traces[0];
        assert_eq!(d.options, vec!["PostgreSQL", "MongoDB"]);
        assert!(d.agent_decision.contains("PostgreSQL"));
        assert!(d.confidence >= 0.7, "confidence was {}", d.confidence);
        assert_eq!(d.scope, crate::ontology::Scope::Architectural);
        assert_eq!(d.project_name.as_deref(), Some("demo"));
        // Verbatim quote grounded to a span in the source.
        let span = d.verbatim_decision.as_ref().unwrap();
        assert!(conv.full_text()[span.span.start..span.span.end]
            .to_lowercase()
            .contains("postgresql"));
    }

    #[tokio::test]
    async fn test_hallucinated_example_trigger_dropped() {
        let hallucinated = r#"[{
            "trigger": "Need to select a database for the project",
            "options": ["PostgreSQL"],
            "decision": "Use PostgreSQL as the primary database",
            "rationale": "from the example",
            "confidence": 0.95
        }]"#;
        let extractor =
            extractor_with(StaticProvider::new(vec!["general", hallucinated, "[]", "[]"]));
        let conv = conversation(&[("totally unrelated chat", Role::User)]);
        let traces = extractor.extract_decisions(&conv).await.unwrap();
        assert!(traces.is_empty());
    }

    #[tokio::test]
    async fn test_parse_failure_returns_empty() {
        let extractor = extractor_with(StaticProvider::new(vec![
            "general",
            "I found no structured output to give you.",
        ]));
        let conv = conversation(&[("hello there", Role::User)]);
        let traces = extractor.extract_decisions(&conv).await.unwrap();
        assert!(traces.is_empty());
    }

    #[tokio::test]
    async fn test_cache_roundtrip_reproduces_traces() {
        let kv = Arc::new(MemoryKvStore::new());
        let provider = StaticProvider::new(vec!["technology", DB_EXTRACTION]);
        let llm = Arc::new(LlmService::new(
            Arc::new(provider),
            kv.clone(),
            CoreConfig::default(),
        ));
        let extractor =
            DecisionExtractor::new(llm.clone(), ResponseCache::new(kv.clone(), "v5", 3600));
        let conv = conversation(&[
            ("Let's go with PostgreSQL over MongoDB for the database", Role::User),
            ("Acknowledged.", Role::Assistant),
        ]);

        let first = extractor.extract_decisions(&conv).await.unwrap();
        assert_eq!(first.len(), 1);

        // Second run never reaches the provider for extraction; the
        // scripted queue is empty, so a cache miss would change results.
        let second = extractor.extract_decisions(&conv).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].agent_decision, first[0].agent_decision);
        assert_eq!(second[0].options, first[0].options);
    }

    #[tokio::test]
    async fn test_verify_rejection_drops_decision() {
        let low_conf = r#"[{
            "trigger": "Maybe switch the queue system someday",
            "options": ["RabbitMQ"],
            "decision": "Possibly use RabbitMQ for queues",
            "rationale": "mentioned in passing",
            "confidence": 0.5
        }]"#;
        let verify = r#"{"is_valid": false, "on_implemented_path": false, "issues": ["speculative"], "corrected_fields": {}, "evidence_confidence": 0.2}"#;
        let extractor = extractor_with(StaticProvider::new(vec![
            "general", low_conf, verify,
        ]));
        let conv = conversation(&[("we chatted about queues", Role::User)]);
        let traces = extractor.extract_decisions(&conv).await.unwrap();
        assert!(traces.is_empty());
    }

    #[tokio::test]
    async fn test_entity_extraction_parses_and_caches() {
        let entities_json = r#"{"entities": [
            {"name": "React", "type": "technology", "confidence": 0.95},
            {"name": "frontend", "type": "concept", "confidence": 0.85}
        ]}"#;
        let extractor = extractor_with(StaticProvider::new(vec![entities_json]));

        let entities = extractor
            .extract_entities("We chose React for the frontend")
            .await
            .unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].entity_type, EntityType::Technology);

        // Cached: provider queue is exhausted, same result returns.
        let again = extractor
            .extract_entities("We chose React for the frontend")
            .await
            .unwrap();
        assert_eq!(again, entities);
    }

    #[test]
    fn test_rationale_author_priority() {
        let mut messages = vec![Message {
            role: Role::User,
            content: "we picked Kafka because of the durable replayable log".to_string(),
            timestamp: None,
            tool_calls: vec![],
            thinking: None,
            turn_index: 0,
        }];
        assert_eq!(
            detect_rationale_author("because of the durable replayable log", &messages),
            RationaleAuthor::User
        );
        assert_eq!(
            detect_rationale_author("a rationale nobody said", &messages),
            RationaleAuthor::Assistant
        );

        messages[0].thinking = Some("internal weighing".to_string());
        assert_eq!(
            detect_rationale_author("anything", &messages),
            RationaleAuthor::Thinking
        );
    }

    #[test]
    fn test_raw_decision_tolerates_string_options() {
        let value = serde_json::json!({
            "trigger": "choose a cache",
            "decision": "Use Redis for the cache layer",
            "options": "Redis",
            "confidence": 0.8
        });
        let d = RawDecision::from_value(value).unwrap();
        assert_eq!(d.options, vec!["Redis"]);
    }
}

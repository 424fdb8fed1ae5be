use std::collections::BTreeSet;
use std::sync::Arc;

use schemars::{JsonSchema, SchemaGenerator};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use utoipa::ToSchema;

use crate::ai_utils::{CompletionRequest, LanguageModel, Tokens, extract_json_object};
use crate::config::{Leniency, ProgressConfig};

use super::messages::Turn;

/// The model's judgement of whether the current module has been covered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProgressVerdict {
    #[serde(rename = "moduleComplete", alias = "completion")]
    pub completion: bool,
    /// How sure the model is, between 0 and 1.
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub topics_covered: BTreeSet<String>,
    #[serde(default)]
    pub next_module_ready: bool,
    #[serde(default)]
    pub summary: String,
}

impl ProgressVerdict {
    fn incomplete(confidence: f32, summary: &str) -> Self {
        Self {
            completion: false,
            confidence,
            topics_covered: BTreeSet::new(),
            next_module_ready: false,
            summary: summary.to_string(),
        }
    }

    /// Returned when the response holds no JSON object.
    pub fn unreadable() -> Self {
        Self::incomplete(0.3, "Could not properly analyze the conversation")
    }

    /// Returned when a JSON object was found but does not describe a verdict.
    pub fn malformed() -> Self {
        Self::incomplete(0.2, "Analysis failed due to parsing error")
    }

    /// Returned when the model could not be reached.
    pub fn unavailable() -> Self {
        Self::incomplete(0.0, "Progress analysis is currently unavailable")
    }

    /// Parse the first JSON object in a raw model response, falling back to a
    /// low-confidence incomplete verdict.
    pub fn parse(text: &str) -> Self {
        let Some(object) = extract_json_object(text) else {
            warn!("no JSON object in analyzer response");
            debug!("analyzer response: {}", text);
            return Self::unreadable();
        };
        match serde_json::from_value::<ProgressVerdict>(serde_json::Value::Object(object)) {
            Ok(mut verdict) => {
                verdict.confidence = if verdict.confidence.is_finite() {
                    verdict.confidence.clamp(0.0, 1.0)
                } else {
                    0.0
                };
                verdict
            }
            Err(e) => {
                warn!("failed to parse analyzer verdict: {}", e);
                Self::malformed()
            }
        }
    }

    pub fn advances(&self, threshold: f32) -> bool {
        self.completion && self.confidence > threshold
    }
}

fn verdict_schema() -> String {
    let mut settings = schemars::r#gen::SchemaSettings::default();
    settings.inline_subschemas = true;
    settings.option_add_null_type = false;
    let mut generator = SchemaGenerator::new(settings);
    let schema = ProgressVerdict::json_schema(&mut generator);
    serde_json::to_string(&schema).unwrap_or_default()
}

const LIBERAL_RUBRIC: &str = "Be LIBERAL with progression. If there has been meaningful discussion of the module topics and the student seems engaged, they are ready to advance. Learning is iterative and students benefit from moving forward. Err on the side of progression.";

const CONSERVATIVE_RUBRIC: &str = "Be CONSERVATIVE with progression. Only mark the module complete when the student has shown understanding of its main topics in their own words or code, not merely by reading explanations. When in doubt, keep the student on the current module.";

/// Asks the language model whether the module being taught has been covered.
#[derive(Clone)]
pub struct ProgressAnalyzer {
    model: Arc<dyn LanguageModel>,
    leniency: Leniency,
    window_turns: usize,
    turn_char_limit: usize,
    token_budget: u64,
}

impl ProgressAnalyzer {
    pub fn new(model: Arc<dyn LanguageModel>, config: &ProgressConfig) -> Self {
        Self {
            model,
            leniency: config.leniency,
            window_turns: config.window_turns,
            turn_char_limit: config.turn_char_limit,
            token_budget: config.analysis_token_budget,
        }
    }

    /// Render the most recent turns, newest kept first when the token budget runs out.
    fn render_window(&self, turns: &[Turn]) -> String {
        let start = turns.len().saturating_sub(self.window_turns);
        let mut used = 0;
        let mut lines = vec![];
        for turn in turns[start..].iter().rev() {
            let line = turn.render(self.turn_char_limit);
            used += line.tokens();
            if used > self.token_budget && !lines.is_empty() {
                break;
            }
            lines.push(line);
        }
        lines.reverse();
        lines.join("\n")
    }

    fn prompt(&self, turns: &[Turn], tool_name: &str, module_number: usize) -> String {
        let rubric = match self.leniency {
            Leniency::Liberal => LIBERAL_RUBRIC,
            Leniency::Conservative => CONSERVATIVE_RUBRIC,
        };
        format!(
            "You are an educational progress analyzer for a programming learning platform called DevTutor.\n\
            Analyze this conversation about learning {tool_name} and decide whether the student has sufficiently covered the concepts of module {module_number}.\n\
            Conversation to analyze:\n{conversation}\n\
            A module is complete when the student has been introduced to its core concepts, asked relevant questions or shown understanding, \
            received explanations and examples for the main topics, and had at least 2-3 meaningful exchanges about it.\n\
            {rubric}\n\
            Respond with only a JSON object matching this schema:\n{schema}",
            conversation = self.render_window(turns),
            schema = verdict_schema(),
        )
    }

    /// Judge the conversation. Never fails: every error becomes an incomplete verdict.
    pub async fn analyze(&self, turns: &[Turn], tool_name: &str, module_number: usize) -> ProgressVerdict {
        let module_number = module_number.max(1);
        let prompt = self.prompt(turns, tool_name, module_number);
        match self.model.complete(CompletionRequest::single(prompt)).await {
            Ok(text) => {
                let verdict = ProgressVerdict::parse(&text);
                debug!(
                    module = module_number,
                    completion = verdict.completion,
                    confidence = verdict.confidence,
                    "progress verdict for {}",
                    tool_name
                );
                verdict
            }
            Err(e) => {
                warn!("progress analysis failed: {}", e);
                ProgressVerdict::unavailable()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_utils::testing::ScriptedModel;
    use crate::error::LlmError;
    use crate::teacher::messages::Sender;

    fn analyzer(model: Arc<ScriptedModel>, config: ProgressConfig) -> ProgressAnalyzer {
        ProgressAnalyzer::new(model, &config)
    }

    fn conversation(count: usize) -> Vec<Turn> {
        (0..count)
            .map(|i| {
                let sender = if i % 2 == 0 { Sender::User } else { Sender::Assistant };
                Turn::new(sender, format!("message {i}"))
            })
            .collect()
    }

    #[test]
    fn parses_verdict_embedded_in_prose() {
        let verdict = ProgressVerdict::parse(
            "Here you go:\n```json\n{\"moduleComplete\": true, \"confidence\": 0.85, \"topicsCovered\": [\"loops\", \"lists\"], \"nextModuleReady\": true, \"summary\": \"Solid\"}\n```",
        );
        assert!(verdict.completion);
        assert_eq!(verdict.confidence, 0.85);
        assert!(verdict.topics_covered.contains("loops"));
        assert!(verdict.advances(0.6));
    }

    #[test]
    fn accepts_completion_key_and_clamps_confidence() {
        let verdict = ProgressVerdict::parse(r#"{"completion": true, "confidence": 3.5}"#);
        assert!(verdict.completion);
        assert_eq!(verdict.confidence, 1.0);
        let serialized = serde_json::to_value(&verdict).unwrap();
        assert_eq!(serialized["moduleComplete"], true);
        assert!(serialized.get("topicsCovered").is_some());
    }

    #[test]
    fn malformed_responses_fall_back_to_incomplete() {
        assert_eq!(ProgressVerdict::parse("I think they are done!"), ProgressVerdict::unreadable());
        assert_eq!(
            ProgressVerdict::parse(r#"{"confidence": "high"}"#),
            ProgressVerdict::malformed()
        );
        assert!(!ProgressVerdict::unreadable().advances(0.0));
    }

    #[test]
    fn threshold_is_strict() {
        let verdict = ProgressVerdict::parse(r#"{"moduleComplete": true, "confidence": 0.6}"#);
        assert!(!verdict.advances(0.6));
        assert!(verdict.advances(0.59));
    }

    #[test]
    fn schema_names_wire_fields() {
        let schema = verdict_schema();
        assert!(schema.contains("moduleComplete"));
        assert!(schema.contains("topicsCovered"));
    }

    #[tokio::test]
    async fn window_is_bounded_and_truncated() {
        let model = Arc::new(ScriptedModel::new());
        model.push_completion(Ok(r#"{"moduleComplete": false, "confidence": 0.1}"#.into()));
        let config = ProgressConfig {
            window_turns: 3,
            turn_char_limit: 5,
            ..Default::default()
        };
        let mut turns = conversation(6);
        turns.push(Turn::new(Sender::User, "a very long final question"));
        let verdict = analyzer(model.clone(), config)
            .analyze(&turns, "Python", 2)
            .await;
        assert!(!verdict.completion);

        let requests = model.requests.lock();
        let prompt = &requests[0].messages[0].content;
        assert!(prompt.contains("module 2"));
        assert!(prompt.contains("user: a ver\n"));
        assert!(prompt.contains("ai: messa\n"));
        assert!(!prompt.contains("message 3"));
        assert!(prompt.contains("LIBERAL"));
    }

    #[tokio::test]
    async fn token_budget_drops_oldest_turns() {
        let model = Arc::new(ScriptedModel::new());
        let config = ProgressConfig {
            analysis_token_budget: 7,
            leniency: Leniency::Conservative,
            ..Default::default()
        };
        let analyzer = analyzer(model, config);
        let rendered = analyzer.render_window(&conversation(4));
        assert_eq!(rendered, "user: message 2\nai: message 3");
        assert!(analyzer.prompt(&[], "Go", 1).contains("CONSERVATIVE"));
    }

    #[tokio::test]
    async fn call_failure_is_not_fatal() {
        let model = Arc::new(ScriptedModel::new());
        model.push_completion(Err(LlmError::RateLimited("429".into())));
        let verdict = analyzer(model, ProgressConfig::default())
            .analyze(&conversation(4), "Rust", 1)
            .await;
        assert_eq!(verdict, ProgressVerdict::unavailable());
    }
}

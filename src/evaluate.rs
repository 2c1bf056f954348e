use std::sync::Arc;

use serde::Deserialize;

use crate::database::{Outcome, TranscriptTurn};
use crate::llm::{extract_json_block, GenerationCapability, Message};
use crate::ratelimit::{QuotaBucket, RateLimiter};

/// The structured-output contract the model is asked to honor.
#[derive(Debug, Deserialize)]
struct ClassificationResponse {
    #[serde(default)]
    outcome: Option<String>,
    #[serde(default)]
    score: f64,
    #[serde(default)]
    synergies: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub outcome: Outcome,
    pub score: f64,
    pub synergies: Vec<String>,
    /// Raw model output (or error) when classification had to fall back
    /// to the safe default; the caller writes it to the processing log
    /// for human review.
    pub anomaly: Option<String>,
}

impl Evaluation {
    fn no_match(anomaly: Option<String>) -> Self {
        Self {
            outcome: Outcome::NoMatch,
            score: 0.0,
            synergies: Vec::new(),
            anomaly,
        }
    }
}

/// Classifies finished transcripts. The one fuzzy LLM-classification step
/// in the pipeline, bounded by a closed outcome enum: anything the model
/// returns outside it degrades to no_match instead of crashing the batch.
pub struct OutcomeEvaluator {
    capability: Arc<dyn GenerationCapability>,
    limiter: Arc<RateLimiter>,
}

impl OutcomeEvaluator {
    pub fn new(capability: Arc<dyn GenerationCapability>, limiter: Arc<RateLimiter>) -> Self {
        Self { capability, limiter }
    }

    pub async fn evaluate(&self, transcript: &[TranscriptTurn]) -> Evaluation {
        if transcript.is_empty() {
            return Evaluation::no_match(Some("empty transcript".to_string()));
        }

        let messages = classification_messages(transcript);

        self.limiter.acquire(QuotaBucket::Generation).await;
        let raw = match self.capability.classify(&messages).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Outcome classification call failed: {}", e);
                return Evaluation::no_match(Some(format!("classification call failed: {}", e)));
            }
        };

        parse_classification(&raw)
    }
}

fn classification_messages(transcript: &[TranscriptTurn]) -> Vec<Message> {
    let rendered: String = transcript
        .iter()
        .map(|turn| format!("{}: {}\n", turn.speaker, turn.content))
        .collect();

    vec![
        Message::system(
            "You evaluate a finished conversation between two professionals' agents \
             and classify the collaboration opportunity. Respond with JSON only:\n\
             {\n  \"outcome\": \"STRONG_MATCH\" | \"EXPLORATORY_VALUE\" | \
             \"FUTURE_POTENTIAL\" | \"NO_MATCH\",\n  \"score\": 0.0-1.0,\n  \
             \"synergies\": [\"...\"]\n}",
        ),
        Message::user(format!("Transcript:\n{}", rendered)),
    ]
}

/// Validate raw model output against the closed outcome enum. Invalid or
/// missing categories default to no_match with the raw output preserved.
pub fn parse_classification(raw: &str) -> Evaluation {
    let parsed: ClassificationResponse = match serde_json::from_str(extract_json_block(raw)) {
        Ok(parsed) => parsed,
        Err(_) => return Evaluation::no_match(Some(raw.to_string())),
    };

    let outcome = match parsed.outcome.as_deref().and_then(Outcome::parse_label) {
        Some(outcome) => outcome,
        None => return Evaluation::no_match(Some(raw.to_string())),
    };

    Evaluation {
        outcome,
        score: parsed.score.clamp(0.0, 1.0),
        synergies: parsed.synergies,
        anomaly: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;

    struct FixedClassifier {
        reply: Result<String, String>,
    }

    #[async_trait]
    impl GenerationCapability for FixedClassifier {
        async fn generate(&self, _messages: &[Message]) -> Result<String> {
            Ok(String::new())
        }

        async fn classify(&self, _messages: &[Message]) -> Result<String> {
            match &self.reply {
                Ok(raw) => Ok(raw.clone()),
                Err(e) => anyhow::bail!("{}", e),
            }
        }

        async fn health(&self) -> Result<()> {
            Ok(())
        }
    }

    fn transcript() -> Vec<TranscriptTurn> {
        vec![TranscriptTurn {
            speaker: "alice".to_string(),
            content: "We should collaborate on the data platform.".to_string(),
        }]
    }

    async fn evaluate_with(reply: Result<String, String>) -> Evaluation {
        let evaluator = OutcomeEvaluator::new(
            Arc::new(FixedClassifier { reply }),
            Arc::new(RateLimiter::new(10_000, 10_000)),
        );
        evaluator.evaluate(&transcript()).await
    }

    #[tokio::test]
    async fn valid_classification_is_accepted() {
        let evaluation = evaluate_with(Ok(
            r#"{"outcome": "STRONG_MATCH", "score": 0.82, "synergies": ["data platform"]}"#
                .to_string(),
        ))
        .await;
        assert_eq!(evaluation.outcome, Outcome::StrongMatch);
        assert!((evaluation.score - 0.82).abs() < f64::EPSILON);
        assert_eq!(evaluation.synergies, vec!["data platform"]);
        assert!(evaluation.anomaly.is_none());
    }

    #[tokio::test]
    async fn fenced_output_is_parsed() {
        let evaluation = evaluate_with(Ok(
            "```json\n{\"outcome\": \"exploratory_value\", \"score\": 0.4}\n```".to_string(),
        ))
        .await;
        assert_eq!(evaluation.outcome, Outcome::ExploratoryValue);
    }

    #[tokio::test]
    async fn invalid_category_defaults_to_no_match_with_anomaly() {
        let raw = r#"{"outcome": "AMAZING_MATCH", "score": 0.9}"#;
        let evaluation = evaluate_with(Ok(raw.to_string())).await;
        assert_eq!(evaluation.outcome, Outcome::NoMatch);
        assert_eq!(evaluation.score, 0.0);
        assert_eq!(evaluation.anomaly.as_deref(), Some(raw));
    }

    #[tokio::test]
    async fn unparseable_output_defaults_to_no_match() {
        let evaluation = evaluate_with(Ok("they seemed to get along".to_string())).await;
        assert_eq!(evaluation.outcome, Outcome::NoMatch);
        assert!(evaluation.anomaly.is_some());
    }

    #[tokio::test]
    async fn failed_call_defaults_to_no_match() {
        let evaluation = evaluate_with(Err("provider down".to_string())).await;
        assert_eq!(evaluation.outcome, Outcome::NoMatch);
        assert!(evaluation
            .anomaly
            .as_deref()
            .unwrap_or_default()
            .contains("provider down"));
    }

    #[test]
    fn brace_noise_defaults_to_no_match() {
        let raw = "score 0.2} because {unfinished";
        let evaluation = parse_classification(raw);
        assert_eq!(evaluation.outcome, Outcome::NoMatch);
        assert_eq!(evaluation.anomaly.as_deref(), Some(raw));
    }

    #[test]
    fn score_is_clamped_to_unit_interval() {
        let evaluation =
            parse_classification(r#"{"outcome": "future_potential", "score": 1.7}"#);
        assert_eq!(evaluation.outcome, Outcome::FuturePotential);
        assert!((evaluation.score - 1.0).abs() < f64::EPSILON);
    }
}

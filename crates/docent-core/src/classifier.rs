//! Question classification capability.
//!
//! Three LLM judgments (genuine question, retrieval worthiness, history
//! reference) plus one local lexical check, behind a single trait so the
//! gate and router can be driven by fakes in tests.
//!
//! Parsing is deliberately strict: a classifier reply that cannot be
//! read is an error, never a default decision.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use docent_shared::{ClassificationOutcome, ClassifyError, ScoredClassification};

use crate::llm::{parse_json_reply, ChatModel};

// ============================================================================
// Classifier Trait
// ============================================================================

/// Classification judgments consumed by the gate and the router.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Local lexical check: does the text read as a question at all?
    fn looks_like_question(&self, text: &str) -> bool;

    /// Is this a genuine question seeking information?
    async fn is_question(&self, text: &str) -> Result<ClassificationOutcome, ClassifyError>;

    /// How much does answering depend on the community knowledge base?
    async fn retrieval_worthiness(
        &self,
        text: &str,
    ) -> Result<ScoredClassification, ClassifyError>;

    /// Does the question refer back to the ongoing conversation?
    async fn is_about_history(&self, text: &str)
        -> Result<ClassificationOutcome, ClassifyError>;
}

// ============================================================================
// Lexical question check
// ============================================================================

const INTERROGATIVE_LEADS: &[&str] = &[
    "who", "what", "when", "where", "why", "how", "which", "whose", "whom", "is", "are", "am",
    "was", "were", "do", "does", "did", "can", "could", "should", "would", "will", "shall", "may",
    "might", "have", "has", "had",
];

/// Cheap question/statement split, no model involved.
///
/// A trailing question mark or an interrogative/auxiliary opening word
/// counts as a question; everything else is a statement.
pub fn reads_as_question(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.ends_with('?') {
        return true;
    }
    let first = trimmed
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_ascii_lowercase();
    INTERROGATIVE_LEADS.contains(&first.as_str())
}

// ============================================================================
// LLM-backed classifier (Production)
// ============================================================================

const QUESTION_CHECK_SYSTEM: &str = "You classify community chat messages. Reply with exactly \
one word, true or false: true when the message is a genuine question seeking information, \
false otherwise. No punctuation, no explanation.";

const RAG_CHECK_SYSTEM: &str = "You estimate how much a question depends on a community's own \
documents and conversations rather than general knowledge. Reply with a JSON object: \
{\"score\": <number between 0 and 1>, \"reasoning\": \"<one short sentence>\"}.";

const HISTORY_CHECK_SYSTEM: &str = "You decide whether a question refers back to the ongoing \
conversation (earlier questions, earlier answers, things already said). Reply with a JSON \
object: {\"is_history_query\": <true or false>, \"reasoning\": \"<one short sentence>\"}.";

/// Parse a bare true/false token, tolerating quotes and a trailing period.
fn parse_bool_token(text: &str) -> Result<bool, ClassifyError> {
    let token = text
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '.' || c.is_whitespace())
        .to_ascii_lowercase();
    match token.as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ClassifyError::UnrecognizedBoolean(text.to_string())),
    }
}

/// Real classifier backed by a chat model.
pub struct LlmClassifier {
    model: Arc<dyn ChatModel>,
    rag_threshold: f64,
}

impl LlmClassifier {
    pub fn new(model: Arc<dyn ChatModel>, rag_threshold: f64) -> Self {
        Self {
            model,
            rag_threshold,
        }
    }

    async fn ask(&self, system: &str, user: &str) -> Result<String, ClassifyError> {
        self.model
            .complete(system, user)
            .await
            .map_err(|e| ClassifyError::Backend(e.to_string()))
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    fn looks_like_question(&self, text: &str) -> bool {
        reads_as_question(text)
    }

    async fn is_question(&self, text: &str) -> Result<ClassificationOutcome, ClassifyError> {
        let reply = self.ask(QUESTION_CHECK_SYSTEM, text).await?;
        let result = parse_bool_token(&reply)?;
        Ok(ClassificationOutcome::new(result))
    }

    async fn retrieval_worthiness(
        &self,
        text: &str,
    ) -> Result<ScoredClassification, ClassifyError> {
        let reply = self.ask(RAG_CHECK_SYSTEM, text).await?;
        let value =
            parse_json_reply(&reply).map_err(|e| ClassifyError::MalformedReply(e.to_string()))?;
        let score = value
            .get("score")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| ClassifyError::MalformedReply(format!("no numeric score: {}", reply)))?;
        let reasoning = value
            .get("reasoning")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        ScoredClassification::new(score, self.rag_threshold, reasoning)
    }

    async fn is_about_history(
        &self,
        text: &str,
    ) -> Result<ClassificationOutcome, ClassifyError> {
        let reply = self.ask(HISTORY_CHECK_SYSTEM, text).await?;
        let value =
            parse_json_reply(&reply).map_err(|e| ClassifyError::MalformedReply(e.to_string()))?;
        let result = value
            .get("is_history_query")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| {
                ClassifyError::MalformedReply(format!("no is_history_query flag: {}", reply))
            })?;
        let reasoning = value
            .get("reasoning")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let mut outcome = ClassificationOutcome::new(result);
        if let Some(r) = reasoning {
            outcome = outcome.with_reasoning(r);
        }
        Ok(outcome)
    }
}

// ============================================================================
// Fake classifier (Testing)
// ============================================================================

/// Fake classifier with fixed verdicts and per-method call counts.
pub struct FakeClassifier {
    looks_like_question: bool,
    is_question: Result<ClassificationOutcome, ClassifyError>,
    retrieval_worthiness: Result<ScoredClassification, ClassifyError>,
    is_about_history: Result<ClassificationOutcome, ClassifyError>,
    delay: Option<Duration>,
    call_counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl FakeClassifier {
    /// A retrieval-worthy question on every judgment.
    pub fn question() -> Self {
        Self {
            looks_like_question: true,
            is_question: Ok(ClassificationOutcome::new(true)),
            retrieval_worthiness: ScoredClassification::new(0.9, 0.5, None),
            is_about_history: Ok(ClassificationOutcome::new(false)),
            delay: None,
            call_counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// A plain statement, stopped at the first gate stage.
    pub fn statement() -> Self {
        Self {
            looks_like_question: false,
            ..Self::question()
        }
    }

    pub fn with_is_question(
        mut self,
        outcome: Result<ClassificationOutcome, ClassifyError>,
    ) -> Self {
        self.is_question = outcome;
        self
    }

    pub fn with_retrieval_worthiness(
        mut self,
        outcome: Result<ScoredClassification, ClassifyError>,
    ) -> Self {
        self.retrieval_worthiness = outcome;
        self
    }

    pub fn with_is_about_history(
        mut self,
        outcome: Result<ClassificationOutcome, ClassifyError>,
    ) -> Self {
        self.is_about_history = outcome;
        self
    }

    /// Sleep this long before every LLM-backed judgment, to exercise
    /// caller-side timeouts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    async fn stall(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn record(&self, method: &str) {
        let mut counts = self.call_counts.lock().unwrap();
        *counts.entry(method.to_string()).or_insert(0) += 1;
    }

    /// Number of calls to one trait method.
    pub fn call_count(&self, method: &str) -> usize {
        self.call_counts
            .lock()
            .unwrap()
            .get(method)
            .copied()
            .unwrap_or(0)
    }

    /// Total calls across every trait method.
    pub fn total_calls(&self) -> usize {
        self.call_counts.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl Classifier for FakeClassifier {
    fn looks_like_question(&self, _text: &str) -> bool {
        self.record("looks_like_question");
        self.looks_like_question
    }

    async fn is_question(&self, _text: &str) -> Result<ClassificationOutcome, ClassifyError> {
        self.record("is_question");
        self.stall().await;
        self.is_question.clone()
    }

    async fn retrieval_worthiness(
        &self,
        _text: &str,
    ) -> Result<ScoredClassification, ClassifyError> {
        self.record("retrieval_worthiness");
        self.stall().await;
        self.retrieval_worthiness.clone()
    }

    async fn is_about_history(
        &self,
        _text: &str,
    ) -> Result<ClassificationOutcome, ClassifyError> {
        self.record("is_about_history");
        self.stall().await;
        self.is_about_history.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::FakeChatModel;
    use crate::llm::LlmError;

    #[test]
    fn test_reads_as_question() {
        assert!(reads_as_question("What is the signup process?"));
        assert!(reads_as_question("the bot is down again?"));
        assert!(reads_as_question("how do I join"));
        assert!(reads_as_question("Can anyone help"));
        assert!(!reads_as_question("The meeting moved to Thursday."));
        assert!(!reads_as_question("thanks everyone"));
        assert!(!reads_as_question(""));
    }

    #[test]
    fn test_parse_bool_token_accepts_variants() {
        assert_eq!(parse_bool_token("true").unwrap(), true);
        assert_eq!(parse_bool_token(" False. ").unwrap(), false);
        assert_eq!(parse_bool_token("\"TRUE\"").unwrap(), true);
    }

    #[test]
    fn test_parse_bool_token_rejects_prose() {
        let err = parse_bool_token("It is true that this is a question").unwrap_err();
        assert!(matches!(err, ClassifyError::UnrecognizedBoolean(_)));
        assert!(parse_bool_token("maybe").is_err());
        assert!(parse_bool_token("").is_err());
    }

    #[tokio::test]
    async fn test_is_question_parses_strictly() {
        let model = Arc::new(FakeChatModel::always("true"));
        let classifier = LlmClassifier::new(model, 0.5);
        let outcome = classifier.is_question("is this on?").await.unwrap();
        assert!(outcome.result);

        let model = Arc::new(FakeChatModel::always("Yes, definitely a question"));
        let classifier = LlmClassifier::new(model, 0.5);
        assert!(matches!(
            classifier.is_question("is this on?").await,
            Err(ClassifyError::UnrecognizedBoolean(_))
        ));
    }

    #[tokio::test]
    async fn test_retrieval_worthiness_scores_against_threshold() {
        let model = Arc::new(FakeChatModel::always(
            r#"{"score": 0.8, "reasoning": "asks about internal docs"}"#,
        ));
        let classifier = LlmClassifier::new(model, 0.5);
        let scored = classifier.retrieval_worthiness("where are the docs?").await.unwrap();
        assert!(scored.result());
        assert_eq!(scored.score(), 0.8);
        assert_eq!(scored.reasoning(), Some("asks about internal docs"));
    }

    #[tokio::test]
    async fn test_retrieval_worthiness_rejects_bad_score() {
        let model = Arc::new(FakeChatModel::always(r#"{"score": 7.0}"#));
        let classifier = LlmClassifier::new(model, 0.5);
        assert!(matches!(
            classifier.retrieval_worthiness("q").await,
            Err(ClassifyError::ScoreOutOfRange(_))
        ));

        let model = Arc::new(FakeChatModel::always(r#"{"grade": "high"}"#));
        let classifier = LlmClassifier::new(model, 0.5);
        assert!(matches!(
            classifier.retrieval_worthiness("q").await,
            Err(ClassifyError::MalformedReply(_))
        ));
    }

    #[tokio::test]
    async fn test_is_about_history_reads_flag() {
        let model = Arc::new(FakeChatModel::always(
            r#"{"is_history_query": true, "reasoning": "refers to the last answer"}"#,
        ));
        let classifier = LlmClassifier::new(model, 0.5);
        let outcome = classifier.is_about_history("what did you just say?").await.unwrap();
        assert!(outcome.result);
        assert_eq!(outcome.reasoning.as_deref(), Some("refers to the last answer"));
    }

    #[tokio::test]
    async fn test_backend_error_is_surfaced() {
        let model = Arc::new(FakeChatModel::always_error(LlmError::Timeout(15)));
        let classifier = LlmClassifier::new(model, 0.5);
        assert!(matches!(
            classifier.is_question("q").await,
            Err(ClassifyError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn test_fake_counts_calls() {
        let fake = FakeClassifier::question();
        let _ = fake.looks_like_question("q");
        let _ = fake.is_question("q").await;
        let _ = fake.is_question("q").await;
        assert_eq!(fake.call_count("looks_like_question"), 1);
        assert_eq!(fake.call_count("is_question"), 2);
        assert_eq!(fake.total_calls(), 3);
    }
}

//! Answer relevance validation capability.
//!
//! Asks a judge model whether an answer actually addresses the question.
//! The verdict drives the validation loop; an unreadable verdict is an
//! error, never an implicit pass.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use docent_shared::ClassificationOutcome;

use crate::llm::{parse_json_reply, ChatModel, LlmError};

const VALIDATE_SYSTEM: &str = "You judge whether an answer actually addresses a question. An \
answer that is on topic, concrete, and responsive counts as relevant even if short. Reply \
with a JSON object: {\"relevant\": <true or false>, \"reasoning\": \"<one short sentence>\"}.";

/// Relevance judgment over a (question, answer) pair.
#[async_trait]
pub trait AnswerValidator: Send + Sync {
    async fn validate(
        &self,
        question: &str,
        answer: &str,
    ) -> Result<ClassificationOutcome, LlmError>;
}

/// Real validator backed by a chat model.
pub struct LlmAnswerValidator {
    model: Arc<dyn ChatModel>,
}

impl LlmAnswerValidator {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl AnswerValidator for LlmAnswerValidator {
    async fn validate(
        &self,
        question: &str,
        answer: &str,
    ) -> Result<ClassificationOutcome, LlmError> {
        let user = format!("**Question:** {}\n\n**Answer:** {}", question, answer);
        let reply = self.model.complete(VALIDATE_SYSTEM, &user).await?;
        let value = parse_json_reply(&reply)?;
        let relevant = value
            .get("relevant")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| LlmError::InvalidJson(format!("no relevant flag: {}", reply)))?;
        let mut outcome = ClassificationOutcome::new(relevant);
        if let Some(r) = value.get("reasoning").and_then(|v| v.as_str()) {
            outcome = outcome.with_reasoning(r);
        }
        Ok(outcome)
    }
}

/// Fake validator with scripted verdicts and a call count.
///
/// A single verdict repeats forever; longer scripts serve front to back.
pub struct FakeValidator {
    verdicts: Mutex<Vec<Result<ClassificationOutcome, LlmError>>>,
    calls: Mutex<usize>,
}

impl FakeValidator {
    pub fn new(verdicts: Vec<Result<ClassificationOutcome, LlmError>>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts),
            calls: Mutex::new(0),
        }
    }

    /// Always judges the answer relevant.
    pub fn approving() -> Self {
        Self::new(vec![Ok(ClassificationOutcome::new(true))])
    }

    /// Always judges the answer irrelevant.
    pub fn rejecting() -> Self {
        Self::new(vec![Ok(ClassificationOutcome::new(false))])
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl AnswerValidator for FakeValidator {
    async fn validate(
        &self,
        _question: &str,
        _answer: &str,
    ) -> Result<ClassificationOutcome, LlmError> {
        *self.calls.lock().unwrap() += 1;
        let mut verdicts = self.verdicts.lock().unwrap();
        if verdicts.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        if verdicts.len() == 1 {
            verdicts[0].clone()
        } else {
            verdicts.remove(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::FakeChatModel;

    #[tokio::test]
    async fn test_validate_reads_verdict() {
        let model = Arc::new(FakeChatModel::always(
            r#"{"relevant": true, "reasoning": "names the exact channel"}"#,
        ));
        let validator = LlmAnswerValidator::new(model.clone());
        let outcome = validator
            .validate("where do I ask?", "Use #support.")
            .await
            .unwrap();
        assert!(outcome.result);
        assert_eq!(outcome.reasoning.as_deref(), Some("names the exact channel"));
        // The judge sees both sides of the pair.
        let user_prompt = &model.calls()[0].1;
        assert!(user_prompt.contains("**Question:** where do I ask?"));
        assert!(user_prompt.contains("**Answer:** Use #support."));
    }

    #[tokio::test]
    async fn test_validate_rejects_missing_flag() {
        let model = Arc::new(FakeChatModel::always(r#"{"verdict": "fine"}"#));
        let validator = LlmAnswerValidator::new(model);
        assert!(matches!(
            validator.validate("q", "a").await,
            Err(LlmError::InvalidJson(_))
        ));
    }

    #[tokio::test]
    async fn test_fake_verdict_sequence() {
        let fake = FakeValidator::new(vec![
            Ok(ClassificationOutcome::new(false)),
            Ok(ClassificationOutcome::new(true)),
        ]);
        assert!(!fake.validate("q", "a").await.unwrap().result);
        assert!(fake.validate("q", "a").await.unwrap().result);
        assert_eq!(fake.call_count(), 2);
    }
}

//! Answer generation capability.
//!
//! Knowledge-only answers, history-grounded answers, the grounded-vs-
//! knowledge comparison, and query refinement, all behind one trait.
//! Also owns the sanitizer that keeps leaked framework error text out of
//! user-facing answers.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::llm::{parse_json_reply, ChatModel, LlmError};

// ============================================================================
// Sanitizer
// ============================================================================

/// Phrases an agent framework leaks into the answer when a tool call
/// dies mid-generation.
const GENERIC_ERROR_PHRASES: &[&str] = &["i encountered an error", "agent stopped due to"];

/// Fixed replacement for leaked error text.
pub const APOLOGY_MESSAGE: &str = "I apologize, but I ran into a problem while putting your \
answer together. Please try again in a few minutes.";

/// Replace a leaked framework error with the apology.
///
/// Returns the clean text and whether a replacement happened. The
/// apology itself contains none of the trigger phrases, so applying the
/// sanitizer twice never rewrites its own output.
pub fn sanitize_answer(answer: &str) -> (String, bool) {
    let lowered = answer.to_lowercase();
    if GENERIC_ERROR_PHRASES.iter().any(|p| lowered.contains(p)) {
        (APOLOGY_MESSAGE.to_string(), true)
    } else {
        (answer.to_string(), false)
    }
}

// ============================================================================
// Generator Trait
// ============================================================================

/// Which candidate the comparison picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerChoice {
    Grounded,
    Knowledge,
}

/// Comparison result with the judge's reasoning when offered.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonVerdict {
    pub choice: AnswerChoice,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

/// Generation operations consumed by the engine.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Answer from model knowledge alone.
    async fn knowledge_answer(&self, query: &str) -> Result<String, LlmError>;

    /// Answer using the session's conversation text as context.
    async fn history_answer(&self, query: &str, history: &str) -> Result<String, LlmError>;

    /// Pick between a retrieval-grounded candidate and a knowledge one.
    async fn choose_answer(
        &self,
        question: &str,
        grounded: &str,
        knowledge: &str,
    ) -> Result<ComparisonVerdict, LlmError>;

    /// Rewrite the query after its answer was judged off-target.
    async fn refine_query(&self, query: &str, rejected_answer: &str) -> Result<String, LlmError>;
}

// ============================================================================
// LLM-backed generator (Production)
// ============================================================================

const HISTORY_SYSTEM: &str = "You answer a follow-up question for a community assistant using \
only the conversation provided. If the conversation does not contain the answer, say so \
plainly instead of inventing one.";

const COMPARE_SYSTEM: &str = "Two candidate answers exist for the same question. Candidate A \
is grounded in the community's own documents; candidate B comes from general knowledge. \
Prefer candidate A unless it fails to address the question or carries no real information. \
Reply with a JSON object: {\"choice\": \"grounded\" or \"knowledge\", \"reasoning\": \"<one \
short sentence>\"}.";

const REFINE_SYSTEM: &str = "The previous answer to this question was judged off-target. \
Rewrite the question so it is clearer and more specific, keeping the asker's intent. Reply \
with only the rewritten question.";

/// Real generator backed by a chat model.
pub struct LlmGenerator {
    model: Arc<dyn ChatModel>,
    max_answer_words: usize,
}

impl LlmGenerator {
    pub fn new(model: Arc<dyn ChatModel>, max_answer_words: usize) -> Self {
        Self {
            model,
            max_answer_words,
        }
    }

    fn knowledge_system(&self) -> String {
        format!(
            "You answer questions for a community assistant using your general knowledge. Be \
direct and concrete. Keep the answer under {} words. If you genuinely cannot answer, say so \
plainly.",
            self.max_answer_words
        )
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    async fn knowledge_answer(&self, query: &str) -> Result<String, LlmError> {
        let reply = self.model.complete(&self.knowledge_system(), query).await?;
        let trimmed = reply.trim();
        if trimmed.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(trimmed.to_string())
    }

    async fn history_answer(&self, query: &str, history: &str) -> Result<String, LlmError> {
        let user = format!("Conversation so far:\n{}\n\n**Question:** {}", history, query);
        let reply = self.model.complete(HISTORY_SYSTEM, &user).await?;
        let trimmed = reply.trim();
        if trimmed.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(trimmed.to_string())
    }

    async fn choose_answer(
        &self,
        question: &str,
        grounded: &str,
        knowledge: &str,
    ) -> Result<ComparisonVerdict, LlmError> {
        let user = format!(
            "**Question:** {}\n\n**Candidate A (grounded):** {}\n\n**Candidate B (knowledge):** {}",
            question, grounded, knowledge
        );
        let reply = self.model.complete(COMPARE_SYSTEM, &user).await?;
        let value = parse_json_reply(&reply)?;
        let choice = match value
            .get("choice")
            .and_then(|v| v.as_str())
            .map(|s| s.to_ascii_lowercase())
            .as_deref()
        {
            Some("grounded") => AnswerChoice::Grounded,
            Some("knowledge") => AnswerChoice::Knowledge,
            _ => {
                return Err(LlmError::InvalidJson(format!(
                    "no usable choice field: {}",
                    reply
                )))
            }
        };
        let reasoning = value
            .get("reasoning")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        Ok(ComparisonVerdict { choice, reasoning })
    }

    async fn refine_query(&self, query: &str, rejected_answer: &str) -> Result<String, LlmError> {
        let user = format!(
            "**Question:** {}\n\n**Rejected answer:** {}",
            query, rejected_answer
        );
        let reply = self.model.complete(REFINE_SYSTEM, &user).await?;
        let trimmed = reply.trim().trim_matches('"').trim();
        if trimmed.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(trimmed.to_string())
    }
}

// ============================================================================
// Fake generator (Testing)
// ============================================================================

fn next_reply<T: Clone>(queue: &Mutex<Vec<Result<T, LlmError>>>) -> Result<T, LlmError> {
    let mut q = queue.lock().unwrap();
    if q.is_empty() {
        return Err(LlmError::EmptyResponse);
    }
    if q.len() == 1 {
        q[0].clone()
    } else {
        q.remove(0)
    }
}

/// Fake generator with scripted replies per operation.
///
/// Like the fake chat model, a single scripted reply repeats forever and
/// longer scripts are served front to back.
pub struct FakeGenerator {
    knowledge: Mutex<Vec<Result<String, LlmError>>>,
    history: Mutex<Vec<Result<String, LlmError>>>,
    choice: Mutex<Vec<Result<ComparisonVerdict, LlmError>>>,
    refine: Mutex<Vec<Result<String, LlmError>>>,
    call_counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl FakeGenerator {
    /// Every answering operation yields the same text; comparisons pick
    /// the grounded candidate; refinement appends a marker to the query.
    pub fn answering(text: &str) -> Self {
        Self {
            knowledge: Mutex::new(vec![Ok(text.to_string())]),
            history: Mutex::new(vec![Ok(text.to_string())]),
            choice: Mutex::new(vec![Ok(ComparisonVerdict {
                choice: AnswerChoice::Grounded,
                reasoning: None,
            })]),
            refine: Mutex::new(Vec::new()),
            call_counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_knowledge_replies(self, replies: Vec<Result<String, LlmError>>) -> Self {
        *self.knowledge.lock().unwrap() = replies;
        self
    }

    pub fn with_history_replies(self, replies: Vec<Result<String, LlmError>>) -> Self {
        *self.history.lock().unwrap() = replies;
        self
    }

    pub fn with_choice_replies(self, replies: Vec<Result<ComparisonVerdict, LlmError>>) -> Self {
        *self.choice.lock().unwrap() = replies;
        self
    }

    pub fn with_refine_replies(self, replies: Vec<Result<String, LlmError>>) -> Self {
        *self.refine.lock().unwrap() = replies;
        self
    }

    fn record(&self, method: &str) {
        let mut counts = self.call_counts.lock().unwrap();
        *counts.entry(method.to_string()).or_insert(0) += 1;
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.call_counts
            .lock()
            .unwrap()
            .get(method)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.call_counts.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn knowledge_answer(&self, _query: &str) -> Result<String, LlmError> {
        self.record("knowledge_answer");
        next_reply(&self.knowledge)
    }

    async fn history_answer(&self, _query: &str, _history: &str) -> Result<String, LlmError> {
        self.record("history_answer");
        next_reply(&self.history)
    }

    async fn choose_answer(
        &self,
        _question: &str,
        _grounded: &str,
        _knowledge: &str,
    ) -> Result<ComparisonVerdict, LlmError> {
        self.record("choose_answer");
        next_reply(&self.choice)
    }

    async fn refine_query(&self, query: &str, _rejected_answer: &str) -> Result<String, LlmError> {
        self.record("refine_query");
        let scripted = {
            let q = self.refine.lock().unwrap();
            !q.is_empty()
        };
        if scripted {
            next_reply(&self.refine)
        } else {
            Ok(format!("{} (rephrased)", query))
        }
    }
}

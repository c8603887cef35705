//! Query orchestration engine.
//!
//! ## Flow summary
//!
//! ```text
//! Request → Audit create → Memory load → Gate → Route
//!     → (History | Retrieval ∥ Knowledge) → Validate ⇄ Refine
//!     → Sanitize → Finalize + Memory append
//! ```
//!
//! ## Invariants
//!
//! 1. Nothing runs before the audit record exists; create failure is fatal.
//! 2. Each gate stage writes its step before the next stage runs.
//! 3. At most `max_retry_count` generation passes per query.
//! 4. Retrieval failures of any shape become None, never errors.
//! 5. A final audit status is never overwritten.
//! 6. The sanitizer runs exactly once, on the final answer.

use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;
use tracing::{info, warn};

use docent_shared::{EngineError, QueryRequest};

use crate::audit::{AuditStatus, AuditStore, AuditTrail, InMemoryAuditStore};
use crate::classifier::{Classifier, LlmClassifier};
use crate::config::EngineConfig;
use crate::flow::{FlowState, LoopEvent, LoopState, Routing};
use crate::gate::Gate;
use crate::generate::{sanitize_answer, AnswerChoice, ComparisonVerdict, Generator, LlmGenerator};
use crate::llm::HttpChatModel;
use crate::memory::{format_turn, InMemorySessionMemory, SessionMemory};
use crate::retrieval::{HttpRetrievalClient, RetrievalCall, RetrievalClient, Retriever};
use crate::router::{Router, Strategy};
use crate::validate::{AnswerValidator, LlmAnswerValidator};

/// Message returned to hosts that always expect an answer body.
pub const NO_ANSWER_MESSAGE: &str = "No answer was generated.";

/// What one run produced.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    /// None only when `skip_enabled` allowed an empty result.
    pub answer: Option<String>,
    /// Replay handle into the audit store.
    pub audit_id: String,
    pub status: AuditStatus,
}

// ============================================================================
// Engine
// ============================================================================

pub struct Engine {
    gate: Gate,
    router: Router,
    generator: Arc<dyn Generator>,
    validator: Arc<dyn AnswerValidator>,
    retriever: Retriever,
    audit: Arc<dyn AuditStore>,
    memory: Arc<dyn SessionMemory>,
    config: EngineConfig,
}

impl Engine {
    /// Wire an engine from explicit capability values. Every collaborator
    /// is immutable from here on; per-query state lives in the query task.
    pub fn new(
        config: EngineConfig,
        classifier: Arc<dyn Classifier>,
        generator: Arc<dyn Generator>,
        validator: Arc<dyn AnswerValidator>,
        retrieval: Arc<dyn RetrievalClient>,
        audit: Arc<dyn AuditStore>,
        memory: Arc<dyn SessionMemory>,
    ) -> Self {
        let retriever = Retriever::new(retrieval, config.retrieval_timeout());
        Self {
            gate: Gate::new(classifier.clone(), config.classifier_timeout()),
            router: Router::new(classifier, config.classifier_timeout()),
            generator,
            validator,
            retriever,
            audit,
            memory,
            config,
        }
    }

    /// Wire an engine with HTTP capabilities from config, an in-memory
    /// audit store, and in-process session memory. Hosts that want a
    /// durable store assemble via [`Engine::new`].
    pub fn from_config(config: EngineConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var(&config.llm.api_key_env).ok();

        let mut classifier_model = HttpChatModel::new(
            &config.llm.endpoint,
            &config.llm.classifier_model,
            config.classifier_timeout(),
        )?
        .with_temperature(0.0);
        let mut generator_model = HttpChatModel::new(
            &config.llm.endpoint,
            &config.llm.generator_model,
            config.generator_timeout(),
        )?;
        let mut validator_model = HttpChatModel::new(
            &config.llm.endpoint,
            &config.llm.validator_model,
            config.validator_timeout(),
        )?
        .with_temperature(0.0);
        if let Some(key) = &api_key {
            classifier_model = classifier_model.with_api_key(key);
            generator_model = generator_model.with_api_key(key);
            validator_model = validator_model.with_api_key(key);
        }

        let classifier = Arc::new(LlmClassifier::new(
            Arc::new(classifier_model),
            config.flow.rag_threshold,
        ));
        let generator = Arc::new(LlmGenerator::new(
            Arc::new(generator_model),
            config.flow.max_answer_words,
        ));
        let validator = Arc::new(LlmAnswerValidator::new(Arc::new(validator_model)));
        let retrieval = Arc::new(HttpRetrievalClient::new(
            &config.retrieval.endpoint,
            config.retrieval_timeout(),
        )?);
        let memory = Arc::new(InMemorySessionMemory::with_ttl(config.memory_ttl()));

        Ok(Self::new(
            config,
            classifier,
            generator,
            validator,
            retrieval,
            Arc::new(InMemoryAuditStore::new()),
            memory,
        ))
    }

    /// Answer one query end to end.
    ///
    /// Fatal errors come back as `Err` after the audit record was
    /// finalized as failed; everything else lands in the outcome.
    pub async fn handle(&self, request: &QueryRequest) -> Result<QueryOutcome, EngineError> {
        let started = Instant::now();
        info!(
            "[engine] query for community {} (skip_enabled: {})",
            request.community_id, request.skip_enabled
        );

        // Nothing may run unrecorded.
        let record_id = self
            .audit
            .create(request)
            .map_err(|e| EngineError::AuditCreate(e.to_string()))?;
        let trail = AuditTrail::bind(self.audit.clone(), record_id.clone());

        match self.run_pipeline(request, &trail).await {
            Ok(answer) => {
                let (answer, status) = self.finish(request, &trail, answer);
                info!(
                    "[+] run {} finished {} in {}ms",
                    record_id,
                    status,
                    started.elapsed().as_millis()
                );
                Ok(QueryOutcome {
                    answer,
                    audit_id: record_id,
                    status,
                })
            }
            Err(e) => {
                warn!("[!] run {} failed: {}", record_id, e);
                trail.step(
                    "error",
                    json!({ "kind": e.kind(), "message": e.to_string() }),
                );
                trail.finalize(None, AuditStatus::Failed);
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        request: &QueryRequest,
        trail: &AuditTrail,
    ) -> Result<Option<String>, EngineError> {
        // ================================================================
        // STEP 1: Conversational memory (context only, no audit step)
        // ================================================================
        let chat_history = request
            .session_id
            .as_deref()
            .and_then(|sid| self.memory.read(sid));
        let mut state = FlowState::new(request.query.clone()).with_history(chat_history);

        // ================================================================
        // STEP 2: Gating cascade
        // ================================================================
        if self
            .gate
            .evaluate(&request.query, request.skip_enabled, trail)
            .await?
            == Routing::Stop
        {
            state.routing = Routing::Stop;
            info!("[engine] gated, no answer will be produced");
            return Ok(None);
        }

        // ================================================================
        // STEP 3: Strategy routing
        // ================================================================
        let strategy = self
            .router
            .route(&request.query, state.chat_history.as_deref(), trail)
            .await?;

        // ================================================================
        // STEP 4: Generate / validate / refine loop
        // ================================================================
        self.drive_loop(request, strategy, &mut state, trail).await
    }

    /// The validation loop: at most `max_retry_count` generation passes,
    /// each judged, with a query rewrite between rejected passes.
    async fn drive_loop(
        &self,
        request: &QueryRequest,
        strategy: Strategy,
        state: &mut FlowState,
        trail: &AuditTrail,
    ) -> Result<Option<String>, EngineError> {
        let max_retry_count = self.config.flow.max_retry_count;
        let mut loop_state = LoopState::Answered;

        loop {
            let answer = self
                .generate_candidate(request, strategy, state, trail)
                .await?;
            state.record_pass(answer);
            trail.step(
                "generation",
                json!({
                    "strategy": strategy,
                    "pass": state.retry_count,
                    "answered": state.last_answer.is_some(),
                }),
            );
            loop_state = loop_state.advance(LoopEvent::AnswerProduced, state.retry_count, max_retry_count);

            // A deliberate no-answer terminates without judging.
            let Some(answer_text) = state.last_answer.clone() else {
                loop_state =
                    loop_state.advance(LoopEvent::SentinelAnswer, state.retry_count, max_retry_count);
                debug_assert_eq!(loop_state, LoopState::Terminal);
                return Ok(None);
            };

            let verdict = match timeout(
                self.config.validator_timeout(),
                self.validator.validate(&state.current_query, &answer_text),
            )
            .await
            {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => return Err(EngineError::Validation(e.to_string())),
                Err(_) => {
                    return Err(EngineError::Validation(format!(
                        "timeout after {}s",
                        self.config.llm.validator_timeout_secs
                    )))
                }
            };
            trail.step(
                "validation",
                json!({
                    "relevant": verdict.result,
                    "reasoning": verdict.reasoning,
                    "pass": state.retry_count,
                }),
            );

            let event = if verdict.result {
                LoopEvent::JudgedRelevant
            } else {
                LoopEvent::JudgedIrrelevant
            };
            loop_state = loop_state.advance(event, state.retry_count, max_retry_count);
            if loop_state != LoopState::Refining {
                return Ok(state.last_answer.clone());
            }

            // Rewrite the query for the next pass; a failed rewrite ends
            // the loop with what we have.
            match timeout(
                self.config.generator_timeout(),
                self.generator.refine_query(&state.current_query, &answer_text),
            )
            .await
            {
                Ok(Ok(refined)) => {
                    trail.step(
                        "refinement",
                        json!({ "from": state.current_query, "to": refined }),
                    );
                    info!("[*] pass {} rejected, query refined", state.retry_count);
                    state.current_query = refined;
                    loop_state =
                        loop_state.advance(LoopEvent::QueryRefined, state.retry_count, max_retry_count);
                }
                Ok(Err(e)) => {
                    warn!("[!] refinement failed, keeping last answer: {}", e);
                    return Ok(state.last_answer.clone());
                }
                Err(_) => {
                    warn!("[!] refinement timed out, keeping last answer");
                    return Ok(state.last_answer.clone());
                }
            }
        }
    }

    /// One generation pass. `None` is the sentinel: retrieval found
    /// nothing and the community asked for no ungrounded answers.
    async fn generate_candidate(
        &self,
        request: &QueryRequest,
        strategy: Strategy,
        state: &FlowState,
        trail: &AuditTrail,
    ) -> Result<Option<String>, EngineError> {
        match strategy {
            Strategy::History => {
                let history = state.chat_history.as_deref().unwrap_or_default();
                match timeout(
                    self.config.generator_timeout(),
                    self.generator.history_answer(&state.current_query, history),
                )
                .await
                {
                    Ok(Ok(text)) => Ok(Some(text)),
                    Ok(Err(e)) => Err(EngineError::Generation(e.to_string())),
                    Err(_) => Err(EngineError::Generation(format!(
                        "history answer timeout after {}s",
                        self.config.llm.generator_timeout_secs
                    ))),
                }
            }
            Strategy::Retrieval => {
                // Grounded and knowledge candidates run concurrently.
                let mut call = RetrievalCall::new(&request.community_id, &state.current_query);
                if let Some(filters) = &request.filters {
                    call = call.with_filters(filters.clone());
                }
                let (grounded, knowledge) = tokio::join!(
                    self.retriever.retrieve(&call),
                    timeout(
                        self.config.generator_timeout(),
                        self.generator.knowledge_answer(&state.current_query),
                    )
                );
                let knowledge = match knowledge {
                    Ok(Ok(text)) => Ok(text),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!(
                        "knowledge answer timeout after {}s",
                        self.config.llm.generator_timeout_secs
                    )),
                };
                trail.step(
                    "retrieval",
                    json!({ "callId": call.call_id, "found": grounded.is_some() }),
                );

                match (grounded, knowledge) {
                    (Some(grounded), Ok(knowledge)) => {
                        let verdict = self
                            .compare_candidates(&state.current_query, &grounded, &knowledge)
                            .await;
                        trail.step(
                            "comparison",
                            json!({ "choice": verdict.choice, "reasoning": verdict.reasoning }),
                        );
                        let chosen = match verdict.choice {
                            AnswerChoice::Grounded => grounded,
                            AnswerChoice::Knowledge => knowledge,
                        };
                        Ok(Some(chosen))
                    }
                    (Some(grounded), Err(e)) => {
                        warn!("[*] knowledge candidate failed ({}), keeping grounded", e);
                        Ok(Some(grounded))
                    }
                    (None, knowledge) if request.skip_enabled => {
                        if let Err(e) = knowledge {
                            warn!("[*] knowledge candidate failed ({}), discarding", e);
                        }
                        info!("[*] nothing retrieved and skipping allowed, sentinel answer");
                        Ok(None)
                    }
                    (None, Ok(knowledge)) => Ok(Some(knowledge)),
                    (None, Err(e)) => Err(EngineError::Generation(e)),
                }
            }
        }
    }

    /// Grounded wins unless the judge says otherwise; a failed judgment
    /// defaults to grounded since it exists and is sourced.
    async fn compare_candidates(
        &self,
        question: &str,
        grounded: &str,
        knowledge: &str,
    ) -> ComparisonVerdict {
        match timeout(
            self.config.generator_timeout(),
            self.generator.choose_answer(question, grounded, knowledge),
        )
        .await
        {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => {
                warn!("[*] comparison failed, keeping grounded: {}", e);
                ComparisonVerdict {
                    choice: AnswerChoice::Grounded,
                    reasoning: None,
                }
            }
            Err(_) => {
                warn!("[*] comparison timed out, keeping grounded");
                ComparisonVerdict {
                    choice: AnswerChoice::Grounded,
                    reasoning: None,
                }
            }
        }
    }

    /// Sanitize once, map the no-answer boundary, close the record, and
    /// remember the turn.
    fn finish(
        &self,
        request: &QueryRequest,
        trail: &AuditTrail,
        answer: Option<String>,
    ) -> (Option<String>, AuditStatus) {
        let answer = answer.map(|text| {
            let (clean, replaced) = sanitize_answer(&text);
            if replaced {
                warn!("[!] generic error text replaced with apology");
                trail.step("answer_sanitized", json!({ "replaced": true }));
            }
            clean
        });

        match answer {
            Some(text) => {
                trail.finalize(Some(&text), AuditStatus::Completed);
                if let Some(session_id) = &request.session_id {
                    if !self.memory.append(session_id, &format_turn(&request.query, &text)) {
                        warn!("[!] session memory append lost for {}", session_id);
                    }
                }
                (Some(text), AuditStatus::Completed)
            }
            None if request.skip_enabled => {
                trail.finalize(None, AuditStatus::CompletedNoAnswer);
                (None, AuditStatus::CompletedNoAnswer)
            }
            None => {
                trail.finalize(Some(NO_ANSWER_MESSAGE), AuditStatus::CompletedNoAnswer);
                (
                    Some(NO_ANSWER_MESSAGE.to_string()),
                    AuditStatus::CompletedNoAnswer,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::FailingAuditStore;
    use crate::classifier::FakeClassifier;
    use crate::generate::FakeGenerator;
    use crate::retrieval::FakeRetrievalClient;
    use crate::validate::FakeValidator;
    use docent_shared::ClassificationOutcome;

    struct Harness {
        engine: Engine,
        audit: Arc<InMemoryAuditStore>,
        memory: Arc<InMemorySessionMemory>,
    }

    fn harness(
        classifier: FakeClassifier,
        generator: FakeGenerator,
        validator: FakeValidator,
        retrieval: FakeRetrievalClient,
    ) -> Harness {
        let audit = Arc::new(InMemoryAuditStore::new());
        let memory = Arc::new(InMemorySessionMemory::new());
        let engine = Engine::new(
            EngineConfig::default(),
            Arc::new(classifier),
            Arc::new(generator),
            Arc::new(validator),
            Arc::new(retrieval),
            audit.clone(),
            memory.clone(),
        );
        Harness {
            engine,
            audit,
            memory,
        }
    }

    #[tokio::test]
    async fn test_audit_create_failure_is_fatal() {
        let engine = Engine::new(
            EngineConfig::default(),
            Arc::new(FakeClassifier::question()),
            Arc::new(FakeGenerator::answering("x")),
            Arc::new(FakeValidator::approving()),
            Arc::new(FakeRetrievalClient::answering("x")),
            Arc::new(FailingAuditStore),
            Arc::new(InMemorySessionMemory::new()),
        );
        let err = engine
            .handle(&QueryRequest::new("c1", "q?"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AuditCreate(_)));
    }

    #[tokio::test]
    async fn test_retrieval_strategy_prefers_grounded() {
        let h = harness(
            FakeClassifier::question(),
            FakeGenerator::answering("knowledge answer"),
            FakeValidator::approving(),
            FakeRetrievalClient::answering("grounded answer"),
        );
        let outcome = h
            .engine
            .handle(&QueryRequest::new("c1", "where?").with_skip_enabled(true))
            .await
            .unwrap();
        assert_eq!(outcome.answer.as_deref(), Some("grounded answer"));
        assert_eq!(outcome.status, AuditStatus::Completed);
    }

    #[tokio::test]
    async fn test_empty_retrieval_with_skip_yields_sentinel() {
        let h = harness(
            FakeClassifier::question(),
            FakeGenerator::answering("knowledge answer"),
            FakeValidator::approving(),
            FakeRetrievalClient::empty(),
        );
        let outcome = h
            .engine
            .handle(&QueryRequest::new("c1", "where?").with_skip_enabled(true))
            .await
            .unwrap();
        assert_eq!(outcome.answer, None);
        assert_eq!(outcome.status, AuditStatus::CompletedNoAnswer);
        let record = h.audit.read(&outcome.audit_id).unwrap();
        assert!(record.response.is_none());
    }

    #[tokio::test]
    async fn test_sentinel_survives_knowledge_candidate_failure() {
        let h = harness(
            FakeClassifier::question(),
            FakeGenerator::answering("x")
                .with_knowledge_replies(vec![Err(crate::llm::LlmError::EmptyResponse)]),
            FakeValidator::approving(),
            FakeRetrievalClient::empty(),
        );
        let outcome = h
            .engine
            .handle(&QueryRequest::new("c1", "where?").with_skip_enabled(true))
            .await
            .unwrap();
        // The failed knowledge candidate is discarded, not escalated.
        assert_eq!(outcome.answer, None);
        assert_eq!(outcome.status, AuditStatus::CompletedNoAnswer);
    }

    #[tokio::test]
    async fn test_empty_retrieval_without_skip_falls_back_to_knowledge() {
        let h = harness(
            FakeClassifier::question(),
            FakeGenerator::answering("knowledge answer"),
            FakeValidator::approving(),
            FakeRetrievalClient::empty(),
        );
        let outcome = h
            .engine
            .handle(&QueryRequest::new("c1", "where?"))
            .await
            .unwrap();
        assert_eq!(outcome.answer.as_deref(), Some("knowledge answer"));
        assert_eq!(outcome.status, AuditStatus::Completed);
    }

    #[tokio::test]
    async fn test_rejected_answers_refine_until_budget_spent() {
        let h = harness(
            FakeClassifier::question(),
            FakeGenerator::answering("attempt"),
            FakeValidator::rejecting(),
            FakeRetrievalClient::answering("attempt"),
        );
        let outcome = h
            .engine
            .handle(&QueryRequest::new("c1", "why?").with_skip_enabled(true))
            .await
            .unwrap();
        // The loop keeps the last rejected answer once the budget is gone.
        assert_eq!(outcome.answer.as_deref(), Some("attempt"));
        let record = h.audit.read(&outcome.audit_id).unwrap();
        let passes = record
            .steps
            .iter()
            .filter(|s| s.step_name == "generation")
            .count();
        assert_eq!(passes as u32, EngineConfig::default().flow.max_retry_count);
        let refinements = record
            .steps
            .iter()
            .filter(|s| s.step_name == "refinement")
            .count();
        assert_eq!(refinements as u32, EngineConfig::default().flow.max_retry_count - 1);
    }

    #[tokio::test]
    async fn test_validation_failure_is_fatal_and_recorded() {
        let h = harness(
            FakeClassifier::question(),
            FakeGenerator::answering("attempt"),
            FakeValidator::new(vec![Err(crate::llm::LlmError::EmptyResponse)]),
            FakeRetrievalClient::answering("attempt"),
        );
        let err = h
            .engine
            .handle(&QueryRequest::new("c1", "why?"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_answer_lands_in_session_memory() {
        let h = harness(
            FakeClassifier::question(),
            FakeGenerator::answering("the fee is 0.3%"),
            FakeValidator::approving(),
            FakeRetrievalClient::answering("the fee is 0.3%"),
        );
        let request = QueryRequest::new("c1", "what is the fee?").with_session("s1");
        h.engine.handle(&request).await.unwrap();
        let remembered = h.memory.read("s1").unwrap();
        assert!(remembered.contains("User: what is the fee?"));
        assert!(remembered.contains("Assistant: the fee is 0.3%"));
    }

    #[tokio::test]
    async fn test_history_strategy_uses_memory() {
        let classifier = FakeClassifier::question()
            .with_is_about_history(Ok(ClassificationOutcome::new(true)));
        let generator =
            FakeGenerator::answering("x").with_history_replies(vec![Ok("I said 0.3%".to_string())]);
        let h = harness(
            classifier,
            generator,
            FakeValidator::approving(),
            FakeRetrievalClient::answering("unused"),
        );
        h.memory.append("s1", "User: fee?\nAssistant: 0.3%\n");
        let request = QueryRequest::new("c1", "what did you say?").with_session("s1");
        let outcome = h.engine.handle(&request).await.unwrap();
        assert_eq!(outcome.answer.as_deref(), Some("I said 0.3%"));
    }

    #[tokio::test]
    async fn test_leaked_error_text_becomes_apology() {
        let h = harness(
            FakeClassifier::question(),
            FakeGenerator::answering("x"),
            FakeValidator::approving(),
            FakeRetrievalClient::answering("I encountered an error while using the tool."),
        );
        let outcome = h
            .engine
            .handle(&QueryRequest::new("c1", "where?").with_skip_enabled(true))
            .await
            .unwrap();
        assert_eq!(
            outcome.answer.as_deref(),
            Some(crate::generate::APOLOGY_MESSAGE)
        );
        let record = h.audit.read(&outcome.audit_id).unwrap();
        assert!(record.steps.iter().any(|s| s.step_name == "answer_sanitized"));
    }
}

//! Gating cascade.
//!
//! Three short-circuiting stages decide whether a query deserves an
//! answer at all. Each stage appends its audit step before the next
//! stage runs, so a stopped run shows exactly how far it got. With
//! `skip_enabled` off the cascade is bypassed wholesale: no classifier
//! calls, no steps.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::info;

use docent_shared::{ClassifyError, EngineError};

use crate::audit::AuditTrail;
use crate::classifier::Classifier;
use crate::flow::Routing;

pub struct Gate {
    classifier: Arc<dyn Classifier>,
    call_timeout: Duration,
}

impl Gate {
    pub fn new(classifier: Arc<dyn Classifier>, call_timeout: Duration) -> Self {
        Self {
            classifier,
            call_timeout,
        }
    }

    fn timed_out(&self) -> ClassifyError {
        ClassifyError::Backend(format!("timeout after {}s", self.call_timeout.as_secs()))
    }

    pub async fn evaluate(
        &self,
        query: &str,
        skip_enabled: bool,
        trail: &AuditTrail,
    ) -> Result<Routing, EngineError> {
        if !skip_enabled {
            info!("[gate] skipping disabled, always answering");
            return Ok(Routing::Continue);
        }

        // Stage 1: local statement check, no model involved.
        let question_like = self.classifier.looks_like_question(query);
        trail.step("statement_check", json!({ "question": question_like }));
        if !question_like {
            info!("[gate] reads as a statement, stopping");
            return Ok(Routing::Stop);
        }

        // Stage 2: genuine-question check.
        let outcome = timeout(self.call_timeout, self.classifier.is_question(query))
            .await
            .map_err(|_| self.timed_out())??;
        trail.step(
            "question_check",
            json!({ "question": outcome.result, "reasoning": outcome.reasoning }),
        );
        if !outcome.result {
            info!("[gate] not a genuine question, stopping");
            return Ok(Routing::Stop);
        }

        // Stage 3: does it need the knowledge base at all?
        let scored = timeout(self.call_timeout, self.classifier.retrieval_worthiness(query))
            .await
            .map_err(|_| self.timed_out())??;
        trail.step(
            "rag_check",
            json!({
                "result": scored.result(),
                "score": scored.score(),
                "threshold": scored.threshold(),
                "reasoning": scored.reasoning(),
            }),
        );
        if !scored.result() {
            info!(
                "[gate] score {:.2} below threshold {:.2}, stopping",
                scored.score(),
                scored.threshold()
            );
            return Ok(Routing::Stop);
        }

        Ok(Routing::Continue)
    }
}

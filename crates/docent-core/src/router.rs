//! Strategy routing.
//!
//! History answering is only worth attempting when the session actually
//! has history and the question refers back to it; everything else goes
//! through retrieval.

use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::info;

use docent_shared::{ClassifyError, EngineError};

use crate::audit::AuditTrail;
use crate::classifier::Classifier;

/// How the answer will be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Answer from the session's conversation text.
    History,
    /// Answer from the knowledge base, with a knowledge fallback.
    Retrieval,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::History => write!(f, "history"),
            Strategy::Retrieval => write!(f, "retrieval"),
        }
    }
}

pub struct Router {
    classifier: Arc<dyn Classifier>,
    call_timeout: Duration,
}

impl Router {
    pub fn new(classifier: Arc<dyn Classifier>, call_timeout: Duration) -> Self {
        Self {
            classifier,
            call_timeout,
        }
    }

    pub async fn route(
        &self,
        query: &str,
        chat_history: Option<&str>,
        trail: &AuditTrail,
    ) -> Result<Strategy, EngineError> {
        let (strategy, reasoning) = match chat_history {
            Some(history) if !history.trim().is_empty() => {
                let outcome = timeout(self.call_timeout, self.classifier.is_about_history(query))
                    .await
                    .map_err(|_| {
                        ClassifyError::Backend(format!(
                            "timeout after {}s",
                            self.call_timeout.as_secs()
                        ))
                    })??;
                let strategy = if outcome.result {
                    Strategy::History
                } else {
                    Strategy::Retrieval
                };
                (strategy, outcome.reasoning)
            }
            _ => (
                Strategy::Retrieval,
                Some("no chat history in this session".to_string()),
            ),
        };

        trail.step(
            "route_selected",
            json!({ "strategy": strategy, "reasoning": reasoning }),
        );
        info!("[router] strategy: {}", strategy);
        Ok(strategy)
    }
}

//! Retrieval call boundary.
//!
//! One invocation per generation pass, wrapped in a caller-side timeout.
//! The remote pipeline owns retry policy; this layer never retries.
//! Every failure shape collapses to None so the flow can fall back
//! cleanly instead of branching on transport details.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Wire marker the retrieval workflow returns when it found nothing.
pub const NO_RESULT_MARKER: &str = "NONE";

/// Object keys that mark a failure-shaped success payload.
const FAILURE_KEYS: &[&str] = &["failure", "stackTrace"];

/// Fragments that mark a serialized failure leaked into a string reply.
const FAILURE_FRAGMENTS: &[&str] = &["stackTrace", "applicationFailureInfo"];

/// Retrieval call errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RetrievalError {
    /// The remote ran out of its own retries and gave up.
    #[error("retrieval workflow failed: {0}")]
    WorkflowFailed(String),

    #[error("retrieval transport error: {0}")]
    Transport(String),
}

/// A single retrieval invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalCall {
    /// Unique id for log correlation, derived from the community
    pub call_id: String,
    pub community_id: String,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<serde_json::Value>,
}

impl RetrievalCall {
    pub fn new(community_id: impl Into<String>, query: impl Into<String>) -> Self {
        let community_id = community_id.into();
        Self {
            call_id: format!("query-{}-{}", community_id, Uuid::new_v4()),
            community_id,
            query: query.into(),
            filters: None,
        }
    }

    pub fn with_filters(mut self, filters: serde_json::Value) -> Self {
        self.filters = Some(filters);
        self
    }
}

// ============================================================================
// Retrieval Client Trait
// ============================================================================

/// Transport to the remote retrieval workflow.
#[async_trait]
pub trait RetrievalClient: Send + Sync {
    async fn execute(&self, call: &RetrievalCall) -> Result<serde_json::Value, RetrievalError>;
}

/// Real client posting to the retrieval front door.
pub struct HttpRetrievalClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRetrievalClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, RetrievalError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RetrievalError::Transport(format!("client build failed: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RetrievalClient for HttpRetrievalClient {
    async fn execute(&self, call: &RetrievalCall) -> Result<serde_json::Value, RetrievalError> {
        let url = format!("{}/query", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(call)
            .send()
            .await
            .map_err(|e| RetrievalError::Transport(format!("request failed: {}", e)))?;

        let status = response.status();
        if status.is_server_error() {
            // The workflow ran and died; its own retries are spent.
            let body = response.text().await.unwrap_or_default();
            return Err(RetrievalError::WorkflowFailed(format!(
                "HTTP {}: {}",
                status, body
            )));
        }
        if !status.is_success() {
            return Err(RetrievalError::Transport(format!("HTTP {}", status)));
        }

        response
            .json()
            .await
            .map_err(|e| RetrievalError::Transport(format!("unreadable body: {}", e)))
    }
}

// ============================================================================
// Normalizing wrapper
// ============================================================================

/// Executes one retrieval call and folds every failure shape to None.
pub struct Retriever {
    client: Arc<dyn RetrievalClient>,
    timeout: Duration,
}

impl Retriever {
    pub fn new(client: Arc<dyn RetrievalClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// `None` means "nothing trustworthy came back", whatever the cause.
    pub async fn retrieve(&self, call: &RetrievalCall) -> Option<String> {
        match tokio::time::timeout(self.timeout, self.client.execute(call)).await {
            Ok(Ok(payload)) => normalize_payload(payload, &call.call_id),
            Ok(Err(e)) => {
                warn!("[retrieval] {} failed: {}", call.call_id, e);
                None
            }
            Err(_) => {
                warn!(
                    "[retrieval] {} timed out after {}s",
                    call.call_id,
                    self.timeout.as_secs()
                );
                None
            }
        }
    }
}

/// Apply the wire contract: a string answer, the no-result marker, or
/// one of the failure shapes the runner has been seen to return.
fn normalize_payload(payload: serde_json::Value, call_id: &str) -> Option<String> {
    // Plain HTTP plumbing sometimes wraps the answer as {"result": ...}.
    let payload = match payload {
        serde_json::Value::Object(map) => {
            if FAILURE_KEYS.iter().any(|k| map.contains_key(*k)) {
                warn!("[retrieval] {} returned a failure payload", call_id);
                return None;
            }
            match map.get("result") {
                Some(inner) => inner.clone(),
                None => {
                    warn!("[retrieval] {} returned an unexpected object shape", call_id);
                    return None;
                }
            }
        }
        other => other,
    };

    match payload {
        serde_json::Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() || trimmed == NO_RESULT_MARKER {
                debug!("[retrieval] {} found nothing", call_id);
                return None;
            }
            if FAILURE_FRAGMENTS.iter().any(|f| s.contains(f)) {
                warn!("[retrieval] {} returned a serialized failure", call_id);
                return None;
            }
            Some(s)
        }
        serde_json::Value::Null => None,
        other => {
            warn!(
                "[retrieval] {} returned a non-string payload: {}",
                call_id, other
            );
            None
        }
    }
}

// ============================================================================
// Fake retrieval client (Testing)
// ============================================================================

/// Fake client with a fixed reply, an optional artificial delay, and a
/// call log.
pub struct FakeRetrievalClient {
    reply: Result<serde_json::Value, RetrievalError>,
    delay: Option<Duration>,
    calls: Mutex<Vec<RetrievalCall>>,
}

impl FakeRetrievalClient {
    /// Always answers with the given text.
    pub fn answering(text: &str) -> Self {
        Self::with_payload(serde_json::Value::String(text.to_string()))
    }

    /// Always reports "nothing found" via the wire marker.
    pub fn empty() -> Self {
        Self::with_payload(serde_json::Value::String(NO_RESULT_MARKER.to_string()))
    }

    pub fn with_payload(payload: serde_json::Value) -> Self {
        Self {
            reply: Ok(payload),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(error: RetrievalError) -> Self {
        Self {
            reply: Err(error),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Sleep this long before replying, to exercise caller-side timeouts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<RetrievalCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RetrievalClient for FakeRetrievalClient {
    async fn execute(&self, call: &RetrievalCall) -> Result<serde_json::Value, RetrievalError> {
        self.calls.lock().unwrap().push(call.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.reply.clone()
    }
}

//! Chat model abstraction.
//!
//! One narrow trait for every LLM-backed capability, an HTTP
//! implementation speaking the OpenAI-compatible chat-completions shape,
//! and a scripted fake for tests. Structured replies are requested in the
//! prompt and salvaged with a lenient brace scan rather than trusting the
//! backend's response-format support.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

/// LLM call errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Invalid JSON response: {0}")]
    InvalidJson(String),

    #[error("Request timeout after {0} seconds")]
    Timeout(u64),

    #[error("LLM returned empty response")]
    EmptyResponse,
}

/// Generic chat model: one system/user exchange in, reply text out.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError>;
}

/// Pull the outermost JSON object out of a chatty reply.
///
/// Models wrap JSON in prose or code fences often enough that strict
/// parsing of the raw text throws away good answers.
pub(crate) fn extract_json(text: &str) -> String {
    if let Some(json_start) = text.find('{') {
        if let Some(json_end) = text.rfind('}') {
            if json_end > json_start {
                return text[json_start..=json_end].to_string();
            }
        }
    }
    text.to_string()
}

/// Parse a reply that was instructed to be a JSON object.
pub(crate) fn parse_json_reply(text: &str) -> Result<serde_json::Value, LlmError> {
    let json_text = extract_json(text);
    serde_json::from_str(&json_text)
        .map_err(|e| LlmError::InvalidJson(format!("{}: {}", e, text)))
}

/// Real chat model over HTTP
pub struct HttpChatModel {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    temperature: Option<f32>,
    timeout_secs: u64,
}

impl HttpChatModel {
    pub fn new(endpoint: &str, model: &str, timeout: Duration) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::HttpError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: None,
            temperature: None,
            timeout_secs: timeout.as_secs(),
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Fix the sampling temperature (classifiers run at 0.0)
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[async_trait]
impl ChatModel for HttpChatModel {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.endpoint);

        let mut request_body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
        });
        if let Some(t) = self.temperature {
            request_body["temperature"] = serde_json::json!(t);
        }

        let mut request = self.client.post(&url).json(&request_body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout(self.timeout_secs)
            } else {
                LlmError::HttpError(format!("Request failed: {}", e))
            }
        })?;

        if !response.status().is_success() {
            return Err(LlmError::HttpError(format!(
                "HTTP {} from chat endpoint",
                response.status()
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidJson(format!("Failed to parse response: {}", e)))?;

        let text = response_json
            .get("choices")
            .and_then(|v| v.get(0))
            .and_then(|v| v.get("message"))
            .and_then(|v| v.get("content"))
            .and_then(|v| v.as_str())
            .ok_or(LlmError::EmptyResponse)?;

        if text.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }

        Ok(text.to_string())
    }
}

/// Fake chat model for testing.
///
/// A single scripted reply repeats forever; multiple replies are served
/// front to back, then the fake reports an empty response.
pub struct FakeChatModel {
    replies: Mutex<Vec<Result<String, LlmError>>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl FakeChatModel {
    pub fn new(replies: Vec<Result<String, LlmError>>) -> Self {
        Self {
            replies: Mutex::new(replies),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fake that always answers with the same text
    pub fn always(reply: impl Into<String>) -> Self {
        Self::new(vec![Ok(reply.into())])
    }

    /// Fake that always fails with the given error
    pub fn always_error(error: LlmError) -> Self {
        Self::new(vec![Err(error)])
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Recorded (system, user) prompt pairs, in call order
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for FakeChatModel {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError> {
        self.calls
            .lock()
            .unwrap()
            .push((system_prompt.to_string(), user_prompt.to_string()));

        let mut replies = self.replies.lock().unwrap();
        if replies.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        if replies.len() == 1 {
            replies[0].clone()
        } else {
            replies.remove(0)
        }
    }
}

//! Engine configuration.
//!
//! Loads settings from /etc/docent/config.toml or uses defaults. Every
//! field has a serde default so partial files stay valid.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/docent/config.toml";

/// Local fallback path for development setups
pub const DEFAULT_CONFIG_PATH: &str = "docent.toml";

/// Chat model endpoint and per-capability budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-style chat-completions base URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Environment variable holding the API key; empty means unauthenticated
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model for gate/router classification - fast, cheap
    #[serde(default = "default_classifier_model")]
    pub classifier_model: String,

    /// Model for answer generation and refinement
    #[serde(default = "default_generator_model")]
    pub generator_model: String,

    /// Model for answer relevance validation
    #[serde(default = "default_validator_model")]
    pub validator_model: String,

    /// Classifier call timeout in seconds
    #[serde(default = "default_classifier_timeout")]
    pub classifier_timeout_secs: u64,

    /// Generation call timeout in seconds
    #[serde(default = "default_generator_timeout")]
    pub generator_timeout_secs: u64,

    /// Validation call timeout in seconds
    #[serde(default = "default_validator_timeout")]
    pub validator_timeout_secs: u64,
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_classifier_model() -> String {
    // Classification is a one-token judgment, the small tier is enough
    "gpt-4o-mini-2024-07-18".to_string()
}

fn default_generator_model() -> String {
    "o4-mini-2025-04-16".to_string()
}

fn default_validator_model() -> String {
    "gpt-4o-mini-2024-07-18".to_string()
}

fn default_classifier_timeout() -> u64 {
    15
}

fn default_generator_timeout() -> u64 {
    60
}

fn default_validator_timeout() -> u64 {
    15
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key_env: default_api_key_env(),
            classifier_model: default_classifier_model(),
            generator_model: default_generator_model(),
            validator_model: default_validator_model(),
            classifier_timeout_secs: default_classifier_timeout(),
            generator_timeout_secs: default_generator_timeout(),
            validator_timeout_secs: default_validator_timeout(),
        }
    }
}

/// Retrieval collaborator endpoint and budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Base URL of the retrieval workflow front door
    #[serde(default = "default_retrieval_endpoint")]
    pub endpoint: String,

    /// Caller-side timeout in seconds; the remote owns its own retries
    #[serde(default = "default_retrieval_timeout")]
    pub timeout_secs: u64,
}

fn default_retrieval_endpoint() -> String {
    "http://localhost:8800".to_string()
}

fn default_retrieval_timeout() -> u64 {
    // The remote pipeline is allowed several internal retries
    300
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            endpoint: default_retrieval_endpoint(),
            timeout_secs: default_retrieval_timeout(),
        }
    }
}

/// Session memory expiry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Sliding TTL in seconds; every append resets the full window
    #[serde(default = "default_memory_ttl")]
    pub ttl_secs: u64,
}

fn default_memory_ttl() -> u64 {
    900 // 15 minutes
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_memory_ttl(),
        }
    }
}

/// Gating and validation-loop knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Upper bound on generation passes per query
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,

    /// Minimum retrieval-worthiness score for the gate to continue
    #[serde(default = "default_rag_threshold")]
    pub rag_threshold: f64,

    /// Soft word cap passed to the generator instruction
    #[serde(default = "default_max_answer_words")]
    pub max_answer_words: usize,
}

fn default_max_retry_count() -> u32 {
    3
}

fn default_rag_threshold() -> f64 {
    0.5
}

fn default_max_answer_words() -> usize {
    250
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_retry_count: default_max_retry_count(),
            rag_threshold: default_rag_threshold(),
            max_answer_words: default_max_answer_words(),
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub flow: FlowConfig,
}

impl EngineConfig {
    /// Load config from the standard paths, falling back to defaults
    pub fn load() -> Self {
        Self::load_from_path(CONFIG_PATH)
            .or_else(|_| Self::load_from_path(DEFAULT_CONFIG_PATH))
            .unwrap_or_else(|e| {
                warn!("Config not found, using defaults: {}", e);
                EngineConfig::default()
            })
    }

    /// Load config from a specific path
    pub fn load_from_path(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        info!("Loaded config from {}", path);
        Ok(config)
    }

    pub fn classifier_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.classifier_timeout_secs)
    }

    pub fn generator_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.generator_timeout_secs)
    }

    pub fn validator_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.validator_timeout_secs)
    }

    pub fn retrieval_timeout(&self) -> Duration {
        Duration::from_secs(self.retrieval.timeout_secs)
    }

    pub fn memory_ttl(&self) -> Duration {
        Duration::from_secs(self.memory.ttl_secs)
    }
}

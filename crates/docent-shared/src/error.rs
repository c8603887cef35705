//! Error types shared across the engine layers.

use thiserror::Error;

/// Failures while turning a model reply into a classification.
///
/// Every variant is fatal to the run: a classifier that cannot be parsed
/// must never silently become a default decision.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClassifyError {
    /// The reply held no recognizable true/false token.
    #[error("no boolean token in classifier reply: {0:?}")]
    UnrecognizedBoolean(String),
    /// The reply was expected to be JSON and was not, or lacked a field.
    #[error("classifier reply is malformed: {0}")]
    MalformedReply(String),
    /// The call itself failed (transport, timeout, empty reply).
    #[error("classifier backend error: {0}")]
    Backend(String),
    #[error("score {0} is outside [0, 1]")]
    ScoreOutOfRange(f64),
    #[error("threshold {0} is outside [0, 1]")]
    ThresholdOutOfRange(f64),
}

/// Top-level engine failure, surfaced to the hosting worker after the
/// audit record has been finalized as failed.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("audit record could not be created: {0}")]
    AuditCreate(String),
    #[error("classifier failure: {0}")]
    Classifier(#[from] ClassifyError),
    #[error("answer generation failure: {0}")]
    Generation(String),
    #[error("answer validation failure: {0}")]
    Validation(String),
}

impl EngineError {
    /// Stable label written into the audit record's error step.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::AuditCreate(_) => "audit_create",
            EngineError::Classifier(_) => "classifier",
            EngineError::Generation(_) => "generation",
            EngineError::Validation(_) => "validation",
        }
    }
}

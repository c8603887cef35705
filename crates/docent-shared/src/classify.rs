//! Classification outcomes produced by the gate and router stages.

use serde::{Deserialize, Serialize};

use crate::error::ClassifyError;

/// Yes/no judgment, with the model's reasoning when it offered one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationOutcome {
    pub result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl ClassificationOutcome {
    pub fn new(result: bool) -> Self {
        Self {
            result,
            reasoning: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// Threshold-scored judgment.
///
/// `result` is derived from `score >= threshold` at construction and the
/// fields are private, so the pair can never drift apart. Construction
/// rejects scores or thresholds outside `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredClassification {
    result: bool,
    score: f64,
    threshold: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<String>,
}

impl ScoredClassification {
    pub fn new(
        score: f64,
        threshold: f64,
        reasoning: Option<String>,
    ) -> Result<Self, ClassifyError> {
        if !(0.0..=1.0).contains(&score) {
            return Err(ClassifyError::ScoreOutOfRange(score));
        }
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ClassifyError::ThresholdOutOfRange(threshold));
        }
        Ok(Self {
            result: score >= threshold,
            score,
            threshold,
            reasoning,
        })
    }

    pub fn result(&self) -> bool {
        self.result
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn reasoning(&self) -> Option<&str> {
        self.reasoning.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_follows_threshold() {
        assert!(ScoredClassification::new(0.5, 0.5, None).unwrap().result());
        assert!(ScoredClassification::new(0.9, 0.5, None).unwrap().result());
        assert!(!ScoredClassification::new(0.49, 0.5, None).unwrap().result());
    }

    #[test]
    fn out_of_range_score_rejected() {
        assert_eq!(
            ScoredClassification::new(1.2, 0.5, None),
            Err(ClassifyError::ScoreOutOfRange(1.2))
        );
        assert_eq!(
            ScoredClassification::new(-0.1, 0.5, None),
            Err(ClassifyError::ScoreOutOfRange(-0.1))
        );
        assert!(ScoredClassification::new(f64::NAN, 0.5, None).is_err());
    }

    #[test]
    fn out_of_range_threshold_rejected() {
        assert_eq!(
            ScoredClassification::new(0.5, 7.0, None),
            Err(ClassifyError::ThresholdOutOfRange(7.0))
        );
    }

    #[test]
    fn boundary_values_allowed() {
        assert!(ScoredClassification::new(0.0, 0.0, None).unwrap().result());
        assert!(ScoredClassification::new(1.0, 1.0, None).unwrap().result());
    }

    #[test]
    fn reasoning_survives_serialization() {
        let c = ScoredClassification::new(0.8, 0.5, Some("asks about setup docs".into()))
            .unwrap();
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["result"], true);
        assert_eq!(v["reasoning"], "asks about setup docs");
    }
}

//! Docent shared types - payloads, classification outcomes, errors.

pub mod classify;
pub mod error;
pub mod payload;

pub use classify::{ClassificationOutcome, ScoredClassification};
pub use error::{ClassifyError, EngineError};
pub use payload::{Destination, QueryRequest, QuestionBody, ResponseBody, RouteInfo};

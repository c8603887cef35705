//! Query-answering orchestration engine for community knowledge bases.
//!
//! A query runs through a gating cascade, a strategy router, a
//! generate/validate/refine loop, and lands in an append-only audit
//! record; sessions keep a sliding-window conversation memory. Remote
//! capabilities (classification, generation, validation, retrieval) sit
//! behind traits with scripted fakes for testing.

pub mod audit;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod flow;
pub mod gate;
pub mod generate;
pub mod llm;
pub mod memory;
pub mod retrieval;
pub mod router;
pub mod validate;

pub use audit::{
    AuditRecord, AuditStatus, AuditStore, AuditTrail, FailingAuditStore, InMemoryAuditStore,
    SqliteAuditStore, StepEntry,
};
pub use classifier::{Classifier, FakeClassifier, LlmClassifier};
pub use config::EngineConfig;
pub use engine::{Engine, QueryOutcome, NO_ANSWER_MESSAGE};
pub use flow::{FlowState, LoopEvent, LoopState, Routing};
pub use generate::{FakeGenerator, Generator, LlmGenerator, APOLOGY_MESSAGE};
pub use llm::{ChatModel, FakeChatModel, HttpChatModel, LlmError};
pub use memory::{InMemorySessionMemory, SessionMemory};
pub use retrieval::{
    FakeRetrievalClient, HttpRetrievalClient, RetrievalCall, RetrievalClient, RetrievalError,
    Retriever,
};
pub use router::{Router, Strategy};
pub use validate::{AnswerValidator, FakeValidator, LlmAnswerValidator};

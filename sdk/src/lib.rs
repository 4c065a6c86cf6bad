//! Ragtime SDK
//!
//! Shared record model and error taxonomy for Ragtime components.
//! This crate is used by both the engine and the HTTP transport.

/// Error types and handling
pub mod errors;

/// Experiment record model
pub mod model;

// Re-export commonly used types
pub use errors::{EngineError, RagtimeErrorExt};
pub use model::{
    Answer, Answers, Chunk, Chunks, Eval, Experiment, ExperimentMeta, Fact, Facts, Items,
    LLMAnswer, Meta, Prompt, Question, QA,
};

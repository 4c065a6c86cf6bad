//! Stage executors
//!
//! Each generator runs one stage over an [`Experiment`] in place, iterating
//! QAs in stored order. LLM and retriever failures propagate so the caller
//! decides whether the stage is fatal; a reply that cannot be parsed only
//! costs the record it belongs to.

use crate::llm::LLMError;
use crate::retriever::RetrieverError;
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::model::Experiment;

pub mod answer;
pub mod chunk_eval;
pub mod eval;
pub mod fact;

pub use answer::{AnswerGenerator, AnswerModel};
pub use chunk_eval::ChunkEvalGenerator;
pub use eval::EvalGenerator;
pub use fact::FactGenerator;

pub const ANSWER_STAGE: &str = "answer generation";
pub const FACT_STAGE: &str = "fact generation";
pub const EVAL_STAGE: &str = "answer evaluation";
pub const CHUNK_EVAL_STAGE: &str = "chunk evaluation";

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error(transparent)]
    LLM(#[from] LLMError),

    #[error(transparent)]
    Retriever(#[from] RetrieverError),
}

pub type Result<T> = std::result::Result<T, GenerateError>;

impl GenerateError {
    /// Wrap as the failure of `stage`
    pub fn in_stage(self, stage: &str) -> EngineError {
        EngineError::stage(stage, self)
    }
}

/// Per-run selection of what to (re)generate
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateOptions {
    /// Restrict the run to these model names
    pub only_llms: Option<Vec<String>>,

    /// Skip records that already carry a result
    pub missing_only: bool,
}

impl GenerateOptions {
    pub fn missing_only() -> Self {
        Self {
            only_llms: None,
            missing_only: true,
        }
    }

    /// Whether `llm_name` is in scope for this run
    pub fn targets(&self, llm_name: &str) -> bool {
        self.only_llms
            .as_ref()
            .map_or(true, |names| names.iter().any(|n| n == llm_name))
    }
}

/// One pipeline stage
#[async_trait]
pub trait Generator: Send + Sync {
    /// Stage name used in logs and errors
    fn stage(&self) -> &'static str;

    async fn generate(&self, expe: &mut Experiment, options: &GenerateOptions) -> Result<()>;
}

//! Prompters
//!
//! A prompter is the strategy that turns a QA's fields into a [`Prompt`] for
//! one stage and, for grading stages, parses the model's reply back into
//! structured results. Each stage has its own trait so a generator can only
//! be handed a prompter that fits it.

use sdk::model::{Answer, Chunk, Chunks, Eval, Fact, Facts, Prompt, Question, QA};
use serde_json::Value;

pub mod eval;
pub mod fact;

pub use eval::{ChunkEvalOutcome, EvalOutcome, FactChunkPrompter, FactEvalPrompter};
pub use fact::FactExtractionPrompter;

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("Unparseable reply: {0}")]
    Unparseable(String),

    #[error("Nothing to grade: {0}")]
    NothingToGrade(String),
}

/// Builds the answer-generation prompt
pub trait AnswerPrompter: Send + Sync {
    fn name(&self) -> &str;

    fn answer_prompt(&self, qa: &QA) -> Prompt;
}

/// Builds the fact-extraction prompt and parses the extracted facts
pub trait FactPrompter: Send + Sync {
    fn fact_prompt(&self, question: &Question, reference: &Answer) -> Prompt;

    fn parse_facts(&self, reply: &str) -> Vec<Fact>;
}

/// Grades an answer against the QA's facts
pub trait EvalPrompter: Send + Sync {
    fn eval_prompt(&self, qa: &QA, answer: &Answer) -> Prompt;

    fn parse_eval(&self, facts: &Facts, reply: &str) -> Result<EvalOutcome, PromptError>;
}

/// Grades retrieved chunks against the QA's facts
pub trait ChunkEvalPrompter: Send + Sync {
    fn chunk_eval_prompt(&self, facts: &Facts, chunks: &Chunks) -> Prompt;

    fn parse_chunk_eval(&self, facts: &Facts, reply: &str)
        -> Result<ChunkEvalOutcome, PromptError>;
}

const ANSWER_SYSTEM: &str = "You are an expert assistant. Answer the question accurately and concisely.";

const CHUNK_ANSWER_SYSTEM: &str = "You are an expert assistant. Answer the question using only the \
numbered sources below. If the sources do not contain the answer, say so.";

/// Question only
#[derive(Debug, Default, Clone)]
pub struct BaseAnswerPrompter;

impl AnswerPrompter for BaseAnswerPrompter {
    fn name(&self) -> &str {
        "base"
    }

    fn answer_prompt(&self, qa: &QA) -> Prompt {
        Prompt::new(ANSWER_SYSTEM, qa.question.text.clone())
    }
}

/// Question plus the QA's retrieved chunks as numbered sources
#[derive(Debug, Default, Clone)]
pub struct ChunkAnswerPrompter;

impl AnswerPrompter for ChunkAnswerPrompter {
    fn name(&self) -> &str {
        "with-retriever"
    }

    fn answer_prompt(&self, qa: &QA) -> Prompt {
        if qa.chunks.is_empty() {
            return BaseAnswerPrompter.answer_prompt(qa);
        }
        let sources = numbered(qa.chunks.iter().map(chunk_source));
        Prompt::new(
            format!("{}\n\n{}", CHUNK_ANSWER_SYSTEM, sources),
            qa.question.text.clone(),
        )
    }
}

fn chunk_source(chunk: &Chunk) -> String {
    match chunk.meta.get("display_name") {
        Some(Value::String(name)) if !name.is_empty() => format!("({}) {}", name, chunk.text),
        _ => chunk.text.clone(),
    }
}

/// `1. first\n2. second`
pub(crate) fn numbered<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .enumerate()
        .map(|(i, s)| format!("{}. {}", i + 1, s.as_ref().trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

impl EvalOutcome {
    /// Write the grading result into `eval`, keeping the human score
    pub fn apply(self, eval: &mut Eval) {
        eval.auto = Some(self.auto);
        let meta = &mut eval.meta;
        meta.insert("nb_ok".into(), self.ok.len().into());
        meta.insert("ok".into(), self.ok.into());
        meta.insert("nb_missing".into(), self.missing.len().into());
        meta.insert("missing".into(), self.missing.into());
        meta.insert("nb_hallu".into(), self.hallu.len().into());
        meta.insert("hallu".into(), self.hallu.into());
    }
}

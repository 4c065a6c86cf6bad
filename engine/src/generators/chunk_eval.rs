//! Chunk evaluation
//!
//! Checks which facts the retrieved context supports. An answer whose model
//! retrieved for itself is graded against its own chunks; every other answer
//! shares the grading of the QA's chunks, computed once per QA.
//!
//! Results land in `eval.meta` next to the answer grading counters:
//! `chunk_ok`/`nb_chunk_ok`, `chunk_missing`/`nb_chunk_missing`, and
//! `retrieval_missing`, the facts the answer missed that the context lacked
//! as well.

use super::{GenerateOptions, Generator, Result, CHUNK_EVAL_STAGE};
use crate::llm::LLMHandle;
use crate::prompter::{ChunkEvalOutcome, ChunkEvalPrompter};
use async_trait::async_trait;
use sdk::model::{Chunks, Eval, Experiment, Facts, LLMAnswer};
use serde_json::Value;
use std::sync::Arc;

pub struct ChunkEvalGenerator {
    llm: LLMHandle,
    prompter: Arc<dyn ChunkEvalPrompter>,
}

struct Graded {
    outcome: ChunkEvalOutcome,
    llm_answer: Option<LLMAnswer>,
}

impl ChunkEvalGenerator {
    pub fn new(llm: LLMHandle, prompter: Arc<dyn ChunkEvalPrompter>) -> Self {
        Self { llm, prompter }
    }

    /// Grade `chunks`; `Ok(None)` when the reply could not be parsed
    async fn grade(&self, facts: &Facts, chunks: &Chunks) -> Result<Option<Graded>> {
        if chunks.is_empty() {
            return Ok(Some(Graded {
                outcome: ChunkEvalOutcome {
                    found: Vec::new(),
                    not_found: facts.iter().map(|f| f.text.clone()).collect(),
                },
                llm_answer: None,
            }));
        }

        let prompt = self.prompter.chunk_eval_prompt(facts, chunks);
        let llm_answer = self.llm.complete(prompt).await?;
        match self.prompter.parse_chunk_eval(facts, &llm_answer.text) {
            Ok(outcome) => Ok(Some(Graded {
                outcome,
                llm_answer: Some(llm_answer),
            })),
            Err(e) => {
                tracing::error!("Chunk grading reply rejected: {}", e);
                Ok(None)
            }
        }
    }
}

fn apply(graded: &Graded, eval: &mut Eval) {
    let missed_by_answer = eval.list("missing");
    let retrieval_missing: Vec<String> = graded
        .outcome
        .not_found
        .iter()
        .filter(|fact| missed_by_answer.contains(fact))
        .cloned()
        .collect();

    let meta = &mut eval.meta;
    meta.insert("nb_chunk_ok".into(), graded.outcome.found.len().into());
    meta.insert("chunk_ok".into(), graded.outcome.found.clone().into());
    meta.insert(
        "nb_chunk_missing".into(),
        graded.outcome.not_found.len().into(),
    );
    meta.insert(
        "chunk_missing".into(),
        graded.outcome.not_found.clone().into(),
    );
    meta.insert("retrieval_missing".into(), retrieval_missing.into());
    if let Some(llm_answer) = &graded.llm_answer {
        if let Ok(value) = serde_json::to_value(llm_answer) {
            meta.insert("chunk_llm_answer".into(), value);
        }
    }
}

fn already_graded(eval: Option<&Eval>) -> bool {
    eval.and_then(|e| e.meta.get("nb_chunk_ok"))
        .is_some_and(|v| !matches!(v, Value::Null))
}

#[async_trait]
impl Generator for ChunkEvalGenerator {
    fn stage(&self) -> &'static str {
        CHUNK_EVAL_STAGE
    }

    async fn generate(&self, expe: &mut Experiment, options: &GenerateOptions) -> Result<()> {
        tracing::info!(
            "Evaluating chunks of {} question(s) with {}",
            expe.len(),
            self.llm.name()
        );

        let total = expe.len();
        for (index, qa) in expe.items.iter_mut().enumerate() {
            if qa.facts.is_empty() {
                tracing::warn!("QA {}/{}: no facts, chunks left ungraded", index + 1, total);
                continue;
            }

            let mut shared: Option<Option<Graded>> = None;
            for i in 0..qa.answers.len() {
                let answer = &qa.answers[i];
                if !options.targets(answer.llm_name().unwrap_or_default()) {
                    continue;
                }
                if options.missing_only && already_graded(answer.eval.as_ref()) {
                    continue;
                }

                let graded = match answer.own_chunks() {
                    Some(own) => self.grade(&qa.facts, own).await?,
                    None => {
                        if shared.is_none() {
                            shared = Some(self.grade(&qa.facts, &qa.chunks).await?);
                        }
                        None
                    }
                };

                let graded = graded.as_ref().or_else(|| shared.as_ref().and_then(Option::as_ref));
                match graded {
                    Some(graded) => apply(graded, qa.answers[i].eval_mut()),
                    None => tracing::error!(
                        "QA {}/{} answer {}: chunks left ungraded",
                        index + 1,
                        total,
                        i + 1
                    ),
                }
            }
        }

        tracing::info!("Chunk evaluation finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{handle, ScriptedProvider};
    use crate::prompter::FactChunkPrompter;
    use sdk::model::{Answer, Chunk, Fact, Question, QA};
    use serde_json::json;

    fn generator(provider: Arc<ScriptedProvider>) -> ChunkEvalGenerator {
        ChunkEvalGenerator::new(handle(provider), Arc::new(FactChunkPrompter))
    }

    fn answer(name: &str, own_chunks: Option<Vec<Chunk>>) -> Answer {
        Answer::from_llm(LLMAnswer {
            name: name.into(),
            chunks: own_chunks.map(Chunks::new),
            ..Default::default()
        })
    }

    fn qa() -> QA {
        let mut qa = QA::new(Question::new("Q1"));
        qa.facts = vec![Fact::new("F1"), Fact::new("F2")].into();
        qa.chunks.push(Chunk::new("C1"));
        qa
    }

    #[tokio::test]
    async fn test_shared_chunks_graded_once() {
        let provider = Arc::new(ScriptedProvider::answering("judge", "1: OK\n2: MISSING"));
        let mut item = qa();
        item.answers.push(answer("modelA", None));
        item.answers.push(answer("modelB", None));
        let mut expe = Experiment::new(vec![item]);
        expe.init_eval_counters();
        expe.items[0].answers[0]
            .eval_mut()
            .meta
            .insert("missing".into(), json!(["F2"]));

        generator(provider.clone())
            .generate(&mut expe, &GenerateOptions::default())
            .await
            .unwrap();

        assert_eq!(provider.calls(), 1);
        let first = &expe.items[0].answers[0].eval.as_ref().unwrap().meta;
        assert_eq!(first["chunk_ok"], json!(["F1"]));
        assert_eq!(first["nb_chunk_missing"], 1);
        assert_eq!(first["retrieval_missing"], json!(["F2"]));
        let second = &expe.items[0].answers[1].eval.as_ref().unwrap().meta;
        assert_eq!(second["nb_chunk_ok"], 1);
        assert_eq!(second["retrieval_missing"], json!([]));
    }

    #[tokio::test]
    async fn test_own_chunks_graded_separately() {
        let provider = Arc::new(ScriptedProvider::answering("judge", "1: OK\n2: OK"));
        let mut item = qa();
        item.answers.push(answer("Albert_LLM", Some(vec![Chunk::new("own")])));
        let mut expe = Experiment::new(vec![item]);

        generator(provider.clone())
            .generate(&mut expe, &GenerateOptions::default())
            .await
            .unwrap();

        assert!(provider.prompts.lock().unwrap()[0].user().contains("1. own"));
        let meta = &expe.items[0].answers[0].eval.as_ref().unwrap().meta;
        assert_eq!(meta["nb_chunk_ok"], 2);
    }

    #[tokio::test]
    async fn test_no_chunks_means_every_fact_missing_without_llm_call() {
        let provider = Arc::new(ScriptedProvider::answering("judge", "1: OK"));
        let mut item = qa();
        item.chunks.clear();
        item.answers.push(answer("modelA", None));
        let mut expe = Experiment::new(vec![item]);

        generator(provider.clone())
            .generate(&mut expe, &GenerateOptions::default())
            .await
            .unwrap();

        assert_eq!(provider.calls(), 0);
        let meta = &expe.items[0].answers[0].eval.as_ref().unwrap().meta;
        assert_eq!(meta["chunk_missing"], json!(["F1", "F2"]));
    }

    #[tokio::test]
    async fn test_missing_only_skips_graded_answers() {
        let provider = Arc::new(ScriptedProvider::answering("judge", "1: OK"));
        let mut item = qa();
        item.answers.push(answer("modelA", None));
        item.answers[0]
            .eval_mut()
            .meta
            .insert("nb_chunk_ok".into(), json!(2));
        let mut expe = Experiment::new(vec![item]);

        generator(provider.clone())
            .generate(&mut expe, &GenerateOptions::missing_only())
            .await
            .unwrap();

        assert_eq!(provider.calls(), 0);
    }
}

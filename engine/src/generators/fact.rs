//! Fact generation
//!
//! Facts are extracted from a reference answer: the answer with the highest
//! human score, or the first answer when none is scored.

use super::{GenerateOptions, Generator, Result, FACT_STAGE};
use crate::llm::LLMHandle;
use crate::prompter::FactPrompter;
use async_trait::async_trait;
use sdk::model::{Answer, Experiment, QA};
use std::sync::Arc;

pub struct FactGenerator {
    llm: LLMHandle,
    prompter: Arc<dyn FactPrompter>,
}

impl FactGenerator {
    pub fn new(llm: LLMHandle, prompter: Arc<dyn FactPrompter>) -> Self {
        Self { llm, prompter }
    }
}

/// Highest human score wins; ties keep the earliest answer
fn reference_answer(qa: &QA) -> Option<&Answer> {
    let mut best: Option<(&Answer, f64)> = None;
    for answer in qa.answers.iter() {
        if let Some(score) = answer.eval.as_ref().and_then(|e| e.human) {
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((answer, score));
            }
        }
    }
    best.map(|(a, _)| a).or_else(|| qa.answers.first())
}

#[async_trait]
impl Generator for FactGenerator {
    fn stage(&self) -> &'static str {
        FACT_STAGE
    }

    async fn generate(&self, expe: &mut Experiment, options: &GenerateOptions) -> Result<()> {
        tracing::info!(
            "Generating facts for {} question(s) with {}",
            expe.len(),
            self.llm.name()
        );

        let total = expe.len();
        for (index, qa) in expe.items.iter_mut().enumerate() {
            if options.missing_only && !qa.facts.is_empty() {
                tracing::debug!("QA {}/{}: facts already present", index + 1, total);
                continue;
            }
            let Some(reference) = reference_answer(qa) else {
                tracing::warn!("QA {}/{}: no answer to extract facts from", index + 1, total);
                continue;
            };

            let prompt = self.prompter.fact_prompt(&qa.question, reference);
            let llm_answer = self.llm.complete(prompt).await?;
            let mut facts = self.prompter.parse_facts(&llm_answer.text);
            if facts.is_empty() {
                tracing::error!("QA {}/{}: no facts in reply", index + 1, total);
                continue;
            }
            for fact in &mut facts {
                fact.llm_answer = Some(llm_answer.clone());
            }

            tracing::debug!("QA {}/{}: {} fact(s)", index + 1, total, facts.len());
            qa.facts = facts.into();
        }

        tracing::info!("Fact generation finished");
        Ok(())
    }
}

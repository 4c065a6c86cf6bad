//! Answer generation

use super::{GenerateOptions, Generator, Result, ANSWER_STAGE};
use crate::llm::LLMHandle;
use crate::prompter::{AnswerPrompter, BaseAnswerPrompter, ChunkAnswerPrompter};
use crate::retriever::Retriever;
use async_trait::async_trait;
use sdk::model::{Answer, Experiment};
use std::sync::Arc;

/// A model under test and the prompter that feeds it
#[derive(Clone)]
pub struct AnswerModel {
    pub handle: LLMHandle,
    pub prompter: Arc<dyn AnswerPrompter>,
}

impl AnswerModel {
    pub fn new(handle: LLMHandle, prompter: Arc<dyn AnswerPrompter>) -> Self {
        Self { handle, prompter }
    }

    /// Pick the prompter for `handle`: models that retrieve for themselves
    /// get the question alone, others see the chunks when a retriever runs
    pub fn for_handle(handle: LLMHandle, use_retriever: bool) -> Self {
        let prompter: Arc<dyn AnswerPrompter> = if handle.built_in_retriever() || !use_retriever {
            Arc::new(BaseAnswerPrompter)
        } else {
            Arc::new(ChunkAnswerPrompter)
        };
        Self::new(handle, prompter)
    }
}

pub struct AnswerGenerator {
    models: Vec<AnswerModel>,
    retriever: Option<Arc<dyn Retriever>>,
}

impl AnswerGenerator {
    pub fn new(models: Vec<AnswerModel>, retriever: Option<Arc<dyn Retriever>>) -> Self {
        Self { models, retriever }
    }
}

#[async_trait]
impl Generator for AnswerGenerator {
    fn stage(&self) -> &'static str {
        ANSWER_STAGE
    }

    async fn generate(&self, expe: &mut Experiment, options: &GenerateOptions) -> Result<()> {
        tracing::info!(
            "Generating answers for {} question(s) with {} model(s)",
            expe.len(),
            self.models.len()
        );

        let total = expe.len();
        for (index, qa) in expe.items.iter_mut().enumerate() {
            let pending: Vec<&AnswerModel> = self
                .models
                .iter()
                .filter(|m| options.targets(m.handle.name()))
                .filter(|m| !(options.missing_only && qa.has_answer_from(m.handle.name())))
                .collect();

            if pending.is_empty() {
                tracing::debug!("QA {}/{}: nothing to generate", index + 1, total);
                continue;
            }

            if let Some(retriever) = &self.retriever {
                retriever.retrieve(qa).await?;
                tracing::debug!(
                    "QA {}/{}: {} retrieved {} chunk(s)",
                    index + 1,
                    total,
                    retriever.name(),
                    qa.chunks.len()
                );
            }

            for model in pending {
                let prompt = model.prompter.answer_prompt(qa);
                let llm_answer = model.handle.complete(prompt).await?;
                tracing::debug!(
                    "QA {}/{}: {} answered in {:.2}s",
                    index + 1,
                    total,
                    llm_answer.name,
                    llm_answer.duration
                );

                let answer = Answer::from_llm(llm_answer);
                match qa.answer_index(model.handle.name()) {
                    Some(i) => qa.answers[i] = answer,
                    None => qa.answers.push(answer),
                }
            }
        }

        tracing::info!("Answer generation finished");
        Ok(())
    }
}

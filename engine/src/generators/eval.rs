//! Answer evaluation

use super::{GenerateOptions, Generator, Result, EVAL_STAGE};
use crate::llm::LLMHandle;
use crate::prompter::EvalPrompter;
use async_trait::async_trait;
use sdk::model::Experiment;
use std::sync::Arc;

/// Grades every answer against its QA's facts with one evaluator model
pub struct EvalGenerator {
    llm: LLMHandle,
    prompter: Arc<dyn EvalPrompter>,
}

impl EvalGenerator {
    pub fn new(llm: LLMHandle, prompter: Arc<dyn EvalPrompter>) -> Self {
        Self { llm, prompter }
    }
}

#[async_trait]
impl Generator for EvalGenerator {
    fn stage(&self) -> &'static str {
        EVAL_STAGE
    }

    async fn generate(&self, expe: &mut Experiment, options: &GenerateOptions) -> Result<()> {
        tracing::info!(
            "Evaluating answers of {} question(s) with {}",
            expe.len(),
            self.llm.name()
        );

        let total = expe.len();
        let mut graded = 0usize;
        for (index, qa) in expe.items.iter_mut().enumerate() {
            if qa.facts.is_empty() {
                if !qa.answers.is_empty() {
                    tracing::warn!("QA {}/{}: no facts, answers left ungraded", index + 1, total);
                }
                continue;
            }

            for i in 0..qa.answers.len() {
                let answer = &qa.answers[i];
                if !options.targets(answer.llm_name().unwrap_or_default()) {
                    continue;
                }
                if options.missing_only && answer.eval.as_ref().is_some_and(|e| e.auto.is_some()) {
                    continue;
                }

                let prompt = self.prompter.eval_prompt(qa, answer);
                let llm_answer = self.llm.complete(prompt).await?;
                let parsed = self.prompter.parse_eval(&qa.facts, &llm_answer.text);

                let eval = qa.answers[i].eval_mut();
                eval.llm_answer = Some(llm_answer);
                match parsed {
                    Ok(outcome) => {
                        outcome.apply(eval);
                        graded += 1;
                    }
                    Err(e) => {
                        tracing::error!("QA {}/{} answer {}: {}", index + 1, total, i + 1, e)
                    }
                }
            }
        }

        tracing::info!("Answer evaluation finished: {} answer(s) graded", graded);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{handle, ScriptedProvider};
    use crate::llm::Completion;
    use crate::prompter::FactEvalPrompter;
    use sdk::model::{Answer, Eval, Fact, LLMAnswer, Question, QA};

    fn qa(facts: &[&str], answers: &[&str]) -> QA {
        let mut qa = QA::new(Question::new("Q"));
        for fact in facts {
            qa.facts.push(Fact::new(*fact));
        }
        for name in answers {
            qa.answers.push(Answer::from_llm(LLMAnswer {
                name: name.to_string(),
                text: format!("answer from {}", name),
                ..Default::default()
            }));
        }
        qa
    }

    fn generator(provider: Arc<ScriptedProvider>) -> EvalGenerator {
        EvalGenerator::new(handle(provider), Arc::new(FactEvalPrompter))
    }

    #[tokio::test]
    async fn test_eval_fills_auto_and_counters() {
        let provider = Arc::new(ScriptedProvider::answering("judge", "1: OK\n2: MISSING"));
        let mut expe = Experiment::new(vec![qa(&["F1", "F2"], &["modelA"])]);

        generator(provider)
            .generate(&mut expe, &GenerateOptions::default())
            .await
            .unwrap();

        let eval = expe.items[0].answers[0].eval.as_ref().unwrap();
        assert_eq!(eval.human, None);
        assert_eq!(eval.auto, Some(0.5));
        assert!(eval.has_counters());
        assert_eq!(eval.llm_answer.as_ref().unwrap().name, "judge");
    }

    #[tokio::test]
    async fn test_unparseable_reply_skips_only_that_answer() {
        let provider = Arc::new(
            ScriptedProvider::answering("judge", "1: OK")
                .with_script(vec![Ok(Completion::text("I cannot grade this."))]),
        );
        let mut expe = Experiment::new(vec![qa(&["F1"], &["modelA", "modelB"])]);

        generator(provider)
            .generate(&mut expe, &GenerateOptions::default())
            .await
            .unwrap();

        let answers = &expe.items[0].answers;
        assert_eq!(answers[0].eval.as_ref().unwrap().auto, None);
        assert_eq!(answers[1].eval.as_ref().unwrap().auto, Some(1.0));
    }

    #[tokio::test]
    async fn test_qa_without_facts_is_skipped() {
        let provider = Arc::new(ScriptedProvider::answering("judge", "1: OK"));
        let mut expe = Experiment::new(vec![qa(&[], &["modelA"])]);

        generator(provider.clone())
            .generate(&mut expe, &GenerateOptions::default())
            .await
            .unwrap();

        assert_eq!(provider.calls(), 0);
        assert!(expe.items[0].answers[0].eval.is_none());
    }

    #[tokio::test]
    async fn test_missing_only_keeps_graded_answers_and_human_scores() {
        let provider = Arc::new(ScriptedProvider::answering("judge", "1: MISSING"));
        let mut item = qa(&["F1"], &["modelA", "modelB"]);
        item.answers[0].eval = Some(Eval {
            human: Some(1.0),
            auto: Some(1.0),
            ..Default::default()
        });
        item.answers[1].eval = Some(Eval {
            human: Some(0.0),
            ..Default::default()
        });
        let mut expe = Experiment::new(vec![item]);

        generator(provider.clone())
            .generate(&mut expe, &GenerateOptions::missing_only())
            .await
            .unwrap();

        let answers = &expe.items[0].answers;
        assert_eq!(provider.calls(), 1);
        assert_eq!(answers[0].eval.as_ref().unwrap().auto, Some(1.0));
        let second = answers[1].eval.as_ref().unwrap();
        assert_eq!(second.human, Some(0.0));
        assert_eq!(second.auto, Some(0.0));
    }
}

//! Experiment pipeline
//!
//! [`Orchestrator::run`] turns an experiment configuration into a persisted
//! experiment document:
//!
//! 1. reserve the experiment name (fails on duplicates, writes nothing)
//! 2. build the QAs from the embedded or stored validation set
//! 3. answer generation, unless the items already carry answers (`withCSV`)
//! 4. answer evaluation, when requested
//! 5. chunk evaluation, when requested, after initialising the eval counters
//!
//! The document is saved after every stage that ran. An answer-generation
//! failure aborts the run before anything is written. Evaluation failures are
//! recorded, the remaining stages still run, the document is saved, and the
//! first failure is returned.

use crate::config::Config;
use crate::generators::{
    AnswerGenerator, AnswerModel, ChunkEvalGenerator, EvalGenerator, FactGenerator,
    GenerateOptions, Generator, ANSWER_STAGE, CHUNK_EVAL_STAGE, EVAL_STAGE, FACT_STAGE,
};
use crate::llm::{LLMError, LLMHandle, LLMRegistry};
use crate::prompter::{FactChunkPrompter, FactEvalPrompter, FactExtractionPrompter};
use crate::retriever::{Retriever, RetrieverRegistry};
use crate::secrets::CredentialStore;
use crate::store::{ExperimentStore, FileExperimentStore, ValidationSetStore};
use sdk::errors::EngineError;
use sdk::model::{Experiment, QA};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

pub mod steps;

type Result<T> = std::result::Result<T, EngineError>;

/// Retriever label recorded when answers are generated without retrieval
pub const NO_RETRIEVER: &str = "No retriever";

/// Retriever label recorded when no retriever type was requested
pub const RETRIEVER_NOT_USED: &str = "Not used";

/// Model used by the single-shot generation endpoints when none is given
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Declarative experiment configuration, as posted by the UI
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub validation_set: String,

    /// Grader model; the first answer model when absent
    #[serde(default)]
    pub evaluation_model: Option<String>,

    #[serde(default)]
    pub answer_generation_models: Vec<String>,

    #[serde(default = "default_true")]
    pub evaluate_answers: bool,

    #[serde(default)]
    pub evaluate_chunks: bool,

    #[serde(default)]
    pub use_retriever: bool,

    #[serde(default)]
    pub retriever_type: Option<String>,

    /// Validation-set document embedded in the request
    #[serde(default)]
    pub validation_set_data: Option<Value>,

    /// Items already carry their answers
    #[serde(default, rename = "withCSV")]
    pub with_csv: bool,
}

fn default_true() -> bool {
    true
}

impl ExperimentConfig {
    /// Parse and check required fields
    pub fn from_json(value: Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value)
            .map_err(|e| EngineError::Config(format!("invalid experiment configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Config("Missing required field: name".to_string()));
        }
        if self.validation_set.trim().is_empty() {
            return Err(EngineError::Config(
                "Missing required field: validationSet".to_string(),
            ));
        }
        if self.answer_generation_models.iter().all(|m| m.trim().is_empty()) {
            return Err(EngineError::Config(
                "Missing required field: answerGenerationModels".to_string(),
            ));
        }
        Ok(())
    }

    /// Grader model name
    pub fn evaluation_model(&self) -> &str {
        match self.evaluation_model.as_deref().map(str::trim) {
            Some(model) if !model.is_empty() => model,
            _ => self
                .answer_generation_models
                .first()
                .map(String::as_str)
                .unwrap_or_default(),
        }
    }
}

/// QAs from validation-set items, in source order
pub fn items_to_qas(items: Vec<Value>) -> Result<Vec<QA>> {
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            serde_json::from_value(item)
                .map_err(|e| EngineError::Config(format!("item {}: {}", i + 1, e)))
        })
        .collect()
}

fn unknown_model(e: LLMError) -> EngineError {
    match e {
        LLMError::UnknownModel(name) => EngineError::Config(format!("unknown model '{}'", name)),
        other => EngineError::LLMProvider(other.to_string()),
    }
}

pub struct Orchestrator {
    store: Arc<dyn ExperimentStore>,
    validation_sets: ValidationSetStore,
    llms: Arc<LLMRegistry>,
    retrievers: Arc<RetrieverRegistry>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ExperimentStore>,
        validation_sets: ValidationSetStore,
        llms: Arc<LLMRegistry>,
        retrievers: Arc<RetrieverRegistry>,
    ) -> Self {
        Self {
            store,
            validation_sets,
            llms,
            retrievers,
        }
    }

    /// File stores and registries from `config`
    pub fn with_defaults(config: &Config, credentials: Arc<CredentialStore>) -> Self {
        Self::new(
            Arc::new(FileExperimentStore::new(&config.storage.experiments_dir)),
            ValidationSetStore::new(&config.storage.validation_sets_dir),
            Arc::new(LLMRegistry::with_defaults(config, credentials.clone())),
            Arc::new(RetrieverRegistry::with_defaults(config, credentials)),
        )
    }

    pub fn llms(&self) -> &LLMRegistry {
        &self.llms
    }

    pub fn retrievers(&self) -> &RetrieverRegistry {
        &self.retrievers
    }

    fn resolve(&self, name: &str) -> Result<LLMHandle> {
        self.llms.resolve(name).map_err(unknown_model)
    }

    /// The retriever to run, if any; an unknown type only disables retrieval
    fn retriever(&self, use_retriever: bool, kind: Option<&str>) -> Option<Arc<dyn Retriever>> {
        let kind = kind.filter(|k| use_retriever && !k.trim().is_empty())?;
        match self.retrievers.resolve(kind) {
            Ok(retriever) => Some(retriever),
            Err(e) => {
                tracing::warn!("{}; answers are generated without retrieval", e);
                None
            }
        }
    }

    async fn initial_items(&self, config: &ExperimentConfig) -> Result<Vec<QA>> {
        let items = match &config.validation_set_data {
            Some(data) => match data.get("items") {
                Some(Value::Array(items)) => items.clone(),
                _ => {
                    return Err(EngineError::Config(
                        "validationSetData must contain items".to_string(),
                    ))
                }
            },
            None => self.validation_sets.load_items(&config.validation_set).await?,
        };
        items_to_qas(items)
    }

    /// Run the configured stages and persist the experiment
    pub async fn run(&self, config: &ExperimentConfig) -> Result<PathBuf> {
        config.validate()?;
        let name = config.name.trim();
        tracing::info!("Starting experiment {}", name);

        let reservation = self.store.reserve(name).await?;

        let mut expe = Experiment::new(self.initial_items(config).await?);
        let models: Vec<String> = config
            .answer_generation_models
            .iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();

        let evaluation_model = config.evaluation_model().to_string();
        if config.evaluation_model.is_none() && (config.evaluate_answers || config.evaluate_chunks) {
            tracing::info!("No evaluation model given, grading with {}", evaluation_model);
        }

        // Resolve every model before spending anything on a stage
        let answer_handles = if config.with_csv {
            Vec::new()
        } else {
            models
                .iter()
                .map(|m| self.resolve(m))
                .collect::<Result<Vec<_>>>()?
        };
        let evaluator = if config.evaluate_answers || config.evaluate_chunks {
            Some(self.resolve(&evaluation_model)?)
        } else {
            None
        };

        expe.meta.validation_set = Some(config.validation_set.clone());
        expe.meta.retriever_name = Some(
            config
                .retriever_type
                .clone()
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| RETRIEVER_NOT_USED.to_string()),
        );
        expe.meta
            .extra
            .insert("evaluation_model".into(), evaluation_model.clone().into());
        // Items that carry their answers record the models that wrote them
        let recorded_models = if config.with_csv {
            expe.model_names()
        } else {
            models.clone()
        };
        expe.meta.extra.insert("models".into(), recorded_models.into());

        if !config.with_csv {
            let mut use_retriever = config.use_retriever;
            if let Some(built_in) = answer_handles.iter().find(|h| h.built_in_retriever()) {
                use_retriever = true;
                expe.meta.retriever_name = Some(format!("{} (built-in retriever)", built_in.name()));
            } else if !use_retriever {
                expe.meta.retriever_name = Some(NO_RETRIEVER.to_string());
            }

            let generator = AnswerGenerator::new(
                answer_handles
                    .into_iter()
                    .map(|h| AnswerModel::for_handle(h, use_retriever))
                    .collect(),
                self.retriever(use_retriever, config.retriever_type.as_deref()),
            );
            generator
                .generate(&mut expe, &GenerateOptions::missing_only())
                .await
                .map_err(|e| {
                    tracing::error!("Experiment {}: {} failed: {}", name, ANSWER_STAGE, e);
                    e.in_stage(ANSWER_STAGE)
                })?;
        } else {
            tracing::info!("Items carry their answers, skipping {}", ANSWER_STAGE);
        }
        let mut path = self.store.save(name, &expe).await?;

        let mut failure: Option<EngineError> = None;
        if let Some(evaluator) = evaluator {
            if config.evaluate_answers {
                let generator = EvalGenerator::new(evaluator.clone(), Arc::new(FactEvalPrompter));
                if let Err(e) = generator.generate(&mut expe, &GenerateOptions::default()).await {
                    tracing::error!("Experiment {}: {} failed: {}", name, EVAL_STAGE, e);
                    failure.get_or_insert(e.in_stage(EVAL_STAGE));
                }
                path = self.store.save(name, &expe).await?;
            }

            if config.evaluate_chunks {
                expe.init_eval_counters();
                let generator = ChunkEvalGenerator::new(evaluator, Arc::new(FactChunkPrompter));
                if let Err(e) = generator.generate(&mut expe, &GenerateOptions::default()).await {
                    tracing::error!("Experiment {}: {} failed: {}", name, CHUNK_EVAL_STAGE, e);
                    failure.get_or_insert(e.in_stage(CHUNK_EVAL_STAGE));
                }
                path = self.store.save(name, &expe).await?;
            }
        }

        drop(reservation);
        match failure {
            Some(e) => Err(e),
            None => {
                tracing::info!("Experiment {} saved to {}", name, path.display());
                Ok(path)
            }
        }
    }

    /// Answer `items` with one model, outside any stored experiment
    pub async fn generate_answers(
        &self,
        items: Vec<QA>,
        model: &str,
        use_retriever: bool,
        retriever_type: Option<&str>,
    ) -> Result<Experiment> {
        let handle = self.resolve(model)?;
        let use_retriever = use_retriever || handle.built_in_retriever();
        let generator = AnswerGenerator::new(
            vec![AnswerModel::for_handle(handle, use_retriever)],
            self.retriever(use_retriever, retriever_type),
        );
        let mut expe = Experiment::new(items);
        generator
            .generate(&mut expe, &GenerateOptions::default())
            .await
            .map_err(|e| e.in_stage(ANSWER_STAGE))?;
        Ok(expe)
    }

    /// Extract facts for `items` from their reference answers
    pub async fn generate_facts(&self, items: Vec<QA>, model: &str) -> Result<Experiment> {
        let generator = FactGenerator::new(self.resolve(model)?, Arc::new(FactExtractionPrompter));
        let mut expe = Experiment::new(items);
        generator
            .generate(&mut expe, &GenerateOptions::default())
            .await
            .map_err(|e| e.in_stage(FACT_STAGE))?;
        Ok(expe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_parses_camel_case_with_defaults() {
        let config = ExperimentConfig::from_json(json!({
            "name": "T1",
            "validationSet": "V1",
            "answerGenerationModels": ["modelA"],
            "withCSV": true
        }))
        .unwrap();

        assert!(config.evaluate_answers);
        assert!(!config.evaluate_chunks);
        assert!(config.with_csv);
        assert_eq!(config.evaluation_model(), "modelA");
    }

    #[test]
    fn test_missing_required_fields_are_config_errors() {
        for body in [
            json!({"validationSet": "V1", "answerGenerationModels": ["m"]}),
            json!({"name": "T1", "answerGenerationModels": ["m"]}),
            json!({"name": "T1", "validationSet": "V1", "answerGenerationModels": []}),
            json!({"name": "T1", "validationSet": "V1", "answerGenerationModels": "m"}),
        ] {
            assert!(matches!(
                ExperimentConfig::from_json(body),
                Err(EngineError::Config(_))
            ));
        }
    }

    #[test]
    fn test_explicit_evaluation_model_wins() {
        let config = ExperimentConfig {
            evaluation_model: Some("judge".into()),
            answer_generation_models: vec!["modelA".into()],
            ..Default::default()
        };
        assert_eq!(config.evaluation_model(), "judge");
    }

    #[test]
    fn test_items_keep_source_order() {
        let qas = items_to_qas(vec![
            json!({"question": {"text": "Q1"}}),
            json!({"question": {"text": "Q2"}, "facts": {"items": [{"text": "F"}]}}),
        ])
        .unwrap();
        assert_eq!(qas[0].question.text, "Q1");
        assert_eq!(qas[1].facts.len(), 1);
    }
}

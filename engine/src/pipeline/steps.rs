//! File-based pipeline runner
//!
//! Runs the fixed step sequence `answers -> facts -> evals` over one
//! experiment file. Each step reads the previous step's output, runs its
//! generator, and writes the result under its own output folder with the same
//! file name. Steps absent from the configuration are skipped.
//!
//! ```toml
//! folder_name = "expe/validation_sets"
//! file_name = "V1.json"
//! retriever = "Search"
//!
//! [generate.answers]
//! llms = ["gpt-4o", "mistral-large-latest"]
//! missing_only = true
//!
//! [generate.evals]
//! llms = ["gpt-4o"]
//! output_folder = "expe/evals"
//! ```

use super::Result;
use crate::config::StorageConfig;
use crate::generators::{
    AnswerGenerator, AnswerModel, EvalGenerator, FactGenerator, GenerateOptions, Generator,
};
use crate::llm::LLMRegistry;
use crate::prompter::{FactEvalPrompter, FactExtractionPrompter};
use crate::retriever::RetrieverRegistry;
use crate::store::{read_json, write_json};
use sdk::errors::EngineError;
use sdk::model::Experiment;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum Step {
    Answers,
    Facts,
    Evals,
}

impl Step {
    pub const ALL: [Step; 3] = [Step::Answers, Step::Facts, Step::Evals];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Answers => "answers",
            Step::Facts => "facts",
            Step::Evals => "evals",
        }
    }

    fn default_output(&self, storage: &StorageConfig) -> PathBuf {
        match self {
            Step::Answers => storage.answers_dir.clone(),
            Step::Facts => storage.facts_dir.clone(),
            Step::Evals => storage.experiments_dir.clone(),
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepConfig {
    #[serde(default)]
    pub llms: Vec<String>,

    #[serde(default)]
    pub only_llms: Option<Vec<String>>,

    #[serde(default)]
    pub missing_only: bool,

    #[serde(default)]
    pub output_folder: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateSteps {
    pub answers: Option<StepConfig>,
    pub facts: Option<StepConfig>,
    pub evals: Option<StepConfig>,
}

impl GenerateSteps {
    fn get(&self, step: Step) -> Option<&StepConfig> {
        match step {
            Step::Answers => self.answers.as_ref(),
            Step::Facts => self.facts.as_ref(),
            Step::Evals => self.evals.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Folder of the starting file
    pub folder_name: PathBuf,

    /// Starting file, also the name of every step's output
    pub file_name: String,

    /// Retriever used by the answers step
    #[serde(default)]
    pub retriever: Option<String>,

    #[serde(default)]
    pub generate: GenerateSteps,
}

impl PipelineConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("invalid pipeline file: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| EngineError::storage(path, e))?;
        Self::from_toml_str(&contents)
    }
}

/// Registries and default folders the runner works with
pub struct PipelineContext {
    pub llms: Arc<LLMRegistry>,
    pub retrievers: Arc<RetrieverRegistry>,
    pub storage: StorageConfig,
}

/// Steps from `start_from` through `stop_after`, inclusive
pub fn step_range(start_from: Option<Step>, stop_after: Option<Step>) -> Vec<Step> {
    let first = start_from.unwrap_or(Step::Answers);
    let last = stop_after.unwrap_or(Step::Evals).max(first);
    Step::ALL
        .into_iter()
        .filter(|s| *s >= first && *s <= last)
        .collect()
}

fn generator_for(
    ctx: &PipelineContext,
    config: &PipelineConfig,
    step: Step,
    llms: &[String],
) -> Result<Box<dyn Generator>> {
    let handles = ctx
        .llms
        .resolve_all(llms)
        .map_err(|e| EngineError::Config(format!("step {}: {}", step, e)))?;

    if step != Step::Answers && handles.len() > 1 {
        tracing::warn!("Step {} uses only its first LLM, {}", step, handles[0].name());
    }

    let generator: Box<dyn Generator> = match step {
        Step::Answers => {
            let retriever = match &config.retriever {
                Some(name) => Some(
                    ctx.retrievers
                        .resolve(name)
                        .map_err(|e| EngineError::Config(e.to_string()))?,
                ),
                None => None,
            };
            let use_retriever = retriever.is_some();
            Box::new(AnswerGenerator::new(
                handles
                    .into_iter()
                    .map(|h| AnswerModel::for_handle(h, use_retriever))
                    .collect(),
                retriever,
            ))
        }
        Step::Facts => Box::new(FactGenerator::new(
            handles.into_iter().next().ok_or_else(|| missing_llms(step))?,
            Arc::new(FactExtractionPrompter),
        )),
        Step::Evals => Box::new(EvalGenerator::new(
            handles.into_iter().next().ok_or_else(|| missing_llms(step))?,
            Arc::new(FactEvalPrompter),
        )),
    };
    Ok(generator)
}

fn missing_llms(step: Step) -> EngineError {
    EngineError::Config(format!("step {} needs a list of LLMs", step))
}

/// Run the configured steps; returns the path of the last file written
pub async fn run_pipeline(
    ctx: &PipelineContext,
    config: &PipelineConfig,
    start_from: Option<Step>,
    stop_after: Option<Step>,
) -> Result<PathBuf> {
    if config.file_name.trim().is_empty() {
        return Err(EngineError::Config(
            "pipeline needs a starting file name".to_string(),
        ));
    }

    let mut input = config.folder_name.join(&config.file_name);
    for step in step_range(start_from, stop_after) {
        let Some(step_config) = config.generate.get(step) else {
            tracing::debug!("Step {} not configured", step);
            continue;
        };
        if step_config.llms.is_empty() {
            return Err(missing_llms(step));
        }

        let generator = generator_for(ctx, config, step, &step_config.llms)?;
        let document = read_json(&input).await?;
        let mut expe: Experiment =
            serde_json::from_value(document).map_err(|e| EngineError::storage(&input, e))?;

        tracing::info!("Step {}: {} question(s) from {}", step, expe.len(), input.display());
        let options = GenerateOptions {
            only_llms: step_config.only_llms.clone(),
            missing_only: step_config.missing_only,
        };
        generator
            .generate(&mut expe, &options)
            .await
            .map_err(|e| e.in_stage(generator.stage()))?;

        let output_dir = step_config
            .output_folder
            .clone()
            .unwrap_or_else(|| step.default_output(&ctx.storage));
        let output = output_dir.join(&config.file_name);
        write_json(&output, &expe).await?;
        tracing::info!("Step {} written to {}", step, output.display());
        input = output;
    }
    Ok(input)
}

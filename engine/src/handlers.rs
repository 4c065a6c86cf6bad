//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - run: run one experiment from a configuration file
//! - pipeline: run the answers/facts/evals file pipeline
//! - experiments / validation-sets: list, show and delete stored documents
//! - stats: statistics of a result file
//! - keys: manage API keys stored in the database
//! - models: list the available models and retrievers

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::db::Database;
use crate::llm::LLMRegistry;
use crate::pipeline::steps::{run_pipeline, PipelineConfig, PipelineContext, Step};
use crate::pipeline::{ExperimentConfig, Orchestrator};
use crate::retriever::RetrieverRegistry;
use crate::secrets::CredentialStore;
use crate::stats::stats;
use crate::store::{ExperimentStore, FileExperimentStore, ValidationSetStore};

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Open the key database and load its snapshot
pub async fn open_credentials(config: &Config) -> Result<Arc<CredentialStore>> {
    let database = Database::new(&config.database_path())
        .await
        .context("Failed to open database")?;
    let credentials = CredentialStore::new(database.api_keys());
    credentials
        .refresh()
        .await
        .context("Failed to load stored API keys")?;
    Ok(Arc::new(credentials))
}

/// Run one experiment described by a JSON file
pub async fn handle_run(config_file: &Path, config: &Config, format: OutputFormat) -> Result<()> {
    let contents = tokio::fs::read_to_string(config_file)
        .await
        .with_context(|| format!("Failed to read {}", config_file.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("Invalid JSON in {}", config_file.display()))?;
    let expe_config = ExperimentConfig::from_json(value)?;

    let credentials = open_credentials(config).await?;
    let orchestrator = Orchestrator::with_defaults(config, credentials);
    let results_path = orchestrator.run(&expe_config).await?;

    match format {
        OutputFormat::Text => {
            println!("Experiment '{}' completed", expe_config.name.trim());
            println!("  Results: {}", results_path.display());
        }
        OutputFormat::Json => print_json(&json!({
            "message": "Experiment completed successfully",
            "results_path": results_path,
        }))?,
    }
    Ok(())
}

/// Run the file pipeline described by a TOML file
pub async fn handle_pipeline(
    pipeline_file: &Path,
    start_from: Option<Step>,
    stop_after: Option<Step>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let pipeline = PipelineConfig::load(pipeline_file)?;
    let credentials = open_credentials(config).await?;
    let context = PipelineContext {
        llms: Arc::new(LLMRegistry::with_defaults(config, credentials.clone())),
        retrievers: Arc::new(RetrieverRegistry::with_defaults(config, credentials)),
        storage: config.storage.clone(),
    };

    let output = run_pipeline(&context, &pipeline, start_from, stop_after).await?;
    match format {
        OutputFormat::Text => println!("Pipeline finished: {}", output.display()),
        OutputFormat::Json => print_json(&json!({ "output": output }))?,
    }
    Ok(())
}

pub async fn handle_experiments_list(config: &Config, format: OutputFormat) -> Result<()> {
    let store = FileExperimentStore::new(&config.storage.experiments_dir);
    let summaries = store.summaries().await?;

    match format {
        OutputFormat::Text => {
            if summaries.is_empty() {
                println!("No experiments in {}", store.dir().display());
                return Ok(());
            }
            println!("Experiments ({}):", summaries.len());
            println!();
            for summary in &summaries {
                println!("{}", summary.name);
                println!("  Date: {}", summary.date);
                println!("  Models: {}", summary.models.join(", "));
                println!(
                    "  Questions: {}  Facts: {}  Chunks: {}",
                    summary.questions, summary.facts, summary.chunks
                );
                println!("  Retriever: {}", summary.retriever);
                if !summary.validation_set.is_empty() {
                    println!("  Validation set: {}", summary.validation_set);
                }
                println!();
            }
        }
        OutputFormat::Json => print_json(&json!({
            "experiments": summaries,
            "count": summaries.len(),
        }))?,
    }
    Ok(())
}

pub async fn handle_experiments_show(name: &str, config: &Config, format: OutputFormat) -> Result<()> {
    let store = FileExperimentStore::new(&config.storage.experiments_dir);
    let document = store.load_value(name).await?;

    match format {
        OutputFormat::Text => print_stats(name, &document),
        OutputFormat::Json => print_json(&document)?,
    }
    Ok(())
}

pub async fn handle_experiments_delete(name: &str, config: &Config, format: OutputFormat) -> Result<()> {
    let store = FileExperimentStore::new(&config.storage.experiments_dir);
    store.delete(name).await?;
    report_deleted("Experiment", name, format)
}

pub async fn handle_validation_sets_list(config: &Config, format: OutputFormat) -> Result<()> {
    let store = ValidationSetStore::new(&config.storage.validation_sets_dir);
    let summaries = store.list().await?;

    match format {
        OutputFormat::Text => {
            if summaries.is_empty() {
                println!("No validation sets in {}", store.dir().display());
                return Ok(());
            }
            println!("Validation sets ({}):", summaries.len());
            println!();
            for summary in &summaries {
                println!("{} ({})", summary.name, summary.date);
                println!(
                    "  Questions: {}  Facts: {}  Answers: {}  Human evals: {}",
                    summary.questions, summary.facts, summary.answers, summary.human_eval
                );
            }
        }
        OutputFormat::Json => print_json(&json!({
            "validation_sets": summaries,
            "count": summaries.len(),
        }))?,
    }
    Ok(())
}

pub async fn handle_validation_sets_show(
    name: &str,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let store = ValidationSetStore::new(&config.storage.validation_sets_dir);
    let document = store.load(name).await?;

    match format {
        OutputFormat::Text => print_stats(name, &document),
        OutputFormat::Json => print_json(&document)?,
    }
    Ok(())
}

pub async fn handle_validation_sets_delete(
    name: &str,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let store = ValidationSetStore::new(&config.storage.validation_sets_dir);
    store.delete(name).await?;
    report_deleted("Validation set", name, format)
}

fn report_deleted(kind: &str, name: &str, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => println!("{} '{}' deleted", kind, name),
        OutputFormat::Json => print_json(&json!({ "deleted": name }))?,
    }
    Ok(())
}

fn document_items(document: &Value) -> &[Value] {
    match document {
        Value::Array(items) => items,
        other => other
            .get("items")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]),
    }
}

fn print_stats(name: &str, document: &Value) {
    let stats = stats(document_items(document));
    println!("{}", name);
    println!("  Questions:   {}", stats.questions);
    println!("  Facts:       {}", stats.facts);
    println!("  Chunks:      {}", stats.chunks);
    println!("  Answers:     {}", stats.answers);
    println!("  Human evals: {}", stats.human_eval);
    println!("  Auto evals:  {}", stats.auto_eval);
    println!("  Models:      {}", stats.models);
    if !stats.uniform_models {
        println!("  (items carry different numbers of answers)");
    }
}

/// Statistics of any experiment or validation-set file
pub async fn handle_stats(file: &Path, format: OutputFormat) -> Result<()> {
    let contents = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let document: Value = serde_json::from_str(&contents)
        .with_context(|| format!("Invalid JSON in {}", file.display()))?;

    match format {
        OutputFormat::Text => print_stats(&file.display().to_string(), &document),
        OutputFormat::Json => print_json(&stats(document_items(&document)))?,
    }
    Ok(())
}

pub async fn handle_keys_list(config: &Config, format: OutputFormat) -> Result<()> {
    let credentials = open_credentials(config).await?;
    let keys = credentials.stored();

    match format {
        OutputFormat::Text => {
            if keys.is_empty() {
                println!("No stored API keys");
                return Ok(());
            }
            for (name, value) in &keys {
                println!("{:<24} {}", name, value.masked());
            }
        }
        OutputFormat::Json => {
            let keys: Vec<Value> = keys
                .iter()
                .map(|(name, value)| json!({ "name": name, "value": value.masked() }))
                .collect();
            print_json(&json!({ "keys": keys }))?;
        }
    }
    Ok(())
}

pub async fn handle_keys_set(name: &str, value: &str, config: &Config, format: OutputFormat) -> Result<()> {
    let credentials = open_credentials(config).await?;
    credentials.set_api_key(name, value).await?;

    match format {
        OutputFormat::Text => println!("API key '{}' stored", name),
        OutputFormat::Json => print_json(&json!({ "stored": name }))?,
    }
    Ok(())
}

pub async fn handle_keys_delete(name: &str, config: &Config, format: OutputFormat) -> Result<()> {
    let credentials = open_credentials(config).await?;
    if !credentials.delete_api_key(name).await? {
        anyhow::bail!("No stored API key named '{}'", name);
    }
    report_deleted("API key", name, format)
}

pub async fn handle_keys_status(config: &Config, format: OutputFormat) -> Result<()> {
    let credentials = open_credentials(config).await?;
    let availability = credentials.availability();

    match format {
        OutputFormat::Text => {
            let label = |ok: bool| if ok { "available" } else { "missing" };
            println!("Providers:");
            println!("  OpenAI:  {}", label(availability.openai));
            println!("  Mistral: {}", label(availability.mistral));
        }
        OutputFormat::Json => print_json(&availability)?,
    }
    Ok(())
}

pub async fn handle_models(config: &Config, format: OutputFormat) -> Result<()> {
    let credentials = Arc::new(CredentialStore::env_only());
    let models = LLMRegistry::with_defaults(config, credentials.clone()).describe();
    let retrievers = RetrieverRegistry::with_defaults(config, credentials).describe();

    match format {
        OutputFormat::Text => {
            println!("Models:");
            for model in &models {
                let rag = if model.built_in_retriever {
                    " [built-in retriever]"
                } else {
                    ""
                };
                println!("  {}{}", model.name, rag);
                if !model.description.is_empty() {
                    println!("    {}", model.description);
                }
            }
            println!();
            println!("Retrievers:");
            for retriever in &retrievers {
                println!("  {}", retriever.name);
            }
        }
        OutputFormat::Json => print_json(&json!({
            "models": models,
            "retrievers": retrievers,
        }))?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_items_accepts_both_shapes() {
        let wrapped = json!({ "items": [{ "question": { "text": "q" } }] });
        assert_eq!(document_items(&wrapped).len(), 1);

        let bare = json!([{}, {}]);
        assert_eq!(document_items(&bare).len(), 2);

        assert!(document_items(&json!({ "name": "x" })).is_empty());
    }

    #[tokio::test]
    async fn test_stats_of_missing_file_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = handle_stats(&dir.path().join("nope.json"), OutputFormat::Json).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_experiments_list_on_empty_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::with_data_dir(dir.path()).unwrap();
        handle_experiments_list(&config, OutputFormat::Json)
            .await
            .unwrap();
    }
}

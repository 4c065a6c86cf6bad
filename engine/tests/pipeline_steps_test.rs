//! File pipeline integration tests
//!
//! Runs `answers -> facts -> evals` over files in a temporary directory with
//! a fake provider that answers by prompt kind.

use async_trait::async_trait;
use ragtime_engine::config::Config;
use ragtime_engine::llm::{Completion, LLMError, LLMProvider, LLMRegistry, ModelInfo, RetryPolicy};
use ragtime_engine::pipeline::steps::{run_pipeline, PipelineConfig, PipelineContext, Step};
use ragtime_engine::retriever::RetrieverRegistry;
use sdk::errors::EngineError;
use sdk::model::{Experiment, Prompt};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

struct FakeProvider;

#[async_trait]
impl LLMProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn complete(&self, prompt: &Prompt) -> Result<Completion, LLMError> {
        let system = prompt.system();
        let reply = if system.contains("extract the key facts") {
            "- Paris is the capital\n- Paris is on the Seine"
        } else if system.contains("grade an answer") {
            "1: OK\n2: OK\nHALLU: none"
        } else {
            "Paris, on the Seine, is the capital."
        };
        Ok(Completion::text(reply))
    }
}

fn context(data_dir: &Path) -> PipelineContext {
    let config = Config::with_data_dir(data_dir).unwrap();
    let mut llms = LLMRegistry::new(RetryPolicy::no_retry());
    llms.register(
        ModelInfo {
            name: "fake".to_string(),
            built_in_retriever: false,
            description: String::new(),
            parameters: Vec::new(),
        },
        Arc::new(|_: &str| Arc::new(FakeProvider) as Arc<dyn LLMProvider>),
    );
    PipelineContext {
        llms: Arc::new(llms),
        retrievers: Arc::new(RetrieverRegistry::new()),
        storage: config.storage,
    }
}

fn write_questions(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    let doc = json!({
        "items": [
            {"question": {"text": "What is the capital of France?"}},
            {"question": {"text": "Which river crosses Paris?"}}
        ]
    });
    std::fs::write(dir.join("Q.json"), doc.to_string()).unwrap();
}

fn pipeline_toml(input: &Path) -> String {
    format!(
        r#"
folder_name = "{}"
file_name = "Q.json"

[generate.answers]
llms = ["fake"]

[generate.facts]
llms = ["fake"]

[generate.evals]
llms = ["fake"]
"#,
        input.display()
    )
}

fn load(path: &Path) -> Experiment {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn test_full_pipeline_chains_steps() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("questions");
    write_questions(&input);
    let ctx = context(dir.path());
    let pipeline = PipelineConfig::from_toml_str(&pipeline_toml(&input)).unwrap();

    let output = run_pipeline(&ctx, &pipeline, None, None).await.unwrap();
    assert_eq!(output, ctx.storage.experiments_dir.join("Q.json"));

    let answers = load(&ctx.storage.answers_dir.join("Q.json"));
    assert_eq!(answers.items[0].answers.len(), 1);
    assert!(answers.items[0].facts.is_empty());

    let facts = load(&ctx.storage.facts_dir.join("Q.json"));
    assert_eq!(facts.items[0].facts.len(), 2);

    let evals = load(&output);
    for qa in &evals.items {
        assert_eq!(qa.answers[0].eval.as_ref().unwrap().auto, Some(1.0));
    }
}

#[tokio::test]
async fn test_stop_after_answers() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("questions");
    write_questions(&input);
    let ctx = context(dir.path());
    let pipeline = PipelineConfig::from_toml_str(&pipeline_toml(&input)).unwrap();

    let output = run_pipeline(&ctx, &pipeline, None, Some(Step::Answers))
        .await
        .unwrap();
    assert_eq!(output, ctx.storage.answers_dir.join("Q.json"));
    assert!(!ctx.storage.facts_dir.join("Q.json").exists());
}

#[tokio::test]
async fn test_unknown_model_fails_before_writing() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("questions");
    write_questions(&input);
    let ctx = context(dir.path());
    let toml = format!(
        "folder_name = \"{}\"\nfile_name = \"Q.json\"\n\n[generate.answers]\nllms = [\"nope\"]\n",
        input.display()
    );
    let pipeline = PipelineConfig::from_toml_str(&toml).unwrap();

    let err = run_pipeline(&ctx, &pipeline, None, None).await.unwrap_err();
    assert!(matches!(err, EngineError::Config(_)));
    assert!(!ctx.storage.answers_dir.join("Q.json").exists());
}

#[tokio::test]
async fn test_missing_input_file_is_storage_error() {
    let dir = TempDir::new().unwrap();
    let ctx = context(dir.path());
    let pipeline = PipelineConfig::from_toml_str(&pipeline_toml(&dir.path().join("none"))).unwrap();

    let err = run_pipeline(&ctx, &pipeline, None, None).await.unwrap_err();
    assert!(matches!(err, EngineError::Storage { .. } | EngineError::NotFound(_)));
}

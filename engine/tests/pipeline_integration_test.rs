//! Orchestrator integration tests
//!
//! A fake provider answers by prompt kind so every stage of an experiment
//! runs without a network. Files go to a temporary directory.

use async_trait::async_trait;
use ragtime_engine::llm::{Completion, LLMError, LLMProvider, LLMRegistry, ModelInfo, RetryPolicy};
use ragtime_engine::pipeline::{ExperimentConfig, Orchestrator, NO_RETRIEVER};
use ragtime_engine::retriever::{self, Retriever, RetrieverInfo, RetrieverRegistry};
use ragtime_engine::store::{ExperimentStore, FileExperimentStore, ValidationSetStore};
use sdk::errors::EngineError;
use sdk::model::{Chunk, Chunks, Prompt, QA};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Replies by prompt kind; `fail_evals` makes grading calls fail
struct FakeProvider {
    name: String,
    fail_evals: bool,
    fail_answers: bool,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl LLMProvider for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, prompt: &Prompt) -> Result<Completion, LLMError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let system = prompt.system();
        if system.contains("grade an answer") {
            if self.fail_evals {
                return Err(LLMError::ProviderUnavailable("grader down".into()));
            }
            return Ok(Completion::text("1: OK\n2: MISSING\nHALLU: none"));
        }
        if system.contains("supported by numbered source passages") {
            return Ok(Completion::text("1: OK\n2: MISSING"));
        }
        if self.fail_answers {
            return Err(LLMError::ProviderUnavailable("answers down".into()));
        }
        Ok(Completion::text(format!("{} says Paris", self.name)))
    }
}

struct FixedChunks;

#[async_trait]
impl Retriever for FixedChunks {
    fn name(&self) -> &str {
        "Fixed"
    }

    async fn retrieve(&self, qa: &mut QA) -> retriever::Result<()> {
        qa.chunks = Chunks::new(vec![Chunk::new("Paris is the capital of France.")]);
        Ok(())
    }
}

struct Fixture {
    dir: TempDir,
    orchestrator: Orchestrator,
    store: Arc<FileExperimentStore>,
    calls: Arc<AtomicUsize>,
}

async fn fixture(fail_answers: bool, fail_evals: bool) -> Fixture {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileExperimentStore::new(dir.path().join("evals")));
    let validation_sets = ValidationSetStore::new(dir.path().join("validation_sets"));
    validation_sets
        .save(&json!({
            "name": "V1",
            "items": [{
                "question": {"text": "What is the capital of France?"},
                "facts": {"items": [
                    {"text": "Paris is the capital"},
                    {"text": "Paris is on the Seine"}
                ]}
            }]
        }))
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let mut llms = LLMRegistry::new(RetryPolicy::no_retry());
    for name in ["fake-a", "fake-b"] {
        let calls = calls.clone();
        llms.register(
            ModelInfo {
                name: name.to_string(),
                built_in_retriever: false,
                description: String::new(),
                parameters: Vec::new(),
            },
            Arc::new(move |name: &str| {
                Arc::new(FakeProvider {
                    name: name.to_string(),
                    fail_evals,
                    fail_answers,
                    calls: calls.clone(),
                }) as Arc<dyn LLMProvider>
            }),
        );
    }

    let mut retrievers = RetrieverRegistry::new();
    retrievers.register(
        RetrieverInfo {
            name: "Fixed".to_string(),
            description: String::new(),
        },
        Arc::new(|| Arc::new(FixedChunks) as Arc<dyn Retriever>),
    );

    let orchestrator = Orchestrator::new(
        store.clone(),
        validation_sets,
        Arc::new(llms),
        Arc::new(retrievers),
    );
    Fixture {
        dir,
        orchestrator,
        store,
        calls,
    }
}

fn experiment(value: Value) -> ExperimentConfig {
    ExperimentConfig::from_json(value).unwrap()
}

#[tokio::test]
async fn test_full_experiment_with_chunk_evaluation() {
    let f = fixture(false, false).await;
    let config = experiment(json!({
        "name": "T1",
        "validationSet": "V1",
        "answerGenerationModels": ["fake-a", "fake-b"],
        "evaluationModel": "fake-a",
        "evaluateAnswers": true,
        "evaluateChunks": true,
        "useRetriever": true,
        "retrieverType": "Fixed"
    }));

    let path = f.orchestrator.run(&config).await.unwrap();
    assert_eq!(path, f.dir.path().join("evals").join("T1.json"));

    let expe = f.store.load("T1").await.unwrap();
    assert_eq!(expe.meta.retriever_name.as_deref(), Some("Fixed"));
    assert_eq!(expe.meta.validation_set.as_deref(), Some("V1"));

    let qa = &expe.items[0];
    assert_eq!(qa.chunks.len(), 1);
    assert_eq!(qa.answers.len(), 2);
    let names: Vec<&str> = qa.answers.iter().filter_map(|a| a.llm_name()).collect();
    assert_eq!(names, vec!["fake-a", "fake-b"]);

    for answer in qa.answers.iter() {
        let eval = answer.eval.as_ref().unwrap();
        assert_eq!(eval.auto, Some(0.5));
        assert_eq!(eval.meta["nb_ok"], json!(1));
        assert_eq!(eval.meta["nb_chunk_ok"], json!(1));
        assert_eq!(eval.list("retrieval_missing"), vec!["Paris is on the Seine"]);
        assert_eq!(eval.llm_answer.as_ref().unwrap().name, "fake-a");
    }
}

#[tokio::test]
async fn test_chunk_evaluation_alone_initializes_counters() {
    let f = fixture(false, false).await;
    let config = experiment(json!({
        "name": "T8",
        "validationSet": "V1",
        "answerGenerationModels": ["fake-a"],
        "evaluationModel": "fake-b",
        "evaluateAnswers": false,
        "evaluateChunks": true,
        "useRetriever": true,
        "retrieverType": "Fixed"
    }));

    f.orchestrator.run(&config).await.unwrap();
    let expe = f.store.load("T8").await.unwrap();

    let eval = expe.items[0].answers[0].eval.as_ref().unwrap();
    assert!(eval.has_counters());
    assert_eq!(eval.auto, None);
    assert_eq!(eval.meta["nb_ok"], json!(0));
    assert_eq!(eval.meta["nb_missing"], json!(0));
    assert_eq!(eval.meta["nb_hallu"], json!(0));
    assert_eq!(eval.meta["ok"], json!([]));
    assert_eq!(eval.meta["missing"], json!([]));
    assert_eq!(eval.meta["hallu"], json!([]));
    assert_eq!(eval.meta["nb_chunk_ok"], json!(1));
    assert_eq!(eval.list("chunk_missing"), vec!["Paris is on the Seine"]);
}

#[tokio::test]
async fn test_answers_without_retriever_are_labelled() {
    let f = fixture(false, false).await;
    let config = experiment(json!({
        "name": "T2",
        "validationSet": "V1",
        "answerGenerationModels": ["fake-a"],
        "evaluateAnswers": false
    }));

    f.orchestrator.run(&config).await.unwrap();
    let expe = f.store.load("T2").await.unwrap();
    assert_eq!(expe.meta.retriever_name.as_deref(), Some(NO_RETRIEVER));
    assert!(expe.items[0].chunks.is_empty());
    assert!(expe.items[0].answers[0].eval.is_none());
    assert_eq!(f.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_duplicate_name_leaves_existing_document_untouched() {
    let f = fixture(false, false).await;
    let config = experiment(json!({
        "name": "T1",
        "validationSet": "V1",
        "answerGenerationModels": ["fake-a"],
        "evaluateAnswers": false
    }));

    let path = f.orchestrator.run(&config).await.unwrap();
    let before = std::fs::read_to_string(&path).unwrap();
    let calls = f.calls.load(Ordering::SeqCst);

    let err = f.orchestrator.run(&config).await.unwrap_err();
    assert!(matches!(err, EngineError::DuplicateName(ref n) if n == "T1"));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    assert_eq!(f.calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn test_answer_failure_writes_nothing_and_releases_name() {
    let f = fixture(true, false).await;
    let config = experiment(json!({
        "name": "T3",
        "validationSet": "V1",
        "answerGenerationModels": ["fake-a"]
    }));

    let err = f.orchestrator.run(&config).await.unwrap_err();
    assert!(matches!(err, EngineError::StageExecution { ref stage, .. } if stage == "answer generation"));
    assert!(!f.store.exists("T3").await.unwrap());

    // The reservation is gone, so the name can be claimed again
    let reservation = f.store.reserve("T3").await.unwrap();
    assert_eq!(reservation.name(), "T3");
}

#[tokio::test]
async fn test_eval_failure_keeps_answers_and_reports_stage() {
    let f = fixture(false, true).await;
    let config = experiment(json!({
        "name": "T4",
        "validationSet": "V1",
        "answerGenerationModels": ["fake-a"],
        "evaluateAnswers": true
    }));

    let err = f.orchestrator.run(&config).await.unwrap_err();
    assert!(matches!(err, EngineError::StageExecution { ref stage, .. } if stage == "answer evaluation"));

    let expe = f.store.load("T4").await.unwrap();
    assert_eq!(expe.items[0].answers.len(), 1);
    assert!(expe.items[0].answers[0]
        .eval
        .as_ref()
        .map_or(true, |e| e.auto.is_none()));
}

#[tokio::test]
async fn test_unknown_model_is_rejected_before_any_call() {
    let f = fixture(false, false).await;
    let config = experiment(json!({
        "name": "T5",
        "validationSet": "V1",
        "answerGenerationModels": ["fake-a", "no-such-model"]
    }));

    // Unregistered names fall back to a generic backend when one is set;
    // this registry has none.
    let err = f.orchestrator.run(&config).await.unwrap_err();
    assert!(matches!(err, EngineError::Config(_)));
    assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    assert!(!f.store.exists("T5").await.unwrap());
}

#[tokio::test]
async fn test_embedded_validation_set_with_answers() {
    let f = fixture(false, false).await;
    let config = experiment(json!({
        "name": "T6",
        "validationSet": "uploaded",
        "answerGenerationModels": ["fake-a"],
        "evaluateAnswers": true,
        "withCSV": true,
        "validationSetData": {
            "items": [{
                "question": {"text": "What is the capital of France?"},
                "facts": {"items": [{"text": "Paris"}, {"text": "Seine"}]},
                "answers": {"items": [{
                    "text": "Paris",
                    "llm_answer": {"name": "human", "text": "Paris"}
                }]}
            }]
        }
    }));

    f.orchestrator.run(&config).await.unwrap();
    let expe = f.store.load("T6").await.unwrap();
    let answer = &expe.items[0].answers[0];
    assert_eq!(answer.llm_name(), Some("human"));
    assert_eq!(answer.eval.as_ref().unwrap().auto, Some(0.5));
    assert_eq!(expe.meta.extra["models"], json!(["human"]));
    // Only the grading call went out
    assert_eq!(f.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_missing_validation_set_is_not_found() {
    let f = fixture(false, false).await;
    let config = experiment(json!({
        "name": "T7",
        "validationSet": "V9",
        "answerGenerationModels": ["fake-a"]
    }));

    let err = f.orchestrator.run(&config).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
    assert!(!f.store.exists("T7").await.unwrap());
}

//! Experiment and validation-set storage
//!
//! Experiments are pretty-printed JSON documents named `{name}.json` in the
//! experiments directory. Writes go through a temporary file and a rename so a
//! reader never sees a half-written document.

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::model::Experiment;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;

pub mod validation;

pub use validation::{ValidationSetStore, ValidationSetSummary};

type Result<T> = std::result::Result<T, EngineError>;

/// Holds an experiment name until dropped
pub struct Reservation {
    name: String,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Reservation {
    pub fn new(name: impl Into<String>, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation").field("name", &self.name).finish()
    }
}

/// Persistence of experiment documents keyed by name
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    /// Write `expe` under `name`, returning where it landed
    async fn save(&self, name: &str, expe: &Experiment) -> Result<PathBuf>;

    async fn load(&self, name: &str) -> Result<Experiment>;

    async fn list(&self) -> Result<Vec<String>>;

    async fn delete(&self, name: &str) -> Result<()>;

    async fn exists(&self, name: &str) -> Result<bool>;

    /// Claim `name` for a new experiment
    ///
    /// Fails with [`EngineError::DuplicateName`] when a document or another
    /// reservation already holds the name.
    async fn reserve(&self, name: &str) -> Result<Reservation>;
}

/// Listing entry for a stored experiment
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSummary {
    pub name: String,
    pub date: String,
    pub models: Vec<String>,
    pub questions: usize,
    pub facts: usize,
    pub chunks: usize,
    pub retriever: String,
    pub results_path: PathBuf,
    pub validation_set: String,
}

/// Reject names that would escape the storage directory
pub(crate) fn check_name(name: &str) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::Config("name must not be empty".to_string()));
    }
    if name.contains(['/', '\\']) || name.contains("..") || name.starts_with('.') {
        return Err(EngineError::Config(format!("invalid name '{}'", name)));
    }
    Ok(())
}

/// File modification time as `%Y-%m-%d %H:%M:%S` local time
pub(crate) async fn modified_date(path: &Path) -> String {
    tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .map(|t| {
            chrono::DateTime::<chrono::Local>::from(t)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_default()
}

pub(crate) async fn path_exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| EngineError::storage(path, e))
}

/// Paths of the entries of `dir`, sorted; a missing directory is empty
pub(crate) async fn dir_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(EngineError::storage(dir, e)),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| EngineError::storage(dir, e))?
    {
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

/// Pretty-print `value` to `path` through a temporary sibling
pub(crate) async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| EngineError::storage(parent, e))?;
    }
    let body = serde_json::to_vec_pretty(value).map_err(|e| EngineError::storage(path, e))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body)
        .await
        .map_err(|e| EngineError::storage(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| EngineError::storage(path, e))
}

pub(crate) async fn read_json(path: &Path) -> Result<Value> {
    let body = tokio::fs::read(path)
        .await
        .map_err(|e| EngineError::storage(path, e))?;
    serde_json::from_slice(&body).map_err(|e| EngineError::storage(path, e))
}

#[derive(Debug, Clone)]
pub struct FileExperimentStore {
    dir: PathBuf,
}

impl FileExperimentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> Result<PathBuf> {
        check_name(name)?;
        Ok(self.dir.join(format!("{}.json", name.trim())))
    }

    fn marker_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!(".{}.reserved", name.trim()))
    }

    /// Raw stored document
    pub async fn load_value(&self, name: &str) -> Result<Value> {
        let path = self.path_for(name)?;
        if !path_exists(&path).await? {
            return Err(EngineError::NotFound(format!("experiment '{}'", name)));
        }
        read_json(&path).await
    }

    /// Raw document at `path`, which must lie inside the experiments directory
    pub async fn load_path(&self, path: &Path) -> Result<Value> {
        let resolved = tokio::fs::canonicalize(path)
            .await
            .map_err(|_| EngineError::NotFound(format!("results file {}", path.display())))?;
        let dir = tokio::fs::canonicalize(&self.dir)
            .await
            .map_err(|e| EngineError::storage(&self.dir, e))?;
        if !resolved.starts_with(&dir) {
            return Err(EngineError::Config(format!(
                "{} is outside the experiments directory",
                path.display()
            )));
        }
        read_json(&resolved).await
    }

    /// Listing entries, sorted by name; unreadable documents are skipped
    pub async fn summaries(&self) -> Result<Vec<ExperimentSummary>> {
        let mut summaries = Vec::new();
        for name in self.list().await? {
            let path = self.path_for(&name)?;
            let data = match read_json(&path).await {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!("Skipping unreadable experiment {}: {}", name, e);
                    continue;
                }
            };
            let date = modified_date(&path).await;
            summaries.push(summarize(name, path, date, &data));
        }
        Ok(summaries)
    }
}

fn summarize(name: String, path: PathBuf, date: String, data: &Value) -> ExperimentSummary {
    let items = data
        .get("items")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    let stats = crate::stats::stats(items);

    let mut models: Vec<String> = Vec::new();
    for item in items {
        let answers = item
            .pointer("/answers/items")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        for answer in answers {
            if let Some(model) = answer.pointer("/llm_answer/name").and_then(Value::as_str) {
                if !models.iter().any(|m| m == model) {
                    models.push(model.to_string());
                }
            }
        }
    }

    let meta_str = |key: &str, default: &str| {
        data.pointer(&format!("/meta/{}", key))
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    };

    ExperimentSummary {
        date,
        models,
        questions: stats.questions,
        facts: stats.facts,
        chunks: stats.chunks,
        retriever: meta_str("retriever_name", "Not specified"),
        validation_set: meta_str("validation_set", "Unknown"),
        results_path: path,
        name,
    }
}

#[async_trait]
impl ExperimentStore for FileExperimentStore {
    async fn save(&self, name: &str, expe: &Experiment) -> Result<PathBuf> {
        let path = self.path_for(name)?;
        write_json(&path, expe).await?;
        tracing::debug!("Saved experiment {} to {}", name, path.display());
        Ok(path)
    }

    async fn load(&self, name: &str) -> Result<Experiment> {
        let value = self.load_value(name).await?;
        let path = self.path_for(name)?;
        serde_json::from_value(value).map_err(|e| EngineError::storage(path, e))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = dir_entries(&self.dir)
            .await?
            .iter()
            .filter_map(|path| path.file_name()?.to_str()?.strip_suffix(".json"))
            .filter(|name| !name.starts_with('.'))
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!("Deleted experiment {}", name);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::NotFound(format!("experiment '{}'", name)))
            }
            Err(e) => Err(EngineError::storage(path, e)),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        path_exists(&self.path_for(name)?).await
    }

    async fn reserve(&self, name: &str) -> Result<Reservation> {
        let path = self.path_for(name)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| EngineError::storage(&self.dir, e))?;

        let marker = self.marker_for(name);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&marker)
            .await
        {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(EngineError::DuplicateName(name.to_string()));
            }
            Err(e) => return Err(EngineError::storage(&marker, e)),
        }

        if path_exists(&path).await? {
            let _ = tokio::fs::remove_file(&marker).await;
            return Err(EngineError::DuplicateName(name.to_string()));
        }

        // Released from Drop, which cannot await
        Ok(Reservation::new(name, move || {
            if let Err(e) = std::fs::remove_file(&marker) {
                tracing::warn!("Failed to release reservation {}: {}", marker.display(), e);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::model::{Question, QA};
    use tempfile::TempDir;

    fn store() -> (TempDir, FileExperimentStore) {
        let dir = TempDir::new().unwrap();
        let store = FileExperimentStore::new(dir.path().join("evals"));
        (dir, store)
    }

    #[tokio::test]
    async fn test_save_load_list_delete() {
        let (_dir, store) = store();
        let mut expe = Experiment::new(vec![QA::new(Question::new("Q1"))]);
        expe.meta.validation_set = Some("V1".into());

        let path = store.save("T1", &expe).await.unwrap();
        assert!(path.ends_with("T1.json"));
        assert_eq!(store.load("T1").await.unwrap(), expe);
        assert_eq!(store.list().await.unwrap(), vec!["T1"]);

        store.delete("T1").await.unwrap();
        assert!(!store.exists("T1").await.unwrap());
        assert!(matches!(
            store.delete("T1").await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_directory_lists_nothing() {
        let (_dir, store) = store();
        assert!(store.list().await.unwrap().is_empty());
        assert!(matches!(store.load("nope").await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_reserve_is_exclusive_until_dropped() {
        let (_dir, store) = store();

        let first = store.reserve("T1").await.unwrap();
        assert!(matches!(
            store.reserve("T1").await,
            Err(EngineError::DuplicateName(_))
        ));
        assert!(store.list().await.unwrap().is_empty());

        drop(first);
        let again = store.reserve("T1").await.unwrap();
        assert_eq!(again.name(), "T1");
    }

    #[tokio::test]
    async fn test_concurrent_reservations_admit_one() {
        let (_dir, store) = store();
        let (a, b) = tokio::join!(store.reserve("T1"), store.reserve("T1"));
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert!(matches!(
            a.err().or(b.err()),
            Some(EngineError::DuplicateName(_))
        ));
    }

    #[tokio::test]
    async fn test_dir_entries_sorted_and_missing_dir_empty() {
        let (dir, _) = store();
        assert!(dir_entries(&dir.path().join("absent")).await.unwrap().is_empty());

        for name in ["b.json", "a.json", ".a.reserved"] {
            tokio::fs::write(dir.path().join(name), "{}").await.unwrap();
        }
        let names: Vec<_> = dir_entries(dir.path())
            .await
            .unwrap()
            .iter()
            .filter_map(|p| p.file_name()?.to_str().map(str::to_string))
            .collect();
        assert_eq!(names, vec![".a.reserved", "a.json", "b.json"]);
    }

    #[tokio::test]
    async fn test_reserve_rejects_stored_name() {
        let (_dir, store) = store();
        store.save("T1", &Experiment::default()).await.unwrap();
        assert!(matches!(
            store.reserve("T1").await,
            Err(EngineError::DuplicateName(_))
        ));
    }

    #[tokio::test]
    async fn test_names_cannot_escape_directory() {
        let (_dir, store) = store();
        for bad in ["../x", "a/b", "", ".hidden"] {
            assert!(matches!(store.path_for(bad), Err(EngineError::Config(_))), "{}", bad);
        }
    }

    #[tokio::test]
    async fn test_load_path_is_confined() {
        let (dir, store) = store();
        let saved = store.save("T1", &Experiment::default()).await.unwrap();
        assert!(store.load_path(&saved).await.is_ok());

        let outside = dir.path().join("outside.json");
        std::fs::write(&outside, "{}").unwrap();
        assert!(matches!(
            store.load_path(&outside).await,
            Err(EngineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_summaries_report_models_and_meta() {
        let (_dir, store) = store();
        let expe: Experiment = serde_json::from_value(serde_json::json!({
            "meta": {"validation_set": "V1", "retriever_name": "No retriever"},
            "items": [{
                "question": {"text": "Q1"},
                "facts": {"items": [{"text": "F1"}]},
                "answers": {"items": [
                    {"text": "A", "llm_answer": {"name": "modelA"}},
                    {"text": "B", "llm_answer": {"name": "modelB"}}
                ]}
            }]
        }))
        .unwrap();
        store.save("T1", &expe).await.unwrap();

        let summaries = store.summaries().await.unwrap();
        assert_eq!(summaries.len(), 1);
        let summary = &summaries[0];
        assert_eq!(summary.models, vec!["modelA", "modelB"]);
        assert_eq!(summary.questions, 1);
        assert_eq!(summary.facts, 1);
        assert_eq!(summary.retriever, "No retriever");
        assert_eq!(summary.validation_set, "V1");
        assert!(!summary.date.is_empty());
    }
}

//! Validation-set storage
//!
//! A validation set is stored as the document it was saved with, under
//! `{name}_Validation_set_Q{questions}_F{facts}.json`. The counts in the file
//! name are what listings report, so they are parsed back rather than
//! recomputed.

use super::{check_name, dir_entries, modified_date, read_json, write_json, Result};
use crate::stats::stats;
use regex::Regex;
use sdk::errors::EngineError;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const MARKER: &str = "_Validation_set_";

fn file_name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(.+)_Validation_set_Q(\d+)_F(\d+)\.json$")
            .expect("Invalid validation set file pattern")
    })
}

/// `(name, questions, facts)` encoded in a validation-set file name
pub fn parse_file_name(file_name: &str) -> Option<(String, usize, usize)> {
    let caps = file_name_pattern().captures(file_name)?;
    Some((
        caps[1].to_string(),
        caps[2].parse().ok()?,
        caps[3].parse().ok()?,
    ))
}

pub fn file_name(name: &str, questions: usize, facts: usize) -> String {
    format!("{}{}Q{}_F{}.json", name, MARKER, questions, facts)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationSetSummary {
    pub name: String,
    pub date: String,
    pub questions: usize,
    pub facts: usize,
    pub chunks: usize,
    pub answers: usize,
    pub human_eval: usize,
    pub auto_eval: usize,
    pub models: usize,
}

/// Check the items of a validation set; returns `(questions, facts)`
pub fn validate_items(items: &[Value]) -> Result<(usize, usize)> {
    if items.is_empty() {
        return Err(EngineError::Config(
            "Validation set must contain items".to_string(),
        ));
    }
    let mut facts = 0;
    for (i, item) in items.iter().enumerate() {
        let has_question = item
            .pointer("/question/text")
            .and_then(Value::as_str)
            .is_some_and(|t| !t.trim().is_empty());
        if !has_question {
            return Err(EngineError::Config(format!(
                "Item {} must have question.text",
                i + 1
            )));
        }
        let item_facts = item
            .pointer("/facts/items")
            .and_then(Value::as_array)
            .filter(|f| !f.is_empty())
            .ok_or_else(|| {
                EngineError::Config(format!("Item {} must have facts.items", i + 1))
            })?;
        facts += item_facts.len();
    }
    Ok((items.len(), facts))
}

#[derive(Debug, Clone)]
pub struct ValidationSetStore {
    dir: PathBuf,
}

impl ValidationSetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Files stored under `name`
    async fn files_for(&self, name: &str) -> Result<Vec<PathBuf>> {
        check_name(name)?;
        let name = name.trim();
        let files = dir_entries(&self.dir)
            .await?
            .into_iter()
            .filter(|path| {
                path.file_name()
                    .and_then(|f| f.to_str())
                    .and_then(parse_file_name)
                    .is_some_and(|(stored, _, _)| stored == name)
            })
            .collect();
        Ok(files)
    }

    /// Validate and store `document` (`{"name": ..., "items": [...]}`)
    ///
    /// Files previously saved under the same name are replaced.
    pub async fn save(&self, document: &Value) -> Result<PathBuf> {
        let name = document
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| EngineError::Config("Validation set must have a name".to_string()))?;
        check_name(name)?;
        let items = document
            .get("items")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let (questions, facts) = validate_items(items)?;

        let stale = self.files_for(name).await?;
        let path = self.dir.join(file_name(name, questions, facts));
        write_json(&path, document).await?;
        for old in stale.into_iter().filter(|old| *old != path) {
            if let Err(e) = tokio::fs::remove_file(&old).await {
                tracing::warn!("Failed to remove stale {}: {}", old.display(), e);
            }
        }

        tracing::info!(
            "Saved validation set {} ({} questions, {} facts)",
            name,
            questions,
            facts
        );
        Ok(path)
    }

    /// Store `items` under `new_name`, dropping `old_name`
    pub async fn rename(&self, old_name: &str, new_name: &str, items: Vec<Value>) -> Result<PathBuf> {
        let previous = self.files_for(old_name).await?;
        if previous.is_empty() {
            return Err(EngineError::NotFound(format!("validation set '{}'", old_name)));
        }

        let path = self.save(&json!({"name": new_name, "items": items})).await?;
        if old_name.trim() != new_name.trim() {
            for old in previous {
                tokio::fs::remove_file(&old)
                    .await
                    .map_err(|e| EngineError::storage(&old, e))?;
            }
        }
        Ok(path)
    }

    /// The stored document for `name`
    pub async fn load(&self, name: &str) -> Result<Value> {
        let files = self.files_for(name).await?;
        let path = files
            .first()
            .ok_or_else(|| EngineError::NotFound(format!("validation set '{}'", name)))?;
        read_json(path).await
    }

    /// The `items` of the stored document for `name`
    pub async fn load_items(&self, name: &str) -> Result<Vec<Value>> {
        match self.load(name).await? {
            Value::Object(mut doc) => match doc.remove("items") {
                Some(Value::Array(items)) => Ok(items),
                _ => Ok(Vec::new()),
            },
            _ => Ok(Vec::new()),
        }
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let files = self.files_for(name).await?;
        if files.is_empty() {
            return Err(EngineError::NotFound(format!("validation set '{}'", name)));
        }
        for path in files {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| EngineError::storage(&path, e))?;
        }
        tracing::info!("Deleted validation set {}", name);
        Ok(())
    }

    /// Every stored set, sorted by name; files that do not follow the naming
    /// scheme are ignored
    pub async fn list(&self) -> Result<Vec<ValidationSetSummary>> {
        let mut summaries = Vec::new();
        for path in dir_entries(&self.dir).await? {
            let Some((name, questions, facts)) = path
                .file_name()
                .and_then(|f| f.to_str())
                .and_then(parse_file_name)
            else {
                continue;
            };

            let data = match read_json(&path).await {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!("Skipping unreadable validation set: {}", e);
                    continue;
                }
            };
            let items = data
                .get("items")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let stats = stats(items);

            summaries.push(ValidationSetSummary {
                name,
                date: modified_date(&path).await,
                questions,
                facts,
                chunks: stats.chunks,
                answers: stats.answers,
                human_eval: stats.human_eval,
                auto_eval: stats.auto_eval,
                models: stats.models,
            });
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn document(name: &str) -> Value {
        json!({
            "name": name,
            "items": [
                {"question": {"text": "Q1"}, "facts": {"items": [{"text": "F1"}, {"text": "F2"}]}},
                {"question": {"text": "Q2"}, "facts": {"items": [{"text": "F3"}]}}
            ]
        })
    }

    #[test]
    fn test_file_name_round_trips() {
        let name = file_name("Tax_FAQ", 12, 40);
        assert_eq!(name, "Tax_FAQ_Validation_set_Q12_F40.json");
        assert_eq!(parse_file_name(&name), Some(("Tax_FAQ".to_string(), 12, 40)));
        assert_eq!(parse_file_name("notes.json"), None);
    }

    #[test]
    fn test_validation_rejects_incomplete_items() {
        assert!(validate_items(&[]).is_err());
        assert!(validate_items(&[json!({"facts": {"items": [{"text": "F"}]}})]).is_err());
        assert!(validate_items(&[json!({"question": {"text": "Q"}, "facts": {"items": []}})]).is_err());
        assert_eq!(
            validate_items(&[json!({"question": {"text": "Q"}, "facts": {"items": [{"text": "F"}]}})])
                .unwrap(),
            (1, 1)
        );
    }

    #[tokio::test]
    async fn test_save_encodes_counts_and_lists_them() {
        let dir = TempDir::new().unwrap();
        let store = ValidationSetStore::new(dir.path());

        let path = store.save(&document("V1")).await.unwrap();
        assert!(path.ends_with("V1_Validation_set_Q2_F3.json"));

        let sets = store.list().await.unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!((sets[0].questions, sets[0].facts), (2, 3));
        assert_eq!(store.load("V1").await.unwrap(), document("V1"));
        assert_eq!(store.load_items("V1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_resave_replaces_previous_counts() {
        let dir = TempDir::new().unwrap();
        let store = ValidationSetStore::new(dir.path());
        store.save(&document("V1")).await.unwrap();

        let smaller = json!({"name": "V1", "items": [
            {"question": {"text": "Q1"}, "facts": {"items": [{"text": "F1"}]}}
        ]});
        store.save(&smaller).await.unwrap();

        let sets = store.list().await.unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!((sets[0].questions, sets[0].facts), (1, 1));
    }

    #[tokio::test]
    async fn test_prefix_names_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let store = ValidationSetStore::new(dir.path());
        store.save(&document("V1")).await.unwrap();
        store.save(&document("V1_extra")).await.unwrap();

        store.delete("V1").await.unwrap();
        let names: Vec<_> = store.list().await.unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["V1_extra"]);
        assert!(matches!(store.delete("V1").await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rename_moves_items() {
        let dir = TempDir::new().unwrap();
        let store = ValidationSetStore::new(dir.path());
        store.save(&document("old")).await.unwrap();
        let items = store.load_items("old").await.unwrap();

        store.rename("old", "new", items).await.unwrap();
        assert!(matches!(store.load("old").await, Err(EngineError::NotFound(_))));
        assert_eq!(store.load("new").await.unwrap()["name"], "new");
    }

    #[tokio::test]
    async fn test_save_without_name_is_config_error() {
        let dir = TempDir::new().unwrap();
        let store = ValidationSetStore::new(dir.path());
        let mut doc = document("x");
        doc["name"] = json!("  ");
        assert!(matches!(store.save(&doc).await, Err(EngineError::Config(_))));
    }
}

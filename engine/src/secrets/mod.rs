//! Credential store
//!
//! API keys come from two places: rows in the `api_keys` table (entered
//! through the UI or the CLI) and process environment variables. Stored rows
//! win. The store is an explicit object handed to registries and services at
//! construction time; nothing reads credentials from ambient globals.
//!
//! Lookups read an in-memory snapshot of the table. `refresh()` reloads it,
//! and the HTTP layer calls it before every request, so a key saved by one
//! request is visible to the next (last writer wins).

pub mod string;

pub use string::SecretString;

use crate::db::{ApiKey, ApiKeyRepository, DEFAULT_USER};
use regex::Regex;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

/// Credential name of the OpenAI key
pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";

/// Credential name of the Mistral key
pub const MISTRAL_API_KEY: &str = "MISTRAL_API_KEY";

/// Regex patterns for detecting common secret formats.
static SECRET_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();

/// Patterns match OpenAI-style keys (`sk-...`), Google keys (`AIza...`),
/// GitHub tokens (`ghp_...`) and bearer tokens.
fn get_secret_patterns() -> &'static Vec<Regex> {
    SECRET_PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"sk-[a-zA-Z0-9\-_]{20,}").expect("Invalid OpenAI pattern"),
            Regex::new(r"AIza[0-9A-Za-z\-_]{35}").expect("Invalid Google pattern"),
            Regex::new(r"ghp_[a-zA-Z0-9]{36}").expect("Invalid GitHub pattern"),
            Regex::new(r"Bearer\s+[^\s]{20,}").expect("Invalid Bearer pattern"),
        ]
    })
}

/// Replace every detected secret in `text` with `[REDACTED]`
///
/// # Examples
/// ```
/// use ragtime_engine::secrets::scrub;
///
/// let scrubbed = scrub("My API key is sk-1234567890abcdefghij");
/// assert_eq!(scrubbed, "My API key is [REDACTED]");
/// ```
pub fn scrub(text: &str) -> String {
    let mut result = text.to_string();
    for pattern in get_secret_patterns() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }
    result
}

/// Where environment lookups go
enum Environment {
    Process,
    Fixed(HashMap<String, String>),
}

impl Environment {
    fn get(&self, name: &str) -> Option<String> {
        let value = match self {
            Environment::Process => std::env::var(name).ok(),
            Environment::Fixed(vars) => vars.get(name).cloned(),
        };
        value.filter(|v| !v.trim().is_empty())
    }
}

/// Which cloud providers have a usable key
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderAvailability {
    pub openai: bool,
    pub mistral: bool,
}

/// API keys from the database snapshot, falling back to the environment
pub struct CredentialStore {
    repo: Option<ApiKeyRepository>,
    snapshot: RwLock<HashMap<String, SecretString>>,
    env: Environment,
}

impl CredentialStore {
    /// Store backed by the `api_keys` table and the process environment
    ///
    /// Call [`refresh`](Self::refresh) to load the initial snapshot.
    pub fn new(repo: ApiKeyRepository) -> Self {
        Self {
            repo: Some(repo),
            snapshot: RwLock::new(HashMap::new()),
            env: Environment::Process,
        }
    }

    /// Store that only reads the process environment
    pub fn env_only() -> Self {
        Self {
            repo: None,
            snapshot: RwLock::new(HashMap::new()),
            env: Environment::Process,
        }
    }

    /// Store that reads a fixed set of variables instead of the process environment
    pub fn with_environment(vars: HashMap<String, String>) -> Self {
        Self {
            repo: None,
            snapshot: RwLock::new(HashMap::new()),
            env: Environment::Fixed(vars),
        }
    }

    /// Use `repo` as the stored-key source
    pub fn with_repository(mut self, repo: ApiKeyRepository) -> Self {
        self.repo = Some(repo);
        self
    }

    /// Reload the snapshot from the database
    pub async fn refresh(&self) -> Result<(), EngineError> {
        let Some(repo) = &self.repo else {
            return Ok(());
        };

        let keys = repo
            .list(DEFAULT_USER)
            .await
            .map_err(|e| EngineError::Database(e.to_string()))?;

        let fresh: HashMap<String, SecretString> = keys
            .into_iter()
            .map(|k| (k.name, SecretString::new(k.value)))
            .collect();

        tracing::debug!("Credential snapshot refreshed ({} stored keys)", fresh.len());
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        Ok(())
    }

    /// Look up a key: stored value first, then the environment
    pub fn get_api_key(&self, name: &str) -> Option<SecretString> {
        {
            let snapshot = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
            if let Some(secret) = snapshot.get(name).filter(|s| !s.is_empty()) {
                return Some(secret.clone());
            }
        }

        self.env.get(name).map(SecretString::new)
    }

    pub fn has_api_key(&self, name: &str) -> bool {
        self.get_api_key(name).is_some()
    }

    /// Value of `name` in the environment, ignoring stored keys
    pub fn default_value(&self, name: &str) -> Option<String> {
        self.env.get(name)
    }

    /// Stored keys (not environment variables)
    pub fn stored(&self) -> Vec<(String, SecretString)> {
        let snapshot = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<(String, SecretString)> = snapshot
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        keys.sort_by(|a, b| a.0.cmp(&b.0));
        keys
    }

    pub fn availability(&self) -> ProviderAvailability {
        ProviderAvailability {
            openai: self.has_api_key(OPENAI_API_KEY),
            mistral: self.has_api_key(MISTRAL_API_KEY),
        }
    }

    /// Store or overwrite one key
    pub async fn set_api_key(&self, name: &str, value: &str) -> Result<(), EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::Config("API key name must not be empty".to_string()));
        }
        let repo = self.require_repo()?;
        repo.upsert(DEFAULT_USER, name, value)
            .await
            .map_err(|e| EngineError::Database(e.to_string()))?;

        tracing::info!("Stored API key '{}'", name);
        self.refresh().await
    }

    /// Delete one stored key
    pub async fn delete_api_key(&self, name: &str) -> Result<bool, EngineError> {
        let repo = self.require_repo()?;
        let existed = repo
            .delete(DEFAULT_USER, name)
            .await
            .map_err(|e| EngineError::Database(e.to_string()))?;

        self.refresh().await?;
        Ok(existed)
    }

    /// Replace the stored key set
    ///
    /// `deleted` names are dropped even when they also appear in `keys`.
    pub async fn replace_all(&self, keys: &[ApiKey], deleted: &[String]) -> Result<(), EngineError> {
        for key in keys {
            if key.name.trim().is_empty() {
                return Err(EngineError::Config("API key name must not be empty".to_string()));
            }
        }
        let kept: Vec<ApiKey> = keys
            .iter()
            .filter(|k| !deleted.contains(&k.name))
            .cloned()
            .collect();

        let repo = self.require_repo()?;
        repo.replace_all(DEFAULT_USER, &kept)
            .await
            .map_err(|e| EngineError::Database(e.to_string()))?;

        tracing::info!("Replaced stored API keys ({} kept, {} deleted)", kept.len(), deleted.len());
        self.refresh().await
    }

    fn require_repo(&self) -> Result<&ApiKeyRepository, EngineError> {
        self.repo.as_ref().ok_or_else(|| {
            EngineError::Config("No credential database configured".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_scrub_openai_key() {
        let scrubbed = scrub("auth failed for sk-proj-abcdefghijklmnopqrstuv");
        assert!(!scrubbed.contains("abcdefghij"));
        assert!(scrubbed.contains("[REDACTED]"));
    }

    #[test]
    fn test_scrub_leaves_plain_text() {
        assert_eq!(scrub("nothing secret here"), "nothing secret here");
    }

    #[test]
    fn test_environment_fallback() {
        let store = CredentialStore::with_environment(env(&[(OPENAI_API_KEY, "sk-env")]));

        assert_eq!(
            store.get_api_key(OPENAI_API_KEY).map(|s| s.unsecure().to_string()),
            Some("sk-env".to_string())
        );
        assert!(store.get_api_key(MISTRAL_API_KEY).is_none());
        assert_eq!(
            store.availability(),
            ProviderAvailability {
                openai: true,
                mistral: false
            }
        );
    }

    #[test]
    fn test_blank_environment_value_is_absent() {
        let store = CredentialStore::with_environment(env(&[(MISTRAL_API_KEY, "  ")]));
        assert!(!store.has_api_key(MISTRAL_API_KEY));
    }

    #[tokio::test]
    async fn test_stored_key_wins_over_environment() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("ragtime.db"))
            .await
            .unwrap();
        let store = CredentialStore::with_environment(env(&[(OPENAI_API_KEY, "sk-env")]))
            .with_repository(db.api_keys());

        store.set_api_key(OPENAI_API_KEY, "sk-stored").await.unwrap();
        assert_eq!(
            store.get_api_key(OPENAI_API_KEY).unwrap().unsecure(),
            "sk-stored"
        );
        assert_eq!(store.default_value(OPENAI_API_KEY).as_deref(), Some("sk-env"));

        store.delete_api_key(OPENAI_API_KEY).await.unwrap();
        assert_eq!(store.get_api_key(OPENAI_API_KEY).unwrap().unsecure(), "sk-env");
    }

    #[tokio::test]
    async fn test_refresh_sees_writes_from_another_store() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("ragtime.db"))
            .await
            .unwrap();
        let reader = CredentialStore::with_environment(HashMap::new()).with_repository(db.api_keys());
        let writer = CredentialStore::with_environment(HashMap::new()).with_repository(db.api_keys());

        writer.set_api_key(MISTRAL_API_KEY, "m-1").await.unwrap();
        assert!(!reader.has_api_key(MISTRAL_API_KEY));

        reader.refresh().await.unwrap();
        assert!(reader.has_api_key(MISTRAL_API_KEY));
    }

    #[tokio::test]
    async fn test_replace_all_honours_deleted_names() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("ragtime.db"))
            .await
            .unwrap();
        let store = CredentialStore::with_environment(HashMap::new()).with_repository(db.api_keys());

        let keys = vec![
            ApiKey {
                name: OPENAI_API_KEY.into(),
                value: "sk-1".into(),
            },
            ApiKey {
                name: MISTRAL_API_KEY.into(),
                value: "m-1".into(),
            },
        ];
        store
            .replace_all(&keys, &[MISTRAL_API_KEY.to_string()])
            .await
            .unwrap();

        let stored = store.stored();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].0, OPENAI_API_KEY);
    }

    #[tokio::test]
    async fn test_writes_without_database_fail() {
        let store = CredentialStore::with_environment(HashMap::new());
        let result = store.set_api_key(OPENAI_API_KEY, "x").await;
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}

//! Configuration management
//!
//! This module handles loading, validation, and management of the Ragtime
//! configuration. Configuration is stored in TOML format at ~/.ragtime/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: log level, data directory
//! - **storage**: where experiments, validation sets and step outputs live
//! - **retry**: attempt count and backoff for LLM calls
//! - **llm**: endpoints for the OpenAI, Mistral, Ollama and Albert backends
//! - **retriever**: search retriever endpoint
//! - **server**: bind address of the HTTP transport
//!
//! # Path Expansion
//!
//! `~` is expanded to the home directory, and relative storage directories
//! are resolved under `core.data_dir`.
//!
//! # Examples
//!
//! ```no_run
//! use ragtime_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Experiments: {:?}", config.storage.experiments_dir);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core settings
    pub core: CoreConfig,

    /// Document storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// LLM call retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// LLM backends
    #[serde(default)]
    pub llm: LLMConfig,

    /// Retrievers
    #[serde(default)]
    pub retriever: RetrieverConfig,

    /// HTTP transport
    #[serde(default)]
    pub server: ServerConfig,
}

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Storage directories; relative paths resolve under `core.data_dir`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_experiments_dir")]
    pub experiments_dir: PathBuf,

    #[serde(default = "default_validation_sets_dir")]
    pub validation_sets_dir: PathBuf,

    /// Default output folder of the answers pipeline step
    #[serde(default = "default_answers_dir")]
    pub answers_dir: PathBuf,

    /// Default output folder of the facts pipeline step
    #[serde(default = "default_facts_dir")]
    pub facts_dir: PathBuf,
}

/// Retry policy for LLM calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed delay between attempts, in seconds
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: f64,
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs_f64(self.backoff_secs.max(0.0))
    }
}

/// LLM backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    #[serde(default = "OpenAICompatConfig::openai")]
    pub openai: OpenAICompatConfig,

    #[serde(default = "OpenAICompatConfig::mistral")]
    pub mistral: OpenAICompatConfig,

    #[serde(default)]
    pub ollama: OllamaConfig,

    #[serde(default)]
    pub albert: AlbertConfig,
}

/// An OpenAI-compatible chat completions endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAICompatConfig {
    /// Base URL, e.g. https://api.openai.com/v1
    pub base_url: String,

    /// Credential name holding the API key
    pub api_key_name: String,

    /// Sampling temperature
    #[serde(default)]
    pub temperature: f32,
    // Note: the key itself lives in the credential store, never in config
}

impl OpenAICompatConfig {
    fn openai() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_name: "OPENAI_API_KEY".to_string(),
            temperature: 0.0,
        }
    }

    fn mistral() -> Self {
        Self {
            base_url: "https://api.mistral.ai/v1".to_string(),
            api_key_name: "MISTRAL_API_KEY".to_string(),
            temperature: 0.0,
        }
    }
}

impl Default for OpenAICompatConfig {
    fn default() -> Self {
        Self::openai()
    }
}

/// Ollama configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,
}

/// Albert (RAG model with a built-in retriever) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlbertConfig {
    #[serde(default = "default_albert_base_url")]
    pub base_url: String,

    /// Model served behind the Albert API
    #[serde(default = "default_albert_model")]
    pub model: String,

    /// Chunks requested per question
    #[serde(default = "default_albert_limit")]
    pub limit: u32,

    /// Credential name holding the bearer token
    #[serde(default = "default_albert_key_name")]
    pub api_key_name: String,
}

/// Retriever configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrieverConfig {
    #[serde(default)]
    pub search: SearchConfig,
}

/// Search retriever configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Search endpoint receiving `{query, folder_id, limit}`
    #[serde(default = "default_search_url")]
    pub url: String,

    /// Maximum chunks per query
    #[serde(default = "default_search_limit")]
    pub limit: u32,

    /// Credential name holding the bearer token
    #[serde(default = "default_search_key_name")]
    pub api_key_name: String,
}

/// HTTP transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.ragtime")
}

fn default_experiments_dir() -> PathBuf {
    PathBuf::from("expe/evals")
}

fn default_validation_sets_dir() -> PathBuf {
    PathBuf::from("expe/validation_sets")
}

fn default_answers_dir() -> PathBuf {
    PathBuf::from("expe/answers")
}

fn default_facts_dir() -> PathBuf {
    PathBuf::from("expe/facts")
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_secs() -> f64 {
    3.0
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_albert_base_url() -> String {
    "https://albert.etalab.gouv.fr/api/v2".to_string()
}

fn default_albert_model() -> String {
    "AgentPublic/albertlight-7b".to_string()
}

fn default_albert_limit() -> u32 {
    7
}

fn default_albert_key_name() -> String {
    "ALBERT_API_KEY".to_string()
}

fn default_search_url() -> String {
    "http://localhost:8000/search".to_string()
}

fn default_search_limit() -> u32 {
    10
}

fn default_search_key_name() -> String {
    "SEARCH_API_KEY".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            experiments_dir: default_experiments_dir(),
            validation_sets_dir: default_validation_sets_dir(),
            answers_dir: default_answers_dir(),
            facts_dir: default_facts_dir(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
        }
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            openai: OpenAICompatConfig::openai(),
            mistral: OpenAICompatConfig::mistral(),
            ollama: OllamaConfig::default(),
            albert: AlbertConfig::default(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_base_url(),
        }
    }
}

impl Default for AlbertConfig {
    fn default() -> Self {
        Self {
            base_url: default_albert_base_url(),
            model: default_albert_model(),
            limit: default_albert_limit(),
            api_key_name: default_albert_key_name(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            url: default_search_url(),
            limit: default_search_limit(),
            api_key_name: default_search_key_name(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.ragtime/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        // Serialize before processing so the file keeps the portable `~` paths
        let config = Self::default();
        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        let mut config = config;
        config.validate_and_process()?;
        Ok(config)
    }

    /// Get the default configuration file path (~/.ragtime/config.toml)
    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".ragtime").join("config.toml"))
    }

    /// Validate and process configuration
    ///
    /// Validates field ranges, expands `~` and resolves storage directories
    /// under the data directory.
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(EngineError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.retry.backoff_secs.is_finite() || self.retry.backoff_secs < 0.0 {
            return Err(EngineError::Config(
                "retry.backoff_secs must be a non-negative number".to_string(),
            ));
        }

        if self.server.port == 0 {
            return Err(EngineError::Config(
                "server.port must be between 1 and 65535".to_string(),
            ));
        }

        self.core.data_dir = expand_tilde(&self.core.data_dir)?;
        let data_dir = self.core.data_dir.clone();
        for dir in [
            &mut self.storage.experiments_dir,
            &mut self.storage.validation_sets_dir,
            &mut self.storage.answers_dir,
            &mut self.storage.facts_dir,
        ] {
            let expanded = expand_tilde(dir)?;
            *dir = if expanded.is_absolute() {
                expanded
            } else {
                data_dir.join(expanded)
            };
        }

        Ok(())
    }

    /// Path of the SQLite database holding API keys
    pub fn database_path(&self) -> PathBuf {
        self.core.data_dir.join("ragtime.db")
    }

    /// Configuration rooted at `data_dir`, for tests and throwaway runs
    pub fn with_data_dir(data_dir: &Path) -> Result<Self, EngineError> {
        let mut config = Self::default();
        config.core.data_dir = data_dir.to_path_buf();
        config.validate_and_process()?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            storage: StorageConfig::default(),
            retry: RetryConfig::default(),
            llm: LLMConfig::default(),
            retriever: RetrieverConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// Expand a leading `~` to the user's home directory
pub fn expand_tilde(path: &Path) -> Result<PathBuf, EngineError> {
    let Some(path_str) = path.to_str() else {
        return Ok(path.to_path_buf());
    };

    if path_str == "~" || path_str.starts_with("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;
        let rest = path_str.trim_start_matches('~').trim_start_matches('/');
        Ok(if rest.is_empty() { home } else { home.join(rest) })
    } else {
        Ok(path.to_path_buf())
    }
}

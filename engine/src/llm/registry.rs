//! LLM Registry
//!
//! Maps model names to provider factories. The registry is populated once at
//! startup from the configuration and the credential store; stage executors
//! resolve the names an experiment asks for into [`LLMHandle`]s.
//!
//! Names that were never registered are routed by prefix, so any model the
//! backends serve can be used without listing it first:
//!
//! | name              | backend                 |
//! |-------------------|-------------------------|
//! | `ollama/<model>`  | Ollama                  |
//! | `mistral...`      | Mistral (OpenAI-compat) |
//! | anything else     | OpenAI                  |

use super::albert::{AlbertProvider, ALBERT_LLM};
use super::ollama::{OllamaProvider, OLLAMA_PREFIX};
use super::openai::OpenAICompatProvider;
use super::{LLMError, LLMHandle, LLMProvider, Result, RetryPolicy};
use crate::config::Config;
use crate::secrets::CredentialStore;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds a provider for a model name
pub type ProviderFactory = Arc<dyn Fn(&str) -> Arc<dyn LLMProvider> + Send + Sync>;

/// A constructor parameter a model accepts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterInfo {
    pub name: String,
    pub required: bool,
    pub default: Option<Value>,
    #[serde(rename = "type")]
    pub kind: String,
}

impl ParameterInfo {
    pub fn optional(name: &str, default: Value, kind: &str) -> Self {
        Self {
            name: name.to_string(),
            required: false,
            default: Some(default),
            kind: kind.to_string(),
        }
    }
}

/// Entry of the available-models listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub built_in_retriever: bool,
    pub description: String,
    pub parameters: Vec<ParameterInfo>,
}

struct Registration {
    factory: ProviderFactory,
    info: ModelInfo,
}

/// Which backend an unregistered name is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Ollama,
    Mistral,
    OpenAI,
}

/// Route a model name by prefix
pub fn route_model(name: &str) -> Route {
    if name.starts_with(OLLAMA_PREFIX) {
        Route::Ollama
    } else if name.to_ascii_lowercase().starts_with("mistral") {
        Route::Mistral
    } else {
        Route::OpenAI
    }
}

pub struct LLMRegistry {
    entries: BTreeMap<String, Registration>,
    fallback: Option<ProviderFactory>,
    retry: RetryPolicy,
}

impl LLMRegistry {
    /// Empty registry; every resolved handle runs under `retry`
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            entries: BTreeMap::new(),
            fallback: None,
            retry,
        }
    }

    /// Register `factory` under `info.name`, replacing any previous entry
    pub fn register(&mut self, info: ModelInfo, factory: ProviderFactory) {
        tracing::debug!("Registered model {}", info.name);
        self.entries
            .insert(info.name.clone(), Registration { factory, info });
    }

    /// Factory used for names that were never registered
    pub fn set_fallback(&mut self, factory: ProviderFactory) {
        self.fallback = Some(factory);
    }

    /// Registry with the configured backends
    pub fn with_defaults(config: &Config, credentials: Arc<CredentialStore>) -> Self {
        let mut registry = Self::new(RetryPolicy::from_config(&config.retry));
        let temperature = |t: f32| {
            vec![ParameterInfo::optional(
                "temperature",
                Value::from(f64::from(t)),
                "float",
            )]
        };

        let albert = config.llm.albert.clone();
        let creds = credentials.clone();
        registry.register(
            ModelInfo {
                name: ALBERT_LLM.to_string(),
                built_in_retriever: true,
                description: format!("{} with its own document retrieval", albert.model),
                parameters: vec![ParameterInfo::optional(
                    "limit",
                    Value::from(albert.limit),
                    "int",
                )],
            },
            Arc::new(move |_: &str| {
                Arc::new(AlbertProvider::new(albert.clone(), creds.clone())) as Arc<dyn LLMProvider>
            }),
        );

        for (model, description) in [
            ("gpt-4o", "OpenAI GPT-4o"),
            ("gpt-4o-mini", "OpenAI GPT-4o mini"),
        ] {
            registry.register(
                ModelInfo {
                    name: model.to_string(),
                    built_in_retriever: false,
                    description: description.to_string(),
                    parameters: temperature(config.llm.openai.temperature),
                },
                openai_compat(config.llm.openai.clone(), credentials.clone()),
            );
        }

        for (model, description) in [
            ("mistral-large-latest", "Mistral Large"),
            ("mistral-small-latest", "Mistral Small"),
        ] {
            registry.register(
                ModelInfo {
                    name: model.to_string(),
                    built_in_retriever: false,
                    description: description.to_string(),
                    parameters: temperature(config.llm.mistral.temperature),
                },
                openai_compat(config.llm.mistral.clone(), credentials.clone()),
            );
        }

        let openai = openai_compat(config.llm.openai.clone(), credentials.clone());
        let mistral = openai_compat(config.llm.mistral.clone(), credentials);
        let ollama_url = config.llm.ollama.base_url.clone();
        registry.set_fallback(Arc::new(move |name: &str| match route_model(name) {
            Route::Ollama => {
                Arc::new(OllamaProvider::new(ollama_url.clone(), name)) as Arc<dyn LLMProvider>
            }
            Route::Mistral => mistral(name),
            Route::OpenAI => openai(name),
        }));

        registry
    }

    /// Handle for `name`: the registered factory, else the fallback
    pub fn resolve(&self, name: &str) -> Result<LLMHandle> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LLMError::UnknownModel("empty model name".to_string()));
        }

        let provider = match (self.entries.get(name), &self.fallback) {
            (Some(entry), _) => (entry.factory)(name),
            (None, Some(fallback)) => {
                tracing::debug!("Model {} not registered, routing by name", name);
                fallback(name)
            }
            (None, None) => return Err(LLMError::UnknownModel(name.to_string())),
        };
        Ok(LLMHandle::new(provider, self.retry.clone()))
    }

    /// Resolve several names, failing on the first unknown one
    pub fn resolve_all<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<LLMHandle>> {
        names.iter().map(|n| self.resolve(n.as_ref())).collect()
    }

    /// Registered models, sorted by name
    pub fn describe(&self) -> Vec<ModelInfo> {
        self.entries.values().map(|e| e.info.clone()).collect()
    }

    /// True when `name` retrieves its own context
    pub fn is_built_in_retriever(&self, name: &str) -> bool {
        match self.entries.get(name) {
            Some(entry) => entry.info.built_in_retriever,
            None => self
                .resolve(name)
                .map(|h| h.built_in_retriever())
                .unwrap_or(false),
        }
    }
}

fn openai_compat(
    config: crate::config::OpenAICompatConfig,
    credentials: Arc<CredentialStore>,
) -> ProviderFactory {
    Arc::new(move |name: &str| {
        Arc::new(OpenAICompatProvider::new(
            name,
            config.clone(),
            credentials.clone(),
        )) as Arc<dyn LLMProvider>
    })
}

//! Retriever capability
//!
//! A retriever fills a QA's chunk collection with passages relevant to its
//! question. Retrieval always replaces the previous chunks.

use async_trait::async_trait;
use sdk::model::QA;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod search;

pub use search::SearchRetriever;

/// Result type for retriever operations
pub type Result<T> = std::result::Result<T, RetrieverError>;

#[derive(Debug, thiserror::Error)]
pub enum RetrieverError {
    #[error("Retriever unavailable: {0}")]
    Unavailable(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Unknown retriever: {0}")]
    Unknown(String),
}

#[async_trait]
pub trait Retriever: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Replace `qa.chunks` with passages for `qa.question`
    async fn retrieve(&self, qa: &mut QA) -> Result<()>;
}

pub type RetrieverFactory = Arc<dyn Fn() -> Arc<dyn Retriever> + Send + Sync>;

/// Entry of the available-retrievers listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrieverInfo {
    pub name: String,
    pub description: String,
}

/// Retrievers by name, populated at startup
#[derive(Default)]
pub struct RetrieverRegistry {
    entries: BTreeMap<String, (RetrieverInfo, RetrieverFactory)>,
}

impl RetrieverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the configured search retriever
    pub fn with_defaults(
        config: &crate::config::Config,
        credentials: Arc<crate::secrets::CredentialStore>,
    ) -> Self {
        let mut registry = Self::new();
        let search = config.retriever.search.clone();
        registry.register(
            RetrieverInfo {
                name: search::SEARCH.to_string(),
                description: format!("Document search at {}", search.url),
            },
            Arc::new(move || {
                Arc::new(SearchRetriever::new(search.clone(), credentials.clone()))
                    as Arc<dyn Retriever>
            }),
        );
        registry
    }

    pub fn register(&mut self, info: RetrieverInfo, factory: RetrieverFactory) {
        self.entries.insert(info.name.clone(), (info, factory));
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Retriever>> {
        self.entries
            .get(name)
            .map(|(_, factory)| factory())
            .ok_or_else(|| RetrieverError::Unknown(name.to_string()))
    }

    pub fn describe(&self) -> Vec<RetrieverInfo> {
        self.entries.values().map(|(info, _)| info.clone()).collect()
    }
}

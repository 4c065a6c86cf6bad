//! LLM capability layer
//!
//! Every backend implements [`LLMProvider`]: given a [`Prompt`], produce text
//! in a single attempt. Stage executors never talk to providers directly; they
//! hold an [`LLMHandle`], which wraps a provider with a [`RetryPolicy`] and
//! turns the successful attempt into the persisted [`LLMAnswer`] record.
//!
//! Providers are resolved by model name through the [`LLMRegistry`].

use async_trait::async_trait;
use sdk::model::{Chunk, Chunks, LLMAnswer, Meta, Prompt};
use std::sync::Arc;

pub mod albert;
pub mod ollama;
pub mod openai;
pub mod registry;
pub mod retry;

pub use registry::{LLMRegistry, ModelInfo, ParameterInfo};
pub use retry::{Backoff, RetryPolicy, Sleeper, TokioSleeper};

/// Result type for LLM operations
pub type Result<T> = std::result::Result<T, LLMError>;

/// Errors that can occur during LLM operations
#[derive(Debug, thiserror::Error)]
pub enum LLMError {
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl LLMError {
    /// Whether another attempt can succeed
    ///
    /// Missing credentials and unknown models fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            LLMError::AuthenticationFailed(_) | LLMError::UnknownModel(_)
        )
    }

    pub(crate) fn from_reqwest(e: reqwest::Error, endpoint: &str) -> Self {
        if e.is_timeout() {
            LLMError::Timeout
        } else if e.is_connect() {
            LLMError::ProviderUnavailable(format!("Cannot connect to {}", endpoint))
        } else {
            LLMError::NetworkError(e.to_string())
        }
    }

    /// Map a non-success HTTP status to an error
    pub(crate) fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let body = crate::secrets::scrub(body);
        match status.as_u16() {
            401 | 403 => LLMError::AuthenticationFailed(body),
            429 => LLMError::RateLimitExceeded,
            500..=599 => LLMError::ProviderUnavailable(format!("{}: {}", status, body)),
            _ => LLMError::InvalidRequest(format!("{}: {}", status, body)),
        }
    }
}

/// Output of one successful provider call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,

    /// Model name as reported by the backend
    pub full_name: Option<String>,

    /// Per-call metadata (token usage, stream ids, ...)
    pub meta: Meta,

    /// Chunks the backend retrieved itself
    pub chunks: Option<Vec<Chunk>>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// LLM Provider trait that all backends implement
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Model identifier this provider answers for
    fn name(&self) -> &str;

    /// Display name recorded when the backend does not report one
    fn full_name(&self) -> &str {
        self.name()
    }

    /// One-line description for model listings
    fn description(&self) -> &str {
        ""
    }

    /// True when the backend retrieves its own context (RAG models)
    fn built_in_retriever(&self) -> bool {
        false
    }

    /// Run one completion attempt
    async fn complete(&self, prompt: &Prompt) -> Result<Completion>;
}

/// A provider plus the retry policy its calls run under
#[derive(Clone)]
pub struct LLMHandle {
    provider: Arc<dyn LLMProvider>,
    retry: RetryPolicy,
}

impl LLMHandle {
    pub fn new(provider: Arc<dyn LLMProvider>, retry: RetryPolicy) -> Self {
        Self { provider, retry }
    }

    pub fn name(&self) -> &str {
        self.provider.name()
    }

    pub fn built_in_retriever(&self) -> bool {
        self.provider.built_in_retriever()
    }

    /// Complete `prompt` under the retry policy
    ///
    /// `timestamp` and `duration` describe the attempt that succeeded; time
    /// spent in failed attempts and backoff sleeps is not counted.
    pub async fn complete(&self, prompt: Prompt) -> Result<LLMAnswer> {
        let provider = &self.provider;
        let prompt_ref = &prompt;
        let attempt = self
            .retry
            .run(provider.name(), move || provider.complete(prompt_ref))
            .await?;

        let completion = attempt.value;
        let name = self.name().to_string();
        Ok(LLMAnswer {
            full_name: completion
                .full_name
                .unwrap_or_else(|| self.provider.full_name().to_string()),
            name,
            text: completion.text,
            prompt: Some(prompt),
            meta: completion.meta,
            timestamp: Some(attempt.started_at),
            duration: attempt.duration.as_secs_f64(),
            chunks: completion.chunks.map(Chunks::new),
        })
    }
}

//! Ollama LLM Provider
//!
//! Models served by a local Ollama daemon, addressed as `ollama/<model>`
//! (e.g. `ollama/llama3.1:8b`). No API key is involved.

use async_trait::async_trait;
use reqwest::Client;
use sdk::model::{Meta, Prompt};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{Completion, LLMError, LLMProvider, Result};

/// Name prefix routed to Ollama
pub const OLLAMA_PREFIX: &str = "ollama/";

#[derive(Debug, Clone)]
pub struct OllamaProvider {
    /// Registry name, including the `ollama/` prefix
    name: String,

    /// Base URL for Ollama API (typically http://localhost:11434)
    base_url: String,

    client: Client,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            client: Client::builder()
                .timeout(Duration::from_secs(300))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Model name as Ollama knows it
    fn model(&self) -> &str {
        self.name.strip_prefix(OLLAMA_PREFIX).unwrap_or(&self.name)
    }

    fn messages(prompt: &Prompt) -> Vec<OllamaMessage> {
        let mut messages = Vec::with_capacity(2);
        if !prompt.system().is_empty() {
            messages.push(OllamaMessage {
                role: "system".to_string(),
                content: prompt.system().to_string(),
            });
        }
        messages.push(OllamaMessage {
            role: "user".to_string(),
            content: prompt.user().to_string(),
        });
        messages
    }
}

#[async_trait]
impl LLMProvider for OllamaProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, prompt: &Prompt) -> Result<Completion> {
        let request = OllamaRequest {
            model: self.model().to_string(),
            messages: Self::messages(prompt),
            stream: false,
        };

        tracing::debug!(
            "Ollama request: model={}, total_chars={}",
            request.model,
            request.messages.iter().map(|m| m.content.len()).sum::<usize>()
        );

        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LLMError::from_reqwest(e, &self.base_url))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(LLMError::UnknownModel(format!(
                    "{} ({})",
                    self.model(),
                    error_text
                )));
            }
            return Err(LLMError::from_status(status, &error_text));
        }

        let ollama_response: OllamaResponse = response
            .json()
            .await
            .map_err(|e| LLMError::ParseError(format!("Failed to parse Ollama response: {}", e)))?;

        let mut meta = Meta::new();
        if let Some(count) = ollama_response.eval_count {
            meta.insert("eval_count".to_string(), count.into());
        }

        Ok(Completion {
            text: ollama_response.message.content,
            full_name: ollama_response.model,
            meta,
            chunks: None,
        })
    }
}

/// Ollama API request format
#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
}

/// Ollama message format
#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

/// Ollama API response format
#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: OllamaMessage,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    eval_count: Option<u64>,
}

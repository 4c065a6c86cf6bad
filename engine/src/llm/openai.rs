//! OpenAI-compatible chat completions provider
//!
//! Serves OpenAI and Mistral: both expose `POST {base_url}/chat/completions`
//! with the same request and response shapes and a bearer token.

use super::{Completion, LLMError, LLMProvider, Result};
use crate::config::OpenAICompatConfig;
use crate::secrets::CredentialStore;
use async_trait::async_trait;
use sdk::model::{Meta, Prompt};
use serde_json::{json, Value};
use std::sync::Arc;

pub struct OpenAICompatProvider {
    model: String,
    config: OpenAICompatConfig,
    credentials: Arc<CredentialStore>,
    client: reqwest::Client,
}

impl OpenAICompatProvider {
    pub fn new(
        model: impl Into<String>,
        config: OpenAICompatConfig,
        credentials: Arc<CredentialStore>,
    ) -> Self {
        Self {
            model: model.into(),
            config,
            credentials,
            client: reqwest::Client::new(),
        }
    }

    fn payload(&self, prompt: &Prompt) -> Value {
        let mut messages = Vec::new();
        if !prompt.system().is_empty() {
            messages.push(json!({"role": "system", "content": prompt.system()}));
        }
        messages.push(json!({"role": "user", "content": prompt.user()}));

        json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.config.temperature,
        })
    }
}

#[async_trait]
impl LLMProvider for OpenAICompatProvider {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &Prompt) -> Result<Completion> {
        let api_key = self
            .credentials
            .get_api_key(&self.config.api_key_name)
            .ok_or_else(|| {
                LLMError::AuthenticationFailed(format!(
                    "{} is not set",
                    self.config.api_key_name
                ))
            })?;

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key.unsecure()))
            .header("Content-Type", "application/json")
            .json(&self.payload(prompt))
            .send()
            .await
            .map_err(|e| LLMError::from_reqwest(e, &self.config.base_url))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(LLMError::from_status(status, &text));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| LLMError::ParseError(e.to_string()))?;

        let message = data
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|choice| choice.get("message"))
            .ok_or_else(|| LLMError::ParseError("No choices in response".to_string()))?;

        let content = message
            .get("content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| LLMError::ParseError("Empty content".to_string()))?;

        let mut meta = Meta::new();
        if let Some(usage) = data.get("usage") {
            meta.insert("usage".to_string(), usage.clone());
        }

        Ok(Completion {
            text: content.to_string(),
            full_name: data.get("model").and_then(|m| m.as_str()).map(String::from),
            meta,
            chunks: None,
        })
    }
}

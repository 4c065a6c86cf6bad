//! Document search retriever
//!
//! `POST {url}?query=...&folder_id=...&limit=...` with an empty JSON body. The
//! folder comes from the question's `folder_id` meta when present. Results
//! arrive as `{"chunks": [{"content": ..., "score": ..., "meta": {...}}]}`.

use super::{Result, Retriever, RetrieverError};
use crate::config::SearchConfig;
use crate::secrets::CredentialStore;
use async_trait::async_trait;
use sdk::model::{Chunk, Meta, QA};
use serde_json::{json, Value};
use std::sync::Arc;

/// Registry name of the search retriever
pub const SEARCH: &str = "Search";

pub struct SearchRetriever {
    config: SearchConfig,
    credentials: Arc<CredentialStore>,
    client: reqwest::Client,
}

impl SearchRetriever {
    pub fn new(config: SearchConfig, credentials: Arc<CredentialStore>) -> Self {
        Self {
            config,
            credentials,
            client: reqwest::Client::new(),
        }
    }

    fn params(&self, qa: &QA) -> Vec<(&'static str, String)> {
        let mut params = vec![("query", qa.question.text.clone())];
        if let Some(folder) = qa.question.meta.get("folder_id") {
            let folder = match folder {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            params.push(("folder_id", folder));
        }
        params.push(("limit", self.config.limit.to_string()));
        params
    }
}

#[async_trait]
impl Retriever for SearchRetriever {
    fn name(&self) -> &str {
        SEARCH
    }

    fn description(&self) -> &str {
        "Semantic document search"
    }

    async fn retrieve(&self, qa: &mut QA) -> Result<()> {
        let mut request = self
            .client
            .post(&self.config.url)
            .query(&self.params(qa))
            .json(&json!({}));
        if let Some(token) = self.credentials.get_api_key(&self.config.api_key_name) {
            request = request.bearer_auth(token.unsecure());
        }

        let response = request
            .send()
            .await
            .map_err(|e| RetrieverError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(RetrieverError::AuthenticationFailed(format!(
                "{} rejected the token in {}",
                self.config.url, self.config.api_key_name
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RetrieverError::Unavailable(format!(
                "{}: {}",
                status,
                crate::secrets::scrub(&body)
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| RetrieverError::InvalidResponse(e.to_string()))?;

        let results = body
            .get("chunks")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let chunks: Vec<Chunk> = results
            .iter()
            .enumerate()
            .filter_map(|(i, result)| {
                let chunk = chunk_from_result(result);
                if chunk.is_none() {
                    tracing::warn!("Skipping search result {} without usable content", i + 1);
                }
                chunk
            })
            .collect();

        tracing::debug!("Retrieved {} chunk(s) for '{}'", chunks.len(), qa.question.text);
        qa.chunks = chunks.into();
        Ok(())
    }
}

/// Map one search result to a chunk; `None` when it carries no content
pub fn chunk_from_result(result: &Value) -> Option<Chunk> {
    let mut meta = Meta::new();
    let text = match result.get("content")? {
        Value::Object(content) => {
            meta.insert(
                "content_type".into(),
                content
                    .get("content_type")
                    .cloned()
                    .unwrap_or_else(|| Value::from("unknown")),
            );
            content
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        }
        Value::String(text) => {
            meta.insert("content_type".into(), Value::from("text"));
            text.clone()
        }
        _ => return None,
    };

    let source = result.get("meta").and_then(Value::as_object);
    let source_field = |key: &str| {
        source
            .and_then(|m| m.get(key))
            .cloned()
            .unwrap_or_else(|| Value::from(""))
    };

    meta.insert(
        "score".into(),
        result.get("score").cloned().unwrap_or_else(|| Value::from(0)),
    );
    meta.insert("display_name".into(), source_field("path"));
    meta.insert("page_number".into(), source_field("page"));

    if let Some(source) = source {
        for (key, value) in source {
            if key != "explanation" {
                meta.insert(key.clone(), value.clone());
            }
        }
    }

    Some(Chunk { text, meta })
}

//! Albert RAG provider
//!
//! Albert retrieves its own context, so a single completion is four calls:
//!
//! 1. `POST /stream` opens a stream for the query and returns its id
//! 2. `GET /stream/{id}/start` yields the answer as `data: "<json string>"` lines
//!    until `data: "[DONE]"`
//! 3. `GET /stream/{id}` lists the `rag_sources` the answer drew on
//! 4. `GET /get_chunk/{source}` returns each source passage
//!
//! The passages are returned as the completion's chunks.

use super::{Completion, LLMError, LLMProvider, Result};
use crate::config::AlbertConfig;
use crate::secrets::CredentialStore;
use async_trait::async_trait;
use sdk::model::{Chunk, Meta, Prompt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Model name the registry exposes Albert under
pub const ALBERT_LLM: &str = "Albert_LLM";

const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Serialize)]
struct StreamRequest<'a> {
    query: &'a str,
    model_name: &'a str,
    mode: &'static str,
    with_history: bool,
    limit: u32,
}

#[derive(Debug, Deserialize)]
struct StreamCreated {
    id: Value,
}

#[derive(Debug, Deserialize)]
struct StreamData {
    #[serde(default)]
    rag_sources: Vec<Value>,
}

pub struct AlbertProvider {
    config: AlbertConfig,
    credentials: Arc<CredentialStore>,
    client: reqwest::Client,
}

impl AlbertProvider {
    pub fn new(config: AlbertConfig, credentials: Arc<CredentialStore>) -> Self {
        Self {
            config,
            credentials,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn bearer(&self) -> Result<String> {
        self.credentials
            .get_api_key(&self.config.api_key_name)
            .map(|key| format!("Bearer {}", key.unsecure()))
            .ok_or_else(|| {
                LLMError::AuthenticationFailed(format!("{} is not set", self.config.api_key_name))
            })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .header("Authorization", self.bearer()?)
            .send()
            .await
            .map_err(|e| LLMError::from_reqwest(e, &self.config.base_url))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(LLMError::from_status(status, &text));
        }
        Ok(response)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.client.get(self.url(path)))
            .await?
            .json()
            .await
            .map_err(|e| LLMError::ParseError(format!("{}: {}", path, e)))
    }

    async fn create_stream(&self, query: &str) -> Result<String> {
        let request = StreamRequest {
            query,
            model_name: &self.config.model,
            mode: "rag",
            with_history: false,
            limit: self.config.limit,
        };
        let created: StreamCreated = self
            .send(self.client.post(self.url("stream")).json(&request))
            .await?
            .json()
            .await
            .map_err(|e| LLMError::ParseError(e.to_string()))?;

        Ok(id_string(&created.id))
    }

    async fn fetch_stream(&self, stream_id: &str) -> Result<String> {
        let body = self
            .send(self.client.get(self.url(&format!("stream/{}/start", stream_id))))
            .await?
            .text()
            .await
            .map_err(|e| LLMError::NetworkError(e.to_string()))?;

        parse_event_stream(&body)
    }
}

#[async_trait]
impl LLMProvider for AlbertProvider {
    fn name(&self) -> &str {
        ALBERT_LLM
    }

    fn full_name(&self) -> &str {
        &self.config.model
    }

    fn description(&self) -> &str {
        "Albert RAG model; retrieves its own sources"
    }

    fn built_in_retriever(&self) -> bool {
        true
    }

    async fn complete(&self, prompt: &Prompt) -> Result<Completion> {
        let stream_id = self.create_stream(prompt.user()).await?;
        let text = self.fetch_stream(&stream_id).await?;

        let data: StreamData = self.get_json(&format!("stream/{}", stream_id)).await?;
        let mut chunks = Vec::with_capacity(data.rag_sources.len());
        for source in &data.rag_sources {
            let raw: Value = self
                .get_json(&format!("get_chunk/{}", id_string(source)))
                .await?;
            chunks.push(chunk_from_json(raw));
        }

        tracing::debug!("Albert stream {} returned {} chunks", stream_id, chunks.len());

        let mut meta = Meta::new();
        meta.insert("stream_id".to_string(), Value::String(stream_id));

        Ok(Completion {
            text,
            full_name: Some(self.config.model.clone()),
            meta,
            chunks: Some(chunks),
        })
    }
}

fn id_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Concatenate the JSON string payloads of `data:` lines up to the done marker
fn parse_event_stream(body: &str) -> Result<String> {
    let mut answer = String::new();
    for line in body.lines() {
        let Some((_, data)) = line.split_once("data: ") else {
            continue;
        };
        let piece: String = serde_json::from_str(data)
            .map_err(|e| LLMError::ParseError(format!("bad stream line '{}': {}", data, e)))?;
        if piece == DONE_MARKER {
            break;
        }
        answer.push_str(&piece);
    }
    Ok(answer)
}

/// Source passage as a chunk: `text` (or `content`) plus everything else as meta
fn chunk_from_json(raw: Value) -> Chunk {
    let Value::Object(mut fields) = raw else {
        return Chunk::new(id_string(&raw));
    };
    let text = fields
        .remove("text")
        .or_else(|| fields.remove("content"))
        .map(|v| id_string(&v))
        .unwrap_or_default();
    Chunk { text, meta: fields }
}

//! Contract for the external LLM collaborator.
//!
//! The memory engine never talks to a model provider directly; it depends
//! on two independent, optional capabilities instead of one duck-typed
//! client probed with `hasattr`. Callers branch on presence, not
//! attribute probing.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Role in a chat conversation fed to the LLM.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }
}

/// Reply from a `chat` call. `reasoning` and token counts are best-effort —
/// absent when the backend doesn't report them.
#[derive(Debug, Clone, Default)]
pub struct ChatReply {
    pub text: String,
    pub reasoning: Option<String>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

/// Capability to turn a message list into a text reply.
#[async_trait]
pub trait ChatCapability: Send + Sync {
    async fn chat(&self, messages: &[ChatTurn]) -> Result<ChatReply>;
}

/// Capability to turn text into embedding vectors. Implementations return
/// an empty outer vector on total failure rather than propagating — the
/// engine treats embedding failure as a transient, recoverable condition
/// and degrades to a safe default, never a panic or an unhandled error
/// bubbling into the conversation loop.
#[async_trait]
pub trait EmbeddingCapability: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// OpenAI-compatible HTTP client implementing both capabilities. Works
/// against any `/v1/chat/completions` + `/v1/embeddings` compatible
/// endpoint (OpenAI, many local servers, OpenRouter-style gateways).
#[derive(Debug, Clone)]
pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    chat_model: String,
    embedding_model: String,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, chat_model: impl Into<String>, embedding_model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            api_key: None,
            chat_model: chat_model.into(),
            embedding_model: embedding_model.into(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait]
impl ChatCapability for HttpLlmClient {
    async fn chat(&self, messages: &[ChatTurn]) -> Result<ChatReply> {
        let payload = json!({
            "model": self.chat_model,
            "messages": messages,
        });

        let request = self.authed(self.client.post(self.endpoint("v1/chat/completions")));
        let response = request
            .json(&payload)
            .send()
            .await
            .context("chat request failed")?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.context("chat response was not JSON")?;
        if !status.is_success() {
            anyhow::bail!("chat endpoint returned {status}: {body}");
        }

        let text = body
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .unwrap_or_default()
            .to_string();

        let usage = body.get("usage");
        let input_tokens = usage.and_then(|u| u.get("prompt_tokens")).and_then(|v| v.as_u64()).map(|v| v as u32);
        let output_tokens = usage.and_then(|u| u.get("completion_tokens")).and_then(|v| v.as_u64()).map(|v| v as u32);

        Ok(ChatReply { text, reasoning: None, input_tokens, output_tokens })
    }
}

#[async_trait]
impl EmbeddingCapability for HttpLlmClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let payload = json!({
            "model": self.embedding_model,
            "input": texts,
        });

        let request = self.authed(self.client.post(self.endpoint("v1/embeddings")));
        let response = request
            .json(&payload)
            .send()
            .await
            .context("embedding request failed")?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.context("embedding response was not JSON")?;
        if !status.is_success() {
            anyhow::bail!("embeddings endpoint returned {status}: {body}");
        }

        let data = body.get("data").and_then(|d| d.as_array()).cloned().unwrap_or_default();
        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            let vector = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_f64())
                        .map(|v| v as f32)
                        .collect::<Vec<f32>>()
                })
                .unwrap_or_default();
            vectors.push(vector);
        }

        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_turn_constructors_set_role() {
        let turn = ChatTurn::user("hello");
        assert_eq!(turn.role, ChatRole::User);
        assert_eq!(turn.content, "hello");
    }

    #[test]
    fn endpoint_joins_base_url_and_path_cleanly() {
        let client = HttpLlmClient::new("http://localhost:8080/", "chat-model", "embed-model");
        assert_eq!(client.endpoint("/v1/chat/completions"), "http://localhost:8080/v1/chat/completions");
    }
}

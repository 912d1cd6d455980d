//! Remote daemon backend (Ollama).
//!
//! Stateless: each query names the model and the daemon loads it on demand.
//! Uses the native `/api/chat` endpoint with `stream: false` and unwraps the
//! reply from its `message.content` envelope.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::RemoteConfig;

/// Async seam over the remote daemon so the dispatcher can be tested without a server.
#[async_trait]
pub trait RemoteGenerator: Send + Sync {
    async fn chat(&self, model: &str, prompt: &str, max_tokens: u32) -> anyhow::Result<String>;

    async fn list_models(&self) -> anyhow::Result<Vec<String>>;
}

/// Ollama chat request (native API format, not OpenAI-compatible).
#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaModelTag>,
}

#[derive(Debug, Deserialize)]
struct OllamaModelTag {
    name: String,
}

/// HTTP client for an Ollama daemon.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .connect_timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    pub fn from_config(config: &RemoteConfig) -> Self {
        Self::new(&config.url, config.timeout_secs)
    }
}

#[async_trait]
impl RemoteGenerator for OllamaClient {
    async fn chat(&self, model: &str, prompt: &str, max_tokens: u32) -> anyhow::Result<String> {
        let url = format!("{}/api/chat", self.base_url);
        let body = OllamaChatRequest {
            model,
            messages: vec![OllamaMessage {
                role: "user",
                content: prompt,
            }],
            stream: false,
            options: OllamaOptions {
                num_predict: max_tokens,
            },
        };

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Ollama daemon unreachable at {}", self.base_url))?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            anyhow::bail!("Ollama returned status {status}: {}", detail.trim());
        }

        let chat: OllamaChatResponse = resp
            .json()
            .await
            .context("Ollama returned a malformed chat response")?;
        Ok(chat.message.content)
    }

    async fn list_models(&self) -> anyhow::Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Ollama daemon unreachable at {}", self.base_url))?;
        if !resp.status().is_success() {
            anyhow::bail!("Ollama returned status {}", resp.status());
        }
        let tags: OllamaTagsResponse = resp
            .json()
            .await
            .context("Ollama returned a malformed tag list")?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

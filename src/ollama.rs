use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::models::{Message, Role};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl From<Role> for ChatRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => ChatRole::User,
            Role::Assistant => ChatRole::Assistant,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role.into(),
            content: message.content.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChatOptions {
    pub num_predict: usize,
    pub temperature: f32,
}

#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let input = text.trim();
        if input.is_empty() {
            anyhow::bail!("cannot embed empty text input");
        }

        // /api/embed is current; /api/embeddings is kept for older servers.
        match self.embed_current(model, input).await {
            Ok(vector) => Ok(vector),
            Err(current_err) => {
                tracing::debug!("ollama /api/embed failed, trying legacy route: {current_err:#}");
                self.embed_legacy(model, input).await.map_err(|legacy_err| {
                    anyhow::anyhow!(
                        "ollama embedding failed via /api/embed ({current_err}) and \
                         /api/embeddings ({legacy_err}); is `{model}` pulled?"
                    )
                })
            }
        }
    }

    async fn embed_current(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        #[derive(Serialize)]
        struct EmbedReq<'a> {
            model: &'a str,
            input: &'a str,
        }

        #[derive(Deserialize)]
        struct EmbedResp {
            embeddings: Vec<Vec<f32>>,
        }

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .json(&EmbedReq { model, input: text })
            .send()
            .await
            .context("failed to call ollama /api/embed")?;

        let response: EmbedResp = decode_json(response, "/api/embed").await?;
        response
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("ollama /api/embed returned no embeddings"))
    }

    async fn embed_legacy(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        #[derive(Serialize)]
        struct EmbeddingReq<'a> {
            model: &'a str,
            prompt: &'a str,
        }

        #[derive(Deserialize)]
        struct EmbeddingResp {
            embedding: Vec<f32>,
        }

        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&EmbeddingReq {
                model,
                prompt: text,
            })
            .send()
            .await
            .context("failed to call ollama /api/embeddings")?;

        let response: EmbeddingResp = decode_json(response, "/api/embeddings").await?;
        Ok(response.embedding)
    }

    /// Non-streaming chat completion; returns the assistant reply.
    pub async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: ChatOptions,
    ) -> Result<String> {
        #[derive(Serialize)]
        struct ChatReq<'a> {
            model: &'a str,
            messages: &'a [ChatMessage],
            stream: bool,
            options: ChatReqOptions,
        }

        #[derive(Serialize)]
        struct ChatReqOptions {
            num_predict: usize,
            temperature: f32,
        }

        #[derive(Deserialize)]
        struct ChatResp {
            message: ChatMessage,
        }

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&ChatReq {
                model,
                messages,
                stream: false,
                options: ChatReqOptions {
                    num_predict: options.num_predict,
                    temperature: options.temperature,
                },
            })
            .send()
            .await
            .context("failed to call ollama /api/chat")?;

        let response: ChatResp = decode_json(response, "/api/chat").await?;
        Ok(response.message.content.trim().to_string())
    }
}

async fn decode_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    route: &str,
) -> Result<T> {
    if response.status() != StatusCode::OK {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("ollama {route} returned {status}: {}", normalize_err_body(&body));
    }

    response
        .json::<T>()
        .await
        .with_context(|| format!("failed to decode ollama {route} response"))
}

fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    serde_json::from_str::<serde_json::Value>(trimmed)
        .ok()
        .and_then(|json| json.get("error").and_then(|v| v.as_str()).map(str::to_string))
        .unwrap_or_else(|| trimmed.to_string())
}

//! Locally hosted Ollama backend (native /api endpoints)

use super::{Completion, Message, ProviderSettings, Role, ToolCall, ToolSpec, Usage};
use crate::error::ProviderError;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
    dimension: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: String,
    message: ChatMessage,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Debug, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunction,
}

#[derive(Debug, Deserialize)]
struct OllamaFunction {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaClient {
    pub fn new(settings: &ProviderSettings, client: Client) -> Self {
        Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            dimension: settings.dimension,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn to_api_messages(messages: &[Message]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                };
                let mut value = serde_json::json!({"role": role, "content": m.content});
                if !m.tool_calls.is_empty() {
                    let calls: Vec<serde_json::Value> = m
                        .tool_calls
                        .iter()
                        .map(|tc| {
                            serde_json::json!({
                                "function": {
                                    "name": tc.name,
                                    "arguments": serde_json::from_str::<serde_json::Value>(&tc.arguments)
                                        .unwrap_or_else(|_| serde_json::json!({})),
                                }
                            })
                        })
                        .collect();
                    value["tool_calls"] = serde_json::json!(calls);
                }
                value
            })
            .collect()
    }

    async fn post(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, endpoint))
            .json(body)
            .send()
            .await?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, endpoint, body = %error_body, "Ollama returned error");
            return Err(ProviderError::from_status(status, error_body));
        }
        Ok(response)
    }

    pub async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<Completion, ProviderError> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": Self::to_api_messages(messages),
            "stream": false,
        });
        if !tools.is_empty() {
            let api_tools: Vec<serde_json::Value> = tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = serde_json::json!(api_tools);
        }

        debug!(model = %self.model, messages = messages.len(), "Sending chat request");
        let parsed: ChatResponse = self
            .post("/api/chat", &body)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("malformed chat response: {}", e)))?;

        // Ollama does not assign call ids; positions keep them unique per turn
        let tool_calls = parsed
            .message
            .tool_calls
            .into_iter()
            .enumerate()
            .map(|(i, tc)| ToolCall {
                id: format!("call_{}", i),
                name: tc.function.name,
                arguments: tc.function.arguments.to_string(),
            })
            .collect();

        Ok(Completion {
            text: parsed.message.content,
            tool_calls,
            model: if parsed.model.is_empty() {
                self.model.clone()
            } else {
                parsed.model
            },
            usage: match (parsed.prompt_eval_count, parsed.eval_count) {
                (Some(prompt), Some(completion)) => Some(Usage {
                    prompt_tokens: prompt,
                    completion_tokens: completion,
                }),
                _ => None,
            },
        })
    }

    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        if let Some(dimension) = self.dimension {
            body["dimensions"] = serde_json::json!(dimension);
        }

        debug!(model = %self.model, count = texts.len(), "Sending embed request");
        let parsed: EmbedResponse = self
            .post("/api/embed", &body)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("malformed embed response: {}", e)))?;
        Ok(parsed.embeddings)
    }
}

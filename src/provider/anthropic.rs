//! Anthropic Messages API backend (completion only)

use super::{Completion, Message, ProviderSettings, Role, ToolCall, ToolSpec, Usage};
use crate::error::ProviderError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    client: Client,
    messages_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    model: String,
    content: Vec<ContentBlock>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}

impl AnthropicClient {
    pub fn new(settings: &ProviderSettings, client: Client) -> Self {
        let base = settings.base_url.trim_end_matches('/');
        let messages_url = if base.ends_with("/v1") {
            format!("{}/messages", base)
        } else {
            format!("{}/v1/messages", base)
        };
        Self {
            client,
            messages_url,
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            max_tokens: settings.max_tokens.max(1),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Split system text out and fold consecutive tool results into one user turn
    fn to_api_messages(messages: &[Message]) -> (Option<String>, Vec<ApiMessage>) {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut result: Vec<ApiMessage> = Vec::new();

        for msg in messages {
            match msg.role {
                Role::System => system_parts.push(&msg.content),
                Role::User => result.push(ApiMessage {
                    role: "user",
                    content: vec![ContentBlock::Text {
                        text: msg.content.clone(),
                    }],
                }),
                Role::Assistant => {
                    let mut blocks = Vec::new();
                    if !msg.content.is_empty() {
                        blocks.push(ContentBlock::Text {
                            text: msg.content.clone(),
                        });
                    }
                    for tc in &msg.tool_calls {
                        blocks.push(ContentBlock::ToolUse {
                            id: tc.id.clone(),
                            name: tc.name.clone(),
                            input: serde_json::from_str(&tc.arguments)
                                .unwrap_or_else(|_| serde_json::json!({})),
                        });
                    }
                    result.push(ApiMessage {
                        role: "assistant",
                        content: blocks,
                    });
                }
                Role::Tool => {
                    let block = ContentBlock::ToolResult {
                        tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                        content: msg.content.clone(),
                    };
                    match result.last_mut() {
                        Some(last)
                            if last.role == "user"
                                && last
                                    .content
                                    .iter()
                                    .all(|b| matches!(b, ContentBlock::ToolResult { .. })) =>
                        {
                            last.content.push(block)
                        }
                        _ => result.push(ApiMessage {
                            role: "user",
                            content: vec![block],
                        }),
                    }
                }
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (system, result)
    }

    pub async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<Completion, ProviderError> {
        let (system, api_messages) = Self::to_api_messages(messages);
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": api_messages,
            "max_tokens": self.max_tokens,
        });
        if let Some(system) = system {
            body["system"] = serde_json::json!(system);
        }
        if !tools.is_empty() {
            let api_tools: Vec<serde_json::Value> = tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = serde_json::json!(api_tools);
        }

        debug!(model = %self.model, messages = messages.len(), "Sending completion request");
        let mut request = self
            .client
            .post(&self.messages_url)
            .header("anthropic-version", ANTHROPIC_VERSION);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }
        let response = request.json(&body).send().await?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Anthropic API error");
            return Err(ProviderError::from_status(status, error_body));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("malformed messages response: {}", e)))?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in parsed.content {
            match block {
                ContentBlock::Text { text: t } => text.push_str(&t),
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: input.to_string(),
                }),
                ContentBlock::ToolResult { .. } | ContentBlock::Unknown => {}
            }
        }

        Ok(Completion {
            text,
            tool_calls,
            model: if parsed.model.is_empty() {
                self.model.clone()
            } else {
                parsed.model
            },
            usage: parsed.usage.map(|u| Usage {
                prompt_tokens: u.input_tokens,
                completion_tokens: u.output_tokens,
            }),
        })
    }

    pub async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Err(ProviderError::InvalidRequest(
            "the Anthropic backend does not produce embeddings".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderKind;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> AnthropicClient {
        let settings = ProviderSettings {
            kind: ProviderKind::Anthropic,
            base_url: server.uri(),
            model: "claude-test".to_string(),
            api_key: Some("ak-test".to_string()),
            timeout: Duration::from_secs(5),
            max_tokens: 512,
            dimension: None,
        };
        AnthropicClient::new(&settings, Client::new())
    }

    #[test]
    fn test_tool_results_fold_into_one_user_turn() {
        let messages = vec![
            Message::system("be brief"),
            Message::user("who owns it?"),
            Message::assistant_with_tools(
                "",
                vec![
                    ToolCall {
                        id: "t1".into(),
                        name: "retrieve_persons".into(),
                        arguments: "{}".into(),
                    },
                    ToolCall {
                        id: "t2".into(),
                        name: "retrieve_properties".into(),
                        arguments: "{}".into(),
                    },
                ],
            ),
            Message::tool_result("t1", "[]"),
            Message::tool_result("t2", "[]"),
        ];
        let (system, api) = AnthropicClient::to_api_messages(&messages);
        assert_eq!(system.as_deref(), Some("be brief"));
        assert_eq!(api.len(), 3);
        assert_eq!(api[2].role, "user");
        assert_eq!(api[2].content.len(), 2);
    }

    #[tokio::test]
    async fn test_complete_maps_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "ak-test"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .and(body_partial_json(serde_json::json!({"system": "sys"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "claude-test",
                "content": [
                    {"type": "text", "text": "Looking up"},
                    {"type": "tool_use", "id": "tu_1", "name": "retrieve_cities", "input": {"country": "Spain"}}
                ],
                "usage": {"input_tokens": 7, "output_tokens": 2}
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let completion = client
            .complete(&[Message::system("sys"), Message::user("cities?")], &[])
            .await
            .unwrap();
        assert_eq!(completion.text, "Looking up");
        assert_eq!(completion.tool_calls[0].name, "retrieve_cities");
        let args: serde_json::Value =
            serde_json::from_str(&completion.tool_calls[0].arguments).unwrap();
        assert_eq!(args["country"], "Spain");
        assert_eq!(completion.usage.unwrap().completion_tokens, 2);
    }

    #[tokio::test]
    async fn test_overloaded_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(529).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .complete(&[Message::user("q")], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_embed_is_invalid_request() {
        let server = MockServer::start().await;
        let err = client_for(&server).embed(&["x".into()]).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRequest(_)));
    }
}

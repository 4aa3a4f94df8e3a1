//! Provider gateway: one completion and embedding surface over interchangeable backends
//!
//! The gateway owns the pacing policy. Every backend call first takes a
//! permit from the shared [`RequestLimiter`], runs under a timeout, and is
//! retried with exponential backoff when the outcome is `rate_limited` or
//! `unavailable`. Backends only translate wire formats.

mod anthropic;
#[cfg(test)]
pub mod fake;
mod ollama;
mod openai;
mod retry;

pub use anthropic::AnthropicClient;
pub use ollama::OllamaClient;
pub use openai::OpenAiClient;
pub use retry::{RequestLimiter, RetryPolicy};

use crate::config::Config;
use crate::error::{Error, ProviderError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Supported model backend families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI and OpenAI-compatible endpoints
    OpenAi,
    Anthropic,
    /// Locally hosted Ollama server
    Ollama,
}

impl ProviderKind {
    pub fn supports_embed(&self) -> bool {
        matches!(self, ProviderKind::OpenAi | ProviderKind::Ollama)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::Anthropic => write!(f, "anthropic"),
            ProviderKind::Ollama => write!(f, "ollama"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" | "openai-compatible" | "openrouter" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "ollama" | "local" => Ok(ProviderKind::Ollama),
            other => Err(Error::Config(format!("Unknown provider kind: {}", other))),
        }
    }
}

/// Resolved backend settings for one capability
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub max_tokens: u32,
    /// Requested embedding length, for backends that can truncate
    pub dimension: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the completion backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// Assistant turn that requested tool calls
    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(Role::Tool, content)
        }
    }
}

/// Tool definition offered to the completion backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Normalized completion result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub model: String,
    pub usage: Option<Usage>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            model: String::new(),
            usage: None,
        }
    }
}

/// Closed set of model backends
pub enum Backend {
    OpenAi(OpenAiClient),
    Anthropic(AnthropicClient),
    Ollama(OllamaClient),
    #[cfg(test)]
    Fake(fake::FakeBackend),
}

impl Backend {
    pub fn from_settings(settings: &ProviderSettings, client: reqwest::Client) -> Self {
        match settings.kind {
            ProviderKind::OpenAi => Backend::OpenAi(OpenAiClient::new(settings, client)),
            ProviderKind::Anthropic => Backend::Anthropic(AnthropicClient::new(settings, client)),
            ProviderKind::Ollama => Backend::Ollama(OllamaClient::new(settings, client)),
        }
    }

    /// Identifier recorded alongside derived vectors
    pub fn model_id(&self) -> String {
        match self {
            Backend::OpenAi(c) => format!("openai:{}", c.model()),
            Backend::Anthropic(c) => format!("anthropic:{}", c.model()),
            Backend::Ollama(c) => format!("ollama:{}", c.model()),
            #[cfg(test)]
            Backend::Fake(f) => format!("fake:{}", f.model()),
        }
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> std::result::Result<Completion, ProviderError> {
        match self {
            Backend::OpenAi(c) => c.complete(messages, tools).await,
            Backend::Anthropic(c) => c.complete(messages, tools).await,
            Backend::Ollama(c) => c.complete(messages, tools).await,
            #[cfg(test)]
            Backend::Fake(f) => f.complete(messages, tools),
        }
    }

    async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
        match self {
            Backend::OpenAi(c) => c.embed(texts).await,
            Backend::Anthropic(c) => c.embed(texts).await,
            Backend::Ollama(c) => c.embed(texts).await,
            #[cfg(test)]
            Backend::Fake(f) => f.embed(texts),
        }
    }
}

/// Uniform completion and embedding entry point
pub struct ProviderGateway {
    completion: Backend,
    embedding: Backend,
    limiter: RequestLimiter,
    retry: RetryPolicy,
    batch_size: usize,
    completion_timeout: Duration,
    embedding_timeout: Duration,
}

impl ProviderGateway {
    /// Build the gateway from explicit configuration
    pub fn new(config: &Config) -> Result<Self> {
        let completion = config.completion.settings();
        let embedding = config.embedding.settings();
        if !embedding.kind.supports_embed() {
            return Err(Error::Config(format!(
                "provider kind {} cannot produce embeddings",
                embedding.kind
            )));
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("ragweave/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        debug!(
            completion = %completion.kind,
            completion_model = %completion.model,
            embedding = %embedding.kind,
            embedding_model = %embedding.model,
            "Provider gateway configured"
        );

        Ok(Self {
            completion: Backend::from_settings(&completion, client.clone()),
            embedding: Backend::from_settings(&embedding, client),
            limiter: RequestLimiter::new(
                config.gateway.max_concurrent_requests,
                config.gateway.requests_per_second,
            ),
            retry: RetryPolicy::new(config.gateway.max_retries, config.gateway.retry_base_delay_ms),
            batch_size: config.embedding.batch_size.max(1),
            completion_timeout: completion.timeout,
            embedding_timeout: embedding.timeout,
        })
    }

    /// Gateway over a scripted backend for both capabilities
    #[cfg(test)]
    pub fn fake(backend: fake::FakeBackend) -> Self {
        Self {
            completion: Backend::Fake(backend.clone()),
            embedding: Backend::Fake(backend),
            limiter: RequestLimiter::new(8, 1000),
            retry: RetryPolicy::new(0, 1),
            batch_size: 16,
            completion_timeout: Duration::from_secs(5),
            embedding_timeout: Duration::from_secs(5),
        }
    }

    pub fn embedding_model(&self) -> String {
        self.embedding.model_id()
    }

    pub fn completion_model(&self) -> String {
        self.completion.model_id()
    }

    /// Run one chat completion, optionally offering tools
    pub async fn complete(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<Completion> {
        self.call("completion", self.completion_timeout, || {
            self.completion.complete(messages, tools)
        })
        .await
        .map_err(Error::Completion)
    }

    /// Embed texts in configured batches; output order matches input order
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let batch_vectors = self
                .call("embedding", self.embedding_timeout, || self.embedding.embed(batch))
                .await
                .map_err(Error::Embedding)?;
            if batch_vectors.len() != batch.len() {
                return Err(Error::Embedding(ProviderError::Unavailable(format!(
                    "expected {} vectors, got {}",
                    batch.len(),
                    batch_vectors.len()
                ))));
            }
            vectors.extend(batch_vectors);
        }

        if let Some(first) = vectors.first() {
            let dimension = first.len();
            if dimension == 0 || vectors.iter().any(|v| v.len() != dimension) {
                return Err(Error::Embedding(ProviderError::Unavailable(
                    "backend returned vectors of inconsistent length".to_string(),
                )));
            }
        }
        Ok(vectors)
    }

    /// Embed a single text, typically a question
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| Error::Embedding(ProviderError::Unavailable("no vector returned".into())))
    }

    async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        timeout: Duration,
        mut request: F,
    ) -> std::result::Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            // The permit is released before any backoff sleep
            let outcome = {
                let _permit = self.limiter.acquire().await?;
                match tokio::time::timeout(timeout, request()).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ProviderError::Unavailable(format!(
                        "{} timed out after {}s",
                        operation,
                        timeout.as_secs()
                    ))),
                }
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if self.retry.should_retry(&err, attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying provider call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Cosine similarity; zero-length or zero-norm inputs score 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer, max_retries: u32) -> Config {
        let mut config = Config::default();
        config.completion.kind = ProviderKind::OpenAi;
        config.completion.base_url = server.uri();
        config.completion.model = "gpt-test".to_string();
        config.completion.api_key_env = String::new();
        config.completion.timeout_secs = 1;
        config.embedding.kind = ProviderKind::OpenAi;
        config.embedding.base_url = server.uri();
        config.embedding.model = "embed-test".to_string();
        config.embedding.api_key_env = String::new();
        config.embedding.batch_size = 2;
        config.gateway.max_retries = max_retries;
        config.gateway.retry_base_delay_ms = 1;
        config
    }

    fn chat_ok(text: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "model": "gpt-test",
            "choices": [{"message": {"content": text}}]
        }))
    }

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("openai".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!("Local".parse::<ProviderKind>().unwrap(), ProviderKind::Ollama);
        assert_eq!("anthropic".parse::<ProviderKind>().unwrap(), ProviderKind::Anthropic);
        assert!("bedrock".parse::<ProviderKind>().is_err());
        assert!(!ProviderKind::Anthropic.supports_embed());
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_gateway_rejects_anthropic_embedding() {
        let mut config = Config::default();
        config.embedding.kind = ProviderKind::Anthropic;
        assert!(matches!(ProviderGateway::new(&config), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_gateway_retries_rate_limit_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("busy"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(chat_ok("done"))
            .mount(&server)
            .await;

        let gateway = ProviderGateway::new(&config_for(&server, 2)).unwrap();
        let completion = gateway.complete(&[Message::user("hi")], &[]).await.unwrap();
        assert_eq!(completion.text, "done");
    }

    #[tokio::test]
    async fn test_gateway_does_not_retry_unauthenticated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("no"))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = ProviderGateway::new(&config_for(&server, 3)).unwrap();
        let err = gateway.complete(&[Message::user("hi")], &[]).await.unwrap_err();
        assert!(matches!(err, Error::Completion(ProviderError::Unauthenticated(_))));
    }

    #[tokio::test]
    async fn test_gateway_timeout_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(chat_ok("late").set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let gateway = ProviderGateway::new(&config_for(&server, 0)).unwrap();
        let err = gateway.complete(&[Message::user("hi")], &[]).await.unwrap_err();
        assert!(matches!(err, Error::Completion(ProviderError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_gateway_embeds_in_batches() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"index": 0, "embedding": [1.0, 0.0]},
                    {"index": 1, "embedding": [0.0, 1.0]}
                ]
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"index": 0, "embedding": [0.5, 0.5]}]
            })))
            .mount(&server)
            .await;

        let gateway = ProviderGateway::new(&config_for(&server, 0)).unwrap();
        let texts = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let vectors = gateway.embed(&texts).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[2], vec![0.5, 0.5]);
        assert_eq!(gateway.embedding_model(), "openai:embed-test");
    }
}

//! Default values for configuration

use crate::agent::AnswerMode;
use crate::provider::ProviderKind;

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn env_kind_or(key: &str, fallback: ProviderKind) -> ProviderKind {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

// ===== Completion =====

/// Completion backend kind (LLM_PROVIDER)
pub fn default_completion_kind() -> ProviderKind {
    env_kind_or("LLM_PROVIDER", ProviderKind::OpenAi)
}

/// Completion endpoint (LLM_BASE_URL)
pub fn default_completion_base_url() -> String {
    env_or("LLM_BASE_URL", "https://api.openai.com/v1")
}

/// Completion model (LLM_CHOICE)
pub fn default_completion_model() -> String {
    env_or("LLM_CHOICE", "gpt-4.1-mini")
}

/// Environment variable holding the completion API key
pub fn default_completion_api_key_env() -> String {
    "LLM_API_KEY".to_string()
}

/// Default max tokens requested per completion
pub fn default_completion_max_tokens() -> u32 {
    4096
}

// ===== Embedding =====

/// Embedding backend kind (EMBEDDING_PROVIDER)
pub fn default_embedding_kind() -> ProviderKind {
    env_kind_or("EMBEDDING_PROVIDER", ProviderKind::OpenAi)
}

/// Embedding endpoint (EMBEDDING_BASE_URL)
pub fn default_embedding_base_url() -> String {
    env_or("EMBEDDING_BASE_URL", "https://api.openai.com/v1")
}

/// Embedding model (EMBEDDING_MODEL)
pub fn default_embedding_model() -> String {
    env_or("EMBEDDING_MODEL", "text-embedding-3-small")
}

/// Environment variable holding the embedding API key
pub fn default_embedding_api_key_env() -> String {
    "EMBEDDING_API_KEY".to_string()
}

/// Requested embedding dimension
pub fn default_embedding_dimension() -> usize {
    std::env::var("EMBEDDED_DIMENSIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1024)
}

/// Texts per embedding request
pub fn default_embedding_batch_size() -> usize {
    100
}

/// Per-request timeout for model backends
pub fn default_provider_timeout_secs() -> u64 {
    60
}

// ===== Gateway =====

/// Concurrent in-flight provider calls
pub fn default_max_concurrent_requests() -> usize {
    4
}

/// Provider calls per second
pub fn default_requests_per_second() -> u32 {
    10
}

/// Retries on rate limits and outages
pub fn default_max_retries() -> u32 {
    std::env::var("EMBEDDED_MAX_RETRIES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3)
}

/// First retry delay, doubled per attempt
pub fn default_retry_base_delay_ms() -> u64 {
    1000
}

// ===== Chunking =====

/// Token ceiling per chunk (about 4 characters per token)
pub fn default_chunk_max_tokens() -> usize {
    500
}

/// Tokens shared with the previous chunk
pub fn default_chunk_overlap_tokens() -> usize {
    50
}

/// Fragments below this are merged with a neighbour
pub fn default_chunk_min_tokens() -> usize {
    25
}

/// Default: prefer heading boundaries
pub fn default_prefer_heading_boundaries() -> bool {
    true
}

// ===== Ingestion =====

/// Documents processed concurrently
pub fn default_ingest_fan_out() -> usize {
    4
}

/// Documentation file extensions
pub fn default_ingest_extensions() -> Vec<String> {
    vec!["md".to_string(), "markdown".to_string(), "mdx".to_string()]
}

// ===== Repositories =====

pub fn default_github_api_url() -> String {
    env_or("GITHUB_API_URL", "https://api.github.com")
}

pub fn default_github_web_url() -> String {
    "https://github.com".to_string()
}

pub fn default_github_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

pub fn default_gitlab_base_url() -> String {
    env_or("GITLAB_BASE_URL", "https://gitlab.com")
}

pub fn default_gitlab_token_env() -> String {
    "GITLAB_TOKEN".to_string()
}

/// Timeout for repository host requests
pub fn default_repository_timeout_secs() -> u64 {
    30
}

/// Upper bound on documents taken from one repository
pub fn default_max_files_per_repo() -> usize {
    1000
}

/// Upper bound on records read from one record source
pub fn default_max_records() -> usize {
    10_000
}

// ===== Store =====

pub fn default_graph_backend() -> String {
    "sqlite".to_string()
}

/// Neo4j endpoint (NEO4J_URI); bolt URIs are mapped to the HTTP port
pub fn default_neo4j_uri() -> String {
    env_or("NEO4J_URI", "http://localhost:7474")
}

pub fn default_neo4j_user() -> String {
    env_or("NEO4J_USER", "neo4j")
}

pub fn default_neo4j_password_env() -> String {
    "NEO4J_PASSWORD".to_string()
}

pub fn default_neo4j_database() -> String {
    "neo4j".to_string()
}

pub fn default_store_timeout_secs() -> u64 {
    30
}

// ===== Query =====

/// Default number of context items
pub fn default_query_k() -> usize {
    5
}

/// Graph traversal depth from matched entities
pub fn default_query_max_hops() -> usize {
    2
}

/// Minimum similarity score (0.0 - 1.0)
pub fn default_query_min_score() -> f32 {
    0.0
}

// ===== Agent =====

pub fn default_max_tool_rounds() -> usize {
    5
}

pub fn default_tool_timeout_secs() -> u64 {
    30
}

/// Generations followed when listing inheritors
pub fn default_max_inheritor_depth() -> usize {
    6
}

pub fn default_doc_mode() -> AnswerMode {
    AnswerMode::Retrieval
}

pub fn default_inheritance_mode() -> AnswerMode {
    AnswerMode::Tools
}

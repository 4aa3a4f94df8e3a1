//! Configuration management for ragweave
//!
//! Handles loading, saving, and validating configuration from TOML files.
//! Environment overrides are applied by the default functions, so a config
//! file only needs to name what differs from the deployment environment.

mod defaults;

pub use defaults::*;

use crate::agent::AnswerMode;
use crate::error::{Error, Result};
use crate::provider::{ProviderKind, ProviderSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Completion backend
    #[serde(default)]
    pub completion: CompletionConfig,

    /// Embedding backend
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Concurrency ceiling and retry policy for provider calls
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Chunking configuration
    #[serde(default)]
    pub chunk: ChunkConfig,

    /// Ingestion fan-out and document filters
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Repository host access
    #[serde(default)]
    pub repositories: RepositoryConfig,

    /// Store backends
    #[serde(default)]
    pub store: StoreConfig,

    /// Query configuration
    #[serde(default)]
    pub query: QueryConfig,

    /// Agent orchestration
    #[serde(default)]
    pub agent: AgentConfig,

    /// Paths configuration (internal, not user-editable)
    #[serde(skip)]
    pub paths: PathsConfig,
}

/// Completion backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default = "default_completion_kind")]
    pub kind: ProviderKind,

    #[serde(default = "default_completion_base_url")]
    pub base_url: String,

    #[serde(default = "default_completion_model")]
    pub model: String,

    /// Environment variable name for the API key
    #[serde(default = "default_completion_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_completion_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

/// Embedding backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_kind")]
    pub kind: ProviderKind,

    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,

    /// Model name/identifier
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Environment variable name for the API key
    #[serde(default = "default_embedding_api_key_env")]
    pub api_key_env: String,

    /// Requested dimension (sent to backends that can truncate)
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Batch size for embedding
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

/// Provider call limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// In-flight provider calls across all documents
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

/// Chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Token ceiling per chunk
    #[serde(default = "default_chunk_max_tokens")]
    pub max_tokens: usize,

    /// Overlap tokens between consecutive chunks
    #[serde(default = "default_chunk_overlap_tokens")]
    pub overlap_tokens: usize,

    /// Minimum chunk size (don't create tiny chunks)
    #[serde(default = "default_chunk_min_tokens")]
    pub min_tokens: usize,

    /// Prefer breaking at heading boundaries
    #[serde(default = "default_prefer_heading_boundaries")]
    pub prefer_heading_boundaries: bool,
}

/// Ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Documents processed concurrently
    #[serde(default = "default_ingest_fan_out")]
    pub fan_out: usize,

    /// File extensions treated as documentation
    #[serde(default = "default_ingest_extensions")]
    pub extensions: Vec<String>,

    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

/// Repository host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default = "default_github_api_url")]
    pub github_api_url: String,

    /// Base for provenance view links
    #[serde(default = "default_github_web_url")]
    pub github_web_url: String,

    #[serde(default = "default_github_token_env")]
    pub github_token_env: String,

    /// GitLab instance (API lives under /api/v4)
    #[serde(default = "default_gitlab_base_url")]
    pub gitlab_base_url: String,

    #[serde(default = "default_gitlab_token_env")]
    pub gitlab_token_env: String,

    #[serde(default = "default_repository_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_files_per_repo")]
    pub max_files_per_repo: usize,
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Graph backend: "sqlite" (shares the working database) or "neo4j"
    #[serde(default = "default_graph_backend")]
    pub graph_backend: String,

    #[serde(default = "default_neo4j_uri")]
    pub neo4j_uri: String,

    #[serde(default = "default_neo4j_user")]
    pub neo4j_user: String,

    #[serde(default = "default_neo4j_password_env")]
    pub neo4j_password_env: String,

    #[serde(default = "default_neo4j_database")]
    pub neo4j_database: String,

    #[serde(default = "default_store_timeout_secs")]
    pub timeout_secs: u64,
}

/// Query configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Default number of results
    #[serde(default = "default_query_k")]
    pub default_k: usize,

    /// Traversal depth for graph strategies
    #[serde(default = "default_query_max_hops")]
    pub max_hops: usize,

    /// Minimum similarity score (0.0 - 1.0)
    #[serde(default = "default_query_min_score")]
    pub min_score: f32,
}

/// Agent orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,

    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,

    #[serde(default = "default_max_inheritor_depth")]
    pub max_inheritor_depth: usize,

    /// Answer mode for the documentation agent
    #[serde(default = "default_doc_mode")]
    pub doc_mode: AnswerMode,

    /// Answer mode for the inheritance agent
    #[serde(default = "default_inheritance_mode")]
    pub inheritance_mode: AnswerMode,
}

/// Internal paths configuration
#[derive(Debug, Clone, Default)]
pub struct PathsConfig {
    /// Working directory for ragweave data
    pub base_dir: PathBuf,

    /// Path to config file
    pub config_file: PathBuf,

    /// Path to SQLite database
    pub db_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            completion: CompletionConfig::default(),
            embedding: EmbeddingConfig::default(),
            gateway: GatewayConfig::default(),
            chunk: ChunkConfig::default(),
            ingest: IngestConfig::default(),
            repositories: RepositoryConfig::default(),
            store: StoreConfig::default(),
            query: QueryConfig::default(),
            agent: AgentConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            kind: default_completion_kind(),
            base_url: default_completion_base_url(),
            model: default_completion_model(),
            api_key_env: default_completion_api_key_env(),
            max_tokens: default_completion_max_tokens(),
            timeout_secs: default_provider_timeout_secs(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            kind: default_embedding_kind(),
            base_url: default_embedding_base_url(),
            model: default_embedding_model(),
            api_key_env: default_embedding_api_key_env(),
            dimension: default_embedding_dimension(),
            batch_size: default_embedding_batch_size(),
            timeout_secs: default_provider_timeout_secs(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent_requests(),
            requests_per_second: default_requests_per_second(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_chunk_max_tokens(),
            overlap_tokens: default_chunk_overlap_tokens(),
            min_tokens: default_chunk_min_tokens(),
            prefer_heading_boundaries: default_prefer_heading_boundaries(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            fan_out: default_ingest_fan_out(),
            extensions: default_ingest_extensions(),
            max_records: default_max_records(),
        }
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            github_api_url: default_github_api_url(),
            github_web_url: default_github_web_url(),
            github_token_env: default_github_token_env(),
            gitlab_base_url: default_gitlab_base_url(),
            gitlab_token_env: default_gitlab_token_env(),
            timeout_secs: default_repository_timeout_secs(),
            max_files_per_repo: default_max_files_per_repo(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            graph_backend: default_graph_backend(),
            neo4j_uri: default_neo4j_uri(),
            neo4j_user: default_neo4j_user(),
            neo4j_password_env: default_neo4j_password_env(),
            neo4j_database: default_neo4j_database(),
            timeout_secs: default_store_timeout_secs(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_k: default_query_k(),
            max_hops: default_query_max_hops(),
            min_score: default_query_min_score(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            tool_timeout_secs: default_tool_timeout_secs(),
            max_inheritor_depth: default_max_inheritor_depth(),
            doc_mode: default_doc_mode(),
            inheritance_mode: default_inheritance_mode(),
        }
    }
}

fn read_env(name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl CompletionConfig {
    /// Resolve into gateway settings, reading the credential from the environment
    pub fn settings(&self) -> ProviderSettings {
        ProviderSettings {
            kind: self.kind,
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            api_key: read_env(&self.api_key_env),
            timeout: Duration::from_secs(self.timeout_secs),
            max_tokens: self.max_tokens,
            dimension: None,
        }
    }
}

impl EmbeddingConfig {
    /// Resolve into gateway settings, reading the credential from the environment
    pub fn settings(&self) -> ProviderSettings {
        ProviderSettings {
            kind: self.kind,
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            api_key: read_env(&self.api_key_env),
            timeout: Duration::from_secs(self.timeout_secs),
            max_tokens: 0,
            dimension: Some(self.dimension),
        }
    }
}

impl RepositoryConfig {
    pub fn github_token(&self) -> Option<String> {
        read_env(&self.github_token_env)
    }

    pub fn gitlab_token(&self) -> Option<String> {
        read_env(&self.gitlab_token_env)
    }
}

impl StoreConfig {
    pub fn neo4j_password(&self) -> Option<String> {
        read_env(&self.neo4j_password_env)
    }

    pub fn uses_neo4j(&self) -> bool {
        self.graph_backend.eq_ignore_ascii_case("neo4j")
    }
}

impl Config {
    /// `RAGWEAVE_WORK_DIR` when set, else `~/.ragweave`
    pub fn default_base_dir() -> PathBuf {
        if let Some(dir) = read_env("RAGWEAVE_WORK_DIR") {
            return PathBuf::from(dir);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ragweave")
    }

    /// Point the config file and working database at `base_dir`
    fn init_paths(&mut self, base_dir: Option<PathBuf>) {
        let base = base_dir.unwrap_or_else(Self::default_base_dir);
        self.paths = PathsConfig {
            config_file: base.join("config.toml"),
            db_file: base.join("ragweave.db"),
            base_dir: base,
        };
    }

    /// Read an explicit config file; the working database sits beside it.
    ///
    /// A missing file is an error here, unlike [`Config::load_from`].
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;

        let base = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        config.paths = PathsConfig {
            config_file: config_path.to_path_buf(),
            db_file: base.join("ragweave.db"),
            base_dir: base,
        };

        config.validate()?;
        Ok(config)
    }

    /// Default configuration rooted at `base_dir`, or the default base directory
    pub fn with_base_dir(base_dir: Option<PathBuf>) -> Self {
        let mut config = Config::default();
        config.init_paths(base_dir);
        config
    }

    /// Load configuration from a base directory, falling back to defaults
    pub fn load_from(base_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = Self::with_base_dir(base_dir);

        if config.paths.config_file.exists() {
            debug!("Loading config from {:?}", config.paths.config_file);
            let content = std::fs::read_to_string(&config.paths.config_file)?;
            let mut loaded: Config = toml::from_str(&content)?;
            loaded.paths = config.paths;
            config = loaded;
        } else {
            debug!("No config file found, using defaults");
        }

        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as TOML to `paths.config_file`, creating its directory
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.paths.config_file, content)?;
        info!("Saved config to {:?}", self.paths.config_file);
        Ok(())
    }

    /// Reject settings no run could work with
    pub fn validate(&self) -> Result<()> {
        if self.chunk.max_tokens == 0 {
            return Err(Error::Config("chunk.max_tokens must be positive".to_string()));
        }

        if self.chunk.max_tokens < self.chunk.min_tokens {
            return Err(Error::Config(
                "chunk.max_tokens must be >= chunk.min_tokens".to_string(),
            ));
        }

        if self.chunk.overlap_tokens >= self.chunk.max_tokens {
            return Err(Error::Config(
                "chunk.overlap_tokens must be < chunk.max_tokens".to_string(),
            ));
        }

        if self.ingest.fan_out == 0 {
            return Err(Error::Config("ingest.fan_out must be at least 1".to_string()));
        }

        if self.gateway.max_concurrent_requests == 0 || self.gateway.requests_per_second == 0 {
            return Err(Error::Config(
                "gateway.max_concurrent_requests and gateway.requests_per_second must be at least 1"
                    .to_string(),
            ));
        }

        if self.embedding.batch_size == 0 {
            return Err(Error::Config(
                "embedding.batch_size must be at least 1".to_string(),
            ));
        }

        if !self.embedding.kind.supports_embed() {
            return Err(Error::Config(format!(
                "embedding.kind '{}' does not provide embeddings",
                self.embedding.kind
            )));
        }

        let backend = self.store.graph_backend.to_lowercase();
        if backend != "sqlite" && backend != "neo4j" {
            return Err(Error::Config(format!(
                "store.graph_backend must be 'sqlite' or 'neo4j', got '{}'",
                self.store.graph_backend
            )));
        }

        if self.query.default_k == 0 {
            return Err(Error::Config("query.default_k must be at least 1".to_string()));
        }

        if self.query.min_score < 0.0 || self.query.min_score > 1.0 {
            return Err(Error::Config(
                "query.min_score must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.agent.max_tool_rounds == 0 {
            return Err(Error::Config(
                "agent.max_tool_rounds must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

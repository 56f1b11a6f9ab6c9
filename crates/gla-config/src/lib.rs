//! Configuration for the gla grid log analyzer.
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! `GLA__SECTION__KEY` environment overrides. Credentials written as `${VAR}`
//! are expanded once at load time so nothing downstream touches the
//! process environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "GLA";

/// Default log file requested from the job's log area.
pub const DEFAULT_LOG_FILENAME: &str = "pilotlog.txt";

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("credential for '{name}' references an unset variable: {message}")]
    MissingCredential { name: String, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub embeddings: EmbeddingsConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    /// Upper bound on a single backend invocation.
    pub invoke_timeout_secs: u64,
    pub source: SourceConfig,
    /// Backends in failover order.
    pub backends: Vec<BackendConfig>,
    /// Backend used when a request names none; defaults to the first entry.
    pub default_backend: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embeddings: EmbeddingsConfig::default(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            invoke_timeout_secs: 120,
            source: SourceConfig::default(),
            backends: vec![BackendConfig::local_default()],
            default_backend: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bound on a synchronous `analyze` call, end to end.
    pub request_timeout_secs: u64,
    /// How long finished runs stay resolvable by request token.
    pub session_retention_secs: u64,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            request_timeout_secs: 600,
            session_retention_secs: 300,
            max_body_bytes: 64 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_chunk_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 2000,
            overlap_chars: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Query used when a request carries no hints.
    pub default_query: String,
    /// Narrowing stops below this budget.
    pub min_budget_tokens: usize,
    /// Budget multiplier applied after a context overflow, in (0, 1).
    pub narrowing_factor: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_query: "error exception failed failure fatal traceback killed timeout \
                            lost heartbeat stage-in stage-out payload exit code"
                .to_string(),
            min_budget_tokens: 256,
            narrowing_factor: 0.75,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderKind {
    /// Local feature hashing, no network.
    Hashing,
    /// Any OpenAI-compatible `/embeddings` endpoint.
    Openai,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    pub provider: EmbeddingProviderKind,
    pub model: String,
    pub dimensions: usize,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Hashing,
            model: "feature-hashing".to_string(),
            dimensions: 512,
            api_key: None,
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub memory_budget_bytes: usize,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 256 * 1024 * 1024,
            sweep_interval_secs: 30,
        }
    }
}

/// Retry policy for transient backend failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts against one backend, including the first.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            backoff_multiplier: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (0-indexed), capped at
    /// `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let delay_ms = delay_ms.min(self.max_delay_ms as f64).max(0.0) as u64;
        Duration::from_millis(delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Http,
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// URL with `{job_id}` and `{filename}` placeholders.
    pub url_template: String,
    /// Root for `kind = "directory"`, laid out as `<root>/<job_id>/<filename>`.
    pub directory: Option<PathBuf>,
    pub default_filename: String,
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Http,
            url_template: "https://bigpanda.cern.ch/filebrowser/?pandaid={job_id}&json&filename={filename}"
                .to_string(),
            directory: None,
            default_filename: DEFAULT_LOG_FILENAME.to_string(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Anthropic,
    Openai,
    /// llama.cpp / Ollama style OpenAI-compatible server on the local host.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub kind: BackendKind,
    pub model: String,
    /// Context window in tokens.
    pub context_window: usize,
    /// Tokens reserved for the response.
    #[serde(default = "default_max_response_tokens")]
    pub max_response_tokens: usize,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_max_response_tokens() -> usize {
    1000
}

impl BackendConfig {
    fn local_default() -> Self {
        Self {
            name: "llama".to_string(),
            kind: BackendKind::Local,
            model: "local".to_string(),
            context_window: 8192,
            max_response_tokens: 1000,
            api_key: None,
            base_url: Some("http://127.0.0.1:8080/v1".to_string()),
        }
    }
}

impl Config {
    /// Load configuration from defaults, the given (or default) TOML file and
    /// environment overrides, then expand credentials and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        match path {
            Some(path) => {
                debug!("Loading configuration from {}", path.display());
                builder = builder.add_source(
                    config::File::from(path)
                        .format(config::FileFormat::Toml)
                        .required(true),
                );
            }
            None => {
                if let Some(default_path) = default_config_path() {
                    debug!("Looking for configuration at {}", default_path.display());
                    builder = builder.add_source(
                        config::File::from(default_path)
                            .format(config::FileFormat::Toml)
                            .required(false),
                    );
                }
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.finalize()
    }

    /// Parse a TOML document on top of the defaults, without environment
    /// overrides.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.finalize()
    }

    fn finalize(mut self) -> Result<Self, ConfigError> {
        self.expand_credentials()?;
        self.validate()?;
        Ok(self)
    }

    fn expand_credentials(&mut self) -> Result<(), ConfigError> {
        for backend in &mut self.backends {
            backend.api_key = expand_credential(&backend.name, backend.api_key.take())?;
        }
        self.embeddings.api_key = expand_credential("embeddings", self.embeddings.api_key.take())?;
        Ok(())
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::Invalid("at least one backend must be configured".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            if backend.name.trim().is_empty() {
                return Err(ConfigError::Invalid("backend name must not be empty".into()));
            }
            if !seen.insert(backend.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate backend name '{}'",
                    backend.name
                )));
            }
            if backend.max_response_tokens >= backend.context_window {
                return Err(ConfigError::Invalid(format!(
                    "backend '{}': max_response_tokens ({}) must be below context_window ({})",
                    backend.name, backend.max_response_tokens, backend.context_window
                )));
            }
        }

        if let Some(default) = &self.default_backend {
            if !seen.contains(default.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "default_backend '{}' is not a configured backend",
                    default
                )));
            }
        }

        if self.chunking.max_chunk_chars == 0 {
            return Err(ConfigError::Invalid("chunking.max_chunk_chars must be positive".into()));
        }
        if self.chunking.overlap_chars >= self.chunking.max_chunk_chars {
            return Err(ConfigError::Invalid(
                "chunking.overlap_chars must be smaller than chunking.max_chunk_chars".into(),
            ));
        }

        let factor = self.retrieval.narrowing_factor;
        if !(factor > 0.0 && factor < 1.0) {
            return Err(ConfigError::Invalid(
                "retrieval.narrowing_factor must lie strictly between 0 and 1".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.embeddings.dimensions == 0 {
            return Err(ConfigError::Invalid("embeddings.dimensions must be positive".into()));
        }
        if self.cache.memory_budget_bytes == 0 {
            return Err(ConfigError::Invalid("cache.memory_budget_bytes must be positive".into()));
        }
        if self.source.kind == SourceKind::Directory && self.source.directory.is_none() {
            return Err(ConfigError::Invalid(
                "source.directory is required when source.kind = \"directory\"".into(),
            ));
        }

        Ok(())
    }

    /// Name of the backend used when a request does not choose one.
    pub fn default_backend_name(&self) -> Option<&str> {
        self.default_backend
            .as_deref()
            .or_else(|| self.backends.first().map(|b| b.name.as_str()))
    }
}

/// `~/.config/gla/config.toml` (platform equivalent).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("gla").join("config.toml"))
}

fn expand_credential(name: &str, value: Option<String>) -> Result<Option<String>, ConfigError> {
    match value {
        Some(raw) if !raw.trim().is_empty() => shellexpand::env(&raw)
            .map(|expanded| Some(expanded.into_owned()))
            .map_err(|e| ConfigError::MissingCredential {
                name: name.to_string(),
                message: e.to_string(),
            }),
        _ => Ok(None),
    }
}

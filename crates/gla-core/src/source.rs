//! Log sources: where raw job logs come from.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use gla_config::{SourceConfig, SourceKind};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("log not found: {0}")]
    NotFound(String),

    #[error("log source unavailable: {0}")]
    Unavailable(String),
}

/// Fetches the raw text of one log file of one job.
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn fetch(&self, job_id: &str, filename: &str) -> Result<String, SourceError>;

    /// Short description for logs and status output.
    fn describe(&self) -> String;
}

/// Reject identifiers that could escape a directory or URL path segment.
pub fn validate_job_id(job_id: &str) -> Result<(), SourceError> {
    let valid = !job_id.is_empty()
        && job_id.len() <= 64
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && job_id != "."
        && job_id != "..";
    if valid {
        Ok(())
    } else {
        Err(SourceError::InvalidRequest(format!("invalid job id '{}'", job_id)))
    }
}

pub fn validate_filename(filename: &str) -> Result<(), SourceError> {
    let valid = !filename.is_empty()
        && filename.len() <= 255
        && !filename.starts_with('.')
        && filename
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(SourceError::InvalidRequest(format!("invalid log filename '{}'", filename)))
    }
}

fn validate(job_id: &str, filename: &str) -> Result<(), SourceError> {
    validate_job_id(job_id)?;
    validate_filename(filename)
}

/// Downloads logs over HTTP from a URL template containing `{job_id}` and
/// `{filename}`.
pub struct HttpLogSource {
    client: Client,
    url_template: String,
}

impl HttpLogSource {
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            client,
            url_template: url_template.into(),
        })
    }

    pub fn url_for(&self, job_id: &str, filename: &str) -> String {
        self.url_template
            .replace("{job_id}", job_id)
            .replace("{filename}", filename)
    }
}

#[async_trait]
impl LogSource for HttpLogSource {
    async fn fetch(&self, job_id: &str, filename: &str) -> Result<String, SourceError> {
        validate(job_id, filename)?;
        let url = self.url_for(job_id, filename);
        debug!("Downloading log from {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(format!("{}: {}", url, e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound(format!("{} for job {}", filename, job_id)));
        }
        if !status.is_success() {
            return Err(SourceError::Unavailable(format!("{} returned {}", url, status)));
        }

        response
            .text()
            .await
            .map_err(|e| SourceError::Unavailable(format!("failed to read {}: {}", url, e)))
    }

    fn describe(&self) -> String {
        format!("http ({})", self.url_template)
    }
}

/// Reads `<root>/<job_id>/<filename>` from the local filesystem.
pub struct DirectoryLogSource {
    root: PathBuf,
}

impl DirectoryLogSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl LogSource for DirectoryLogSource {
    async fn fetch(&self, job_id: &str, filename: &str) -> Result<String, SourceError> {
        validate(job_id, filename)?;
        let path = self.root.join(job_id).join(filename);
        debug!("Reading log from {}", path.display());

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SourceError::NotFound(format!("{} for job {}", filename, job_id)))
            }
            Err(e) => Err(SourceError::Unavailable(format!("{}: {}", path.display(), e))),
        }
    }

    fn describe(&self) -> String {
        format!("directory ({})", self.root.display())
    }
}

/// Serves logs held in memory.
#[derive(Default)]
pub struct StaticLogSource {
    logs: RwLock<HashMap<(String, String), String>>,
    fetches: AtomicUsize,
}

impl StaticLogSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(self, job_id: &str, filename: &str, text: impl Into<String>) -> Self {
        self.insert(job_id, filename, text);
        self
    }

    /// Add or replace a log.
    pub fn insert(&self, job_id: &str, filename: &str, text: impl Into<String>) {
        self.logs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((job_id.to_string(), filename.to_string()), text.into());
    }

    /// Number of successful and failed fetches so far.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogSource for StaticLogSource {
    async fn fetch(&self, job_id: &str, filename: &str) -> Result<String, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        validate(job_id, filename)?;
        self.logs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(job_id.to_string(), filename.to_string()))
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("{} for job {}", filename, job_id)))
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}

/// Build the configured log source.
pub fn from_config(config: &SourceConfig) -> anyhow::Result<Arc<dyn LogSource>> {
    let source: Arc<dyn LogSource> = match config.kind {
        SourceKind::Http => Arc::new(HttpLogSource::new(
            &config.url_template,
            Duration::from_secs(config.timeout_secs),
        )?),
        SourceKind::Directory => {
            let root = config
                .directory
                .clone()
                .ok_or_else(|| anyhow::anyhow!("source.directory is required for a directory source"))?;
            Arc::new(DirectoryLogSource::new(root))
        }
    };
    debug!("Using log source: {}", source.describe());
    Ok(source)
}

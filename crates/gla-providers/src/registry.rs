//! Backend descriptors and the process-wide registry.
//!
//! The registry is built once at startup from configuration and never
//! mutated afterwards; it is shared by reference with every run.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use gla_config::{BackendConfig, BackendKind, Config};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::{AnthropicBackend, Backend, LocalBackend, OpenAiBackend};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no backends configured")]
    Empty,

    #[error("duplicate backend name '{0}'")]
    Duplicate(String),

    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    #[error("backend '{name}' requires a credential")]
    MissingCredential { name: String },
}

/// Static description of one configured backend.
#[derive(Clone)]
pub struct BackendDescriptor {
    pub name: String,
    pub kind: BackendKind,
    pub model: String,
    pub context_window: usize,
    pub max_response_tokens: usize,
    pub base_url: Option<String>,
    pub credential: Option<String>,
}

impl fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("model", &self.model)
            .field("context_window", &self.context_window)
            .field("max_response_tokens", &self.max_response_tokens)
            .field("base_url", &self.base_url)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl From<&BackendConfig> for BackendDescriptor {
    fn from(config: &BackendConfig) -> Self {
        Self {
            name: config.name.clone(),
            kind: config.kind,
            model: config.model.clone(),
            context_window: config.context_window,
            max_response_tokens: config.max_response_tokens,
            base_url: config.base_url.clone(),
            credential: config.api_key.clone(),
        }
    }
}

impl BackendDescriptor {
    /// Construct the backend this descriptor names.
    pub fn build(&self, timeout: Duration) -> anyhow::Result<Arc<dyn Backend>> {
        let backend: Arc<dyn Backend> = match self.kind {
            BackendKind::Anthropic => {
                let key = self.require_credential()?;
                Arc::new(AnthropicBackend::new(
                    &self.name,
                    key,
                    &self.model,
                    self.base_url.clone(),
                    self.context_window,
                    self.max_response_tokens,
                    timeout,
                )?)
            }
            BackendKind::Openai => {
                let key = self.require_credential()?;
                Arc::new(OpenAiBackend::new(
                    &self.name,
                    Some(key),
                    &self.model,
                    self.base_url.clone(),
                    self.context_window,
                    self.max_response_tokens,
                    timeout,
                )?)
            }
            BackendKind::Local => Arc::new(LocalBackend::new(
                &self.name,
                &self.model,
                self.base_url.clone(),
                self.context_window,
                self.max_response_tokens,
                timeout,
            )?),
        };
        Ok(backend)
    }

    fn require_credential(&self) -> Result<String, RegistryError> {
        self.credential
            .clone()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| RegistryError::MissingCredential {
                name: self.name.clone(),
            })
    }
}

/// Public view of a backend for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSummary {
    pub name: String,
    pub model: String,
    pub context_window: usize,
    pub is_default: bool,
}

/// The closed set of backends available to the orchestrator.
pub struct BackendRegistry {
    backends: Vec<Arc<dyn Backend>>,
    default: String,
}

impl BackendRegistry {
    /// Wrap already-constructed backends. The first one is the default
    /// unless `default` names another.
    pub fn new(backends: Vec<Arc<dyn Backend>>, default: Option<&str>) -> Result<Self, RegistryError> {
        let first = backends.first().ok_or(RegistryError::Empty)?.name().to_string();

        for (i, backend) in backends.iter().enumerate() {
            if backends[..i].iter().any(|b| b.name() == backend.name()) {
                return Err(RegistryError::Duplicate(backend.name().to_string()));
            }
        }

        let default = match default {
            Some(name) if backends.iter().any(|b| b.name() == name) => name.to_string(),
            Some(name) => return Err(RegistryError::UnknownBackend(name.to_string())),
            None => first,
        };

        Ok(Self { backends, default })
    }

    pub fn from_descriptors(
        descriptors: &[BackendDescriptor],
        default: Option<&str>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let backends = descriptors
            .iter()
            .map(|d| d.build(timeout))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let registry = Self::new(backends, default)?;
        info!(
            "Registered backends: {} (default: {})",
            registry.names().join(", "),
            registry.default_name()
        );
        Ok(registry)
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let descriptors: Vec<BackendDescriptor> = config.backends.iter().map(BackendDescriptor::from).collect();
        Self::from_descriptors(
            &descriptors,
            config.default_backend.as_deref(),
            Duration::from_secs(config.invoke_timeout_secs),
        )
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Backend>> {
        self.backends.iter().find(|b| b.name() == name)
    }

    /// The requested backend, or the default when none is requested.
    pub fn resolve(&self, name: Option<&str>) -> Result<&Arc<dyn Backend>, RegistryError> {
        let name = name.unwrap_or(&self.default);
        self.get(name)
            .ok_or_else(|| RegistryError::UnknownBackend(name.to_string()))
    }

    /// `preferred` first, then the remaining backends in declaration order.
    pub fn failover_order(&self, preferred: &str) -> Vec<Arc<dyn Backend>> {
        let mut order: Vec<Arc<dyn Backend>> = self.get(preferred).into_iter().cloned().collect();
        order.extend(self.backends.iter().filter(|b| b.name() != preferred).cloned());
        order
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    pub fn summaries(&self) -> Vec<BackendSummary> {
        self.backends
            .iter()
            .map(|b| BackendSummary {
                name: b.name().to_string(),
                model: b.model().to_string(),
                context_window: b.context_window(),
                is_default: b.name() == self.default,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .field("default", &self.default)
            .finish()
    }
}

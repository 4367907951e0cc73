/// Reasoning backends abstraction
///
/// Provides a unified interface for conflict resolvers:
/// - Local heuristic resolver (no network)
/// - Remote reasoning service over HTTP
pub mod local;
pub mod remote;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub use local::LocalBackend;
pub use remote::RemoteBackend;

use crate::{ConflictContext, ReasoningError, Resolution, Result};

/// Backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// In-process heuristics
    #[default]
    Local,
    /// HTTP reasoning service
    Remote,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// Conflict resolver capability
#[async_trait::async_trait]
pub trait ReasoningBackend: Send + Sync {
    /// Backend name
    fn name(&self) -> &str;

    /// Backend type
    fn backend_type(&self) -> BackendType;

    /// Check if backend is reachable/configured
    async fn is_available(&self) -> bool;

    /// Propose a resolution for a conflict
    async fn resolve(&self, context: &ConflictContext) -> Result<Resolution>;
}

/// Backend configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend type
    pub backend_type: BackendType,

    /// Service endpoint (remote backends)
    pub endpoint: Option<String>,

    /// API key or token
    pub api_key: Option<String>,

    /// Model name passed through to the service
    pub model: Option<String>,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::new(BackendType::Local)
    }
}

impl BackendConfig {
    /// Create new backend config
    pub fn new(backend_type: BackendType) -> Self {
        Self {
            backend_type,
            endpoint: None,
            api_key: None,
            model: None,
            timeout_secs: 20,
        }
    }

    /// With service endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// With API key
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// With model name
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// With timeout
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Save configuration to JSON
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write backend config {}", path.display()))?;
        Ok(())
    }

    /// Load configuration from JSON
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read backend config {}", path.display()))?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

/// Backend factory for creating backend instances
pub struct BackendFactory;

impl BackendFactory {
    /// Create backend from config
    pub fn create(config: BackendConfig) -> Result<Arc<dyn ReasoningBackend>> {
        match config.backend_type {
            BackendType::Local => Ok(Arc::new(LocalBackend::new())),
            BackendType::Remote => {
                let backend = RemoteBackend::new(config)
                    .map_err(|e| ReasoningError::Config(format!("{:#}", e)))?;
                Ok(Arc::new(backend))
            }
        }
    }
}

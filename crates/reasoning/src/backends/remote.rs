/// Remote reasoning service backend
///
/// Posts the conflict context as JSON and expects a replacement for the
/// conflict region plus an explanation and confidence.
use super::{BackendConfig, BackendType, ReasoningBackend};
use crate::{ConflictContext, Patch, ReasoningError, Resolution, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

pub struct RemoteBackend {
    endpoint: String,
    api_key: Option<String>,
    model: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl RemoteBackend {
    /// Create new remote backend
    pub fn new(config: BackendConfig) -> anyhow::Result<Self> {
        let endpoint = config
            .endpoint
            .context("Remote backend requires endpoint")?
            .trim_end_matches('/')
            .to_string();
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            endpoint,
            api_key: config.api_key,
            model: config.model,
            timeout,
            client,
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn classify(&self, error: reqwest::Error) -> ReasoningError {
        if error.is_timeout() {
            ReasoningError::Timeout(self.timeout)
        } else {
            ReasoningError::Unavailable(error.to_string())
        }
    }
}

#[async_trait::async_trait]
impl ReasoningBackend for RemoteBackend {
    fn name(&self) -> &str {
        "Remote"
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Remote
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/health", self.endpoint);
        match self.request(self.client.get(url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn resolve(&self, context: &ConflictContext) -> Result<Resolution> {
        let request = ResolveRequest {
            model: self.model.as_deref(),
            context,
        };
        debug!(path = %context.file_path, kind = %context.conflict_type, "requesting remote resolution");

        let response = self
            .request(self.client.post(format!("{}/v1/resolve", self.endpoint)))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "reasoning service error");
            return Err(ReasoningError::Unavailable(format!("{} - {}", status, body)));
        }

        let body: ResolveResponse = response
            .json()
            .await
            .map_err(|e| ReasoningError::Malformed(e.to_string()))?;
        body.into_resolution(context)
    }
}

#[derive(Debug, Serialize)]
struct ResolveRequest<'a> {
    model: Option<&'a str>,
    context: &'a ConflictContext,
}

#[derive(Debug, Deserialize)]
struct ResolveResponse {
    replacement: Option<String>,
    explanation: String,
    confidence: f64,
    #[serde(default)]
    alternatives: Vec<String>,
}

impl ResolveResponse {
    fn into_resolution(self, context: &ConflictContext) -> Result<Resolution> {
        let resolution = Resolution {
            patch: self.replacement.map(|replacement| Patch {
                lines: context.region.clone(),
                original: context.merged.clone(),
                replacement,
            }),
            explanation: self.explanation,
            confidence: self.confidence,
            alternatives: self.alternatives,
        };
        resolution.validate()?;
        Ok(resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConflictKind;

    fn context() -> ConflictContext {
        ConflictContext {
            file_path: "src/lib.rs".into(),
            language: Some("Rust".into()),
            conflict_type: ConflictKind::TypeLevel,
            region: 4..6,
            merged: "add(1)\n".into(),
            local_version: "add(1, 2)\n".into(),
            remote_version: "fn add(a: u8)\n".into(),
            surrounding_code: String::new(),
            diagnostics: vec!["add expects 1 argument".into()],
        }
    }

    #[test]
    fn test_response_becomes_patch_over_region() {
        let body: ResolveResponse = serde_json::from_str(
            r#"{"replacement":"add(1, 2)\n","explanation":"restore second arg","confidence":0.9}"#,
        )
        .unwrap();

        let resolution = body.into_resolution(&context()).unwrap();
        let patch = resolution.patch.unwrap();
        assert_eq!(patch.lines, 4..6);
        assert_eq!(patch.original, "add(1)\n");
        assert!(resolution.alternatives.is_empty());
    }

    #[test]
    fn test_out_of_range_confidence_is_malformed() {
        let body: ResolveResponse =
            serde_json::from_str(r#"{"explanation":"x","confidence":7.0}"#).unwrap();
        assert!(matches!(
            body.into_resolution(&context()),
            Err(ReasoningError::Malformed(_))
        ));
    }

    #[test]
    fn test_missing_endpoint_fails() {
        assert!(RemoteBackend::new(BackendConfig::new(BackendType::Remote)).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_service_is_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = BackendConfig::new(BackendType::Remote)
            .with_endpoint(format!("http://127.0.0.1:{}", port))
            .with_timeout(2);
        let backend = RemoteBackend::new(config).unwrap();

        assert!(!backend.is_available().await);
        assert!(matches!(
            backend.resolve(&context()).await,
            Err(ReasoningError::Unavailable(_)) | Err(ReasoningError::Timeout(_))
        ));
    }
}

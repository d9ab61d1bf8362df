//! Reasoning backend client
//!
//! Generates text via an Ollama-style HTTP API. Model selection can be
//! delegated to a remote selector webhook; every failure along that path
//! falls back to the first configured candidate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use tracing::{debug, warn};

/// Default per-request deadline for generation calls.
pub const GENERATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Process-wide reasoning settings, passed in explicitly at construction.
#[derive(Debug, Clone)]
pub struct ReasoningConfig {
    /// Base URL of the reasoning backend
    pub base_url: String,

    /// Models this node is configured to use, in preference order
    pub models: Vec<String>,

    /// Optional remote model-selector webhook
    pub selector_webhook: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReasoningError {
    #[error("reasoning network error: {0}")]
    Network(String),

    #[error("reasoning backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("reasoning response decode failed: {0}")]
    Decode(String),

    #[error("no models available")]
    NoModels,
}

/// Contract for the generative reasoning backend.
#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Generate a completion; `model` overrides the selected default.
    async fn generate(&self, prompt: &str, model: Option<&str>)
        -> Result<String, ReasoningError>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

#[derive(Debug, Serialize)]
struct SelectorRequest<'a> {
    models: &'a [String],
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct SelectorResponse {
    model: String,
}

/// HTTP implementation of [`Reasoner`].
pub struct ReasoningClient {
    config: ReasoningConfig,
    http: reqwest::Client,
}

impl ReasoningClient {
    pub fn new(config: ReasoningConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &ReasoningConfig {
        &self.config
    }

    /// List models the backend actually has loaded.
    pub async fn available_models(&self) -> Result<Vec<String>, ReasoningError> {
        let response = self
            .http
            .get(format!("{}/api/tags", self.config.base_url))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| ReasoningError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ReasoningError::Http {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| ReasoningError::Decode(e.to_string()))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Pick a model for a prompt via the selector webhook.
    ///
    /// Any failure (missing webhook, network error, non-2xx, bad decode, or
    /// a selection outside the candidate list) falls back to the first
    /// candidate.
    pub async fn select_model(&self, prompt: &str) -> Result<String, ReasoningError> {
        let candidates = &self.config.models;
        let first = candidates.first().cloned().ok_or(ReasoningError::NoModels)?;

        let Some(webhook) = &self.config.selector_webhook else {
            return Ok(first);
        };

        let request = SelectorRequest {
            models: candidates,
            prompt,
        };

        let response = match self
            .http
            .post(webhook)
            .json(&request)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(status = %r.status(), "Model selector returned non-2xx, using first candidate");
                return Ok(first);
            }
            Err(e) => {
                debug!(error = %e, "Model selector unreachable, using first candidate");
                return Ok(first);
            }
        };

        match response.json::<SelectorResponse>().await {
            Ok(selected) if candidates.contains(&selected.model) => Ok(selected.model),
            Ok(selected) => {
                warn!(model = %selected.model, "Selector chose an unavailable model, using first candidate");
                Ok(first)
            }
            Err(_) => Ok(first),
        }
    }
}

#[async_trait]
impl Reasoner for ReasoningClient {
    async fn generate(
        &self,
        prompt: &str,
        model: Option<&str>,
    ) -> Result<String, ReasoningError> {
        let selected;
        let model = match model {
            Some(m) => m,
            None => {
                selected = self.select_model(prompt).await?;
                &selected
            }
        };

        let request = GenerateRequest {
            model,
            prompt,
            stream: false,
        };

        let response = self
            .http
            .post(format!("{}/api/generate", self.config.base_url))
            .json(&request)
            .timeout(GENERATE_TIMEOUT)
            .send()
            .await
            .map_err(|e| ReasoningError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ReasoningError::Http {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let decoded: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ReasoningError::Decode(e.to_string()))?;
        Ok(decoded.response)
    }
}

//! Model backends behind the single-method [`ModelClient`] capability.
//!
//! The pipeline never knows which backend it talks to; it only sends an
//! instruction prompt plus page context and receives raw text back.

pub mod heuristic;
pub mod mock;
pub mod ollama;
pub mod openai;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::CoreError;
use crate::config_file::ModelConfig;

/// Boxed future returned by [`ModelClient::send`].
pub type ModelFuture<'a> = Pin<Box<dyn Future<Output = Result<String, ModelError>> + Send + 'a>>;

/// A language model that answers an instruction prompt about some context.
pub trait ModelClient: Send + Sync {
    /// Send `prompt` (instructions) and `context` (page texts); return the raw reply.
    fn send<'a>(&'a self, prompt: &'a str, context: &'a str) -> ModelFuture<'a>;
}

/// Transport-level failure talking to a model backend. All variants are
/// transient from the pipeline's point of view.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited (429){}", retry_after.map(|d| format!(", retry after {:.1}s", d.as_secs_f64())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },
}

impl From<reqwest::Error> for ModelError {
    fn from(e: reqwest::Error) -> Self {
        ModelError::Transport(e.to_string())
    }
}

/// Shared HTTP client for model backends.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Default OpenAI-compatible endpoint.
pub const DEFAULT_OPENAI_ENDPOINT: &str = "https://api.openai.com/v1";
/// Default local Ollama host.
pub const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";

/// Build a backend from its configuration section.
///
/// `backend` is one of `openai`, `ollama` or `heuristic` (ordering only).
pub fn build_client(
    config: &ModelConfig,
    client: &reqwest::Client,
) -> Result<Arc<dyn ModelClient>, CoreError> {
    let backend = config.backend.as_deref().unwrap_or("openai");
    match backend.to_ascii_lowercase().as_str() {
        "openai" => {
            let api_key = config.api_key.clone().ok_or_else(|| {
                CoreError::Config("the openai backend needs an API key".into())
            })?;
            let model = config
                .model
                .clone()
                .ok_or_else(|| CoreError::Config("the openai backend needs a model name".into()))?;
            let endpoint = config
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_ENDPOINT.to_string());
            Ok(Arc::new(
                openai::OpenAiCompatible::new(endpoint, api_key, model).with_client(client.clone()),
            ))
        }
        "ollama" => {
            let model = config
                .model
                .clone()
                .ok_or_else(|| CoreError::Config("the ollama backend needs a model name".into()))?;
            let host = config
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_HOST.to_string());
            Ok(Arc::new(
                ollama::Ollama::new(host, model).with_client(client.clone()),
            ))
        }
        "heuristic" => Ok(Arc::new(heuristic::HeuristicOrderer)),
        other => Err(CoreError::Config(format!(
            "unknown model backend {other:?} (expected openai, ollama or heuristic)"
        ))),
    }
}

/// Shorten an error body for inclusion in an error message.
pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    let body = body.trim();
    if body.chars().count() <= MAX {
        body.to_string()
    } else {
        let cut: String = body.chars().take(MAX).collect();
        format!("{cut}...")
    }
}

use serde_json::{Value, json};

use super::{ModelClient, ModelError, ModelFuture, truncate_body};
use crate::rate_limit::ensure_not_throttled;

/// A locally hosted model served by Ollama's `/api/generate`.
///
/// Requests use JSON mode. Models in JSON mode often wrap the grouping array
/// in an object; the validator accepts that shape.
pub struct Ollama {
    host: String,
    model: String,
    client: reqwest::Client,
}

impl Ollama {
    pub fn new(host: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn url(&self) -> String {
        format!("{}/api/generate", self.host.trim_end_matches('/'))
    }

    fn request_body(&self, prompt: &str, context: &str) -> Value {
        json!({
            "model": self.model,
            "system": prompt,
            "prompt": context,
            "stream": false,
            "format": "json",
            "options": {"temperature": 0},
        })
    }
}

impl ModelClient for Ollama {
    fn send<'a>(&'a self, prompt: &'a str, context: &'a str) -> ModelFuture<'a> {
        Box::pin(async move {
            let resp = self
                .client
                .post(self.url())
                .json(&self.request_body(prompt, context))
                .send()
                .await?;

            ensure_not_throttled(&resp)?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(ModelError::Transport(format!(
                    "HTTP {status}: {}",
                    truncate_body(&body)
                )));
            }

            let data: Value = resp.json().await?;
            data["response"]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| ModelError::Transport("response field missing".into()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_json_mode_without_streaming() {
        let o = Ollama::new("http://gpu-box:11434/", "llama3.1:8b");
        assert_eq!(o.url(), "http://gpu-box:11434/api/generate");
        let body = o.request_body("instructions", "pages");
        assert_eq!(body["format"], "json");
        assert_eq!(body["stream"], false);
        assert_eq!(body["system"], "instructions");
        assert_eq!(body["prompt"], "pages");
    }
}

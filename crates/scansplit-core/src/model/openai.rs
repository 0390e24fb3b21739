use serde_json::{Value, json};

use super::{ModelClient, ModelError, ModelFuture, truncate_body};
use crate::rate_limit::ensure_not_throttled;

/// Any endpoint speaking the OpenAI chat-completions protocol.
///
/// The prompt goes in as the system message and the page context as the
/// user message.
pub struct OpenAiCompatible {
    endpoint: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiCompatible {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.endpoint.trim_end_matches('/'))
    }

    fn request_body(&self, prompt: &str, context: &str) -> Value {
        json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": prompt},
                {"role": "user", "content": context},
            ],
        })
    }
}

impl ModelClient for OpenAiCompatible {
    fn send<'a>(&'a self, prompt: &'a str, context: &'a str) -> ModelFuture<'a> {
        Box::pin(async move {
            let resp = self
                .client
                .post(self.url())
                .bearer_auth(&self.api_key)
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
            extract_content(&data)
        })
    }
}

fn extract_content(data: &Value) -> Result<String, ModelError> {
    data["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ModelError::Transport("response carries no message content".into()))
}

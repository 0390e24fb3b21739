//! The two AI-backed capabilities: grouping classification and page ordering.
//!
//! Both wrap a [`ModelClient`] with the same call discipline: wait for the
//! backend's rate limiter, bound the call by a timeout, and slow the limiter
//! down when the backend answers 429.

use std::sync::Arc;
use std::time::Duration;

use crate::DEFAULT_CALL_TIMEOUT;
use crate::model::{ModelClient, ModelError};
use crate::rate_limit::AdaptiveLimiter;

#[derive(Clone)]
struct ModelStep {
    client: Arc<dyn ModelClient>,
    limiter: Option<Arc<AdaptiveLimiter>>,
    timeout: Duration,
}

impl ModelStep {
    async fn call(&self, prompt: &str, context: &str) -> Result<String, ModelError> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let result = match tokio::time::timeout(self.timeout, self.client.send(prompt, context)).await
        {
            Ok(result) => result,
            Err(_) => Err(ModelError::Timeout(self.timeout)),
        };

        if let (Err(ModelError::RateLimited { .. }), Some(limiter)) = (&result, &self.limiter) {
            limiter.on_rate_limited();
        }
        result
    }
}

/// Proposes the grouping of a whole scan.
#[derive(Clone)]
pub struct Classifier(ModelStep);

impl Classifier {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self(ModelStep {
            client,
            limiter: None,
            timeout: DEFAULT_CALL_TIMEOUT,
        })
    }

    pub fn with_limiter(mut self, limiter: Arc<AdaptiveLimiter>) -> Self {
        self.0.limiter = Some(limiter);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.0.timeout = timeout;
        self
    }

    /// Raw grouping reply for `context` (every page of the scan).
    pub async fn classify(&self, prompt: &str, context: &str) -> Result<String, ModelError> {
        self.0.call(prompt, context).await
    }
}

/// Proposes the reading order of one group.
#[derive(Clone)]
pub struct Orderer(ModelStep);

impl Orderer {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self(ModelStep {
            client,
            limiter: None,
            timeout: DEFAULT_CALL_TIMEOUT,
        })
    }

    pub fn with_limiter(mut self, limiter: Arc<AdaptiveLimiter>) -> Self {
        self.0.limiter = Some(limiter);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.0.timeout = timeout;
        self
    }

    /// Raw ordering reply for `context` (the pages of one group).
    pub async fn order(&self, prompt: &str, context: &str) -> Result<String, ModelError> {
        self.0.call(prompt, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mock::{MockReply, ScriptedModel};

    #[tokio::test(start_paused = true)]
    async fn hung_call_becomes_timeout() {
        let orderer = Orderer::new(Arc::new(ScriptedModel::new(MockReply::Hang)))
            .with_timeout(Duration::from_secs(30));
        assert_eq!(
            orderer.order("p", "c").await,
            Err(ModelError::Timeout(Duration::from_secs(30)))
        );
    }

    #[tokio::test]
    async fn rate_limit_slows_the_shared_limiter() {
        let limiter = Arc::new(AdaptiveLimiter::per_second(100.0));
        let classifier = Classifier::new(Arc::new(ScriptedModel::new(MockReply::Error(
            ModelError::RateLimited { retry_after: None },
        ))))
        .with_limiter(limiter.clone());

        assert!(classifier.classify("p", "c").await.is_err());
        assert_eq!(limiter.factor(), 2);
    }

    #[tokio::test]
    async fn passes_reply_through() {
        let classifier = Classifier::new(Arc::new(ScriptedModel::always("[]")));
        assert_eq!(classifier.classify("p", "c").await.unwrap(), "[]");
    }
}

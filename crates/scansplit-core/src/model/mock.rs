//! Deterministic model stubs for tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{ModelClient, ModelError, ModelFuture};

/// A configurable reply for [`ScriptedModel`].
#[derive(Clone, Debug)]
pub enum MockReply {
    /// Return this text.
    Text(String),
    /// Fail with this error.
    Error(ModelError),
    /// Never answer (exercises timeouts and cancellation).
    Hang,
}

impl MockReply {
    pub fn text(s: impl Into<String>) -> Self {
        MockReply::Text(s.into())
    }
}

/// A hand-rolled [`ModelClient`] for tests.
///
/// Supports:
/// - A fixed reply (used for every call), **or**
/// - A sequence of replies (one per call, repeating the last when exhausted).
/// - Optional per-call latency.
/// - Call counting and prompt capture.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<MockReply>>,
    fallback: MockReply,
    delay: Option<Duration>,
    call_count: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    /// A model that always answers `reply`.
    pub fn new(reply: MockReply) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: reply,
            delay: None,
            call_count: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// A model that always answers with `text`.
    pub fn always(text: impl Into<String>) -> Self {
        Self::new(MockReply::text(text))
    }

    /// A model that answers `replies` in order, repeating the last one.
    ///
    /// An empty sequence behaves like a model that never answers.
    pub fn with_sequence(replies: Vec<MockReply>) -> Self {
        let fallback = replies.last().cloned().unwrap_or(MockReply::Hang);
        Self {
            replies: Mutex::new(replies.into()),
            fallback,
            delay: None,
            call_count: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Simulate model latency per call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// How many times `send()` has been called.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Every prompt received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn next_reply(&self) -> MockReply {
        let mut replies = self.replies.lock().unwrap_or_else(|e| e.into_inner());
        replies.pop_front().unwrap_or_else(|| self.fallback.clone())
    }
}

impl ModelClient for ScriptedModel {
    fn send<'a>(&'a self, prompt: &'a str, _context: &'a str) -> ModelFuture<'a> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());
        let reply = self.next_reply();
        let delay = self.delay;

        Box::pin(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            match reply {
                MockReply::Text(text) => Ok(text),
                MockReply::Error(e) => Err(e),
                MockReply::Hang => std::future::pending().await,
            }
        })
    }
}

/// A [`ModelClient`] answering from a closure over `(prompt, context)`.
///
/// Useful when concurrent calls must be answered per group rather than in
/// call order.
pub struct FnModel<F> {
    respond: F,
    call_count: AtomicUsize,
}

impl<F> FnModel<F>
where
    F: Fn(&str, &str) -> Result<String, ModelError> + Send + Sync,
{
    pub fn new(respond: F) -> Self {
        Self {
            respond,
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

impl<F> ModelClient for FnModel<F>
where
    F: Fn(&str, &str) -> Result<String, ModelError> + Send + Sync,
{
    fn send<'a>(&'a self, prompt: &'a str, context: &'a str) -> ModelFuture<'a> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let reply = (self.respond)(prompt, context);
        Box::pin(async move { reply })
    }
}

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use crate::{
    client::LanguageModel,
    errors::{Error, Result, ValidationError},
    tools::BoxFuture,
    types::{Completion, CompletionRequest},
};

/// Scripted in-memory language model for offline tests and demos.
///
/// Replies are returned in the order they were queued. Every request is
/// recorded so tests can assert on what the loop sent.
#[derive(Clone, Default)]
pub struct MockModel {
    inner: Arc<MockInner>,
}

#[derive(Default)]
struct MockInner {
    replies: Mutex<VecDeque<Result<Completion>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    // Returned once the queue runs dry instead of an error.
    fallback: Mutex<Option<String>>,
}

impl MockModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a model that replies with each text in turn.
    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let model = Self::new();
        for reply in replies {
            model.push_reply(reply);
        }
        model
    }

    pub fn reply(self, text: impl Into<String>) -> Self {
        self.push_reply(text);
        self
    }

    pub fn error(self, err: Error) -> Self {
        self.push_error(err);
        self
    }

    /// Reply used for every call after the queue is exhausted.
    pub fn repeat(self, text: impl Into<String>) -> Self {
        *lock(&self.inner.fallback) = Some(text.into());
        self
    }

    pub fn push_reply(&self, text: impl Into<String>) {
        lock(&self.inner.replies).push_back(Ok(Completion::text(text)));
    }

    pub fn push_error(&self, err: Error) {
        lock(&self.inner.replies).push_back(Err(err));
    }

    /// Number of completion requests received so far.
    pub fn calls(&self) -> usize {
        lock(&self.inner.requests).len()
    }

    /// Copies of every request received so far.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.inner.requests).clone()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.inner.replies).len()
    }

    fn next(&self, request: &CompletionRequest) -> Result<Completion> {
        lock(&self.inner.requests).push(request.clone());
        if let Some(reply) = lock(&self.inner.replies).pop_front() {
            return reply;
        }
        match lock(&self.inner.fallback).as_ref() {
            Some(text) => Ok(Completion::text(text.clone())),
            None => Err(Error::Validation(ValidationError::new(
                "no mock reply queued",
            ))),
        }
    }
}

impl LanguageModel for MockModel {
    fn complete<'a>(&'a self, request: &'a CompletionRequest) -> BoxFuture<'a, Result<Completion>> {
        let reply = self.next(request);
        Box::pin(async move {
            tokio::task::yield_now().await;
            reply
        })
    }
}

// A panicking test thread must not take the remaining assertions down with it.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;

    fn request(text: &str) -> CompletionRequest {
        CompletionRequest::new(vec![ChatMessage::user(text)])
    }

    #[tokio::test]
    async fn replies_in_order_then_errors() {
        let model = MockModel::with_replies(["first", "second"]);
        assert_eq!(model.complete(&request("a")).await.unwrap().text, "first");
        assert_eq!(model.complete(&request("b")).await.unwrap().text, "second");
        assert!(matches!(
            model.complete(&request("c")).await,
            Err(Error::Validation(_))
        ));
        assert_eq!(model.calls(), 3);
        assert_eq!(model.requests()[1].last_content(), Some("b"));
    }

    #[tokio::test]
    async fn queued_errors_and_fallback() {
        let model = MockModel::new()
            .error(Error::upstream_unavailable("down"))
            .repeat("again");
        assert!(model.complete(&request("a")).await.is_err());
        assert_eq!(model.complete(&request("b")).await.unwrap().text, "again");
        assert_eq!(model.complete(&request("c")).await.unwrap().text, "again");
        assert_eq!(model.remaining(), 0);
    }
}

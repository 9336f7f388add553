//! Failover across a primary model and its fallbacks
//!
//! Each model gets the retry policy's attempts for errors that look
//! transient (rate limits, 5xx, timeouts); anything else moves straight to
//! the next model. When every model fails the error lists all of them.

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::is_retryable_message;
use crate::retry::RetryPolicy;

use super::types::{ChatMessage, ChatResponse, LlmProvider};

pub struct ModelRouter {
    /// Index 0 is the primary
    providers: Vec<Box<dyn LlmProvider>>,
    retry: RetryPolicy,
}

impl ModelRouter {
    pub fn with_failover(providers: Vec<Box<dyn LlmProvider>>) -> Result<Self> {
        if providers.is_empty() {
            bail!("failover needs at least one model");
        }
        Ok(Self {
            providers,
            retry: RetryPolicy::once(Duration::from_millis(500)),
        })
    }

    /// Attempts per model, and the backoff between them
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = RetryPolicy {
            max_attempts: retry.max_attempts.max(1),
            ..retry
        };
        self
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    async fn try_provider(
        &self,
        provider: &dyn LlmProvider,
        messages: &[ChatMessage],
        system: &str,
    ) -> Result<ChatResponse> {
        let mut attempt = 0;
        loop {
            let err = match provider.chat(messages, system).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            let cause = format!("{:#}", err);
            if !is_retryable_message(&cause) || attempt + 1 >= self.retry.max_attempts {
                return Err(err);
            }
            let delay = self.retry.delay_for(attempt);
            warn!(
                "{} ({}) failed, retrying in {:?}: {}",
                provider.provider_name(),
                provider.model(),
                delay,
                cause
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl LlmProvider for ModelRouter {
    fn provider_name(&self) -> &str {
        self.providers.first().map_or("none", |p| p.provider_name())
    }

    fn model(&self) -> &str {
        self.providers.first().map_or("none", |p| p.model())
    }

    async fn chat(&self, messages: &[ChatMessage], system: &str) -> Result<ChatResponse> {
        let mut failures = Vec::with_capacity(self.providers.len());
        for (idx, provider) in self.providers.iter().enumerate() {
            match self.try_provider(provider.as_ref(), messages, system).await {
                Ok(response) => {
                    if idx > 0 {
                        info!(
                            "Answered by fallback {} ({}) after {} failed",
                            provider.provider_name(),
                            provider.model(),
                            idx
                        );
                    }
                    return Ok(response);
                }
                Err(e) => {
                    debug!("{} ({}) gave up: {:#}", provider.provider_name(), provider.model(), e);
                    failures.push(format!("{}: {:#}", provider.provider_name(), e));
                }
            }
        }
        Err(anyhow!("all {} models failed: {}", failures.len(), failures.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails `failures` times with `error`, then answers with its name
    struct Scripted {
        name: &'static str,
        error: &'static str,
        failures: u32,
        calls: Arc<AtomicU32>,
    }

    impl Scripted {
        fn new(name: &'static str, error: &'static str, failures: u32) -> (Box<Self>, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            let provider = Box::new(Self {
                name,
                error,
                failures,
                calls: Arc::clone(&calls),
            });
            (provider, calls)
        }
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        fn provider_name(&self) -> &str {
            self.name
        }
        fn model(&self) -> &str {
            "scripted"
        }
        async fn chat(&self, _messages: &[ChatMessage], _system: &str) -> Result<ChatResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(anyhow!("{}", self.error));
            }
            Ok(ChatResponse::finished(self.name))
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy::once(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_transient_error_retried_on_same_model() {
        let (primary, calls) = Scripted::new("primary", "status 429: rate limit", 1);
        let (fallback, fallback_calls) = Scripted::new("fallback", "", 0);
        let router = ModelRouter::with_failover(vec![primary, fallback])
            .unwrap()
            .with_retry(fast());

        assert_eq!(router.complete("sys", "hi").await.unwrap(), "primary");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_permanent_error_moves_to_fallback() {
        let (primary, calls) = Scripted::new("primary", "status 401: unauthorized", u32::MAX);
        let (fallback, _) = Scripted::new("fallback", "", 0);
        let router = ModelRouter::with_failover(vec![primary, fallback])
            .unwrap()
            .with_retry(RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_millis(1),
            });

        assert_eq!(router.complete("sys", "hi").await.unwrap(), "fallback");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_failures_are_reported() {
        let (a, a_calls) = Scripted::new("a", "status 503: overloaded", u32::MAX);
        let (b, _) = Scripted::new("b", "invalid api key", u32::MAX);
        let router = ModelRouter::with_failover(vec![a, b]).unwrap().with_retry(fast());

        let err = router.complete("sys", "hi").await.unwrap_err().to_string();
        assert!(err.contains("all 2 models failed"));
        assert!(err.contains("a: status 503"));
        assert!(err.contains("b: invalid api key"));
        assert_eq!(a_calls.load(Ordering::SeqCst), 2);
        // Still retryable as a whole: the classifier may try again later
        assert!(is_retryable_message(&err));
    }

    #[test]
    fn test_reports_primary_and_rejects_empty() {
        assert!(ModelRouter::with_failover(vec![]).is_err());

        let (primary, _) = Scripted::new("openai", "", 0);
        let (fallback, _) = Scripted::new("groq", "", 0);
        let router = ModelRouter::with_failover(vec![primary, fallback]).unwrap();
        assert_eq!(router.provider_name(), "openai");
        assert_eq!(router.len(), 2);
        assert!(!router.is_empty());
    }
}

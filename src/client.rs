//! Model client abstraction
//!
//! Provides the [`LlmClient`] trait the substrate invokes backends through,
//! plus [`EchoClient`] for pipeline smoke tests without real model
//! dependencies. Production clients (HTTP providers, local inference
//! servers) live outside this crate; anything implementing the trait plugs
//! into the router, the pipeline executor, and the moderation service.

use crate::schema::OutputSchema;
use crate::SubstrateError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// A single model invocation.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    /// Prompt text sent to the backend.
    pub prompt: String,
    /// Declared output schema, when structured output is expected.
    pub schema: Option<OutputSchema>,
    /// Upper bound on generated tokens.
    pub max_tokens: u32,
    /// Deadline for the call. Derived from the routing config's latency
    /// bound or a service default; enforced by the caller.
    pub deadline: Duration,
}

impl InvocationRequest {
    /// Build a request with default limits (512 tokens, 30 s deadline).
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            schema: None,
            max_tokens: 512,
            deadline: Duration::from_secs(30),
        }
    }

    /// Attach an output schema.
    pub fn with_schema(mut self, schema: OutputSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Set the call deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Set the generation limit.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Trait for language-model backends.
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// The trait is object-safe to allow dynamic dispatch via `Arc<dyn LlmClient>`.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Unary invocation of the named backend. Returns the raw model text;
    /// schema validation happens in the caller.
    async fn invoke(
        &self,
        backend: &str,
        request: InvocationRequest,
    ) -> Result<String, SubstrateError>;

    /// Streaming invocation. Deltas arrive on the returned channel; the
    /// channel closing signals completion.
    async fn invoke_stream(
        &self,
        backend: &str,
        request: InvocationRequest,
    ) -> Result<mpsc::Receiver<String>, SubstrateError>;
}

/// Dummy echo client for testing
///
/// Unary calls return the prompt unchanged; streaming calls emit it one
/// whitespace-separated token at a time. Useful for exercising the full
/// orchestration path without model dependencies.
pub struct EchoClient {
    /// Simulated inference delay
    pub delay_ms: u64,
}

impl EchoClient {
    /// Create an `EchoClient` with a default 10 ms simulated delay.
    pub fn new() -> Self {
        Self { delay_ms: 10 }
    }

    /// Create an `EchoClient` with a custom simulated delay in milliseconds.
    pub fn with_delay(delay_ms: u64) -> Self {
        Self { delay_ms }
    }
}

impl Default for EchoClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for EchoClient {
    async fn invoke(
        &self,
        _backend: &str,
        request: InvocationRequest,
    ) -> Result<String, SubstrateError> {
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        Ok(request.prompt)
    }

    async fn invoke_stream(
        &self,
        _backend: &str,
        request: InvocationRequest,
    ) -> Result<mpsc::Receiver<String>, SubstrateError> {
        let (tx, rx) = mpsc::channel(64);
        let delay = self.delay_ms;
        tokio::spawn(async move {
            for token in request.prompt.split_whitespace() {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                if tx.send(token.to_string()).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_client_returns_prompt_unchanged() {
        let client = EchoClient::with_delay(0);
        let out = client
            .invoke("any-backend", InvocationRequest::new("hello world"))
            .await
            .unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_echo_client_streams_whitespace_tokens() {
        let client = EchoClient::with_delay(0);
        let mut rx = client
            .invoke_stream("any-backend", InvocationRequest::new("a b c"))
            .await
            .unwrap();

        let mut tokens = Vec::new();
        while let Some(t) = rx.recv().await {
            tokens.push(t);
        }
        assert_eq!(tokens, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_echo_client_empty_prompt_stream_closes_immediately() {
        let client = EchoClient::with_delay(0);
        let mut rx = client
            .invoke_stream("any-backend", InvocationRequest::new(""))
            .await
            .unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_invocation_request_builder_chain() {
        let req = InvocationRequest::new("p")
            .with_max_tokens(128)
            .with_deadline(Duration::from_secs(5));
        assert_eq!(req.max_tokens, 128);
        assert_eq!(req.deadline, Duration::from_secs(5));
        assert!(req.schema.is_none());
    }
}

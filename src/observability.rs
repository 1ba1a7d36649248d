//! Observability module for correlation and tracing

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::Span;
use uuid::Uuid;

use crate::rpc_errors::RpcError;

/// Correlation ID for tracking one logical call across components
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-call tracing context created by the client
#[derive(Debug, Clone)]
pub struct CallContext {
    pub correlation_id: CorrelationId,
    pub operation: &'static str,
    pub method: String,
    started: Instant,
}

impl CallContext {
    pub fn new(operation: &'static str, method: &str, correlation_id: Option<CorrelationId>) -> Self {
        Self {
            correlation_id: correlation_id.unwrap_or_default(),
            operation,
            method: method.to_string(),
            started: Instant::now(),
        }
    }

    /// Span carrying the correlation id; every event of the call nests under it
    pub fn span(&self) -> Span {
        tracing::debug_span!(
            "rpc_call",
            correlation_id = %self.correlation_id,
            operation = self.operation,
            method = %self.method,
        )
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn log_outcome(&self, outcome: &Result<Value, RpcError>) {
        match outcome {
            Ok(_) => tracing::debug!(
                correlation_id = %self.correlation_id,
                method = %self.method,
                latency_ms = self.elapsed_ms(),
                "Call succeeded"
            ),
            Err(e) => tracing::warn!(
                correlation_id = %self.correlation_id,
                method = %self.method,
                kind = e.kind(),
                error = %e,
                latency_ms = self.elapsed_ms(),
                "Call failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_ids_are_unique() {
        let a = CorrelationId::new();
        let b = CorrelationId::new();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_keeps_given_id() {
        let ctx = CallContext::new("call", "getSlot", Some("req-42".into()));
        assert_eq!(ctx.correlation_id.as_str(), "req-42");

        tokio::time::advance(std::time::Duration::from_millis(15)).await;
        assert_eq!(ctx.elapsed_ms(), 15);
    }
}

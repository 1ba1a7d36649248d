use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Every failure mode surfaced by the resilience layer.
///
/// Variants are `Clone` because a single outcome is fanned out to every
/// waiter coalesced into one physical call (cache herd, batch window).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RpcError {
    /// Network or protocol failure talking to a node
    #[error("Transport error: {message} (endpoint: {endpoint})")]
    Transport { endpoint: String, message: String },

    /// Operation exceeded its deadline
    #[error("Timeout after {timeout_ms}ms (endpoint: {endpoint})")]
    Timeout { endpoint: String, timeout_ms: u64 },

    /// JSON-RPC error object returned by the node
    #[error("RPC response error: {message} (endpoint: {endpoint}, code: {code})")]
    RpcResponse {
        endpoint: String,
        code: i64,
        message: String,
    },

    /// Circuit open for this service key, no network attempt was made
    #[error("Service unavailable: circuit open for {service_key} ({open_for_ms}ms)")]
    ServiceUnavailable { service_key: String, open_for_ms: u64 },

    /// Waited past the queue deadline for a free execution slot
    #[error("Queue timeout after {waited_ms}ms (endpoint: {endpoint})")]
    QueueTimeout { endpoint: String, waited_ms: u64 },

    /// Admission rejected, the request queue is at capacity
    #[error("Queue full ({queued}/{max_size})")]
    QueueFull { queued: usize, max_size: usize },

    /// Fan-out did not produce enough agreeing responses
    #[error("Consensus not reached for {method}: best agreement {agreeing}/{required} (disagreeing: {disagreeing:?})")]
    ConsensusNotReached {
        method: String,
        required: usize,
        agreeing: usize,
        disagreeing: Vec<String>,
    },

    /// Nothing selectable in the registry
    #[error("No healthy endpoints available (total: {total}, unhealthy: {unhealthy})")]
    NoHealthyEndpoints { total: usize, unhealthy: usize },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Request rejected before dispatch (malformed address, bad shape)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The client is draining and no longer admits work
    #[error("Client is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Startup-time validation failure carrying every violation found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationError {
    pub violations: Vec<String>,
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Configuration error ({} violation(s)): {}",
            self.violations.len(),
            self.violations.join("; ")
        )
    }
}

impl std::error::Error for ConfigurationError {}

impl ConfigurationError {
    pub fn single(message: impl Into<String>) -> Self {
        Self {
            violations: vec![message.into()],
        }
    }
}

impl RpcError {
    pub fn transport(endpoint: &str, message: impl Into<String>) -> Self {
        RpcError::Transport {
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
    }

    pub fn timeout(endpoint: &str, timeout: Duration) -> Self {
        RpcError::Timeout {
            endpoint: endpoint.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            RpcError::Transport { .. } => true,
            RpcError::Timeout { .. } => true,
            RpcError::ServiceUnavailable { .. } => true,
            RpcError::QueueTimeout { .. } => true,
            RpcError::NoHealthyEndpoints { .. } => true,

            // Caller must back off rather than retry immediately
            RpcError::QueueFull { .. } => false,
            RpcError::ConsensusNotReached { .. } => false,
            RpcError::Configuration(_) => false,
            RpcError::InvalidRequest(_) => false,
            RpcError::ShuttingDown => false,
            RpcError::Internal(_) => false,

            RpcError::RpcResponse { code, .. } => is_server_side_code(*code),
        }
    }

    /// Whether this outcome counts as a failure for the circuit breaker.
    ///
    /// Application-level JSON-RPC errors (bad params, missing account) mean
    /// the node is alive and answering, so they do not trip the circuit.
    pub fn trips_breaker(&self) -> bool {
        match self {
            RpcError::Transport { .. } | RpcError::Timeout { .. } => true,
            RpcError::RpcResponse { code, .. } => is_server_side_code(*code),
            _ => false,
        }
    }

    /// Whether the strategy layer may try the same call on another endpoint
    pub fn should_failover(&self) -> bool {
        matches!(
            self,
            RpcError::Transport { .. }
                | RpcError::Timeout { .. }
                | RpcError::ServiceUnavailable { .. }
                | RpcError::QueueTimeout { .. }
        ) || matches!(self, RpcError::RpcResponse { code, .. } if is_server_side_code(*code))
    }

    /// Get the endpoint associated with this error, if any
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            RpcError::Transport { endpoint, .. } => Some(endpoint),
            RpcError::Timeout { endpoint, .. } => Some(endpoint),
            RpcError::RpcResponse { endpoint, .. } => Some(endpoint),
            RpcError::QueueTimeout { endpoint, .. } => Some(endpoint),
            _ => None,
        }
    }

    /// Short label used for metric series
    pub fn kind(&self) -> &'static str {
        match self {
            RpcError::Transport { .. } => "transport",
            RpcError::Timeout { .. } => "timeout",
            RpcError::RpcResponse { .. } => "rpc_response",
            RpcError::ServiceUnavailable { .. } => "service_unavailable",
            RpcError::QueueTimeout { .. } => "queue_timeout",
            RpcError::QueueFull { .. } => "queue_full",
            RpcError::ConsensusNotReached { .. } => "consensus_not_reached",
            RpcError::NoHealthyEndpoints { .. } => "no_healthy_endpoints",
            RpcError::Configuration(_) => "configuration",
            RpcError::InvalidRequest(_) => "invalid_request",
            RpcError::ShuttingDown => "shutting_down",
            RpcError::Internal(_) => "internal",
        }
    }
}

/// JSON-RPC server error range (-32000..=-32099) plus HTTP 5xx passed through
fn is_server_side_code(code: i64) -> bool {
    (-32099..=-32000).contains(&code) || (500..600).contains(&code)
}

/// Retry policy for failover across endpoints
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,

    /// Base delay in milliseconds
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,

    /// Jitter factor (0.0 - 1.0)
    pub jitter_factor: f64,

    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 25,
            max_delay_ms: 1000,
            jitter_factor: 0.1,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), `None` once exhausted
    pub fn calculate_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt + 1 >= self.max_attempts {
            return None;
        }

        let delay_ms = self.base_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        let delay_ms = delay_ms.min(self.max_delay_ms as f64);

        // Jitter keeps retries from different callers from lining up
        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * self.jitter_factor;
        let jittered_delay = (delay_ms * (1.0 + jitter)).max(0.0) as u64;

        Some(Duration::from_millis(jittered_delay))
    }

    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 10,
            max_delay_ms: 500,
            jitter_factor: 0.15,
            multiplier: 1.5,
        }
    }

    pub fn conservative() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 200,
            max_delay_ms: 5000,
            jitter_factor: 0.05,
            multiplier: 3.0,
        }
    }
}

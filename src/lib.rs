//! RPC Shield - resilience and throughput layer for JSON-RPC blockchain nodes
//!
//! Turns many bursty read requests into a bounded, fair, fault-tolerant stream
//! of network calls: per-endpoint rate and concurrency limits with a deadline
//! queue, per-service circuit breaking, race/consensus/dual-pair strategies,
//! request batching and a two-tier cache.

pub mod circuit_breaker;
pub mod client;
pub mod metrics;
pub mod observability;
pub mod rpc_atomics;
pub mod rpc_batch;
pub mod rpc_cache;
pub mod rpc_config;
pub mod rpc_endpoint;
pub mod rpc_errors;
pub mod rpc_executor;
pub mod rpc_pool;
pub mod rpc_transport;
pub mod test_utils;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use client::{CallOptions, ShieldClient, ShieldStats};
pub use observability::CorrelationId;
pub use rpc_cache::{fingerprint, CacheKey, TwoTierCache};
pub use rpc_config::{RetryProfile, ShieldConfig};
pub use rpc_endpoint::{HealthChangeEvent, HealthStatus};
pub use rpc_errors::{ConfigurationError, RetryPolicy, RpcError};
pub use rpc_executor::Strategy;
pub use rpc_pool::{CursorMode, Priority, ScanOptions};
pub use rpc_transport::{HttpTransport, RpcTransport};

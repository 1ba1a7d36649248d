//! Test Utilities Module
//!
//! Scriptable in-memory transport for deterministic tests of the pool,
//! strategies, batching and the client. Pair it with a paused tokio clock so
//! simulated latencies advance instantly.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::rpc_errors::RpcError;
use crate::rpc_transport::RpcTransport;

/// Computes the result for one call: `(endpoint, method, params)`
pub type Responder = Arc<dyn Fn(&str, &str, &Value) -> Result<Value, RpcError> + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct Behavior {
    latency: Duration,
    response: Option<Value>,
    failure: Option<RpcError>,
    fail_next: usize,
    fail_next_error: Option<RpcError>,
    batch_failure: Option<RpcError>,
}

/// One physical call observed by the mock
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub endpoint: String,
    pub method: String,
    /// `Some(n)` for a batch of `n` items
    pub batch_size: Option<usize>,
    pub at: Instant,
}

/// Mock transport
///
/// Unconfigured endpoints answer instantly by echoing the request back as
/// `{"endpoint", "method", "params"}`.
#[derive(Default)]
pub struct MockTransport {
    behaviors: DashMap<String, Behavior>,
    responder: RwLock<Option<Responder>>,
    calls: Mutex<Vec<CallRecord>>,
    in_flight: DashMap<String, usize>,
    peak_in_flight: DashMap<String, usize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_latency(&self, endpoint: &str, latency: Duration) {
        self.behaviors.entry(endpoint.to_string()).or_default().latency = latency;
    }

    /// Fixed result for every call to `endpoint`
    pub fn set_response(&self, endpoint: &str, response: Value) {
        self.behaviors.entry(endpoint.to_string()).or_default().response = Some(response);
    }

    /// Fail every call to `endpoint` until cleared with `None`
    pub fn set_failure(&self, endpoint: &str, failure: Option<RpcError>) {
        self.behaviors.entry(endpoint.to_string()).or_default().failure = failure;
    }

    /// Fail only the next `count` calls to `endpoint`
    pub fn fail_next(&self, endpoint: &str, count: usize, error: RpcError) {
        let mut behavior = self.behaviors.entry(endpoint.to_string()).or_default();
        behavior.fail_next = count;
        behavior.fail_next_error = Some(error);
    }

    /// Fail every batch call to `endpoint` as a whole
    pub fn set_batch_failure(&self, endpoint: &str, failure: Option<RpcError>) {
        self.behaviors.entry(endpoint.to_string()).or_default().batch_failure = failure;
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&str, &str, &Value) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        *self.responder.write() = Some(Arc::new(responder));
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_to(&self, endpoint: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.endpoint == endpoint)
            .count()
    }

    pub fn calls_for_method(&self, method: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    pub fn call_times(&self, endpoint: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.endpoint == endpoint)
            .map(|c| c.at)
            .collect()
    }

    /// Sizes of the batch calls issued for `method`
    pub fn batch_sizes(&self, method: &str) -> Vec<usize> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.method == method)
            .filter_map(|c| c.batch_size)
            .collect()
    }

    pub fn peak_in_flight(&self, endpoint: &str) -> usize {
        self.peak_in_flight.get(endpoint).map(|p| *p).unwrap_or(0)
    }

    fn begin(&self, endpoint: &str, method: &str, batch_size: Option<usize>) -> (Behavior, Option<RpcError>) {
        self.calls.lock().push(CallRecord {
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            batch_size,
            at: Instant::now(),
        });

        let mut behavior = self.behaviors.entry(endpoint.to_string()).or_default();
        let scripted = if behavior.fail_next > 0 {
            behavior.fail_next -= 1;
            behavior.fail_next_error.clone()
        } else {
            None
        };
        (behavior.clone(), scripted)
    }

    async fn in_flight_for<T>(&self, endpoint: &str, latency: Duration, result: T) -> T {
        {
            let mut current = self.in_flight.entry(endpoint.to_string()).or_insert(0);
            *current += 1;
            let mut peak = self.peak_in_flight.entry(endpoint.to_string()).or_insert(0);
            *peak = (*peak).max(*current);
        }
        let _leave = scopeguard::guard((), |_| {
            if let Some(mut current) = self.in_flight.get_mut(endpoint) {
                *current -= 1;
            }
        });

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        result
    }

    fn respond(&self, behavior: &Behavior, endpoint: &str, method: &str, params: &Value) -> Result<Value, RpcError> {
        if let Some(response) = &behavior.response {
            return Ok(response.clone());
        }
        if let Some(responder) = self.responder.read().clone() {
            return responder(endpoint, method, params);
        }
        Ok(json!({
            "endpoint": endpoint,
            "method": method,
            "params": params,
        }))
    }
}

#[async_trait]
impl RpcTransport for MockTransport {
    async fn send(&self, endpoint: &str, method: &str, params: &Value) -> Result<Value, RpcError> {
        let (behavior, scripted) = self.begin(endpoint, method, None);
        let outcome = match scripted.or_else(|| behavior.failure.clone()) {
            Some(err) => Err(err),
            None => self.respond(&behavior, endpoint, method, params),
        };
        self.in_flight_for(endpoint, behavior.latency, outcome).await
    }

    async fn send_batch(
        &self,
        endpoint: &str,
        method: &str,
        params: &[Value],
    ) -> Result<Vec<Result<Value, RpcError>>, RpcError> {
        let (behavior, scripted) = self.begin(endpoint, method, Some(params.len()));
        let outcome = match scripted
            .or_else(|| behavior.batch_failure.clone())
            .or_else(|| behavior.failure.clone())
        {
            Some(err) => Err(err),
            None => Ok(params
                .iter()
                .map(|p| self.respond(&behavior, endpoint, method, p))
                .collect()),
        };
        self.in_flight_for(endpoint, behavior.latency, outcome).await
    }
}

//! JSON-RPC 2.0 transport over HTTP
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

use crate::rpc_config::KeepAliveConfig;
use crate::rpc_errors::RpcError;

/// Wire-level access to a node. Timeouts are applied by the caller.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Issue one JSON-RPC call and return its `result`
    async fn send(&self, endpoint: &str, method: &str, params: &Value) -> Result<Value, RpcError>;

    /// Issue one JSON-RPC batch of `method` calls.
    ///
    /// The outer error fails the whole batch; inner results are per item, in
    /// the order of `params`.
    async fn send_batch(
        &self,
        endpoint: &str,
        method: &str,
        params: &[Value],
    ) -> Result<Vec<Result<Value, RpcError>>, RpcError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(keep_alive: &KeepAliveConfig) -> Result<Self, RpcError> {
        let mut builder = reqwest::Client::builder();
        builder = if keep_alive.enabled {
            let idle = Duration::from_millis(keep_alive.msecs);
            builder
                .pool_max_idle_per_host(keep_alive.sockets)
                .pool_idle_timeout(idle)
                .tcp_keepalive(idle)
        } else {
            builder.pool_max_idle_per_host(0)
        };

        let client = builder
            .build()
            .map_err(|e| RpcError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            next_id: AtomicU64::new(1),
        })
    }

    async fn post(&self, endpoint: &str, body: &Value) -> Result<Value, RpcError> {
        let response = self
            .client
            .post(endpoint)
            .json(body)
            .send()
            .await
            .map_err(|e| RpcError::transport(endpoint, e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(RpcError::transport(endpoint, "rate limited (HTTP 429)"));
        }
        if !status.is_success() {
            return Err(RpcError::RpcResponse {
                endpoint: endpoint.to_string(),
                code: i64::from(status.as_u16()),
                message: status
                    .canonical_reason()
                    .unwrap_or("HTTP error")
                    .to_string(),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| RpcError::transport(endpoint, format!("invalid JSON body: {}", e)))
    }
}

/// Split a JSON-RPC response object into its result or error
fn parse_response(endpoint: &str, mut body: Value) -> Result<Value, RpcError> {
    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
        return Err(RpcError::RpcResponse {
            endpoint: endpoint.to_string(),
            code: error.get("code").and_then(Value::as_i64).unwrap_or(-32603),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    match body.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(RpcError::transport(endpoint, "response has neither result nor error")),
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn send(&self, endpoint: &str, method: &str, params: &Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        trace!(endpoint = %endpoint, method = %method, id = id, "Sending JSON-RPC request");
        let response = self.post(endpoint, &body).await?;
        parse_response(endpoint, response)
    }

    async fn send_batch(
        &self,
        endpoint: &str,
        method: &str,
        params: &[Value],
    ) -> Result<Vec<Result<Value, RpcError>>, RpcError> {
        let base = self
            .next_id
            .fetch_add(params.len() as u64, Ordering::Relaxed);
        let body: Vec<Value> = params
            .iter()
            .enumerate()
            .map(|(i, p)| {
                json!({
                    "jsonrpc": "2.0",
                    "id": base + i as u64,
                    "method": method,
                    "params": p,
                })
            })
            .collect();

        debug!(endpoint = %endpoint, method = %method, size = params.len(), "Sending JSON-RPC batch");
        let response = self.post(endpoint, &Value::Array(body)).await?;

        let items = match response {
            Value::Array(items) => items,
            // A node may answer a whole batch with one error object
            single => {
                parse_response(endpoint, single)?;
                return Err(RpcError::transport(
                    endpoint,
                    "batch answered with a single result",
                ));
            }
        };

        // Nodes may reorder batch responses; match them back by id
        let mut by_id: HashMap<u64, Value> = items
            .into_iter()
            .filter_map(|item| item.get("id").and_then(Value::as_u64).map(|id| (id, item)))
            .collect();

        Ok((0..params.len())
            .map(|i| match by_id.remove(&(base + i as u64)) {
                Some(item) => parse_response(endpoint, item),
                None => Err(RpcError::transport(endpoint, "missing item in batch response")),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> HttpTransport {
        HttpTransport::new(&KeepAliveConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_send_returns_result() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_body(mockito::Matcher::PartialJson(json!({"method": "getSlot"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":1234}"#)
            .create_async()
            .await;

        let result = transport()
            .send(&server.url(), "getSlot", &json!([]))
            .await
            .unwrap();
        assert_eq!(result, json!(1234));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_maps_rpc_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"Invalid params"}}"#)
            .create_async()
            .await;

        let err = transport()
            .send(&server.url(), "getAccountInfo", &json!(["x"]))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::RpcResponse { code: -32602, .. }));
        assert!(!err.trips_breaker());
    }

    #[tokio::test]
    async fn test_http_status_mapping() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(429)
            .create_async()
            .await;
        let err = transport()
            .send(&server.url(), "getSlot", &json!([]))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Transport { .. }));

        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(503)
            .create_async()
            .await;
        let err = transport()
            .send(&server.url(), "getSlot", &json!([]))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::RpcResponse { code: 503, .. }));
        assert!(err.trips_breaker());
    }

    #[tokio::test]
    async fn test_batch_reorders_by_id() {
        let mut server = mockito::Server::new_async().await;
        // Fresh transport: ids start at 1
        server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[
                    {"jsonrpc":"2.0","id":3,"result":"c"},
                    {"jsonrpc":"2.0","id":1,"result":"a"},
                    {"jsonrpc":"2.0","id":2,"error":{"code":-32602,"message":"bad"}}
                ]"#,
            )
            .create_async()
            .await;

        let results = transport()
            .send_batch(
                &server.url(),
                "getAccountInfo",
                &[json!(["a"]), json!(["b"]), json!(["c"])],
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap(), &json!("a"));
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap(), &json!("c"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        let err = transport()
            .send("http://127.0.0.1:1", "getSlot", &json!([]))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Transport { .. }));
        assert!(err.is_retryable());
    }
}

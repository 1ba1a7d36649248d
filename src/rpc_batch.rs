//! Request batching and coalescing
//!
//! Single calls for the same method arriving within `flush_delay` share a
//! window. A window flushes when the delay elapses or it reaches
//! `max_batch_size`, whichever comes first. Identical `(method, params)` pairs
//! in one window become one sub-request whose result fans out to every caller.
//! Oversized sets are split into chunks. Each chunk runs under the method's
//! strategy, so a chunk is raced or retried on alternate endpoints the same way
//! a single call would be; a chunk that still fails fails only its own items.

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::rpc_cache::{fingerprint, CacheKey};
use crate::rpc_config::BatchConfig;
use crate::rpc_errors::RpcError;
use crate::rpc_executor::ParallelExecutor;
use crate::rpc_pool::Priority;

const DEDUP_NAMESPACE: &str = "batch";

type Reply = oneshot::Sender<Result<Value, RpcError>>;

struct BatchItem {
    params: Value,
    waiters: SmallVec<[Reply; 2]>,
}

struct BatchWindow {
    generation: u64,
    opened_at: Instant,
    priority: Priority,
    items: Vec<BatchItem>,
    index: HashMap<CacheKey, usize>,
}

impl BatchWindow {
    fn new(generation: u64, priority: Priority) -> Self {
        Self {
            generation,
            opened_at: Instant::now(),
            priority,
            items: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Add one caller; `true` when it joined an identical pending item
    fn push(&mut self, method: &str, params: Value, reply: Reply) -> bool {
        let key = fingerprint(DEDUP_NAMESPACE, method, &params);
        match self.index.get(&key) {
            Some(&pos) => {
                self.items[pos].waiters.push(reply);
                true
            }
            None => {
                self.index.insert(key, self.items.len());
                let mut waiters = SmallVec::new();
                waiters.push(reply);
                self.items.push(BatchItem { params, waiters });
                false
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    pub windows_flushed: u64,
    pub items_submitted: u64,
    pub duplicates_coalesced: u64,
    pub physical_calls: u64,
    pub failed_chunks: u64,
    pub open_windows: usize,
    pub pending_items: usize,
}

#[derive(Default)]
struct Counters {
    windows_flushed: AtomicU64,
    items_submitted: AtomicU64,
    duplicates_coalesced: AtomicU64,
    physical_calls: AtomicU64,
    failed_chunks: AtomicU64,
}

struct Inner {
    executor: Arc<ParallelExecutor>,
    config: BatchConfig,
    windows: Mutex<HashMap<String, BatchWindow>>,
    next_generation: AtomicU64,
    closed: Mutex<bool>,
    counters: Counters,
    metrics: Arc<Metrics>,
}

#[derive(Clone)]
pub struct BatchOptimizer {
    inner: Arc<Inner>,
}

impl BatchOptimizer {
    pub fn new(executor: Arc<ParallelExecutor>, config: BatchConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(Inner {
                executor,
                config,
                windows: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                closed: Mutex::new(false),
                counters: Counters::default(),
                metrics,
            }),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// Whether single calls of `method` go through a window: configured for
    /// batching and routed to a strategy that keeps its meaning per batch
    pub fn coalesces(&self, method: &str) -> bool {
        self.inner.config.coalesces(method)
            && self.inner.executor.select(method).supports_batching()
    }

    /// Join the open window for `method` and wait for its result
    pub async fn submit(
        &self,
        method: &str,
        params: Value,
        priority: Priority,
    ) -> Result<Value, RpcError> {
        let (tx, rx) = oneshot::channel();
        let full = {
            if *self.inner.closed.lock() {
                return Err(RpcError::ShuttingDown);
            }
            let mut windows = self.inner.windows.lock();
            let window = windows.entry(method.to_string()).or_insert_with(|| {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                self.schedule_flush(method, generation);
                BatchWindow::new(generation, priority)
            });
            window.priority = window.priority.max(priority);

            self.inner.counters.items_submitted.fetch_add(1, Ordering::Relaxed);
            if window.push(method, params, tx) {
                self.inner
                    .counters
                    .duplicates_coalesced
                    .fetch_add(1, Ordering::Relaxed);
            }

            if window.items.len() >= self.inner.config.max_batch_size.max(1) {
                windows.remove(method)
            } else {
                None
            }
        };

        if let Some(window) = full {
            debug!(method = %method, items = window.items.len(), "Batch window full, flushing");
            let this = self.clone();
            let method = method.to_string();
            tokio::spawn(async move { this.dispatch(&method, window).await });
        }

        rx.await
            .unwrap_or_else(|_| Err(RpcError::Internal("batch window dropped".to_string())))
    }

    fn schedule_flush(&self, method: &str, generation: u64) {
        let this = self.clone();
        let method = method.to_string();
        let delay = self.inner.config.flush_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let window = {
                let mut windows = this.inner.windows.lock();
                match windows.get(&method) {
                    Some(window) if window.generation == generation => windows.remove(&method),
                    _ => None,
                }
            };
            if let Some(window) = window {
                this.dispatch(&method, window).await;
            }
        });
    }

    /// Issue an explicit set of calls as batches, results in `specs` order
    pub async fn batch_request(
        &self,
        method: &str,
        specs: Vec<Value>,
        priority: Priority,
    ) -> Vec<Result<Value, RpcError>> {
        if specs.is_empty() {
            return Vec::new();
        }
        if *self.inner.closed.lock() {
            return specs.iter().map(|_| Err(RpcError::ShuttingDown)).collect();
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut window = BatchWindow::new(generation, priority);
        let receivers: Vec<_> = specs
            .into_iter()
            .map(|params| {
                let (tx, rx) = oneshot::channel();
                if window.push(method, params, tx) {
                    self.inner
                        .counters
                        .duplicates_coalesced
                        .fetch_add(1, Ordering::Relaxed);
                }
                rx
            })
            .collect();
        self.inner
            .counters
            .items_submitted
            .fetch_add(receivers.len() as u64, Ordering::Relaxed);

        self.dispatch(method, window).await;

        join_all(receivers)
            .await
            .into_iter()
            .map(|received| {
                received.unwrap_or_else(|_| {
                    Err(RpcError::Internal("batch result dropped".to_string()))
                })
            })
            .collect()
    }

    /// Send a window as chunks and resolve every waiter
    async fn dispatch(&self, method: &str, window: BatchWindow) {
        let inner = &self.inner;
        let chunk_size = inner.config.max_batch_size.max(1);
        let waited_ms = window.opened_at.elapsed().as_millis() as u64;
        let priority = window.priority;
        let items = window.items;

        inner.counters.windows_flushed.fetch_add(1, Ordering::Relaxed);
        inner.metrics.batch_flushes_total.inc();
        inner.metrics.batch_items_total.inc_by(items.len() as u64);

        let chunks: Vec<Vec<BatchItem>> = {
            let mut chunks = Vec::with_capacity(items.len().div_ceil(chunk_size));
            let mut items = items.into_iter().peekable();
            while items.peek().is_some() {
                chunks.push(items.by_ref().take(chunk_size).collect());
            }
            chunks
        };

        debug!(
            method = %method,
            chunks = chunks.len(),
            waited_ms = waited_ms,
            "Flushing batch window"
        );

        if inner.config.parallel_chunks {
            join_all(
                chunks
                    .into_iter()
                    .map(|chunk| self.dispatch_chunk(method, chunk, priority)),
            )
            .await;
        } else {
            for chunk in chunks {
                self.dispatch_chunk(method, chunk, priority).await;
            }
        }
    }

    async fn dispatch_chunk(&self, method: &str, chunk: Vec<BatchItem>, priority: Priority) {
        let inner = &self.inner;
        let params: Vec<Value> = chunk.iter().map(|item| item.params.clone()).collect();

        inner.counters.physical_calls.fetch_add(1, Ordering::Relaxed);
        inner.metrics.batch_physical_calls_total.inc();

        match inner
            .executor
            .execute_batch(method, &params, priority)
            .await
        {
            Ok(results) => {
                for (item, result) in chunk.into_iter().zip(results) {
                    resolve(item, result);
                }
            }
            Err(e) => {
                warn!(method = %method, size = params.len(), error = %e, "Batch chunk failed");
                inner.counters.failed_chunks.fetch_add(1, Ordering::Relaxed);
                inner.metrics.batch_failed_chunks_total.inc();
                for item in chunk {
                    resolve(item, Err(e.clone()));
                }
            }
        }
    }

    /// Flush every open window now
    pub async fn flush_all(&self) {
        let windows: Vec<(String, BatchWindow)> = self.inner.windows.lock().drain().collect();
        if windows.is_empty() {
            return;
        }
        info!(windows = windows.len(), "Flushing open batch windows");
        join_all(
            windows
                .into_iter()
                .map(|(method, window)| async move { self.dispatch(&method, window).await }),
        )
        .await;
    }

    /// Reject new submissions and flush what is pending
    pub async fn close(&self) {
        *self.inner.closed.lock() = true;
        self.flush_all().await;
    }

    pub fn stats(&self) -> BatchStats {
        let counters = &self.inner.counters;
        let windows = self.inner.windows.lock();
        BatchStats {
            windows_flushed: counters.windows_flushed.load(Ordering::Relaxed),
            items_submitted: counters.items_submitted.load(Ordering::Relaxed),
            duplicates_coalesced: counters.duplicates_coalesced.load(Ordering::Relaxed),
            physical_calls: counters.physical_calls.load(Ordering::Relaxed),
            failed_chunks: counters.failed_chunks.load(Ordering::Relaxed),
            open_windows: windows.len(),
            pending_items: windows.values().map(|w| w.items.len()).sum(),
        }
    }
}

fn resolve(item: BatchItem, result: Result<Value, RpcError>) {
    let mut waiters = item.waiters.into_iter();
    let Some(last) = waiters.next_back() else {
        return;
    };
    for waiter in waiters {
        let _ = waiter.send(result.clone());
    }
    let _ = last.send(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc_config::ShieldConfig;
    use crate::rpc_pool::ConnectionPool;
    use crate::test_utils::MockTransport;
    use crate::rpc_executor::Strategy;
    use serde_json::json;
    use std::time::Duration;

    fn url(i: usize) -> String {
        format!("http://node-{}.local", i)
    }

    fn setup(n: usize, tweak: impl FnOnce(&mut ShieldConfig)) -> (BatchOptimizer, Arc<MockTransport>) {
        let mut config = ShieldConfig::from_urls(&(0..n).map(url).collect::<Vec<_>>());
        tweak(&mut config);
        let mock = Arc::new(MockTransport::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let pool = Arc::new(ConnectionPool::new(&config, mock.clone(), metrics.clone()));
        let executor = Arc::new(ParallelExecutor::new(
            pool,
            &config.strategy,
            config.hedging.clone(),
            metrics.clone(),
        ));
        (BatchOptimizer::new(executor, config.batch.clone(), metrics), mock)
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_coalesces_into_chunks() {
        let (batcher, mock) = setup(1, |c| {
            c.batch.max_batch_size = 10;
            c.batch.flush_delay_ms = 10;
        });

        let calls = (0..37).map(|i| {
            let batcher = batcher.clone();
            tokio::spawn(async move {
                batcher
                    .submit("getAccountInfo", json!([format!("acc-{}", i)]), Priority::Normal)
                    .await
            })
        });
        let results = join_all(calls).await;

        for (i, result) in results.into_iter().enumerate() {
            let value = result.unwrap().unwrap();
            assert_eq!(value["params"], json!([format!("acc-{}", i)]));
        }
        let sizes = mock.batch_sizes("getAccountInfo");
        assert!(sizes.len() <= 4, "{} physical calls", sizes.len());
        assert_eq!(sizes.iter().sum::<usize>(), 37);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_after_delay() {
        let (batcher, mock) = setup(1, |c| c.batch.flush_delay_ms = 25);

        let started = Instant::now();
        let value = batcher
            .submit("getAccountInfo", json!(["a"]), Priority::Normal)
            .await
            .unwrap();
        assert_eq!(value["params"], json!(["a"]));
        assert!(started.elapsed() >= Duration::from_millis(25));
        assert_eq!(mock.batch_sizes("getAccountInfo"), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_requests_share_one_item() {
        let (batcher, mock) = setup(1, |_| {});

        let (a, b, c) = tokio::join!(
            batcher.submit("getAccountInfo", json!(["same", {"encoding": "base64"}]), Priority::Normal),
            batcher.submit("getAccountInfo", json!(["same", {"encoding": "base64"}]), Priority::Normal),
            batcher.submit("getAccountInfo", json!(["other"]), Priority::Normal),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert!(c.is_ok());
        assert_eq!(mock.batch_sizes("getAccountInfo"), vec![2]);

        let stats = batcher.stats();
        assert_eq!(stats.items_submitted, 3);
        assert_eq!(stats.duplicates_coalesced, 1);
        assert_eq!(stats.physical_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_request_orders_results() {
        let (batcher, mock) = setup(1, |c| c.batch.max_batch_size = 3);
        mock.set_responder(|_, _, params| Ok(params[0].clone()));

        let specs: Vec<Value> = (0..7).map(|i| json!([i])).collect();
        let results = batcher
            .batch_request("getTransaction", specs, Priority::Normal)
            .await;

        let values: Vec<Value> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, (0..7).map(|i| json!(i)).collect::<Vec<_>>());
        assert_eq!(mock.batch_sizes("getTransaction"), vec![3, 3, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_chunk_is_isolated() {
        let (batcher, mock) = setup(1, |c| {
            c.batch.max_batch_size = 2;
            c.batch.parallel_chunks = false;
            c.strategy.retry_max_attempts = Some(1);
        });
        mock.fail_next(&url(0), 1, RpcError::transport(&url(0), "connection reset"));

        let results = batcher
            .batch_request(
                "getTransaction",
                vec![json!(["a"]), json!(["b"]), json!(["c"]), json!(["d"])],
                Priority::Normal,
            )
            .await;

        assert!(results[0].is_err());
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap()["params"], json!(["c"]));
        assert_eq!(results[3].as_ref().unwrap()["params"], json!(["d"]));
        assert_eq!(batcher.stats().failed_chunks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_whole_batch_failure_reaches_every_item() {
        let (batcher, mock) = setup(1, |c| c.strategy.retry_max_attempts = Some(1));
        mock.set_batch_failure(&url(0), Some(RpcError::transport(&url(0), "502 bad gateway")));

        let results = batcher
            .batch_request(
                "getTransaction",
                vec![json!(["a"]), json!(["b"]), json!(["c"])],
                Priority::Normal,
            )
            .await;
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(RpcError::Transport { .. }))));
        assert_eq!(mock.batch_sizes("getTransaction"), vec![3]);

        // Recovers once the node accepts batches again
        mock.set_batch_failure(&url(0), None);
        let results = batcher
            .batch_request("getTransaction", vec![json!(["d"])], Priority::Normal)
            .await;
        assert!(results[0].is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_chunk_retried_on_next_endpoint() {
        let (batcher, mock) = setup(2, |c| c.batch.max_batch_size = 2);
        mock.set_batch_failure(&url(0), Some(RpcError::transport(&url(0), "502 bad gateway")));

        let results = batcher
            .batch_request(
                "getTransaction",
                vec![json!(["a"]), json!(["b"]), json!(["c"])],
                Priority::Normal,
            )
            .await;

        for (result, sig) in results.iter().zip(["a", "b", "c"]) {
            let value = result.as_ref().unwrap();
            assert_eq!(value["params"], json!([sig]));
            assert_eq!(value["endpoint"], json!(url(1)));
        }
        assert_eq!(batcher.stats().failed_chunks, 0);
    }

    #[test]
    fn test_only_batchable_strategies_coalesce() {
        let config = ShieldConfig::from_urls(&[url(0)]);
        let metrics = Arc::new(Metrics::new().unwrap());
        let pool = Arc::new(ConnectionPool::new(
            &config,
            Arc::new(MockTransport::new()),
            metrics.clone(),
        ));
        let executor = Arc::new(ParallelExecutor::new(
            pool,
            &config.strategy,
            config.hedging.clone(),
            metrics.clone(),
        ));
        let mut batch = config.batch.clone();
        batch.methods.push("getSignatureStatuses".to_string());
        let batcher = BatchOptimizer::new(executor.clone(), batch, metrics);

        assert!(batcher.coalesces("getAccountInfo"));
        assert!(batcher.coalesces("getTransaction"));
        // Consensus needs independent per-node answers
        assert!(!batcher.coalesces("getSignatureStatuses"));

        executor.set_strategy("getSignatureStatuses", Strategy::Race);
        assert!(batcher.coalesces("getSignatureStatuses"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_item_errors_pass_through() {
        let (batcher, mock) = setup(1, |_| {});
        mock.set_responder(|endpoint, _, params| {
            if params[0] == json!("bad") {
                Err(RpcError::RpcResponse {
                    endpoint: endpoint.to_string(),
                    code: -32602,
                    message: "invalid pubkey".to_string(),
                })
            } else {
                Ok(json!("ok"))
            }
        });

        let results = batcher
            .batch_request("getAccountInfo", vec![json!(["good"]), json!(["bad"])], Priority::Normal)
            .await;
        assert_eq!(results[0].as_ref().unwrap(), &json!("ok"));
        assert!(matches!(results[1], Err(RpcError::RpcResponse { code: -32602, .. })));
        assert_eq!(batcher.stats().failed_chunks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_and_rejects() {
        let (batcher, mock) = setup(1, |c| c.batch.flush_delay_ms = 10_000);

        let pending = {
            let batcher = batcher.clone();
            tokio::spawn(async move {
                batcher
                    .submit("getAccountInfo", json!(["a"]), Priority::Normal)
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(batcher.stats().pending_items, 1);

        batcher.close().await;
        assert!(pending.await.unwrap().is_ok());
        assert_eq!(mock.batch_sizes("getAccountInfo"), vec![1]);
        assert!(matches!(
            batcher.submit("getAccountInfo", json!(["b"]), Priority::Normal).await,
            Err(RpcError::ShuttingDown)
        ));
    }
}

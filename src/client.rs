//! Client façade
//!
//! The only entry point callers need. A call flows through
//! cache → batch window → strategy → pool → breaker → endpoint, and the
//! result flows back populating the cache and resolving every coalesced waiter.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use crate::circuit_breaker::BreakerStats;
use crate::metrics::Metrics;
use crate::observability::{CallContext, CorrelationId};
use crate::rpc_batch::{BatchOptimizer, BatchStats};
use crate::rpc_cache::{CacheStats, TwoTierCache};
use crate::rpc_config::ShieldConfig;
use crate::rpc_endpoint::HealthChangeEvent;
use crate::rpc_errors::RpcError;
use crate::rpc_executor::{ExecutorStats, ParallelExecutor, Strategy};
use crate::rpc_pool::{ConnectionPool, PoolStats, Priority, ScanOptions};
use crate::rpc_transport::{HttpTransport, RpcTransport};

const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub priority: Priority,
    /// Overrides the strategy table for this call
    pub strategy: Option<Strategy>,
    /// Cache the result for this long, overriding the method table
    pub ttl: Option<Duration>,
    pub bypass_cache: bool,
    pub correlation_id: Option<CorrelationId>,
}

impl CallOptions {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn bypass_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }

    pub fn correlation_id(mut self, id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Health and metrics snapshot of every component
#[derive(Debug, Clone, Serialize)]
pub struct ShieldStats {
    pub pool: PoolStats,
    pub breaker: BreakerStats,
    pub cache: CacheStats,
    pub batch: BatchStats,
    pub executor: ExecutorStats,
    pub active_calls: usize,
}

struct ClientInner {
    config: ShieldConfig,
    metrics: Arc<Metrics>,
    pool: Arc<ConnectionPool>,
    executor: Arc<ParallelExecutor>,
    batcher: BatchOptimizer,
    cache: TwoTierCache,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    active_calls: AtomicUsize,
}

impl ClientInner {
    /// Uncached path: batch window for coalesced methods, strategy otherwise
    async fn dispatch(&self, method: &str, params: Value, options: &CallOptions) -> Result<Value, RpcError> {
        if options.strategy.is_none() && self.batcher.coalesces(method) {
            return self.batcher.submit(method, params, options.priority).await;
        }
        self.executor
            .execute(method, &params, options.priority, options.strategy)
            .await
    }
}

#[derive(Clone)]
pub struct ShieldClient {
    inner: Arc<ClientInner>,
}

impl ShieldClient {
    /// Validate `config` and assemble every component over `transport`
    pub fn new(config: ShieldConfig, transport: Arc<dyn RpcTransport>) -> Result<Self, RpcError> {
        config.validate()?;
        let metrics = Arc::new(
            Metrics::new().map_err(|e| RpcError::Internal(format!("metrics registry: {}", e)))?,
        );

        let pool = Arc::new(ConnectionPool::new(&config, transport, metrics.clone()));
        let executor = Arc::new(ParallelExecutor::new(
            pool.clone(),
            &config.strategy,
            config.hedging.clone(),
            metrics.clone(),
        ));
        let batcher = BatchOptimizer::new(executor.clone(), config.batch.clone(), metrics.clone());
        let cache = TwoTierCache::new(config.cache.clone(), metrics.clone());
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            endpoints = config.endpoints.len(),
            breaker = config.breaker.enabled,
            hedging = config.hedging.enabled,
            cache = config.cache.enabled,
            batching = config.batch.enabled,
            "RPC shield initialized"
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                metrics,
                pool,
                executor,
                batcher,
                cache,
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                active_calls: AtomicUsize::new(0),
            }),
        })
    }

    /// Same as [`new`](Self::new) over the HTTP transport
    pub fn connect(config: ShieldConfig) -> Result<Self, RpcError> {
        let transport = HttpTransport::new(&config.keep_alive)?;
        Self::new(config, Arc::new(transport))
    }

    /// Spawn health probing, queue sweeping and cache sweeping
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() || self.inner.closed.load(Ordering::Acquire) {
            return;
        }

        let pool = self.inner.pool.clone();
        tasks.push(tokio::spawn(
            pool.run_health_checks(self.inner.shutdown_tx.subscribe()),
        ));

        let pool = self.inner.pool.clone();
        tasks.push(tokio::spawn(
            pool.run_queue_sweeper(self.inner.shutdown_tx.subscribe()),
        ));

        if self.inner.config.cache.enabled {
            let cache = self.inner.cache.clone();
            let mut shutdown = self.inner.shutdown_tx.subscribe();
            let period = Duration::from_millis(self.inner.config.cache.sweep_interval_ms.max(1));
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            cache.sweep_expired();
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        info!(tasks = tasks.len(), "Background tasks started");
    }

    pub async fn call(&self, method: &str, params: Value, options: CallOptions) -> Result<Value, RpcError> {
        let ctx = CallContext::new("call", method, options.correlation_id.clone());
        let outcome = self
            .tracked(self.call_inner(method, params, options))
            .instrument(ctx.span())
            .await;
        self.finish(&ctx, outcome)
    }

    async fn call_inner(&self, method: &str, params: Value, options: CallOptions) -> Result<Value, RpcError> {
        let inner = &self.inner;
        let ttl = options.ttl.or_else(|| inner.cache.config().ttl_for(method));
        let ttl = match ttl {
            Some(ttl) if inner.config.cache.enabled && !options.bypass_cache => ttl,
            _ => return inner.dispatch(method, params, &options).await,
        };

        let key = inner.cache.key_for(method, &params);
        let fetch_inner = inner.clone();
        let fetch_method = method.to_string();
        inner
            .cache
            .get(key, ttl, move || async move {
                fetch_inner
                    .dispatch(&fetch_method, params, &options)
                    .await
            })
            .await
    }

    /// Cursor-parallel pagination of a list method
    pub async fn scan(
        &self,
        method: &str,
        address: &str,
        options: ScanOptions,
    ) -> Result<Vec<Value>, RpcError> {
        let ctx = CallContext::new("scan", method, None);
        let outcome = self
            .tracked(self.inner.pool.scan(method, address, &options))
            .instrument(ctx.span())
            .await;
        if let Err(e) = &outcome {
            self.inner.metrics.record_error(e.kind());
            warn!(correlation_id = %ctx.correlation_id, error = %e, "Scan failed");
        }
        outcome
    }

    /// Explicit multi-item call, results in `specs` order
    pub async fn batch_request(
        &self,
        method: &str,
        specs: Vec<Value>,
        priority: Priority,
    ) -> Result<Vec<Result<Value, RpcError>>, RpcError> {
        let ctx = CallContext::new("batch_request", method, None);
        let results = self
            .tracked(async { Ok(self.inner.batcher.batch_request(method, specs, priority).await) })
            .instrument(ctx.span())
            .await?;
        for e in results.iter().filter_map(|r| r.as_ref().err()) {
            self.inner.metrics.record_error(e.kind());
        }
        Ok(results)
    }

    /// Run `work` counted as an active call, refusing it once shut down
    async fn tracked<T, F>(&self, work: F) -> Result<T, RpcError>
    where
        F: std::future::Future<Output = Result<T, RpcError>>,
    {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::ShuttingDown);
        }
        self.inner.active_calls.fetch_add(1, Ordering::AcqRel);
        let _active = scopeguard::guard((), |_| {
            self.inner.active_calls.fetch_sub(1, Ordering::AcqRel);
        });
        work.await
    }

    fn finish(&self, ctx: &CallContext, outcome: Result<Value, RpcError>) -> Result<Value, RpcError> {
        if let Err(e) = &outcome {
            self.inner.metrics.record_error(e.kind());
        }
        ctx.log_outcome(&outcome);
        outcome
    }

    pub fn get_stats(&self) -> ShieldStats {
        ShieldStats {
            pool: self.inner.pool.stats(),
            breaker: self.inner.pool.breaker().stats(),
            cache: self.inner.cache.stats(),
            batch: self.inner.batcher.stats(),
            executor: self.inner.executor.stats(),
            active_calls: self.inner.active_calls.load(Ordering::Acquire),
        }
    }

    pub fn subscribe_health_events(&self) -> broadcast::Receiver<HealthChangeEvent> {
        self.inner.pool.registry().subscribe_health_events()
    }

    /// Prometheus text exposition of every metric
    pub fn metrics_text(&self) -> Result<String, RpcError> {
        self.inner
            .metrics
            .render()
            .map_err(|e| RpcError::Internal(format!("metrics encoding: {}", e)))
    }

    pub fn executor(&self) -> &ParallelExecutor {
        &self.inner.executor
    }

    pub fn cache(&self) -> &TwoTierCache {
        &self.inner.cache
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.inner.pool
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop accepting calls, drain in-flight work, stop background tasks
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down RPC shield");

        let _ = self.inner.shutdown_tx.send(true);
        self.inner.batcher.close().await;

        let grace = Duration::from_millis(self.inner.config.limits.shutdown_grace_ms);
        let deadline = Instant::now() + grace;
        while self.inner.active_calls.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        let remaining = self.inner.active_calls.load(Ordering::Acquire);
        if remaining > 0 {
            warn!(
                remaining = remaining,
                grace_ms = grace.as_millis() as u64,
                "Grace period elapsed with calls still active"
            );
        }

        self.inner.pool.close();

        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                debug!(error = %e, "Background task ended abnormally");
            }
        }
        info!("RPC shield stopped");
    }
}

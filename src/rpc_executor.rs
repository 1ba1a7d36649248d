//! Parallel execution strategies
//!
//! A logical call runs under one of four strategies, looked up by method name:
//! - `Single`: best endpoint, retried on alternates, optionally hedged
//! - `Race`: same call to several endpoints, first success wins
//! - `Consensus`: fan out and wait until enough responses agree
//! - `DualPair`: speed set against reliability set, first complete result wins
//!
//! The method table lives in an `ArcSwap` and can be replaced at runtime.

use arc_swap::ArcSwap;
use futures::stream::{FuturesUnordered, StreamExt};
use itertools::Itertools;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::rpc_cache::canonical_string;
use crate::rpc_config::{ConsensusConfig, DualPairConfig, HedgingConfig, StrategyConfig};
use crate::rpc_endpoint::Endpoint;
use crate::rpc_errors::{RetryPolicy, RpcError};
use crate::rpc_pool::{ConnectionPool, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    Single,
    Race,
    Consensus,
    DualPair,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Single => "single",
            Strategy::Race => "race",
            Strategy::Consensus => "consensus",
            Strategy::DualPair => "dual_pair",
        }
    }

    /// Whether a coalesced batch keeps this strategy's meaning
    pub fn supports_batching(&self) -> bool {
        matches!(self, Strategy::Single | Strategy::Race)
    }
}

/// Method name to strategy lookup
#[derive(Debug, Clone, Default)]
pub struct StrategyTable {
    default: Strategy,
    methods: HashMap<String, Strategy>,
}

impl StrategyTable {
    pub fn new(default: Strategy, methods: HashMap<String, Strategy>) -> Self {
        Self { default, methods }
    }

    pub fn from_config(config: &StrategyConfig) -> Self {
        Self::new(config.default, config.methods.clone())
    }

    pub fn select(&self, method: &str) -> Strategy {
        self.methods.get(method).copied().unwrap_or(self.default)
    }
}

/// Decides whether a dual-pair result is worth returning early
pub type CompletenessFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Non-null and, for arrays and objects, non-empty
pub fn is_complete(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}

/// Rolling statistics for one endpoint set of the dual-pair strategy
#[derive(Debug, Clone, Serialize)]
pub struct PairStats {
    pub calls: u64,
    pub wins: u64,
    /// EWMA of call outcomes, 1.0 meaning every call succeeded
    pub success_rate: f64,
    pub avg_latency_ms: f64,
}

impl Default for PairStats {
    fn default() -> Self {
        Self {
            calls: 0,
            wins: 0,
            success_rate: 1.0,
            avg_latency_ms: 0.0,
        }
    }
}

impl PairStats {
    fn record(&mut self, success: bool, latency_ms: f64, alpha: f64) {
        let outcome = if success { 1.0 } else { 0.0 };
        if self.calls == 0 {
            self.success_rate = outcome;
            self.avg_latency_ms = latency_ms;
        } else {
            self.success_rate = alpha * outcome + (1.0 - alpha) * self.success_rate;
            self.avg_latency_ms = alpha * latency_ms + (1.0 - alpha) * self.avg_latency_ms;
        }
        self.calls += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pair {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStats {
    pub single: u64,
    pub race: u64,
    pub consensus: u64,
    pub dual_pair: u64,
    pub retries: u64,
    pub hedges_fired: u64,
    pub primary_pair: PairStats,
    pub secondary_pair: PairStats,
}

#[derive(Default)]
struct Counters {
    single: AtomicU64,
    race: AtomicU64,
    consensus: AtomicU64,
    dual_pair: AtomicU64,
    retries: AtomicU64,
    hedges_fired: AtomicU64,
}

pub struct ParallelExecutor {
    pool: Arc<ConnectionPool>,
    table: ArcSwap<StrategyTable>,
    race_fanout: usize,
    consensus: ConsensusConfig,
    dual_pair: DualPairConfig,
    hedging: HedgingConfig,
    retry: RetryPolicy,
    completeness: CompletenessFn,
    pairs: Mutex<(PairStats, PairStats)>,
    counters: Counters,
    metrics: Arc<Metrics>,
}

impl ParallelExecutor {
    pub fn new(
        pool: Arc<ConnectionPool>,
        strategy: &StrategyConfig,
        hedging: HedgingConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pool,
            table: ArcSwap::from_pointee(StrategyTable::from_config(strategy)),
            race_fanout: strategy.race_fanout.max(2),
            consensus: strategy.consensus.clone(),
            dual_pair: strategy.dual_pair.clone(),
            hedging,
            retry: strategy.retry_policy(),
            completeness: Arc::new(is_complete),
            pairs: Mutex::new((PairStats::default(), PairStats::default())),
            counters: Counters::default(),
            metrics,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_completeness(mut self, completeness: CompletenessFn) -> Self {
        self.completeness = completeness;
        self
    }

    pub fn select(&self, method: &str) -> Strategy {
        self.table.load().select(method)
    }

    /// Replace the whole method table
    pub fn update_table(&self, table: StrategyTable) {
        self.table.store(Arc::new(table));
        info!("Strategy table updated");
    }

    /// Route one method to `strategy`
    pub fn set_strategy(&self, method: &str, strategy: Strategy) {
        self.table.rcu(|current| {
            let mut next = StrategyTable::clone(current);
            next.methods.insert(method.to_string(), strategy);
            next
        });
        debug!(method = %method, strategy = strategy.as_str(), "Strategy override set");
    }

    /// Run `method` under the strategy of the table, or `strategy` if given
    pub async fn execute(
        &self,
        method: &str,
        params: &Value,
        priority: Priority,
        strategy: Option<Strategy>,
    ) -> Result<Value, RpcError> {
        let strategy = strategy.unwrap_or_else(|| self.select(method));
        self.run(strategy, method, params, priority).await
    }

    pub async fn run(
        &self,
        strategy: Strategy,
        method: &str,
        params: &Value,
        priority: Priority,
    ) -> Result<Value, RpcError> {
        self.count(strategy);
        let outcome = match strategy {
            Strategy::Single => self.single(method, params, priority).await,
            Strategy::Race => self.race(method, params, priority).await,
            Strategy::Consensus => self.consensus(method, params, priority).await,
            Strategy::DualPair => self.dual_pair(method, params, priority).await,
        };
        self.observe(strategy, outcome.is_ok());
        outcome
    }

    /// Send one batch of `method` calls under the method's strategy.
    ///
    /// `Race` races whole batches; everything else retries the batch on
    /// alternate endpoints like a `Single` call.
    pub async fn execute_batch(
        &self,
        method: &str,
        params: &[Value],
        priority: Priority,
    ) -> Result<Vec<Result<Value, RpcError>>, RpcError> {
        let strategy = match self.select(method) {
            Strategy::Race => Strategy::Race,
            _ => Strategy::Single,
        };
        self.count(strategy);
        let outcome = self.batch(strategy, method, params, priority).await;
        self.observe(strategy, outcome.is_ok());
        outcome
    }

    async fn batch(
        &self,
        strategy: Strategy,
        method: &str,
        params: &[Value],
        priority: Priority,
    ) -> Result<Vec<Result<Value, RpcError>>, RpcError> {
        let endpoints = self.candidates(method)?;
        if strategy == Strategy::Race {
            let fanout = self.race_fanout.min(endpoints.len());
            return self
                .race_legs(method, &endpoints[..fanout], |endpoint| {
                    self.pool.call_batch_endpoint(endpoint, method, params, priority)
                })
                .await;
        }

        let order = self.retry_order(endpoints, method);
        self.with_retry(method, &order, |endpoint| {
            self.pool.call_batch_endpoint(endpoint, method, params, priority)
        })
        .await
    }

    fn count(&self, strategy: Strategy) {
        let counter = match strategy {
            Strategy::Single => &self.counters.single,
            Strategy::Race => &self.counters.race,
            Strategy::Consensus => &self.counters.consensus,
            Strategy::DualPair => &self.counters.dual_pair,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn observe(&self, strategy: Strategy, success: bool) {
        self.metrics
            .strategy_calls_total
            .with_label_values(&[strategy.as_str(), if success { "success" } else { "failure" }])
            .inc();
    }

    /// Selectable endpoints by score, open circuits last
    fn candidates(&self, method: &str) -> Result<Vec<Arc<Endpoint>>, RpcError> {
        let ranked = self.pool.registry().ranked_by_score();
        if ranked.is_empty() {
            return Err(self.pool.no_healthy_endpoints());
        }
        let breaker = self.pool.breaker();
        let (admitted, blocked): (Vec<_>, Vec<_>) = ranked
            .into_iter()
            .partition(|e| breaker.allows(&e.service_key(method)));
        Ok(admitted.into_iter().chain(blocked).collect())
    }

    async fn single(&self, method: &str, params: &Value, priority: Priority) -> Result<Value, RpcError> {
        let endpoints = self.candidates(method)?;
        if endpoints.len() > 1 && self.hedging.applies_to(method) {
            return self.hedged(&endpoints, method, params, priority).await;
        }

        let order = self.retry_order(endpoints, method);
        self.with_retry(method, &order, |endpoint| {
            self.pool.call_endpoint(endpoint, method, params, priority)
        })
        .await
    }

    /// The pool's preferred endpoint first, then every other candidate once
    fn retry_order(&self, mut endpoints: Vec<Arc<Endpoint>>, method: &str) -> Vec<Arc<Endpoint>> {
        if let Some(first) = self.pool.preferred(&endpoints, method) {
            let preferred = endpoints.remove(first);
            endpoints.insert(0, preferred);
        }
        endpoints
    }

    /// Run `call` on `order[0]`, retrying retryable errors on the next endpoint
    /// of `order` until the retry policy is exhausted
    async fn with_retry<'a, T, F, Fut>(
        &self,
        method: &str,
        order: &'a [Arc<Endpoint>],
        mut call: F,
    ) -> Result<T, RpcError>
    where
        F: FnMut(&'a Arc<Endpoint>) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let endpoint = &order[attempt as usize % order.len()];
            match call(endpoint).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => match self.retry.calculate_delay(attempt) {
                    Some(delay) => {
                        attempt += 1;
                        debug!(
                            method = %method,
                            attempt = attempt,
                            next = %order[attempt as usize % order.len()].url(),
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Retrying on alternate endpoint"
                        );
                        self.counters.retries.fetch_add(1, Ordering::Relaxed);
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Primary call plus up to `max_extra` delayed duplicates on alternates
    async fn hedged(
        &self,
        endpoints: &[Arc<Endpoint>],
        method: &str,
        params: &Value,
        priority: Priority,
    ) -> Result<Value, RpcError> {
        let delay = self.hedging.delay();
        let mut extras = endpoints[1..].iter().take(self.hedging.max_extra).peekable();
        let mut in_flight = FuturesUnordered::new();
        in_flight.push(self.pool.call_endpoint(&endpoints[0], method, params, priority));

        let hedge_timer = tokio::time::sleep(delay);
        tokio::pin!(hedge_timer);
        let mut last_err = None;

        loop {
            tokio::select! {
                Some(outcome) = in_flight.next() => match outcome {
                    Ok(value) => return Ok(value),
                    Err(e) if !e.should_failover() => return Err(e),
                    Err(e) => {
                        debug!(method = %method, error = %e, "Hedged call leg failed");
                        last_err = Some(e);
                        if in_flight.is_empty() {
                            match extras.next() {
                                Some(next) => {
                                    in_flight.push(self.pool.call_endpoint(next, method, params, priority));
                                    hedge_timer.as_mut().reset(Instant::now() + delay);
                                }
                                None => break,
                            }
                        }
                    }
                },
                _ = &mut hedge_timer, if extras.peek().is_some() => {
                    if let Some(next) = extras.next() {
                        debug!(
                            method = %method,
                            endpoint = %next.url(),
                            delay_ms = self.hedging.delay_ms,
                            "Hedge delay elapsed, firing duplicate request"
                        );
                        self.counters.hedges_fired.fetch_add(1, Ordering::Relaxed);
                        self.metrics.hedges_fired_total.inc();
                        in_flight.push(self.pool.call_endpoint(next, method, params, priority));
                    }
                    hedge_timer.as_mut().reset(Instant::now() + delay);
                }
                else => break,
            }
        }

        Err(last_err.unwrap_or_else(|| self.pool.no_healthy_endpoints()))
    }

    async fn race(&self, method: &str, params: &Value, priority: Priority) -> Result<Value, RpcError> {
        let endpoints = self.candidates(method)?;
        let fanout = self.race_fanout.min(endpoints.len());
        self.race_legs(method, &endpoints[..fanout], |endpoint| {
            self.pool.call_endpoint(endpoint, method, params, priority)
        })
        .await
    }

    /// Start `call` on every leg, first success wins
    async fn race_legs<'a, T, F, Fut>(
        &self,
        method: &str,
        legs: &'a [Arc<Endpoint>],
        call: F,
    ) -> Result<T, RpcError>
    where
        F: Fn(&'a Arc<Endpoint>) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let mut in_flight: FuturesUnordered<_> = legs.iter().map(call).collect();

        let mut last_err = None;
        while let Some(outcome) = in_flight.next().await {
            match outcome {
                // Dropping the rest abandons the slower legs
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!(method = %method, error = %e, "Race leg failed");
                    last_err = Some(e);
                }
            }
        }

        let err = last_err.unwrap_or_else(|| self.pool.no_healthy_endpoints());
        warn!(method = %method, fanout = legs.len(), error = %err, "Every race leg failed");
        Err(err)
    }

    async fn consensus(&self, method: &str, params: &Value, priority: Priority) -> Result<Value, RpcError> {
        let endpoints = self.candidates(method)?;
        let fanout = self.consensus.fanout.max(1).min(endpoints.len());
        let required = self.consensus.min_consensus.max(1);
        let deadline = Instant::now() + std::time::Duration::from_millis(self.consensus.timeout_ms);

        let mut in_flight: FuturesUnordered<_> = endpoints[..fanout]
            .iter()
            .map(|endpoint| async move {
                let outcome = self.pool.call_endpoint(endpoint, method, params, priority).await;
                (endpoint.url().to_string(), outcome)
            })
            .collect();

        // (comparison key, first value seen, endpoints that returned it)
        let mut groups: Vec<(String, Value, Vec<String>)> = Vec::new();
        let mut failed: Vec<String> = Vec::new();

        loop {
            let next = match tokio::time::timeout_at(deadline, in_flight.next()).await {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(_) => {
                    debug!(method = %method, timeout_ms = self.consensus.timeout_ms, "Consensus timed out");
                    break;
                }
            };

            match next {
                (url, Ok(value)) => {
                    let key = self.comparison_key(&value);
                    let group = match groups.iter().position(|(k, _, _)| *k == key) {
                        Some(pos) => &mut groups[pos],
                        None => {
                            groups.push((key, value, Vec::new()));
                            let last = groups.len() - 1;
                            &mut groups[last]
                        }
                    };
                    group.2.push(url);
                    if group.2.len() >= required {
                        debug!(method = %method, agreeing = group.2.len(), "Consensus reached");
                        return Ok(group.1.clone());
                    }
                }
                (url, Err(e)) => {
                    debug!(method = %method, endpoint = %url, error = %e, "Consensus leg failed");
                    failed.push(url);
                }
            }
        }

        let best = groups.iter().position_max_by_key(|(_, _, urls)| urls.len());
        let agreeing = best.map_or(0, |i| groups[i].2.len());
        let disagreeing = groups
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != best)
            .flat_map(|(_, (_, _, urls))| urls.iter().cloned())
            .chain(failed)
            .collect_vec();

        warn!(
            method = %method,
            required = required,
            agreeing = agreeing,
            disagreeing = ?disagreeing,
            "Consensus not reached"
        );
        Err(RpcError::ConsensusNotReached {
            method: method.to_string(),
            required,
            agreeing,
            disagreeing,
        })
    }

    fn comparison_key(&self, value: &Value) -> String {
        match &self.consensus.compare_field {
            Some(pointer) => value
                .pointer(pointer)
                .map_or_else(|| "null".to_string(), canonical_string),
            None => canonical_string(value),
        }
    }

    async fn dual_pair(&self, method: &str, params: &Value, priority: Priority) -> Result<Value, RpcError> {
        let registry = self.pool.registry();
        let primary = registry
            .ranked_by_latency()
            .into_iter()
            .take(self.dual_pair.primary_size.max(1))
            .collect_vec();
        if primary.is_empty() {
            return Err(self.pool.no_healthy_endpoints());
        }
        let secondary = registry
            .ranked_by_reliability()
            .into_iter()
            .filter(|e| !primary.iter().any(|p| p.id == e.id))
            .take(self.dual_pair.secondary_size.max(1))
            .collect_vec();

        let started = Instant::now();
        let leg = move |pair: Pair, set: &[Arc<Endpoint>]| {
            let set = set.to_vec();
            async move {
                let outcome = self
                    .pool
                    .call_with_failover(&set, method, params, priority)
                    .await;
                (pair, outcome, started.elapsed().as_secs_f64() * 1000.0)
            }
        };

        let mut in_flight = FuturesUnordered::new();
        in_flight.push(leg(Pair::Primary, &primary));
        if !secondary.is_empty() {
            in_flight.push(leg(Pair::Secondary, &secondary));
        }

        let mut fallback: Option<(Pair, Value)> = None;
        let mut last_err = None;
        while let Some((pair, outcome, latency_ms)) = in_flight.next().await {
            self.record_pair(pair, outcome.is_ok(), latency_ms);
            match outcome {
                Ok(value) if (self.completeness)(&value) => {
                    self.record_win(pair);
                    debug!(method = %method, pair = ?pair, latency_ms = latency_ms, "Dual-pair leg won");
                    return Ok(value);
                }
                Ok(value) => {
                    if fallback.is_none() {
                        fallback = Some((pair, value));
                    }
                }
                Err(e) => {
                    debug!(method = %method, pair = ?pair, error = %e, "Dual-pair leg failed");
                    last_err = Some(e);
                }
            }
        }

        // Nothing complete arrived; an empty page is still a valid answer
        match fallback {
            Some((pair, value)) => {
                self.record_win(pair);
                Ok(value)
            }
            None => Err(last_err.unwrap_or_else(|| self.pool.no_healthy_endpoints())),
        }
    }

    fn record_pair(&self, pair: Pair, success: bool, latency_ms: f64) {
        let alpha = self.dual_pair.stats_alpha;
        let mut pairs = self.pairs.lock();
        match pair {
            Pair::Primary => pairs.0.record(success, latency_ms, alpha),
            Pair::Secondary => pairs.1.record(success, latency_ms, alpha),
        }
    }

    fn record_win(&self, pair: Pair) {
        let mut pairs = self.pairs.lock();
        match pair {
            Pair::Primary => pairs.0.wins += 1,
            Pair::Secondary => pairs.1.wins += 1,
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        let (primary_pair, secondary_pair) = self.pairs.lock().clone();
        ExecutorStats {
            single: self.counters.single.load(Ordering::Relaxed),
            race: self.counters.race.load(Ordering::Relaxed),
            consensus: self.counters.consensus.load(Ordering::Relaxed),
            dual_pair: self.counters.dual_pair.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            hedges_fired: self.counters.hedges_fired.load(Ordering::Relaxed),
            primary_pair,
            secondary_pair,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc_config::ShieldConfig;
    use crate::test_utils::MockTransport;
    use serde_json::json;
    use std::time::Duration;

    fn url(i: usize) -> String {
        format!("http://node-{}.local", i)
    }

    fn setup(n: usize, tweak: impl FnOnce(&mut ShieldConfig)) -> (ParallelExecutor, Arc<MockTransport>) {
        let mut config = ShieldConfig::from_urls(&(0..n).map(url).collect::<Vec<_>>());
        for endpoint in &mut config.endpoints {
            endpoint.timeout_ms = 5_000;
        }
        tweak(&mut config);

        let mock = Arc::new(MockTransport::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let pool = Arc::new(ConnectionPool::new(&config, mock.clone(), metrics.clone()));
        let executor = ParallelExecutor::new(pool, &config.strategy, config.hedging.clone(), metrics)
            .with_retry_policy(RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 5,
                jitter_factor: 0.0,
                multiplier: 1.0,
            });
        (executor, mock)
    }

    #[test]
    fn test_strategy_table_lookup() {
        let table = StrategyTable::from_config(&StrategyConfig::default());
        assert_eq!(table.select("getAccountInfo"), Strategy::Race);
        assert_eq!(table.select("getSignatureStatuses"), Strategy::Consensus);
        assert_eq!(table.select("getSignaturesForAddress"), Strategy::DualPair);
        assert_eq!(table.select("getSlot"), Strategy::Single);
    }

    #[tokio::test]
    async fn test_table_hot_swap() {
        let (executor, _) = setup(1, |_| {});
        executor.set_strategy("getSlot", Strategy::Race);
        assert_eq!(executor.select("getSlot"), Strategy::Race);
        assert_eq!(executor.select("getAccountInfo"), Strategy::Race);

        executor.update_table(StrategyTable::new(Strategy::Consensus, HashMap::new()));
        assert_eq!(executor.select("getAccountInfo"), Strategy::Consensus);
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_returns_fastest() {
        let (executor, mock) = setup(3, |c| c.strategy.race_fanout = 3);
        for (i, ms) in [20, 25, 100].into_iter().enumerate() {
            mock.set_latency(&url(i), Duration::from_millis(ms));
        }

        let started = Instant::now();
        let result = executor
            .run(Strategy::Race, "getAccountInfo", &json!(["acc"]), Priority::Normal)
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(result["endpoint"], json!(url(0)));
        assert!(elapsed >= Duration::from_millis(20) && elapsed < Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_all_fail_surfaces_error() {
        let (executor, mock) = setup(2, |_| {});
        mock.set_failure(&url(0), Some(RpcError::transport(&url(0), "down")));
        mock.set_latency(&url(1), Duration::from_millis(10));
        mock.set_failure(&url(1), Some(RpcError::transport(&url(1), "down")));

        let err = executor
            .run(Strategy::Race, "getAccountInfo", &json!([]), Priority::Normal)
            .await
            .unwrap_err();
        assert_eq!(err.endpoint(), Some(url(1).as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_consensus_majority_wins() {
        let (executor, mock) = setup(4, |c| {
            c.strategy.consensus.fanout = 4;
            c.strategy.consensus.min_consensus = 2;
        });
        mock.set_response(&url(0), json!({"slot": 7}));
        mock.set_latency(&url(0), Duration::from_millis(5));
        mock.set_response(&url(1), json!({"slot": 99}));
        mock.set_response(&url(2), json!({"slot": 7}));
        mock.set_latency(&url(2), Duration::from_millis(10));
        mock.set_response(&url(3), json!({"slot": 7}));
        mock.set_latency(&url(3), Duration::from_millis(15));

        let result = executor
            .run(Strategy::Consensus, "getSignatureStatuses", &json!([]), Priority::Normal)
            .await
            .unwrap();
        assert_eq!(result, json!({"slot": 7}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_consensus_not_reached_lists_disagreement() {
        let (executor, mock) = setup(3, |c| {
            c.strategy.consensus.fanout = 3;
            c.strategy.consensus.min_consensus = 3;
        });
        mock.set_response(&url(0), json!("a"));
        mock.set_response(&url(1), json!("a"));
        mock.set_response(&url(2), json!("b"));

        let err = executor
            .run(Strategy::Consensus, "getSignatureStatuses", &json!([]), Priority::Normal)
            .await
            .unwrap_err();
        match err {
            RpcError::ConsensusNotReached {
                required,
                agreeing,
                disagreeing,
                ..
            } => {
                assert_eq!(required, 3);
                assert_eq!(agreeing, 2);
                assert_eq!(disagreeing, vec![url(2)]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_consensus_compare_field() {
        let (executor, mock) = setup(2, |c| {
            c.strategy.consensus.fanout = 2;
            c.strategy.consensus.min_consensus = 2;
            c.strategy.consensus.compare_field = Some("/value/status".to_string());
        });
        mock.set_response(&url(0), json!({"context": {"slot": 1}, "value": {"status": "finalized"}}));
        mock.set_response(&url(1), json!({"context": {"slot": 2}, "value": {"status": "finalized"}}));

        let result = executor
            .run(Strategy::Consensus, "getSignatureStatuses", &json!([]), Priority::Normal)
            .await
            .unwrap();
        assert_eq!(result["value"]["status"], json!("finalized"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_consensus_times_out() {
        let (executor, mock) = setup(2, |c| {
            c.strategy.consensus.fanout = 2;
            c.strategy.consensus.min_consensus = 2;
            c.strategy.consensus.timeout_ms = 100;
        });
        mock.set_response(&url(0), json!(1));
        mock.set_response(&url(1), json!(1));
        mock.set_latency(&url(1), Duration::from_millis(1_000));

        let started = Instant::now();
        let err = executor
            .run(Strategy::Consensus, "getSignatureStatuses", &json!([]), Priority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::ConsensusNotReached { agreeing: 1, .. }));
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dual_pair_prefers_complete_result() {
        let (executor, mock) = setup(2, |_| {});
        mock.set_response(&url(0), json!([]));
        mock.set_latency(&url(0), Duration::from_millis(5));
        mock.set_response(&url(1), json!([{"signature": "s1"}]));
        mock.set_latency(&url(1), Duration::from_millis(30));

        let result = executor
            .run(Strategy::DualPair, "getSignaturesForAddress", &json!([]), Priority::Normal)
            .await
            .unwrap();
        assert_eq!(result, json!([{"signature": "s1"}]));

        let stats = executor.stats();
        assert_eq!(stats.primary_pair.calls, 1);
        assert_eq!(stats.primary_pair.wins, 0);
        assert_eq!(stats.secondary_pair.wins, 1);
        assert!(stats.secondary_pair.avg_latency_ms >= 30.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dual_pair_empty_everywhere_is_valid() {
        let (executor, mock) = setup(2, |_| {});
        mock.set_response(&url(0), json!([]));
        mock.set_response(&url(1), json!([]));

        let result = executor
            .run(Strategy::DualPair, "getSignaturesForAddress", &json!([]), Priority::Normal)
            .await
            .unwrap();
        assert_eq!(result, json!([]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dual_pair_custom_completeness() {
        let (executor, mock) = setup(2, |_| {});
        let executor = executor.with_completeness(Arc::new(|v: &Value| v["done"] == json!(true)));
        mock.set_response(&url(0), json!({"done": false}));
        mock.set_latency(&url(0), Duration::from_millis(5));
        mock.set_response(&url(1), json!({"done": true}));
        mock.set_latency(&url(1), Duration::from_millis(30));

        let result = executor
            .run(Strategy::DualPair, "getSignaturesForAddress", &json!([]), Priority::Normal)
            .await
            .unwrap();
        assert_eq!(result, json!({"done": true}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_retries_on_alternate() {
        let (executor, mock) = setup(2, |_| {});
        mock.set_failure(&url(0), Some(RpcError::transport(&url(0), "reset")));

        let result = executor
            .run(Strategy::Single, "getSlot", &json!([]), Priority::Normal)
            .await
            .unwrap();
        assert_eq!(result["endpoint"], json!(url(1)));
        assert_eq!(executor.stats().retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_moves_to_untried_endpoint() {
        let (executor, mock) = setup(2, |c| c.endpoints[0].concurrency = 1);
        mock.set_latency(&url(0), Duration::from_millis(50));
        mock.fail_next(&url(1), 1, RpcError::transport(&url(1), "reset"));

        // Saturate node 0 so the first pick lands on node 1
        let busy = {
            let pool = executor.pool.clone();
            let endpoint = pool.registry().get(0).unwrap().clone();
            tokio::spawn(async move {
                pool.call_endpoint(&endpoint, "getBalance", &json!([]), Priority::Normal)
                    .await
            })
        };
        tokio::task::yield_now().await;

        let result = executor
            .run(Strategy::Single, "getSlot", &json!([]), Priority::Normal)
            .await
            .unwrap();
        assert_eq!(result["endpoint"], json!(url(0)));
        assert_eq!(mock.calls_to(&url(1)), 1);
        assert_eq!(executor.stats().retries, 1);
        busy.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_races_across_endpoints() {
        let (executor, mock) = setup(2, |_| {});
        mock.set_batch_failure(&url(0), Some(RpcError::transport(&url(0), "502 bad gateway")));

        let results = executor
            .execute_batch("getAccountInfo", &[json!(["a"]), json!(["b"])], Priority::Normal)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap()["endpoint"], json!(url(1)));
        assert_eq!(mock.batch_sizes("getAccountInfo"), vec![2, 2]);

        let stats = executor.stats();
        assert_eq!(stats.race, 1);
        assert_eq!(stats.single, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_retried_on_alternate_endpoint() {
        let (executor, mock) = setup(2, |_| {});
        mock.set_batch_failure(&url(0), Some(RpcError::transport(&url(0), "502 bad gateway")));

        let results = executor
            .execute_batch("getTransaction", &[json!(["s1"]), json!(["s2"])], Priority::Normal)
            .await
            .unwrap();
        assert_eq!(results[1].as_ref().unwrap()["params"], json!(["s2"]));
        assert_eq!(results[1].as_ref().unwrap()["endpoint"], json!(url(1)));
        assert_eq!(mock.calls_to(&url(0)), 1);
        assert_eq!(mock.calls_to(&url(1)), 1);

        let stats = executor.stats();
        assert_eq!(stats.single, 1);
        assert_eq!(stats.retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_error_without_retry_budget() {
        let (executor, mock) = setup(2, |_| {});
        let executor = executor.with_retry_policy(RetryPolicy::none());
        mock.set_batch_failure(&url(0), Some(RpcError::transport(&url(0), "502 bad gateway")));

        let err = executor
            .execute_batch("getTransaction", &[json!(["s1"])], Priority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Transport { .. }));
        assert_eq!(mock.calls_to(&url(1)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_does_not_retry_application_error() {
        let (executor, mock) = setup(2, |_| {});
        let app_error = RpcError::RpcResponse {
            endpoint: url(0),
            code: -32602,
            message: "Invalid params".to_string(),
        };
        mock.set_failure(&url(0), Some(app_error));

        let err = executor
            .run(Strategy::Single, "getSlot", &json!([]), Priority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::RpcResponse { code: -32602, .. }));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hedge_fires_after_delay() {
        let (executor, mock) = setup(2, |c| {
            c.hedging.enabled = true;
            c.hedging.delay_ms = 100;
        });
        mock.set_latency(&url(0), Duration::from_millis(500));
        mock.set_latency(&url(1), Duration::from_millis(20));

        let started = Instant::now();
        let result = executor
            .run(Strategy::Single, "getSlot", &json!([]), Priority::Normal)
            .await
            .unwrap();

        assert_eq!(result["endpoint"], json!(url(1)));
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(executor.stats().hedges_fired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_hedge_when_primary_is_fast() {
        let (executor, mock) = setup(2, |c| {
            c.hedging.enabled = true;
            c.hedging.delay_ms = 100;
        });
        mock.set_latency(&url(0), Duration::from_millis(10));

        executor
            .run(Strategy::Single, "getSlot", &json!([]), Priority::Normal)
            .await
            .unwrap();
        assert_eq!(mock.call_count(), 1);
        assert_eq!(executor.stats().hedges_fired, 0);
    }
}

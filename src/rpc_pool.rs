//! Rate- and concurrency-limited connection pool
//!
//! Every endpoint gets a gate enforcing:
//! - at most `concurrency` requests in flight
//! - at most `rps` requests started in any rolling one-second window
//! - a priority queue of waiters with per-request deadlines
//!
//! All gate state lives behind one lock that is never held across an `.await`.
//! Slots are handed to waiters as [`SlotPermit`]s; dropping a permit frees the
//! slot and dispatches the next waiter. The pool also runs jittered health
//! probes and parallel cursor scans.

use futures::future::{join_all, try_join_all};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::rpc_cache::canonical_string;
use crate::circuit_breaker::CircuitBreaker;
use crate::metrics::{Metrics, Timer};
use crate::rpc_config::{HealthConfig, QueueConfig, ShieldConfig};
use crate::rpc_endpoint::{Endpoint, EndpointRegistry, EndpointSnapshot, HealthStatus};
use crate::rpc_errors::RpcError;
use crate::rpc_transport::RpcTransport;

const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Queue priority, highest served first, FIFO within a level
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

type QueueKey = (Reverse<Priority>, u64);

struct Waiter {
    tx: oneshot::Sender<Result<SlotPermit, RpcError>>,
    enqueued_at: Instant,
    deadline: Instant,
}

#[derive(Default)]
struct GateState {
    in_flight: usize,
    /// Start times of requests in the current rate window, oldest first
    window: VecDeque<Instant>,
    queue: BTreeMap<QueueKey, Waiter>,
    wake_at: Option<Instant>,
    dispatched: u64,
}

impl GateState {
    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.window.front() {
            if front + RATE_WINDOW <= now {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

struct PoolState {
    gates: Vec<GateState>,
    in_flight: usize,
    queued: usize,
    next_seq: u64,
    closed: bool,
    queue_timeouts: u64,
    queue_full_rejections: u64,
}

struct GateLimits {
    rps: usize,
    concurrency: usize,
}

struct Gates {
    state: Mutex<PoolState>,
    limits: Vec<GateLimits>,
    endpoints: Vec<Arc<Endpoint>>,
    max_in_flight: usize,
    max_queue: usize,
    metrics: Arc<Metrics>,
}

/// An execution slot on one endpoint, released on drop
pub struct SlotPermit {
    gates: Arc<Gates>,
    endpoint: usize,
    armed: bool,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        if self.armed {
            self.gates.release(self.endpoint);
        }
    }
}

/// Removes a queue entry when its waiter goes away
struct QueueTicket {
    gates: Arc<Gates>,
    endpoint: usize,
    key: QueueKey,
    active: bool,
}

impl QueueTicket {
    /// Remove the entry if it is still queued
    fn cancel(&mut self) -> bool {
        self.active = false;
        self.gates.remove_queued(self.endpoint, self.key)
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        if self.active {
            self.gates.remove_queued(self.endpoint, self.key);
        }
    }
}

/// Result of one pass of the queue sweep
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub depth: usize,
    pub oldest_age_ms: u64,
    pub utilization: f64,
}

impl Gates {
    fn try_grant(self: &Arc<Self>, st: &mut PoolState, idx: usize, now: Instant) -> Option<SlotPermit> {
        if st.in_flight >= self.max_in_flight {
            return None;
        }
        let limits = &self.limits[idx];
        let gate = &mut st.gates[idx];
        gate.prune(now);
        if gate.in_flight >= limits.concurrency || gate.window.len() >= limits.rps {
            return None;
        }

        gate.in_flight += 1;
        gate.window.push_back(now);
        gate.dispatched += 1;
        #[cfg(feature = "strict-invariants")]
        debug_assert!(gate.in_flight <= limits.concurrency && gate.window.len() <= limits.rps);
        st.in_flight += 1;

        self.endpoints[idx].stats.slot_acquired();
        self.metrics.in_flight.inc();
        Some(SlotPermit {
            gates: self.clone(),
            endpoint: idx,
            armed: true,
        })
    }

    /// Claim a free slot without queueing; `None` when the gate is busy or has waiters
    fn try_acquire(self: &Arc<Self>, idx: usize) -> Option<SlotPermit> {
        let mut st = self.state.lock();
        if st.closed || !st.gates[idx].queue.is_empty() {
            return None;
        }
        self.try_grant(&mut st, idx, Instant::now())
    }

    /// Undo a grant whose waiter vanished, without re-entering the lock
    fn revoke(&self, st: &mut PoolState, mut permit: SlotPermit) {
        permit.armed = false;
        let gate = &mut st.gates[permit.endpoint];
        gate.in_flight -= 1;
        gate.window.pop_back();
        gate.dispatched -= 1;
        st.in_flight -= 1;
        self.endpoints[permit.endpoint].stats.slot_released();
        self.metrics.in_flight.dec();
    }

    fn release(self: &Arc<Self>, idx: usize) {
        let mut st = self.state.lock();
        let global_was_full = st.in_flight >= self.max_in_flight;
        st.gates[idx].in_flight -= 1;
        st.in_flight -= 1;
        self.endpoints[idx].stats.slot_released();
        self.metrics.in_flight.dec();

        let now = Instant::now();
        self.pump(&mut st, idx, now);
        if global_was_full {
            for other in (0..st.gates.len()).filter(|&other| other != idx) {
                self.pump(&mut st, other, now);
            }
        }
    }

    /// Hand free slots to queued waiters in priority order
    fn pump(self: &Arc<Self>, st: &mut PoolState, idx: usize, now: Instant) {
        loop {
            let Some(key) = st.gates[idx].queue.keys().next().copied() else {
                return;
            };
            let Some(permit) = self.try_grant(st, idx, now) else {
                self.schedule_wake(st, idx, now);
                return;
            };
            let Some(waiter) = st.gates[idx].queue.remove(&key) else {
                self.revoke(st, permit);
                return;
            };
            st.queued -= 1;
            self.metrics.queue_depth.dec();
            self.metrics
                .queue_wait
                .observe(now.saturating_duration_since(waiter.enqueued_at).as_secs_f64());

            if let Err(Ok(permit)) = waiter.tx.send(Ok(permit)) {
                self.revoke(st, permit);
            }
        }
    }

    /// Re-pump when the oldest request leaves the rate window, if that is the only blocker
    fn schedule_wake(self: &Arc<Self>, st: &mut PoolState, idx: usize, now: Instant) {
        if st.in_flight >= self.max_in_flight {
            return;
        }
        let limits = &self.limits[idx];
        let gate = &mut st.gates[idx];
        if gate.queue.is_empty()
            || gate.in_flight >= limits.concurrency
            || gate.window.len() < limits.rps
        {
            return;
        }
        let Some(&oldest) = gate.window.front() else {
            return;
        };
        let at = (oldest + RATE_WINDOW).max(now);
        if matches!(gate.wake_at, Some(pending) if pending <= at) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        gate.wake_at = Some(at);

        let weak = Arc::downgrade(self);
        handle.spawn(async move {
            tokio::time::sleep_until(at).await;
            if let Some(gates) = weak.upgrade() {
                let mut st = gates.state.lock();
                if st.gates[idx].wake_at == Some(at) {
                    st.gates[idx].wake_at = None;
                }
                gates.pump(&mut st, idx, Instant::now());
            }
        });
    }

    async fn acquire(
        self: &Arc<Self>,
        idx: usize,
        priority: Priority,
        deadline: Instant,
    ) -> Result<SlotPermit, RpcError> {
        let enqueued_at = Instant::now();
        let (key, mut rx) = {
            let mut st = self.state.lock();
            if st.closed {
                return Err(RpcError::ShuttingDown);
            }
            if st.gates[idx].queue.is_empty() {
                if let Some(permit) = self.try_grant(&mut st, idx, enqueued_at) {
                    return Ok(permit);
                }
            }
            if st.queued >= self.max_queue {
                st.queue_full_rejections += 1;
                self.metrics
                    .queue_rejections_total
                    .with_label_values(&["full"])
                    .inc();
                return Err(RpcError::QueueFull {
                    queued: st.queued,
                    max_size: self.max_queue,
                });
            }

            st.next_seq += 1;
            let key = (Reverse(priority), st.next_seq);
            let (tx, rx) = oneshot::channel();
            st.gates[idx].queue.insert(
                key,
                Waiter {
                    tx,
                    enqueued_at,
                    deadline,
                },
            );
            st.queued += 1;
            self.metrics.queue_depth.inc();
            self.schedule_wake(&mut st, idx, enqueued_at);
            (key, rx)
        };

        debug!(
            endpoint = %self.endpoints[idx].url(),
            priority = ?priority,
            "No free slot, request queued"
        );

        let mut ticket = QueueTicket {
            gates: self.clone(),
            endpoint: idx,
            key,
            active: true,
        };

        let received = match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(received) => {
                ticket.active = false;
                received.map_err(|_| ())
            }
            Err(_) => {
                if ticket.cancel() {
                    self.record_queue_timeout();
                    return Err(RpcError::QueueTimeout {
                        endpoint: self.endpoints[idx].url().to_string(),
                        waited_ms: enqueued_at.elapsed().as_millis() as u64,
                    });
                }
                // Granted or rejected in the same instant as the deadline
                match rx.try_recv() {
                    Ok(received) => Ok(received),
                    Err(_) => Err(()),
                }
            }
        };

        received.map_err(|_| RpcError::Internal("slot grant channel closed".to_string()))?
    }

    fn record_queue_timeout(&self) {
        self.state.lock().queue_timeouts += 1;
        self.metrics
            .queue_rejections_total
            .with_label_values(&["timeout"])
            .inc();
    }

    fn remove_queued(&self, idx: usize, key: QueueKey) -> bool {
        let mut st = self.state.lock();
        if st.gates[idx].queue.remove(&key).is_some() {
            st.queued -= 1;
            self.metrics.queue_depth.dec();
            true
        } else {
            false
        }
    }

    /// Endpoint (position in `ids`) with a free slot, else the shortest queue
    fn pick(&self, ids: &[usize]) -> usize {
        let mut st = self.state.lock();
        let now = Instant::now();
        let global_free = st.in_flight < self.max_in_flight;

        for (pos, &idx) in ids.iter().enumerate() {
            let limits = &self.limits[idx];
            let gate = &mut st.gates[idx];
            gate.prune(now);
            if global_free
                && gate.queue.is_empty()
                && gate.in_flight < limits.concurrency
                && gate.window.len() < limits.rps
            {
                return pos;
            }
        }

        ids.iter()
            .enumerate()
            .min_by_key(|(_, idx)| st.gates[**idx].queue.len())
            .map(|(pos, _)| pos)
            .unwrap_or(0)
    }

    fn sweep(&self, now: Instant) -> SweepReport {
        let mut st = self.state.lock();
        let mut expired = 0;

        for idx in 0..st.gates.len() {
            let keys: Vec<QueueKey> = st.gates[idx]
                .queue
                .iter()
                .filter(|(_, waiter)| waiter.deadline <= now)
                .map(|(key, _)| *key)
                .collect();
            for key in keys {
                if let Some(waiter) = st.gates[idx].queue.remove(&key) {
                    expired += 1;
                    let waited = now.saturating_duration_since(waiter.enqueued_at);
                    let _ = waiter.tx.send(Err(RpcError::QueueTimeout {
                        endpoint: self.endpoints[idx].url().to_string(),
                        waited_ms: waited.as_millis() as u64,
                    }));
                }
            }
        }

        st.queued -= expired;
        st.queue_timeouts += expired as u64;
        if expired > 0 {
            self.metrics.queue_depth.sub(expired as i64);
            self.metrics
                .queue_rejections_total
                .with_label_values(&["timeout"])
                .inc_by(expired as u64);
        }

        let oldest_age_ms = st
            .gates
            .iter()
            .flat_map(|gate| gate.queue.values())
            .map(|waiter| now.saturating_duration_since(waiter.enqueued_at).as_millis() as u64)
            .max()
            .unwrap_or(0);
        let capacity: usize = self.limits.iter().map(|l| l.concurrency).sum();
        let capacity = capacity.min(self.max_in_flight).max(1);

        SweepReport {
            expired,
            depth: st.queued,
            oldest_age_ms,
            utilization: st.in_flight as f64 / capacity as f64,
        }
    }

    fn close(&self) -> usize {
        let mut st = self.state.lock();
        st.closed = true;
        let mut rejected = 0;
        for gate in st.gates.iter_mut() {
            for (_, waiter) in std::mem::take(&mut gate.queue) {
                let _ = waiter.tx.send(Err(RpcError::ShuttingDown));
                rejected += 1;
            }
        }
        st.queued = 0;
        self.metrics.queue_depth.set(0);
        if rejected > 0 {
            self.metrics
                .queue_rejections_total
                .with_label_values(&["shutdown"])
                .inc_by(rejected as u64);
        }
        rejected
    }
}

/// How a scan walks the pages of a list call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorMode {
    /// Opaque continuation: the id of the last item of a page starts the next
    Continuation,
    /// Numeric offsets, all pages issued in parallel
    Offset,
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub total_limit: usize,
    pub page_size: usize,
    /// Unique item identifier used for de-duplication
    pub id_field: String,
    pub mode: CursorMode,
    /// Name of the cursor key in the request config object
    pub cursor_param: String,
    /// Cursors splitting a continuation scan into ranges walked concurrently.
    /// Empty means reuse the page boundaries of the previous scan of the address.
    pub seeds: Vec<Value>,
    pub priority: Priority,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            total_limit: 1000,
            page_size: 250,
            id_field: "signature".to_string(),
            mode: CursorMode::Continuation,
            cursor_param: "before".to_string(),
            seeds: Vec::new(),
            priority: Priority::Normal,
        }
    }
}

impl ScanOptions {
    pub fn continuation(total_limit: usize) -> Self {
        Self {
            total_limit,
            ..Self::default()
        }
    }

    pub fn offset(total_limit: usize) -> Self {
        Self {
            total_limit,
            mode: CursorMode::Offset,
            cursor_param: "offset".to_string(),
            ..Self::default()
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Item ids, newest first, at which to split the scan into lanes
    pub fn with_seeds(mut self, seeds: Vec<Value>) -> Self {
        self.seeds = seeds;
        self
    }
}

/// One cursor range of a continuation scan
struct Lane {
    start: Option<Value>,
    /// Id of the next lane's boundary item; the lane ends once it shows up
    stop_at: Option<String>,
}

impl Lane {
    /// Lanes covering the whole list, split at `seeds`
    fn split(seeds: &[Value]) -> Vec<Lane> {
        let mut lanes = Vec::with_capacity(seeds.len() + 1);
        let mut start = None;
        for seed in seeds {
            lanes.push(Lane {
                start: start.take(),
                stop_at: Some(id_key(seed)),
            });
            start = Some(seed.clone());
        }
        lanes.push(Lane {
            start,
            stop_at: None,
        });
        lanes
    }
}

/// `want` seeds spread evenly over `seeds`
fn spread(seeds: &[Value], want: usize) -> Vec<Value> {
    let n = seeds.len();
    let want = want.min(n);
    (0..want)
        .map(|i| seeds[(i + 1) * (n + 1) / (want + 1) - 1].clone())
        .collect()
}

/// Ids of the last item of every page but the final one
fn page_boundaries(items: &[Value], page_size: usize, id_field: &str) -> Vec<Value> {
    (1..)
        .map(|k| k * page_size)
        .take_while(|&end| end < items.len())
        .filter_map(|end| items[end - 1].get(id_field).cloned())
        .collect()
}

const MAX_SCAN_INDEX: usize = 4096;

/// Merges pages while dropping items already seen
struct ScanMerger<'a> {
    id_field: &'a str,
    limit: usize,
    seen: HashSet<String>,
    items: Vec<Value>,
    duplicates: usize,
}

impl<'a> ScanMerger<'a> {
    fn new(id_field: &'a str, limit: usize) -> Self {
        Self {
            id_field,
            limit,
            seen: HashSet::new(),
            items: Vec::new(),
            duplicates: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.items.len() >= self.limit
    }

    fn extend(&mut self, page: Vec<Value>) {
        for item in page {
            if self.is_full() {
                return;
            }
            if self.seen.insert(item_id(&item, self.id_field)) {
                self.items.push(item);
            } else {
                self.duplicates += 1;
            }
        }
    }
}

fn id_key(value: &Value) -> String {
    match value {
        Value::String(id) => id.clone(),
        other => other.to_string(),
    }
}

fn item_id(item: &Value, id_field: &str) -> String {
    item.get(id_field)
        .map(id_key)
        .unwrap_or_else(|| canonical_string(item))
}

fn page_params(address: &str, page_size: usize, cursor_param: &str, cursor: Option<Value>) -> Value {
    let mut config = json!({ "limit": page_size });
    if let Some(cursor) = cursor {
        config[cursor_param] = cursor;
    }
    json!([address, config])
}

fn page_items(page: Value) -> Result<Vec<Value>, RpcError> {
    match page {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(RpcError::InvalidRequest(format!(
            "scan expected a list page, got {}",
            other
        ))),
    }
}

/// `endpoints` starting at `offset`, wrapping around
fn rotated(endpoints: &[Arc<Endpoint>], offset: usize) -> Vec<Arc<Endpoint>> {
    let n = endpoints.len();
    (0..n).map(|i| endpoints[(offset + i) % n].clone()).collect()
}

fn validate_address(address: &str) -> Result<(), RpcError> {
    match bs58::decode(address).into_vec() {
        Ok(bytes) if bytes.len() == 32 => Ok(()),
        Ok(bytes) => Err(RpcError::InvalidRequest(format!(
            "address {} decodes to {} bytes, expected 32",
            address,
            bytes.len()
        ))),
        Err(e) => Err(RpcError::InvalidRequest(format!(
            "address {} is not base58: {}",
            address, e
        ))),
    }
}

/// Pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_endpoints: usize,
    pub healthy_endpoints: usize,
    pub degraded_endpoints: usize,
    pub unhealthy_endpoints: usize,
    pub in_flight: usize,
    pub max_in_flight: usize,
    pub queued: usize,
    pub max_queue_size: usize,
    pub queue_timeouts: u64,
    pub queue_full_rejections: u64,
    pub endpoint_stats: Vec<EndpointPoolStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointPoolStats {
    #[serde(flatten)]
    pub endpoint: EndpointSnapshot,
    pub concurrency_limit: usize,
    pub rps_limit: usize,
    pub active_requests: usize,
    pub queued: usize,
    pub requests_in_window: usize,
    pub dispatched: u64,
}

pub struct ConnectionPool {
    registry: Arc<EndpointRegistry>,
    breaker: Arc<CircuitBreaker>,
    transport: Arc<dyn RpcTransport>,
    gates: Arc<Gates>,
    health: HealthConfig,
    queue: QueueConfig,
    probe_limiter: DefaultDirectRateLimiter,
    /// Page boundaries of the last continuation scan per `method:address`
    scan_index: Mutex<HashMap<String, Vec<Value>>>,
    metrics: Arc<Metrics>,
}

impl ConnectionPool {
    pub fn new(
        config: &ShieldConfig,
        transport: Arc<dyn RpcTransport>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let registry = Arc::new(EndpointRegistry::new(
            &config.endpoints,
            config.health.unhealthy_threshold,
        ));
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone(), metrics.clone()));

        let limits = config
            .endpoints
            .iter()
            .map(|e| GateLimits {
                rps: e.rps.max(1) as usize,
                concurrency: e.concurrency.max(1) as usize,
            })
            .collect();

        let gates = Arc::new(Gates {
            state: Mutex::new(PoolState {
                gates: (0..config.endpoints.len())
                    .map(|_| GateState::default())
                    .collect(),
                in_flight: 0,
                queued: 0,
                next_seq: 0,
                closed: false,
                queue_timeouts: 0,
                queue_full_rejections: 0,
            }),
            limits,
            endpoints: registry.all().to_vec(),
            max_in_flight: config.limits.max_in_flight.max(1),
            max_queue: config.queue.max_size,
            metrics: metrics.clone(),
        });

        let probe_rps = NonZeroU32::new(config.health.probe_rps_limit).unwrap_or(NonZeroU32::MIN);
        metrics.healthy_endpoints.set(registry.len() as i64);

        Self {
            registry,
            breaker,
            transport,
            gates,
            health: config.health.clone(),
            queue: config.queue.clone(),
            probe_limiter: RateLimiter::direct(Quota::per_second(probe_rps)),
            scan_index: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Send one batch to a specific endpoint: one slot and one rate token per physical call
    pub async fn call_batch_endpoint(
        &self,
        endpoint: &Arc<Endpoint>,
        method: &str,
        params: &[Value],
        priority: Priority,
    ) -> Result<Vec<Result<Value, RpcError>>, RpcError> {
        let key = endpoint.service_key(method);

        let outcome = async {
            self.breaker.check(&key)?;
            let permit = self.acquire(endpoint, priority).await?;
            let timer = Timer::start();
            let outcome = self
                .breaker
                .execute(
                    &key,
                    endpoint.config.timeout(),
                    self.transport.send_batch(endpoint.url(), method, params),
                )
                .await;
            drop(permit);
            self.observe(endpoint, &outcome, &timer);
            outcome
        }
        .await;

        outcome.map_err(|e| attribute(e, endpoint.url()))
    }

    /// Call `method` on one specific endpoint
    pub async fn call_endpoint(
        &self,
        endpoint: &Arc<Endpoint>,
        method: &str,
        params: &Value,
        priority: Priority,
    ) -> Result<Value, RpcError> {
        let key = endpoint.service_key(method);

        let outcome = async {
            self.breaker.check(&key)?;
            let permit = self.acquire(endpoint, priority).await?;
            let timer = Timer::start();
            let outcome = self
                .breaker
                .execute(
                    &key,
                    endpoint.config.timeout(),
                    self.transport.send(endpoint.url(), method, params),
                )
                .await;
            drop(permit);
            self.observe(endpoint, &outcome, &timer);
            outcome
        }
        .await;

        outcome.map_err(|e| attribute(e, endpoint.url()))
    }

    /// Try `ordered` endpoints in turn while errors allow failing over
    pub async fn call_with_failover(
        &self,
        ordered: &[Arc<Endpoint>],
        method: &str,
        params: &Value,
        priority: Priority,
    ) -> Result<Value, RpcError> {
        let mut last_err = None;
        for endpoint in ordered {
            match self.call_endpoint(endpoint, method, params, priority).await {
                Ok(value) => return Ok(value),
                Err(e) if e.should_failover() => {
                    debug!(endpoint = %endpoint.url(), error = %e, "Failing over to next endpoint");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| self.no_healthy_endpoints()))
    }

    async fn acquire(&self, endpoint: &Endpoint, priority: Priority) -> Result<SlotPermit, RpcError> {
        let deadline = Instant::now() + self.queue.deadline();
        self.gates.acquire(endpoint.id, priority, deadline).await
    }

    /// Position in `endpoints` of the admitted endpoint with a free slot, else
    /// the one with the shortest queue; `None` when every circuit is open
    pub fn preferred(&self, endpoints: &[Arc<Endpoint>], method: &str) -> Option<usize> {
        let admitted: Vec<usize> = endpoints
            .iter()
            .enumerate()
            .filter(|(_, e)| self.breaker.allows(&e.service_key(method)))
            .map(|(pos, _)| pos)
            .collect();
        if admitted.is_empty() {
            return None;
        }
        let ids: Vec<usize> = admitted.iter().map(|&pos| endpoints[pos].id).collect();
        Some(admitted[self.gates.pick(&ids)])
    }

    fn observe<T>(&self, endpoint: &Endpoint, outcome: &Result<T, RpcError>, timer: &Timer) {
        let latency_ms = timer.elapsed_ms();
        let (label, success) = match outcome {
            Ok(_) => ("success", Some(true)),
            Err(e) if e.trips_breaker() => ("failure", Some(false)),
            Err(RpcError::ServiceUnavailable { .. }) => ("rejected", None),
            // The node answered, just not with a result
            Err(_) => ("rpc_error", Some(true)),
        };
        if let Some(success) = success {
            endpoint.record_request(success, latency_ms);
        }
        self.metrics
            .requests_total
            .with_label_values(&[endpoint.url(), label])
            .inc();
        timer.observe_duration(&self.metrics.rpc_latency);
    }

    pub fn no_healthy_endpoints(&self) -> RpcError {
        RpcError::NoHealthyEndpoints {
            total: self.registry.len(),
            unhealthy: self.registry.unhealthy_count(),
        }
    }

    /// Probe one endpoint; `None` when the probe budget is exhausted or the
    /// endpoint has no free slot
    pub async fn probe(&self, endpoint: &Arc<Endpoint>) -> Option<bool> {
        if self.probe_limiter.check().is_err() {
            debug!(url = %endpoint.url(), "Probe skipped, probe rate limit reached");
            self.metrics
                .health_probes_total
                .with_label_values(&["skipped"])
                .inc();
            return None;
        }
        // Probes count against the endpoint's rps and concurrency like any call
        let Some(_permit) = self.gates.try_acquire(endpoint.id) else {
            debug!(url = %endpoint.url(), "Probe skipped, endpoint has no free slot");
            self.metrics
                .health_probes_total
                .with_label_values(&["busy"])
                .inc();
            return None;
        };

        let timer = Timer::start();
        let outcome = tokio::time::timeout(
            self.health.probe_timeout(),
            self.transport
                .send(endpoint.url(), &self.health.probe_method, &json!([])),
        )
        .await;

        let success = match outcome {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(url = %endpoint.url(), error = %e, "Health probe failed");
                false
            }
            Err(_) => {
                debug!(
                    url = %endpoint.url(),
                    timeout_ms = self.health.probe_timeout_ms,
                    "Health probe timed out"
                );
                false
            }
        };

        self.registry
            .record_probe(endpoint, success, timer.elapsed_ms());
        self.metrics
            .health_probes_total
            .with_label_values(&[if success { "success" } else { "failure" }])
            .inc();
        Some(success)
    }

    /// Probe every endpoint concurrently
    pub async fn probe_all(&self) {
        join_all(self.registry.all().iter().map(|e| self.probe(e))).await;
        let selectable = self.registry.len() - self.registry.unhealthy_count();
        self.metrics.healthy_endpoints.set(selectable as i64);
    }

    /// Jittered health probing until `shutdown` flips
    pub async fn run_health_checks(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.health.interval_ms,
            jitter_ms = self.health.jitter_ms,
            "Starting health probing"
        );
        loop {
            let delay = self.health.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => self.probe_all().await,
                _ = shutdown.changed() => break,
            }
        }
        debug!("Health probing stopped");
    }

    /// Reject expired queue entries and report queue health
    pub fn sweep_queue(&self) -> SweepReport {
        let report = self.gates.sweep(Instant::now());
        if report.expired > 0 {
            warn!(
                expired = report.expired,
                depth = report.depth,
                oldest_age_ms = report.oldest_age_ms,
                utilization = report.utilization,
                "Rejected queued requests past their deadline"
            );
        } else {
            debug!(
                depth = report.depth,
                oldest_age_ms = report.oldest_age_ms,
                utilization = report.utilization,
                "Queue sweep"
            );
        }
        report
    }

    pub async fn run_queue_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.queue.sweep_interval_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_queue();
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Queue sweeper stopped");
    }

    /// Stop admitting work and reject everything still queued
    pub fn close(&self) -> usize {
        let rejected = self.gates.close();
        if rejected > 0 {
            info!(rejected = rejected, "Rejected queued requests on shutdown");
        }
        rejected
    }

    pub fn in_flight(&self) -> usize {
        self.gates.state.lock().in_flight
    }

    pub fn queued(&self) -> usize {
        self.gates.state.lock().queued
    }

    /// Paginated list scan spread across endpoints, de-duplicated by `id_field`
    #[instrument(skip(self, options), fields(method = %method, address = %address))]
    pub async fn scan(
        &self,
        method: &str,
        address: &str,
        options: &ScanOptions,
    ) -> Result<Vec<Value>, RpcError> {
        validate_address(address)?;
        let endpoints = self.registry.ranked_by_score();
        if endpoints.is_empty() {
            return Err(self.no_healthy_endpoints());
        }
        if options.total_limit == 0 {
            return Ok(Vec::new());
        }

        let page_size = options.page_size.clamp(1, options.total_limit);
        let mut merger = ScanMerger::new(&options.id_field, options.total_limit);

        match options.mode {
            CursorMode::Continuation => {
                let index_key = format!("{}:{}", method, address);
                let seeds = if options.seeds.is_empty() {
                    self.scan_index
                        .lock()
                        .get(&index_key)
                        .cloned()
                        .unwrap_or_default()
                } else {
                    options.seeds.clone()
                };
                let lanes = Lane::split(&spread(&seeds, endpoints.len() - 1));
                debug!(lanes = lanes.len(), "Continuation scan");

                let seen = Mutex::new(HashSet::new());
                let walks = lanes.into_iter().enumerate().map(|(i, lane)| {
                    self.walk_lane(lane, &endpoints, i, method, address, page_size, options, &seen)
                });
                for lane in try_join_all(walks).await? {
                    merger.extend(lane);
                }

                // The next scan of this address splits at these
                let boundaries = page_boundaries(&merger.items, page_size, &options.id_field);
                let mut index = self.scan_index.lock();
                if index.len() >= MAX_SCAN_INDEX && !index.contains_key(&index_key) {
                    index.clear();
                }
                index.insert(index_key, boundaries);
                drop(index);
            }
            CursorMode::Offset => {
                let pages = options.total_limit.div_ceil(page_size);
                let fetches = (0..pages).map(|i| {
                    let order = rotated(&endpoints, i);
                    let params = page_params(
                        address,
                        page_size,
                        &options.cursor_param,
                        Some(json!(i * page_size)),
                    );
                    async move {
                        self.call_with_failover(&order, method, &params, options.priority)
                            .await
                    }
                });

                for page in join_all(fetches).await {
                    let items = page_items(page?)?;
                    let short = items.len() < page_size;
                    merger.extend(items);
                    if short {
                        break;
                    }
                }
            }
        }

        debug!(
            items = merger.items.len(),
            duplicates = merger.duplicates,
            "Scan complete"
        );
        Ok(merger.items)
    }

    /// Walk one lane page by page until its boundary, a short page, or the
    /// scan's item budget is reached
    #[allow(clippy::too_many_arguments)]
    async fn walk_lane(
        &self,
        lane: Lane,
        endpoints: &[Arc<Endpoint>],
        offset: usize,
        method: &str,
        address: &str,
        page_size: usize,
        options: &ScanOptions,
        seen: &Mutex<HashSet<String>>,
    ) -> Result<Vec<Value>, RpcError> {
        let mut items = Vec::new();
        let mut cursor = lane.start;
        let mut page_no = 0;

        while seen.lock().len() < options.total_limit {
            let params = page_params(address, page_size, &options.cursor_param, cursor.take());
            let order = rotated(endpoints, offset + page_no);
            let page = self
                .call_with_failover(&order, method, &params, options.priority)
                .await?;
            let page = page_items(page)?;
            page_no += 1;

            let full = page.len() >= page_size;
            let last_id = page.last().and_then(|item| item.get(&options.id_field)).cloned();
            let mut reached = false;
            {
                let mut seen = seen.lock();
                for item in page {
                    let id = item_id(&item, &options.id_field);
                    reached = lane.stop_at.as_deref() == Some(id.as_str());
                    seen.insert(id);
                    items.push(item);
                    if reached {
                        break;
                    }
                }
            }

            match last_id {
                Some(id) if full && !reached => cursor = Some(id),
                _ => break,
            }
        }
        Ok(items)
    }

    pub fn stats(&self) -> PoolStats {
        let snapshots = self.registry.snapshots();
        let st = self.gates.state.lock();
        let now = Instant::now();

        let endpoint_stats = snapshots
            .into_iter()
            .enumerate()
            .map(|(idx, endpoint)| {
                let gate = &st.gates[idx];
                EndpointPoolStats {
                    endpoint,
                    concurrency_limit: self.gates.limits[idx].concurrency,
                    rps_limit: self.gates.limits[idx].rps,
                    active_requests: gate.in_flight,
                    queued: gate.queue.len(),
                    requests_in_window: gate
                        .window
                        .iter()
                        .filter(|&&at| at + RATE_WINDOW > now)
                        .count(),
                    dispatched: gate.dispatched,
                }
            })
            .collect::<Vec<_>>();

        let count = |status: HealthStatus| {
            endpoint_stats
                .iter()
                .filter(|e| e.endpoint.health == status)
                .count()
        };

        PoolStats {
            total_endpoints: endpoint_stats.len(),
            healthy_endpoints: count(HealthStatus::Healthy),
            degraded_endpoints: count(HealthStatus::Degraded),
            unhealthy_endpoints: count(HealthStatus::Unhealthy),
            in_flight: st.in_flight,
            max_in_flight: self.gates.max_in_flight,
            queued: st.queued,
            max_queue_size: self.gates.max_queue,
            queue_timeouts: st.queue_timeouts,
            queue_full_rejections: st.queue_full_rejections,
            endpoint_stats,
        }
    }
}

/// Pin breaker-raised timeouts to the endpoint url
fn attribute(err: RpcError, url: &str) -> RpcError {
    match err {
        RpcError::Timeout { timeout_ms, .. } => RpcError::Timeout {
            endpoint: url.to_string(),
            timeout_ms,
        },
        other => other,
    }
}

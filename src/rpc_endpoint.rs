//! Endpoint registry with health tracking and dynamic scoring
//!
//! The registry owns one [`Endpoint`] per configured node for the lifetime of
//! the client. Health is driven by probing; request outcomes feed the EWMA
//! latency and success rate that rank endpoints for the strategy layer.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::rpc_atomics::AtomicEndpointStats;
use crate::rpc_config::EndpointConfig;

/// Health status of an RPC endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Failed recent probes but still below the unhealthy threshold
    Degraded,
    /// Excluded from selection until a probe succeeds
    Unhealthy,
}

/// Health change event for propagation
#[derive(Debug, Clone, Serialize)]
pub struct HealthChangeEvent {
    pub url: String,
    pub old_status: HealthStatus,
    pub new_status: HealthStatus,
    pub timestamp: DateTime<Utc>,
}

/// EWMA-based latency tracker for dynamic scoring
#[derive(Debug)]
struct LatencyTracker {
    ewma_latency_ms: Mutex<f64>,
    alpha: f64,
}

impl LatencyTracker {
    fn new(alpha: f64) -> Self {
        Self {
            ewma_latency_ms: Mutex::new(0.0),
            alpha: alpha.clamp(0.01, 0.99),
        }
    }

    fn update(&self, latency_ms: f64) {
        let mut ewma = self.ewma_latency_ms.lock();
        if *ewma == 0.0 {
            *ewma = latency_ms;
        } else {
            *ewma = self.alpha * latency_ms + (1.0 - self.alpha) * *ewma;
        }
    }

    fn get(&self) -> f64 {
        *self.ewma_latency_ms.lock()
    }
}

/// A node descriptor plus its live health and scoring state
#[derive(Debug)]
pub struct Endpoint {
    pub id: usize,
    pub config: EndpointConfig,
    pub stats: AtomicEndpointStats,
    health: Mutex<HealthStatus>,
    last_probe_at: Mutex<Option<Instant>>,
    probe_failures: AtomicU64,
    latency: LatencyTracker,
    dynamic_score: Mutex<f64>,
}

impl Endpoint {
    pub fn new(id: usize, config: EndpointConfig) -> Self {
        let endpoint = Self {
            id,
            config,
            stats: AtomicEndpointStats::new(),
            health: Mutex::new(HealthStatus::Healthy),
            last_probe_at: Mutex::new(None),
            probe_failures: AtomicU64::new(0),
            latency: LatencyTracker::new(0.2),
            dynamic_score: Mutex::new(0.0),
        };
        endpoint.update_dynamic_score();
        endpoint
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Breaker key for a call of `method` against this endpoint
    pub fn service_key(&self, method: &str) -> String {
        format!("{}:{}", self.config.url, method)
    }

    pub fn health(&self) -> HealthStatus {
        *self.health.lock()
    }

    pub fn is_selectable(&self) -> bool {
        self.health() != HealthStatus::Unhealthy
    }

    pub fn last_probe_at(&self) -> Option<Instant> {
        *self.last_probe_at.lock()
    }

    pub fn ewma_latency_ms(&self) -> f64 {
        self.latency.get()
    }

    pub fn success_rate(&self) -> f64 {
        self.stats.success_rate()
    }

    pub fn score(&self) -> f64 {
        *self.dynamic_score.lock()
    }

    /// Record request result with latency
    pub fn record_request(&self, success: bool, latency_ms: f64) {
        let latency_us = (latency_ms * 1000.0) as u64;
        if success {
            self.stats.record_success(latency_us);
        } else {
            self.stats.record_failure(latency_us);
        }
        self.latency.update(latency_ms);
        self.update_dynamic_score();
    }

    /// Score formula: base - latency_penalty + success_bonus - failure_penalty + weight_bonus
    fn update_dynamic_score(&self) {
        let mut score = 100.0;

        let latency = self.latency.get();
        score -= (latency / 10.0).min(50.0);

        let success_rate = self.success_rate();
        score += (success_rate - 0.5) * 40.0;

        let consecutive = self.stats.consecutive_errors() as f64;
        score -= (consecutive * 10.0).min(30.0);

        score += ((self.config.weight - 1.0) * 10.0).clamp(-10.0, 20.0);

        let final_score = score.clamp(0.0, 200.0);
        *self.dynamic_score.lock() = final_score;

        debug!(
            url = %self.config.url,
            score = final_score,
            latency = latency,
            success_rate = success_rate,
            consecutive_failures = consecutive,
            "Updated dynamic score"
        );
    }

    pub fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            id: self.id,
            url: self.config.url.clone(),
            health: self.health(),
            score: self.score(),
            ewma_latency_ms: self.ewma_latency_ms(),
            success_rate: self.success_rate(),
            total_requests: self.stats.total_requests(),
            total_errors: self.stats.total_errors(),
            in_flight: self.stats.in_flight(),
            peak_in_flight: self.stats.peak_in_flight(),
            last_latency_ms: self.stats.last_latency_us() as f64 / 1000.0,
            ms_since_last_success: self
                .stats
                .time_since_last_success()
                .map(|d| d.as_millis() as u64),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub id: usize,
    pub url: String,
    pub health: HealthStatus,
    pub score: f64,
    pub ewma_latency_ms: f64,
    pub success_rate: f64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub in_flight: u64,
    pub peak_in_flight: u64,
    pub last_latency_ms: f64,
    pub ms_since_last_success: Option<u64>,
}

/// Fixed set of endpoints, created at startup and never destroyed
pub struct EndpointRegistry {
    endpoints: Vec<Arc<Endpoint>>,
    unhealthy_threshold: u64,
    health_event_tx: broadcast::Sender<HealthChangeEvent>,
}

impl EndpointRegistry {
    pub fn new(configs: &[EndpointConfig], unhealthy_threshold: u32) -> Self {
        let endpoints = configs
            .iter()
            .enumerate()
            .map(|(id, config)| Arc::new(Endpoint::new(id, config.clone())))
            .collect();

        let (health_event_tx, _) = broadcast::channel(100);

        Self {
            endpoints,
            unhealthy_threshold: u64::from(unhealthy_threshold.max(1)),
            health_event_tx,
        }
    }

    pub fn all(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn get(&self, id: usize) -> Option<&Arc<Endpoint>> {
        self.endpoints.get(id)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn unhealthy_count(&self) -> usize {
        self.endpoints.iter().filter(|e| !e.is_selectable()).count()
    }

    /// Subscribe to health change events
    pub fn subscribe_health_events(&self) -> broadcast::Receiver<HealthChangeEvent> {
        self.health_event_tx.subscribe()
    }

    /// Selectable endpoints, best dynamic score first
    pub fn ranked_by_score(&self) -> Vec<Arc<Endpoint>> {
        self.ranked(|a, b| b.score().total_cmp(&a.score()))
    }

    /// Selectable endpoints, lowest EWMA latency first (speed set)
    pub fn ranked_by_latency(&self) -> Vec<Arc<Endpoint>> {
        self.ranked(|a, b| a.ewma_latency_ms().total_cmp(&b.ewma_latency_ms()))
    }

    /// Selectable endpoints, highest success rate first (reliability set)
    pub fn ranked_by_reliability(&self) -> Vec<Arc<Endpoint>> {
        self.ranked(|a, b| {
            b.success_rate()
                .total_cmp(&a.success_rate())
                .then_with(|| b.score().total_cmp(&a.score()))
        })
    }

    fn ranked<F>(&self, compare: F) -> Vec<Arc<Endpoint>>
    where
        F: Fn(&Endpoint, &Endpoint) -> std::cmp::Ordering,
    {
        let mut candidates: Vec<Arc<Endpoint>> = self
            .endpoints
            .iter()
            .filter(|e| e.is_selectable())
            .cloned()
            .collect();
        // Stable sort keeps configuration order among equals
        candidates.sort_by(|a, b| compare(a, b));
        candidates
    }

    /// Apply a probe outcome and emit a health event on change
    pub fn record_probe(&self, endpoint: &Endpoint, success: bool, latency_ms: f64) {
        *endpoint.last_probe_at.lock() = Some(Instant::now());

        let new_status = if success {
            endpoint.probe_failures.store(0, Ordering::Relaxed);
            endpoint.latency.update(latency_ms);
            endpoint.update_dynamic_score();
            HealthStatus::Healthy
        } else {
            let failures = endpoint.probe_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= self.unhealthy_threshold {
                HealthStatus::Unhealthy
            } else {
                HealthStatus::Degraded
            }
        };

        let old_status = std::mem::replace(&mut *endpoint.health.lock(), new_status);
        if old_status != new_status {
            self.emit_health_event(endpoint.url(), old_status, new_status);
        }
    }

    fn emit_health_event(&self, url: &str, old_status: HealthStatus, new_status: HealthStatus) {
        let event = HealthChangeEvent {
            url: url.to_string(),
            old_status,
            new_status,
            timestamp: Utc::now(),
        };

        // Best effort send - no receivers is fine
        let _ = self.health_event_tx.send(event);

        if new_status == HealthStatus::Unhealthy {
            warn!(url = %url, old = ?old_status, "Endpoint marked unhealthy");
        } else {
            info!(url = %url, old = ?old_status, new = ?new_status, "Health status changed");
        }
    }

    pub fn snapshots(&self) -> Vec<EndpointSnapshot> {
        self.endpoints.iter().map(|e| e.snapshot()).collect()
    }
}

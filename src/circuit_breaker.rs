//! Per-service circuit breaker
//!
//! One [`ServiceCircuit`] per service key (`"{endpoint}:{method}"`), created on
//! first use. All state for a key sits behind a single lock that is never held
//! across an `.await`, so every transition happens in one synchronous turn.
//!
//! - `Closed`: calls run raced against their timeout; a success resets the
//!   failure streak and `failure_threshold` consecutive failures open the circuit.
//! - `Open`: calls fail with [`RpcError::ServiceUnavailable`] without touching
//!   the network until the cooldown has passed.
//! - `HalfOpen`: up to `half_open_max_trials` trial calls are admitted; a trial
//!   success closes the circuit, any failure reopens it and restarts the cooldown.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::rpc_config::BreakerConfig;
use crate::rpc_errors::RpcError;

/// Circuit Breaker State
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

#[derive(Debug)]
struct ServiceCircuit {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    cooldown_until: Option<Instant>,
    trials_in_flight: u32,

    calls: u64,
    failures: u64,
    rejections: u64,
    opens: u64,
    closes: u64,
    overhead_ns: u64,
    overhead_samples: u64,
}

impl ServiceCircuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            opened_at: None,
            cooldown_until: None,
            trials_in_flight: 0,
            calls: 0,
            failures: 0,
            rejections: 0,
            opens: 0,
            closes: 0,
            overhead_ns: 0,
            overhead_samples: 0,
        }
    }

    fn open_for_ms(&self, now: Instant) -> u64 {
        self.opened_at
            .map(|at| now.saturating_duration_since(at).as_millis() as u64)
            .unwrap_or(0)
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        self.cooldown_until.map_or(true, |until| now >= until)
    }
}

/// Read-only view of one circuit
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub service_key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub calls: u64,
    pub failures: u64,
    pub rejections: u64,
    pub opens: u64,
    pub closes: u64,
    pub avg_overhead_ns: u64,
    pub ms_since_last_failure: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub enabled: bool,
    pub open: usize,
    pub half_open: usize,
    pub circuits: Vec<CircuitSnapshot>,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    circuits: DashMap<String, Mutex<ServiceCircuit>>,
    metrics: Arc<Metrics>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
            metrics,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn with_circuit<R>(&self, key: &str, f: impl FnOnce(&mut ServiceCircuit) -> R) -> R {
        if let Some(circuit) = self.circuits.get(key) {
            return f(&mut circuit.lock());
        }
        let circuit = self
            .circuits
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(ServiceCircuit::new()));
        let mut guard = circuit.lock();
        f(&mut guard)
    }

    /// Cheap admission peek used before a request takes a pool slot.
    ///
    /// Does not create circuits or claim trial slots.
    pub fn check(&self, key: &str) -> Result<(), RpcError> {
        if !self.config.enabled {
            return Ok(());
        }
        let Some(circuit) = self.circuits.get(key) else {
            return Ok(());
        };
        let mut c = circuit.lock();
        let now = Instant::now();
        let blocked = match c.state {
            CircuitState::Closed => false,
            CircuitState::Open => !c.cooldown_elapsed(now),
            CircuitState::HalfOpen => c.trials_in_flight >= self.config.half_open_max_trials,
        };
        if blocked {
            c.rejections += 1;
            self.metrics.breaker_rejections_total.inc();
            return Err(RpcError::ServiceUnavailable {
                service_key: key.to_string(),
                open_for_ms: c.open_for_ms(now),
            });
        }
        Ok(())
    }

    /// Whether a call for `key` would currently be admitted, without side effects
    pub fn allows(&self, key: &str) -> bool {
        if !self.config.enabled {
            return true;
        }
        self.circuits.get(key).map_or(true, |circuit| {
            let c = circuit.lock();
            match c.state {
                CircuitState::Closed => true,
                CircuitState::Open => c.cooldown_elapsed(Instant::now()),
                CircuitState::HalfOpen => c.trials_in_flight < self.config.half_open_max_trials,
            }
        })
    }

    /// Run `operation` guarded by the circuit of `key`, raced against `timeout`.
    ///
    /// On timeout the operation is dropped and the failure path is taken.
    pub async fn execute<T, Fut>(
        &self,
        key: &str,
        timeout: Duration,
        operation: Fut,
    ) -> Result<T, RpcError>
    where
        Fut: Future<Output = Result<T, RpcError>>,
    {
        if !self.config.enabled {
            return match tokio::time::timeout(timeout, operation).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RpcError::timeout(key, timeout)),
            };
        }

        let admission = self.admit(key)?;

        // A cancelled trial must hand its slot back
        let guard = scopeguard::guard(admission, |admission| {
            if admission == Admission::Trial {
                self.abandon_trial(key);
            }
        });

        let outcome = match tokio::time::timeout(timeout, operation).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::timeout(key, timeout)),
        };

        let admission = scopeguard::ScopeGuard::into_inner(guard);
        self.record(key, admission, &outcome);
        outcome
    }

    fn admit(&self, key: &str) -> Result<Admission, RpcError> {
        let started = std::time::Instant::now();
        let max_trials = self.config.half_open_max_trials;

        self.with_circuit(key, |c| {
            let now = Instant::now();

            if c.state == CircuitState::Open && c.cooldown_elapsed(now) {
                c.state = CircuitState::HalfOpen;
                c.trials_in_flight = 0;
                self.metrics
                    .breaker_transitions_total
                    .with_label_values(&["half_open"])
                    .inc();
                info!(service_key = %key, "Circuit half-open, admitting trial calls");
            }

            let admission = match c.state {
                CircuitState::Closed => Ok(Admission::Normal),
                CircuitState::HalfOpen if c.trials_in_flight < max_trials => {
                    c.trials_in_flight += 1;
                    Ok(Admission::Trial)
                }
                CircuitState::HalfOpen | CircuitState::Open => {
                    c.rejections += 1;
                    self.metrics.breaker_rejections_total.inc();
                    debug!(service_key = %key, state = ?c.state, "Circuit rejected call");
                    Err(RpcError::ServiceUnavailable {
                        service_key: key.to_string(),
                        open_for_ms: c.open_for_ms(now),
                    })
                }
            };

            c.overhead_ns += started.elapsed().as_nanos() as u64;
            c.overhead_samples += 1;
            admission
        })
    }

    fn record<T>(&self, key: &str, admission: Admission, outcome: &Result<T, RpcError>) {
        let started = std::time::Instant::now();
        let failed = matches!(outcome, Err(e) if e.trips_breaker());

        self.with_circuit(key, |c| {
            let now = Instant::now();
            c.calls += 1;
            if admission == Admission::Trial {
                c.trials_in_flight = c.trials_in_flight.saturating_sub(1);
            }

            if failed {
                c.failures += 1;
                c.failure_count += 1;
                c.last_failure_at = Some(now);

                let should_open = match c.state {
                    CircuitState::HalfOpen => true,
                    CircuitState::Closed => c.failure_count >= self.config.failure_threshold,
                    CircuitState::Open => false,
                };
                if should_open {
                    self.trip(key, c, now);
                }
            } else {
                match c.state {
                    CircuitState::HalfOpen if admission == Admission::Trial => {
                        c.state = CircuitState::Closed;
                        c.failure_count = 0;
                        c.opened_at = None;
                        c.cooldown_until = None;
                        c.closes += 1;
                        self.metrics
                            .breaker_transitions_total
                            .with_label_values(&["closed"])
                            .inc();
                        info!(service_key = %key, "Circuit closed after successful trial");
                    }
                    CircuitState::Closed => c.failure_count = 0,
                    _ => {}
                }
            }

            c.overhead_ns += started.elapsed().as_nanos() as u64;
        });
    }

    fn trip(&self, key: &str, c: &mut ServiceCircuit, now: Instant) {
        let from = c.state;
        c.state = CircuitState::Open;
        c.opened_at = Some(now);
        c.cooldown_until = Some(now + self.config.cooldown());
        c.trials_in_flight = 0;
        c.opens += 1;
        self.metrics
            .breaker_transitions_total
            .with_label_values(&["open"])
            .inc();
        warn!(
            service_key = %key,
            from = ?from,
            failures = c.failure_count,
            cooldown_ms = self.config.cooldown_ms,
            "Circuit opened"
        );
    }

    fn abandon_trial(&self, key: &str) {
        self.with_circuit(key, |c| {
            if c.state == CircuitState::HalfOpen {
                c.trials_in_flight = c.trials_in_flight.saturating_sub(1);
            }
        });
        debug!(service_key = %key, "Trial call abandoned");
    }

    /// Current state without triggering the cooldown transition
    pub fn state(&self, key: &str) -> CircuitState {
        self.circuits
            .get(key)
            .map(|c| c.lock().state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn failure_count(&self, key: &str) -> u32 {
        self.circuits
            .get(key)
            .map(|c| c.lock().failure_count)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> BreakerStats {
        let now = Instant::now();
        let mut circuits: Vec<CircuitSnapshot> = self
            .circuits
            .iter()
            .map(|entry| {
                let c = entry.value().lock();
                CircuitSnapshot {
                    service_key: entry.key().clone(),
                    state: c.state,
                    failure_count: c.failure_count,
                    calls: c.calls,
                    failures: c.failures,
                    rejections: c.rejections,
                    opens: c.opens,
                    closes: c.closes,
                    avg_overhead_ns: c.overhead_ns / c.overhead_samples.max(1),
                    ms_since_last_failure: c
                        .last_failure_at
                        .map(|at| now.saturating_duration_since(at).as_millis() as u64),
                }
            })
            .collect();
        circuits.sort_by(|a, b| a.service_key.cmp(&b.service_key));

        BreakerStats {
            enabled: self.config.enabled,
            open: circuits
                .iter()
                .filter(|c| c.state == CircuitState::Open)
                .count(),
            half_open: circuits
                .iter()
                .filter(|c| c.state == CircuitState::HalfOpen)
                .count(),
            circuits,
        }
    }
}

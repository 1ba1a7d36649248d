use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

/// Lock-free request counters for one endpoint
#[derive(Debug)]
pub struct AtomicEndpointStats {
    /// Total number of requests made to this endpoint
    pub total_requests: AtomicU64,

    /// Requests that ended in a node-side failure
    pub total_errors: AtomicU64,

    /// Consecutive error count (resets on success)
    pub consecutive_errors: AtomicU64,

    /// Last observed latency in microseconds
    pub last_latency_us: AtomicU64,

    /// Current number of requests holding a slot
    pub in_flight: AtomicU64,

    /// Highest in-flight count ever observed
    pub peak_in_flight: AtomicU64,

    last_success: RwLock<Option<Instant>>,
}

impl AtomicEndpointStats {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            consecutive_errors: AtomicU64::new(0),
            last_latency_us: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            peak_in_flight: AtomicU64::new(0),
            last_success: RwLock::new(None),
        }
    }

    /// Record a successful request
    pub fn record_success(&self, latency_us: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_errors.store(0, Ordering::Relaxed);
        self.last_latency_us.store(latency_us, Ordering::Relaxed);
        *self.last_success.write() = Some(Instant::now());
    }

    /// Record a failed request
    pub fn record_failure(&self, latency_us: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        self.consecutive_errors.fetch_add(1, Ordering::Relaxed);
        self.last_latency_us.store(latency_us, Ordering::Relaxed);
    }

    pub fn slot_acquired(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::Relaxed);
    }

    pub fn slot_released(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    /// Success rate (1.0 with no traffic yet)
    pub fn success_rate(&self) -> f64 {
        let total = self.total_requests.load(Ordering::Relaxed);
        if total == 0 {
            return 1.0;
        }
        let errors = self.total_errors.load(Ordering::Relaxed);
        (total - errors) as f64 / total as f64
    }

    pub fn consecutive_errors(&self) -> u64 {
        self.consecutive_errors.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn last_latency_us(&self) -> u64 {
        self.last_latency_us.load(Ordering::Relaxed)
    }

    pub fn peak_in_flight(&self) -> u64 {
        self.peak_in_flight.load(Ordering::Relaxed)
    }

    pub fn time_since_last_success(&self) -> Option<std::time::Duration> {
        self.last_success.read().as_ref().map(|instant| instant.elapsed())
    }
}

impl Default for AtomicEndpointStats {
    fn default() -> Self {
        Self::new()
    }
}

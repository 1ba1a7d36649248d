//! Metrics collection and export module

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::time::Instant;

/// Prometheus registry shared by every component of one client
pub struct Metrics {
    registry: Registry,

    // Counters
    pub requests_total: IntCounterVec,
    pub errors_total: IntCounterVec,
    pub queue_rejections_total: IntCounterVec,
    pub breaker_transitions_total: IntCounterVec,
    pub breaker_rejections_total: IntCounter,
    pub cache_lookups_total: IntCounterVec,
    pub cache_evictions_total: IntCounter,
    pub batch_flushes_total: IntCounter,
    pub batch_items_total: IntCounter,
    pub batch_physical_calls_total: IntCounter,
    pub batch_failed_chunks_total: IntCounter,
    pub strategy_calls_total: IntCounterVec,
    pub hedges_fired_total: IntCounter,
    pub health_probes_total: IntCounterVec,

    // Gauges
    pub in_flight: IntGauge,
    pub queue_depth: IntGauge,
    pub cache_entries: IntGauge,
    pub healthy_endpoints: IntGauge,

    // Histograms
    pub rpc_latency: Histogram,
    pub queue_wait: Histogram,
}

impl Metrics {
    /// Create new metrics instance
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("rpc_requests_total", "Physical RPC requests by endpoint and outcome"),
            &["endpoint", "outcome"],
        )?;

        let errors_total = IntCounterVec::new(
            Opts::new("rpc_errors_total", "Errors surfaced by kind"),
            &["kind"],
        )?;

        let queue_rejections_total = IntCounterVec::new(
            Opts::new(
                "queue_rejections_total",
                "Queued requests rejected (full, timeout, shutdown)",
            ),
            &["reason"],
        )?;

        let breaker_transitions_total = IntCounterVec::new(
            Opts::new("breaker_transitions_total", "Circuit state transitions"),
            &["to"],
        )?;

        let breaker_rejections_total = IntCounter::with_opts(Opts::new(
            "breaker_rejections_total",
            "Calls failed fast by an open circuit",
        ))?;

        let cache_lookups_total = IntCounterVec::new(
            Opts::new("cache_lookups_total", "Cache lookups by result"),
            &["result"],
        )?;

        let cache_evictions_total = IntCounter::with_opts(Opts::new(
            "cache_evictions_total",
            "Entries evicted from the main cache tier",
        ))?;

        let batch_flushes_total =
            IntCounter::with_opts(Opts::new("batch_flushes_total", "Batch windows flushed"))?;

        let batch_items_total = IntCounter::with_opts(Opts::new(
            "batch_items_total",
            "Logical calls submitted to batch windows",
        ))?;

        let batch_physical_calls_total = IntCounter::with_opts(Opts::new(
            "batch_physical_calls_total",
            "Physical batch calls issued",
        ))?;

        let batch_failed_chunks_total = IntCounter::with_opts(Opts::new(
            "batch_failed_chunks_total",
            "Batch chunks that failed as a whole",
        ))?;

        let strategy_calls_total = IntCounterVec::new(
            Opts::new("strategy_calls_total", "Executor runs by strategy and outcome"),
            &["strategy", "outcome"],
        )?;

        let hedges_fired_total = IntCounter::with_opts(Opts::new(
            "hedges_fired_total",
            "Hedge requests fired after the hedging delay",
        ))?;

        let health_probes_total = IntCounterVec::new(
            Opts::new("health_probes_total", "Health probes by outcome"),
            &["outcome"],
        )?;

        let in_flight = IntGauge::with_opts(Opts::new(
            "rpc_in_flight",
            "Requests currently holding an execution slot",
        ))?;

        let queue_depth =
            IntGauge::with_opts(Opts::new("queue_depth", "Requests waiting for a slot"))?;

        let cache_entries =
            IntGauge::with_opts(Opts::new("cache_entries", "Entries in the main cache tier"))?;

        let healthy_endpoints = IntGauge::with_opts(Opts::new(
            "healthy_endpoints",
            "Endpoints currently eligible for selection",
        ))?;

        let rpc_latency = Histogram::with_opts(
            HistogramOpts::new("rpc_latency_seconds", "RPC call latency")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )?;

        let queue_wait = Histogram::with_opts(
            HistogramOpts::new("queue_wait_seconds", "Time spent waiting for a slot")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(queue_rejections_total.clone()))?;
        registry.register(Box::new(breaker_transitions_total.clone()))?;
        registry.register(Box::new(breaker_rejections_total.clone()))?;
        registry.register(Box::new(cache_lookups_total.clone()))?;
        registry.register(Box::new(cache_evictions_total.clone()))?;
        registry.register(Box::new(batch_flushes_total.clone()))?;
        registry.register(Box::new(batch_items_total.clone()))?;
        registry.register(Box::new(batch_physical_calls_total.clone()))?;
        registry.register(Box::new(batch_failed_chunks_total.clone()))?;
        registry.register(Box::new(strategy_calls_total.clone()))?;
        registry.register(Box::new(hedges_fired_total.clone()))?;
        registry.register(Box::new(health_probes_total.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(cache_entries.clone()))?;
        registry.register(Box::new(healthy_endpoints.clone()))?;
        registry.register(Box::new(rpc_latency.clone()))?;
        registry.register(Box::new(queue_wait.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            errors_total,
            queue_rejections_total,
            breaker_transitions_total,
            breaker_rejections_total,
            cache_lookups_total,
            cache_evictions_total,
            batch_flushes_total,
            batch_items_total,
            batch_physical_calls_total,
            batch_failed_chunks_total,
            strategy_calls_total,
            hedges_fired_total,
            health_probes_total,
            in_flight,
            queue_depth,
            cache_entries,
            healthy_endpoints,
            rpc_latency,
            queue_wait,
        })
    }

    /// Get the registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a surfaced error by kind
    pub fn record_error(&self, kind: &str) {
        self.errors_total.with_label_values(&[kind]).inc();
    }

    /// Render every registered metric in the text exposition format
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration(&self, histogram: &Histogram) {
        histogram.observe(self.start.elapsed().as_secs_f64());
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_series() {
        let metrics = Metrics::new().unwrap();
        metrics.record_error("timeout");
        metrics
            .requests_total
            .with_label_values(&["https://a.example", "success"])
            .inc();
        metrics.queue_depth.set(3);

        let text = metrics.render().unwrap();
        assert!(text.contains("rpc_errors_total{kind=\"timeout\"} 1"));
        assert!(text.contains("queue_depth 3"));
        assert!(text.contains("rpc_requests_total"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_follows_runtime_clock() {
        let metrics = Metrics::new().unwrap();
        let timer = Timer::start();
        tokio::time::advance(std::time::Duration::from_millis(40)).await;
        assert!(timer.elapsed_ms() >= 40.0);
        timer.observe_duration(&metrics.rpc_latency);
        assert_eq!(metrics.rpc_latency.get_sample_count(), 1);
    }
}

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::rpc_errors::{ConfigurationError, RetryPolicy};
use crate::rpc_executor::Strategy;

/// Configuration for an individual RPC endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// The RPC endpoint URL
    pub url: String,

    /// Weight for ranking (higher = preferred)
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Request budget per rolling second
    #[serde(default = "default_rps")]
    pub rps: u32,

    /// Maximum concurrent in-flight requests to this endpoint
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// Request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_weight() -> f64 {
    1.0
}

fn default_rps() -> u32 {
    50
}

fn default_concurrency() -> u32 {
    16
}

fn default_timeout_ms() -> u64 {
    5000
}

impl EndpointConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            weight: default_weight(),
            rps: default_rps(),
            concurrency: default_concurrency(),
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub enabled: bool,
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    /// Trial calls admitted concurrently while half-open
    pub half_open_max_trials: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            cooldown_ms: 10_000,
            half_open_max_trials: 1,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HedgingConfig {
    pub enabled: bool,
    pub delay_ms: u64,
    /// Extra requests fired after the delay (on top of the primary)
    pub max_extra: usize,
    /// Methods hedging applies to; empty means every single-endpoint call
    pub methods: Vec<String>,
}

impl Default for HedgingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_ms: 150,
            max_extra: 1,
            methods: Vec::new(),
        }
    }
}

impl HedgingConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn applies_to(&self, method: &str) -> bool {
        self.enabled && (self.methods.is_empty() || self.methods.iter().any(|m| m == method))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Hard cap on queued requests across all endpoints
    pub max_size: usize,
    pub deadline_ms: u64,
    /// Interval of the expired-entry sweep
    pub sweep_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            deadline_ms: 8000,
            sweep_interval_ms: 250,
        }
    }
}

impl QueueConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    pub enabled: bool,
    /// Idle sockets kept per host
    pub sockets: usize,
    pub msecs: u64,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sockets: 32,
            msecs: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_ms: u64,
    pub jitter_ms: u64,
    pub probe_timeout_ms: u64,
    pub probe_rps_limit: u32,
    /// Lightweight method issued as the probe
    pub probe_method: String,
    /// Consecutive failed probes before an endpoint leaves selection
    pub unhealthy_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            jitter_ms: 1_000,
            probe_timeout_ms: 2_000,
            probe_rps_limit: 5,
            probe_method: "getHealth".to_string(),
            unhealthy_threshold: 1,
        }
    }
}

impl HealthConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Next probe delay, `interval ± jitter`
    pub fn next_delay(&self) -> Duration {
        let jitter = self.jitter_ms.min(self.interval_ms) as i64;
        let offset = if jitter == 0 {
            0
        } else {
            fastrand::i64(-jitter..=jitter)
        };
        Duration::from_millis((self.interval_ms as i64 + offset).max(1) as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub namespace: String,
    pub hot_capacity: usize,
    pub main_capacity: usize,
    pub default_ttl_ms: u64,
    /// TTL for cached failures
    pub error_ttl_ms: u64,
    pub sweep_interval_ms: u64,
    /// Methods cached by default and their TTL; others are cached only when
    /// the caller passes an explicit ttl
    pub method_ttls_ms: HashMap<String, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let method_ttls_ms = [
            ("getAccountInfo", 1_000),
            ("getTransaction", 60_000),
            ("getTokenSupply", 5_000),
        ]
        .into_iter()
        .map(|(m, ttl)| (m.to_string(), ttl))
        .collect();

        Self {
            enabled: true,
            namespace: "default".to_string(),
            hot_capacity: 64,
            main_capacity: 10_000,
            default_ttl_ms: 2_000,
            error_ttl_ms: 250,
            sweep_interval_ms: 5_000,
            method_ttls_ms,
        }
    }
}

impl CacheConfig {
    pub fn ttl_for(&self, method: &str) -> Option<Duration> {
        self.method_ttls_ms
            .get(method)
            .map(|ms| Duration::from_millis(*ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub enabled: bool,
    pub max_batch_size: usize,
    pub flush_delay_ms: u64,
    /// Dispatch the chunks of one window concurrently
    pub parallel_chunks: bool,
    /// Methods coalesced by the client
    pub methods: Vec<String>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: 100,
            flush_delay_ms: 10,
            parallel_chunks: true,
            methods: vec!["getAccountInfo".to_string(), "getTransaction".to_string()],
        }
    }
}

impl BatchConfig {
    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    pub fn coalesces(&self, method: &str) -> bool {
        self.enabled && self.methods.iter().any(|m| m == method)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub fanout: usize,
    pub min_consensus: usize,
    pub timeout_ms: u64,
    /// JSON pointer compared instead of the whole response (e.g. `/value/slot`)
    pub compare_field: Option<String>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            fanout: 3,
            min_consensus: 2,
            timeout_ms: 3_000,
            compare_field: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DualPairConfig {
    /// Endpoints in the speed-optimized set
    pub primary_size: usize,
    /// Endpoints in the reliability-optimized set
    pub secondary_size: usize,
    /// EWMA factor for the rolling pair statistics
    pub stats_alpha: f64,
}

impl Default for DualPairConfig {
    fn default() -> Self {
        Self {
            primary_size: 1,
            secondary_size: 1,
            stats_alpha: 0.2,
        }
    }
}

/// Backoff shape for retries on alternate endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryProfile {
    #[default]
    Standard,
    /// More attempts, short delays
    Aggressive,
    /// Fewer attempts, long delays
    Conservative,
    /// Single attempt
    None,
}

impl RetryProfile {
    pub fn policy(self) -> RetryPolicy {
        match self {
            RetryProfile::Standard => RetryPolicy::default(),
            RetryProfile::Aggressive => RetryPolicy::aggressive(),
            RetryProfile::Conservative => RetryPolicy::conservative(),
            RetryProfile::None => RetryPolicy::none(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub default: Strategy,
    /// Method name to strategy lookup table
    pub methods: HashMap<String, Strategy>,
    pub race_fanout: usize,
    pub retry_profile: RetryProfile,
    /// Overrides the attempt count of `retry_profile`
    pub retry_max_attempts: Option<u32>,
    pub consensus: ConsensusConfig,
    pub dual_pair: DualPairConfig,
}

impl StrategyConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        let mut policy = self.retry_profile.policy();
        if let Some(attempts) = self.retry_max_attempts {
            policy.max_attempts = attempts.max(1);
        }
        policy
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        let methods = [
            ("getAccountInfo", Strategy::Race),
            ("getMultipleAccounts", Strategy::Race),
            ("getSignatureStatuses", Strategy::Consensus),
            ("getSignaturesForAddress", Strategy::DualPair),
        ]
        .into_iter()
        .map(|(m, s)| (m.to_string(), s))
        .collect();

        Self {
            default: Strategy::Single,
            methods,
            race_fanout: 2,
            retry_profile: RetryProfile::Standard,
            retry_max_attempts: None,
            consensus: ConsensusConfig::default(),
            dual_pair: DualPairConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Global cap on in-flight requests across every endpoint
    pub max_in_flight: usize,
    /// Global request budget; defaults to the sum of endpoint budgets
    pub global_rps: Option<u32>,
    pub shutdown_grace_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1024,
            global_rps: None,
            shutdown_grace_ms: 5_000,
        }
    }
}

/// Full configuration of the resilience layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShieldConfig {
    /// List of RPC endpoints
    pub endpoints: Vec<EndpointConfig>,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub hedging: HedgingConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub keep_alive: KeepAliveConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub strategy: StrategyConfig,

    #[serde(default)]
    pub limits: LimitsConfig,
}

impl ShieldConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &str) -> Result<Self, ConfigurationError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::single(format!("failed to read config file {}: {}", path, e))
        })?;

        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigurationError> {
        toml::from_str(contents)
            .map_err(|e| ConfigurationError::single(format!("failed to parse TOML: {}", e)))
    }

    /// Apply environment overrides on top of the loaded configuration
    ///
    /// `RPC_SHIELD_ENDPOINTS=url1,url2` replaces the endpoint list.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigurationError> {
        let mut violations = Vec::new();

        if let Ok(endpoints_str) = std::env::var("RPC_SHIELD_ENDPOINTS") {
            let urls: Vec<String> = endpoints_str
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();

            if urls.is_empty() {
                violations.push("RPC_SHIELD_ENDPOINTS is set but empty".to_string());
            } else {
                self.endpoints = urls.into_iter().map(EndpointConfig::new).collect();
            }
        }

        override_parsed(
            "RPC_SHIELD_QUEUE_DEADLINE_MS",
            &mut self.queue.deadline_ms,
            &mut violations,
        );
        override_parsed(
            "RPC_SHIELD_QUEUE_MAX_SIZE",
            &mut self.queue.max_size,
            &mut violations,
        );
        override_parsed(
            "RPC_SHIELD_BREAKER_ENABLED",
            &mut self.breaker.enabled,
            &mut violations,
        );
        override_parsed(
            "RPC_SHIELD_HEDGING_ENABLED",
            &mut self.hedging.enabled,
            &mut violations,
        );
        override_parsed(
            "RPC_SHIELD_CACHE_ENABLED",
            &mut self.cache.enabled,
            &mut violations,
        );
        if let Ok(namespace) = std::env::var("RPC_SHIELD_CACHE_NAMESPACE") {
            self.cache.namespace = namespace;
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigurationError { violations })
        }
    }

    /// Create a default configuration from a list of URLs
    pub fn from_urls(urls: &[String]) -> Self {
        Self {
            endpoints: urls.iter().map(EndpointConfig::new).collect(),
            breaker: BreakerConfig::default(),
            hedging: HedgingConfig::default(),
            queue: QueueConfig::default(),
            keep_alive: KeepAliveConfig::default(),
            health: HealthConfig::default(),
            cache: CacheConfig::default(),
            batch: BatchConfig::default(),
            strategy: StrategyConfig::default(),
            limits: LimitsConfig::default(),
        }
    }

    /// Effective global RPS budget
    pub fn global_rps(&self) -> u64 {
        self.limits
            .global_rps
            .map(u64::from)
            .unwrap_or_else(|| self.endpoints.iter().map(|e| u64::from(e.rps)).sum())
    }

    /// Validate configuration, collecting every violation
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let mut violations = Vec::new();

        if self.endpoints.is_empty() {
            violations.push("at least one RPC endpoint must be configured".to_string());
        }

        let mut seen_urls = HashSet::new();
        for endpoint in &self.endpoints {
            if !seen_urls.insert(&endpoint.url) {
                violations.push(format!("duplicate RPC URL: {}", endpoint.url));
            }
            if !endpoint.url.starts_with("http://") && !endpoint.url.starts_with("https://") {
                violations.push(format!("invalid URL format: {}", endpoint.url));
            }
            if endpoint.weight <= 0.0 || !endpoint.weight.is_finite() {
                violations.push(format!("invalid weight for {}: must be > 0", endpoint.url));
            }
            if endpoint.rps == 0 {
                violations.push(format!("invalid rps for {}: must be > 0", endpoint.url));
            }
            if endpoint.concurrency == 0 {
                violations.push(format!(
                    "invalid concurrency for {}: must be > 0",
                    endpoint.url
                ));
            }
            if endpoint.timeout_ms == 0 {
                violations.push(format!("invalid timeout for {}: must be > 0", endpoint.url));
            }
            if endpoint.timeout_ms >= self.queue.deadline_ms {
                violations.push(format!(
                    "request timeout of {} ({}ms) must be below the queue deadline ({}ms)",
                    endpoint.url, endpoint.timeout_ms, self.queue.deadline_ms
                ));
            }
            if self.health.probe_timeout_ms > endpoint.timeout_ms {
                violations.push(format!(
                    "health probe timeout ({}ms) must not exceed the request timeout of {} ({}ms)",
                    self.health.probe_timeout_ms, endpoint.url, endpoint.timeout_ms
                ));
            }
        }

        if self.health.probe_timeout_ms >= self.health.interval_ms {
            violations.push(format!(
                "health probe timeout ({}ms) must be below the health interval ({}ms)",
                self.health.probe_timeout_ms, self.health.interval_ms
            ));
        }
        if self.health.jitter_ms > self.health.interval_ms {
            violations.push(format!(
                "health jitter ({}ms) must not exceed the health interval ({}ms)",
                self.health.jitter_ms, self.health.interval_ms
            ));
        }
        if self.health.unhealthy_threshold == 0 {
            violations.push("health.unhealthy_threshold must be >= 1".to_string());
        }

        let estimated_in_flight: f64 = self
            .endpoints
            .iter()
            .map(|e| f64::from(e.rps) * e.timeout_ms as f64 / 1000.0)
            .sum();
        if estimated_in_flight > self.limits.max_in_flight as f64 {
            violations.push(format!(
                "estimated in-flight load ({:.0} = rps x timeout) exceeds limits.max_in_flight ({})",
                estimated_in_flight, self.limits.max_in_flight
            ));
        }
        if u64::from(self.health.probe_rps_limit) > self.global_rps() {
            violations.push(format!(
                "health probe rps ({}) exceeds the global rps budget ({})",
                self.health.probe_rps_limit,
                self.global_rps()
            ));
        }
        if self.health.probe_rps_limit == 0 {
            violations.push("health.probe_rps_limit must be > 0".to_string());
        }

        if self.breaker.failure_threshold == 0 {
            violations.push("breaker.failure_threshold must be >= 1".to_string());
        }
        if self.breaker.half_open_max_trials == 0 {
            violations.push("breaker.half_open_max_trials must be >= 1".to_string());
        }
        if self.breaker.cooldown_ms < self.health.probe_timeout_ms {
            violations.push(format!(
                "breaker cooldown ({}ms) must be at least the probe timeout ({}ms)",
                self.breaker.cooldown_ms, self.health.probe_timeout_ms
            ));
        }

        if self.queue.max_size == 0 {
            violations.push("queue.max_size must be > 0".to_string());
        }
        if self.queue.sweep_interval_ms == 0 {
            violations.push("queue.sweep_interval_ms must be > 0".to_string());
        }

        if self.hedging.enabled {
            if self.hedging.max_extra == 0 {
                violations.push("hedging.max_extra must be >= 1 when hedging is enabled".to_string());
            }
            if let Some(min_timeout) = self.endpoints.iter().map(|e| e.timeout_ms).min() {
                if self.hedging.delay_ms >= min_timeout {
                    violations.push(format!(
                        "hedging delay ({}ms) must be below the request timeout ({}ms)",
                        self.hedging.delay_ms, min_timeout
                    ));
                }
            }
        }

        if self.cache.hot_capacity == 0 || self.cache.main_capacity == 0 {
            violations.push("cache capacities must be > 0".to_string());
        }
        if self.cache.hot_capacity > self.cache.main_capacity {
            violations.push(format!(
                "cache.hot_capacity ({}) must not exceed cache.main_capacity ({})",
                self.cache.hot_capacity, self.cache.main_capacity
            ));
        }

        if self.batch.max_batch_size == 0 {
            violations.push("batch.max_batch_size must be > 0".to_string());
        }

        let consensus = &self.strategy.consensus;
        if consensus.min_consensus == 0 || consensus.min_consensus > consensus.fanout {
            violations.push(format!(
                "strategy.consensus.min_consensus ({}) must be within 1..={}",
                consensus.min_consensus, consensus.fanout
            ));
        }
        if self.strategy.race_fanout < 2 {
            violations.push("strategy.race_fanout must be >= 2".to_string());
        }
        if self.strategy.retry_max_attempts == Some(0) {
            violations.push("strategy.retry_max_attempts must be >= 1".to_string());
        }
        let alpha = self.strategy.dual_pair.stats_alpha;
        if !(alpha > 0.0 && alpha < 1.0) {
            violations.push("strategy.dual_pair.stats_alpha must be within (0, 1)".to_string());
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigurationError { violations })
        }
    }
}

fn override_parsed<T: std::str::FromStr>(var: &str, target: &mut T, violations: &mut Vec<String>)
where
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(var) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(e) => violations.push(format!("invalid {}: {}", var, e)),
        }
    }
}

//! Circuit breaker for webhook destinations.
//!
//! One breaker per destination (scheme, host and port of the webhook URL).
//! Each breaker keeps a count-based rolling window of recent outcomes and
//! opens when the failure rate in that window crosses the threshold. After
//! the open duration it lets a bounded number of probes through and closes
//! once they all succeed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - deliveries proceed.
    #[default]
    Closed,
    /// Circuit tripped - deliveries rejected immediately.
    Open,
    /// Testing recovery - allows a bounded number of probes.
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of most recent outcomes kept in the rolling window.
    pub window_size: usize,
    /// Outcomes required in the window before the failure rate is evaluated.
    pub minimum_calls: usize,
    /// Failure rate, in percent, at or above which the circuit opens.
    pub failure_rate_threshold: f64,
    /// Seconds to stay open before admitting probes.
    pub open_duration_secs: u64,
    /// Probes admitted while half-open; that many successes close the circuit.
    pub half_open_max_probes: u32,
    /// Maximum number of recent failures to keep for diagnostics.
    pub max_failure_history: usize,
    /// Closed breakers unused for this many seconds are dropped by
    /// [`CircuitBreakerRegistry::evict_idle`].
    pub idle_eviction_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            minimum_calls: 10,
            failure_rate_threshold: 50.0,
            open_duration_secs: 30,
            half_open_max_probes: 3,
            max_failure_history: 10,
            idle_eviction_secs: 3600,
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn with_window_size(mut self, size: usize) -> Self {
        self.window_size = size.max(1);
        self
    }

    #[must_use]
    pub fn with_minimum_calls(mut self, calls: usize) -> Self {
        self.minimum_calls = calls.max(1);
        self
    }

    #[must_use]
    pub fn with_failure_rate_threshold(mut self, percent: f64) -> Self {
        self.failure_rate_threshold = percent;
        self
    }

    #[must_use]
    pub fn with_open_duration(mut self, secs: u64) -> Self {
        self.open_duration_secs = secs;
        self
    }

    #[must_use]
    pub fn with_half_open_max_probes(mut self, probes: u32) -> Self {
        self.half_open_max_probes = probes.max(1);
        self
    }

    #[must_use]
    pub fn with_max_failure_history(mut self, size: usize) -> Self {
        self.max_failure_history = size;
        self
    }

    #[must_use]
    pub fn with_idle_eviction(mut self, secs: u64) -> Self {
        self.idle_eviction_secs = secs;
        self
    }
}

/// Record of a single delivery failure for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub error: String,
    /// HTTP response code if available.
    pub response_code: Option<u16>,
    pub latency_ms: Option<u64>,
}

impl FailureRecord {
    #[must_use]
    pub fn new(error: String, response_code: Option<u16>, latency_ms: Option<u64>) -> Self {
        Self {
            timestamp: Utc::now(),
            error,
            response_code,
            latency_ms,
        }
    }
}

/// Decision taken for one call.
///
/// The same value must be handed back when recording the outcome so probe
/// slots are released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal call while closed.
    Allowed,
    /// Recovery probe while half-open.
    Probe,
    /// Short-circuited; the transport must not be called.
    Rejected,
}

impl Admission {
    #[must_use]
    pub fn is_permitted(&self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

/// Circuit breaker for a single destination.
#[derive(Debug)]
pub struct CircuitBreaker {
    destination: String,
    config: CircuitBreakerConfig,
    state: CircuitState,
    /// `true` marks a failure.
    window: VecDeque<bool>,
    probes_in_flight: u32,
    probe_successes: u32,
    rejected_calls: u64,
    recent_failures: Vec<FailureRecord>,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    last_used_at: DateTime<Utc>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in the closed state.
    #[must_use]
    pub fn new(destination: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            destination: destination.into(),
            window: VecDeque::with_capacity(config.window_size),
            config,
            state: CircuitState::Closed,
            probes_in_flight: 0,
            probe_successes: 0,
            rejected_calls: 0,
            recent_failures: Vec::new(),
            last_failure_at: None,
            last_success_at: None,
            opened_at: None,
            last_used_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Outcomes currently in the rolling window.
    #[must_use]
    pub fn buffered_calls(&self) -> usize {
        self.window.len()
    }

    /// Failures currently in the rolling window.
    #[must_use]
    pub fn failed_calls(&self) -> usize {
        self.window.iter().filter(|failed| **failed).count()
    }

    /// Failure rate in percent, or `None` below the minimum call volume.
    #[must_use]
    pub fn failure_rate(&self) -> Option<f64> {
        let minimum = self.config.minimum_calls.min(self.config.window_size);
        if self.window.is_empty() || self.window.len() < minimum {
            return None;
        }
        Some(self.failed_calls() as f64 * 100.0 / self.window.len() as f64)
    }

    #[must_use]
    pub fn recent_failures(&self) -> &[FailureRecord] {
        &self.recent_failures
    }

    #[must_use]
    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        self.opened_at
    }

    /// Closed, with no probes running, and unused since `cutoff`.
    #[must_use]
    pub fn is_idle_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.state == CircuitState::Closed
            && self.probes_in_flight == 0
            && self.last_used_at <= cutoff
    }

    /// Decide whether a call may proceed.
    ///
    /// Moves an open circuit to half-open once the open duration has elapsed.
    pub fn try_acquire(&mut self) -> Admission {
        self.last_used_at = Utc::now();

        if self.state == CircuitState::Open {
            let elapsed_secs = self
                .opened_at
                .map_or(i64::MAX, |opened| {
                    Utc::now().signed_duration_since(opened).num_seconds()
                });
            if elapsed_secs < self.config.open_duration_secs as i64 {
                self.rejected_calls += 1;
                return Admission::Rejected;
            }

            self.state = CircuitState::HalfOpen;
            self.probes_in_flight = 0;
            self.probe_successes = 0;
            tracing::info!(
                target: "circuit_breaker",
                destination = %self.destination,
                "Circuit breaker transitioning to half-open for probes"
            );
        }

        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::HalfOpen if self.probes_in_flight < self.config.half_open_max_probes => {
                self.probes_in_flight += 1;
                Admission::Probe
            }
            _ => {
                self.rejected_calls += 1;
                Admission::Rejected
            }
        }
    }

    /// Record a successful call admitted with `admission`.
    pub fn record_success(&mut self, admission: Admission) {
        self.last_success_at = Some(Utc::now());

        match admission {
            Admission::Probe => {
                self.probes_in_flight = self.probes_in_flight.saturating_sub(1);
                if self.state != CircuitState::HalfOpen {
                    return;
                }
                self.probe_successes += 1;
                if self.probe_successes >= self.config.half_open_max_probes {
                    self.state = CircuitState::Closed;
                    self.window.clear();
                    self.recent_failures.clear();
                    self.opened_at = None;
                    self.probe_successes = 0;
                    tracing::info!(
                        target: "circuit_breaker",
                        destination = %self.destination,
                        "Circuit breaker closed after successful probes"
                    );
                }
            }
            Admission::Allowed => {
                // Results of calls admitted before the circuit opened do not
                // affect an open or half-open circuit.
                if self.state == CircuitState::Closed {
                    self.push_outcome(false);
                }
            }
            Admission::Rejected => {}
        }
    }

    /// Record a failed call admitted with `admission`.
    pub fn record_failure(&mut self, failure: FailureRecord, admission: Admission) {
        self.last_failure_at = Some(Utc::now());

        self.recent_failures.push(failure);
        if self.recent_failures.len() > self.config.max_failure_history {
            let excess = self.recent_failures.len() - self.config.max_failure_history;
            self.recent_failures.drain(..excess);
        }

        match admission {
            Admission::Probe => {
                self.probes_in_flight = self.probes_in_flight.saturating_sub(1);
                if self.state == CircuitState::HalfOpen {
                    self.open();
                    tracing::warn!(
                        target: "circuit_breaker",
                        destination = %self.destination,
                        "Circuit breaker reopened after failed probe"
                    );
                }
            }
            Admission::Allowed => {
                if self.state != CircuitState::Closed {
                    return;
                }
                self.push_outcome(true);
                if let Some(rate) = self.failure_rate() {
                    if rate >= self.config.failure_rate_threshold {
                        self.open();
                        tracing::warn!(
                            target: "circuit_breaker",
                            destination = %self.destination,
                            failure_rate = rate,
                            threshold = self.config.failure_rate_threshold,
                            window = self.window.len(),
                            "Circuit breaker opened due to failure rate"
                        );
                    }
                }
            }
            Admission::Rejected => {}
        }
    }

    fn push_outcome(&mut self, failed: bool) {
        self.window.push_back(failed);
        while self.window.len() > self.config.window_size {
            self.window.pop_front();
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Utc::now());
        self.probes_in_flight = 0;
        self.probe_successes = 0;
    }
}

/// Status snapshot of one breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub destination: String,
    pub state: CircuitState,
    pub failure_rate: Option<f64>,
    pub buffered_calls: usize,
    pub failed_calls: usize,
    pub rejected_calls: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub recent_failures: Vec<FailureRecord>,
}

impl From<&CircuitBreaker> for CircuitBreakerStatus {
    fn from(cb: &CircuitBreaker) -> Self {
        Self {
            destination: cb.destination.clone(),
            state: cb.state,
            failure_rate: cb.failure_rate(),
            buffered_calls: cb.buffered_calls(),
            failed_calls: cb.failed_calls(),
            rejected_calls: cb.rejected_calls,
            last_failure_at: cb.last_failure_at,
            last_success_at: cb.last_success_at,
            opened_at: cb.opened_at,
            recent_failures: cb.recent_failures.clone(),
        }
    }
}

/// Breaker key for a webhook URL: scheme, host and port.
///
/// Unparseable URLs key on the raw string.
#[must_use]
pub fn destination_key(webhook_url: &str) -> String {
    match url::Url::parse(webhook_url) {
        Ok(parsed) => match (parsed.host_str(), parsed.port_or_known_default()) {
            (Some(host), Some(port)) => format!("{}://{}:{}", parsed.scheme(), host, port),
            _ => webhook_url.to_string(),
        },
        Err(_) => webhook_url.to_string(),
    }
}

/// Registry of circuit breakers shared by all dispatches.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Decide whether a call to `destination` may proceed.
    pub async fn try_acquire(&self, destination: &str) -> Admission {
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(destination.to_string())
            .or_insert_with(|| CircuitBreaker::new(destination, self.config.clone()))
            .try_acquire()
    }

    pub async fn record_success(&self, destination: &str, admission: Admission) {
        let mut breakers = self.breakers.write().await;
        if let Some(cb) = breakers.get_mut(destination) {
            cb.record_success(admission);
        }
    }

    pub async fn record_failure(
        &self,
        destination: &str,
        failure: FailureRecord,
        admission: Admission,
    ) {
        let mut breakers = self.breakers.write().await;
        if let Some(cb) = breakers.get_mut(destination) {
            cb.record_failure(failure, admission);
        }
    }

    /// Status of one destination's breaker, if it has seen any traffic.
    pub async fn get_status(&self, destination: &str) -> Option<CircuitBreakerStatus> {
        let breakers = self.breakers.read().await;
        breakers.get(destination).map(CircuitBreakerStatus::from)
    }

    /// Status of every known breaker, ordered by destination.
    pub async fn get_all_status(&self) -> Vec<CircuitBreakerStatus> {
        let breakers = self.breakers.read().await;
        let mut statuses: Vec<_> = breakers.values().map(CircuitBreakerStatus::from).collect();
        statuses.sort_by(|a, b| a.destination.cmp(&b.destination));
        statuses
    }

    /// Drop closed breakers unused for `idle_eviction_secs`.
    ///
    /// Open and half-open breakers are kept. Returns how many were dropped.
    pub async fn evict_idle(&self) -> usize {
        let max_idle = chrono::Duration::seconds(
            i64::try_from(self.config.idle_eviction_secs).unwrap_or(i64::MAX),
        );
        let cutoff = Utc::now()
            .checked_sub_signed(max_idle)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut breakers = self.breakers.write().await;
        let before = breakers.len();
        breakers.retain(|_, cb| !cb.is_idle_since(cutoff));
        let evicted = before - breakers.len();

        if evicted > 0 {
            tracing::debug!(
                target: "circuit_breaker",
                evicted,
                remaining = breakers.len(),
                "Evicted idle circuit breakers"
            );
        }
        evicted
    }

    /// Forget a destination's breaker, closing it.
    pub async fn remove(&self, destination: &str) {
        let mut breakers = self.breakers.write().await;
        breakers.remove(destination);
    }

    pub async fn clear(&self) {
        let mut breakers = self.breakers.write().await;
        breakers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
            .with_window_size(4)
            .with_minimum_calls(4)
            .with_failure_rate_threshold(50.0)
            .with_half_open_max_probes(2)
    }

    fn failure() -> FailureRecord {
        FailureRecord::new("HTTP 500".to_string(), Some(500), Some(12))
    }

    #[test]
    fn test_config_default() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.window_size, 20);
        assert_eq!(config.minimum_calls, 10);
        assert_eq!(config.failure_rate_threshold, 50.0);
        assert_eq!(config.open_duration_secs, 30);
        assert_eq!(config.half_open_max_probes, 3);
        assert_eq!(config.idle_eviction_secs, 3600);
    }

    #[test]
    fn test_no_rate_below_minimum_calls() {
        let mut cb = CircuitBreaker::new("https://a:443", small_config());
        for _ in 0..3 {
            let admission = cb.try_acquire();
            cb.record_failure(failure(), admission);
        }
        assert_eq!(cb.failure_rate(), None);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_opens_at_failure_rate_threshold() {
        let mut cb = CircuitBreaker::new("https://a:443", small_config());
        for ok in [true, true, false] {
            let admission = cb.try_acquire();
            if ok {
                cb.record_success(admission);
            } else {
                cb.record_failure(failure(), admission);
            }
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        let admission = cb.try_acquire();
        cb.record_failure(failure(), admission);
        assert_eq!(cb.failure_rate(), Some(50.0));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.try_acquire(), Admission::Rejected);
    }

    #[test]
    fn test_window_rolls_old_outcomes_out() {
        let mut cb = CircuitBreaker::new("https://a:443", small_config().with_minimum_calls(1));
        let admission = cb.try_acquire();
        cb.record_failure(failure(), admission);
        assert_eq!(cb.state(), CircuitState::Open);

        let mut cb = CircuitBreaker::new(
            "https://a:443",
            small_config().with_failure_rate_threshold(75.0),
        );
        for _ in 0..4 {
            let admission = cb.try_acquire();
            cb.record_success(admission);
        }
        for _ in 0..2 {
            let admission = cb.try_acquire();
            cb.record_failure(failure(), admission);
        }
        assert_eq!(cb.buffered_calls(), 4);
        assert_eq!(cb.failed_calls(), 2);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_limits_probes_and_closes() {
        let mut cb = CircuitBreaker::new("https://a:443", small_config().with_open_duration(0));
        for _ in 0..4 {
            let admission = cb.try_acquire();
            cb.record_failure(failure(), admission);
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let first = cb.try_acquire();
        let second = cb.try_acquire();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(first, Admission::Probe);
        assert_eq!(second, Admission::Probe);
        assert_eq!(cb.try_acquire(), Admission::Rejected);

        cb.record_success(first);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success(second);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.buffered_calls(), 0);
        assert!(cb.opened_at().is_none());
    }

    #[test]
    fn test_failed_probe_reopens() {
        let mut cb = CircuitBreaker::new("https://a:443", small_config().with_open_duration(0));
        for _ in 0..4 {
            let admission = cb.try_acquire();
            cb.record_failure(failure(), admission);
        }
        let probe = cb.try_acquire();
        assert_eq!(probe, Admission::Probe);
        cb.record_failure(failure(), probe);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_stays_open_during_open_duration() {
        let mut cb = CircuitBreaker::new("https://a:443", small_config().with_open_duration(3600));
        for _ in 0..4 {
            let admission = cb.try_acquire();
            cb.record_failure(failure(), admission);
        }
        for _ in 0..5 {
            assert_eq!(cb.try_acquire(), Admission::Rejected);
        }
        let status = CircuitBreakerStatus::from(&cb);
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.rejected_calls, 5);
    }

    #[test]
    fn test_failure_history_is_bounded() {
        let mut cb = CircuitBreaker::new(
            "https://a:443",
            small_config()
                .with_failure_rate_threshold(101.0)
                .with_max_failure_history(3),
        );
        for _ in 0..6 {
            let admission = cb.try_acquire();
            cb.record_failure(failure(), admission);
        }
        assert_eq!(cb.recent_failures().len(), 3);
    }

    #[test]
    fn test_destination_key() {
        assert_eq!(
            destination_key("https://hooks.example.com/a/b?x=1"),
            "https://hooks.example.com:443"
        );
        assert_eq!(
            destination_key("http://hooks.example.com:8080/a"),
            "http://hooks.example.com:8080"
        );
        assert_eq!(
            destination_key("https://hooks.example.com/a"),
            destination_key("https://hooks.example.com/b")
        );
        assert_eq!(destination_key("not a url"), "not a url");
    }

    #[tokio::test]
    async fn test_registry_isolates_destinations() {
        let registry = CircuitBreakerRegistry::new(small_config().with_minimum_calls(1));

        let admission = registry.try_acquire("https://a:443").await;
        registry
            .record_failure("https://a:443", failure(), admission)
            .await;

        assert_eq!(
            registry.try_acquire("https://a:443").await,
            Admission::Rejected
        );
        assert_eq!(
            registry.try_acquire("https://b:443").await,
            Admission::Allowed
        );

        let all = registry.get_all_status().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].destination, "https://a:443");
        assert_eq!(all[0].state, CircuitState::Open);

        registry.remove("https://a:443").await;
        assert!(registry.get_status("https://a:443").await.is_none());
    }

    #[tokio::test]
    async fn test_evict_idle_drops_only_closed_breakers() {
        let registry = CircuitBreakerRegistry::new(
            small_config().with_minimum_calls(1).with_idle_eviction(0),
        );

        let admission = registry.try_acquire("https://healthy:443").await;
        registry.record_success("https://healthy:443", admission).await;

        let admission = registry.try_acquire("https://down:443").await;
        registry
            .record_failure("https://down:443", failure(), admission)
            .await;

        assert_eq!(registry.evict_idle().await, 1);
        assert!(registry.get_status("https://healthy:443").await.is_none());
        assert_eq!(
            registry.get_status("https://down:443").await.unwrap().state,
            CircuitState::Open
        );
    }

    #[tokio::test]
    async fn test_evict_idle_keeps_recently_used_breakers() {
        let registry = CircuitBreakerRegistry::new(small_config());
        registry.try_acquire("https://a:443").await;

        assert_eq!(registry.evict_idle().await, 0);
        assert!(registry.get_status("https://a:443").await.is_some());
    }
}

//! Worker configuration loaded from environment variables.
//!
//! Loading is fail-fast: required variables must be present and every set
//! variable must parse, or the worker exits with a clear error message.

use std::env;
use std::time::Duration;

use courier_webhooks::{CircuitBreakerConfig, RetrySchedulerConfig, WorkerConfig};
use thiserror::Error;

/// Length of the subscription secret encryption key in bytes.
const ENCRYPTION_KEY_LEN: usize = 32;

/// Configuration errors that can occur during environment loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },
}

/// Worker configuration.
#[derive(Clone)]
pub struct Config {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum pooled database connections
    pub database_max_connections: u32,

    /// AES-256-GCM key for subscription signing secrets
    pub webhook_encryption_key: [u8; ENCRYPTION_KEY_LEN],

    /// Tracing filter directive (e.g., "info,courier_webhooks=debug")
    pub rust_log: String,

    /// Concurrent delivery attempts
    pub dispatch_concurrency: usize,

    /// Dispatch queue bound
    pub dispatch_queue_capacity: usize,

    /// Per-attempt timeout
    pub dispatch_timeout: Duration,

    /// Longest pause between retry sweeps
    pub retry_sweep_interval: Duration,

    /// Events claimed per sweep
    pub retry_sweep_batch_size: usize,

    /// How long a claimed event is hidden from other sweepers
    pub retry_claim_lease: Duration,

    pub circuit_breaker: CircuitBreakerConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &"[REDACTED]")
            .field("database_max_connections", &self.database_max_connections)
            .field("webhook_encryption_key", &"[REDACTED]")
            .field("rust_log", &self.rust_log)
            .field("dispatch_concurrency", &self.dispatch_concurrency)
            .field("dispatch_queue_capacity", &self.dispatch_queue_capacity)
            .field("dispatch_timeout", &self.dispatch_timeout)
            .field("retry_sweep_interval", &self.retry_sweep_interval)
            .field("retry_sweep_batch_size", &self.retry_sweep_batch_size)
            .field("retry_claim_lease", &self.retry_claim_lease)
            .field("circuit_breaker", &self.circuit_breaker)
            .finish()
    }
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `DATABASE_URL` or `WEBHOOK_ENCRYPTION_KEY` is missing
    /// - `WEBHOOK_ENCRYPTION_KEY` is not 64 hex characters
    /// - any numeric variable is set but does not parse
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value
    /// if it is set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = required(&lookup, "DATABASE_URL")?;
        let webhook_encryption_key = parse_hex_encryption_key(
            "WEBHOOK_ENCRYPTION_KEY",
            &required(&lookup, "WEBHOOK_ENCRYPTION_KEY")?,
        )?;

        let rust_log = lookup("RUST_LOG")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "info".to_string());

        let breaker_defaults = CircuitBreakerConfig::default();
        let circuit_breaker = CircuitBreakerConfig::default()
            .with_window_size(parse_or(
                &lookup,
                "CIRCUIT_BREAKER_WINDOW_SIZE",
                breaker_defaults.window_size,
            )?)
            .with_minimum_calls(parse_or(
                &lookup,
                "CIRCUIT_BREAKER_MINIMUM_CALLS",
                breaker_defaults.minimum_calls,
            )?)
            .with_failure_rate_threshold(parse_failure_rate(&lookup, breaker_defaults.failure_rate_threshold)?)
            .with_open_duration(parse_or(
                &lookup,
                "CIRCUIT_BREAKER_OPEN_SECS",
                breaker_defaults.open_duration_secs,
            )?)
            .with_half_open_max_probes(parse_or(
                &lookup,
                "CIRCUIT_BREAKER_HALF_OPEN_PROBES",
                breaker_defaults.half_open_max_probes,
            )?)
            .with_idle_eviction(parse_or(
                &lookup,
                "CIRCUIT_BREAKER_IDLE_EVICTION_SECS",
                breaker_defaults.idle_eviction_secs,
            )?);

        Ok(Self {
            database_url,
            database_max_connections: parse_or(
                &lookup,
                "DATABASE_MAX_CONNECTIONS",
                courier_db::DEFAULT_MAX_CONNECTIONS,
            )?
            .max(1),
            webhook_encryption_key,
            rust_log,
            dispatch_concurrency: parse_or(
                &lookup,
                "DISPATCH_CONCURRENCY",
                courier_webhooks::worker::DEFAULT_CONCURRENCY,
            )?
            .max(1),
            dispatch_queue_capacity: parse_or(
                &lookup,
                "DISPATCH_QUEUE_CAPACITY",
                courier_webhooks::worker::DEFAULT_QUEUE_CAPACITY,
            )?
            .max(1),
            dispatch_timeout: Duration::from_secs(
                parse_or(&lookup, "DISPATCH_TIMEOUT_SECS", 30u64)?.max(1),
            ),
            retry_sweep_interval: Duration::from_secs(
                parse_or(&lookup, "RETRY_SWEEP_INTERVAL_SECS", 5u64)?.max(1),
            ),
            retry_sweep_batch_size: parse_or(&lookup, "RETRY_SWEEP_BATCH_SIZE", 100usize)?.max(1),
            retry_claim_lease: Duration::from_secs(
                parse_or(&lookup, "RETRY_CLAIM_LEASE_SECS", 300u64)?.max(1),
            ),
            circuit_breaker,
        })
    }

    #[must_use]
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default().with_concurrency(self.dispatch_concurrency)
    }

    #[must_use]
    pub fn retry_scheduler_config(&self) -> RetrySchedulerConfig {
        RetrySchedulerConfig::default()
            .with_sweep_interval(self.retry_sweep_interval)
            .with_batch_size(self.retry_sweep_batch_size)
    }
}

fn required<F>(lookup: &F, var: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingVar(var.to_string()))
}

fn parse_or<F, T>(lookup: &F, var: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                var: var.to_string(),
                message: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

fn parse_failure_rate<F>(lookup: &F, default: f64) -> Result<f64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let rate = parse_or(lookup, "CIRCUIT_BREAKER_FAILURE_RATE", default)?;
    if !(rate > 0.0 && rate <= 100.0) {
        return Err(ConfigError::InvalidValue {
            var: "CIRCUIT_BREAKER_FAILURE_RATE".to_string(),
            message: format!("Must be a percentage in (0, 100], got {rate}"),
        });
    }
    Ok(rate)
}

/// Parse hex-encoded 32-byte encryption key
fn parse_hex_encryption_key(
    var_name: &str,
    hex_str: &str,
) -> Result<[u8; ENCRYPTION_KEY_LEN], ConfigError> {
    let bytes = hex::decode(hex_str.trim()).map_err(|_| ConfigError::InvalidValue {
        var: var_name.to_string(),
        message: "Must be 64 hex characters (32 bytes)".to_string(),
    })?;

    if bytes.len() != ENCRYPTION_KEY_LEN {
        return Err(ConfigError::InvalidValue {
            var: var_name.to_string(),
            message: format!("Expected 32 bytes, got {}", bytes.len()),
        });
    }

    let mut key = [0u8; ENCRYPTION_KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

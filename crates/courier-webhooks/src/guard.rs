//! Circuit breaker guard around the outbound transport.
//!
//! The dispatcher calls the guard, the guard consults the destination's
//! breaker, applies the per-attempt timeout and calls the transport. Every
//! outcome, including a short-circuit, comes back as an [`AttemptOutcome`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::circuit_breaker::{destination_key, CircuitBreakerRegistry, FailureRecord};
use crate::error::DeliveryError;
use crate::ports::{WebhookHeaders, WebhookTransport};

/// Default per-attempt timeout.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Message recorded when the breaker short-circuits an attempt.
pub const BREAKER_OPEN_MESSAGE: &str = "circuit breaker open";

/// Result of one guarded attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The destination answered 2xx.
    Delivered { status_code: u16 },
    /// Non-2xx, transport error, timeout or short-circuit.
    Failed {
        message: String,
        status_code: Option<u16>,
        /// True when the circuit breaker rejected the attempt.
        short_circuited: bool,
    },
}

/// Composes breaker, timeout and transport.
#[derive(Clone)]
pub struct CircuitBreakerGuard {
    registry: CircuitBreakerRegistry,
    transport: Arc<dyn WebhookTransport>,
    attempt_timeout: Duration,
}

impl CircuitBreakerGuard {
    pub fn new(registry: CircuitBreakerRegistry, transport: Arc<dyn WebhookTransport>) -> Self {
        Self {
            registry,
            transport,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &CircuitBreakerRegistry {
        &self.registry
    }

    /// Perform one attempt against `url`.
    pub async fn call(&self, url: &str, payload: &[u8], headers: &WebhookHeaders) -> AttemptOutcome {
        let destination = destination_key(url);
        let admission = self.registry.try_acquire(&destination).await;

        if !admission.is_permitted() {
            tracing::warn!(
                target: "circuit_breaker",
                destination = %destination,
                event_id = %headers.event_id,
                "Attempt short-circuited by open circuit breaker"
            );
            return AttemptOutcome::Failed {
                message: DeliveryError::BreakerOpen.to_string(),
                status_code: None,
                short_circuited: true,
            };
        }

        let started = Instant::now();
        let result =
            tokio::time::timeout(self.attempt_timeout, self.transport.post(url, payload, headers))
                .await;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (message, status_code) = match result {
            Ok(Ok(response)) if response.success => {
                self.registry.record_success(&destination, admission).await;
                return AttemptOutcome::Delivered {
                    status_code: response.status_code,
                };
            }
            Ok(Ok(response)) => (
                response
                    .error_message
                    .unwrap_or_else(|| format!("HTTP {}", response.status_code)),
                Some(response.status_code),
            ),
            Ok(Err(e)) => (e.to_string(), None),
            Err(_) => (
                format!("Request timeout after {}s", self.attempt_timeout.as_secs()),
                None,
            ),
        };

        self.registry
            .record_failure(
                &destination,
                FailureRecord::new(message.clone(), status_code, Some(latency_ms)),
                admission,
            )
            .await;

        AttemptOutcome::Failed {
            message,
            status_code,
            short_circuited: false,
        }
    }
}

//! Webhook delivery execution service.
//!
//! Runs one delivery attempt for an event: load, sign, call the destination
//! through the circuit breaker guard, apply the state transition, persist it
//! and hand retryable failures to the retry scheduler.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use courier_core::EventId;
use tracing::{field, instrument, Span};

use crate::crypto;
use crate::error::DeliveryError;
use crate::guard::{AttemptOutcome, CircuitBreakerGuard};
use crate::in_flight::InFlightRegistry;
use crate::models::{DeliveryStatus, NotificationEvent, SigningSecret};
use crate::ports::{EventRepository, SubscriptionRepository, WebhookHeaders};
use crate::services::retry_scheduler::RetryScheduler;

/// Result of a `dispatch` call that reached the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered {
        response_code: u16,
    },
    /// The attempt failed and a retry was scheduled.
    Retrying {
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// The attempt failed and the budget is exhausted.
    Failed {
        attempts: u32,
    },
    /// The event was already terminal; nothing was sent or written.
    Skipped {
        status: DeliveryStatus,
    },
    /// The event's backoff has not elapsed; nothing was sent or written.
    NotDue {
        next_attempt_at: Option<DateTime<Utc>>,
    },
}

/// Service for webhook delivery attempts.
#[derive(Clone)]
pub struct DeliveryService {
    events: Arc<dyn EventRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    guard: CircuitBreakerGuard,
    scheduler: Arc<dyn RetryScheduler>,
    in_flight: InFlightRegistry,
}

impl DeliveryService {
    pub fn new(
        events: Arc<dyn EventRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        guard: CircuitBreakerGuard,
        scheduler: Arc<dyn RetryScheduler>,
    ) -> Self {
        Self {
            events,
            subscriptions,
            guard,
            scheduler,
            in_flight: InFlightRegistry::new(),
        }
    }

    /// Events with an attempt running in this service.
    #[must_use]
    pub fn in_flight(&self) -> &InFlightRegistry {
        &self.in_flight
    }

    #[must_use]
    pub fn guard(&self) -> &CircuitBreakerGuard {
        &self.guard
    }

    /// Perform one delivery attempt for `event_id`.
    ///
    /// The event is leased through [`EventRepository::claim_for_dispatch`]
    /// first, so an attempt only runs when the event is due and no other
    /// dispatcher holds it. Terminal events come back as `Skipped`, events
    /// still inside their backoff as `NotDue`.
    ///
    /// Attempt faults (non-2xx, transport errors, timeouts, open breaker,
    /// signing faults) become state transitions and come back as `Ok`. Errors
    /// are returned only when no attempt could be made: another attempt for
    /// the id is running, the event is missing, the signing secret cannot be
    /// resolved, or storage failed. A lease taken before such an error is
    /// kept until it expires, which spaces out repeated attempts.
    #[instrument(
        name = "dispatch",
        skip_all,
        fields(event_id = %event_id, client_id = field::Empty, event_type = field::Empty)
    )]
    pub async fn dispatch(&self, event_id: EventId) -> Result<DispatchOutcome, DeliveryError> {
        let Some(_claim) = self.in_flight.try_claim(event_id) else {
            tracing::debug!(
                target: "webhook_delivery",
                "Another attempt for this event is in flight"
            );
            return Err(DeliveryError::AlreadyInFlight);
        };

        let now = Utc::now();
        let claimed = match self.events.claim_for_dispatch(event_id, now).await {
            Ok(claimed) => claimed,
            Err(e) => {
                tracing::error!(
                    target: "webhook_delivery",
                    error = %e,
                    "Failed to claim notification event"
                );
                return Err(e);
            }
        };

        let mut event = match claimed {
            Some(event) => event,
            None => return self.unclaimable(event_id, now).await,
        };

        let span = Span::current();
        span.record("client_id", event.client_id());
        span.record("event_type", event.event_type());

        let secret = self.resolve_secret(&event).await?;
        let attempt = event.delivery_attempts() + 1;

        match self.attempt(&event, &secret).await {
            AttemptOutcome::Delivered { status_code } => {
                event.mark_as_delivered(status_code);
            }
            AttemptOutcome::Failed {
                message,
                status_code,
                short_circuited,
            } => {
                tracing::warn!(
                    target: "webhook_delivery",
                    attempt,
                    response_code = status_code,
                    short_circuited,
                    error = %message,
                    "Delivery attempt failed"
                );
                event.mark_as_failed(message, status_code);
            }
        }

        let saved = match self.events.save(&event).await {
            Ok(saved) => saved,
            Err(e) => {
                // The stored row still holds the previous state and the lease,
                // so the sweep retries once the lease expires and the
                // idempotency key lets the receiver dedupe.
                tracing::error!(
                    target: "webhook_delivery",
                    attempt,
                    error = %e,
                    "Failed to persist attempt outcome"
                );
                return Err(e);
            }
        };

        Ok(self.conclude(&saved).await)
    }

    /// Explain why `event_id` could not be claimed.
    async fn unclaimable(
        &self,
        event_id: EventId,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DeliveryError> {
        let event = match self.events.find_by_id(event_id).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                tracing::warn!(target: "webhook_delivery", "Notification event not found");
                return Err(DeliveryError::NotFound);
            }
            Err(e) => {
                tracing::error!(
                    target: "webhook_delivery",
                    error = %e,
                    "Failed to load notification event"
                );
                return Err(e);
            }
        };

        let span = Span::current();
        span.record("client_id", event.client_id());
        span.record("event_type", event.event_type());

        let status = event.delivery_status();
        if status.is_terminal() {
            tracing::debug!(
                target: "webhook_delivery",
                status = %status,
                "Event is terminal, skipping attempt"
            );
            return Ok(DispatchOutcome::Skipped { status });
        }

        let next_attempt_at = event.next_attempt_at();
        if next_attempt_at.map_or(true, |due| due > now) {
            tracing::debug!(
                target: "webhook_delivery",
                next_attempt_at = ?next_attempt_at,
                "Event is not due yet, skipping attempt"
            );
            return Ok(DispatchOutcome::NotDue { next_attempt_at });
        }

        tracing::debug!(
            target: "webhook_delivery",
            "Event is leased by another dispatcher"
        );
        Err(DeliveryError::AlreadyInFlight)
    }

    async fn resolve_secret(&self, event: &NotificationEvent) -> Result<SigningSecret, DeliveryError> {
        let result = match self
            .subscriptions
            .find_active(event.client_id(), event.event_type())
            .await
        {
            Ok(Some(subscription)) if subscription.secret.is_empty() => {
                Err(DeliveryError::SigningConfiguration(format!(
                    "Subscription {} has an empty signing secret",
                    subscription.id
                )))
            }
            Ok(Some(subscription)) => Ok(subscription.secret),
            Ok(None) => Err(DeliveryError::SigningConfiguration(
                "No active subscription provides a signing secret".to_string(),
            )),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            tracing::error!(
                target: "webhook_delivery",
                error = %e,
                "Cannot resolve signing secret, event left untouched"
            );
        }
        result
    }

    async fn attempt(&self, event: &NotificationEvent, secret: &SigningSecret) -> AttemptOutcome {
        let payload = event.event_data().as_bytes();

        let signature = match crypto::sign_payload(secret.expose(), payload) {
            Ok(signature) => signature,
            Err(e) => {
                return AttemptOutcome::Failed {
                    message: e.to_string(),
                    status_code: None,
                    short_circuited: false,
                }
            }
        };

        let headers = WebhookHeaders::for_event(event, signature, Utc::now());
        self.guard.call(event.webhook_url(), payload, &headers).await
    }

    async fn conclude(&self, event: &NotificationEvent) -> DispatchOutcome {
        let attempts = event.delivery_attempts();

        match event.delivery_status() {
            DeliveryStatus::Delivered => {
                let response_code = event.response_code().unwrap_or_default();
                tracing::info!(
                    target: "webhook_delivery",
                    response_code,
                    attempts,
                    "Webhook delivered"
                );
                DispatchOutcome::Delivered { response_code }
            }
            DeliveryStatus::Failed => {
                tracing::error!(
                    target: "webhook_delivery",
                    attempts,
                    error = event.error_message().unwrap_or_default(),
                    "{}",
                    DeliveryError::PermanentFailure { attempts }
                );
                DispatchOutcome::Failed { attempts }
            }
            DeliveryStatus::Pending | DeliveryStatus::Retrying => {
                let delay = event.next_retry_delay();
                self.scheduler.schedule_retry(event.id(), delay).await;

                let next_attempt_at = event.next_attempt_at().unwrap_or_else(Utc::now);
                tracing::info!(
                    target: "webhook_delivery",
                    attempts,
                    retry_in_secs = delay.as_secs(),
                    next_attempt_at = %next_attempt_at,
                    "Delivery retry scheduled"
                );
                DispatchOutcome::Retrying {
                    attempts,
                    next_attempt_at,
                }
            }
        }
    }
}

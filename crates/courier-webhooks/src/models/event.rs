//! Notification event and its delivery state machine.
//!
//! The state machine is pure: every transition takes the current time from
//! the caller (or `Utc::now()`) and never touches storage.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_core::EventId;
use serde::{Deserialize, Serialize};

/// Failed attempts after which an event is terminally `FAILED`.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 7;

/// Retry backoff schedule in seconds, indexed by attempt count.
pub const RETRY_DELAYS_SECS: [u64; 6] = [60, 300, 900, 3_600, 14_400, 43_200];

/// Backoff delay for a given attempt count.
///
/// Counts past the end of the table clamp to the last entry. No jitter.
#[must_use]
pub fn next_retry_delay(attempts: u32) -> Duration {
    let idx = (attempts as usize).min(RETRY_DELAYS_SECS.len() - 1);
    Duration::from_secs(RETRY_DELAYS_SECS[idx])
}

/// Delivery lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Retrying,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    /// Storage representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Retrying => "RETRYING",
            Self::Delivered => "DELIVERED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RETRYING" => Some(Self::Retrying),
            "DELIVERED" => Some(Self::Delivered),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// `DELIVERED` and `FAILED` admit no further automatic attempts.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every field of a [`NotificationEvent`], used to rebuild one from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEventParts {
    pub id: EventId,
    pub client_id: String,
    pub event_type: String,
    pub event_data: String,
    pub webhook_url: String,
    pub created_at: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
    pub delivery_attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub response_code: Option<u16>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// A single notification owed to a client's webhook endpoint.
///
/// Identity fields are immutable; delivery fields change only through the
/// transition methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    id: EventId,
    client_id: String,
    event_type: String,
    event_data: String,
    webhook_url: String,
    created_at: DateTime<Utc>,
    delivery_status: DeliveryStatus,
    delivery_attempts: u32,
    last_attempt_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    response_code: Option<u16>,
    next_attempt_at: Option<DateTime<Utc>>,
}

impl NotificationEvent {
    /// Create a `PENDING` event that is immediately due.
    pub fn new(
        client_id: impl Into<String>,
        event_type: impl Into<String>,
        event_data: impl Into<String>,
        webhook_url: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: EventId::new(),
            client_id: client_id.into(),
            event_type: event_type.into(),
            event_data: event_data.into(),
            webhook_url: webhook_url.into(),
            created_at: now,
            delivery_status: DeliveryStatus::Pending,
            delivery_attempts: 0,
            last_attempt_at: None,
            delivered_at: None,
            error_message: None,
            response_code: None,
            next_attempt_at: Some(now),
        }
    }

    /// Rebuild an event from persisted fields.
    #[must_use]
    pub fn from_parts(parts: NotificationEventParts) -> Self {
        Self {
            id: parts.id,
            client_id: parts.client_id,
            event_type: parts.event_type,
            event_data: parts.event_data,
            webhook_url: parts.webhook_url,
            created_at: parts.created_at,
            delivery_status: parts.delivery_status,
            delivery_attempts: parts.delivery_attempts,
            last_attempt_at: parts.last_attempt_at,
            delivered_at: parts.delivered_at,
            error_message: parts.error_message,
            response_code: parts.response_code,
            next_attempt_at: parts.next_attempt_at,
        }
    }

    /// Copy every field out for persistence.
    #[must_use]
    pub fn to_parts(&self) -> NotificationEventParts {
        NotificationEventParts {
            id: self.id,
            client_id: self.client_id.clone(),
            event_type: self.event_type.clone(),
            event_data: self.event_data.clone(),
            webhook_url: self.webhook_url.clone(),
            created_at: self.created_at,
            delivery_status: self.delivery_status,
            delivery_attempts: self.delivery_attempts,
            last_attempt_at: self.last_attempt_at,
            delivered_at: self.delivered_at,
            error_message: self.error_message.clone(),
            response_code: self.response_code,
            next_attempt_at: self.next_attempt_at,
        }
    }

    #[must_use]
    pub fn id(&self) -> EventId {
        self.id
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Opaque payload, sent verbatim as the request body.
    #[must_use]
    pub fn event_data(&self) -> &str {
        &self.event_data
    }

    #[must_use]
    pub fn webhook_url(&self) -> &str {
        &self.webhook_url
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn delivery_status(&self) -> DeliveryStatus {
        self.delivery_status
    }

    #[must_use]
    pub fn delivery_attempts(&self) -> u32 {
        self.delivery_attempts
    }

    #[must_use]
    pub fn last_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.last_attempt_at
    }

    #[must_use]
    pub fn delivered_at(&self) -> Option<DateTime<Utc>> {
        self.delivered_at
    }

    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    #[must_use]
    pub fn response_code(&self) -> Option<u16> {
        self.response_code
    }

    /// When the retry sweep may pick this event up. `None` once terminal.
    #[must_use]
    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.next_attempt_at
    }

    /// Record a 2xx response. Attempts are left unchanged.
    pub fn mark_as_delivered(&mut self, response_code: u16) {
        self.mark_as_delivered_at(response_code, Utc::now());
    }

    fn mark_as_delivered_at(&mut self, response_code: u16, now: DateTime<Utc>) {
        self.delivery_status = DeliveryStatus::Delivered;
        self.delivered_at = Some(now);
        self.response_code = Some(response_code);
        self.error_message = None;
        self.next_attempt_at = None;
    }

    /// Record a failed attempt.
    ///
    /// The event becomes `FAILED` once attempts reach
    /// [`MAX_DELIVERY_ATTEMPTS`], otherwise `RETRYING` with the next attempt
    /// due after the backoff delay for the new attempt count.
    pub fn mark_as_failed(&mut self, error_message: impl Into<String>, response_code: Option<u16>) {
        self.mark_as_failed_at(error_message.into(), response_code, Utc::now());
    }

    fn mark_as_failed_at(
        &mut self,
        error_message: String,
        response_code: Option<u16>,
        now: DateTime<Utc>,
    ) {
        self.delivery_attempts += 1;
        self.last_attempt_at = Some(now);
        self.error_message = Some(error_message);
        self.response_code = response_code;

        if self.delivery_attempts >= MAX_DELIVERY_ATTEMPTS {
            self.delivery_status = DeliveryStatus::Failed;
            self.next_attempt_at = None;
        } else {
            self.delivery_status = DeliveryStatus::Retrying;
            self.next_attempt_at = chrono::Duration::from_std(self.next_retry_delay())
                .ok()
                .map(|delay| now + delay);
        }
    }

    /// Whether another automatic attempt is allowed.
    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.delivery_attempts < MAX_DELIVERY_ATTEMPTS
            && self.delivery_status != DeliveryStatus::Delivered
    }

    /// Backoff delay for the current attempt count.
    #[must_use]
    pub fn next_retry_delay(&self) -> Duration {
        next_retry_delay(self.delivery_attempts)
    }

    /// Return the event to `PENDING` with a fresh attempt budget, due now.
    pub fn reset_for_replay(&mut self) {
        self.reset_for_replay_at(Utc::now());
    }

    fn reset_for_replay_at(&mut self, now: DateTime<Utc>) {
        self.delivery_status = DeliveryStatus::Pending;
        self.delivery_attempts = 0;
        self.last_attempt_at = None;
        self.delivered_at = None;
        self.error_message = None;
        self.response_code = None;
        self.next_attempt_at = Some(now);
    }
}

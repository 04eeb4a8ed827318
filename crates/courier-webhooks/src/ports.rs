//! Capability traits the engine depends on, plus the outbound header set.
//!
//! Each port has one production implementation and one in-memory double
//! (see [`crate::memory`]).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::EventId;

use crate::error::DeliveryError;
use crate::models::{EventFilter, NotificationEvent, Page, PageRequest, WebhookSubscription};

pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_SIGNATURE: &str = "X-Webhook-Signature";
pub const HEADER_EVENT_TYPE: &str = "X-Event-Type";
pub const HEADER_EVENT_ID: &str = "X-Event-Id";
pub const HEADER_IDEMPOTENCY_KEY: &str = "X-Idempotency-Key";
pub const HEADER_TIMESTAMP: &str = "X-Timestamp";

/// How long a dispatcher holds an event it claimed.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(300);

/// Response bodies are cut to this many characters before being kept.
pub const MAX_RESPONSE_BODY_CHARS: usize = 4096;

/// Headers attached to every delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookHeaders {
    pub content_type: String,
    pub signature: String,
    pub event_type: String,
    pub event_id: String,
    /// Always the event id, so receivers can discard repeated attempts.
    pub idempotency_key: String,
    /// Epoch milliseconds of the attempt.
    pub timestamp: String,
}

impl WebhookHeaders {
    /// Build the header set for one attempt of `event`.
    #[must_use]
    pub fn for_event(event: &NotificationEvent, signature: String, sent_at: DateTime<Utc>) -> Self {
        let id = event.id().to_string();
        Self {
            content_type: "application/json".to_string(),
            signature,
            event_type: event.event_type().to_string(),
            event_id: id.clone(),
            idempotency_key: id,
            timestamp: sent_at.timestamp_millis().to_string(),
        }
    }

    /// Header name/value pairs in wire order.
    #[must_use]
    pub fn to_pairs(&self) -> [(&'static str, &str); 6] {
        [
            (HEADER_CONTENT_TYPE, self.content_type.as_str()),
            (HEADER_SIGNATURE, self.signature.as_str()),
            (HEADER_EVENT_TYPE, self.event_type.as_str()),
            (HEADER_EVENT_ID, self.event_id.as_str()),
            (HEADER_IDEMPOTENCY_KEY, self.idempotency_key.as_str()),
            (HEADER_TIMESTAMP, self.timestamp.as_str()),
        ]
    }
}

/// Result of one HTTP POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status_code: u16,
    pub body: Option<String>,
    pub error_message: Option<String>,
    /// True iff the status is 2xx.
    pub success: bool,
}

impl WebhookResponse {
    /// Interpret a status code and body received from the destination.
    #[must_use]
    pub fn from_status(status_code: u16, body: Option<String>) -> Self {
        let success = (200..300).contains(&status_code);
        let body = body.map(|b| truncate_chars(&b, MAX_RESPONSE_BODY_CHARS));
        let error_message = if success {
            None
        } else {
            Some(format!("HTTP {status_code}"))
        };
        Self {
            status_code,
            body,
            error_message,
            success,
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Persistence of notification events.
///
/// `save` is an idempotent upsert keyed by id. It also releases the
/// dispatch lease taken by [`EventRepository::claim_for_dispatch`].
#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn save(&self, event: &NotificationEvent) -> Result<NotificationEvent, DeliveryError>;

    /// Lease `id` to the caller for one delivery attempt.
    ///
    /// Returns the event only if it is `PENDING` or `RETRYING`, its
    /// `next_attempt_at` is at or before `now`, and no other dispatcher
    /// holds an unexpired lease on it. Otherwise `None`. The lease lasts
    /// until the next `save` of the event or until it expires.
    async fn claim_for_dispatch(
        &self,
        id: EventId,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationEvent>, DeliveryError>;

    async fn find_by_id(&self, id: EventId) -> Result<Option<NotificationEvent>, DeliveryError>;

    async fn find_by_id_and_owner(
        &self,
        id: EventId,
        client_id: &str,
    ) -> Result<Option<NotificationEvent>, DeliveryError>;

    /// `PENDING` or `RETRYING` events with `next_attempt_at <= threshold`
    /// and no unexpired dispatch lease, oldest due first, at most `limit` of
    /// them. Read only.
    async fn find_due_for_retry(
        &self,
        threshold: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationEvent>, DeliveryError>;

    /// A client's events, newest first.
    async fn find_by_owner(
        &self,
        client_id: &str,
        filter: &EventFilter,
        page: PageRequest,
    ) -> Result<Page<NotificationEvent>, DeliveryError>;
}

/// Lookup of the subscription that routes an event.
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn find_active(
        &self,
        client_id: &str,
        event_type: &str,
    ) -> Result<Option<WebhookSubscription>, DeliveryError>;
}

/// One outbound HTTP POST. Implementations never retry.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        payload: &[u8],
        headers: &WebhookHeaders,
    ) -> Result<WebhookResponse, DeliveryError>;
}

//! Query filters, pagination and the read projection of an event.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::event::{DeliveryStatus, NotificationEvent};

/// Largest page a caller may request.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Page size used when none is given.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Optional filters for listing a client's events.
///
/// Date bounds are inclusive and apply to `created_at`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_date_from: Option<DateTime<Utc>>,
    pub event_date_to: Option<DateTime<Utc>>,
    pub delivery_status: Option<DeliveryStatus>,
}

impl EventFilter {
    #[must_use]
    pub fn with_status(mut self, status: DeliveryStatus) -> Self {
        self.delivery_status = Some(status);
        self
    }

    #[must_use]
    pub fn with_date_range(
        mut self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Self {
        self.event_date_from = from;
        self.event_date_to = to;
        self
    }

    /// Whether the event passes every filter that is set.
    #[must_use]
    pub fn matches(&self, event: &NotificationEvent) -> bool {
        let created = event.created_at();
        self.event_date_from.map_or(true, |from| created >= from)
            && self.event_date_to.map_or(true, |to| created <= to)
            && self
                .delivery_status
                .map_or(true, |status| event.delivery_status() == status)
    }
}

/// Zero-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    page: u32,
    size: u32,
}

impl PageRequest {
    /// Build a page request, clamping `size` to `1..=MAX_PAGE_SIZE`.
    #[must_use]
    pub fn new(page: u32, size: u32) -> Self {
        Self {
            page,
            size: size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    #[must_use]
    pub fn page(&self) -> u32 {
        self.page
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Number of rows to skip.
    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.page) * u64::from(self.size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(0, DEFAULT_PAGE_SIZE)
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub size: u32,
    pub total: u64,
}

impl<T> Page<T> {
    #[must_use]
    pub fn new(items: Vec<T>, request: PageRequest, total: u64) -> Self {
        Self {
            items,
            page: request.page(),
            size: request.size(),
            total,
        }
    }

    /// Whether rows exist beyond this page.
    #[must_use]
    pub fn has_more(&self) -> bool {
        (u64::from(self.page) + 1) * u64::from(self.size) < self.total
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            page: self.page,
            size: self.size,
            total: self.total,
        }
    }
}

/// Read projection of an event returned by the query and replay operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEventResponse {
    pub id: String,
    pub client_id: String,
    pub event_type: String,
    pub event_data: String,
    pub webhook_url: String,
    pub created_at: String,
    pub delivery_status: DeliveryStatus,
    pub delivery_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl From<&NotificationEvent> for NotificationEventResponse {
    fn from(event: &NotificationEvent) -> Self {
        Self {
            id: event.id().to_string(),
            client_id: event.client_id().to_string(),
            event_type: event.event_type().to_string(),
            event_data: event.event_data().to_string(),
            webhook_url: event.webhook_url().to_string(),
            created_at: format_timestamp(event.created_at()),
            delivery_status: event.delivery_status(),
            delivery_attempts: event.delivery_attempts(),
            last_attempt_at: event.last_attempt_at().map(format_timestamp),
            delivered_at: event.delivered_at().map(format_timestamp),
            error_message: event.error_message().map(str::to_string),
            response_code: event.response_code(),
        }
    }
}

impl From<NotificationEvent> for NotificationEventResponse {
    fn from(event: NotificationEvent) -> Self {
        Self::from(&event)
    }
}

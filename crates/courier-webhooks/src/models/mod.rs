//! Domain models for the delivery engine.

pub mod event;
pub mod query;
pub mod subscription;

pub use event::{
    next_retry_delay, DeliveryStatus, NotificationEvent, NotificationEventParts,
    MAX_DELIVERY_ATTEMPTS, RETRY_DELAYS_SECS,
};
pub use query::{EventFilter, NotificationEventResponse, Page, PageRequest, MAX_PAGE_SIZE};
pub use subscription::{SigningSecret, WebhookSubscription};

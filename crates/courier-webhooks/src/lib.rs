//! Webhook delivery engine.
//!
//! Delivers notification events to client-owned HTTP endpoints with
//! HMAC-SHA256 signatures, bounded exponential backoff, per-destination
//! circuit breaking and manual replay of permanently failed events.
//!
//! Flow: publish or replay → [`DispatchQueue`] → [`WebhookWorker`] →
//! [`DeliveryService::dispatch`] → [`CircuitBreakerGuard`] →
//! [`WebhookTransport`] → state transition → [`EventRepository::save`] →
//! [`RetryScheduler`] → retry sweep → [`DispatchQueue`].

pub mod circuit_breaker;
pub mod crypto;
pub mod error;
pub mod guard;
pub mod in_flight;
pub mod memory;
pub mod models;
pub mod ports;
pub mod repository;
pub mod services;
pub mod transport;
pub mod worker;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStatus,
    CircuitState, FailureRecord,
};
pub use error::{DeliveryError, DeliveryResult};
pub use guard::{AttemptOutcome, CircuitBreakerGuard};
pub use models::{
    DeliveryStatus, EventFilter, NotificationEvent, NotificationEventResponse, Page, PageRequest,
    WebhookSubscription, MAX_DELIVERY_ATTEMPTS,
};
pub use ports::{
    EventRepository, SubscriptionRepository, WebhookHeaders, WebhookResponse, WebhookTransport,
};
pub use repository::{PgEventRepository, PgSubscriptionRepository};
pub use services::delivery_service::{DeliveryService, DispatchOutcome};
pub use services::event_publisher::EventPublisher;
pub use services::notification_service::NotificationService;
pub use services::retry_scheduler::{RetryScheduler, RetrySchedulerConfig, SweepRetryScheduler};
pub use transport::HttpWebhookTransport;
pub use worker::{DispatchQueue, WebhookWorker, WorkerConfig};

//! Row models with their associated queries.

pub mod notification_event;
pub mod webhook_subscription;

pub use notification_event::{EventListFilter, NotificationEventRecord};
pub use webhook_subscription::{CreateWebhookSubscription, WebhookSubscriptionRecord};

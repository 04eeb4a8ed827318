//! Creation edge of the delivery flow.
//!
//! Persists a new `PENDING` event routed by the client's active subscription
//! and hands it to the dispatch queue. Payloads are passed through untouched.

use std::sync::Arc;

use crate::error::DeliveryError;
use crate::models::NotificationEvent;
use crate::ports::{EventRepository, SubscriptionRepository};
use crate::worker::DispatchQueue;

/// Publisher that records events and queues their first attempt.
#[derive(Clone)]
pub struct EventPublisher {
    events: Arc<dyn EventRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    queue: DispatchQueue,
}

impl EventPublisher {
    pub fn new(
        events: Arc<dyn EventRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        queue: DispatchQueue,
    ) -> Self {
        Self {
            events,
            subscriptions,
            queue,
        }
    }

    /// Record an event for `client_id` and queue its delivery.
    ///
    /// A saturated queue is not an error: the saved event is due and the
    /// retry sweep queues it.
    ///
    /// # Errors
    ///
    /// `SubscriptionNotFound` if no active subscription routes `event_type`
    /// for the client, or a storage error if the event cannot be saved.
    pub async fn publish(
        &self,
        client_id: &str,
        event_type: &str,
        event_data: impl Into<String>,
    ) -> Result<NotificationEvent, DeliveryError> {
        let subscription = self
            .subscriptions
            .find_active(client_id, event_type)
            .await?
            .ok_or(DeliveryError::SubscriptionNotFound)?;

        let event = NotificationEvent::new(
            client_id,
            event_type,
            event_data,
            subscription.webhook_url.as_str(),
        );
        let saved = self.events.save(&event).await?;

        match self.queue.submit(saved.id()) {
            Ok(_) => {
                tracing::debug!(
                    target: "webhook_delivery",
                    event_id = %saved.id(),
                    client_id,
                    event_type,
                    "Event published"
                );
            }
            Err(e) => {
                tracing::warn!(
                    target: "webhook_delivery",
                    event_id = %saved.id(),
                    client_id,
                    event_type,
                    error = %e,
                    "Event saved but not queued, leaving it to the retry sweep"
                );
            }
        }

        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryEventRepository, InMemorySubscriptionRepository};
    use crate::models::{DeliveryStatus, WebhookSubscription};

    fn setup(
        capacity: usize,
    ) -> (
        EventPublisher,
        Arc<InMemoryEventRepository>,
        DispatchQueue,
        crate::worker::DispatchReceiver,
    ) {
        let events = Arc::new(InMemoryEventRepository::new());
        let subscriptions = Arc::new(InMemorySubscriptionRepository::new());
        subscriptions.insert(WebhookSubscription::new(
            "c1",
            "order.created",
            "https://hooks.example.com/orders",
            "s3cret",
        ));
        let (queue, receiver) = DispatchQueue::bounded(capacity);
        let publisher = EventPublisher::new(events.clone(), subscriptions, queue.clone());
        (publisher, events, queue, receiver)
    }

    #[tokio::test]
    async fn test_publish_saves_pending_event_and_queues_it() {
        let (publisher, events, queue, _receiver) = setup(4);

        let event = publisher
            .publish("c1", "order.created", r#"{"order":1}"#)
            .await
            .unwrap();

        assert_eq!(event.delivery_status(), DeliveryStatus::Pending);
        assert_eq!(event.webhook_url(), "https://hooks.example.com/orders");
        assert_eq!(event.event_data(), r#"{"order":1}"#);
        assert!(events.get(event.id()).is_some());
        assert!(queue.is_outstanding(event.id()));
    }

    #[tokio::test]
    async fn test_publish_without_subscription() {
        let (publisher, events, _queue, _receiver) = setup(4);

        let err = publisher.publish("c1", "order.deleted", "{}").await.unwrap_err();
        assert!(matches!(err, DeliveryError::SubscriptionNotFound));
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_publish_tolerates_full_queue() {
        let (publisher, events, _queue, _receiver) = setup(1);

        publisher.publish("c1", "order.created", "{}").await.unwrap();
        let second = publisher.publish("c1", "order.created", "{}").await.unwrap();

        assert_eq!(events.len(), 2);
        assert!(events.get(second.id()).is_some());
    }
}

//! Client-facing query and replay operations.

use std::sync::Arc;

use courier_core::EventId;

use crate::error::DeliveryError;
use crate::models::{DeliveryStatus, EventFilter, NotificationEventResponse, Page, PageRequest};
use crate::ports::EventRepository;
use crate::worker::DispatchQueue;

/// Lists, fetches and replays a client's notification events.
#[derive(Clone)]
pub struct NotificationService {
    events: Arc<dyn EventRepository>,
    queue: DispatchQueue,
}

impl NotificationService {
    pub fn new(events: Arc<dyn EventRepository>, queue: DispatchQueue) -> Self {
        Self { events, queue }
    }

    /// A page of the client's events, newest first.
    pub async fn query_events(
        &self,
        client_id: &str,
        filter: &EventFilter,
        page: PageRequest,
    ) -> Result<Page<NotificationEventResponse>, DeliveryError> {
        let events = self.events.find_by_owner(client_id, filter, page).await?;
        Ok(events.map(NotificationEventResponse::from))
    }

    /// One event, if it exists and belongs to the client.
    pub async fn get_event(
        &self,
        event_id: EventId,
        client_id: &str,
    ) -> Result<Option<NotificationEventResponse>, DeliveryError> {
        let event = self.events.find_by_id_and_owner(event_id, client_id).await?;
        Ok(event.map(NotificationEventResponse::from))
    }

    /// Give a permanently failed event a fresh attempt budget and queue it.
    ///
    /// # Errors
    ///
    /// `NotFound` if the event does not exist or is not owned by the client,
    /// `InvalidState` unless it is `FAILED`. Neither mutates the event.
    pub async fn replay(
        &self,
        event_id: EventId,
        client_id: &str,
    ) -> Result<NotificationEventResponse, DeliveryError> {
        let mut event = self
            .events
            .find_by_id_and_owner(event_id, client_id)
            .await?
            .ok_or(DeliveryError::NotFound)?;

        let status = event.delivery_status();
        if status != DeliveryStatus::Failed {
            tracing::info!(
                target: "webhook_delivery",
                event_id = %event_id,
                client_id,
                status = %status,
                "Replay rejected, event is not FAILED"
            );
            return Err(DeliveryError::InvalidState { status });
        }

        event.reset_for_replay();
        let saved = self.events.save(&event).await?;

        tracing::info!(
            target: "webhook_delivery",
            event_id = %event_id,
            client_id,
            event_type = saved.event_type(),
            "Event reset for replay"
        );

        if let Err(e) = self.queue.submit(event_id) {
            // The event is PENDING and due, so the retry sweep will queue it.
            tracing::warn!(
                target: "webhook_delivery",
                event_id = %event_id,
                error = %e,
                "Replay not queued, leaving it to the retry sweep"
            );
        }

        Ok(NotificationEventResponse::from(&saved))
    }
}

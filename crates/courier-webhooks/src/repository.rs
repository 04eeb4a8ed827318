//! Postgres implementations of the repository ports.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{EventId, SubscriptionId};
use courier_db::models::{EventListFilter, NotificationEventRecord, WebhookSubscriptionRecord};
use sqlx::PgPool;

use crate::crypto;
use crate::error::DeliveryError;
use crate::models::{
    DeliveryStatus, EventFilter, NotificationEvent, NotificationEventParts, Page, PageRequest,
    SigningSecret, WebhookSubscription,
};
use crate::ports::{EventRepository, SubscriptionRepository, DEFAULT_CLAIM_LEASE};

impl TryFrom<NotificationEventRecord> for NotificationEvent {
    type Error = DeliveryError;

    fn try_from(record: NotificationEventRecord) -> Result<Self, Self::Error> {
        let delivery_status = DeliveryStatus::parse(&record.delivery_status).ok_or_else(|| {
            DeliveryError::Repository(format!(
                "Unknown delivery status {:?} on event {}",
                record.delivery_status, record.id
            ))
        })?;
        let delivery_attempts = u32::try_from(record.delivery_attempts).map_err(|_| {
            DeliveryError::Repository(format!(
                "Negative delivery attempts on event {}",
                record.id
            ))
        })?;

        Ok(NotificationEvent::from_parts(NotificationEventParts {
            id: EventId::from_uuid(record.id),
            client_id: record.client_id,
            event_type: record.event_type,
            event_data: record.event_data,
            webhook_url: record.webhook_url,
            created_at: record.created_at,
            delivery_status,
            delivery_attempts,
            last_attempt_at: record.last_attempt_at,
            delivered_at: record.delivered_at,
            error_message: record.error_message,
            response_code: record.response_code.and_then(|c| u16::try_from(c).ok()),
            next_attempt_at: record.next_attempt_at,
        }))
    }
}

impl From<&NotificationEvent> for NotificationEventRecord {
    fn from(event: &NotificationEvent) -> Self {
        let parts = event.to_parts();
        Self {
            id: parts.id.into_uuid(),
            client_id: parts.client_id,
            event_type: parts.event_type,
            event_data: parts.event_data,
            webhook_url: parts.webhook_url,
            created_at: parts.created_at,
            delivery_status: parts.delivery_status.as_str().to_string(),
            delivery_attempts: i32::try_from(parts.delivery_attempts).unwrap_or(i32::MAX),
            last_attempt_at: parts.last_attempt_at,
            delivered_at: parts.delivered_at,
            error_message: parts.error_message,
            response_code: parts.response_code.map(i32::from),
            next_attempt_at: parts.next_attempt_at,
        }
    }
}

fn to_list_filter(filter: &EventFilter) -> EventListFilter {
    EventListFilter {
        created_from: filter.event_date_from,
        created_to: filter.event_date_to,
        delivery_status: filter.delivery_status.map(|s| s.as_str().to_string()),
    }
}

/// Event store over the `notification_events` table.
#[derive(Debug, Clone)]
pub struct PgEventRepository {
    pool: PgPool,
    claim_lease: Duration,
}

impl PgEventRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            claim_lease: DEFAULT_CLAIM_LEASE,
        }
    }

    #[must_use]
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    fn lease(&self) -> Result<chrono::Duration, DeliveryError> {
        chrono::Duration::from_std(self.claim_lease)
            .map_err(|e| DeliveryError::Repository(format!("Invalid claim lease: {e}")))
    }
}

#[async_trait]
impl EventRepository for PgEventRepository {
    async fn save(&self, event: &NotificationEvent) -> Result<NotificationEvent, DeliveryError> {
        let record = NotificationEventRecord::from(event);
        NotificationEventRecord::upsert(&self.pool, &record)
            .await?
            .try_into()
    }

    async fn claim_for_dispatch(
        &self,
        id: EventId,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationEvent>, DeliveryError> {
        let lease_until = now + self.lease()?;
        NotificationEventRecord::claim_for_dispatch(&self.pool, id.into_uuid(), now, lease_until)
            .await?
            .map(NotificationEvent::try_from)
            .transpose()
    }

    async fn find_by_id(&self, id: EventId) -> Result<Option<NotificationEvent>, DeliveryError> {
        NotificationEventRecord::find_by_id(&self.pool, id.into_uuid())
            .await?
            .map(NotificationEvent::try_from)
            .transpose()
    }

    async fn find_by_id_and_owner(
        &self,
        id: EventId,
        client_id: &str,
    ) -> Result<Option<NotificationEvent>, DeliveryError> {
        NotificationEventRecord::find_by_id_and_client(&self.pool, id.into_uuid(), client_id)
            .await?
            .map(NotificationEvent::try_from)
            .transpose()
    }

    async fn find_due_for_retry(
        &self,
        threshold: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationEvent>, DeliveryError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        NotificationEventRecord::find_due(&self.pool, threshold, Utc::now(), limit)
            .await?
            .into_iter()
            .map(NotificationEvent::try_from)
            .collect()
    }

    async fn find_by_owner(
        &self,
        client_id: &str,
        filter: &EventFilter,
        page: PageRequest,
    ) -> Result<Page<NotificationEvent>, DeliveryError> {
        let list_filter = to_list_filter(filter);
        let offset = i64::try_from(page.offset()).unwrap_or(i64::MAX);

        let records = NotificationEventRecord::list_by_client(
            &self.pool,
            client_id,
            &list_filter,
            i64::from(page.size()),
            offset,
        )
        .await?;
        let total = NotificationEventRecord::count_by_client(&self.pool, client_id, &list_filter)
            .await?;

        let items = records
            .into_iter()
            .map(NotificationEvent::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page::new(items, page, u64::try_from(total).unwrap_or(0)))
    }
}

/// Subscription lookup over `webhook_subscriptions`, decrypting secrets.
#[derive(Clone)]
pub struct PgSubscriptionRepository {
    pool: PgPool,
    encryption_key: Vec<u8>,
}

impl PgSubscriptionRepository {
    #[must_use]
    pub fn new(pool: PgPool, encryption_key: Vec<u8>) -> Self {
        Self {
            pool,
            encryption_key,
        }
    }
}

#[async_trait]
impl SubscriptionRepository for PgSubscriptionRepository {
    async fn find_active(
        &self,
        client_id: &str,
        event_type: &str,
    ) -> Result<Option<WebhookSubscription>, DeliveryError> {
        let Some(record) =
            WebhookSubscriptionRecord::find_active(&self.pool, client_id, event_type).await?
        else {
            return Ok(None);
        };

        let secret = crypto::decrypt_secret(&record.secret_encrypted, &self.encryption_key)
            .map_err(|e| {
                DeliveryError::SigningConfiguration(format!(
                    "Cannot decrypt secret of subscription {}: {e}",
                    record.id
                ))
            })?;

        Ok(Some(WebhookSubscription {
            id: SubscriptionId::from_uuid(record.id),
            client_id: record.client_id,
            event_type: record.event_type,
            webhook_url: record.webhook_url,
            secret: SigningSecret::new(secret),
            active: record.active,
            created_at: record.created_at,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip() {
        let mut event = NotificationEvent::new("c1", "order.created", "{}", "https://x.test/h");
        event.mark_as_failed("HTTP 503", Some(503));

        let record = NotificationEventRecord::from(&event);
        assert_eq!(record.delivery_status, "RETRYING");
        assert_eq!(record.delivery_attempts, 1);
        assert_eq!(record.response_code, Some(503));

        let back = NotificationEvent::try_from(record).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let event = NotificationEvent::new("c1", "t", "{}", "https://x.test/h");
        let mut record = NotificationEventRecord::from(&event);
        record.delivery_status = "LOST".to_string();

        let err = NotificationEvent::try_from(record).unwrap_err();
        assert!(err.is_storage_error());
    }

    #[test]
    fn test_filter_mapping() {
        let filter = EventFilter::default().with_status(DeliveryStatus::Delivered);
        let mapped = to_list_filter(&filter);
        assert_eq!(mapped.delivery_status.as_deref(), Some("DELIVERED"));
        assert!(mapped.created_from.is_none());
    }
}

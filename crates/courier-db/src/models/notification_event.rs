//! Notification event model.
//!
//! One row per event; the delivery engine upserts the whole row after every
//! state transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// A persisted notification event.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationEventRecord {
    pub id: Uuid,
    pub client_id: String,
    pub event_type: String,
    pub event_data: String,
    pub webhook_url: String,
    pub created_at: DateTime<Utc>,
    /// One of `PENDING`, `RETRYING`, `DELIVERED`, `FAILED`.
    pub delivery_status: String,
    pub delivery_attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub response_code: Option<i32>,
    /// When the sweep may pick the event up next.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Optional filters for listing a client's events.
#[derive(Debug, Clone, Default)]
pub struct EventListFilter {
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub delivery_status: Option<String>,
}

impl NotificationEventRecord {
    /// Insert the event, or update its mutable delivery columns if it exists.
    ///
    /// Identity columns (`client_id`, `event_type`, `event_data`,
    /// `webhook_url`, `created_at`) are never rewritten. Any dispatch lease
    /// is released.
    pub async fn upsert(pool: &PgPool, record: &NotificationEventRecord) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            r#"
            INSERT INTO notification_events (
                id, client_id, event_type, event_data, webhook_url, created_at,
                delivery_status, delivery_attempts, last_attempt_at, delivered_at,
                error_message, response_code, next_attempt_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                delivery_status = EXCLUDED.delivery_status,
                delivery_attempts = EXCLUDED.delivery_attempts,
                last_attempt_at = EXCLUDED.last_attempt_at,
                delivered_at = EXCLUDED.delivered_at,
                error_message = EXCLUDED.error_message,
                response_code = EXCLUDED.response_code,
                next_attempt_at = EXCLUDED.next_attempt_at,
                claimed_until = NULL
            RETURNING *
            "#,
        )
        .bind(record.id)
        .bind(&record.client_id)
        .bind(&record.event_type)
        .bind(&record.event_data)
        .bind(&record.webhook_url)
        .bind(record.created_at)
        .bind(&record.delivery_status)
        .bind(record.delivery_attempts)
        .bind(record.last_attempt_at)
        .bind(record.delivered_at)
        .bind(&record.error_message)
        .bind(record.response_code)
        .bind(record.next_attempt_at)
        .fetch_one(pool)
        .await
    }

    /// Find an event by ID.
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM notification_events WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Find an event by ID, only if it belongs to the given client.
    pub async fn find_by_id_and_client(
        pool: &PgPool,
        id: Uuid,
        client_id: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM notification_events WHERE id = $1 AND client_id = $2")
            .bind(id)
            .bind(client_id)
            .fetch_optional(pool)
            .await
    }

    /// List a client's events, newest first.
    pub async fn list_by_client(
        pool: &PgPool,
        client_id: &str,
        filter: &EventListFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM notification_events
            WHERE client_id = $1
              AND ($2::timestamptz IS NULL OR created_at >= $2)
              AND ($3::timestamptz IS NULL OR created_at <= $3)
              AND ($4::text IS NULL OR delivery_status = $4)
            ORDER BY created_at DESC
            LIMIT $5 OFFSET $6
            "#,
        )
        .bind(client_id)
        .bind(filter.created_from)
        .bind(filter.created_to)
        .bind(&filter.delivery_status)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
    }

    /// Count a client's events matching the filter.
    pub async fn count_by_client(
        pool: &PgPool,
        client_id: &str,
        filter: &EventListFilter,
    ) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM notification_events
            WHERE client_id = $1
              AND ($2::timestamptz IS NULL OR created_at >= $2)
              AND ($3::timestamptz IS NULL OR created_at <= $3)
              AND ($4::text IS NULL OR delivery_status = $4)
            "#,
        )
        .bind(client_id)
        .bind(filter.created_from)
        .bind(filter.created_to)
        .bind(&filter.delivery_status)
        .fetch_one(pool)
        .await?;

        Ok(row.0)
    }

    /// Up to `limit` events due at `threshold` that no dispatcher holds at
    /// `now`, oldest due first.
    pub async fn find_due(
        pool: &PgPool,
        threshold: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM notification_events
            WHERE delivery_status IN ('PENDING', 'RETRYING')
              AND next_attempt_at <= $1
              AND (claimed_until IS NULL OR claimed_until <= $2)
            ORDER BY next_attempt_at ASC
            LIMIT $3
            "#,
        )
        .bind(threshold)
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await
    }

    /// Take the dispatch lease on one event until `lease_until`.
    ///
    /// Succeeds only for a `PENDING` or `RETRYING` event that is due at
    /// `now` and not leased by someone else. The conditional update is
    /// atomic, so of two concurrent callers at most one gets the row.
    pub async fn claim_for_dispatch(
        pool: &PgPool,
        id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            UPDATE notification_events
            SET claimed_until = $3
            WHERE id = $1
              AND delivery_status IN ('PENDING', 'RETRYING')
              AND next_attempt_at <= $2
              AND (claimed_until IS NULL OR claimed_until <= $2)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(lease_until)
        .fetch_optional(pool)
        .await
    }
}

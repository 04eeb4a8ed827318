//! Webhook subscription model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// A persisted webhook subscription.
///
/// The signing secret is stored AES-256-GCM encrypted; decryption is the
/// caller's concern.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WebhookSubscriptionRecord {
    pub id: Uuid,
    pub client_id: String,
    pub event_type: String,
    pub webhook_url: String,
    #[serde(skip_serializing)]
    pub secret_encrypted: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Request to create a new subscription.
#[derive(Debug, Clone)]
pub struct CreateWebhookSubscription {
    pub client_id: String,
    pub event_type: String,
    pub webhook_url: String,
    pub secret_encrypted: String,
}

impl WebhookSubscriptionRecord {
    /// Create a subscription.
    pub async fn create(
        pool: &PgPool,
        input: CreateWebhookSubscription,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            r#"
            INSERT INTO webhook_subscriptions (id, client_id, event_type, webhook_url, secret_encrypted)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.client_id)
        .bind(&input.event_type)
        .bind(&input.webhook_url)
        .bind(&input.secret_encrypted)
        .fetch_one(pool)
        .await
    }

    /// Find the active subscription routing `event_type` for `client_id`.
    pub async fn find_active(
        pool: &PgPool,
        client_id: &str,
        event_type: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM webhook_subscriptions
            WHERE client_id = $1 AND event_type = $2 AND active
            "#,
        )
        .bind(client_id)
        .bind(event_type)
        .fetch_optional(pool)
        .await
    }

    /// Enable or disable a subscription.
    pub async fn set_active(pool: &PgPool, id: Uuid, active: bool) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE webhook_subscriptions SET active = $2 WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

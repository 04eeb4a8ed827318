//! Webhook subscription as seen by the delivery engine.

use std::fmt;

use chrono::{DateTime, Utc};
use courier_core::SubscriptionId;

/// Plaintext HMAC signing secret. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningSecret(String);

impl SigningSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningSecret(***)")
    }
}

/// Routing of one event type for one client to a webhook endpoint.
#[derive(Debug, Clone)]
pub struct WebhookSubscription {
    pub id: SubscriptionId,
    pub client_id: String,
    pub event_type: String,
    pub webhook_url: String,
    pub secret: SigningSecret,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl WebhookSubscription {
    /// Create an active subscription.
    pub fn new(
        client_id: impl Into<String>,
        event_type: impl Into<String>,
        webhook_url: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            id: SubscriptionId::new(),
            client_id: client_id.into(),
            event_type: event_type.into(),
            webhook_url: webhook_url.into(),
            secret: SigningSecret::new(secret),
            active: true,
            created_at: Utc::now(),
        }
    }

    /// True iff active and routing exactly this client and event type.
    #[must_use]
    pub fn is_active_for(&self, client_id: &str, event_type: &str) -> bool {
        self.active && self.client_id == client_id && self.event_type == event_type
    }
}

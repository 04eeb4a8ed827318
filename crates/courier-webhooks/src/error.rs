//! Error types for the delivery engine.

use crate::models::DeliveryStatus;

/// Delivery engine error variants.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Unknown event id, or the event is not owned by the caller.
    #[error("Notification event not found")]
    NotFound,

    /// The requested transition is not allowed from the current status.
    #[error("Operation not allowed while event is {status}")]
    InvalidState { status: DeliveryStatus },

    /// Network error, timeout or non-2xx response.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The destination's circuit breaker rejected the attempt.
    #[error("circuit breaker open")]
    BreakerOpen,

    /// The attempt budget is exhausted; only a replay can revive the event.
    #[error("Delivery permanently failed after {attempts} attempts")]
    PermanentFailure { attempts: u32 },

    /// Missing or unusable signing secret. Never retried with a bad signature.
    #[error("Signing configuration error: {0}")]
    SigningConfiguration(String),

    /// HMAC computation fault.
    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("No active subscription for client and event type")]
    SubscriptionNotFound,

    /// Another attempt for the same event is running in this process.
    #[error("A delivery attempt for this event is already in flight")]
    AlreadyInFlight,

    /// The dispatch queue is saturated.
    #[error("Dispatch queue is full")]
    QueueFull,

    /// The dispatch queue has shut down.
    #[error("Dispatch queue is closed")]
    QueueClosed,

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
}

impl DeliveryError {
    /// Whether the error is a storage fault rather than a delivery outcome.
    #[must_use]
    pub fn is_storage_error(&self) -> bool {
        matches!(self, Self::Repository(_) | Self::Database(_))
    }

    /// Whether the error must be surfaced to an operator instead of retried.
    #[must_use]
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::SigningConfiguration(_) | Self::EncryptionFailed(_)
        )
    }
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;

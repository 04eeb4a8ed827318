//! courier Core Library
//!
//! Shared identifier types for the courier webhook delivery engine.
//!
//! # Example
//!
//! ```
//! use courier_core::{EventId, SubscriptionId};
//!
//! let event_id = EventId::new();
//! let subscription_id = SubscriptionId::new();
//! assert_ne!(event_id.as_uuid(), subscription_id.as_uuid());
//! ```

pub mod ids;

pub use ids::{EventId, ParseIdError, SubscriptionId};

//! courier-db: PostgreSQL persistence for the webhook delivery engine.
//!
//! - [`DbPool`] wraps the `sqlx` pool
//! - [`run_migrations`] applies the embedded schema
//! - [`models`] holds row types with their queries

pub mod error;
pub mod migrations;
pub mod models;
pub mod pool;

pub use error::DbError;
pub use migrations::run_migrations;
pub use pool::{DbPool, DEFAULT_MAX_CONNECTIONS};

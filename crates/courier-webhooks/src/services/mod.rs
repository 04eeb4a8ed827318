//! Business logic services for the delivery engine.

pub mod delivery_service;
pub mod event_publisher;
pub mod notification_service;
pub mod retry_scheduler;

//! Delayed re-dispatch of failed events.
//!
//! The retry schedule lives in the event row itself: a failed attempt is
//! saved with `next_attempt_at` set to its backoff deadline. The sweep loop
//! periodically asks the repository for events whose deadline has passed
//! and submits them to the dispatch queue. Nothing is kept only in memory,
//! so a restart loses no retries.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::EventId;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::DeliveryError;
use crate::ports::EventRepository;
use crate::worker::DispatchQueue;

/// Hands an event to a delayed re-dispatch mechanism.
#[async_trait]
pub trait RetryScheduler: Send + Sync {
    /// Request a re-dispatch of `event_id` no earlier than `delay` from now.
    ///
    /// The caller has already persisted the deadline with the event.
    async fn schedule_retry(&self, event_id: EventId, delay: Duration);
}

/// Sweep configuration.
#[derive(Debug, Clone)]
pub struct RetrySchedulerConfig {
    /// Longest time between two sweeps.
    pub sweep_interval: Duration,
    /// Maximum events fetched per sweep.
    pub batch_size: usize,
}

impl Default for RetrySchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            batch_size: 100,
        }
    }
}

impl RetrySchedulerConfig {
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Due events returned by the repository.
    pub found: usize,
    /// Events newly placed on the dispatch queue.
    pub submitted: usize,
    /// Events already queued or running.
    pub already_queued: usize,
    /// Events left for a later sweep because the queue was full.
    pub deferred: usize,
}

#[derive(Default)]
struct Wakeup {
    earliest: Mutex<Option<DateTime<Utc>>>,
    notify: Notify,
}

/// Durable retry scheduler driven by a periodic sweep.
#[derive(Clone)]
pub struct SweepRetryScheduler {
    events: Arc<dyn EventRepository>,
    queue: DispatchQueue,
    config: RetrySchedulerConfig,
    wakeup: Arc<Wakeup>,
}

impl SweepRetryScheduler {
    pub fn new(
        events: Arc<dyn EventRepository>,
        queue: DispatchQueue,
        config: RetrySchedulerConfig,
    ) -> Self {
        Self {
            events,
            queue,
            config,
            wakeup: Arc::new(Wakeup::default()),
        }
    }

    /// Submit every due event to the dispatch queue once.
    ///
    /// The due query only reads, so stopping early on a full queue leaves
    /// the remaining events due for the next sweep. Duplicate submissions
    /// across sweeps or processes are settled by the dispatch lease.
    pub async fn sweep_once(&self) -> Result<SweepReport, DeliveryError> {
        let due = self
            .events
            .find_due_for_retry(Utc::now(), self.config.batch_size)
            .await?;

        let mut report = SweepReport {
            found: due.len(),
            ..SweepReport::default()
        };

        for (idx, event) in due.iter().enumerate() {
            match self.queue.submit(event.id()) {
                Ok(true) => report.submitted += 1,
                Ok(false) => report.already_queued += 1,
                Err(DeliveryError::QueueFull) => {
                    report.deferred = due.len() - idx;
                    tracing::warn!(
                        target: "retry_scheduler",
                        deferred = report.deferred,
                        "Dispatch queue full, deferring remaining due events"
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }

    /// Run the sweep loop until `shutdown` is cancelled or the queue closes.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            target: "retry_scheduler",
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Starting retry sweep"
        );

        loop {
            match self.sweep_once().await {
                Ok(report) if report.found > 0 => {
                    tracing::debug!(
                        target: "retry_scheduler",
                        found = report.found,
                        submitted = report.submitted,
                        already_queued = report.already_queued,
                        deferred = report.deferred,
                        "Retry sweep completed"
                    );
                }
                Ok(_) => {}
                Err(DeliveryError::QueueClosed) => {
                    tracing::info!(target: "retry_scheduler", "Dispatch queue closed");
                    break;
                }
                Err(e) => {
                    tracing::error!(
                        target: "retry_scheduler",
                        error = %e,
                        "Retry sweep failed"
                    );
                }
            }
            self.clear_elapsed_wakeup();

            // A wakeup only shortens the wait; loop until the wait elapses.
            loop {
                let wait = self.time_until_next_sweep();
                tokio::select! {
                    () = shutdown.cancelled() => {
                        tracing::info!(target: "retry_scheduler", "Retry sweep stopped");
                        return;
                    }
                    () = self.wakeup.notify.notified() => continue,
                    () = tokio::time::sleep(wait) => break,
                }
            }
        }
    }

    fn earliest(&self) -> std::sync::MutexGuard<'_, Option<DateTime<Utc>>> {
        self.wakeup
            .earliest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn time_until_next_sweep(&self) -> Duration {
        let interval = self.config.sweep_interval;
        match *self.earliest() {
            Some(due) => (due - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(interval),
            None => interval,
        }
    }

    fn clear_elapsed_wakeup(&self) {
        let mut earliest = self.earliest();
        if earliest.is_some_and(|due| due <= Utc::now()) {
            *earliest = None;
        }
    }
}

#[async_trait]
impl RetryScheduler for SweepRetryScheduler {
    async fn schedule_retry(&self, event_id: EventId, delay: Duration) {
        let due = chrono::Duration::from_std(delay)
            .map(|d| Utc::now() + d)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let sooner = {
            let mut earliest = self.earliest();
            if earliest.map_or(true, |current| due < current) {
                *earliest = Some(due);
                true
            } else {
                false
            }
        };
        if sooner {
            self.wakeup.notify.notify_one();
        }

        tracing::debug!(
            target: "retry_scheduler",
            event_id = %event_id,
            delay_secs = delay.as_secs(),
            due_at = %due,
            "Retry scheduled"
        );
    }
}

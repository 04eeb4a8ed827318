//! Dispatch queue and worker pool.
//!
//! Producers (publisher, replay, retry sweep) submit event ids to a bounded
//! [`DispatchQueue`]. The [`WebhookWorker`] drains it and runs
//! [`DeliveryService::dispatch`] with bounded concurrency.

use std::sync::Arc;

use courier_core::EventId;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::DeliveryError;
use crate::in_flight::{InFlightClaim, InFlightRegistry};
use crate::services::delivery_service::{DeliveryService, DispatchOutcome};

/// Default number of ids the queue holds.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default number of concurrent dispatches.
pub const DEFAULT_CONCURRENCY: usize = 16;

/// An id on the queue. Holds the id's slot until the dispatch finishes.
#[derive(Debug)]
pub struct QueuedDispatch {
    claim: InFlightClaim,
}

impl QueuedDispatch {
    #[must_use]
    pub fn event_id(&self) -> EventId {
        self.claim.id()
    }
}

/// Sending half of the dispatch queue.
///
/// An id stays outstanding from submission until its dispatch completes and
/// is not accepted again in between.
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    sender: mpsc::Sender<QueuedDispatch>,
    outstanding: InFlightRegistry,
}

/// Receiving half of the dispatch queue.
#[derive(Debug)]
pub struct DispatchReceiver {
    receiver: mpsc::Receiver<QueuedDispatch>,
}

impl DispatchReceiver {
    /// Next queued dispatch, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<QueuedDispatch> {
        self.receiver.recv().await
    }
}

impl DispatchQueue {
    /// Create a queue holding at most `capacity` ids.
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, DispatchReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                outstanding: InFlightRegistry::new(),
            },
            DispatchReceiver { receiver },
        )
    }

    /// Queue `event_id` for dispatch without waiting.
    ///
    /// Returns `Ok(false)` if the id is already queued or running.
    ///
    /// # Errors
    ///
    /// `QueueFull` when the queue is saturated, `QueueClosed` after the
    /// worker has gone away.
    pub fn submit(&self, event_id: EventId) -> Result<bool, DeliveryError> {
        let Some(claim) = self.outstanding.try_claim(event_id) else {
            debug!(
                target: "dispatch_worker",
                event_id = %event_id,
                "Event already queued or running"
            );
            return Ok(false);
        };

        match self.sender.try_send(QueuedDispatch { claim }) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                warn!(
                    target: "dispatch_worker",
                    event_id = %event_id,
                    "Dispatch queue full, rejecting submission"
                );
                Err(DeliveryError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(DeliveryError::QueueClosed),
        }
    }

    /// Whether `event_id` is queued or running.
    #[must_use]
    pub fn is_outstanding(&self, event_id: EventId) -> bool {
        self.outstanding.contains(event_id)
    }

    /// Number of ids queued or running.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of dispatches running at once.
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

/// Background worker executing queued dispatches.
pub struct WebhookWorker {
    receiver: DispatchReceiver,
    dispatcher: Arc<DeliveryService>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl WebhookWorker {
    pub fn new(
        receiver: DispatchReceiver,
        dispatcher: Arc<DeliveryService>,
        config: WorkerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            receiver,
            dispatcher,
            config,
            shutdown,
        }
    }

    /// Run until shutdown is requested or the queue closes, then wait for
    /// running dispatches to finish.
    ///
    /// Ids still queued at shutdown are not dispatched; they remain due in
    /// the repository and the retry sweep picks them up after a restart.
    pub async fn run(self) {
        let Self {
            mut receiver,
            dispatcher,
            config,
            shutdown,
        } = self;
        let concurrency = config.concurrency.max(1);

        info!(
            target: "dispatch_worker",
            concurrency,
            "Starting webhook worker"
        );

        let semaphore = Arc::new(Semaphore::new(concurrency));

        loop {
            let job = tokio::select! {
                () = shutdown.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(job) => job,
                    None => break,
                },
            };

            let permit = tokio::select! {
                () = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let _permit = permit;
                process_dispatch(&dispatcher, job).await;
            });
        }

        info!(target: "dispatch_worker", "Waiting for in-flight dispatches to complete...");
        let all = u32::try_from(concurrency).unwrap_or(u32::MAX);
        let _ = semaphore.acquire_many(all).await;
        info!(target: "dispatch_worker", "Webhook worker stopped");
    }
}

async fn process_dispatch(dispatcher: &DeliveryService, job: QueuedDispatch) {
    let event_id = job.event_id();

    match dispatcher.dispatch(event_id).await {
        Ok(DispatchOutcome::Skipped { status }) => {
            debug!(
                target: "dispatch_worker",
                event_id = %event_id,
                status = %status,
                "Skipped terminal event"
            );
        }
        Ok(DispatchOutcome::NotDue { next_attempt_at }) => {
            debug!(
                target: "dispatch_worker",
                event_id = %event_id,
                next_attempt_at = ?next_attempt_at,
                "Skipped event still in backoff"
            );
        }
        Ok(outcome) => {
            debug!(
                target: "dispatch_worker",
                event_id = %event_id,
                outcome = ?outcome,
                "Dispatch finished"
            );
        }
        Err(DeliveryError::AlreadyInFlight) => {
            debug!(
                target: "dispatch_worker",
                event_id = %event_id,
                "Dispatch already in flight elsewhere"
            );
        }
        Err(e) if e.is_configuration_error() => {
            error!(
                target: "dispatch_worker",
                event_id = %event_id,
                error = %e,
                "Dispatch needs operator attention"
            );
        }
        Err(e) => {
            warn!(
                target: "dispatch_worker",
                event_id = %event_id,
                error = %e,
                "Dispatch failed"
            );
        }
    }

    drop(job);
}

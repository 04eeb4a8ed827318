//! Courier webhook delivery worker.
//!
//! Runs the retry sweep and the dispatch pool against PostgreSQL until
//! SIGINT or SIGTERM, then drains in-flight attempts.

mod config;
mod logging;

use std::sync::Arc;
use std::time::Duration;

use config::Config;
use courier_db::{run_migrations, DbPool};
use courier_webhooks::worker::DispatchQueue;
use courier_webhooks::{
    CircuitBreakerGuard, CircuitBreakerRegistry, DeliveryService, HttpWebhookTransport,
    PgEventRepository, PgSubscriptionRepository, SweepRetryScheduler, WebhookWorker,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

const BREAKER_EVICTION_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() {
    // A missing .env file is fine; real deployments set the environment.
    let _ = dotenvy::dotenv();

    // Load configuration (fail-fast on missing required values)
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    logging::init_logging(&config.rust_log);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        concurrency = config.dispatch_concurrency,
        queue_capacity = config.dispatch_queue_capacity,
        sweep_interval_secs = config.retry_sweep_interval.as_secs(),
        "Starting courier worker"
    );

    let pool = match DbPool::connect(&config.database_url, config.database_max_connections).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Failed to connect to database: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run_migrations(&pool).await {
        tracing::error!("Failed to run migrations: {e}");
        std::process::exit(1);
    }

    let transport = match HttpWebhookTransport::with_timeout(config.dispatch_timeout) {
        Ok(transport) => transport,
        Err(e) => {
            tracing::error!("Failed to create webhook transport: {e}");
            std::process::exit(1);
        }
    };

    let events = Arc::new(
        PgEventRepository::new(pool.inner().clone()).with_claim_lease(config.retry_claim_lease),
    );
    let subscriptions = Arc::new(PgSubscriptionRepository::new(
        pool.inner().clone(),
        config.webhook_encryption_key.to_vec(),
    ));

    let (queue, receiver) = DispatchQueue::bounded(config.dispatch_queue_capacity);
    let scheduler = SweepRetryScheduler::new(
        events.clone(),
        queue.clone(),
        config.retry_scheduler_config(),
    );
    let breakers = CircuitBreakerRegistry::new(config.circuit_breaker.clone());
    let guard = CircuitBreakerGuard::new(breakers.clone(), Arc::new(transport))
        .with_attempt_timeout(config.dispatch_timeout);
    let delivery = Arc::new(DeliveryService::new(
        events,
        subscriptions,
        guard,
        Arc::new(scheduler.clone()),
    ));

    let shutdown = CancellationToken::new();

    let worker = WebhookWorker::new(receiver, delivery, config.worker_config(), shutdown.clone());
    let worker_handle = tokio::spawn(worker.run());
    info!("Webhook delivery worker started");

    let sweep_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };
    info!("Retry sweep started");

    let eviction_handle = tokio::spawn(evict_idle_breakers(breakers, shutdown.clone()));

    // The worker stops once every queue sender is gone; keep ours until shutdown.
    shutdown_signal().await;
    shutdown.cancel();

    if let Err(e) = sweep_handle.await {
        tracing::error!("Retry sweep task failed: {e}");
    }
    if let Err(e) = worker_handle.await {
        tracing::error!("Webhook worker task failed: {e}");
    }
    if let Err(e) = eviction_handle.await {
        tracing::error!("Breaker eviction task failed: {e}");
    }
    drop(queue);

    info!("Courier worker shutdown complete");
}

async fn evict_idle_breakers(breakers: CircuitBreakerRegistry, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(BREAKER_EVICTION_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            _ = interval.tick() => {
                breakers.evict_idle().await;
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!("Failed to install Ctrl+C handler: {e}");
                // Fall through - we still want to wait for terminate signal
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                // Wait forever if we can't install the handler
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

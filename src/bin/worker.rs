use cfdi_verifier::{
    app_state::{build_executor, connect_queue, connect_store},
    config::AppConfig,
    services::{
        executor::{Execution, Executor},
        notify::{NotificationSink, WebhookNotifier},
        queue::{Delivery, JobQueue, QueueError},
    },
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL_MS: u64 = 1000; // 1 second

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting CFDI verification worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    let store = connect_store(&config)
        .await
        .expect("Failed to connect to state store");

    let queue = connect_queue(&config)
        .expect("Failed to initialize job queue")
        .expect("REDIS_URL must be set for the worker");
    let queue = Arc::new(queue);

    let notifier: Arc<dyn NotificationSink> = Arc::new(
        WebhookNotifier::new(config.webhook_timeout()).expect("Failed to build webhook client"),
    );
    let executor =
        build_executor(&config, store, notifier).expect("Failed to initialize verifier");

    let shutdown = CancellationToken::new();
    let revocation_poll = config.revocation_poll();

    // Reclaims units left behind by workers that died mid-run
    let reaper = {
        let queue = queue.clone();
        let shutdown = shutdown.clone();
        let lease = config.processing_lease();
        tokio::spawn(async move { reap_stale_units(&queue, lease, shutdown).await })
    };

    tracing::info!(
        concurrency = config.worker_concurrency,
        "Worker ready, starting job processing loops"
    );

    let loops: Vec<_> = (0..config.worker_concurrency.max(1))
        .map(|slot| {
            let queue = queue.clone();
            let executor = executor.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                worker_loop(slot, &queue, &executor, revocation_poll, shutdown).await;
            })
        })
        .collect();

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received, finishing in-flight units"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
    }
    shutdown.cancel();

    for handle in loops {
        let _ = handle.await;
    }
    let _ = reaper.await;
    tracing::info!("Worker stopped");
}

async fn worker_loop(
    slot: usize,
    queue: &JobQueue,
    executor: &Executor,
    revocation_poll: Duration,
    shutdown: CancellationToken,
) {
    while !shutdown.is_cancelled() {
        match process_next_unit(queue, executor, revocation_poll).await {
            Ok(true) => {
                tracing::debug!(slot, "Unit processed, checking for next unit");
            }
            Ok(false) => {
                tracing::trace!(slot, "No units available, sleeping");
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = sleep(Duration::from_millis(POLL_INTERVAL_MS)) => {}
                }
            }
            Err(e) => {
                tracing::error!(slot, error = %e, "Error processing unit, will retry");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
        }
    }
}

/// Process the next unit from the queue.
/// Returns Ok(true) if a unit was taken, Ok(false) if the queue was empty.
async fn process_next_unit(
    queue: &JobQueue,
    executor: &Executor,
    revocation_poll: Duration,
) -> Result<bool, QueueError> {
    let delivery = match queue.dequeue().await? {
        Some(d) => d,
        None => return Ok(false),
    };
    let unit_id = delivery.unit.unit_id;

    if queue.is_revoked(unit_id).await? {
        tracing::info!(unit_id = %unit_id, "Skipping revoked unit");
        queue.complete(&delivery).await?;
        return Ok(true);
    }

    tracing::info!(unit_id = %unit_id, item = %delivery.unit.key, "Processing work unit");

    // Dropping the execution future closes the browser session
    tokio::select! {
        outcome = executor.execute(&delivery.unit) => match outcome {
            Ok(Execution::Finished(Ok(result))) => {
                tracing::info!(unit_id = %unit_id, valid = result.valid, "Unit completed");
            }
            Ok(Execution::Finished(Err(failure))) => {
                tracing::warn!(unit_id = %unit_id, error = %failure, "Unit failed");
            }
            Ok(Execution::Skipped { current }) => {
                tracing::info!(unit_id = %unit_id, status = %current, "Unit already resolved");
            }
            Ok(Execution::Missing) => {
                tracing::warn!(unit_id = %unit_id, "No item recorded for unit");
            }
            Err(e) => {
                // Left in the processing list; the reaper hands it out again
                // once its lease lapses
                tracing::error!(unit_id = %unit_id, error = %e, "Failed to record unit outcome, leaving for redelivery");
                return Ok(true);
            }
        },
        _ = wait_for_revocation(queue, &delivery, revocation_poll) => {
            tracing::info!(unit_id = %unit_id, "Unit revoked mid-flight");
        }
    }

    queue.complete(&delivery).await?;
    Ok(true)
}

/// Resolves once the unit shows up in the revocation set. Renews the
/// delivery's lease on every check.
async fn wait_for_revocation(queue: &JobQueue, delivery: &Delivery, poll: Duration) {
    let unit_id = delivery.unit.unit_id;
    loop {
        sleep(poll).await;
        if let Err(e) = queue.renew(delivery).await {
            tracing::warn!(unit_id = %unit_id, error = %e, "Lease renewal failed");
        }
        match queue.is_revoked(unit_id).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => tracing::warn!(unit_id = %unit_id, error = %e, "Revocation check failed"),
        }
    }
}

/// Requeue lapsed units at startup, then every half lease.
async fn reap_stale_units(queue: &JobQueue, lease: Duration, shutdown: CancellationToken) {
    while !shutdown.is_cancelled() {
        if let Err(e) = queue.requeue_stale(lease).await {
            tracing::error!(error = %e, "Failed to requeue stale units");
        }
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = sleep((lease / 2).max(Duration::from_secs(1))) => {}
        }
    }
}

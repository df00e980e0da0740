//! Batch submission, convergence, notification and cancellation, run
//! entirely in process.

mod fixtures;
mod helpers;

use cfdi_verifier::models::batch::BatchStatus;
use cfdi_verifier::models::job::{ItemFilter, JobStatus};
use cfdi_verifier::services::coordinator::{complete_batch, CoordinatorError};
use cfdi_verifier::services::dispatch::Dispatcher;
use fixtures::*;
use helpers::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

const WEBHOOK: &str = "http://hooks.test/batch";
const SETTLE: Duration = Duration::from_secs(10);

/// Even folios are active, odd folios never get past the CAPTCHA.
fn alternating_driver() -> ScriptedDriver {
    ScriptedDriver::new(Arc::new(|folio: &str| {
        let odd = folio
            .chars()
            .last()
            .and_then(|c| c.to_digit(10))
            .is_some_and(|d| d % 2 == 1);
        if odd {
            CAPTCHA_REJECTED_PAGE.to_string()
        } else {
            active_page_for(&ACTIVE_INVOICE, folio)
        }
    }))
}

#[tokio::test]
async fn test_counters_converge_with_mixed_outcomes() {
    let h = harness(alternating_driver(), 4);

    let batch = h
        .state
        .coordinator
        .submit(batch_requests(20), Some(WEBHOOK.to_string()))
        .await
        .unwrap();
    assert_eq!(batch.total, 20);

    let done = wait_for_batch(h.store.as_ref(), batch.batch_id, SETTLE, |b| {
        assert_eq!(b.total, 20);
        assert!(b.resolved() <= b.total);
        b.resolved() == b.total
    })
    .await;

    assert_eq!(done.completed, 10);
    assert_eq!(done.failed, 10);
    assert_eq!(done.pending(), 0);

    let items = h.store.batch_items(batch.batch_id).await.unwrap();
    assert_eq!(items.len(), 20);
    for (i, item) in items.iter().enumerate() {
        assert_eq!(item.batch_index, Some(i as i32));
        let expected = if i % 2 == 0 { JobStatus::Completed } else { JobStatus::Failed };
        assert_eq!(item.status, expected, "item {}", i);
    }

    // Three solves per failing item, one per passing item
    assert_eq!(h.solver.calls.load(Ordering::SeqCst), 10 * 3 + 10);
    assert_eq!(h.driver.opened.load(Ordering::SeqCst), 20);
    assert_eq!(h.driver.live.load(Ordering::SeqCst), 0);

    eventually("batch webhook", SETTLE, || {
        !h.notifier.events_of_type("batch_completed").is_empty()
    })
    .await;
    let events = h.notifier.events_of_type("batch_completed");
    assert_eq!(events.len(), 1);

    let event = &events[0];
    assert_eq!(event["batch_id"], batch.batch_id.to_string());
    assert_eq!(event["total"], 20);
    assert_eq!(event["completed"], 10);
    assert_eq!(event["failed"], 10);

    let results = event["results"].as_array().unwrap();
    assert_eq!(results.len(), 20);
    for (i, result) in results.iter().enumerate() {
        if i % 2 == 0 {
            assert_eq!(result["folio_fiscal"], folio_for(i), "result {}", i);
            assert_eq!(result["valid"], true);
        } else {
            assert!(result.is_null(), "failed item {} should be null", i);
        }
    }

    // Every item also reports on its own, failures included
    eventually("item webhooks", SETTLE, || {
        h.notifier.events_of_type("item_completed").len() == 20
    })
    .await;
    let mut item_events = h.notifier.events_of_type("item_completed");
    assert_eq!(item_events.len(), 20);
    item_events.sort_by_key(|e| e["item_index"].as_i64());
    for (i, event) in item_events.iter().enumerate() {
        assert_eq!(event["batch_id"], batch.batch_id.to_string());
        assert_eq!(event["item_index"], i);
        assert_eq!(event["folio_fiscal"], folio_for(i));
        if i % 2 == 0 {
            assert_eq!(event["status"], "completed");
            assert_eq!(event["result"]["valid"], true);
        } else {
            assert_eq!(event["status"], "failed");
            assert!(event["result"].is_null());
            assert!(event["error"].is_string());
        }
    }
}

#[tokio::test]
async fn test_single_aggregate_event_under_concurrency() {
    let h = harness(ScriptedDriver::echoing_active(), 16);

    let batch = h
        .state
        .coordinator
        .submit(batch_requests(50), Some(WEBHOOK.to_string()))
        .await
        .unwrap();

    wait_for_batch(h.store.as_ref(), batch.batch_id, SETTLE, |b| b.resolved() == b.total).await;
    eventually("batch webhook", SETTLE, || {
        !h.notifier.events_of_type("batch_completed").is_empty()
    })
    .await;

    // A late duplicate completion signal must not send again
    complete_batch(h.store.as_ref(), h.notifier.as_ref(), batch.batch_id)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    eventually("item webhooks", SETTLE, || {
        h.notifier.events_of_type("item_completed").len() == 50
    })
    .await;
    let events = h.notifier.events_of_type("batch_completed");
    assert_eq!(events.len(), 1);
    assert_eq!(h.notifier.events.lock().len(), 51);

    let results = events[0]["results"].as_array().unwrap();
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result["folio_fiscal"], folio_for(i));
    }

    let stored = h.store.get_batch(batch.batch_id).await.unwrap().unwrap();
    assert!(stored.webhook_sent);
    assert!(stored.completed_at.is_some());

    let view = h.state.coordinator.status(batch.batch_id, false).await.unwrap();
    assert_eq!(view.status, BatchStatus::Completed);
    assert_eq!(view.results.map(|r| r.len()), Some(50));
}

#[tokio::test]
async fn test_batch_without_webhook_completes_silently() {
    let h = harness(ScriptedDriver::echoing_active(), 4);

    let batch = h.state.coordinator.submit(batch_requests(5), None).await.unwrap();
    wait_for_batch(h.store.as_ref(), batch.batch_id, SETTLE, |b| b.resolved() == b.total).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.notifier.events.lock().is_empty());
}

#[tokio::test]
async fn test_oversized_batch_is_rejected_without_records() {
    let h = harness(ScriptedDriver::echoing_active(), 4);

    let err = h
        .state
        .coordinator
        .submit(batch_requests(501), Some(WEBHOOK.to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::InvalidBatch(_)));

    assert!(h.store.list_batches(10).await.unwrap().is_empty());
    assert!(h.store.list_items(&ItemFilter::default()).await.unwrap().is_empty());
    assert_eq!(h.driver.opened.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_empty_batch_is_rejected() {
    let h = harness(ScriptedDriver::echoing_active(), 4);

    let err = h.state.coordinator.submit(Vec::new(), None).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::InvalidBatch(_)));
    assert_eq!(h.store.stats().await.unwrap().batches, 0);
}

#[tokio::test]
async fn test_batch_at_limit_is_accepted() {
    let h = harness(ScriptedDriver::echoing_active(), 32);

    let batch = h.state.coordinator.submit(batch_requests(500), None).await.unwrap();
    assert_eq!(batch.total, 500);

    let done =
        wait_for_batch(h.store.as_ref(), batch.batch_id, SETTLE, |b| b.resolved() == b.total)
            .await;
    assert_eq!(done.completed, 500);
}

#[tokio::test]
async fn test_failed_dispatch_still_converges() {
    let h = harness(ScriptedDriver::echoing_active(), 4);
    h.pool.close();

    let batch = h
        .state
        .coordinator
        .submit(batch_requests(3), Some(WEBHOOK.to_string()))
        .await
        .unwrap();

    let stored = h.store.get_batch(batch.batch_id).await.unwrap().unwrap();
    assert_eq!(stored.failed, 3);
    assert_eq!(stored.status(), BatchStatus::Completed);

    let events = h.notifier.events_of_type("batch_completed");
    assert_eq!(events.len(), 1);
    let results = events[0]["results"].as_array().unwrap();
    assert!(results.iter().all(|r| r.is_null()));
    assert_eq!(h.driver.opened.load(Ordering::SeqCst), 0);

    let item_events = h.notifier.events_of_type("item_completed");
    assert_eq!(item_events.len(), 3);
    assert!(item_events.iter().all(|e| e["status"] == "failed"));
}

#[tokio::test]
async fn test_unrecorded_outcome_is_redelivered_and_resumed() {
    let store = Arc::new(FlakyStore::failing_terminal_writes(1));
    let h = harness_with_store(ScriptedDriver::echoing_active(), store.clone(), 2);

    let batch = h
        .state
        .coordinator
        .submit(batch_requests(3), Some(WEBHOOK.to_string()))
        .await
        .unwrap();

    let done = wait_for_batch(h.store.as_ref(), batch.batch_id, SETTLE, |b| {
        b.resolved() == b.total
    })
    .await;
    assert_eq!(done.completed, 3);
    assert_eq!(store.failed_writes.load(Ordering::SeqCst), 1);

    // The unit whose result was lost ran a second time from `processing`
    assert_eq!(h.driver.opened.load(Ordering::SeqCst), 4);
    assert_eq!(h.driver.live.load(Ordering::SeqCst), 0);

    eventually("batch webhook", SETTLE, || {
        !h.notifier.events_of_type("batch_completed").is_empty()
    })
    .await;
    eventually("item webhooks", SETTLE, || {
        h.notifier.events_of_type("item_completed").len() == 3
    })
    .await;
    assert_eq!(h.notifier.events_of_type("batch_completed").len(), 1);

    let items = h.store.batch_items(batch.batch_id).await.unwrap();
    assert!(items.iter().all(|i| i.status == JobStatus::Completed && i.result.is_some()));
}

#[tokio::test]
async fn test_cancel_keeps_resolved_items_and_stops_the_rest() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(ScriptedDriver::echoing_active().gated(gate.clone()), 1);

    let batch = h
        .state
        .coordinator
        .submit(batch_requests(5), Some(WEBHOOK.to_string()))
        .await
        .unwrap();

    // Let exactly two lookups finish; the third blocks reading its page
    gate.add_permits(2);
    wait_for_batch(h.store.as_ref(), batch.batch_id, SETTLE, |b| b.completed == 2).await;
    let store = h.store.clone();
    let batch_id = batch.batch_id;
    let deadline = tokio::time::Instant::now() + SETTLE;
    loop {
        let items = store.batch_items(batch_id).await.unwrap();
        if items.iter().any(|item| item.status == JobStatus::Processing) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "third item never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let view = h.state.coordinator.cancel(batch.batch_id).await.unwrap();
    assert_eq!(view.status, BatchStatus::Cancelled);
    assert_eq!(view.completed, 2);
    assert_eq!(view.pending, 3);
    assert!(view.results.is_none());

    // The blocked session is torn down, not left waiting
    eventually("browser teardown", SETTLE, || h.driver.live.load(Ordering::SeqCst) == 0).await;

    // Releasing the gate must not resurrect anything
    gate.add_permits(10);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stored = h.store.get_batch(batch.batch_id).await.unwrap().unwrap();
    assert_eq!(stored.completed, 2);
    assert_eq!(stored.failed, 0);
    assert!(stored.cancelled_at.is_some());
    assert_eq!(h.driver.opened.load(Ordering::SeqCst), 3);

    let items = h.store.batch_items(batch.batch_id).await.unwrap();
    let count = |status: JobStatus| items.iter().filter(|i| i.status == status).count();
    assert_eq!(count(JobStatus::Completed), 2);
    assert_eq!(count(JobStatus::Processing), 1);
    assert_eq!(count(JobStatus::Pending), 2);
    assert!(items
        .iter()
        .filter(|i| i.status == JobStatus::Completed)
        .all(|i| i.result.is_some()));

    let stats = h.pool.stats().await.unwrap();
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.in_flight, 0);

    let partial = h.state.coordinator.status(batch.batch_id, true).await.unwrap();
    let results = partial.results.unwrap();
    assert_eq!(results.iter().filter(|r| r.is_some()).count(), 2);
    assert!(h.notifier.events_of_type("batch_completed").is_empty());
    assert_eq!(h.notifier.events_of_type("item_completed").len(), 2);
}

#[tokio::test]
async fn test_cancel_unknown_batch_is_not_found() {
    let h = harness(ScriptedDriver::echoing_active(), 1);

    let err = h.state.coordinator.cancel(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::NotFound(_)));
}

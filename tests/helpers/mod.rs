#![allow(dead_code)]

use async_trait::async_trait;
use cfdi_verifier::{
    app_state::AppState,
    db::{MemoryStore, StateStore, Stats, StoreError},
    models::batch::BatchState,
    models::cfdi::{ReferenceTriple, VerificationRequest},
    models::job::{ItemFilter, ItemKey, ItemState, NewItem, Transition, TransitionOutcome},
    services::{
        attempt::{AttemptConfig, Verifier},
        browser::{BrowserDriver, BrowserError, BrowserSession},
        captcha::{CaptchaError, CaptchaSolver},
        dispatch::LocalPool,
        executor::Executor,
        notify::NotificationSink,
        tracker::ItemStateTracker,
    },
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::fixtures::*;

// Smallest valid PNG header; enough for format sniffing.
const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

const UUID_INPUT: &str = "#ctl00_MainContent_TxtUUID";

/// Chooses the page a session shows after submit, given the folio typed in.
pub type Responder = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Browser double whose sessions serve pages from a script.
///
/// Pages queued with [`ScriptedDriver::queue_pages`] are served first, in
/// order, across all sessions; afterwards the responder decides.
pub struct ScriptedDriver {
    responder: Responder,
    queued: Mutex<VecDeque<String>>,
    gate: Option<Arc<Semaphore>>,
    fail_open: bool,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub live: Arc<AtomicUsize>,
}

impl ScriptedDriver {
    pub fn new(responder: Responder) -> Self {
        Self {
            responder,
            queued: Mutex::new(VecDeque::new()),
            gate: None,
            fail_open: false,
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every lookup lands on the same page.
    pub fn always(page: impl Into<String>) -> Self {
        let page = page.into();
        Self::new(Arc::new(move |_: &str| page.clone()))
    }

    /// Each session answers with an active page naming the folio it was
    /// given, so results can be matched back to their items.
    pub fn echoing_active() -> Self {
        Self::new(Arc::new(|folio: &str| active_page_for(&ACTIVE_INVOICE, folio)))
    }

    pub fn queue_pages(self, pages: &[&str]) -> Self {
        self.queued.lock().extend(pages.iter().map(|p| p.to_string()));
        self
    }

    /// Sessions block on reading the result page until a permit is added
    /// to `gate`; each read consumes one permit.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn failing_to_open(mut self) -> Self {
        self.fail_open = true;
        self
    }
}

struct DriverHandle(Arc<ScriptedDriver>);

#[async_trait]
impl BrowserDriver for DriverHandle {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let driver = &self.0;
        if driver.fail_open {
            return Err(BrowserError::Launch("no chrome in test sandbox".to_string()));
        }
        driver.opened.fetch_add(1, Ordering::SeqCst);
        driver.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            driver: driver.clone(),
            folio: String::new(),
        }))
    }
}

pub struct ScriptedSession {
    driver: Arc<ScriptedDriver>,
    folio: String,
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        self.driver.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    async fn navigate(&mut self, _url: &str) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn reload(&mut self) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn fill(&mut self, element: &str, text: &str) -> Result<(), BrowserError> {
        if element == UUID_INPUT {
            self.folio = text.to_string();
        }
        Ok(())
    }

    async fn click(&mut self, _element: &str) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn upload(
        &mut self,
        _element: &str,
        _file_name: &str,
        _contents: &[u8],
    ) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn screenshot(&mut self, _element: &str) -> Result<Vec<u8>, BrowserError> {
        Ok(PNG.to_vec())
    }

    async fn content(&mut self) -> Result<String, BrowserError> {
        if let Some(gate) = &self.driver.gate {
            gate.acquire()
                .await
                .map_err(|e| BrowserError::Command(e.to_string()))?
                .forget();
        }
        if let Some(page) = self.driver.queued.lock().pop_front() {
            return Ok(page);
        }
        Ok((self.driver.responder)(&self.folio))
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        self.driver.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Answers every CAPTCHA with the same text and counts the calls.
#[derive(Default)]
pub struct ScriptedSolver {
    pub calls: AtomicUsize,
}

#[async_trait]
impl CaptchaSolver for ScriptedSolver {
    async fn solve(&self, _image: &[u8]) -> Result<String, CaptchaError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("7hx2k".to_string())
    }
}

/// Keeps every delivered event in memory.
#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingNotifier {
    pub fn events_of_type(&self, kind: &str) -> Vec<serde_json::Value> {
        self.events
            .lock()
            .iter()
            .filter(|(_, payload)| payload["type"] == kind)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn deliver(&self, url: &str, payload: serde_json::Value) {
        self.events.lock().push((url.to_string(), payload));
    }
}

pub fn verifier(driver: Arc<ScriptedDriver>, solver: Arc<ScriptedSolver>) -> Verifier {
    let config = AttemptConfig {
        settle: Duration::ZERO,
        mode_switch: Duration::ZERO,
        ..Default::default()
    };
    Verifier::new(Arc::new(DriverHandle(driver)), solver, config)
}

/// In-process service: memory store, local pool, recording notifier.
pub struct Harness {
    pub state: AppState,
    pub store: Arc<dyn StateStore>,
    pub driver: Arc<ScriptedDriver>,
    pub solver: Arc<ScriptedSolver>,
    pub notifier: Arc<RecordingNotifier>,
    pub pool: Arc<LocalPool>,
}

pub fn harness(driver: ScriptedDriver, concurrency: usize) -> Harness {
    harness_with_store(driver, Arc::new(MemoryStore::new()), concurrency)
}

pub fn harness_with_store(
    driver: ScriptedDriver,
    store: Arc<dyn StateStore>,
    concurrency: usize,
) -> Harness {
    let driver = Arc::new(driver);
    let solver = Arc::new(ScriptedSolver::default());
    let notifier = Arc::new(RecordingNotifier::default());

    let executor = Arc::new(Executor::new(
        ItemStateTracker::new(store.clone()),
        Arc::new(verifier(driver.clone(), solver.clone())),
        notifier.clone(),
    ));
    let pool = Arc::new(LocalPool::new(executor.clone(), concurrency));
    let state = AppState::new(store.clone(), executor, pool.clone(), notifier.clone(), 500, 3);

    Harness { state, store, driver, solver, notifier, pool }
}

pub fn reference(folio: &str) -> VerificationRequest {
    VerificationRequest::ByReference(ReferenceTriple {
        uuid: folio.to_string(),
        issuer_rfc: ACTIVE_INVOICE.issuer_rfc.to_string(),
        receiver_rfc: ACTIVE_INVOICE.receiver_rfc.to_string(),
    })
}

pub fn batch_requests(count: usize) -> Vec<VerificationRequest> {
    (0..count).map(|i| reference(&folio_for(i))).collect()
}

/// Poll the store until `done` holds for the batch, or panic after `timeout`.
pub async fn wait_for_batch(
    store: &dyn StateStore,
    batch_id: Uuid,
    timeout: Duration,
    done: impl Fn(&BatchState) -> bool,
) -> BatchState {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let batch = store
            .get_batch(batch_id)
            .await
            .expect("store read failed")
            .expect("batch missing");
        if done(&batch) {
            return batch;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("batch {} did not settle within {:?}: {:?}", batch_id, timeout, batch);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll a running server's job endpoint until it reaches a terminal status.
pub async fn poll_job_status(
    client: &reqwest::Client,
    base_url: &str,
    job_id: &str,
    max_attempts: u32,
) -> Result<serde_json::Value, String> {
    for attempt in 1..=max_attempts {
        let response = client
            .get(format!("{}/api/v1/jobs/{}", base_url, job_id))
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("Invalid JSON: {}", e))?;

        match body["status"].as_str() {
            Some("completed") | Some("failed") => return Ok(body),
            Some(status) => println!("  Attempt {}: status={}", attempt, status),
            None => return Err(format!("Missing status in {}", body)),
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    Err(format!("Job {} did not finish after {} polls", job_id, max_attempts))
}

/// Poll `condition` every 10ms, panicking with `what` after `timeout`.
pub async fn eventually(what: &str, timeout: Duration, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// In-memory store that fails the next `n` terminal transitions, as a
/// database outage between verifying and recording would.
pub struct FlakyStore {
    inner: MemoryStore,
    failures_left: AtomicUsize,
    pub failed_writes: AtomicUsize,
}

impl FlakyStore {
    pub fn failing_terminal_writes(n: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures_left: AtomicUsize::new(n),
            failed_writes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn create_item(&self, item: NewItem) -> Result<ItemState, StoreError> {
        self.inner.create_item(item).await
    }

    async fn create_batch(
        &self,
        batch_id: Uuid,
        items: &[NewItem],
        webhook_url: Option<&str>,
    ) -> Result<BatchState, StoreError> {
        self.inner.create_batch(batch_id, items, webhook_url).await
    }

    async fn transition(
        &self,
        key: ItemKey,
        transition: Transition,
    ) -> Result<TransitionOutcome, StoreError> {
        if transition.to.is_terminal()
            && self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            self.failed_writes.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.transition(key, transition).await
    }

    async fn get_item(&self, job_id: Uuid) -> Result<Option<ItemState>, StoreError> {
        self.inner.get_item(job_id).await
    }

    async fn list_items(&self, filter: &ItemFilter) -> Result<Vec<ItemState>, StoreError> {
        self.inner.list_items(filter).await
    }

    async fn delete_item(&self, job_id: Uuid) -> Result<bool, StoreError> {
        self.inner.delete_item(job_id).await
    }

    async fn mark_item_notified(&self, job_id: Uuid) -> Result<(), StoreError> {
        self.inner.mark_item_notified(job_id).await
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<BatchState>, StoreError> {
        self.inner.get_batch(batch_id).await
    }

    async fn batch_items(&self, batch_id: Uuid) -> Result<Vec<ItemState>, StoreError> {
        self.inner.batch_items(batch_id).await
    }

    async fn list_batches(&self, limit: i64) -> Result<Vec<BatchState>, StoreError> {
        self.inner.list_batches(limit).await
    }

    async fn mark_batch_notified(&self, batch_id: Uuid) -> Result<bool, StoreError> {
        self.inner.mark_batch_notified(batch_id).await
    }

    async fn cancel_batch(&self, batch_id: Uuid) -> Result<Option<BatchState>, StoreError> {
        self.inner.cancel_batch(batch_id).await
    }

    async fn stats(&self) -> Result<Stats, StoreError> {
        self.inner.stats().await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.inner.health_check().await
    }
}

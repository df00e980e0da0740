use std::path::PathBuf;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::{self, MemoryStore, PgStore, StateStore};
use crate::services::{
    attempt::{AttemptConfig, PortalLayout, Verifier},
    browser::{ChromeDriver, ChromeOptions},
    captcha::{CaptchaError, TwoCaptchaClient},
    coordinator::BatchCoordinator,
    dispatch::{Dispatcher, LocalPool},
    encryption::{EncryptionError, EncryptionService},
    executor::Executor,
    notify::{NotificationSink, WebhookNotifier},
    queue::{JobQueue, QueueError},
    tracker::ItemStateTracker,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub executor: Arc<Executor>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub coordinator: Arc<BatchCoordinator>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn StateStore>,
        executor: Arc<Executor>,
        dispatcher: Arc<dyn Dispatcher>,
        notifier: Arc<dyn NotificationSink>,
        max_batch_size: usize,
        max_retries: u32,
    ) -> Self {
        let coordinator = BatchCoordinator::new(
            ItemStateTracker::new(store.clone()),
            dispatcher.clone(),
            notifier,
            max_batch_size,
            max_retries,
        );
        Self {
            store,
            executor,
            dispatcher,
            coordinator: Arc::new(coordinator),
        }
    }

    /// Wire the API server from configuration: Postgres or in-process
    /// state, Redis or in-process execution.
    pub async fn from_config(config: &AppConfig) -> Result<Self, StartupError> {
        let store = connect_store(config).await?;
        let notifier: Arc<dyn NotificationSink> =
            Arc::new(WebhookNotifier::new(config.webhook_timeout())?);
        let executor = build_executor(config, store.clone(), notifier.clone())?;

        let dispatcher: Arc<dyn Dispatcher> = match connect_queue(config)? {
            Some(queue) => {
                tracing::info!("Dispatching work units to Redis");
                Arc::new(queue)
            }
            None => {
                tracing::info!(
                    concurrency = config.worker_concurrency,
                    "REDIS_URL not set, running work units in process"
                );
                Arc::new(LocalPool::new(executor.clone(), config.worker_concurrency))
            }
        };

        Ok(Self::new(
            store,
            executor,
            dispatcher,
            notifier,
            config.max_batch_size,
            config.max_retries,
        ))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("CAPTCHA client error: {0}")]
    Captcha(#[from] CaptchaError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Queue key error: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("QUEUE_KEY is required when REDIS_URL is set")]
    MissingQueueKey,

    #[error("REDIS_URL requires DATABASE_URL; workers cannot share in-process state")]
    QueueWithoutDatabase,
}

/// Postgres when `DATABASE_URL` is set, otherwise the in-process store.
pub async fn connect_store(config: &AppConfig) -> Result<Arc<dyn StateStore>, StartupError> {
    match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL database");
            let pool = db::init_pool(url).await?;

            tracing::info!("Running database migrations");
            db::run_migrations(&pool).await?;

            Ok(Arc::new(PgStore::new(pool)))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, keeping state in process");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// The Redis queue, when `REDIS_URL` is set.
pub fn connect_queue(config: &AppConfig) -> Result<Option<JobQueue>, StartupError> {
    let Some(redis_url) = &config.redis_url else {
        return Ok(None);
    };
    if config.database_url.is_none() {
        return Err(StartupError::QueueWithoutDatabase);
    }
    let key = config.queue_key.as_deref().ok_or(StartupError::MissingQueueKey)?;

    tracing::info!("Connecting to Redis job queue");
    let sealer = EncryptionService::new(key)?;
    Ok(Some(JobQueue::new(redis_url, sealer)?))
}

/// Verifier backed by Chromium and 2Captcha, wrapped in an executor.
pub fn build_executor(
    config: &AppConfig,
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn NotificationSink>,
) -> Result<Arc<Executor>, StartupError> {
    let driver = ChromeDriver::new(ChromeOptions {
        executable: config.chrome_executable.as_ref().map(PathBuf::from),
        headless: config.headless,
    });
    let solver = TwoCaptchaClient::new(
        &config.twocaptcha_api_key,
        config.captcha_poll_interval(),
        config.captcha_timeout(),
    )?;
    let attempt = AttemptConfig {
        layout: PortalLayout {
            url: config.portal_url.clone(),
            ..Default::default()
        },
        settle: config.settle(),
        ..Default::default()
    };

    let verifier = Verifier::new(Arc::new(driver), Arc::new(solver), attempt);
    Ok(Arc::new(Executor::new(
        ItemStateTracker::new(store),
        Arc::new(verifier),
        notifier,
    )))
}

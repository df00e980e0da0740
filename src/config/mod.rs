use serde::Deserialize;
use std::time::Duration;

use crate::services::attempt::SAT_PORTAL_URL;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by the worker.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string. Without it, state is kept in process.
    pub database_url: Option<String>,

    /// Redis connection string. Without it, units run on an in-process pool.
    pub redis_url: Option<String>,

    /// AES-256-GCM key for queue payloads (base64-encoded, 32 bytes).
    /// Required with `redis_url`.
    pub queue_key: Option<String>,

    /// 2Captcha API key
    pub twocaptcha_api_key: String,

    #[serde(default = "default_portal_url")]
    pub portal_url: String,

    /// Chromium binary; auto-detected when unset
    pub chrome_executable: Option<String>,

    #[serde(default = "default_true")]
    pub headless: bool,

    /// Default attempt budget per verification
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Wait after submitting the form, in milliseconds
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default = "default_captcha_poll_secs")]
    pub captcha_poll_secs: u64,

    #[serde(default = "default_captcha_timeout_secs")]
    pub captcha_timeout_secs: u64,

    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,

    /// How often the worker checks whether its running units were revoked
    #[serde(default = "default_revocation_poll_ms")]
    pub revocation_poll_ms: u64,

    /// A queued unit whose worker stops renewing its lease for this long is
    /// handed to another worker
    #[serde(default = "default_processing_lease_secs")]
    pub processing_lease_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_portal_url() -> String {
    SAT_PORTAL_URL.to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_settle_ms() -> u64 {
    2000
}

fn default_worker_concurrency() -> usize {
    3
}

fn default_max_batch_size() -> usize {
    500
}

fn default_captcha_poll_secs() -> u64 {
    5
}

fn default_captcha_timeout_secs() -> u64 {
    120
}

fn default_webhook_timeout_secs() -> u64 {
    30
}

fn default_revocation_poll_ms() -> u64 {
    2000
}

fn default_processing_lease_secs() -> u64 {
    300
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn captcha_poll_interval(&self) -> Duration {
        Duration::from_secs(self.captcha_poll_secs)
    }

    pub fn captcha_timeout(&self) -> Duration {
        Duration::from_secs(self.captcha_timeout_secs)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }

    pub fn revocation_poll(&self) -> Duration {
        Duration::from_millis(self.revocation_poll_ms)
    }

    pub fn processing_lease(&self) -> Duration {
        Duration::from_secs(self.processing_lease_secs)
    }
}

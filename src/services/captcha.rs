use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Turns a CAPTCHA image into its text.
///
/// Implementations do not retry; the verification attempt owns the retry budget.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    async fn solve(&self, image: &[u8]) -> Result<String, CaptchaError>;
}

const NOT_READY: &str = "CAPCHA_NOT_READY";

/// Client for the 2Captcha image recognition API.
pub struct TwoCaptchaClient {
    http: Client,
    api_key: String,
    base_url: String,
    poll_interval: Duration,
    timeout: Duration,
}

/// `in.php` / `res.php` response envelope.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: u8,
    request: String,
}

impl TwoCaptchaClient {
    pub fn new(api_key: &str, poll_interval: Duration, timeout: Duration) -> Result<Self, CaptchaError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            api_key: api_key.to_string(),
            base_url: "https://2captcha.com".to_string(),
            poll_interval,
            timeout,
        })
    }

    async fn submit(&self, image: &[u8]) -> Result<String, CaptchaError> {
        let body = base64::engine::general_purpose::STANDARD.encode(image);
        let params = [
            ("key", self.api_key.as_str()),
            ("method", "base64"),
            ("body", body.as_str()),
            ("json", "1"),
        ];

        let response: ApiResponse = self
            .http
            .post(format!("{}/in.php", self.base_url))
            .form(&params)
            .send()
            .await?
            .json()
            .await?;

        accepted(response)
    }

    async fn poll(&self, captcha_id: &str) -> Result<Option<String>, CaptchaError> {
        let response: ApiResponse = self
            .http
            .get(format!("{}/res.php", self.base_url))
            .query(&[
                ("key", self.api_key.as_str()),
                ("action", "get"),
                ("id", captcha_id),
                ("json", "1"),
            ])
            .send()
            .await?
            .json()
            .await?;

        if response.status == 0 && response.request == NOT_READY {
            return Ok(None);
        }
        accepted(response).map(Some)
    }
}

fn accepted(response: ApiResponse) -> Result<String, CaptchaError> {
    if response.status == 1 {
        Ok(response.request)
    } else {
        Err(CaptchaError::Rejected(response.request))
    }
}

#[async_trait]
impl CaptchaSolver for TwoCaptchaClient {
    async fn solve(&self, image: &[u8]) -> Result<String, CaptchaError> {
        let captcha_id = self.submit(image).await?;
        tracing::debug!(captcha_id = %captcha_id, "CAPTCHA submitted to 2Captcha");

        let deadline = Instant::now() + self.timeout;
        loop {
            sleep(self.poll_interval).await;
            if let Some(text) = self.poll(&captcha_id).await? {
                tracing::debug!(captcha_id = %captcha_id, "CAPTCHA solved");
                return Ok(text);
            }
            if Instant::now() >= deadline {
                return Err(CaptchaError::Timeout(self.timeout));
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptchaError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("2Captcha rejected the request: {0}")]
    Rejected(String),

    #[error("CAPTCHA not solved within {0:?}")]
    Timeout(Duration),
}

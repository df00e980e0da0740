//! One verification against the SAT portal.
//!
//! A [`Verifier`] owns the retry loop for a single request: it opens one
//! browser session, walks the form, hands the CAPTCHA to the solver and
//! classifies whatever the portal renders. Concurrency between requests is
//! the dispatcher's job; nothing here is shared across verifications.

use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use crate::models::cfdi::{ReferenceTriple, VerificationRequest, VerificationResult};
use crate::services::browser::{BrowserDriver, BrowserError, BrowserSession};
use crate::services::captcha::{CaptchaError, CaptchaSolver};
use crate::services::extractor::{extract, ACTIVE_MARKER, CANCELLED_MARKER};

pub const SAT_PORTAL_URL: &str = "https://verificacfdi.facturaelectronica.sat.gob.mx/";

const REJECTED_MARKER: &str = "incorrecto";
const UPLOAD_FILE_NAME: &str = "cfdi.xml";

#[derive(Debug, thiserror::Error)]
pub enum VerificationFailure {
    #[error("Browser session could not be opened: {0}")]
    Session(#[source] BrowserError),

    #[error("CAPTCHA rejected on all {attempts} attempts")]
    CaptchaExhausted { attempts: u32 },

    #[error("Verification failed after {attempts} attempts: {message}")]
    Transient { attempts: u32, message: String },
}

/// Faults inside a single attempt. All of them are retried.
#[derive(Debug, thiserror::Error)]
enum AttemptFault {
    #[error(transparent)]
    Browser(#[from] BrowserError),

    #[error(transparent)]
    Captcha(#[from] CaptchaError),

    #[error("CAPTCHA element did not render as an image ({0} bytes)")]
    NotAnImage(usize),
}

/// Element references on the portal. CSS selectors, or XPath when they
/// start with `//`.
#[derive(Debug, Clone)]
pub struct PortalLayout {
    pub url: String,
    pub uuid_input: String,
    pub issuer_input: String,
    pub receiver_input: String,
    pub captcha_image: String,
    pub captcha_input: String,
    pub xml_mode: String,
    pub file_input: String,
    pub xml_captcha_image: String,
    pub xml_captcha_input: String,
    pub submit: String,
}

impl Default for PortalLayout {
    fn default() -> Self {
        Self {
            url: SAT_PORTAL_URL.to_string(),
            uuid_input: "#ctl00_MainContent_TxtUUID".to_string(),
            issuer_input: "#ctl00_MainContent_TxtRfcEmisor".to_string(),
            receiver_input: "#ctl00_MainContent_TxtRfcReceptor".to_string(),
            captcha_image: "#ctl00_MainContent_ImgCaptcha".to_string(),
            captcha_input: "#ctl00_MainContent_TxtCaptchaNumbers".to_string(),
            xml_mode: "//label[contains(., 'Consulta por archivo XML')]".to_string(),
            file_input: "input[type='file']".to_string(),
            xml_captcha_image: "#ctl00_MainContent_ImgCaptchaXml".to_string(),
            xml_captcha_input: "#ctl00_MainContent_TxtCaptchaNumbersXml".to_string(),
            submit: "//input[@value='Verificar CFDI'] | //button[contains(., 'Verificar CFDI')]"
                .to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttemptConfig {
    pub layout: PortalLayout,
    /// Wait after submit for the verdict to render.
    pub settle: Duration,
    /// Wait after switching the form into XML mode.
    pub mode_switch: Duration,
}

impl Default for AttemptConfig {
    fn default() -> Self {
        Self {
            layout: PortalLayout::default(),
            settle: Duration::from_millis(2000),
            mode_switch: Duration::from_millis(500),
        }
    }
}

/// Where the next attempt picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resume {
    /// Fresh entry page, refill the form.
    Navigate,
    /// Same form after a rejected solve; only the CAPTCHA is redone.
    Reload,
}

enum PageClass {
    Terminal(String),
    CaptchaRejected,
}

fn classify(content: String) -> PageClass {
    if content.contains(ACTIVE_MARKER) || content.contains(CANCELLED_MARKER) {
        PageClass::Terminal(content)
    } else if content.to_lowercase().contains(REJECTED_MARKER) {
        PageClass::CaptchaRejected
    } else {
        PageClass::Terminal(content)
    }
}

pub struct Verifier {
    driver: Arc<dyn BrowserDriver>,
    solver: Arc<dyn CaptchaSolver>,
    config: AttemptConfig,
}

impl Verifier {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        solver: Arc<dyn CaptchaSolver>,
        config: AttemptConfig,
    ) -> Self {
        Self { driver, solver, config }
    }

    /// Verify one CFDI, making at most `max_retries` attempts.
    ///
    /// Exactly one browser session is opened, and it is closed on every
    /// return path. Dropping the future mid-flight drops the session, which
    /// kills the browser.
    pub async fn verify(
        &self,
        request: &VerificationRequest,
        max_retries: u32,
    ) -> Result<VerificationResult, VerificationFailure> {
        let started = Instant::now();
        let method = request.method();

        let mut session = self
            .driver
            .open_session()
            .await
            .map_err(VerificationFailure::Session)?;

        let outcome = self.run(session.as_mut(), request, max_retries.max(1)).await;

        if let Err(e) = session.close().await {
            tracing::warn!(error = %e, "Failed to close browser session");
        }

        let result = match &outcome {
            Ok(_) => "ok",
            Err(VerificationFailure::CaptchaExhausted { .. }) => "captcha_exhausted",
            Err(_) => "error",
        };
        histogram!("cfdi_verification_seconds", "method" => method.to_string(), "result" => result)
            .record(started.elapsed().as_secs_f64());

        outcome
    }

    async fn run(
        &self,
        session: &mut dyn BrowserSession,
        request: &VerificationRequest,
        max_retries: u32,
    ) -> Result<VerificationResult, VerificationFailure> {
        let method = request.method();
        let mut resume = Resume::Navigate;

        for attempt in 1..=max_retries {
            counter!("cfdi_verification_attempts_total", "method" => method.to_string())
                .increment(1);
            tracing::info!(attempt, max_retries, %method, "Verification attempt");

            match self.attempt(session, request, resume).await {
                Ok(PageClass::Terminal(content)) => {
                    let result = extract(&content, method);
                    tracing::info!(attempt, valid = result.valid, "Verification finished");
                    return Ok(result);
                }
                Ok(PageClass::CaptchaRejected) => {
                    counter!("cfdi_captcha_rejections_total").increment(1);
                    tracing::warn!(attempt, "CAPTCHA rejected by portal");
                    if attempt == max_retries {
                        return Err(VerificationFailure::CaptchaExhausted { attempts: attempt });
                    }
                    resume = Resume::Reload;
                }
                Err(fault) => {
                    tracing::warn!(attempt, error = %fault, "Verification attempt failed");
                    if attempt == max_retries {
                        return Err(VerificationFailure::Transient {
                            attempts: attempt,
                            message: fault.to_string(),
                        });
                    }
                    resume = Resume::Navigate;
                }
            }
        }

        // max_retries >= 1, so the loop always returns
        Err(VerificationFailure::Transient {
            attempts: max_retries,
            message: "no attempts made".to_string(),
        })
    }

    async fn attempt(
        &self,
        session: &mut dyn BrowserSession,
        request: &VerificationRequest,
        resume: Resume,
    ) -> Result<PageClass, AttemptFault> {
        let layout = &self.config.layout;

        match resume {
            Resume::Navigate => {
                session.navigate(&layout.url).await?;
                self.fill_method_fields(session, request).await?;
            }
            Resume::Reload => session.reload().await?,
        }

        let (image_ref, input_ref) = match request {
            VerificationRequest::ByReference(_) => (&layout.captcha_image, &layout.captcha_input),
            VerificationRequest::ByDocument { .. } => {
                (&layout.xml_captcha_image, &layout.xml_captcha_input)
            }
        };

        let image = session.screenshot(image_ref).await?;
        if image::guess_format(&image).is_err() {
            return Err(AttemptFault::NotAnImage(image.len()));
        }
        let answer = self.solver.solve(&image).await?;
        tracing::debug!(answer = %answer, "CAPTCHA answer received");
        session.fill(input_ref, answer.trim()).await?;

        session.click(&layout.submit).await?;
        sleep(self.config.settle).await;

        Ok(classify(session.content().await?))
    }

    async fn fill_method_fields(
        &self,
        session: &mut dyn BrowserSession,
        request: &VerificationRequest,
    ) -> Result<(), BrowserError> {
        let layout = &self.config.layout;
        match request {
            VerificationRequest::ByReference(ReferenceTriple {
                uuid,
                issuer_rfc,
                receiver_rfc,
            }) => {
                session.fill(&layout.uuid_input, uuid).await?;
                session.fill(&layout.issuer_input, issuer_rfc).await?;
                session.fill(&layout.receiver_input, receiver_rfc).await?;
            }
            VerificationRequest::ByDocument { xml } => {
                session.click(&layout.xml_mode).await?;
                sleep(self.config.mode_switch).await;
                session
                    .upload(&layout.file_input, UPLOAD_FILE_NAME, xml.as_bytes())
                    .await?;
            }
        }
        Ok(())
    }
}

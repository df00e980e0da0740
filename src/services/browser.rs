//! Browser automation adapter.
//!
//! [`BrowserDriver`] opens one isolated [`BrowserSession`] per verification.
//! The production driver launches a headless Chromium through `chromiumoxide`;
//! element references are CSS selectors, or XPath expressions when they start
//! with `//`.

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::dom::SetFileInputFilesParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::element::Element;
use chromiumoxide::error::CdpError;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("Failed to launch browser: {0}")]
    Launch(String),

    #[error("Browser protocol error: {0}")]
    Cdp(#[from] CdpError),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Invalid protocol command: {0}")]
    Command(String),

    #[error("File staging failed: {0}")]
    Io(#[from] std::io::Error),
}

/// One page in one browser, owned by a single verification.
#[async_trait]
pub trait BrowserSession: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError>;

    async fn reload(&mut self) -> Result<(), BrowserError>;

    /// Replace the value of an input with `text`.
    async fn fill(&mut self, element: &str, text: &str) -> Result<(), BrowserError>;

    async fn click(&mut self, element: &str) -> Result<(), BrowserError>;

    /// Attach `contents` to a file input as if the user had picked `file_name`.
    async fn upload(
        &mut self,
        element: &str,
        file_name: &str,
        contents: &[u8],
    ) -> Result<(), BrowserError>;

    async fn screenshot(&mut self, element: &str) -> Result<Vec<u8>, BrowserError>;

    /// Full rendered markup of the current page.
    async fn content(&mut self) -> Result<String, BrowserError>;

    async fn close(&mut self) -> Result<(), BrowserError>;
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>, BrowserError>;
}

/// Launch options for [`ChromeDriver`].
#[derive(Debug, Clone)]
pub struct ChromeOptions {
    pub executable: Option<PathBuf>,
    pub headless: bool,
}

impl Default for ChromeOptions {
    fn default() -> Self {
        Self { executable: None, headless: true }
    }
}

/// Launches a fresh Chromium process per session.
pub struct ChromeDriver {
    options: ChromeOptions,
}

impl ChromeDriver {
    pub fn new(options: ChromeOptions) -> Self {
        Self { options }
    }

    fn config(&self) -> Result<BrowserConfig, BrowserError> {
        let mut builder = BrowserConfig::builder();
        builder = if self.options.headless {
            builder.new_headless_mode()
        } else {
            builder.with_head()
        };
        if let Some(path) = &self.options.executable {
            builder = builder.chrome_executable(path);
        }
        builder
            .args(vec![
                "--disable-gpu",
                "--no-sandbox",
                "--disable-dev-shm-usage",
                "--remote-debugging-port=0",
            ])
            .build()
            .map_err(BrowserError::Launch)
    }
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let config = self.config()?;

        let (browser, mut handler) = Browser::launch(config).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to launch Chromium");
            BrowserError::Launch(e.to_string())
        })?;

        // Drive CDP events in the background for the lifetime of the session
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        // Give the browser a moment to settle its initial target state
        sleep(Duration::from_millis(300)).await;

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                handler.abort();
                return Err(e.into());
            }
        };

        tracing::debug!("Browser session opened");

        Ok(Box::new(ChromeSession {
            browser,
            page,
            handler: Some(handler),
            staged: Vec::new(),
        }))
    }
}

pub struct ChromeSession {
    browser: Browser,
    page: Page,
    handler: Option<JoinHandle<()>>,
    /// Uploaded files; Chromium reads them at submit time.
    staged: Vec<tempfile::TempDir>,
}

impl ChromeSession {
    async fn find(&self, element: &str) -> Result<Element, BrowserError> {
        let found = if element.starts_with("//") {
            self.page.find_xpath(element).await
        } else {
            self.page.find_element(element).await
        };
        found.map_err(|e| {
            tracing::debug!(element, error = %e, "Element lookup failed");
            BrowserError::ElementNotFound(element.to_string())
        })
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        self.page.goto(url).await?;
        Ok(())
    }

    async fn reload(&mut self) -> Result<(), BrowserError> {
        self.page.reload().await?;
        Ok(())
    }

    async fn fill(&mut self, element: &str, text: &str) -> Result<(), BrowserError> {
        let el = self.find(element).await?;
        el.call_js_fn("function() { this.value = ''; }", false).await?;
        el.click().await?;
        el.type_str(text).await?;
        Ok(())
    }

    async fn click(&mut self, element: &str) -> Result<(), BrowserError> {
        self.find(element).await?.click().await?;
        Ok(())
    }

    async fn upload(
        &mut self,
        element: &str,
        file_name: &str,
        contents: &[u8],
    ) -> Result<(), BrowserError> {
        let el = self.find(element).await?;

        // The portal reads the file name, so stage it under its own name
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(file_name);
        std::fs::File::create(&path)?.write_all(contents)?;

        let params = SetFileInputFilesParams::builder()
            .file(path.to_string_lossy().into_owned())
            .backend_node_id(el.backend_node_id)
            .build()
            .map_err(BrowserError::Command)?;
        self.page.execute(params).await?;

        self.staged.push(dir);
        Ok(())
    }

    async fn screenshot(&mut self, element: &str) -> Result<Vec<u8>, BrowserError> {
        let el = self.find(element).await?;
        Ok(el.screenshot(CaptureScreenshotFormat::Png).await?)
    }

    async fn content(&mut self) -> Result<String, BrowserError> {
        Ok(self.page.content().await?)
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        let closed = self.browser.close().await;
        if closed.is_ok() {
            let _ = self.browser.wait().await;
        }
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }
        self.staged.clear();
        tracing::debug!("Browser session closed");
        closed.map(|_| ()).map_err(BrowserError::from)
    }
}

impl Drop for ChromeSession {
    // Reached without close() when a verification is cancelled mid-flight;
    // dropping `Browser` kills the Chromium child process.
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }
    }
}

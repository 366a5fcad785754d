//! Browser capability used by the fetcher
//!
//! The fetcher only needs three things from a browser: open a URL, wait for a
//! selector to appear, and read the page's markup. [`HttpBrowser`] serves
//! static HTML over reqwest; [`ChromiumBrowser`] drives headless Chrome via
//! chromiumoxide when the `js-rendering` feature is enabled.

use crate::config::FetchConfig;
use crate::error::FetchError;
use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::debug;

/// An opened page
#[async_trait]
pub trait Page: Send {
    /// Wait until `selector` matches; `Ok(false)` if it never appeared
    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<bool, FetchError>;

    /// Current markup of the page
    async fn page_content(&mut self) -> Result<String, FetchError>;

    /// HTTP status of the main document, when known
    fn status(&self) -> Option<u16>;

    async fn close(self: Box<Self>);
}

/// Something that can open pages
#[async_trait]
pub trait Browser: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<Box<dyn Page>, FetchError>;

    fn name(&self) -> &'static str;
}

/// Plain HTTP browser: no script execution
pub struct HttpBrowser {
    client: Client,
}

impl HttpBrowser {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| FetchError::NavigationFailed {
                url: String::new(),
                reason: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }
}

fn classify_reqwest(url: &str, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
            timeout_ms: 0,
        }
    } else {
        FetchError::NavigationFailed {
            url: url.to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl Browser for HttpBrowser {
    async fn navigate(&self, url: &str) -> Result<Box<dyn Page>, FetchError> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_reqwest(url, e))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| classify_reqwest(url, e))?;

        Ok(Box::new(StaticPage { status, body }))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// A page whose markup is fixed at load time
struct StaticPage {
    status: u16,
    body: String,
}

#[async_trait]
impl Page for StaticPage {
    async fn wait_for(&mut self, selector: &str, _timeout: Duration) -> Result<bool, FetchError> {
        let selector = Selector::parse(selector).map_err(|e| FetchError::NavigationFailed {
            url: String::new(),
            reason: format!("invalid wait selector '{}': {}", selector, e),
        })?;
        let document = Html::parse_document(&self.body);
        let found = document.select(&selector).next().is_some();
        Ok(found)
    }

    async fn page_content(&mut self) -> Result<String, FetchError> {
        Ok(self.body.clone())
    }

    fn status(&self) -> Option<u16> {
        Some(self.status)
    }

    async fn close(self: Box<Self>) {}
}

#[cfg(feature = "js-rendering")]
mod chromium {
    use super::*;
    use chromiumoxide::browser::{Browser as CdpBrowser, BrowserConfig};
    use futures::StreamExt;
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tokio::time::timeout;
    use tracing::{info, warn};

    /// Headless Chrome browser
    pub struct ChromiumBrowser {
        page_load_timeout: Duration,
        render_wait: Duration,
        sandbox: bool,
        browser: Arc<Mutex<Option<CdpBrowser>>>,
        handler_handle: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
    }

    impl ChromiumBrowser {
        pub fn new(config: &FetchConfig) -> Self {
            Self {
                page_load_timeout: Duration::from_secs(config.timeout_secs),
                render_wait: Duration::from_millis(config.render_wait_ms),
                sandbox: !config.js_no_sandbox,
                browser: Arc::new(Mutex::new(None)),
                handler_handle: Arc::new(Mutex::new(None)),
            }
        }

        /// Launch Chrome on first use
        async fn ensure_browser(&self) -> Result<(), FetchError> {
            let mut guard = self.browser.lock().await;
            if guard.is_some() {
                return Ok(());
            }

            info!("Launching headless Chrome browser...");
            let launch_err = |reason: String| FetchError::NavigationFailed {
                url: String::new(),
                reason,
            };

            let mut builder = BrowserConfig::builder();
            if !self.sandbox {
                builder = builder.no_sandbox();
            }
            builder = builder
                .arg("--disable-gpu")
                .arg("--disable-dev-shm-usage")
                .arg("--no-first-run")
                .arg("--disable-extensions");

            let config = builder
                .build()
                .map_err(|e| launch_err(format!("Failed to build browser config: {}", e)))?;

            let (browser, mut handler) = CdpBrowser::launch(config)
                .await
                .map_err(|e| launch_err(format!("Failed to launch browser: {}", e)))?;

            let handle = tokio::spawn(async move {
                while let Some(result) = handler.next().await {
                    if result.is_err() {
                        break;
                    }
                }
            });

            *guard = Some(browser);
            *self.handler_handle.lock().await = Some(handle);
            Ok(())
        }

        pub async fn close(&self) {
            if let Some(mut browser) = self.browser.lock().await.take() {
                if let Err(e) = browser.close().await {
                    warn!("Failed to close browser: {}", e);
                }
            }
            if let Some(handle) = self.handler_handle.lock().await.take() {
                handle.abort();
            }
        }
    }

    #[async_trait]
    impl Browser for ChromiumBrowser {
        async fn navigate(&self, url: &str) -> Result<Box<dyn Page>, FetchError> {
            self.ensure_browser().await?;

            let guard = self.browser.lock().await;
            let browser = guard.as_ref().ok_or_else(|| FetchError::NavigationFailed {
                url: url.to_string(),
                reason: "browser not initialized".to_string(),
            })?;

            let page = browser
                .new_page(url)
                .await
                .map_err(|e| FetchError::NavigationFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
            drop(guard);

            timeout(self.page_load_timeout, page.wait_for_navigation())
                .await
                .map_err(|_| FetchError::Timeout {
                    url: url.to_string(),
                    timeout_ms: self.page_load_timeout.as_millis() as u64,
                })?
                .map_err(|e| FetchError::NavigationFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;

            if !self.render_wait.is_zero() {
                tokio::time::sleep(self.render_wait).await;
            }

            Ok(Box::new(ChromiumPage {
                url: url.to_string(),
                page,
            }))
        }

        fn name(&self) -> &'static str {
            "chromium"
        }
    }

    struct ChromiumPage {
        url: String,
        page: chromiumoxide::Page,
    }

    #[async_trait]
    impl Page for ChromiumPage {
        async fn wait_for(&mut self, selector: &str, wait: Duration) -> Result<bool, FetchError> {
            match timeout(wait, self.page.find_element(selector)).await {
                Ok(Ok(_)) => Ok(true),
                Ok(Err(e)) => {
                    debug!("Selector {} not found on {}: {}", selector, self.url, e);
                    Ok(false)
                }
                Err(_) => Ok(false),
            }
        }

        async fn page_content(&mut self) -> Result<String, FetchError> {
            self.page
                .content()
                .await
                .map_err(|e| FetchError::NavigationFailed {
                    url: self.url.clone(),
                    reason: format!("Failed to get content: {}", e),
                })
        }

        fn status(&self) -> Option<u16> {
            None
        }

        async fn close(self: Box<Self>) {
            if let Err(e) = self.page.close().await {
                warn!("Failed to close page: {}", e);
            }
        }
    }
}

#[cfg(feature = "js-rendering")]
pub use chromium::ChromiumBrowser;

/// Check if JS rendering feature is available
pub fn is_js_rendering_available() -> bool {
    cfg!(feature = "js-rendering")
}

/// Pick the browser implementation the configuration asks for
pub fn build_browser(config: &FetchConfig) -> Result<std::sync::Arc<dyn Browser>, FetchError> {
    #[cfg(feature = "js-rendering")]
    if config.js_rendering {
        return Ok(std::sync::Arc::new(ChromiumBrowser::new(config)));
    }

    if config.js_rendering && !is_js_rendering_available() {
        tracing::warn!(
            "js_rendering is enabled but this build lacks the js-rendering feature; using plain HTTP"
        );
    }
    Ok(std::sync::Arc::new(HttpBrowser::new(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_http_browser_reads_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/12345/a-vs-b"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html><div class=\"match-header\">x</div></html>"),
            )
            .mount(&server)
            .await;

        let browser = HttpBrowser::new(&FetchConfig::default()).unwrap();
        let mut page = browser
            .navigate(&format!("{}/12345/a-vs-b", server.uri()))
            .await
            .unwrap();

        assert_eq!(page.status(), Some(200));
        assert!(page
            .wait_for("div.match-header", Duration::from_millis(10))
            .await
            .unwrap());
        assert!(!page
            .wait_for("div.vm-stats", Duration::from_millis(10))
            .await
            .unwrap());
        assert!(page.page_content().await.unwrap().contains("match-header"));
        page.close().await;
    }

    #[tokio::test]
    async fn test_http_browser_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let browser = HttpBrowser::new(&FetchConfig::default()).unwrap();
        let page = browser.navigate(&server.uri()).await.unwrap();
        assert_eq!(page.status(), Some(429));
    }

    #[tokio::test]
    async fn test_connection_refused_is_navigation_failure() {
        let browser = HttpBrowser::new(&FetchConfig::default()).unwrap();
        let err = match browser.navigate("http://127.0.0.1:9/").await {
            Err(e) => e,
            Ok(_) => panic!("expected navigation failure"),
        };
        assert!(err.is_transient());
    }
}

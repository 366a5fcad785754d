//! Page fetching
//!
//! This module provides:
//! - A browser capability (plain HTTP, or headless Chrome with `js-rendering`)
//! - Per-source rate limiting and worker bounds
//! - Overall per-attempt timeouts with immediate retries for navigation failures
//! - Block detection (throttling status codes, challenge pages)
//! - Raw snapshot persistence before anything is extracted

mod browser;
mod detect;
mod gate;
mod snapshot;

pub use browser::*;
pub use detect::*;
pub use gate::*;
pub use snapshot::*;

use crate::config::{Config, FetchConfig};
use crate::error::FetchError;
use crate::models::RawPage;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// What to wait for after navigation
#[derive(Debug, Clone, Default)]
pub struct WaitPolicy {
    /// Structural anchor expected on a loaded page
    pub selector: Option<String>,
    /// Upper bound on the selector wait
    pub selector_timeout: Duration,
}

impl WaitPolicy {
    pub fn for_selector(selector: &str) -> Self {
        Self {
            selector: Some(selector.to_string()),
            selector_timeout: Duration::from_secs(10),
        }
    }
}

/// Retrieves raw pages through a browser, one gate per source
#[derive(Clone)]
pub struct Fetcher {
    browser: Arc<dyn Browser>,
    gates: Arc<HashMap<String, SourceGate>>,
    snapshots: Option<SnapshotWriter>,
    attempt_timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
}

impl Fetcher {
    pub fn new(config: &Config, browser: Arc<dyn Browser>) -> Self {
        let gates = config
            .sources
            .iter()
            .map(|s| (s.id.clone(), SourceGate::new(s)))
            .collect();
        Self::with_gates(&config.fetch, browser, gates)
    }

    fn with_gates(
        config: &FetchConfig,
        browser: Arc<dyn Browser>,
        gates: HashMap<String, SourceGate>,
    ) -> Self {
        Self {
            browser,
            gates: Arc::new(gates),
            snapshots: None,
            attempt_timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    /// Persist every fetched page through this writer
    pub fn with_snapshots(mut self, writer: SnapshotWriter) -> Self {
        self.snapshots = Some(writer);
        self
    }

    pub fn browser_name(&self) -> &'static str {
        self.browser.name()
    }

    /// Fetch a page, retrying timeouts and navigation failures immediately
    pub async fn fetch(
        &self,
        source: &str,
        url: &str,
        wait: &WaitPolicy,
    ) -> Result<RawPage, FetchError> {
        let gate = self.gates.get(source).ok_or_else(|| FetchError::NavigationFailed {
            url: url.to_string(),
            reason: format!("no gate configured for source '{}'", source),
        })?;

        let mut attempt = 0;
        let html = loop {
            let _permit = gate.acquire().await?;
            let result = match timeout(self.attempt_timeout, self.attempt(url, wait)).await {
                Ok(r) => r,
                Err(_) => Err(FetchError::Timeout {
                    url: url.to_string(),
                    timeout_ms: self.attempt_timeout.as_millis() as u64,
                }),
            };

            match result {
                Ok(html) => break html,
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "Fetch attempt {} for {} failed: {}; retrying",
                        attempt, url, e
                    );
                    drop(_permit);
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        };

        let fetched_at = Utc::now();
        let snapshot_id = match &self.snapshots {
            Some(writer) => Some(writer.persist(source, url, fetched_at, &html).await?.id),
            None => None,
        };

        debug!("Fetched {} ({} bytes)", url, html.len());
        Ok(RawPage {
            source: source.to_string(),
            url: url.to_string(),
            html,
            fetched_at,
            snapshot_id,
        })
    }

    async fn attempt(&self, url: &str, wait: &WaitPolicy) -> Result<String, FetchError> {
        let mut page = self.browser.navigate(url).await?;

        if let Some(selector) = &wait.selector {
            if !page.wait_for(selector, wait.selector_timeout).await? {
                debug!("Anchor {} not present on {}", selector, url);
            }
        }

        let status = page.status();
        let content = page.page_content().await;
        page.close().await;
        let html = content?;

        if let Some(reason) = detect_block(status, &html) {
            return Err(FetchError::Blocked {
                url: url.to_string(),
                reason,
            });
        }
        if let Some(status) = status {
            if status >= 400 {
                return Err(FetchError::Http {
                    url: url.to_string(),
                    status,
                });
            }
        }
        Ok(html)
    }
}

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{collect_link_paths, DiscoveryError, PathDiscoverer, LISTING_CONTAINER_SELECTOR};

#[derive(Debug, Clone)]
pub struct BrowserOptions {
    /// Chrome/Chromium binary; autodetected when unset.
    pub executable: Option<PathBuf>,
    pub container_selector: String,
    pub settle_poll: Duration,
    pub settle_timeout: Duration,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            executable: None,
            container_selector: LISTING_CONTAINER_SELECTOR.to_string(),
            settle_poll: Duration::from_millis(500),
            settle_timeout: Duration::from_secs(60),
        }
    }
}

/// Discovers fund paths from the client-rendered listing using a headless browser.
/// Every call launches and tears down its own browser process.
#[derive(Debug, Clone, Default)]
pub struct BrowserDiscoverer {
    options: BrowserOptions,
}

impl BrowserDiscoverer {
    pub fn new(options: BrowserOptions) -> Self {
        Self { options }
    }

    async fn capture(&self, browser: &Browser, listing_url: &str) -> Result<String, DiscoveryError> {
        let navigation_error = |message: String| DiscoveryError::Navigation {
            url: listing_url.to_string(),
            message,
        };

        let page = browser
            .new_page(listing_url)
            .await
            .map_err(|e| navigation_error(e.to_string()))?;
        page.wait_for_navigation()
            .await
            .map_err(|e| navigation_error(e.to_string()))?;

        self.wait_until_settled(&page).await?;
        self.wait_for_load_complete(&page).await?;
        self.container_markup(&page).await
    }

    async fn container_markup(&self, page: &Page) -> Result<String, DiscoveryError> {
        let element = page
            .find_element(self.options.container_selector.as_str())
            .await
            .map_err(|e| DiscoveryError::Capture(e.to_string()))?;
        element
            .inner_html()
            .await
            .map_err(|e| DiscoveryError::Capture(e.to_string()))?
            .ok_or_else(|| {
                DiscoveryError::Capture(format!("`{}` has no inner html", self.options.container_selector))
            })
    }

    /// Network-idle approximation: the container markup is unchanged across two polls.
    async fn wait_until_settled(&self, page: &Page) -> Result<(), DiscoveryError> {
        let deadline = Instant::now() + self.options.settle_timeout;
        let mut previous: Option<String> = None;
        loop {
            let current = self.container_markup(page).await.ok();
            if current.is_some() && current == previous {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DiscoveryError::Readiness(format!(
                    "`{}` did not settle within {:?}",
                    self.options.container_selector, self.options.settle_timeout
                )));
            }
            previous = current;
            tokio::time::sleep(self.options.settle_poll).await;
        }
    }

    async fn wait_for_load_complete(&self, page: &Page) -> Result<(), DiscoveryError> {
        let deadline = Instant::now() + self.options.settle_timeout;
        loop {
            let state = page
                .evaluate("document.readyState")
                .await
                .map_err(|e| DiscoveryError::Readiness(e.to_string()))?
                .into_value::<String>()
                .map_err(|e| DiscoveryError::Readiness(e.to_string()))?;
            if state == "complete" {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DiscoveryError::Readiness(format!(
                    "document.readyState stuck at `{state}`"
                )));
            }
            tokio::time::sleep(self.options.settle_poll).await;
        }
    }
}

#[async_trait]
impl PathDiscoverer for BrowserDiscoverer {
    async fn discover_paths(&self, listing_url: &str) -> Result<BTreeSet<String>, DiscoveryError> {
        let mut builder = BrowserConfig::builder();
        if let Some(executable) = &self.options.executable {
            builder = builder.chrome_executable(executable);
        }
        let config = builder.build().map_err(DiscoveryError::Launch)?;

        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| DiscoveryError::Launch(e.to_string()))?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "browser handler event error");
                }
            }
        });

        let captured = self.capture(&browser, listing_url).await;

        if let Err(err) = browser.close().await {
            warn!(error = %err, "could not close the browser");
        }
        if let Err(err) = browser.wait().await {
            warn!(error = %err, "could not reap the browser process");
        }
        if let Err(err) = handler_task.await {
            warn!(error = %err, "browser handler task failed");
        }

        let markup = captured?;
        let paths = collect_link_paths(&markup)?;
        info!(listing_url, paths = paths.len(), "discovered listing paths");
        Ok(paths)
    }
}

//! [`BrowserDriver`] over a chromiumoxide page

use async_trait::async_trait;
use chromiumoxide_cdp::cdp::browser_protocol::network::{CookieParam, TimeSinceEpoch};
use chromiumoxide_cdp::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::driver::{BrowserDriver, DriverFactory};
use super::{BrowserError, BrowserResult, create_blank_page};
use crate::manager::BrowserManager;
use crate::session::StoredCookie;
use crate::utils::wait_for_element;

/// Pause before each keystroke, in milliseconds
const KEYSTROKE_DELAY_MS: (u64, u64) = (40, 140);

/// Pause before starting to type into a field
const FIELD_PAUSE_MS: (u64, u64) = (150, 450);

pub struct ChromeDriver {
    page: Page,
    navigation_timeout: Duration,
    element_timeout: Duration,
}

impl ChromeDriver {
    pub fn new(page: Page, navigation_timeout: Duration, element_timeout: Duration) -> Self {
        Self {
            page,
            navigation_timeout,
            element_timeout,
        }
    }
}

/// One deadline for the whole load, settle wait included
async fn within_navigation_timeout<F>(limit: Duration, url: &str, load: F) -> BrowserResult<()>
where
    F: Future<Output = BrowserResult<()>>,
{
    tokio::time::timeout(limit, load).await.map_err(|_| {
        BrowserError::NavigationFailed(format!(
            "timeout after {}ms loading {}",
            limit.as_millis(),
            url
        ))
    })?
}

fn random_pause((low, high): (u64, u64)) -> Duration {
    Duration::from_millis(rand::rng().random_range(low..=high))
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn navigate(&self, url: &str) -> BrowserResult<()> {
        let load = async {
            self.page
                .goto(url)
                .await
                .map_err(|e| BrowserError::NavigationFailed(format!("{}: {}", url, e)))?;
            self.page
                .wait_for_navigation()
                .await
                .map_err(|e| BrowserError::NavigationFailed(format!("waiting for {}: {}", url, e)))?;
            Ok::<_, BrowserError>(())
        };
        within_navigation_timeout(self.navigation_timeout, url, load).await?;

        debug!("Navigated to {}", url);
        Ok(())
    }

    async fn fill(&self, selector: &str, text: &str) -> BrowserResult<()> {
        let element = wait_for_element(&self.page, selector, self.element_timeout).await?;

        tokio::time::sleep(random_pause(FIELD_PAUSE_MS)).await;

        element
            .click()
            .await
            .map_err(|e| BrowserError::InteractionFailed(format!("focus '{}': {}", selector, e)))?;
        element
            .call_js_fn("function() { this.value = ''; }", false)
            .await
            .map_err(|e| BrowserError::InteractionFailed(format!("clear '{}': {}", selector, e)))?;

        let mut buf = [0u8; 4];
        for ch in text.chars() {
            element
                .type_str(ch.encode_utf8(&mut buf))
                .await
                .map_err(|e| BrowserError::InteractionFailed(format!("type into '{}': {}", selector, e)))?;
            tokio::time::sleep(random_pause(KEYSTROKE_DELAY_MS)).await;
        }
        Ok(())
    }

    async fn click(&self, selector: &str) -> BrowserResult<()> {
        let element = wait_for_element(&self.page, selector, self.element_timeout).await?;
        element
            .click()
            .await
            .map_err(|e| BrowserError::InteractionFailed(format!("click '{}': {}", selector, e)))?;
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> BrowserResult<Value> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| BrowserError::ScriptFailed(e.to_string()))?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    async fn screenshot(&self) -> BrowserResult<Vec<u8>> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        self.page
            .screenshot(params)
            .await
            .map_err(|e| BrowserError::IoError(format!("screenshot: {}", e)))
    }

    async fn current_url(&self) -> BrowserResult<String> {
        let url = self
            .page
            .url()
            .await
            .map_err(|e| BrowserError::NavigationFailed(format!("reading url: {}", e)))?;
        Ok(url.unwrap_or_default())
    }

    async fn export_session(&self) -> BrowserResult<Vec<StoredCookie>> {
        let cookies = self
            .page
            .get_cookies()
            .await
            .map_err(|e| BrowserError::ScriptFailed(format!("reading cookies: {}", e)))?;

        Ok(cookies
            .into_iter()
            .map(|c| StoredCookie {
                name: c.name,
                value: c.value,
                domain: c.domain,
                path: c.path,
                expires: (!c.session && c.expires > 0.0).then_some(c.expires),
                http_only: c.http_only,
                secure: c.secure,
            })
            .collect())
    }

    async fn import_session(&self, cookies: &[StoredCookie]) -> BrowserResult<()> {
        let mut params = Vec::with_capacity(cookies.len());
        for cookie in cookies {
            let mut builder = CookieParam::builder()
                .name(cookie.name.clone())
                .value(cookie.value.clone())
                .domain(cookie.domain.clone())
                .path(cookie.path.clone())
                .http_only(cookie.http_only)
                .secure(cookie.secure);
            if let Some(expires) = cookie.expires {
                builder = builder.expires(TimeSinceEpoch::new(expires));
            }
            match builder.build() {
                Ok(param) => params.push(param),
                Err(e) => warn!("Skipping cookie '{}': {}", cookie.name, e),
            }
        }

        self.page
            .set_cookies(params)
            .await
            .map_err(|e| BrowserError::ScriptFailed(format!("installing cookies: {}", e)))?;
        Ok(())
    }

    async fn close(&self) -> BrowserResult<()> {
        self.page
            .clone()
            .close()
            .await
            .map_err(|e| BrowserError::IoError(format!("closing page: {}", e)))
    }
}

/// Opens one tab per task on the shared browser
pub struct ChromeDriverFactory {
    manager: Arc<BrowserManager>,
    navigation_timeout: Duration,
    element_timeout: Duration,
}

impl ChromeDriverFactory {
    pub fn new(manager: Arc<BrowserManager>, navigation_timeout: Duration, element_timeout: Duration) -> Self {
        Self {
            manager,
            navigation_timeout,
            element_timeout,
        }
    }
}

#[async_trait]
impl DriverFactory for ChromeDriverFactory {
    async fn open(&self) -> BrowserResult<Arc<dyn BrowserDriver>> {
        let browser = self
            .manager
            .get_or_launch()
            .await
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;
        let guard = browser.lock().await;
        let wrapper = guard
            .as_ref()
            .ok_or_else(|| BrowserError::PageCreationFailed("Browser not available".into()))?;

        let page = create_blank_page(wrapper)
            .await
            .map_err(|e| BrowserError::PageCreationFailed(e.to_string()))?;

        Ok(Arc::new(ChromeDriver::new(
            page,
            self.navigation_timeout,
            self.element_timeout,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn stalled_settle_wait_is_bounded_by_the_navigation_timeout() {
        let limit = Duration::from_secs(30);
        let started = Instant::now();

        // Load finishes quickly, the settle wait never does
        let load = async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            std::future::pending::<BrowserResult<()>>().await
        };
        let err = within_navigation_timeout(limit, "https://portal.test/", load)
            .await
            .unwrap_err();

        assert!(matches!(err, BrowserError::NavigationFailed(msg) if msg.contains("timeout after 30000ms")));
        assert!(started.elapsed() >= limit);
        assert!(started.elapsed() < limit + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn load_errors_pass_through() {
        let load = async { Err(BrowserError::NavigationFailed("net::ERR_CONNECTION_REFUSED".into())) };
        let err = within_navigation_timeout(Duration::from_secs(30), "https://portal.test/", load)
            .await
            .unwrap_err();
        assert!(matches!(err, BrowserError::NavigationFailed(msg) if msg.contains("ERR_CONNECTION_REFUSED")));
    }
}

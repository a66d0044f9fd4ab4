//! The narrow browser surface the login machine and extractors drive

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::BrowserResult;
use crate::session::StoredCookie;

/// One automated browser tab
///
/// Implementations must be usable from a single task at a time; the worker
/// never shares a driver between tasks.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Load `url` and wait for the navigation to settle
    async fn navigate(&self, url: &str) -> BrowserResult<()>;

    /// Type `text` into the element matching `selector`
    async fn fill(&self, selector: &str, text: &str) -> BrowserResult<()>;

    async fn click(&self, selector: &str) -> BrowserResult<()>;

    /// Run `script` in the page and return its JSON value (`Null` for `undefined`)
    async fn evaluate(&self, script: &str) -> BrowserResult<Value>;

    /// Full-page PNG
    async fn screenshot(&self) -> BrowserResult<Vec<u8>>;

    async fn current_url(&self) -> BrowserResult<String>;

    /// Cookies currently held by the browser
    async fn export_session(&self) -> BrowserResult<Vec<StoredCookie>>;

    /// Install previously exported cookies
    async fn import_session(&self, cookies: &[StoredCookie]) -> BrowserResult<()>;

    /// Release the tab
    async fn close(&self) -> BrowserResult<()> {
        Ok(())
    }
}

/// Opens a fresh driver for each task
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn open(&self) -> BrowserResult<Arc<dyn BrowserDriver>>;
}

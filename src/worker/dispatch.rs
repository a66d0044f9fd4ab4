//! What the worker runs for each task kind

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::browser::BrowserDriver;
use crate::login::{LoginOutcome, scripts};
use crate::queue::TaskLog;
use crate::utils::errors::{RpaError, RpaResult};

/// Brings a driver into an authenticated state
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, driver: &dyn BrowserDriver, log: &TaskLog) -> RpaResult<LoginOutcome>;
}

/// Pulls a record out of an authenticated session; the payload is opaque to the queue
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, driver: &dyn BrowserDriver, log: &TaskLog) -> RpaResult<Value>;
}

/// Records where the login landed: URL and document title
pub struct LandingPageExtractor;

#[async_trait]
impl Extractor for LandingPageExtractor {
    async fn extract(&self, driver: &dyn BrowserDriver, log: &TaskLog) -> RpaResult<Value> {
        let (url, title) = tokio::try_join!(driver.current_url(), driver.evaluate(scripts::page_title()))
            .map_err(|e| RpaError::Extraction(e.to_string()))?;

        let title = match title {
            Value::String(title) => title,
            _ => String::new(),
        };
        log.push(format!("Landing page: '{}' at {}", title, url));

        Ok(json!({
            "url": url,
            "title": title,
            "extracted_at": chrono::Utc::now().to_rfc3339(),
        }))
    }
}

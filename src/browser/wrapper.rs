//! Browser process ownership
//!
//! A launched Chrome comes with a CDP handler task and a throwaway profile
//! directory; both must be released together.

use anyhow::{Context, Result};
use chromiumoxide::browser::Browser;
use chromiumoxide::page::Page;
use std::path::PathBuf;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::BrowserConfig;

/// Browser plus its event handler task and profile directory
///
/// The handler is aborted on drop. The profile directory is only removed by
/// [`cleanup_temp_dir`](Self::cleanup_temp_dir), after the process has exited.
pub struct BrowserWrapper {
    browser: Browser,
    handler: JoinHandle<()>,
    user_data_dir: Option<PathBuf>,
}

impl BrowserWrapper {
    pub(crate) fn new(browser: Browser, handler: JoinHandle<()>, user_data_dir: PathBuf) -> Self {
        Self {
            browser,
            handler,
            user_data_dir: Some(user_data_dir),
        }
    }

    pub(crate) fn browser(&self) -> &Browser {
        &self.browser
    }

    pub(crate) fn browser_mut(&mut self) -> &mut Browser {
        &mut self.browser
    }

    /// Remove the profile directory. Call only after `browser.wait()` returned,
    /// otherwise Chrome may still hold files open.
    pub fn cleanup_temp_dir(&mut self) {
        if let Some(path) = self.user_data_dir.take() {
            info!("Cleaning up browser profile: {}", path.display());
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!("Failed to remove browser profile {}: {}", path.display(), e);
            }
        }
    }
}

impl Drop for BrowserWrapper {
    fn drop(&mut self) {
        self.handler.abort();

        if let Some(path) = self.user_data_dir.as_ref() {
            warn!(
                "BrowserWrapper dropped without shutdown; profile left at {}",
                path.display()
            );
        }
    }
}

/// Launch Chrome with the configured window, headless mode and user agent,
/// using a per-process profile directory.
pub async fn launch_browser(config: &BrowserConfig) -> Result<(Browser, JoinHandle<()>, PathBuf)> {
    info!("Launching portal browser (headless: {})", config.headless);

    let user_data_dir =
        std::env::temp_dir().join(format!("portal_rpa_chrome_{}", std::process::id()));

    let (browser, handler) =
        crate::browser_setup::launch_browser(config, Some(user_data_dir.clone())).await?;

    Ok((browser, handler, user_data_dir))
}

/// Open an `about:blank` tab to drive
pub async fn create_blank_page(wrapper: &BrowserWrapper) -> Result<Page> {
    let page = wrapper
        .browser()
        .new_page("about:blank")
        .await
        .context("Failed to create blank page")?;

    Ok(page)
}

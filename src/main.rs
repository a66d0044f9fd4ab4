// Portal RPA daemon
//
// Runs the task worker and the extraction scheduler against one shared,
// lazily launched Chrome until Ctrl-C.

use anyhow::{Context, Result};
use portal_rpa::{BrowserManager, ChromeDriverFactory, RpaService, load_yaml_config};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_yaml_config().context("loading configuration")?;
    log::info!(
        "Portal RPA starting: login {} (challenge mode {:?})",
        config.portal.login_url,
        config.portal.challenge_mode
    );

    let browser_manager = Arc::new(BrowserManager::new(config.browser.clone()));
    let drivers = Arc::new(ChromeDriverFactory::new(
        browser_manager.clone(),
        config.portal.navigation_timeout()?,
        config.portal.element_timeout()?,
    ));

    let service = RpaService::build(&config, drivers).context("building service")?;
    service.start();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    log::info!("Shutdown requested");

    service.shutdown().await;
    browser_manager.shutdown().await?;

    log::info!("Portal RPA stopped");
    Ok(())
}

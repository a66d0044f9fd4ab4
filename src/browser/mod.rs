//! Browser infrastructure: Chrome launch, lifecycle, and the automation driver seam

mod chrome;
mod driver;
mod wrapper;

pub use chrome::{ChromeDriver, ChromeDriverFactory};
pub use driver::{BrowserDriver, DriverFactory};
pub use wrapper::{BrowserWrapper, create_blank_page, launch_browser};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("Failed to find browser executable: {0}")]
    NotFound(String),

    #[error("Failed to launch browser: {0}")]
    LaunchFailed(String),

    #[error("Failed to create page: {0}")]
    PageCreationFailed(String),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Interaction failed: {0}")]
    InteractionFailed(String),

    #[error("Script evaluation failed: {0}")]
    ScriptFailed(String),

    #[error("IO error: {0}")]
    IoError(String),
}

pub type BrowserResult<T> = Result<T, BrowserError>;

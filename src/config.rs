//! YAML configuration with environment overrides for secrets

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::utils::constants::{CHROME_USER_AGENT, DEFAULT_BATCH_SIZE};
use crate::utils::errors::{RpaError, RpaResult};
use crate::utils::{validate_challenge_timeout, validate_interaction_timeout, validate_navigation_timeout};

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "PORTAL_RPA_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// SQLite file backing the task queue
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Directory holding one session snapshot per identity
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,

    /// Directory for failure screenshots
    #[serde(default = "default_diagnostics_dir")]
    pub diagnostics_dir: PathBuf,

    #[serde(default)]
    pub browser: BrowserConfig,

    #[serde(default)]
    pub portal: PortalConfig,

    #[serde(default)]
    pub captcha: CaptchaConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

/// Browser security and launch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Run browser in headless mode
    #[serde(default = "default_headless")]
    pub headless: bool,

    /// Disable web security features (Same-Origin Policy, etc.)
    /// WARNING: Only enable for trusted content
    #[serde(default)]
    pub disable_security: bool,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Window dimensions
    #[serde(default)]
    pub window: WindowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_window_width")]
    pub width: u32,

    #[serde(default = "default_window_height")]
    pub height: u32,
}

/// How the login challenge gets resolved
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeMode {
    /// Outsource to the configured solving provider
    Solver,
    /// Wait for a human to tick the challenge in a headed browser
    Manual,
}

/// Target portal: where to log in and how to recognise each page element
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    #[serde(default = "default_login_url")]
    pub login_url: String,

    /// Page visited after a reused session is loaded; defaults to the login URL
    #[serde(default)]
    pub landing_url: Option<String>,

    /// Cookie domain that marks a usable session; derived from `login_url` when unset
    #[serde(default)]
    pub target_domain: Option<String>,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub tenant_id: Option<String>,

    /// reCAPTCHA site key; read from the page's `data-sitekey` when unset
    #[serde(default)]
    pub recaptcha_site_key: Option<String>,

    #[serde(default = "default_challenge_mode")]
    pub challenge_mode: ChallengeMode,

    #[serde(default)]
    pub selectors: PortalSelectors,

    #[serde(default = "default_navigation_timeout_ms")]
    pub navigation_timeout_ms: u64,

    #[serde(default = "default_element_timeout_ms")]
    pub element_timeout_ms: u64,

    #[serde(default = "default_challenge_timeout_ms")]
    pub challenge_timeout_ms: u64,

    #[serde(default = "default_challenge_poll_ms")]
    pub challenge_poll_ms: u64,

    #[serde(default = "default_verify_attempts")]
    pub verify_attempts: u32,

    #[serde(default = "default_verify_interval_ms")]
    pub verify_interval_ms: u64,

    /// Drop a reused session that fails verification and log in from scratch
    #[serde(default = "default_true")]
    pub fallback_to_full_login: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalSelectors {
    #[serde(default = "default_user_selector")]
    pub user: String,

    #[serde(default = "default_password_selector")]
    pub password: String,

    #[serde(default = "default_tenant_selector")]
    pub tenant: String,

    #[serde(default = "default_consent_selector")]
    pub consent: String,

    #[serde(default = "default_submit_selector")]
    pub submit: String,

    /// Elements that only exist on the authenticated landing page
    #[serde(default = "default_success_selectors")]
    pub success: Vec<String>,

    /// URL fragment identifying the login route
    #[serde(default = "default_login_path_marker")]
    pub login_path_marker: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaConfig {
    /// `2captcha` or `anti-captcha`
    #[serde(default = "default_captcha_provider")]
    pub provider: String,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Override the provider endpoint (staging or a local stub)
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "default_captcha_poll_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_captcha_max_wait_secs")]
    pub max_wait_secs: u64,

    /// Submissions tried when the provider cannot be reached at all; a
    /// request that may have been received is never resent
    #[serde(default = "default_submit_attempts")]
    pub submit_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_poll_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_worker_error_backoff_secs")]
    pub error_backoff_secs: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Outer deadline on one task's whole execution
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Put failed tasks back to `pending` while retries remain
    #[serde(default)]
    pub auto_retry: bool,

    #[serde(default = "default_retry_backoff_base_secs")]
    pub retry_backoff_base_secs: u64,

    #[serde(default = "default_retry_backoff_cap_secs")]
    pub retry_backoff_cap_secs: u64,

    /// How long `stop()` waits for an in-flight task before giving up on the join
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Grace period after start before the first interval begins
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,

    #[serde(default = "default_scheduler_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_scheduler_error_backoff_secs")]
    pub error_backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Named identity the portal session is stored under
    #[serde(default = "default_session_identity")]
    pub identity: String,

    #[serde(default = "default_session_max_age_secs")]
    pub max_age_secs: u64,

    /// Snapshots untouched for longer than this are deleted at startup
    #[serde(default = "default_session_cleanup_secs")]
    pub cleanup_after_secs: u64,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("portal_rpa")
}
fn default_database_path() -> PathBuf {
    default_data_dir().join("tasks.db")
}
fn default_sessions_dir() -> PathBuf {
    default_data_dir().join("sessions")
}
fn default_diagnostics_dir() -> PathBuf {
    default_data_dir().join("diagnostics")
}

fn default_true() -> bool {
    true
}
fn default_headless() -> bool {
    true
}
fn default_user_agent() -> String {
    CHROME_USER_AGENT.to_string()
}
fn default_window_width() -> u32 {
    1920
}
fn default_window_height() -> u32 {
    1080
}

fn default_login_url() -> String {
    "https://proordersistem.com.mx/".to_string()
}
fn default_challenge_mode() -> ChallengeMode {
    ChallengeMode::Solver
}
fn default_navigation_timeout_ms() -> u64 {
    30_000
}
fn default_element_timeout_ms() -> u64 {
    10_000
}
fn default_challenge_timeout_ms() -> u64 {
    180_000
}
fn default_challenge_poll_ms() -> u64 {
    500
}
fn default_verify_attempts() -> u32 {
    20
}
fn default_verify_interval_ms() -> u64 {
    1_500
}

fn default_user_selector() -> String {
    r#"input[placeholder="Email"]"#.to_string()
}
fn default_password_selector() -> String {
    r#"input[placeholder="Password"]"#.to_string()
}
fn default_tenant_selector() -> String {
    r#"input[placeholder="ID-Taller"]"#.to_string()
}
fn default_consent_selector() -> String {
    r#"input[type="checkbox"][name="tyc"]"#.to_string()
}
fn default_submit_selector() -> String {
    r#"input[type="submit"][value="Log In"]"#.to_string()
}
fn default_success_selectors() -> Vec<String> {
    vec![
        ".dashboard".to_string(),
        ".menu-principal".to_string(),
        "#sidebar".to_string(),
    ]
}
fn default_login_path_marker() -> String {
    "login".to_string()
}

fn default_captcha_provider() -> String {
    "2captcha".to_string()
}
fn default_captcha_poll_secs() -> u64 {
    5
}
fn default_captcha_max_wait_secs() -> u64 {
    180
}
fn default_submit_attempts() -> u32 {
    1
}

fn default_worker_poll_secs() -> u64 {
    5
}
fn default_worker_error_backoff_secs() -> u64 {
    10
}
fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_task_timeout_secs() -> u64 {
    600
}
fn default_retry_backoff_base_secs() -> u64 {
    60
}
fn default_retry_backoff_cap_secs() -> u64 {
    3_600
}
fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_initial_delay_secs() -> u64 {
    30
}
fn default_scheduler_interval_secs() -> u64 {
    2 * 60 * 60
}
fn default_scheduler_error_backoff_secs() -> u64 {
    60
}

fn default_session_identity() -> String {
    "default".to_string()
}
fn default_session_max_age_secs() -> u64 {
    8 * 60 * 60
}
fn default_session_cleanup_secs() -> u64 {
    7 * 24 * 60 * 60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            sessions_dir: default_sessions_dir(),
            diagnostics_dir: default_diagnostics_dir(),
            browser: BrowserConfig::default(),
            portal: PortalConfig::default(),
            captcha: CaptchaConfig::default(),
            worker: WorkerConfig::default(),
            scheduler: SchedulerConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: default_headless(),
            disable_security: false,
            user_agent: default_user_agent(),
            window: WindowConfig::default(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: default_window_width(),
            height: default_window_height(),
        }
    }
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            login_url: default_login_url(),
            landing_url: None,
            target_domain: None,
            user: None,
            password: None,
            tenant_id: None,
            recaptcha_site_key: None,
            challenge_mode: default_challenge_mode(),
            selectors: PortalSelectors::default(),
            navigation_timeout_ms: default_navigation_timeout_ms(),
            element_timeout_ms: default_element_timeout_ms(),
            challenge_timeout_ms: default_challenge_timeout_ms(),
            challenge_poll_ms: default_challenge_poll_ms(),
            verify_attempts: default_verify_attempts(),
            verify_interval_ms: default_verify_interval_ms(),
            fallback_to_full_login: true,
        }
    }
}

impl Default for PortalSelectors {
    fn default() -> Self {
        Self {
            user: default_user_selector(),
            password: default_password_selector(),
            tenant: default_tenant_selector(),
            consent: default_consent_selector(),
            submit: default_submit_selector(),
            success: default_success_selectors(),
            login_path_marker: default_login_path_marker(),
        }
    }
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            provider: default_captcha_provider(),
            api_key: None,
            base_url: None,
            poll_interval_secs: default_captcha_poll_secs(),
            max_wait_secs: default_captcha_max_wait_secs(),
            submit_attempts: default_submit_attempts(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_worker_poll_secs(),
            error_backoff_secs: default_worker_error_backoff_secs(),
            batch_size: default_batch_size(),
            task_timeout_secs: default_task_timeout_secs(),
            auto_retry: false,
            retry_backoff_base_secs: default_retry_backoff_base_secs(),
            retry_backoff_cap_secs: default_retry_backoff_cap_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_secs: default_initial_delay_secs(),
            interval_secs: default_scheduler_interval_secs(),
            error_backoff_secs: default_scheduler_error_backoff_secs(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            identity: default_session_identity(),
            max_age_secs: default_session_max_age_secs(),
            cleanup_after_secs: default_session_cleanup_secs(),
        }
    }
}

impl PortalConfig {
    /// Domain a stored cookie must belong to for the session to count as usable
    pub fn target_domain(&self) -> RpaResult<String> {
        if let Some(domain) = self.target_domain.as_deref().filter(|d| !d.is_empty()) {
            return Ok(domain.trim_start_matches('.').to_lowercase());
        }
        let parsed = url::Url::parse(&self.login_url).map_err(|e| {
            RpaError::Configuration(format!("Invalid login_url '{}': {}", self.login_url, e))
        })?;
        parsed
            .host_str()
            .map(|h| h.to_lowercase())
            .ok_or_else(|| RpaError::Configuration(format!("login_url '{}' has no host", self.login_url)))
    }

    pub fn landing_url(&self) -> &str {
        self.landing_url.as_deref().unwrap_or(&self.login_url)
    }

    pub fn navigation_timeout(&self) -> RpaResult<Duration> {
        validate_navigation_timeout(Some(self.navigation_timeout_ms), default_navigation_timeout_ms())
    }

    pub fn element_timeout(&self) -> RpaResult<Duration> {
        validate_interaction_timeout(Some(self.element_timeout_ms), default_element_timeout_ms())
    }

    pub fn challenge_timeout(&self) -> RpaResult<Duration> {
        validate_challenge_timeout(self.challenge_timeout_ms)
    }
}

impl CaptchaConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn max_wait(&self) -> RpaResult<Duration> {
        validate_challenge_timeout(self.max_wait_secs.saturating_mul(1000))
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Exponential delay before retry number `retry_count + 1`, capped
    pub fn retry_backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry_count.min(32));
        let secs = self
            .retry_backoff_base_secs
            .saturating_mul(factor)
            .min(self.retry_backoff_cap_secs);
        Duration::from_secs(secs)
    }
}

impl SchedulerConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}

impl SessionConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn cleanup_after(&self) -> Duration {
        Duration::from_secs(self.cleanup_after_secs)
    }
}

impl Config {
    /// Overlay secrets and credentials from the environment
    pub fn apply_env_overrides(&mut self) {
        fn env(key: &str) -> Option<String> {
            std::env::var(key)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        }

        if let Some(provider) = env("CAPTCHA_PROVIDER") {
            self.captcha.provider = provider.to_lowercase();
        }
        if let Some(key) = env("CAPTCHA_API_KEY") {
            self.captcha.api_key = Some(key);
        }
        if let Some(url) = env("PORTAL_LOGIN_URL") {
            self.portal.login_url = url;
        }
        if let Some(user) = env("PORTAL_USER") {
            self.portal.user = Some(user);
        }
        if let Some(password) = env("PORTAL_PASSWORD") {
            self.portal.password = Some(password);
        }
        if let Some(tenant) = env("PORTAL_TENANT_ID") {
            self.portal.tenant_id = Some(tenant);
        }
        if let Some(site_key) = env("PORTAL_RECAPTCHA_SITE_KEY") {
            self.portal.recaptcha_site_key = Some(site_key);
        }
    }

    /// Check the values that would otherwise fail deep inside a run
    pub fn validate(&self) -> RpaResult<()> {
        self.portal.navigation_timeout()?;
        self.portal.element_timeout()?;
        self.portal.challenge_timeout()?;
        self.portal.target_domain()?;
        self.captcha.max_wait()?;
        if self.worker.batch_size == 0 {
            return Err(RpaError::Configuration("worker.batch_size must be at least 1".into()));
        }
        if self.scheduler.interval_secs == 0 {
            return Err(RpaError::Configuration("scheduler.interval_secs must be positive".into()));
        }
        Ok(())
    }
}

/// Parse a YAML document into a [`Config`]
pub fn parse_yaml_config(contents: &str) -> RpaResult<Config> {
    serde_yaml::from_str(contents)
        .map_err(|e| RpaError::Configuration(format!("Invalid config YAML: {}", e)))
}

/// Load config from `$PORTAL_RPA_CONFIG`, else `config.yaml` in the working
/// directory, else defaults; environment overrides are applied last.
pub fn load_yaml_config() -> RpaResult<Config> {
    let config_path = std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.yaml"));

    let mut config = if config_path.exists() {
        let contents = fs::read_to_string(&config_path).map_err(|e| {
            RpaError::Configuration(format!("Failed to read {}: {}", config_path.display(), e))
        })?;
        parse_yaml_config(&contents)?
    } else {
        Config::default()
    };

    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

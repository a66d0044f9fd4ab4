//! Login state machine
//!
//! `Start -> SessionCheck -> (ReuseSession | FullLogin) -> Verify -> {Success, Failed}`
//!
//! A stale reused session may fall through to one full login. Any failure
//! leaves a best-effort screenshot in the diagnostics directory.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::credentials::{Credentials, CredentialsProvider};
use super::scripts;
use crate::browser::{BrowserDriver, BrowserError};
use crate::captcha::{Challenge, ChallengeSolver, Solution};
use crate::config::{ChallengeMode, PortalConfig};
use crate::queue::TaskLog;
use crate::session::SessionStore;
use crate::utils::errors::{RpaError, RpaResult};
use crate::worker::Authenticator;

/// Time the page gets to accept an injected token before submit
const TOKEN_SETTLE: Duration = Duration::from_secs(1);

const SUBMIT_ATTEMPTS: u32 = 3;
const SUBMIT_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    Start,
    SessionCheck,
    ReuseSession,
    FullLogin,
    Verify,
    Success,
    Failed,
}

impl fmt::Display for LoginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoginState::Start => "Start",
            LoginState::SessionCheck => "SessionCheck",
            LoginState::ReuseSession => "ReuseSession",
            LoginState::FullLogin => "FullLogin",
            LoginState::Verify => "Verify",
            LoginState::Success => "Success",
            LoginState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginMode {
    /// Stored cookies were accepted
    Reused,
    /// Credentials were entered and the challenge resolved
    Full,
}

/// Billing trail for a solved challenge
#[derive(Debug, Clone, Serialize)]
pub struct ChallengeReceipt {
    pub provider: &'static str,
    pub cost: f64,
    pub solve_time_secs: f64,
}

impl From<&Solution> for ChallengeReceipt {
    fn from(solution: &Solution) -> Self {
        Self {
            provider: solution.provider,
            cost: solution.cost,
            solve_time_secs: solution.solve_time.as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginOutcome {
    pub mode: LoginMode,
    pub final_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge: Option<ChallengeReceipt>,
}

pub struct LoginMachine {
    portal: PortalConfig,
    identity: String,
    max_age: Duration,
    sessions: Arc<SessionStore>,
    solver: Option<Arc<dyn ChallengeSolver>>,
    credentials: Arc<dyn CredentialsProvider>,
    diagnostics_dir: PathBuf,
    challenge_timeout: Duration,
    challenge_poll: Duration,
    verify_interval: Duration,
}

impl LoginMachine {
    /// Timeouts are validated here so a bad config fails at startup
    pub fn new(
        portal: PortalConfig,
        identity: impl Into<String>,
        max_age: Duration,
        sessions: Arc<SessionStore>,
        solver: Option<Arc<dyn ChallengeSolver>>,
        credentials: Arc<dyn CredentialsProvider>,
        diagnostics_dir: impl Into<PathBuf>,
    ) -> RpaResult<Self> {
        let challenge_timeout = portal.challenge_timeout()?;
        let challenge_poll = Duration::from_millis(portal.challenge_poll_ms.max(50));
        let verify_interval = Duration::from_millis(portal.verify_interval_ms);

        if portal.challenge_mode == ChallengeMode::Solver && solver.is_none() {
            warn!("Challenge mode is 'solver' but no solver is configured; full logins will fail");
        }

        Ok(Self {
            portal,
            identity: identity.into(),
            max_age,
            sessions,
            solver,
            credentials,
            diagnostics_dir: diagnostics_dir.into(),
            challenge_timeout,
            challenge_poll,
            verify_interval,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn enter(&self, log: &TaskLog, state: LoginState) {
        debug!(identity = %self.identity, "login state -> {}", state);
        log.push(format!("login: {}", state));
    }

    /// Run the machine to `Success` or `Failed`
    pub async fn login(&self, driver: &dyn BrowserDriver, log: &TaskLog) -> RpaResult<LoginOutcome> {
        self.enter(log, LoginState::Start);
        self.enter(log, LoginState::SessionCheck);

        if self.sessions.is_fresh(&self.identity, self.max_age) {
            self.enter(log, LoginState::ReuseSession);
            match self.reuse_session(driver, log).await {
                Ok(outcome) => {
                    self.enter(log, LoginState::Success);
                    return Ok(outcome);
                }
                Err(e) if self.portal.fallback_to_full_login => {
                    log.push(format!("Stored session rejected ({}); falling back to full login", e));
                    if let Err(remove_err) = self.sessions.remove(&self.identity) {
                        warn!("Failed to drop stale session: {}", remove_err);
                    }
                }
                Err(e) => return Err(self.fail(driver, log, e).await),
            }
        } else {
            log.push("No fresh session snapshot");
        }

        self.enter(log, LoginState::FullLogin);
        match self.full_login(driver, log).await {
            Ok(outcome) => {
                self.enter(log, LoginState::Success);
                Ok(outcome)
            }
            Err(e) => Err(self.fail(driver, log, e).await),
        }
    }

    async fn fail(&self, driver: &dyn BrowserDriver, log: &TaskLog, error: RpaError) -> RpaError {
        self.enter(log, LoginState::Failed);
        log.push(format!("Login failed: {}", error));
        if let Some(path) = self.capture_diagnostics(driver).await {
            log.push(format!("Screenshot saved: {}", path.display()));
        }
        error
    }

    async fn reuse_session(&self, driver: &dyn BrowserDriver, log: &TaskLog) -> RpaResult<LoginOutcome> {
        let snapshot = self.sessions.load(&self.identity)?;
        driver.import_session(&snapshot.cookies).await?;
        log.push(format!("Loaded {} stored cookies", snapshot.cookies.len()));

        driver.navigate(self.portal.landing_url()).await?;

        self.enter(log, LoginState::Verify);
        let final_url = self.verify(driver, &self.portal.login_url).await?;

        Ok(LoginOutcome {
            mode: LoginMode::Reused,
            final_url,
            challenge: None,
        })
    }

    async fn full_login(&self, driver: &dyn BrowserDriver, log: &TaskLog) -> RpaResult<LoginOutcome> {
        // Preconditions before touching the browser
        let creds = self.credentials.credentials(&self.identity).await?;
        if self.portal.challenge_mode == ChallengeMode::Solver && self.solver.is_none() {
            return Err(RpaError::Configuration(
                "captcha provider key is required in solver mode".into(),
            ));
        }

        log.push(format!("Navigating to {}", creds.login_url));
        driver.navigate(&creds.login_url).await?;

        self.fill_form(driver, &creds, log).await?;

        let challenge = match self.portal.challenge_mode {
            ChallengeMode::Solver => Some(self.solve_challenge(driver, &creds.login_url, log).await?),
            ChallengeMode::Manual => {
                self.wait_for_manual_resolution(driver, log).await?;
                None
            }
        };

        self.submit(driver, log).await?;

        self.enter(log, LoginState::Verify);
        let final_url = self.verify(driver, &creds.login_url).await?;
        log.push(format!("Logged in, now at {}", final_url));

        let cookies = driver.export_session().await?;
        self.sessions.save(&self.identity, cookies)?;

        Ok(LoginOutcome {
            mode: LoginMode::Full,
            final_url,
            challenge,
        })
    }

    async fn fill_form(&self, driver: &dyn BrowserDriver, creds: &Credentials, log: &TaskLog) -> RpaResult<()> {
        let selectors = &self.portal.selectors;
        log.push("Filling credentials");

        driver.fill(&selectors.user, &creds.identity).await?;
        driver.fill(&selectors.password, &creds.secret).await?;
        match creds.tenant_id.as_deref() {
            Some(tenant) => driver.fill(&selectors.tenant, tenant).await?,
            None => log.push("No tenant id configured, skipping tenant field"),
        }

        match driver.evaluate(&scripts::checkbox_state(&selectors.consent)).await? {
            Value::Bool(false) => {
                driver.click(&selectors.consent).await?;
                log.push("Accepted terms checkbox");
            }
            Value::Bool(true) => {}
            _ => log.push("No consent checkbox on page"),
        }
        Ok(())
    }

    async fn site_key(&self, driver: &dyn BrowserDriver) -> RpaResult<String> {
        if let Some(key) = self.portal.recaptcha_site_key.as_deref().filter(|k| !k.is_empty()) {
            return Ok(key.to_string());
        }
        match driver.evaluate(scripts::site_key()).await? {
            Value::String(key) if !key.is_empty() => Ok(key),
            _ => Err(RpaError::Configuration(
                "No reCAPTCHA site key configured and none found on the page".into(),
            )),
        }
    }

    async fn solve_challenge(
        &self,
        driver: &dyn BrowserDriver,
        page_url: &str,
        log: &TaskLog,
    ) -> RpaResult<ChallengeReceipt> {
        let solver = self
            .solver
            .as_ref()
            .ok_or_else(|| RpaError::Configuration("No challenge solver configured".into()))?;

        let site_key = self.site_key(driver).await?;
        log.push("Submitting challenge to solving service");
        let solution = solver.solve(&Challenge::recaptcha_v2(site_key), page_url).await?;
        log.push(format!(
            "Challenge solved by {} in {:.1}s (${:.4})",
            solution.provider,
            solution.solve_time.as_secs_f64(),
            solution.cost
        ));

        let injected = driver.evaluate(&scripts::inject_token(&solution.token)).await?;
        log.push(format!(
            "Token injected: {}",
            injected.as_str().unwrap_or("no result")
        ));
        tokio::time::sleep(TOKEN_SETTLE).await;

        Ok(ChallengeReceipt::from(&solution))
    }

    async fn wait_for_manual_resolution(&self, driver: &dyn BrowserDriver, log: &TaskLog) -> RpaResult<()> {
        log.push(format!(
            "Waiting up to {}s for the challenge to be resolved by hand",
            self.challenge_timeout.as_secs()
        ));
        let deadline = Instant::now() + self.challenge_timeout;
        loop {
            if driver.evaluate(&scripts::challenge_resolved()).await? == Value::Bool(true) {
                log.push("Challenge resolved manually");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RpaError::ChallengeTimeout {
                    waited_secs: self.challenge_timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.challenge_poll).await;
        }
    }

    async fn submit(&self, driver: &dyn BrowserDriver, log: &TaskLog) -> RpaResult<()> {
        let mut attempt = 1;
        loop {
            match driver.click(&self.portal.selectors.submit).await {
                Ok(()) => {
                    log.push("Login form submitted");
                    return Ok(());
                }
                Err(BrowserError::ElementNotFound(e)) => {
                    return Err(BrowserError::ElementNotFound(e).into());
                }
                Err(e) if attempt < SUBMIT_ATTEMPTS => {
                    log.push(format!("Submit attempt {} failed: {}", attempt, e));
                    attempt += 1;
                    tokio::time::sleep(SUBMIT_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Poll for a positive indicator; returns the URL the browser ended on
    async fn verify(&self, driver: &dyn BrowserDriver, login_url: &str) -> RpaResult<String> {
        let attempts = self.portal.verify_attempts.max(1);
        let mut last_url = String::new();

        for attempt in 1..=attempts {
            match driver.current_url().await {
                Ok(url) => {
                    if url_left_login(&url, login_url, &self.portal.selectors.login_path_marker) {
                        return Ok(url);
                    }
                    last_url = url;
                }
                Err(e) => debug!("verify: reading url failed: {}", e),
            }

            for selector in &self.portal.selectors.success {
                if let Ok(Value::Bool(true)) = driver.evaluate(&scripts::element_exists(selector)).await {
                    return Ok(last_url);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.verify_interval).await;
            }
        }

        Err(RpaError::VerificationTimeout(format!(
            "still at '{}' after {} checks",
            last_url, attempts
        )))
    }

    /// Full-page screenshot into the diagnostics dir; never fails the caller
    async fn capture_diagnostics(&self, driver: &dyn BrowserDriver) -> Option<PathBuf> {
        let png = match driver.screenshot().await {
            Ok(png) => png,
            Err(e) => {
                warn!("Could not capture failure screenshot: {}", e);
                return None;
            }
        };

        let name = format!(
            "login_error_{}.png",
            chrono::Utc::now().format("%Y%m%d_%H%M%S_%3f")
        );
        let path = self.diagnostics_dir.join(name);

        if let Err(e) = tokio::fs::create_dir_all(&self.diagnostics_dir).await {
            warn!("Could not create {}: {}", self.diagnostics_dir.display(), e);
            return None;
        }
        match tokio::fs::write(&path, png).await {
            Ok(()) => Some(path),
            Err(e) => {
                warn!("Could not write {}: {}", path.display(), e);
                None
            }
        }
    }
}

#[async_trait]
impl Authenticator for LoginMachine {
    async fn authenticate(&self, driver: &dyn BrowserDriver, log: &TaskLog) -> RpaResult<LoginOutcome> {
        self.login(driver, log).await
    }
}

/// The browser has moved off the login route
fn url_left_login(current: &str, login_url: &str, marker: &str) -> bool {
    let current_norm = current.trim().trim_end_matches('/').to_lowercase();
    let login_norm = login_url.trim().trim_end_matches('/').to_lowercase();

    if current_norm.is_empty() || current_norm == "about:blank" || current_norm == login_norm {
        return false;
    }
    marker.is_empty() || !current_norm.contains(&marker.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaving_login_requires_a_different_non_login_url() {
        let login = "https://proordersistem.com.mx/";
        assert!(!url_left_login("https://proordersistem.com.mx", login, "login"));
        assert!(!url_left_login("https://proordersistem.com.mx/Login?err=1", login, "login"));
        assert!(!url_left_login("about:blank", login, "login"));
        assert!(url_left_login("https://proordersistem.com.mx/dashboard", login, "login"));
    }

    #[test]
    fn outcome_serializes_without_empty_challenge() {
        let outcome = LoginOutcome {
            mode: LoginMode::Reused,
            final_url: "https://portal/home".into(),
            challenge: None,
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value, serde_json::json!({"mode": "reused", "final_url": "https://portal/home"}));
    }
}

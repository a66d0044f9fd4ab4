//! Shared fixtures: a scripted browser driver and solving provider
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use portal_rpa::{
    BrowserDriver, BrowserError, BrowserResult, Challenge, ChallengeMode, DriverFactory,
    LoginMode, LoginOutcome, PollStatus, PortalConfig, RpaError, RpaResult, SolvingProvider,
    StoredCookie, TaskLog,
};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const LOGIN_URL: &str = "https://portal.test/";
pub const DASHBOARD_URL: &str = "https://portal.test/dashboard";
pub const DOMAIN: &str = "portal.test";
pub const SITE_KEY: &str = "6Lc-site-key";

/// Portal config tuned for fast tests
pub fn portal_config() -> PortalConfig {
    PortalConfig {
        login_url: LOGIN_URL.to_string(),
        user: Some("agent@example.com".to_string()),
        password: Some("hunter2".to_string()),
        tenant_id: Some("T-042".to_string()),
        challenge_mode: ChallengeMode::Solver,
        challenge_timeout_ms: 2_000,
        challenge_poll_ms: 50,
        verify_attempts: 3,
        verify_interval_ms: 10,
        ..PortalConfig::default()
    }
}

pub fn session_cookie() -> StoredCookie {
    StoredCookie {
        name: "PHPSESSID".to_string(),
        value: "s3ss10n".to_string(),
        domain: format!(".{}", DOMAIN),
        path: "/".to_string(),
        expires: None,
        http_only: true,
        secure: true,
    }
}

/// In-memory page that reacts to the login machine's scripts
pub struct FakeDriver {
    url: Mutex<String>,
    /// Where clicking the submit button lands; `None` keeps the login page
    after_submit: Option<String>,
    submit_selector: String,
    success_visible: bool,
    consent_checked: Mutex<bool>,
    challenge_resolved: bool,
    hang_on_navigate: bool,
    panic: bool,
    cookies: Vec<StoredCookie>,
    pub actions: Mutex<Vec<String>>,
    pub imported: Mutex<Vec<StoredCookie>>,
    pub injected_tokens: Mutex<Vec<String>>,
}

impl FakeDriver {
    /// A portal that accepts the form and redirects to the dashboard
    pub fn accepting() -> Self {
        Self {
            url: Mutex::new("about:blank".to_string()),
            after_submit: Some(DASHBOARD_URL.to_string()),
            submit_selector: PortalConfig::default().selectors.submit,
            success_visible: false,
            consent_checked: Mutex::new(false),
            challenge_resolved: false,
            hang_on_navigate: false,
            panic: false,
            cookies: vec![session_cookie()],
            actions: Mutex::new(Vec::new()),
            imported: Mutex::new(Vec::new()),
            injected_tokens: Mutex::new(Vec::new()),
        }
    }

    /// A portal that keeps showing the login page after submit
    pub fn rejecting() -> Self {
        Self {
            after_submit: None,
            ..Self::accepting()
        }
    }

    /// Navigation never completes
    pub fn hanging() -> Self {
        Self {
            hang_on_navigate: true,
            ..Self::accepting()
        }
    }

    pub fn with_challenge_resolved(mut self) -> Self {
        self.challenge_resolved = true;
        self
    }

    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().clone()
    }

    pub fn did(&self, prefix: &str) -> bool {
        self.actions.lock().iter().any(|a| a.starts_with(prefix))
    }

    fn record(&self, action: String) {
        self.actions.lock().push(action);
    }
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    async fn navigate(&self, url: &str) -> BrowserResult<()> {
        self.record(format!("navigate:{}", url));
        if self.hang_on_navigate {
            std::future::pending::<()>().await;
        }
        if self.panic {
            panic!("authenticator blew up");
        }
        *self.url.lock() = url.to_string();
        Ok(())
    }

    async fn fill(&self, selector: &str, text: &str) -> BrowserResult<()> {
        self.record(format!("fill:{}={}", selector, text));
        Ok(())
    }

    async fn click(&self, selector: &str) -> BrowserResult<()> {
        self.record(format!("click:{}", selector));
        if selector == self.submit_selector {
            if let Some(next) = &self.after_submit {
                *self.url.lock() = next.clone();
            }
        } else {
            *self.consent_checked.lock() = true;
        }
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> BrowserResult<Value> {
        if script.contains("var token =") {
            let token = script
                .split("var token = ")
                .nth(1)
                .and_then(|rest| rest.split(';').next())
                .and_then(|literal| serde_json::from_str::<String>(literal).ok())
                .unwrap_or_default();
            self.injected_tokens.lock().push(token);
            return Ok(Value::String("token_injected".into()));
        }
        if script.contains("data-sitekey") {
            return Ok(Value::String(SITE_KEY.into()));
        }
        if script.contains(".checked") {
            return Ok(Value::Bool(*self.consent_checked.lock()));
        }
        if script.contains("el.value.length") {
            return Ok(Value::Bool(self.challenge_resolved));
        }
        if script.contains("!== null") {
            return Ok(Value::Bool(self.success_visible));
        }
        if script == "document.title" {
            return Ok(Value::String("Panel de control".into()));
        }
        Err(BrowserError::ScriptFailed(format!("unexpected script: {}", script)))
    }

    async fn screenshot(&self) -> BrowserResult<Vec<u8>> {
        self.record("screenshot".to_string());
        Ok(b"\x89PNG\r\n\x1a\nfake".to_vec())
    }

    async fn current_url(&self) -> BrowserResult<String> {
        Ok(self.url.lock().clone())
    }

    async fn export_session(&self) -> BrowserResult<Vec<StoredCookie>> {
        Ok(self.cookies.clone())
    }

    async fn import_session(&self, cookies: &[StoredCookie]) -> BrowserResult<()> {
        self.record(format!("import:{}", cookies.len()));
        self.imported.lock().extend_from_slice(cookies);
        Ok(())
    }

    async fn close(&self) -> BrowserResult<()> {
        self.record("close".to_string());
        Ok(())
    }
}

/// Hands out the same driver for every task
pub struct FakeDriverFactory {
    pub driver: Arc<FakeDriver>,
    pub opened: AtomicUsize,
}

impl FakeDriverFactory {
    pub fn new(driver: FakeDriver) -> Self {
        Self {
            driver: Arc::new(driver),
            opened: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DriverFactory for FakeDriverFactory {
    async fn open(&self) -> BrowserResult<Arc<dyn BrowserDriver>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(self.driver.clone())
    }
}

/// Becomes ready after `ready_after` polls, or never
pub struct CountingProvider {
    pub ready_after: Option<usize>,
    pub submits: AtomicUsize,
    pub polls: AtomicUsize,
}

impl CountingProvider {
    pub fn ready_after(polls: usize) -> Self {
        Self {
            ready_after: Some(polls),
            submits: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
        }
    }

    pub fn never_ready() -> Self {
        Self {
            ready_after: None,
            ..Self::ready_after(0)
        }
    }
}

#[async_trait]
impl SolvingProvider for CountingProvider {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn default_cost(&self) -> f64 {
        0.003
    }

    async fn submit(&self, challenge: &Challenge, _page_url: &str) -> RpaResult<String> {
        assert_eq!(challenge.site_key, SITE_KEY);
        let n = self.submits.fetch_add(1, Ordering::SeqCst);
        Ok(format!("job-{}", n + 1))
    }

    async fn poll(&self, _job_id: &str) -> RpaResult<PollStatus> {
        let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.ready_after {
            Some(after) if n >= after => Ok(PollStatus::Ready {
                token: "03AGdBq-solved-token".to_string(),
                cost: None,
            }),
            _ => Ok(PollStatus::NotReady),
        }
    }
}

/// Shares a provider with the test body through an `Arc`
pub struct SharedProvider<P>(pub Arc<P>);

#[async_trait]
impl<P: SolvingProvider> SolvingProvider for SharedProvider<P> {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn default_cost(&self) -> f64 {
        self.0.default_cost()
    }

    async fn submit(&self, challenge: &Challenge, page_url: &str) -> RpaResult<String> {
        self.0.submit(challenge, page_url).await
    }

    async fn poll(&self, job_id: &str) -> RpaResult<PollStatus> {
        self.0.poll(job_id).await
    }
}

/// Skips the browser entirely
pub struct StubAuthenticator {
    pub fail_with: Option<String>,
    pub hang: bool,
    pub panic: bool,
    pub calls: AtomicUsize,
}

impl StubAuthenticator {
    pub fn succeeding() -> Self {
        Self {
            fail_with: None,
            hang: false,
            panic: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::succeeding()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::succeeding()
        }
    }

    pub fn panicking() -> Self {
        Self {
            panic: true,
            ..Self::succeeding()
        }
    }
}

#[async_trait]
impl portal_rpa::Authenticator for StubAuthenticator {
    async fn authenticate(&self, driver: &dyn BrowserDriver, log: &TaskLog) -> RpaResult<LoginOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        if self.panic {
            panic!("authenticator blew up");
        }
        if let Some(message) = &self.fail_with {
            return Err(RpaError::Navigation(message.clone()));
        }
        log.push("stub login");
        Ok(LoginOutcome {
            mode: LoginMode::Full,
            final_url: driver.current_url().await?,
            challenge: None,
        })
    }
}

/// Extractor that always reports a scrape failure
pub struct FailingExtractor;

#[async_trait]
impl portal_rpa::Extractor for FailingExtractor {
    async fn extract(&self, _driver: &dyn BrowserDriver, _log: &TaskLog) -> RpaResult<Value> {
        Err(RpaError::Extraction("dashboard table missing".into()))
    }
}

/// Poll cadence short enough for real-time tests
pub const FAST_POLL: Duration = Duration::from_millis(10);

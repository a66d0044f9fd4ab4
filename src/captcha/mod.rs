//! Challenge-solving client for paid reCAPTCHA services
//!
//! A [`SolvingProvider`] knows one service's wire protocol (submit a job,
//! poll a job). [`PollingSolver`] owns the timing: submission retries, the
//! poll cadence, and the overall ceiling. Callers only see [`ChallengeSolver`].

mod anti_captcha;
mod two_captcha;

pub use anti_captcha::AntiCaptchaProvider;
pub use two_captcha::TwoCaptchaProvider;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CaptchaConfig;
use crate::utils::constants::SUBMIT_RETRY_DELAY_SECS;
use crate::utils::errors::{RpaError, RpaResult};

/// reCAPTCHA v2 descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub site_key: String,
    pub invisible: bool,
}

impl Challenge {
    pub fn recaptcha_v2(site_key: impl Into<String>) -> Self {
        Self {
            site_key: site_key.into(),
            invisible: false,
        }
    }
}

/// A redeemable token; used once, never persisted
#[derive(Debug, Clone)]
pub struct Solution {
    pub token: String,
    /// USD
    pub cost: f64,
    pub solve_time: Duration,
    pub provider: &'static str,
}

/// Answer to a single status query
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    Ready { token: String, cost: Option<f64> },
    NotReady,
}

/// Wire protocol of one solving service
///
/// `submit` and `poll` map service rejections to [`RpaError::Provider`],
/// failed connections to [`RpaError::Unreachable`] and other transport
/// failures to [`RpaError::Network`]. [`PollingSolver`] resubmits only on
/// `Unreachable`, since any other failure may already have created a job.
#[async_trait]
pub trait SolvingProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Charged cost when the service does not report one
    fn default_cost(&self) -> f64;

    /// Create a job; returns the provider's job id
    async fn submit(&self, challenge: &Challenge, page_url: &str) -> RpaResult<String>;

    async fn poll(&self, job_id: &str) -> RpaResult<PollStatus>;
}

#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    /// Obtain a token for `challenge` on `page_url`. Each call creates exactly
    /// one paid job.
    async fn solve(&self, challenge: &Challenge, page_url: &str) -> RpaResult<Solution>;
}

/// Submit once, then poll on a fixed cadence until ready or out of time
pub struct PollingSolver<P> {
    provider: P,
    poll_interval: Duration,
    max_wait: Duration,
    submit_attempts: u32,
}

impl<P: SolvingProvider> PollingSolver<P> {
    pub fn new(provider: P, poll_interval: Duration, max_wait: Duration) -> Self {
        Self {
            provider,
            poll_interval,
            max_wait,
            submit_attempts: 1,
        }
    }

    /// Allow resubmitting while the provider is unreachable
    pub fn with_submit_attempts(mut self, attempts: u32) -> Self {
        self.submit_attempts = attempts.max(1);
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    async fn submit(&self, challenge: &Challenge, page_url: &str) -> RpaResult<String> {
        let mut attempt = 1;
        loop {
            match self.provider.submit(challenge, page_url).await {
                Ok(job_id) => return Ok(job_id),
                Err(RpaError::Unreachable(e)) if attempt < self.submit_attempts => {
                    warn!(
                        "[{}] submit attempt {}/{} failed: {}",
                        self.provider.name(),
                        attempt,
                        self.submit_attempts,
                        e
                    );
                    attempt += 1;
                    tokio::time::sleep(Duration::from_secs(SUBMIT_RETRY_DELAY_SECS)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run(&self, challenge: &Challenge, page_url: &str, started: Instant) -> RpaResult<Solution> {
        let job_id = self.submit(challenge, page_url).await?;
        info!("[{}] job submitted: {}", self.provider.name(), job_id);

        loop {
            tokio::time::sleep(self.poll_interval).await;

            match self.provider.poll(&job_id).await {
                Ok(PollStatus::Ready { token, cost }) => {
                    let solve_time = started.elapsed();
                    info!(
                        "[{}] solved in {:.1}s",
                        self.provider.name(),
                        solve_time.as_secs_f64()
                    );
                    return Ok(Solution {
                        token,
                        cost: cost.unwrap_or_else(|| self.provider.default_cost()),
                        solve_time,
                        provider: self.provider.name(),
                    });
                }
                Ok(PollStatus::NotReady) => {
                    debug!(
                        "[{}] waiting... ({}s)",
                        self.provider.name(),
                        started.elapsed().as_secs()
                    );
                }
                Err(RpaError::Network(e) | RpaError::Unreachable(e)) => {
                    warn!("[{}] poll failed, retrying next tick: {}", self.provider.name(), e);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<P: SolvingProvider> ChallengeSolver for PollingSolver<P> {
    async fn solve(&self, challenge: &Challenge, page_url: &str) -> RpaResult<Solution> {
        let started = Instant::now();
        tokio::time::timeout(self.max_wait, self.run(challenge, page_url, started))
            .await
            .map_err(|_| RpaError::ProviderTimeout {
                provider: self.provider.name(),
                waited_secs: self.max_wait.as_secs(),
            })?
    }
}

/// Pick the configured provider; a missing key or unknown name is fatal
pub fn build_solver(config: &CaptchaConfig) -> RpaResult<Arc<dyn ChallengeSolver>> {
    let api_key = config
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| {
            RpaError::Configuration(format!(
                "captcha.api_key (or CAPTCHA_API_KEY) is required for provider '{}'",
                config.provider
            ))
        })?
        .to_string();

    let poll_interval = config.poll_interval();
    let max_wait = config.max_wait()?;
    let base_url = config.base_url.clone();

    let solver: Arc<dyn ChallengeSolver> = match config.provider.to_lowercase().as_str() {
        "2captcha" | "twocaptcha" => {
            let provider = TwoCaptchaProvider::new(api_key, base_url);
            Arc::new(
                PollingSolver::new(provider, poll_interval, max_wait)
                    .with_submit_attempts(config.submit_attempts),
            )
        }
        "anti-captcha" | "anticaptcha" => {
            let provider = AntiCaptchaProvider::new(api_key, base_url);
            Arc::new(
                PollingSolver::new(provider, poll_interval, max_wait)
                    .with_submit_attempts(config.submit_attempts),
            )
        }
        other => {
            return Err(RpaError::Configuration(format!(
                "Unknown captcha provider '{}' (expected 2captcha or anti-captcha)",
                other
            )));
        }
    };

    info!("Challenge solver ready: {}", config.provider);
    Ok(solver)
}

/// Shared HTTP client for provider APIs
fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted provider: submit results are consumed first, then poll results
    struct ScriptedProvider {
        submits: Mutex<Vec<RpaResult<String>>>,
        polls: Mutex<Vec<RpaResult<PollStatus>>>,
        submit_calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn new(submits: Vec<RpaResult<String>>, polls: Vec<RpaResult<PollStatus>>) -> Self {
            Self {
                submits: Mutex::new(submits),
                polls: Mutex::new(polls),
                submit_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl SolvingProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn default_cost(&self) -> f64 {
            0.003
        }

        async fn submit(&self, _challenge: &Challenge, _page_url: &str) -> RpaResult<String> {
            self.submit_calls.fetch_add(1, Ordering::SeqCst);
            let mut submits = self.submits.lock();
            if submits.is_empty() {
                Ok("job-1".into())
            } else {
                submits.remove(0)
            }
        }

        async fn poll(&self, _job_id: &str) -> RpaResult<PollStatus> {
            let mut polls = self.polls.lock();
            if polls.is_empty() {
                Ok(PollStatus::NotReady)
            } else {
                polls.remove(0)
            }
        }
    }

    fn solver(provider: ScriptedProvider) -> PollingSolver<ScriptedProvider> {
        PollingSolver::new(provider, Duration::from_secs(5), Duration::from_secs(180))
    }

    #[tokio::test(start_paused = true)]
    async fn ready_after_polling_uses_default_cost() {
        let provider = ScriptedProvider::new(
            vec![],
            vec![
                Ok(PollStatus::NotReady),
                Ok(PollStatus::Ready {
                    token: "03AGdBq2".into(),
                    cost: None,
                }),
            ],
        );
        let solution = solver(provider)
            .solve(&Challenge::recaptcha_v2("site-key"), "https://portal.example/")
            .await
            .unwrap();

        assert_eq!(solution.token, "03AGdBq2");
        assert_eq!(solution.cost, 0.003);
        assert_eq!(solution.provider, "scripted");
        assert_eq!(solution.solve_time, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn provider_rejection_is_not_retried() {
        let provider = ScriptedProvider::new(
            vec![Err(RpaError::provider("scripted", "ERROR_ZERO_BALANCE"))],
            vec![],
        );
        let solver = solver(provider);
        let err = solver
            .solve(&Challenge::recaptcha_v2("site-key"), "https://portal.example/")
            .await
            .unwrap_err();

        assert!(matches!(err, RpaError::Provider { .. }));
        assert_eq!(solver.provider().submit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn submit_network_error_is_never_resubmitted() {
        let provider = ScriptedProvider::new(
            vec![
                Err(RpaError::Network("operation timed out".into())),
                Ok("job-7".into()),
            ],
            vec![],
        );
        let solver = solver(provider).with_submit_attempts(3);
        let err = solver
            .solve(&Challenge::recaptcha_v2("site-key"), "https://portal.example/")
            .await
            .unwrap_err();

        assert!(matches!(err, RpaError::Network(_)));
        assert_eq!(solver.provider().submit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_submit_is_retried_up_to_the_limit() {
        let provider = ScriptedProvider::new(
            vec![
                Err(RpaError::Unreachable("connection refused".into())),
                Ok("job-7".into()),
            ],
            vec![Ok(PollStatus::Ready {
                token: "tok".into(),
                cost: Some(0.002),
            })],
        );
        let solver = solver(provider).with_submit_attempts(2);
        let solution = solver
            .solve(&Challenge::recaptcha_v2("site-key"), "https://portal.example/")
            .await
            .unwrap();

        assert_eq!(solution.cost, 0.002);
        assert_eq!(solver.provider().submit_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_submit_is_not_retried_by_default() {
        let provider = ScriptedProvider::new(
            vec![Err(RpaError::Unreachable("connection refused".into()))],
            vec![],
        );
        let solver = solver(provider);
        let err = solver
            .solve(&Challenge::recaptcha_v2("site-key"), "https://portal.example/")
            .await
            .unwrap_err();

        assert!(matches!(err, RpaError::Unreachable(_)));
        assert_eq!(solver.provider().submit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_error_aborts_solve() {
        let provider = ScriptedProvider::new(
            vec![],
            vec![
                Err(RpaError::Network("timeout".into())),
                Err(RpaError::provider("scripted", "ERROR_CAPTCHA_UNSOLVABLE")),
            ],
        );
        let err = solver(provider)
            .solve(&Challenge::recaptcha_v2("site-key"), "https://portal.example/")
            .await
            .unwrap_err();
        assert!(matches!(err, RpaError::Provider { message, .. } if message == "ERROR_CAPTCHA_UNSOLVABLE"));
    }

    #[test]
    fn build_solver_requires_key_and_known_provider() {
        let mut config = CaptchaConfig::default();
        config.api_key = None;
        assert!(matches!(build_solver(&config), Err(RpaError::Configuration(_))));

        config.api_key = Some("key".into());
        config.provider = "deathbycaptcha".into();
        assert!(matches!(build_solver(&config), Err(RpaError::Configuration(_))));

        config.provider = "anti-captcha".into();
        assert!(build_solver(&config).is_ok());
    }
}

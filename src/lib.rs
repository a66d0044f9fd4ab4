//! Unattended portal login and extraction
//!
//! A durable SQLite task queue feeds a single sequential worker. Each task
//! drives a Chrome tab through the portal login (stored-session reuse first,
//! then credentials plus a reCAPTCHA solved by a paid service) and optionally
//! extracts a record from the landing page. A scheduler enqueues one
//! extraction per interval and never stacks runs.

mod browser;
pub mod browser_setup;
pub mod captcha;
pub mod config;
pub mod login;
mod manager;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod session;
mod utils;
pub mod worker;

pub use browser::{
    BrowserDriver, BrowserError, BrowserResult, BrowserWrapper, ChromeDriver, ChromeDriverFactory,
    DriverFactory,
};
pub use captcha::{
    AntiCaptchaProvider, Challenge, ChallengeSolver, PollStatus, PollingSolver, Solution,
    SolvingProvider, TwoCaptchaProvider, build_solver,
};
pub use config::{
    BrowserConfig, CaptchaConfig, ChallengeMode, Config, PortalConfig, PortalSelectors,
    SchedulerConfig, SessionConfig, WindowConfig, WorkerConfig, load_yaml_config,
    parse_yaml_config,
};
pub use login::{
    ChallengeReceipt, Credentials, CredentialsProvider, LoginMachine, LoginMode, LoginOutcome,
    LoginState, StaticCredentials,
};
pub use manager::BrowserManager;
pub use queue::{Task, TaskKind, TaskLog, TaskQueue, TaskStatus, TaskSummary, TaskUpdate};
pub use scheduler::{Scheduler, SchedulerStatus};
pub use service::RpaService;
pub use session::{SessionSnapshot, SessionStore, StoredCookie};
pub use utils::constants;
pub use utils::{
    MAX_CHALLENGE_TIMEOUT_MS, MAX_INTERACTION_TIMEOUT_MS, MAX_NAVIGATION_TIMEOUT_MS, RpaError,
    RpaResult, validate_challenge_timeout, validate_interaction_timeout,
    validate_navigation_timeout,
};
pub use worker::{Authenticator, Extractor, LandingPageExtractor, Worker};

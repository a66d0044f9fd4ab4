//! Shared configuration constants
//!
//! Default values used throughout the crate to avoid magic numbers.

/// Chrome user agent string for stealth mode
///
/// Updated: 2025-01-29 to Chrome 132 (current stable)
///
/// Reference: https://chromiumdash.appspot.com/schedule
pub const CHROME_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.6834.160 Safari/537.36";

/// Default retry ceiling stamped on every new task
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Pending tasks fetched per worker cycle
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Cost reported for a 2captcha reCAPTCHA v2 job (~$2.99 per 1000)
pub const TWO_CAPTCHA_COST_USD: f64 = 0.003;

/// Cost assumed for an Anti-Captcha job whose result omits `cost`
pub const ANTI_CAPTCHA_FALLBACK_COST_USD: f64 = 0.003;

/// Delay between submission attempts while the provider is unreachable
pub const SUBMIT_RETRY_DELAY_SECS: u64 = 2;

/// Name of the hidden field a solved reCAPTCHA token is written to
pub const RECAPTCHA_RESPONSE_FIELD: &str = "g-recaptcha-response";

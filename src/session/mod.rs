//! Authenticated-session snapshots and their freshness rules

mod store;

pub use store::SessionStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One browser cookie, as exported from and re-imported into the driver
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    /// Seconds since the Unix epoch; `None` for session cookies
    #[serde(default)]
    pub expires: Option<f64>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

impl StoredCookie {
    /// Whether this cookie is scoped to `target` (exact host or a parent domain)
    pub fn matches_domain(&self, target: &str) -> bool {
        let cookie = self.domain.trim_start_matches('.').to_lowercase();
        let target = target.trim_start_matches('.').to_lowercase();
        if cookie.is_empty() || target.is_empty() {
            return false;
        }
        cookie == target
            || target.ends_with(&format!(".{cookie}"))
            || cookie.ends_with(&format!(".{target}"))
    }
}

/// Serialized authenticated-browser state for one identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub identity: String,
    pub cookies: Vec<StoredCookie>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn has_cookie_for(&self, target_domain: &str) -> bool {
        self.cookies.iter().any(|c| c.matches_domain(target_domain))
    }

    /// Pure freshness predicate: young enough and holding a cookie for the target
    pub fn is_fresh_at(&self, target_domain: &str, max_age: Duration, now: DateTime<Utc>) -> bool {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return false;
        };
        now - self.last_used_at < max_age && self.has_cookie_for(target_domain)
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_used_at
    }
}

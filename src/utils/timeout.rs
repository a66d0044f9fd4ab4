//! Timeout validation utilities for browser and solver operations

use std::time::Duration;

use crate::utils::errors::RpaError;

/// Maximum timeout for browser navigation operations (5 minutes)
/// Covers slow-loading portals and post-login redirects
pub const MAX_NAVIGATION_TIMEOUT_MS: u64 = 300_000; // 5 minutes

/// Maximum timeout for element interaction operations (30 seconds)
pub const MAX_INTERACTION_TIMEOUT_MS: u64 = 30_000; // 30 seconds

/// Maximum time to wait on a challenge, solved by a provider or by a human (10 minutes)
pub const MAX_CHALLENGE_TIMEOUT_MS: u64 = 600_000;

/// Validate timeout for navigation operations (navigate, post-login verification)
///
/// # Arguments
/// * `timeout_ms` - Optional timeout in milliseconds
/// * `default_ms` - Default timeout if None provided
///
/// # Returns
/// * `Ok(Duration)` - Validated Duration object
/// * `Err(RpaError::Configuration)` - If timeout exceeds MAX_NAVIGATION_TIMEOUT_MS
///
/// # Example
/// ```rust
/// let timeout = portal_rpa::validate_navigation_timeout(Some(45000), 30000)?;
/// # Ok::<(), portal_rpa::RpaError>(())
/// ```
pub fn validate_navigation_timeout(
    timeout_ms: Option<u64>,
    default_ms: u64,
) -> Result<Duration, RpaError> {
    let ms = timeout_ms.unwrap_or(default_ms);

    if ms > MAX_NAVIGATION_TIMEOUT_MS {
        return Err(RpaError::Configuration(format!(
            "Navigation timeout cannot exceed {}ms ({} minutes). Received: {}ms ({:.1} minutes)",
            MAX_NAVIGATION_TIMEOUT_MS,
            MAX_NAVIGATION_TIMEOUT_MS / 60_000,
            ms,
            ms as f64 / 60_000.0
        )));
    }

    Ok(Duration::from_millis(ms))
}

/// Validate timeout for element interaction operations (fill, click)
pub fn validate_interaction_timeout(
    timeout_ms: Option<u64>,
    default_ms: u64,
) -> Result<Duration, RpaError> {
    let ms = timeout_ms.unwrap_or(default_ms);

    if ms > MAX_INTERACTION_TIMEOUT_MS {
        return Err(RpaError::Configuration(format!(
            "Interaction timeout cannot exceed {}ms ({} seconds). Received: {}ms ({} seconds)",
            MAX_INTERACTION_TIMEOUT_MS,
            MAX_INTERACTION_TIMEOUT_MS / 1000,
            ms,
            ms / 1000
        )));
    }

    Ok(Duration::from_millis(ms))
}

/// Validate the ceiling for challenge resolution (provider polling or manual mode)
pub fn validate_challenge_timeout(timeout_ms: u64) -> Result<Duration, RpaError> {
    if timeout_ms == 0 || timeout_ms > MAX_CHALLENGE_TIMEOUT_MS {
        return Err(RpaError::Configuration(format!(
            "Challenge timeout must be between 1ms and {}ms. Received: {}ms",
            MAX_CHALLENGE_TIMEOUT_MS, timeout_ms
        )));
    }

    Ok(Duration::from_millis(timeout_ms))
}

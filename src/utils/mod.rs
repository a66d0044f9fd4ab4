pub mod constants;
pub mod errors;
mod timeout;
mod wait_for_element;

pub use errors::{RpaError, RpaResult};
pub use timeout::{
    MAX_CHALLENGE_TIMEOUT_MS, MAX_INTERACTION_TIMEOUT_MS, MAX_NAVIGATION_TIMEOUT_MS,
    validate_challenge_timeout, validate_interaction_timeout, validate_navigation_timeout,
};
pub use wait_for_element::wait_for_element;

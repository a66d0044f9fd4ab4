//! 2captcha legacy `in.php` / `res.php` API

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::{Challenge, PollStatus, SolvingProvider, http_client};
use crate::utils::constants::TWO_CAPTCHA_COST_USD;
use crate::utils::errors::{RpaError, RpaResult};

const DEFAULT_BASE_URL: &str = "https://2captcha.com";
const PROVIDER: &str = "2captcha";
const NOT_READY: &str = "CAPCHA_NOT_READY";

pub struct TwoCaptchaProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

/// Both endpoints answer `{"status": 0|1, "request": "..."}` when `json=1`
#[derive(Debug, Deserialize)]
struct LegacyResponse {
    status: i64,
    #[serde(default)]
    request: Value,
}

impl LegacyResponse {
    fn request_text(&self) -> String {
        match &self.request {
            Value::String(s) => s.clone(),
            Value::Null => "unknown".to_string(),
            other => other.to_string(),
        }
    }
}

impl TwoCaptchaProvider {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            client: http_client(),
            api_key: api_key.into(),
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        }
    }
}

fn parse_submit(body: &str) -> RpaResult<String> {
    let response: LegacyResponse = serde_json::from_str(body)
        .map_err(|e| RpaError::provider(PROVIDER, format!("unreadable submit response: {}", e)))?;
    if response.status == 1 {
        Ok(response.request_text())
    } else {
        Err(RpaError::provider(PROVIDER, response.request_text()))
    }
}

fn parse_poll(body: &str) -> RpaResult<PollStatus> {
    let response: LegacyResponse = serde_json::from_str(body)
        .map_err(|e| RpaError::provider(PROVIDER, format!("unreadable result response: {}", e)))?;
    if response.status == 1 {
        return Ok(PollStatus::Ready {
            token: response.request_text(),
            cost: None,
        });
    }
    match response.request_text().as_str() {
        NOT_READY => Ok(PollStatus::NotReady),
        error => Err(RpaError::provider(PROVIDER, error)),
    }
}

#[async_trait]
impl SolvingProvider for TwoCaptchaProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn default_cost(&self) -> f64 {
        TWO_CAPTCHA_COST_USD
    }

    async fn submit(&self, challenge: &Challenge, page_url: &str) -> RpaResult<String> {
        let invisible = if challenge.invisible { "1" } else { "0" };
        let form = [
            ("key", self.api_key.as_str()),
            ("method", "userrecaptcha"),
            ("googlekey", challenge.site_key.as_str()),
            ("pageurl", page_url),
            ("json", "1"),
            ("invisible", invisible),
        ];

        let body = self
            .client
            .post(format!("{}/in.php", self.base_url))
            .form(&form)
            .send()
            .await?
            .text()
            .await?;

        parse_submit(&body)
    }

    async fn poll(&self, job_id: &str) -> RpaResult<PollStatus> {
        let query = [
            ("key", self.api_key.as_str()),
            ("action", "get"),
            ("id", job_id),
            ("json", "1"),
        ];

        let body = self
            .client
            .get(format!("{}/res.php", self.base_url))
            .query(&query)
            .send()
            .await?
            .text()
            .await?;

        parse_poll(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_returns_job_id_or_provider_error() {
        assert_eq!(parse_submit(r#"{"status":1,"request":"2122988149"}"#).unwrap(), "2122988149");

        let err = parse_submit(r#"{"status":0,"request":"ERROR_ZERO_BALANCE"}"#).unwrap_err();
        assert!(matches!(err, RpaError::Provider { message, .. } if message == "ERROR_ZERO_BALANCE"));
    }

    #[test]
    fn poll_distinguishes_not_ready_from_errors() {
        assert_eq!(
            parse_poll(r#"{"status":0,"request":"CAPCHA_NOT_READY"}"#).unwrap(),
            PollStatus::NotReady
        );
        assert_eq!(
            parse_poll(r#"{"status":1,"request":"03AGdBq24PBC"}"#).unwrap(),
            PollStatus::Ready {
                token: "03AGdBq24PBC".into(),
                cost: None
            }
        );
        assert!(matches!(
            parse_poll(r#"{"status":0,"request":"ERROR_CAPTCHA_UNSOLVABLE"}"#),
            Err(RpaError::Provider { .. })
        ));
    }

    #[test]
    fn garbage_body_is_a_provider_error() {
        assert!(matches!(parse_submit("<html>502</html>"), Err(RpaError::Provider { .. })));
    }
}

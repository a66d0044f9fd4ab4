//! Anti-Captcha JSON API (`createTask` / `getTaskResult`)

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{Challenge, PollStatus, SolvingProvider, http_client};
use crate::utils::constants::ANTI_CAPTCHA_FALLBACK_COST_USD;
use crate::utils::errors::{RpaError, RpaResult};

const DEFAULT_BASE_URL: &str = "https://api.anti-captcha.com";
const PROVIDER: &str = "anti-captcha";

pub struct AntiCaptchaProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskResponse {
    error_id: i64,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    task_id: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskResultResponse {
    error_id: i64,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    solution: Option<TaskSolution>,
    /// Reported as a decimal string ("0.00200") or a number
    #[serde(default)]
    cost: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskSolution {
    g_recaptcha_response: String,
}

fn describe(error_id: i64, description: Option<String>) -> String {
    description.unwrap_or_else(|| format!("errorId {}", error_id))
}

fn parse_cost(raw: Option<&Value>) -> Option<f64> {
    match raw? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_create(body: &str) -> RpaResult<String> {
    let response: CreateTaskResponse = serde_json::from_str(body)
        .map_err(|e| RpaError::provider(PROVIDER, format!("unreadable createTask response: {}", e)))?;
    if response.error_id != 0 {
        return Err(RpaError::provider(
            PROVIDER,
            describe(response.error_id, response.error_description),
        ));
    }
    match response.task_id {
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        _ => Err(RpaError::provider(PROVIDER, "createTask returned no taskId")),
    }
}

fn parse_result(body: &str) -> RpaResult<PollStatus> {
    let response: TaskResultResponse = serde_json::from_str(body)
        .map_err(|e| RpaError::provider(PROVIDER, format!("unreadable getTaskResult response: {}", e)))?;
    if response.error_id != 0 {
        return Err(RpaError::provider(
            PROVIDER,
            describe(response.error_id, response.error_description),
        ));
    }
    if response.status.as_deref() != Some("ready") {
        return Ok(PollStatus::NotReady);
    }
    let solution = response
        .solution
        .ok_or_else(|| RpaError::provider(PROVIDER, "ready task without solution"))?;
    Ok(PollStatus::Ready {
        token: solution.g_recaptcha_response,
        cost: parse_cost(response.cost.as_ref()),
    })
}

impl AntiCaptchaProvider {
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

    async fn post(&self, endpoint: &str, payload: &Value) -> RpaResult<String> {
        Ok(self
            .client
            .post(format!("{}/{}", self.base_url, endpoint))
            .json(payload)
            .send()
            .await?
            .text()
            .await?)
    }
}

#[async_trait]
impl SolvingProvider for AntiCaptchaProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn default_cost(&self) -> f64 {
        ANTI_CAPTCHA_FALLBACK_COST_USD
    }

    async fn submit(&self, challenge: &Challenge, page_url: &str) -> RpaResult<String> {
        let payload = json!({
            "clientKey": self.api_key,
            "task": {
                "type": "RecaptchaV2TaskProxyless",
                "websiteURL": page_url,
                "websiteKey": challenge.site_key,
                "isInvisible": challenge.invisible,
            }
        });
        let body = self.post("createTask", &payload).await?;
        parse_create(&body)
    }

    async fn poll(&self, job_id: &str) -> RpaResult<PollStatus> {
        // taskId is numeric on the wire
        let task_id = job_id
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(job_id));
        let payload = json!({
            "clientKey": self.api_key,
            "taskId": task_id,
        });
        let body = self.post("getTaskResult", &payload).await?;
        parse_result(&body)
    }
}

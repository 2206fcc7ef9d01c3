// HTTP client for the CraftPay server API

use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::Value;

/// A response the server produced, successful or not.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct ApiClient {
    base_url: String,
    agent: ureq::Agent,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(60))
            .build();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn get(&self, path: &str) -> Result<ApiResponse> {
        into_api_response(self.agent.get(&self.url(path)).call())
    }

    pub fn post(&self, path: &str, body: &Value) -> Result<ApiResponse> {
        into_api_response(self.agent.post(&self.url(path)).send_json(body))
    }
}

/// HTTP error statuses are answers too; only transport failures are errors.
fn into_api_response(result: Result<ureq::Response, ureq::Error>) -> Result<ApiResponse> {
    let response = match result {
        Ok(response) => response,
        Err(ureq::Error::Status(_, response)) => response,
        Err(ureq::Error::Transport(e)) => return Err(anyhow!("Failed to reach server: {}", e)),
    };

    let status = response.status();
    let text = response
        .into_string()
        .map_err(|e| anyhow!("Failed to read response body: {}", e))?;
    let body = if text.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    };

    Ok(ApiResponse { status, body })
}

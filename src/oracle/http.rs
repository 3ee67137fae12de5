//! OpenAI-compatible chat completions oracle.
//!
//! Posts the repair prompt to `[oracle.http].endpoint` and takes the first
//! fenced code block of the first choice as the revision.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::prompt::{build_prompt, extract_code, SYSTEM_PROMPT};
use super::{FixRequest, OracleError, RepairOracle};
use crate::config::HttpOracleConfig;

/// Chat completions repair oracle.
pub struct HttpOracle {
    config: HttpOracleConfig,
    client: reqwest::Client,
}

impl HttpOracle {
    /// Creates an oracle talking to `config.endpoint`.
    pub fn new(config: HttpOracleConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn api_key(&self) -> Result<Option<String>, OracleError> {
        let var = self.config.api_key_env.trim();
        if var.is_empty() {
            return Ok(None);
        }
        match std::env::var(var) {
            Ok(key) if !key.trim().is_empty() => Ok(Some(key)),
            _ => Err(OracleError::misconfigured(format!(
                "environment variable {var} is not set.\n\
                 Export an API key or set [oracle.http].api_key_env in mender.toml"
            ))),
        }
    }
}

#[async_trait]
impl RepairOracle for HttpOracle {
    fn name(&self) -> &'static str {
        "HTTP"
    }

    #[allow(tail_expr_drop_order)]
    async fn propose_fix(&self, request: &FixRequest<'_>) -> Result<Option<String>, OracleError> {
        let api_key = self.api_key()?;
        let payload = json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": build_prompt(request) },
            ],
        });

        debug!(
            "Requesting fix for {} from {} ({})",
            request.unit.path, self.config.endpoint, self.config.model
        );

        let mut builder = self.client.post(&self.config.endpoint).json(&payload);
        if let Some(key) = api_key {
            builder = builder.bearer_auth(key);
        }

        // Network errors are worth a retry
        let response = builder
            .send()
            .await
            .map_err(|e| OracleError::transient(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| OracleError::transient(e.to_string()))?;

        if status.is_server_error() || status.as_u16() == 429 {
            return Err(OracleError::transient(format!(
                "endpoint returned {status}: {}",
                snippet(&body)
            )));
        }
        if !status.is_success() {
            return Err(OracleError::rejected(format!(
                "endpoint returned {status}: {}",
                snippet(&body)
            )));
        }

        parse_completion(&body)
    }
}

/// Pulls the revision out of a chat completions response body.
fn parse_completion(body: &str) -> Result<Option<String>, OracleError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| OracleError::rejected(format!("invalid response JSON: {e}")))?;

    let content = value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| OracleError::rejected("response has no choices[0].message.content"))?;

    Ok(extract_code(content))
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

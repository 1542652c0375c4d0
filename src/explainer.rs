//! External explainer collaborator (fire-and-forget HTTP, spec §6). Grounded on
//! `original_source/jobs/ai_explainer_runner.py` (httpx.AsyncClient timeout=1.0, POST
//! `{AI_EXPLAINER_URL}/explain/anomaly`, non-2xx/exception caught-and-logged-never-blocks).

use serde::Serialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
pub struct ModelOutput<'a> {
    pub metric: &'a str,
    pub observed_value: f64,
    pub expected_range: (f64, f64),
    pub anomaly_score: f64,
    pub model: &'a str,
    pub model_version: &'a str,
}

#[derive(Debug, Serialize)]
struct ExplainRequest<'a> {
    context: serde_json::Value,
    model_output: ModelOutput<'a>,
}

pub struct ExplainerClient {
    client: reqwest::Client,
    base_url: String,
}

impl ExplainerClient {
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, base_url })
    }

    /// Fire-and-forget: any non-2xx response or transport error is logged and
    /// swallowed. Never blocks the calling pipeline on failure.
    pub async fn explain_anomaly(&self, context: serde_json::Value, model_output: ModelOutput<'_>) {
        let url = format!("{}/explain/anomaly", self.base_url.trim_end_matches('/'));
        let body = ExplainRequest { context, model_output };
        match self.client.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                tracing::warn!(status = %response.status(), url, "explainer returned non-2xx");
            }
            Err(err) => {
                tracing::warn!(error = %err, url, "explainer request failed");
            }
        }
    }
}

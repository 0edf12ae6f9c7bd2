//! Generation backend seam and its HTTP queue implementation.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::types::{GenerationOutput, GenerationRequest, JobStatus, StatusReport};
use crate::utils::http_client;
use crate::{Error, Result};

/// An asynchronous job executor for generation requests.
///
/// Implementations must never block on the result: `submit` returns as soon
/// as the backend has accepted the job.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Submit a request and return the backend's job handle.
    async fn submit(&self, request: &GenerationRequest) -> Result<String>;

    /// Check the status of a job.
    async fn status(&self, job_id: &str) -> Result<StatusReport>;

    /// Fetch the output of a completed job.
    async fn result(&self, job_id: &str) -> Result<GenerationOutput>;

    /// Backend name for logging.
    fn name(&self) -> &'static str;
}

/// HTTP queue backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpBackendConfig {
    /// Queue base URL.
    pub base_url: String,
    /// Application path under the base URL.
    pub app: String,
    /// API key. Submissions fail with `BackendUnavailable` when absent.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "https://queue.fal.run".to_string(),
            app: "fal-ai/any-llm".to_string(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Serialize)]
struct SubmitBody<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_prompt: Option<&'a str>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    request_id: String,
}

#[derive(Debug, Deserialize)]
struct BackendLogLine {
    message: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    logs: Option<Vec<BackendLogLine>>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    queue_position: Option<u32>,
}

/// Queue backend reached over HTTP.
pub struct HttpBackend {
    config: HttpBackendConfig,
    client: Client,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> Self {
        let client = http_client::build_client(Duration::from_secs(config.timeout_secs));
        Self { config, client }
    }

    fn app_url(&self) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.app.trim_matches('/')
        )
    }

    fn request_url(&self, job_id: &str) -> String {
        format!("{}/requests/{}", self.app_url(), job_id)
    }

    fn auth_header(&self) -> Result<String> {
        match self.config.api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => Ok(format!("Key {}", key.trim())),
            _ => Err(Error::BackendUnavailable(
                "generation API key is not configured".to_string(),
            )),
        }
    }
}

#[async_trait]
impl GenerationBackend for HttpBackend {
    async fn submit(&self, request: &GenerationRequest) -> Result<String> {
        let auth = self.auth_header()?;
        let body = SubmitBody {
            model: &request.model,
            prompt: &request.prompt,
            system_prompt: request.system_prompt.as_deref(),
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(self.app_url())
            .header(reqwest::header::AUTHORIZATION, auth)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Submission(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Submission(format!("{} - {}", status, text)));
        }

        let parsed: SubmitResponse = response
            .json()
            .await
            .map_err(|e| Error::Submission(format!("invalid submit response: {}", e)))?;

        debug!(job_id = %parsed.request_id, step = %request.step, "Submitted generation job");
        Ok(parsed.request_id)
    }

    async fn status(&self, job_id: &str) -> Result<StatusReport> {
        let auth = self
            .auth_header()
            .map_err(|e| Error::Poll(e.to_string()))?;
        let response = self
            .client
            .get(format!("{}/status", self.request_url(job_id)))
            .query(&[("logs", "1")])
            .header(reqwest::header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| Error::Poll(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Poll(format!(
                "status check for {} returned {}",
                job_id,
                response.status()
            )));
        }

        let parsed: StatusResponse = response
            .json()
            .await
            .map_err(|e| Error::Poll(format!("invalid status response: {}", e)))?;

        let status = JobStatus::from_backend(&parsed.status);
        Ok(StatusReport {
            status,
            logs: parsed
                .logs
                .unwrap_or_default()
                .into_iter()
                .map(|line| line.message)
                .collect(),
            error: match status {
                JobStatus::Failed => parsed.error.or_else(|| Some("unknown error".to_string())),
                _ => parsed.error,
            },
            queue_position: parsed.queue_position,
        })
    }

    async fn result(&self, job_id: &str) -> Result<GenerationOutput> {
        let auth = self.auth_header()?;
        let response = self
            .client
            .get(self.request_url(job_id))
            .header(reqwest::header::AUTHORIZATION, auth)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Other(format!(
                "fetching result for {} failed: {} - {}",
                job_id, status, text
            )));
        }

        Ok(response.json::<GenerationOutput>().await?)
    }

    fn name(&self) -> &'static str {
        "http-queue"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let backend = HttpBackend::new(HttpBackendConfig {
            base_url: "https://queue.example.com/".to_string(),
            app: "/acme/llm/".to_string(),
            ..Default::default()
        });
        assert_eq!(backend.app_url(), "https://queue.example.com/acme/llm");
        assert_eq!(
            backend.request_url("abc"),
            "https://queue.example.com/acme/llm/requests/abc"
        );
    }

    #[tokio::test]
    async fn test_submit_without_key_is_unavailable() {
        let backend = HttpBackend::new(HttpBackendConfig::default());
        let request = GenerationRequest::new("TITLE", "model", "prompt");
        let err = backend.submit(&request).await.unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));
    }

    #[test]
    fn test_status_response_parsing() {
        let json = r#"{"status":"IN_PROGRESS","logs":[{"message":"loading","timestamp":"x"}]}"#;
        let parsed: StatusResponse = serde_json::from_str(json).unwrap();
        assert_eq!(JobStatus::from_backend(&parsed.status), JobStatus::Processing);
        assert_eq!(parsed.logs.unwrap()[0].message, "loading");
    }
}

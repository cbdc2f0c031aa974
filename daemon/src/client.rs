use async_trait::async_trait;
use common::{DerivedStatus, JobId};
use serde_json::Value;
use std::time::Duration;

use crate::config::UpstreamConfig;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    /// Upstream answered with a non-success HTTP status
    #[error("{0}")]
    Status(u16),

    #[error("{0}")]
    Transport(String),

    #[error("invalid response body: {0}")]
    Decode(String),

    #[error("timed out")]
    Timeout,
}

/// Pull side of status reconciliation.
#[async_trait]
pub trait StatusSource: Send + Sync + 'static {
    async fn fetch_status(&self, job_id: &JobId) -> Result<DerivedStatus, FetchError>;
}

/// Recent-jobs listing used by the auditor. Returns the raw body; envelope
/// decoding happens in the auditor.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn list_jobs(&self, limit: usize) -> Result<Value, FetchError>;
}

/// HTTP client for the job status and job listing edge functions.
#[derive(Clone)]
pub struct EdgeClient {
    http: reqwest::Client,
    base_url: String,
    status_path: String,
    list_path: String,
    api_key: Option<String>,
}

impl EdgeClient {
    pub fn new(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            status_path: config.status_path.trim_matches('/').to_string(),
            list_path: config.list_path.trim_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let mut request = self.http.get(format!("{}/{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key).bearer_auth(key);
        }
        request
    }

    async fn get_json(&self, request: reqwest::RequestBuilder) -> Result<Value, FetchError> {
        let response = request.send().await.map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))
    }
}

fn transport_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport(e.to_string())
    }
}

#[async_trait]
impl StatusSource for EdgeClient {
    async fn fetch_status(&self, job_id: &JobId) -> Result<DerivedStatus, FetchError> {
        let request = self.get(&self.status_path).query(&[("jobId", job_id.0.as_str())]);
        let body = self.get_json(request).await?;

        let payload = unwrap_status_envelope(body);

        let mut status: DerivedStatus =
            serde_json::from_value(payload).map_err(|e| FetchError::Decode(e.to_string()))?;
        status.last_update = chrono::Utc::now();
        Ok(status)
    }
}

/// Some deployments wrap the payload as `{"data": {...}}` or `{"status": {...}}`.
fn unwrap_status_envelope(body: Value) -> Value {
    let inner = match &body {
        Value::Object(map) if !map.contains_key("job_id") && !map.contains_key("jobId") => map
            .get("data")
            .or_else(|| map.get("status").filter(|v| v.is_object()))
            .cloned(),
        _ => None,
    };
    inner.unwrap_or(body)
}

#[async_trait]
impl JobSource for EdgeClient {
    async fn list_jobs(&self, limit: usize) -> Result<Value, FetchError> {
        let request = self.get(&self.list_path).query(&[("limit", limit)]);
        self.get_json(request).await
    }
}

/// Runs `fut` with an upper bound so a hung call cannot hold up later ticks.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, FetchError>
where
    F: std::future::Future<Output = Result<T, FetchError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout),
    }
}

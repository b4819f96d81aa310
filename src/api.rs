use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::job::Job;

/// Request timeout. Submission returns as soon as the job is queued (the
/// service processes in the background), so a long timeout only delays
/// failure reporting.
const REQUEST_TIMEOUT_SECS: u64 = 30;

static HTTP: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()
        // builder only fails on TLS backend misconfiguration
        .unwrap_or_default()
});

/// Body for `POST /api/extract`.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractRequest {
    pub url: String,
    pub prompt: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: String,
}

/// The Job API surface consumed by the reconciler.
///
/// Implementations perform the network call and nothing else; persistent
/// state stays out so the reconciler can be exercised against a stub
/// transport.
#[async_trait]
pub trait JobApi: Send + Sync {
    async fn submit(&self, request: &ExtractRequest) -> Result<Job>;
    async fn poll(&self, job_id: &str) -> Result<Job>;
}

/// HTTP client for the clip-extraction service.
pub struct HttpJobClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpJobClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: HTTP.clone(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Connectivity probe against the service's `/health` endpoint.
    pub async fn health(&self) -> bool {
        match self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn error_detail(response: reqwest::Response) -> String {
        let status = response.status();
        match response.json::<ErrorBody>().await {
            Ok(body) => body.detail,
            Err(_) => format!("server returned {status}"),
        }
    }

    async fn parse_job(response: reqwest::Response) -> Result<Job> {
        response
            .json::<Job>()
            .await
            .map_err(|err| ClientError::MalformedResponse {
                reason: err.to_string(),
            })
    }
}

#[async_trait]
impl JobApi for HttpJobClient {
    async fn submit(&self, request: &ExtractRequest) -> Result<Job> {
        debug!(url = %request.url, "submitting extraction job");
        let response = self
            .http
            .post(format!("{}/api/extract", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(ClientError::Network)?;

        if !response.status().is_success() {
            let detail = Self::error_detail(response).await;
            return Err(ClientError::Validation { detail });
        }
        Self::parse_job(response).await
    }

    async fn poll(&self, job_id: &str) -> Result<Job> {
        debug!(job_id, "polling job status");
        let response = self
            .http
            .get(format!("{}/api/jobs/{}", self.base_url, job_id))
            .send()
            .await
            .map_err(ClientError::Network)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound {
                job_id: job_id.to_string(),
            });
        }
        if !response.status().is_success() {
            let detail = Self::error_detail(response).await;
            return Err(ClientError::Validation { detail });
        }
        Self::parse_job(response).await
    }
}

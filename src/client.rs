use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::models::job::{CreateJobRequest, Job};
use crate::routes::jobs::CreateJobResponse;
use crate::services::polling::{poll_until_terminal, PollError, PollOutcome, PollPolicy};

/// HTTP client for the job API.
pub struct ApiClient {
    http: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Submit a job and return its id.
    pub async fn submit(&self, request: &CreateJobRequest) -> Result<String, ClientError> {
        let response = self
            .http
            .post(format!("{}/api/jobs", self.base_url))
            .json(request)
            .send()
            .await?;
        let body: CreateJobResponse = Self::parse(response).await?;
        Ok(body.job_id)
    }

    pub async fn fetch(&self, job_id: &str) -> Result<Job, ClientError> {
        let response = self
            .http
            .get(format!("{}/api/jobs/{}", self.base_url, job_id))
            .send()
            .await?;
        Self::parse(response).await
    }

    pub async fn cancel(&self, job_id: &str) -> Result<Job, ClientError> {
        let response = self
            .http
            .post(format!("{}/api/jobs/{}/cancel", self.base_url, job_id))
            .send()
            .await?;
        Self::parse(response).await
    }

    /// Poll the job until it reaches a terminal status.
    pub async fn wait(
        &self,
        job_id: &str,
        policy: &PollPolicy,
    ) -> Result<PollOutcome, PollError<ClientError>> {
        poll_until_terminal(move || self.fetch(job_id), policy).await
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let text = response.text().await?;
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.error)
            .unwrap_or(text);
        Err(ClientError::Api { status, message })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned {status}: {message}")]
    Api { status: StatusCode, message: String },
}

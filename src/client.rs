//! Thin JSON client for the orchestrator's HTTP API.

use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::api::types::{ErrorBody, SubmitJobResponse, API_KEY_HEADER};
use crate::error::{OrchestratorError, Result};
use crate::fleet::Robot;
use crate::scheduler::{Job, JobSpec, JobStatus};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => builder.header(API_KEY_HEADER, key),
            None => builder,
        }
    }

    /// Sends `body` and decodes a JSON reply. `Ok(None)` on `204`.
    pub(crate) async fn send<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<Option<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = self.request(method, path);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = check(request.send().await?).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Ok(Some(response.json().await?))
    }

    /// Like `send` but a `204` is an error.
    pub(crate) async fn send_expect<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(method, path, body)
            .await?
            .ok_or_else(|| OrchestratorError::Api {
                status: StatusCode::NO_CONTENT.as_u16(),
                message: format!("empty response from {path}"),
            })
    }

    pub async fn submit_job(&self, spec: &JobSpec) -> Result<Uuid> {
        let response: SubmitJobResponse = self
            .send_expect(Method::POST, "/api/v1/jobs", Some(spec))
            .await?;
        Ok(response.job_id)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Job> {
        self.send_expect::<(), _>(Method::GET, &format!("/api/v1/jobs/{job_id}"), None)
            .await
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let path = match status {
            Some(status) => format!("/api/v1/jobs?status={status}"),
            None => "/api/v1/jobs".to_string(),
        };
        self.send_expect::<(), _>(Method::GET, &path, None).await
    }

    pub async fn list_robots(&self) -> Result<Vec<Robot>> {
        self.send_expect::<(), _>(Method::GET, "/api/v1/robots", None)
            .await
    }
}

/// Turns non-2xx replies into errors, keeping the server's message.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(OrchestratorError::Unauthorized);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.error)
        .unwrap_or(text);
    Err(OrchestratorError::Api {
        status: status.as_u16(),
        message,
    })
}

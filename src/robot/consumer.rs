use reqwest::Method;
use uuid::Uuid;

use crate::api::types::{
    ClaimJobsRequest, ClaimJobsResponse, CompleteJobRequest, CompleteJobResponse,
    ExtendLeaseRequest, ExtendLeaseResponse, FailJobRequest, FailJobResponse,
    RegisterRobotRequest,
};
use crate::client::ApiClient;
use crate::error::Result;
use crate::fleet::Robot;
use crate::scheduler::{CompletionOutcome, Job};

/// Robot-side half of the job protocol.
#[derive(Debug, Clone)]
pub struct RobotJobConsumer {
    client: ApiClient,
}

impl RobotJobConsumer {
    pub fn new(server_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: ApiClient::new(server_url)?.with_api_key(api_key),
        })
    }

    pub async fn register(&self, registration: &RegisterRobotRequest) -> Result<Robot> {
        self.client
            .send_expect(Method::POST, "/api/v1/robots/register", Some(registration))
            .await
    }

    pub async fn heartbeat(&self) -> Result<Robot> {
        self.client
            .send_expect(
                Method::POST,
                "/api/v1/robots/heartbeat",
                Some(&serde_json::json!({})),
            )
            .await
    }

    /// Graceful stop. Jobs still held keep their leases.
    pub async fn go_offline(&self) -> Result<Robot> {
        self.client
            .send_expect(
                Method::POST,
                "/api/v1/robots/offline",
                Some(&serde_json::json!({})),
            )
            .await
    }

    /// Asks for one job. `None` when nothing is eligible.
    pub async fn claim_job(
        &self,
        environment: Option<&str>,
        visibility_timeout_secs: u64,
    ) -> Result<Option<Job>> {
        let request = ClaimJobsRequest {
            environment: environment.map(str::to_string),
            limit: Some(1),
            visibility_timeout_seconds: Some(visibility_timeout_secs),
        };
        Ok(self.claim_jobs(&request).await?.into_iter().next())
    }

    pub async fn claim_jobs(&self, request: &ClaimJobsRequest) -> Result<Vec<Job>> {
        let response: Option<ClaimJobsResponse> = self
            .client
            .send(Method::POST, "/api/v1/jobs/claim", Some(request))
            .await?;
        Ok(response.map(|r| r.jobs).unwrap_or_default())
    }

    /// False means the lease is gone and the job should be abandoned.
    pub async fn extend_lease(&self, job_id: Uuid, extension_seconds: u64) -> Result<bool> {
        let response: ExtendLeaseResponse = self
            .client
            .send_expect(
                Method::POST,
                &format!("/api/v1/jobs/{job_id}/extend-lease"),
                Some(&ExtendLeaseRequest { extension_seconds }),
            )
            .await?;
        Ok(response.extended)
    }

    /// An "already completed" reply counts as success.
    pub async fn report_completion(
        &self,
        job_id: Uuid,
        result: serde_json::Value,
    ) -> Result<CompletionOutcome> {
        let response: CompleteJobResponse = self
            .client
            .send_expect(
                Method::POST,
                &format!("/api/v1/jobs/{job_id}/complete"),
                Some(&CompleteJobRequest { result }),
            )
            .await?;
        if response.status == CompletionOutcome::AlreadyCompleted {
            tracing::debug!(job_id = %job_id, "Completion was already recorded");
        }
        Ok(response.status)
    }

    pub async fn report_failure(&self, job_id: Uuid, error: impl Into<String>) -> Result<FailJobResponse> {
        self.client
            .send_expect(
                Method::POST,
                &format!("/api/v1/jobs/{job_id}/fail"),
                Some(&FailJobRequest {
                    error: error.into(),
                }),
            )
            .await
    }
}

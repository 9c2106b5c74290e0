use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateway::AwaitOutcome;
use crate::jobs::{Job, JobStatus};

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub prompt: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct WaitQuery {
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CacheInfoQuery {
    pub prompt: Option<String>,
    /// Defaults to the first provider in dispatch order.
    pub provider: Option<String>,
    /// Defaults to the provider's configured model.
    pub model: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CacheClearResponse {
    pub cleared: u64,
}

/// Body of `/generate` and `/jobs/:id/wait`.
#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub job_id: Uuid,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&AwaitOutcome> for GenerateResponse {
    fn from(outcome: &AwaitOutcome) -> Self {
        match outcome {
            AwaitOutcome::Finished(job) => Self {
                job_id: job.id,
                status: job.status.as_str().to_string(),
                response: job.result.clone(),
                provider: job.provider.clone(),
                error: job.error.clone(),
            },
            AwaitOutcome::Pending(job) => Self {
                job_id: job.id,
                status: "pending".to_string(),
                response: None,
                provider: None,
                error: None,
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobView {
    pub id: Uuid,
    pub status: JobStatus,
    pub prompt: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub provider: Option<String>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            prompt: job.prompt,
            result: job.result,
            error: job.error,
            provider: job.provider,
            attempts: job.attempts,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub store: bool,
    pub providers: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub prompt: String,
    pub status: JobStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    /// Name of the provider that produced `result`.
    pub provider: Option<String>,
    pub attempts: i32,

    pub locked_by: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retrieved_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.lock_expires_at.map_or(true, |t| t <= now)
    }
}

/// Row shape as stored in Postgres; `status` is text there.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub id: Uuid,
    pub prompt: String,
    pub status: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub provider: Option<String>,
    pub attempts: i32,
    pub locked_by: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retrieved_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> anyhow::Result<Self> {
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| anyhow::anyhow!("job {} has unknown status {:?}", row.id, row.status))?;

        Ok(Job {
            id: row.id,
            prompt: row.prompt,
            status,
            result: row.result,
            error: row.error,
            provider: row.provider,
            attempts: row.attempts,
            locked_by: row.locked_by,
            lock_expires_at: row.lock_expires_at,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            retrieved_at: row.retrieved_at,
            expires_at: row.expires_at,
        })
    }
}

/// How long terminal jobs are kept.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    /// From the terminal write, whether or not anyone reads the result.
    pub result_ttl: Duration,
    /// From the first time the gateway hands the terminal state back.
    pub retrieved_ttl: Duration,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            result_ttl: Duration::from_secs(3_600),
            retrieved_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub fn add(&mut self, status: JobStatus, n: i64) {
        match status {
            JobStatus::Pending => self.pending += n,
            JobStatus::Running => self.running += n,
            JobStatus::Succeeded => self.succeeded += n,
            JobStatus::Failed => self.failed += n,
        }
    }
}

pub(crate) fn millis(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

pub(crate) fn span(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(millis(d))
}

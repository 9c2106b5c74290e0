use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::jobs::model::{Job, JobStatus, StatusCounts};

/// Result of trying to move a job into `Running`.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// This worker now owns the job until the lease runs out.
    Claimed(Job),
    Conflict(ConflictReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// Another worker holds a live lease. The queue entry should be left to
    /// reappear, so the job is reclaimed if that worker dies.
    Leased {
        owner: Option<String>,
        until: Option<DateTime<Utc>>,
    },
    /// Already finished; nothing left to do for this id.
    Terminal(JobStatus),
    /// Unknown or expired id.
    Missing,
}

/// Durable job records.
///
/// Only two writers ever touch a job: the gateway through `create`, and the
/// worker holding the lease through `mark_running`, `complete`, `fail` and
/// `release`. Every write is a single conditional update, so concurrent
/// callers cannot both succeed.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a `Pending` job. The prompt must already be validated.
    async fn create(&self, prompt: &str) -> anyhow::Result<Uuid>;

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Job>>;

    /// Claim: `Pending -> Running`, or take over a `Running` job whose lease
    /// has expired. Exactly one concurrent caller can win.
    async fn mark_running(
        &self,
        id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> anyhow::Result<ClaimOutcome>;

    /// `Running -> Succeeded`. Returns `false` (and writes nothing) unless
    /// `worker_id` still owns the running job.
    async fn complete(
        &self,
        id: Uuid,
        worker_id: &str,
        result: &str,
        provider: &str,
    ) -> anyhow::Result<bool>;

    /// `Running -> Failed`, same ownership rule as `complete`.
    async fn fail(&self, id: Uuid, worker_id: &str, error: &str) -> anyhow::Result<bool>;

    /// Give the lease up early so another worker can reclaim the job now.
    async fn release(&self, id: Uuid, worker_id: &str) -> anyhow::Result<bool>;

    /// Shorten retention of a terminal job once its result has been handed out.
    async fn mark_retrieved(&self, id: Uuid) -> anyhow::Result<()>;

    async fn status_counts(&self) -> anyhow::Result<StatusCounts>;

    async fn ping(&self) -> anyhow::Result<()>;
}

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::jobs::model::{millis, Job, JobRow, JobStatus, Retention, StatusCounts};
use crate::jobs::store::{ClaimOutcome, ConflictReason, JobStore};

/// Postgres-backed `JobStore`.
#[derive(Clone)]
pub struct JobsRepo {
    pool: PgPool,
    retention: Retention,
}

impl JobsRepo {
    pub fn new(pool: PgPool, retention: Retention) -> Self {
        Self { pool, retention }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn conflict_for(job: Option<Job>) -> ConflictReason {
        match job {
            None => ConflictReason::Missing,
            Some(j) if j.status.is_terminal() => ConflictReason::Terminal(j.status),
            Some(j) => ConflictReason::Leased {
                owner: j.locked_by,
                until: j.lock_expires_at,
            },
        }
    }
}

#[async_trait]
impl JobStore for JobsRepo {
    async fn create(&self, prompt: &str) -> anyhow::Result<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (prompt, status)
            VALUES ($1, 'pending')
            RETURNING id
            "#,
        )
        .bind(prompt)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Job>> {
        // Rows past their expiry are gone as far as callers are concerned,
        // even if maintenance has not deleted them yet.
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT *
            FROM jobs
            WHERE id = $1
              AND (expires_at IS NULL OR expires_at > now())
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn mark_running(
        &self,
        id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> anyhow::Result<ClaimOutcome> {
        let claimed = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = 'running',
                locked_by = $2,
                lock_expires_at = now() + ($3::bigint * interval '1 millisecond'),
                started_at = COALESCE(started_at, now()),
                attempts = attempts + 1,
                updated_at = now()
            WHERE id = $1
              AND (
                    status = 'pending'
                 OR (status = 'running' AND (lock_expires_at IS NULL OR lock_expires_at <= now()))
              )
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(millis(lease))
        .fetch_optional(&self.pool)
        .await?;

        match claimed {
            Some(row) => Ok(ClaimOutcome::Claimed(Job::try_from(row)?)),
            None => Ok(ClaimOutcome::Conflict(Self::conflict_for(self.get(id).await?))),
        }
    }

    async fn complete(
        &self,
        id: Uuid,
        worker_id: &str,
        result: &str,
        provider: &str,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'succeeded',
                result = $3,
                provider = $4,
                locked_by = NULL,
                lock_expires_at = NULL,
                finished_at = now(),
                expires_at = now() + ($5::bigint * interval '1 millisecond'),
                updated_at = now()
            WHERE id = $1
              AND status = 'running'
              AND locked_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(result)
        .bind(provider)
        .bind(millis(self.retention.result_ttl))
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn fail(&self, id: Uuid, worker_id: &str, error: &str) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                error = $3,
                locked_by = NULL,
                lock_expires_at = NULL,
                finished_at = now(),
                expires_at = now() + ($4::bigint * interval '1 millisecond'),
                updated_at = now()
            WHERE id = $1
              AND status = 'running'
              AND locked_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(error)
        .bind(millis(self.retention.result_ttl))
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn release(&self, id: Uuid, worker_id: &str) -> anyhow::Result<bool> {
        // Status stays 'running'; an expired lease is what lets the next
        // claimer take over.
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET lock_expires_at = now(),
                updated_at = now()
            WHERE id = $1
              AND status = 'running'
              AND locked_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn mark_retrieved(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET retrieved_at = COALESCE(retrieved_at, now()),
                expires_at = LEAST(
                    COALESCE(expires_at, 'infinity'::timestamptz),
                    now() + ($2::bigint * interval '1 millisecond')
                ),
                updated_at = now()
            WHERE id = $1
              AND status IN ('succeeded', 'failed')
            "#,
        )
        .bind(id)
        .bind(millis(self.retention.retrieved_ttl))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn status_counts(&self) -> anyhow::Result<StatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)
            FROM jobs
            WHERE expires_at IS NULL OR expires_at > now()
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            if let Some(s) = JobStatus::parse(&status) {
                counts.add(s, n);
            }
        }
        Ok(counts)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

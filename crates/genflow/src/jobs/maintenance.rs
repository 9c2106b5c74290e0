use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::jobs::model::millis;

/// Periodic housekeeping that keeps the store and the queue consistent.
#[async_trait]
pub trait Maintenance: Send + Sync {
    /// Re-enqueue non-terminal jobs that have no queue entry and have not
    /// been touched for `older_than`. Covers a gateway that died between
    /// creating a job and enqueueing it. Returns the number requeued.
    async fn requeue_orphans(&self, older_than: Duration) -> anyhow::Result<u64>;

    /// Delete terminal jobs past their `expires_at`. Returns the number removed.
    async fn expire_finished(&self) -> anyhow::Result<u64>;
}

#[derive(Clone)]
pub struct MaintenanceRepo {
    pool: PgPool,
}

impl MaintenanceRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Maintenance for MaintenanceRepo {
    async fn requeue_orphans(&self, older_than: Duration) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            INSERT INTO job_queue (job_id)
            SELECT j.id
            FROM jobs j
            WHERE j.updated_at < now() - ($1::bigint * interval '1 millisecond')
              AND (
                    j.status = 'pending'
                 OR (j.status = 'running' AND (j.lock_expires_at IS NULL OR j.lock_expires_at <= now()))
              )
              AND NOT EXISTS (SELECT 1 FROM job_queue q WHERE q.job_id = j.id)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(millis(older_than))
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn expire_finished(&self) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('succeeded', 'failed')
              AND expires_at IS NOT NULL
              AND expires_at <= now()
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }
}

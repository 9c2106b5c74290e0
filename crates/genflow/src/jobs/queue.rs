use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::time::Instant;
use uuid::Uuid;

use crate::jobs::model::millis;

/// One handout of a queue entry to a worker.
///
/// `deliveries` is the entry's delivery counter at handout time. `ack` and
/// `release` only act while it still matches, so a worker whose visibility
/// window lapsed cannot drop an entry that has since been given to someone
/// else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub entry_id: i64,
    pub job_id: Uuid,
    pub deliveries: i32,
}

/// At-least-once FIFO of job ids between the gateway and the workers.
///
/// An entry taken by `dequeue` is hidden for `visibility` and comes back on
/// its own unless acknowledged, which is how a crashed worker's job gets
/// picked up again.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueueing an id that is already queued is a no-op.
    async fn enqueue(&self, job_id: Uuid) -> anyhow::Result<()>;

    /// Waits up to `wait` for a visible entry.
    async fn dequeue(
        &self,
        worker_id: &str,
        visibility: Duration,
        wait: Duration,
    ) -> anyhow::Result<Option<Delivery>>;

    /// Remove the entry for good.
    async fn ack(&self, delivery: &Delivery) -> anyhow::Result<bool>;

    /// Make the entry visible again right away.
    async fn release(&self, delivery: &Delivery) -> anyhow::Result<bool>;

    /// Entries currently visible to `dequeue`.
    async fn len(&self) -> anyhow::Result<i64>;
}

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Clone)]
pub struct QueueRepo {
    pool: PgPool,
}

impl QueueRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn try_dequeue(
        &self,
        worker_id: &str,
        visibility: Duration,
    ) -> anyhow::Result<Option<Delivery>> {
        let row: Option<(i64, Uuid, i32)> = sqlx::query_as(
            r#"
            WITH next AS (
                SELECT id
                FROM job_queue
                WHERE visible_at <= now()
                ORDER BY visible_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE job_queue q
            SET visible_at = now() + ($2::bigint * interval '1 millisecond'),
                deliveries = q.deliveries + 1,
                leased_by = $1
            FROM next
            WHERE q.id = next.id
            RETURNING q.id, q.job_id, q.deliveries
            "#,
        )
        .bind(worker_id)
        .bind(millis(visibility))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(entry_id, job_id, deliveries)| Delivery {
            entry_id,
            job_id,
            deliveries,
        }))
    }
}

#[async_trait]
impl JobQueue for QueueRepo {
    async fn enqueue(&self, job_id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_queue (job_id)
            VALUES ($1)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dequeue(
        &self,
        worker_id: &str,
        visibility: Duration,
        wait: Duration,
    ) -> anyhow::Result<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(d) = self.try_dequeue(worker_id, visibility).await? {
                return Ok(Some(d));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            DELETE FROM job_queue
            WHERE id = $1 AND deliveries = $2
            "#,
        )
        .bind(delivery.entry_id)
        .bind(delivery.deliveries)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn release(&self, delivery: &Delivery) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE job_queue
            SET visible_at = now(),
                leased_by = NULL
            WHERE id = $1 AND deliveries = $2
            "#,
        )
        .bind(delivery.entry_id)
        .bind(delivery.deliveries)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn len(&self) -> anyhow::Result<i64> {
        let n: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM job_queue
            WHERE visible_at <= now()
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::jobs::queue::{Delivery, JobQueue};
use crate::jobs::store::{ClaimOutcome, ConflictReason, JobStore};
use crate::providers::Dispatcher;

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded { provider: String },
    Failed { error: String },
    /// Claim conflict; nothing was dispatched.
    Skipped(ConflictReason),
    /// The lease was lost while dispatching and another worker now owns the
    /// job, so our result was discarded.
    LeaseLost,
    /// Shutdown was requested mid-dispatch; the job and its entry were handed
    /// back for another worker.
    Interrupted,
}

/// Executes a single dequeued job: claim, dispatch, record.
#[derive(Clone)]
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    dispatcher: Dispatcher,
    lease: Duration,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        dispatcher: Dispatcher,
        lease: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            dispatcher,
            lease,
        }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub async fn process(
        &self,
        worker_id: &str,
        delivery: &Delivery,
        cancel: &CancellationToken,
    ) -> anyhow::Result<RunOutcome> {
        let job_id = delivery.job_id;

        let job = match self.store.mark_running(job_id, worker_id, self.lease).await? {
            ClaimOutcome::Claimed(job) => job,
            ClaimOutcome::Conflict(reason) => {
                match &reason {
                    // The owner may still die; keep the entry so it comes back.
                    ConflictReason::Leased { owner, .. } => {
                        tracing::debug!(%job_id, worker_id, owner = ?owner, "job leased elsewhere");
                    }
                    ConflictReason::Terminal(_) | ConflictReason::Missing => {
                        tracing::debug!(%job_id, worker_id, reason = ?reason, "dropping stale queue entry");
                        self.queue.ack(delivery).await?;
                    }
                }
                return Ok(RunOutcome::Skipped(reason));
            }
        };

        tracing::info!(
            %job_id,
            worker_id,
            attempt = job.attempts,
            deliveries = delivery.deliveries,
            "job claimed"
        );

        let dispatched = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.store.release(job_id, worker_id).await?;
                self.queue.release(delivery).await?;
                tracing::info!(%job_id, worker_id, "shutdown mid-job, handed back");
                return Ok(RunOutcome::Interrupted);
            }
            res = self.dispatcher.dispatch(&job.prompt) => res,
        };

        let (applied, outcome) = match dispatched {
            Ok(d) => {
                let applied = self
                    .store
                    .complete(job_id, worker_id, &d.text, &d.provider)
                    .await?;
                if applied {
                    tracing::info!(
                        %job_id,
                        worker_id,
                        provider = %d.provider,
                        latency_ms = d.latency_ms,
                        cached = d.cached,
                        "job succeeded"
                    );
                }
                (applied, RunOutcome::Succeeded { provider: d.provider })
            }
            Err(e) => {
                let error = e.to_string();
                let applied = self.store.fail(job_id, worker_id, &error).await?;
                if applied {
                    tracing::warn!(%job_id, worker_id, error = %error, "job failed");
                }
                (applied, RunOutcome::Failed { error })
            }
        };

        if !applied {
            tracing::warn!(%job_id, worker_id, "lease lost before terminal write, result discarded");
            return Ok(RunOutcome::LeaseLost);
        }

        self.queue.ack(delivery).await?;
        Ok(outcome)
    }
}

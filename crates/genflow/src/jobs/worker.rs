use std::time::Duration;

use rand::{rngs::StdRng, SeedableRng};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::jobs::retry::{next_delay, RetryConfig};
use crate::jobs::runner::{JobRunner, RunOutcome};

/// One consume-process-complete loop.
pub struct Worker {
    id: String,
    runner: JobRunner,
    dequeue_wait: Duration,
    backoff: RetryConfig,
}

impl Worker {
    pub fn new(id: impl Into<String>, runner: JobRunner, dequeue_wait: Duration) -> Self {
        Self {
            id: id.into(),
            runner,
            dequeue_wait,
            backoff: RetryConfig::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Runs until `cancel` fires. Store errors are logged and retried with
    /// backoff; they never end the loop.
    pub async fn run(self, cancel: CancellationToken) {
        let mut rng = StdRng::from_entropy();
        let mut consecutive_errors: u32 = 0;

        tracing::info!(worker_id = %self.id, "worker started");

        while !cancel.is_cancelled() {
            match self.tick(&cancel).await {
                Ok(_) => consecutive_errors = 0,
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let delay = next_delay(consecutive_errors, &self.backoff, &mut rng);
                    tracing::error!(
                        worker_id = %self.id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "worker iteration failed"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        tracing::info!(worker_id = %self.id, "worker stopped");
    }

    /// Dequeue at most one entry and process it. `Ok(None)` means the wait
    /// elapsed (or shutdown began) with nothing to do.
    pub async fn tick(&self, cancel: &CancellationToken) -> anyhow::Result<Option<RunOutcome>> {
        let queue = self.runner.queue();
        let delivery = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            d = queue.dequeue(&self.id, self.runner.lease(), self.dequeue_wait) => d?,
        };

        let Some(delivery) = delivery else {
            return Ok(None);
        };

        let outcome = self.runner.process(&self.id, &delivery, cancel).await?;
        Ok(Some(outcome))
    }
}

/// A fixed number of homogeneous workers sharing one runner.
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Worker ids are `{id_prefix}-{n}`, starting at 1.
    pub fn new(id_prefix: &str, size: usize, runner: JobRunner, dequeue_wait: Duration) -> Self {
        let workers = (1..=size.max(1))
            .map(|n| Worker::new(format!("{id_prefix}-{n}"), runner.clone(), dequeue_wait))
            .collect();
        Self { workers }
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.id.clone()).collect()
    }

    /// Runs every worker until `cancel` fires and all of them have returned.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut set = JoinSet::new();
        for worker in self.workers {
            set.spawn(worker.run(cancel.clone()));
        }

        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                // A panicking worker takes the rest down with it.
                cancel.cancel();
                anyhow::bail!("worker task aborted: {e}");
            }
        }
        Ok(())
    }
}

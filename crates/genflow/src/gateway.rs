//! The caller-facing side of the core: turn a prompt into a queued job, then
//! wait (bounded) for a worker to finish it.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::jobs::{Job, JobQueue, JobStore};

static EXCESS_NEWLINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("Invalid regex"));
static HORIZONTAL_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+").expect("Invalid regex"));
static CONTROL_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\x00-\x08\x0b\x0c\x0e-\x1f\x7f-\x9f]").expect("Invalid regex")
});

/// Normalise whitespace and drop control characters, then trim.
pub fn sanitize_prompt(raw: &str) -> String {
    let s = raw.replace("\r\n", "\n");
    let s = EXCESS_NEWLINES.replace_all(&s, "\n\n");
    let s = HORIZONTAL_RUNS.replace_all(&s, " ");
    let s = CONTROL_CHARS.replace_all(&s, "");
    s.trim().to_string()
}

pub fn validate_prompt(prompt: &str, max_chars: usize) -> Result<(), GatewayError> {
    if prompt.trim().is_empty() {
        return Err(GatewayError::InvalidPrompt("prompt must not be empty".into()));
    }
    let len = prompt.chars().count();
    if len > max_chars {
        return Err(GatewayError::InvalidPrompt(format!(
            "prompt is {len} characters, limit is {max_chars}"
        )));
    }
    Ok(())
}

/// Upper bound on any single wait, whatever the caller or config asks for.
pub const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_prompt_chars: usize,
    pub poll_interval: Duration,
    /// Used when the caller gives no timeout.
    pub default_wait: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_prompt_chars: 10_000,
            poll_interval: Duration::from_millis(200),
            default_wait: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub enum AwaitOutcome {
    /// Terminal: `Succeeded` or `Failed`.
    Finished(Job),
    /// The wait ran out first. The job keeps going; ask again later.
    Pending(Job),
}

impl AwaitOutcome {
    pub fn job(&self) -> &Job {
        match self {
            AwaitOutcome::Finished(j) | AwaitOutcome::Pending(j) => j,
        }
    }
}

#[derive(Clone)]
pub struct Gateway {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    cfg: GatewayConfig,
}

impl Gateway {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn JobQueue>, cfg: GatewayConfig) -> Self {
        Self { store, queue, cfg }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.cfg
    }

    /// Sanitise, validate, create, enqueue. Nothing is written for a prompt
    /// that fails validation.
    pub async fn enqueue(&self, prompt: &str) -> Result<Uuid, GatewayError> {
        let prompt = sanitize_prompt(prompt);
        validate_prompt(&prompt, self.cfg.max_prompt_chars)?;

        let id = self.store.create(&prompt).await?;
        if let Err(e) = self.queue.enqueue(id).await {
            // Maintenance re-enqueues the orphan later.
            tracing::error!(job_id = %id, error = %e, "job created but enqueue failed");
            return Err(e.into());
        }

        tracing::info!(job_id = %id, prompt_chars = prompt.chars().count(), "job enqueued");
        Ok(id)
    }

    pub async fn status(&self, id: Uuid) -> Result<Job, GatewayError> {
        self.store
            .get(id)
            .await?
            .ok_or(GatewayError::JobNotFound(id))
    }

    /// Poll until the job is terminal or `timeout` (capped at [`MAX_WAIT`])
    /// elapses. Never cancels the job. A terminal result handed back here
    /// starts its shorter retention.
    pub async fn await_result(
        &self,
        id: Uuid,
        timeout: Option<Duration>,
    ) -> Result<AwaitOutcome, GatewayError> {
        let wait = timeout.unwrap_or(self.cfg.default_wait).min(MAX_WAIT);
        let deadline = Instant::now() + wait;

        loop {
            let job = self.status(id).await?;

            if job.status.is_terminal() {
                self.store.mark_retrieved(id).await?;
                return Ok(AwaitOutcome::Finished(job));
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(job_id = %id, status = %job.status, "wait timed out");
                return Ok(AwaitOutcome::Pending(job));
            }
            tokio::time::sleep(self.cfg.poll_interval.min(deadline - now)).await;
        }
    }
}

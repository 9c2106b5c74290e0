//! In-process backend implementing the store, the queue and maintenance.
//!
//! Used by `GENFLOW_STORE=memory` and by the test suite. Every operation takes
//! one lock, so each state transition is atomic just like the single-statement
//! updates of the Postgres backend.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::jobs::maintenance::Maintenance;
use crate::jobs::model::{span, Job, JobStatus, Retention, StatusCounts};
use crate::jobs::queue::{Delivery, JobQueue};
use crate::jobs::store::{ClaimOutcome, ConflictReason, JobStore};

const MAX_PARK: Duration = Duration::from_millis(25);

struct Record {
    job: Job,
    updated_at: DateTime<Utc>,
}

impl Record {
    fn visible(&self, now: DateTime<Utc>) -> bool {
        self.job.expires_at.map_or(true, |t| t > now)
    }

    fn claimable(&self, now: DateTime<Utc>) -> bool {
        match self.job.status {
            JobStatus::Pending => true,
            JobStatus::Running => self.job.lease_expired(now),
            _ => false,
        }
    }

    fn owned_by(&self, worker_id: &str) -> bool {
        self.job.status == JobStatus::Running && self.job.locked_by.as_deref() == Some(worker_id)
    }
}

struct Entry {
    job_id: Uuid,
    visible_at: Instant,
    deliveries: i32,
}

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, Record>,
    queue: BTreeMap<i64, Entry>,
    next_entry: i64,
}

impl State {
    fn queued(&self, job_id: Uuid) -> bool {
        self.queue.values().any(|e| e.job_id == job_id)
    }

    fn push(&mut self, job_id: Uuid) {
        if self.queued(job_id) {
            return;
        }
        self.next_entry += 1;
        self.queue.insert(
            self.next_entry,
            Entry {
                job_id,
                visible_at: Instant::now(),
                deliveries: 0,
            },
        );
    }
}

pub struct MemoryBackend {
    state: Mutex<State>,
    retention: Retention,
    notify: Notify,
}

impl MemoryBackend {
    pub fn new(retention: Retention) -> Self {
        Self {
            state: Mutex::new(State::default()),
            retention,
            notify: Notify::new(),
        }
    }

    /// Number of queue entries, hidden or not.
    pub fn queue_entries(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Number of job records, including expired ones not yet swept.
    pub fn job_records(&self) -> usize {
        self.state.lock().jobs.len()
    }

    fn try_dequeue(&self, visibility: Duration) -> Option<Delivery> {
        let mut st = self.state.lock();
        let now = Instant::now();
        let (entry_id, entry) = st
            .queue
            .iter_mut()
            .filter(|(_, e)| e.visible_at <= now)
            .min_by_key(|(id, e)| (e.visible_at, **id))?;

        entry.visible_at = now + visibility;
        entry.deliveries += 1;
        Some(Delivery {
            entry_id: *entry_id,
            job_id: entry.job_id,
            deliveries: entry.deliveries,
        })
    }

    fn terminal_write(
        &self,
        id: Uuid,
        worker_id: &str,
        status: JobStatus,
        result: Option<&str>,
        provider: Option<&str>,
        error: Option<&str>,
    ) -> bool {
        let mut st = self.state.lock();
        let Some(rec) = st.jobs.get_mut(&id) else {
            return false;
        };
        if !rec.owned_by(worker_id) {
            return false;
        }

        let now = Utc::now();
        let job = &mut rec.job;
        job.status = status;
        job.result = result.map(str::to_string);
        job.provider = provider.map(str::to_string);
        job.error = error.map(str::to_string);
        job.locked_by = None;
        job.lock_expires_at = None;
        job.finished_at = Some(now);
        job.expires_at = Some(now + span(self.retention.result_ttl));
        rec.updated_at = now;
        true
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(Retention::default())
    }
}

#[async_trait]
impl JobStore for MemoryBackend {
    async fn create(&self, prompt: &str) -> anyhow::Result<Uuid> {
        if prompt.trim().is_empty() {
            anyhow::bail!("refusing to store an empty prompt");
        }

        let now = Utc::now();
        let id = Uuid::new_v4();
        let job = Job {
            id,
            prompt: prompt.to_string(),
            status: JobStatus::Pending,
            result: None,
            error: None,
            provider: None,
            attempts: 0,
            locked_by: None,
            lock_expires_at: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            retrieved_at: None,
            expires_at: None,
        };
        self.state.lock().jobs.insert(
            id,
            Record {
                job,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Job>> {
        let now = Utc::now();
        let st = self.state.lock();
        Ok(st
            .jobs
            .get(&id)
            .filter(|r| r.visible(now))
            .map(|r| r.job.clone()))
    }

    async fn mark_running(
        &self,
        id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> anyhow::Result<ClaimOutcome> {
        let now = Utc::now();
        let mut st = self.state.lock();
        let Some(rec) = st.jobs.get_mut(&id).filter(|r| r.visible(now)) else {
            return Ok(ClaimOutcome::Conflict(ConflictReason::Missing));
        };

        if rec.job.status.is_terminal() {
            return Ok(ClaimOutcome::Conflict(ConflictReason::Terminal(
                rec.job.status,
            )));
        }
        if !rec.claimable(now) {
            return Ok(ClaimOutcome::Conflict(ConflictReason::Leased {
                owner: rec.job.locked_by.clone(),
                until: rec.job.lock_expires_at,
            }));
        }

        let job = &mut rec.job;
        job.status = JobStatus::Running;
        job.locked_by = Some(worker_id.to_string());
        job.lock_expires_at = Some(now + span(lease));
        job.started_at.get_or_insert(now);
        job.attempts += 1;
        rec.updated_at = now;
        Ok(ClaimOutcome::Claimed(job.clone()))
    }

    async fn complete(
        &self,
        id: Uuid,
        worker_id: &str,
        result: &str,
        provider: &str,
    ) -> anyhow::Result<bool> {
        Ok(self.terminal_write(
            id,
            worker_id,
            JobStatus::Succeeded,
            Some(result),
            Some(provider),
            None,
        ))
    }

    async fn fail(&self, id: Uuid, worker_id: &str, error: &str) -> anyhow::Result<bool> {
        Ok(self.terminal_write(id, worker_id, JobStatus::Failed, None, None, Some(error)))
    }

    async fn release(&self, id: Uuid, worker_id: &str) -> anyhow::Result<bool> {
        let now = Utc::now();
        let mut st = self.state.lock();
        match st.jobs.get_mut(&id) {
            Some(rec) if rec.owned_by(worker_id) => {
                rec.job.lock_expires_at = Some(now);
                rec.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_retrieved(&self, id: Uuid) -> anyhow::Result<()> {
        let now = Utc::now();
        let cap = now + span(self.retention.retrieved_ttl);
        let mut st = self.state.lock();
        if let Some(rec) = st.jobs.get_mut(&id) {
            if rec.job.status.is_terminal() {
                rec.job.retrieved_at.get_or_insert(now);
                rec.job.expires_at = Some(rec.job.expires_at.map_or(cap, |t| t.min(cap)));
                rec.updated_at = now;
            }
        }
        Ok(())
    }

    async fn status_counts(&self) -> anyhow::Result<StatusCounts> {
        let now = Utc::now();
        let st = self.state.lock();
        let mut counts = StatusCounts::default();
        for rec in st.jobs.values().filter(|r| r.visible(now)) {
            counts.add(rec.job.status, 1);
        }
        Ok(counts)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl JobQueue for MemoryBackend {
    async fn enqueue(&self, job_id: Uuid) -> anyhow::Result<()> {
        self.state.lock().push(job_id);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(
        &self,
        _worker_id: &str,
        visibility: Duration,
        wait: Duration,
    ) -> anyhow::Result<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            // Register interest before looking so an enqueue in between is
            // not missed.
            let notified = self.notify.notified();
            if let Some(d) = self.try_dequeue(visibility) {
                return Ok(Some(d));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(MAX_PARK.min(deadline - now), notified).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> anyhow::Result<bool> {
        let mut st = self.state.lock();
        match st.queue.get(&delivery.entry_id) {
            Some(e) if e.deliveries == delivery.deliveries => {
                st.queue.remove(&delivery.entry_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, delivery: &Delivery) -> anyhow::Result<bool> {
        let released = {
            let mut st = self.state.lock();
            match st.queue.get_mut(&delivery.entry_id) {
                Some(e) if e.deliveries == delivery.deliveries => {
                    e.visible_at = Instant::now();
                    true
                }
                _ => false,
            }
        };
        if released {
            self.notify.notify_waiters();
        }
        Ok(released)
    }

    async fn len(&self) -> anyhow::Result<i64> {
        let now = Instant::now();
        let st = self.state.lock();
        Ok(st.queue.values().filter(|e| e.visible_at <= now).count() as i64)
    }
}

#[async_trait]
impl Maintenance for MemoryBackend {
    async fn requeue_orphans(&self, older_than: Duration) -> anyhow::Result<u64> {
        let now = Utc::now();
        let cutoff = now - span(older_than);
        let mut st = self.state.lock();

        let orphans: Vec<Uuid> = st
            .jobs
            .values()
            .filter(|r| r.updated_at < cutoff && r.claimable(now))
            .map(|r| r.job.id)
            .filter(|id| !st.queued(*id))
            .collect();

        for id in &orphans {
            st.push(*id);
        }
        drop(st);

        if !orphans.is_empty() {
            self.notify.notify_waiters();
        }
        Ok(orphans.len() as u64)
    }

    async fn expire_finished(&self) -> anyhow::Result<u64> {
        let now = Utc::now();
        let mut st = self.state.lock();

        let expired: Vec<Uuid> = st
            .jobs
            .values()
            .filter(|r| r.job.status.is_terminal() && !r.visible(now))
            .map(|r| r.job.id)
            .collect();

        for id in &expired {
            st.jobs.remove(id);
        }
        st.queue.retain(|_, e| !expired.contains(&e.job_id));
        Ok(expired.len() as u64)
    }
}

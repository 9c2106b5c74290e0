pub mod maintenance;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod repo;
pub mod retry;
pub mod runner;
pub mod store;
pub mod worker;

use std::sync::Arc;

use sqlx::PgPool;

pub use maintenance::{Maintenance, MaintenanceRepo};
pub use memory::MemoryBackend;
pub use metrics::Metrics;
pub use model::{Job, JobStatus, Retention, StatusCounts};
pub use queue::{Delivery, JobQueue, QueueRepo};
pub use repo::JobsRepo;
pub use runner::{JobRunner, RunOutcome};
pub use store::{ClaimOutcome, ConflictReason, JobStore};
pub use worker::{Worker, WorkerPool};

/// Store, queue and maintenance handles that share one backing service.
#[derive(Clone)]
pub struct Backend {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobQueue>,
    pub maintenance: Arc<dyn Maintenance>,
}

impl Backend {
    pub fn postgres(pool: PgPool, retention: Retention) -> Self {
        Self {
            store: Arc::new(JobsRepo::new(pool.clone(), retention)),
            queue: Arc::new(QueueRepo::new(pool.clone())),
            maintenance: Arc::new(MaintenanceRepo::new(pool)),
        }
    }

    /// Single-process backend; every handle points at the same state.
    pub fn memory(retention: Retention) -> Self {
        Self::from_memory(Arc::new(MemoryBackend::new(retention)))
    }

    pub fn from_memory(mem: Arc<MemoryBackend>) -> Self {
        Self {
            store: mem.clone(),
            queue: mem.clone(),
            maintenance: mem,
        }
    }
}

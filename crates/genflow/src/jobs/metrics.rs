use std::fmt::Write;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::jobs::queue::JobQueue;
use crate::jobs::store::JobStore;

#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub at: DateTime<Utc>,

    /// Entries visible to `dequeue` right now.
    pub queue_length: i64,

    pub pending: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,

    /// Configured providers in dispatch order.
    pub providers: Vec<String>,
}

impl Metrics {
    pub async fn collect(
        store: &dyn JobStore,
        queue: &dyn JobQueue,
        providers: Vec<String>,
    ) -> anyhow::Result<Self> {
        let counts = store.status_counts().await?;
        let queue_length = queue.len().await?;

        Ok(Self {
            at: Utc::now(),
            queue_length,
            pending: counts.pending,
            running: counts.running,
            succeeded: counts.succeeded,
            failed: counts.failed,
            providers,
        })
    }

    /// Prometheus text exposition.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        gauge(
            &mut out,
            "genflow_queue_length",
            "Queue entries visible to workers",
            self.queue_length,
        );

        let _ = writeln!(out, "# HELP genflow_jobs Jobs currently retained, by status");
        let _ = writeln!(out, "# TYPE genflow_jobs gauge");
        for (status, n) in [
            ("pending", self.pending),
            ("running", self.running),
            ("succeeded", self.succeeded),
            ("failed", self.failed),
        ] {
            let _ = writeln!(out, "genflow_jobs{{status=\"{status}\"}} {n}");
        }

        gauge(
            &mut out,
            "genflow_providers_configured",
            "Providers with a resolvable API key",
            self.providers.len() as i64,
        );

        out
    }
}

fn gauge(out: &mut String, name: &str, help: &str, value: i64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

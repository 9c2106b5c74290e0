#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};

use genflow::credentials::CredentialSource;
use genflow::error::ProviderError;
use genflow::jobs::{Backend, MemoryBackend, Retention};
use genflow::providers::{Dispatcher, ProviderOrder, ProviderSlot, TextGenerator};

/// Returns `None` (and the test should return early) when no test database
/// is configured.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping postgres test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query("TRUNCATE TABLE job_queue, jobs, response_cache RESTART IDENTITY CASCADE")
        .execute(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}

pub fn memory_backend(retention: Retention) -> (Arc<MemoryBackend>, Backend) {
    let mem = Arc::new(MemoryBackend::new(retention));
    (mem.clone(), Backend::from_memory(mem))
}

#[derive(Clone, Debug)]
pub enum Reply {
    Text(String),
    Http(u16),
    Empty,
}

/// Scripted `TextGenerator` that counts its calls.
pub struct FakeProvider {
    reply: Reply,
    delay: Duration,
    calls: AtomicUsize,
}

impl FakeProvider {
    pub fn text(text: &str) -> Arc<Self> {
        Arc::new(Self::new(Reply::Text(text.to_string()), Duration::ZERO))
    }

    pub fn http_error(status: u16) -> Arc<Self> {
        Arc::new(Self::new(Reply::Http(status), Duration::ZERO))
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self::new(Reply::Empty, Duration::ZERO))
    }

    pub fn slow(text: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self::new(Reply::Text(text.to_string()), delay))
    }

    fn new(reply: Reply, delay: Duration) -> Self {
        Self {
            reply,
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextGenerator for FakeProvider {
    async fn generate_text(&self, _prompt: &str, _model: &str) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.reply {
            Reply::Text(t) => Ok(t.clone()),
            Reply::Http(status) => Err(ProviderError::Http {
                status: *status,
                body: format!("upstream said {status}"),
            }),
            Reply::Empty => Ok(String::new()),
        }
    }
}

pub fn slot(name: &str, provider: &Arc<FakeProvider>) -> ProviderSlot {
    ProviderSlot::new(name, format!("{name}-model"), provider.clone())
}

pub fn dispatcher(slots: Vec<ProviderSlot>, call_timeout: Duration) -> Dispatcher {
    Dispatcher::new(slots, ProviderOrder::PrimaryFirst, call_timeout)
}

/// In-memory env plus an optional home directory on disk.
#[derive(Default)]
pub struct MapSource {
    pub env: HashMap<String, String>,
    pub home: Option<PathBuf>,
}

impl MapSource {
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_home(mut self, home: &Path) -> Self {
        self.home = Some(home.to_path_buf());
        self
    }
}

impl CredentialSource for MapSource {
    fn env(&self, key: &str) -> Option<String> {
        self.env.get(key).cloned()
    }

    fn home_dir(&self) -> Option<PathBuf> {
        self.home.clone()
    }

    fn read_file(&self, path: &Path) -> Option<String> {
        std::fs::read_to_string(path).ok()
    }
}

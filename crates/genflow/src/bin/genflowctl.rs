use std::time::Duration;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use genflow::cache::ResponseCache;
use genflow::config::{Config, StoreKind};
use genflow::credentials::ProviderKind;
use genflow::db;
use genflow::gateway::{AwaitOutcome, Gateway, GatewayConfig};
use genflow::jobs::{Backend, Job, Metrics};
use genflow::providers::ProviderOrder;

#[derive(Parser, Debug)]
#[command(name = "genflowctl")]
#[command(about = "Operator commands for the genflow job queue")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a job for PROMPT and print its id
    Enqueue { prompt: String },

    /// Print a job as JSON
    Status { job_id: Uuid },

    /// Wait for a job to finish
    Wait {
        job_id: Uuid,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },

    /// Queue length and job counts by status
    Stats,

    /// Re-enqueue pending jobs that lost their queue entry
    Reap {
        /// Defaults to GENFLOW_ORPHAN_AFTER_SECS
        #[arg(long)]
        older_than_secs: Option<u64>,
    },

    /// Delete finished jobs past their retention, and expired cache entries
    Expire,

    /// Drop every cached response
    CacheClear,

    /// Show which providers resolve a key, in dispatch order
    Providers,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    genflow::logging::init("warn");
    let args = Args::parse();
    let cfg = Config::from_env()?;

    if let Command::Providers = args.command {
        print_providers(&cfg);
        return Ok(());
    }

    if cfg.store == StoreKind::Memory {
        anyhow::bail!("genflowctl needs the shared store; GENFLOW_STORE=memory is process-local");
    }
    let pool = db::make_pool(cfg.database_url()?).await?;
    let cache = ResponseCache::postgres(pool.clone(), cfg.cache_ttl());
    let backend = Backend::postgres(pool, cfg.retention());
    let gateway = Gateway::new(
        backend.store.clone(),
        backend.queue.clone(),
        GatewayConfig {
            max_prompt_chars: cfg.max_prompt_chars,
            default_wait: cfg.wait_timeout(),
            ..GatewayConfig::default()
        },
    );

    match args.command {
        Command::Enqueue { prompt } => {
            let id = gateway.enqueue(&prompt).await?;
            println!("{id}");
        }
        Command::Status { job_id } => {
            let job = gateway.status(job_id).await?;
            print_job(&job)?;
        }
        Command::Wait {
            job_id,
            timeout_secs,
        } => match gateway
            .await_result(job_id, Some(Duration::from_secs(timeout_secs)))
            .await?
        {
            AwaitOutcome::Finished(job) => print_job(&job)?,
            AwaitOutcome::Pending(job) => {
                println!("still {} after {timeout_secs}s", job.status);
                std::process::exit(3);
            }
        },
        Command::Stats => {
            let m = Metrics::collect(backend.store.as_ref(), backend.queue.as_ref(), Vec::new())
                .await?;
            println!("queue_length = {}", m.queue_length);
            println!("pending      = {}", m.pending);
            println!("running      = {}", m.running);
            println!("succeeded    = {}", m.succeeded);
            println!("failed       = {}", m.failed);
        }
        Command::Reap { older_than_secs } => {
            let older_than = older_than_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| cfg.orphan_after());
            let n = backend.maintenance.requeue_orphans(older_than).await?;
            println!("requeued {n} job(s)");
        }
        Command::Expire => {
            let n = backend.maintenance.expire_finished().await?;
            println!("expired {n} job(s)");
            let n = cache.purge_expired().await?;
            println!("purged {n} cache entries");
        }
        Command::CacheClear => {
            let n = cache.clear().await?;
            println!("cleared {n} cache entries");
        }
        Command::Providers => print_providers(&cfg),
    }

    Ok(())
}

fn print_job(job: &Job) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(job)?);
    Ok(())
}

fn print_providers(cfg: &Config) {
    let resolver = cfg.resolver();
    let primary = cfg.primary();

    let mut kinds = vec![primary];
    kinds.extend(ProviderKind::ALL.iter().copied().filter(|k| *k != primary));
    if cfg.order() == ProviderOrder::Reversed {
        kinds.reverse();
    }

    for kind in kinds {
        match resolver.resolve(kind) {
            Some(c) => println!("{:<11} model={} key={}", kind.name(), c.model, c.key_source),
            None => println!("{:<11} (no key; skipped)", kind.name()),
        }
    }
}

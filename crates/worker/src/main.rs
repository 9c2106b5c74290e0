use std::sync::Arc;

use genflow::api;
use genflow::cache::ResponseCache;
use genflow::config::{Config, StoreKind};
use genflow::credentials::ProviderKind;
use genflow::db;
use genflow::gateway::{Gateway, GatewayConfig};
use genflow::jobs::{Backend, JobRunner, WorkerPool};
use genflow::providers::{resolve_slots, Dispatcher};

use tokio_util::sync::CancellationToken;

const DB_CONNECT_ATTEMPTS: u32 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    genflow::logging::init("info");

    let cfg = Config::from_env()?;
    let issues = cfg.validate();
    if !issues.is_empty() {
        for issue in &issues {
            tracing::error!(%issue, "invalid configuration");
        }
        anyhow::bail!("refusing to start: {} configuration issue(s)", issues.len());
    }

    tracing::info!(
        worker_id = %cfg.worker_id,
        workers = cfg.workers,
        store = ?cfg.store,
        lease_seconds = cfg.lease_seconds,
        provider = %cfg.primary_provider,
        order = ?cfg.order(),
        api = %cfg.api_addr.as_deref().unwrap_or("disabled"),
        migrate_on_startup = cfg.migrate_on_startup,
        cache_enabled = cfg.cache_enabled,
        cache_ttl_secs = cfg.cache_ttl_secs,
        "genflow starting"
    );

    let (backend, cache) = match cfg.store {
        StoreKind::Postgres => {
            let pool = db::connect_with_retry(cfg.database_url()?, DB_CONNECT_ATTEMPTS).await?;
            if cfg.migrate_on_startup {
                db::run_migrations(&pool).await?;
            }
            let cache = ResponseCache::postgres(pool.clone(), cfg.cache_ttl());
            (Backend::postgres(pool, cfg.retention()), cache)
        }
        StoreKind::Memory => {
            tracing::warn!("using the in-memory store; jobs do not survive a restart");
            (
                Backend::memory(cfg.retention()),
                ResponseCache::memory(cfg.cache_ttl()),
            )
        }
    };
    let cache = cfg.cache_enabled.then(|| Arc::new(cache));

    let primary = ProviderKind::parse(&cfg.primary_provider)
        .ok_or_else(|| anyhow::anyhow!("unknown provider {:?}", cfg.primary_provider))?;
    let slots = resolve_slots(
        &cfg.resolver(),
        primary,
        cfg.max_new_tokens,
        cfg.provider_timeout(),
    )?;
    let mut dispatcher = Dispatcher::new(slots, cfg.order(), cfg.provider_timeout());
    if let Some(cache) = &cache {
        dispatcher = dispatcher.with_cache(cache.clone());
    }
    if dispatcher.is_empty() {
        // Not fatal: jobs fail with "no provider configured" until a key shows up
        // and the process is restarted.
        tracing::error!("no provider has an api key; every job will fail");
    }
    let providers = Arc::new(dispatcher.provider_names());
    let provider_models = Arc::new(dispatcher.provider_models());

    // Cancelled on ctrl-c, or when any task below exits, so the rest wind
    // down with it.
    let shutdown = CancellationToken::new();

    // ---- API task ----
    let gateway = Gateway::new(
        backend.store.clone(),
        backend.queue.clone(),
        GatewayConfig {
            max_prompt_chars: cfg.max_prompt_chars,
            default_wait: cfg.wait_timeout(),
            ..GatewayConfig::default()
        },
    );
    let app = api::router(api::ApiState {
        gateway,
        store: backend.store.clone(),
        queue: backend.queue.clone(),
        providers,
        provider_models,
        cache: cache.clone(),
    });
    let api_handle = {
        let api_addr = cfg.api_addr.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _stop_all = shutdown.clone().drop_guard();
            if let Some(addr) = api_addr {
                let listener = tokio::net::TcpListener::bind(&addr).await?;
                tracing::info!(%addr, "api listening");
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await?;
            } else {
                shutdown.cancelled().await;
            }
            Ok::<(), anyhow::Error>(())
        })
    };

    // ---- Worker pool ----
    let worker_handle = {
        let runner = JobRunner::new(
            backend.store.clone(),
            backend.queue.clone(),
            dispatcher,
            cfg.lease(),
        );
        let pool = WorkerPool::new(&cfg.worker_id, cfg.workers, runner, cfg.dequeue_wait());
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _stop_all = shutdown.clone().drop_guard();
            pool.run(shutdown).await
        })
    };

    // ---- Maintenance task ----
    let maintenance_handle = {
        let maintenance = backend.maintenance.clone();
        let cache = cache.clone();
        let interval = cfg.maintenance_interval();
        let orphan_after = cfg.orphan_after();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _stop_all = shutdown.clone().drop_guard();
            let mut tick = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {}
                }

                match maintenance.requeue_orphans(orphan_after).await {
                    Ok(n) if n > 0 => tracing::info!(requeued = n, "requeued orphaned jobs"),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "requeue_orphans failed"),
                }
                match maintenance.expire_finished().await {
                    Ok(n) if n > 0 => tracing::info!(expired = n, "expired finished jobs"),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "expire_finished failed"),
                }
                if let Some(cache) = &cache {
                    match cache.purge_expired().await {
                        Ok(n) if n > 0 => tracing::info!(purged = n, "purged expired cache entries"),
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "cache purge failed"),
                    }
                }
            }
            Ok::<(), anyhow::Error>(())
        })
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("ctrl-c received, shutting down");
            }
            shutdown.cancel();
        });
    }

    let (api, workers, maintenance) =
        tokio::join!(api_handle, worker_handle, maintenance_handle);
    api??;
    workers??;
    maintenance??;

    tracing::info!("genflow stopped");
    Ok(())
}

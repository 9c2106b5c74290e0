mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{dispatcher, memory_backend, slot, FakeProvider};
use genflow::jobs::{
    Backend, ClaimOutcome, ConflictReason, JobQueue, JobRunner, JobStatus, JobStore, Retention,
    RunOutcome, Worker, WorkerPool,
};
use genflow::providers::Dispatcher;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const LEASE: Duration = Duration::from_secs(30);
const WAIT: Duration = Duration::from_millis(100);

fn runner(backend: &Backend, dispatcher: Dispatcher, lease: Duration) -> JobRunner {
    JobRunner::new(backend.store.clone(), backend.queue.clone(), dispatcher, lease)
}

async fn submit(backend: &Backend, prompt: &str) -> Uuid {
    let id = backend.store.create(prompt).await.unwrap();
    backend.queue.enqueue(id).await.unwrap();
    id
}

#[tokio::test]
async fn job_succeeds_with_primary_text() {
    let (mem, backend) = memory_backend(Retention::default());
    let primary = FakeProvider::text("I am doing well, thank you for asking.");
    let secondary = FakeProvider::text("unused");
    let d = dispatcher(
        vec![slot("primary", &primary), slot("secondary", &secondary)],
        Duration::from_secs(2),
    );

    let id = submit(&backend, "Hello, how are you?").await;
    let worker = Worker::new("w-1", runner(&backend, d, LEASE), WAIT);

    let outcome = worker.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(
        outcome,
        Some(RunOutcome::Succeeded {
            provider: "primary".into()
        })
    );

    let job = backend.store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(
        job.result.as_deref(),
        Some("I am doing well, thank you for asking.")
    );
    assert!(job.error.is_none());
    assert!(job.started_at.is_some() && job.finished_at.is_some());
    assert!(job.locked_by.is_none());
    assert_eq!(job.attempts, 1);
    assert_eq!(secondary.calls(), 0);
    assert_eq!(mem.queue_entries(), 0, "entry must be acked");
}

#[tokio::test]
async fn fallback_result_is_recorded_with_its_provider() {
    let (_mem, backend) = memory_backend(Retention::default());
    let primary = FakeProvider::http_error(429);
    let secondary = FakeProvider::text("from b");
    let d = dispatcher(
        vec![slot("primary", &primary), slot("secondary", &secondary)],
        Duration::from_secs(2),
    );

    let id = submit(&backend, "prompt").await;
    let worker = Worker::new("w-1", runner(&backend, d, LEASE), WAIT);
    worker.tick(&CancellationToken::new()).await.unwrap();

    let job = backend.store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.result.as_deref(), Some("from b"));
    assert_eq!(job.provider.as_deref(), Some("secondary"));
}

#[tokio::test]
async fn all_providers_failing_fails_the_job() {
    let (mem, backend) = memory_backend(Retention::default());
    let primary = FakeProvider::http_error(500);
    let secondary = FakeProvider::http_error(401);
    let d = dispatcher(
        vec![slot("primary", &primary), slot("secondary", &secondary)],
        Duration::from_secs(2),
    );

    let id = submit(&backend, "prompt").await;
    let worker = Worker::new("w-1", runner(&backend, d, LEASE), WAIT);
    let outcome = worker.tick(&CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, Some(RunOutcome::Failed { .. })));

    let job = backend.store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.result.is_none());
    let error = job.error.unwrap();
    assert!(error.contains("primary: http 500"), "{error}");
    assert!(error.contains("secondary: http 401"), "{error}");
    assert_eq!(mem.queue_entries(), 0);
}

#[tokio::test]
async fn no_provider_configured_fails_the_job() {
    let (_mem, backend) = memory_backend(Retention::default());
    let id = submit(&backend, "prompt").await;

    let worker = Worker::new(
        "w-1",
        runner(&backend, dispatcher(Vec::new(), Duration::from_secs(1)), LEASE),
        WAIT,
    );
    worker.tick(&CancellationToken::new()).await.unwrap();

    let job = backend.store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("no provider configured"));
}

#[tokio::test]
async fn racing_claims_have_exactly_one_winner() {
    let (_mem, backend) = memory_backend(Retention::default());
    let id = backend.store.create("prompt").await.unwrap();

    let (a, b) = tokio::join!(
        backend.store.mark_running(id, "worker-a", LEASE),
        backend.store.mark_running(id, "worker-b", LEASE),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    let won_a = matches!(a, ClaimOutcome::Claimed(_));
    let won_b = matches!(b, ClaimOutcome::Claimed(_));
    assert!(won_a ^ won_b, "won_a={won_a}, won_b={won_b}");

    let loser = if won_a { b } else { a };
    assert!(matches!(
        loser,
        ClaimOutcome::Conflict(ConflictReason::Leased { .. })
    ));
}

#[tokio::test]
async fn duplicate_delivery_calls_the_provider_once() {
    let (_mem, backend) = memory_backend(Retention::default());
    let provider = FakeProvider::slow("only once", Duration::from_millis(200));
    let d = dispatcher(vec![slot("primary", &provider)], Duration::from_secs(2));

    let id = submit(&backend, "prompt").await;
    let delivery = backend
        .queue
        .dequeue("w-a", LEASE, WAIT)
        .await
        .unwrap()
        .unwrap();

    let r = runner(&backend, d, LEASE);
    let cancel = CancellationToken::new();
    let (a, b) = tokio::join!(
        r.process("w-a", &delivery, &cancel),
        r.process("w-b", &delivery, &cancel),
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    let succeeded = outcomes
        .iter()
        .filter(|o| matches!(o, RunOutcome::Succeeded { .. }))
        .count();
    let skipped = outcomes
        .iter()
        .filter(|o| matches!(o, RunOutcome::Skipped(_)))
        .count();
    assert_eq!((succeeded, skipped), (1, 1), "{outcomes:?}");
    assert_eq!(provider.calls(), 1);

    let job = backend.store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
}

#[tokio::test]
async fn transitions_are_monotonic() {
    let (_mem, backend) = memory_backend(Retention::default());
    let store = &backend.store;
    let id = store.create("prompt").await.unwrap();

    // Not running yet, so there is nothing to complete.
    assert!(!store.complete(id, "w-1", "early", "p").await.unwrap());
    assert!(!store.fail(id, "w-1", "early").await.unwrap());
    assert_eq!(
        store.get(id).await.unwrap().unwrap().status,
        JobStatus::Pending
    );

    assert!(matches!(
        store.mark_running(id, "w-1", LEASE).await.unwrap(),
        ClaimOutcome::Claimed(_)
    ));
    // Only the owner may finish it.
    assert!(!store.complete(id, "w-2", "stolen", "p").await.unwrap());
    assert!(store.complete(id, "w-1", "text", "p").await.unwrap());

    // Terminal: every further write is refused.
    assert!(!store.complete(id, "w-1", "again", "p").await.unwrap());
    assert!(!store.fail(id, "w-1", "late").await.unwrap());
    assert!(!store.release(id, "w-1").await.unwrap());
    assert!(matches!(
        store.mark_running(id, "w-3", LEASE).await.unwrap(),
        ClaimOutcome::Conflict(ConflictReason::Terminal(JobStatus::Succeeded))
    ));

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.result.as_deref(), Some("text"));
    assert!(job.error.is_none());
}

#[tokio::test]
async fn expired_lease_is_reclaimed_and_old_owner_is_fenced() {
    let (_mem, backend) = memory_backend(Retention::default());
    let store = &backend.store;
    let id = store.create("prompt").await.unwrap();

    assert!(matches!(
        store
            .mark_running(id, "crashed", Duration::from_millis(50))
            .await
            .unwrap(),
        ClaimOutcome::Claimed(_)
    ));
    tokio::time::sleep(Duration::from_millis(120)).await;

    let job = match store.mark_running(id, "rescuer", LEASE).await.unwrap() {
        ClaimOutcome::Claimed(job) => job,
        other => panic!("expected reclaim, got {other:?}"),
    };
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.locked_by.as_deref(), Some("rescuer"));
    assert_eq!(job.attempts, 2);

    // The original worker comes back and tries to write its result.
    assert!(!store.complete(id, "crashed", "stale", "p").await.unwrap());
    assert!(store.complete(id, "rescuer", "fresh", "p").await.unwrap());
    assert_eq!(
        store.get(id).await.unwrap().unwrap().result.as_deref(),
        Some("fresh")
    );
}

#[tokio::test]
async fn unacked_entry_is_redelivered_after_visibility_timeout() {
    let (_mem, backend) = memory_backend(Retention::default());
    let id = submit(&backend, "prompt").await;
    let queue = &backend.queue;

    let first = queue
        .dequeue("crashed", Duration::from_millis(50), WAIT)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.job_id, id);
    assert_eq!(queue.len().await.unwrap(), 0, "entry must be hidden");

    let second = queue
        .dequeue("rescuer", LEASE, Duration::from_millis(500))
        .await
        .unwrap()
        .expect("entry should come back");
    assert_eq!(second.job_id, id);
    assert_eq!(second.deliveries, first.deliveries + 1);

    // The stale handout cannot drop the entry from under the new holder.
    assert!(!queue.ack(&first).await.unwrap());
    assert!(queue.ack(&second).await.unwrap());
}

#[tokio::test]
async fn dequeue_waits_then_returns_none() {
    let (_mem, backend) = memory_backend(Retention::default());
    let started = std::time::Instant::now();
    let got = backend
        .queue
        .dequeue("w-1", LEASE, Duration::from_millis(150))
        .await
        .unwrap();
    assert!(got.is_none());
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn dequeue_wakes_on_enqueue() {
    let (_mem, backend) = memory_backend(Retention::default());
    let queue = backend.queue.clone();

    let waiter = tokio::spawn(async move {
        queue
            .dequeue("w-1", LEASE, Duration::from_secs(5))
            .await
            .unwrap()
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let id = submit(&backend, "prompt").await;

    let got = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("dequeue should wake promptly")
        .unwrap();
    assert_eq!(got.map(|d| d.job_id), Some(id));
}

#[tokio::test]
async fn queue_is_fifo_for_a_single_consumer() {
    let (_mem, backend) = memory_backend(Retention::default());
    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(submit(&backend, &format!("prompt {i}")).await);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let mut got = Vec::new();
    while let Some(d) = backend.queue.dequeue("w-1", LEASE, WAIT).await.unwrap() {
        got.push(d.job_id);
    }
    assert_eq!(got, ids);
}

#[tokio::test]
async fn terminal_job_entry_is_acked_without_dispatch() {
    let (mem, backend) = memory_backend(Retention::default());
    let provider = FakeProvider::text("x");
    let d = dispatcher(vec![slot("primary", &provider)], Duration::from_secs(1));

    let id = submit(&backend, "prompt").await;
    backend.store.mark_running(id, "w-0", LEASE).await.unwrap();
    backend.store.complete(id, "w-0", "done", "primary").await.unwrap();

    let worker = Worker::new("w-1", runner(&backend, d, LEASE), WAIT);
    let outcome = worker.tick(&CancellationToken::new()).await.unwrap();

    assert_eq!(
        outcome,
        Some(RunOutcome::Skipped(ConflictReason::Terminal(
            JobStatus::Succeeded
        )))
    );
    assert_eq!(provider.calls(), 0);
    assert_eq!(mem.queue_entries(), 0);
}

#[tokio::test]
async fn shutdown_mid_job_hands_the_job_back() {
    let (mem, backend) = memory_backend(Retention::default());
    let slow = FakeProvider::slow("never seen", Duration::from_secs(10));
    let d = dispatcher(vec![slot("primary", &slow)], Duration::from_secs(30));

    let id = submit(&backend, "prompt").await;
    let worker = Worker::new("w-1", runner(&backend, d, LEASE), WAIT);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let outcome = worker.tick(&cancel).await.unwrap();
    assert_eq!(outcome, Some(RunOutcome::Interrupted));

    // Lease expired and entry visible again: the next worker picks it up now.
    assert_eq!(mem.queue_entries(), 1);
    assert_eq!(backend.queue.len().await.unwrap(), 1);
    let job = backend.store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);

    let fast = FakeProvider::text("rescued");
    let worker = Worker::new(
        "w-2",
        runner(
            &backend,
            dispatcher(vec![slot("primary", &fast)], Duration::from_secs(1)),
            LEASE,
        ),
        WAIT,
    );
    worker.tick(&CancellationToken::new()).await.unwrap();

    let job = backend.store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.result.as_deref(), Some("rescued"));
    assert_eq!(job.attempts, 2);
}

#[tokio::test]
async fn pool_drains_many_jobs_and_stops_on_cancel() {
    let (mem, backend) = memory_backend(Retention::default());
    let provider = FakeProvider::slow("ok", Duration::from_millis(20));
    let d = dispatcher(vec![slot("primary", &provider)], Duration::from_secs(1));

    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(submit(&backend, &format!("prompt {i}")).await);
    }

    let pool = WorkerPool::new("w", 4, runner(&backend, d, LEASE), WAIT);
    assert_eq!(pool.worker_ids(), ["w-1", "w-2", "w-3", "w-4"]);

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(pool.run(cancel.clone()));

    let store: Arc<dyn JobStore> = backend.store.clone();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let counts = store.status_counts().await.unwrap();
        if counts.succeeded == 20 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "stuck at {counts:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("pool should stop promptly")
        .unwrap()
        .unwrap();

    assert_eq!(provider.calls(), 20, "each job dispatched exactly once");
    assert_eq!(mem.queue_entries(), 0);
}

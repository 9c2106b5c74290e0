mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{dispatcher, slot, FakeProvider};
use genflow::cache::ResponseCache;
use genflow::error::DispatchError;
use genflow::providers::{Dispatcher, ProviderOrder};

const CALL_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn first_success_short_circuits() {
    let primary = FakeProvider::text("I am doing well, thank you for asking.");
    let secondary = FakeProvider::text("should not be used");

    let d = dispatcher(
        vec![slot("primary", &primary), slot("secondary", &secondary)],
        CALL_TIMEOUT,
    );

    let out = d.dispatch("Hello, how are you?").await.unwrap();
    assert_eq!(out.text, "I am doing well, thank you for asking.");
    assert_eq!(out.provider, "primary");
    assert_eq!(primary.calls(), 1);
    assert_eq!(secondary.calls(), 0, "secondary must never be called");
}

#[tokio::test]
async fn falls_back_when_primary_fails() {
    let primary = FakeProvider::http_error(500);
    let secondary = FakeProvider::text("from b");

    let d = dispatcher(
        vec![slot("primary", &primary), slot("secondary", &secondary)],
        CALL_TIMEOUT,
    );

    let out = d.dispatch("prompt").await.unwrap();
    assert_eq!(out.text, "from b");
    assert_eq!(out.provider, "secondary");
    assert_eq!(primary.calls(), 1);
    assert_eq!(secondary.calls(), 1);
}

#[tokio::test]
async fn primary_timeout_falls_back() {
    let primary = FakeProvider::slow("too late", Duration::from_secs(5));
    let secondary = FakeProvider::text("fallback text");

    let d = dispatcher(
        vec![slot("primary", &primary), slot("secondary", &secondary)],
        Duration::from_millis(200),
    );

    let started = Instant::now();
    let out = d.dispatch("prompt").await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2), "timeout not enforced");
    assert_eq!(out.text, "fallback text");
    assert_eq!(out.provider, "secondary");
}

#[tokio::test]
async fn all_failures_are_aggregated_in_order() {
    let primary = FakeProvider::http_error(503);
    let secondary = FakeProvider::empty();

    let d = dispatcher(
        vec![slot("primary", &primary), slot("secondary", &secondary)],
        CALL_TIMEOUT,
    );

    let err = d.dispatch("prompt").await.unwrap_err();
    match &err {
        DispatchError::AllProvidersFailed(failures) => {
            let names: Vec<_> = failures.iter().map(|f| f.provider.as_str()).collect();
            assert_eq!(names, ["primary", "secondary"]);
        }
        other => panic!("expected AllProvidersFailed, got {other:?}"),
    }

    let msg = err.to_string();
    assert!(msg.starts_with("all providers failed: "), "{msg}");
    assert!(msg.contains("primary: http 503"), "{msg}");
    assert!(msg.contains("secondary: empty response"), "{msg}");
}

#[tokio::test]
async fn no_providers_fails_fast() {
    let d = dispatcher(Vec::new(), CALL_TIMEOUT);
    assert!(d.is_empty());

    let err = d.dispatch("prompt").await.unwrap_err();
    assert!(matches!(err, DispatchError::NoProviderConfigured));
    assert_eq!(err.to_string(), "no provider configured");
}

#[tokio::test]
async fn whitespace_only_text_counts_as_failure() {
    let primary = FakeProvider::text("   \n ");
    let secondary = FakeProvider::text("real");

    let d = dispatcher(
        vec![slot("primary", &primary), slot("secondary", &secondary)],
        CALL_TIMEOUT,
    );

    let out = d.dispatch("prompt").await.unwrap();
    assert_eq!(out.provider, "secondary");
}

#[tokio::test]
async fn reversed_order_tries_fallback_first() {
    let primary = FakeProvider::text("from primary");
    let secondary = FakeProvider::text("from secondary");

    let d = Dispatcher::new(
        vec![slot("primary", &primary), slot("secondary", &secondary)],
        ProviderOrder::Reversed,
        CALL_TIMEOUT,
    );

    assert_eq!(d.provider_names(), ["secondary", "primary"]);
    let out = d.dispatch("prompt").await.unwrap();
    assert_eq!(out.provider, "secondary");
    assert_eq!(primary.calls(), 0);
}

#[test]
fn provider_order_parses_known_names() {
    assert_eq!(
        ProviderOrder::parse("primary-first"),
        Some(ProviderOrder::PrimaryFirst)
    );
    assert_eq!(ProviderOrder::parse(" Reversed "), Some(ProviderOrder::Reversed));
    assert_eq!(ProviderOrder::parse("random"), None);
}

#[tokio::test]
async fn cache_hit_skips_every_provider() {
    let primary = FakeProvider::text("fresh");
    let cache = Arc::new(ResponseCache::memory(Duration::from_secs(60)));
    let d = dispatcher(vec![slot("primary", &primary)], CALL_TIMEOUT).with_cache(cache.clone());

    let first = d.dispatch("prompt").await.unwrap();
    assert!(!first.cached);
    let second = d.dispatch("prompt").await.unwrap();
    assert!(second.cached);
    assert_eq!(second.text, "fresh");
    assert_eq!(second.provider, "primary");
    assert_eq!(primary.calls(), 1);

    let stats = cache.stats().await.unwrap();
    assert_eq!((stats.hits, stats.misses), (1, 1));
}

#[tokio::test]
async fn answer_is_cached_under_the_provider_that_gave_it() {
    let primary = FakeProvider::http_error(503);
    let secondary = FakeProvider::text("from secondary");
    let cache = Arc::new(ResponseCache::memory(Duration::from_secs(60)));
    let d = dispatcher(
        vec![slot("primary", &primary), slot("secondary", &secondary)],
        CALL_TIMEOUT,
    )
    .with_cache(cache.clone());

    d.dispatch("prompt").await.unwrap();

    assert!(!cache.info("prompt", "primary", "primary-model").await.unwrap().exists);
    assert!(cache.info("prompt", "secondary", "secondary-model").await.unwrap().exists);

    let again = d.dispatch("prompt").await.unwrap();
    assert!(again.cached);
    assert_eq!(again.provider, "secondary");
    assert_eq!(primary.calls(), 1);
}

#[tokio::test]
async fn failures_and_other_models_are_not_served_from_cache() {
    let cache = Arc::new(ResponseCache::memory(Duration::from_secs(60)));

    let failing = FakeProvider::http_error(500);
    let d = dispatcher(vec![slot("primary", &failing)], CALL_TIMEOUT).with_cache(cache.clone());
    assert!(d.dispatch("prompt").await.is_err());
    assert!(d.dispatch("prompt").await.is_err());
    assert_eq!(failing.calls(), 2);

    cache.store("prompt", "primary", "other-model", "stale").await;
    let ok = FakeProvider::text("new");
    let d = dispatcher(vec![slot("primary", &ok)], CALL_TIMEOUT).with_cache(cache);
    let out = d.dispatch("prompt").await.unwrap();
    assert_eq!(out.text, "new");
    assert!(!out.cached);
}

#[tokio::test]
async fn cached_entries_expire() {
    let primary = FakeProvider::text("answer");
    let cache = Arc::new(ResponseCache::memory(Duration::from_millis(50)));
    let d = dispatcher(vec![slot("primary", &primary)], CALL_TIMEOUT).with_cache(cache.clone());

    d.dispatch("prompt").await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    let out = d.dispatch("prompt").await.unwrap();
    assert!(!out.cached);
    assert_eq!(primary.calls(), 2);

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(cache.purge_expired().await.unwrap(), 1);
    assert_eq!(cache.stats().await.unwrap().entries, 0);
}

#[tokio::test]
async fn empty_dispatcher_never_consults_the_cache() {
    let cache = Arc::new(ResponseCache::memory(Duration::from_secs(60)));
    let d = Dispatcher::new(Vec::new(), ProviderOrder::PrimaryFirst, CALL_TIMEOUT)
        .with_cache(cache.clone());

    assert!(matches!(
        d.dispatch("prompt").await,
        Err(DispatchError::NoProviderConfigured)
    ));
    assert_eq!(cache.stats().await.unwrap().total_requests, 0);
}

//! End-to-end gateway pipeline tests: deduplication, degradation,
//! breaker recovery, retry budgets, and TTL-driven refetching.

use serde_json::{json, Value};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tastegate_core::{
    FetchError, FetchFn, FetchFuture, GatewayBuilder, GatewayConfig, Params, RequestOptions,
    RequestOptimizer,
};

fn gateway(mutate: impl FnOnce(&mut GatewayConfig)) -> RequestOptimizer {
    let mut config = GatewayConfig::default();
    config.retry.initial_delay_ms = 10;
    config.retry.max_delay_ms = 50;
    mutate(&mut config);
    GatewayBuilder::new().with_config(config).build().expect("valid test config")
}

fn params(name: &str) -> Params {
    [(String::from("name"), name.into())].into_iter().collect()
}

/// Fetch closure that counts invocations and pops scripted outcomes.
/// A `delay` simulates upstream latency so concurrent callers overlap.
fn scripted_fetch(
    calls: Arc<AtomicUsize>,
    outcomes: Vec<Result<Value, FetchError>>,
    delay: Duration,
) -> FetchFn {
    let outcomes = Arc::new(parking_lot::Mutex::new(
        outcomes.into_iter().rev().collect::<Vec<_>>(),
    ));
    Arc::new(move || {
        calls.fetch_add(1, Ordering::SeqCst);
        let next = outcomes.lock().pop().expect("fetch called more times than scripted");
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            next
        }) as FetchFuture
    })
}

#[tokio::test]
async fn concurrent_identical_requests_share_one_fetch() {
    let gw = Arc::new(gateway(|_| {}));
    let calls = Arc::new(AtomicUsize::new(0));
    let fetch = scripted_fetch(
        Arc::clone(&calls),
        vec![Ok(json!({"recommendations": ["a", "b"]}))],
        Duration::from_millis(80),
    );

    let mut handles = Vec::new();
    for _ in 0..5 {
        let gw = Arc::clone(&gw);
        let fetch = Arc::clone(&fetch);
        handles.push(tokio::spawn(async move {
            gw.optimized_request("music", &params("jazz"), fetch, RequestOptions::new()).await
        }));
    }

    for handle in handles {
        let result = handle.await.unwrap();
        assert!(result.success);
        assert_eq!(result.data, Some(json!({"recommendations": ["a", "b"]})));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1, "identical requests must share one upstream call");
    let stats = gw.get_stats().await;
    assert_eq!(stats.deduped_requests, 4);
    assert_eq!(stats.total_requests, 5);

    // The shared result was cached for later callers
    let cached = gw
        .optimized_request(
            "music",
            &params("jazz"),
            scripted_fetch(Arc::new(AtomicUsize::new(0)), vec![], Duration::ZERO),
            RequestOptions::new(),
        )
        .await;
    assert!(cached.from_cache);
}

#[tokio::test]
async fn degraded_response_reports_its_errors() {
    let gw = gateway(|_| {});
    let fetch = scripted_fetch(
        Arc::new(AtomicUsize::new(0)),
        vec![Err(FetchError::InsufficientData("only 1 result".into()))],
        Duration::ZERO,
    );

    let result = gw
        .optimized_request(
            "music",
            &params("obscure"),
            fetch,
            RequestOptions::new().with_fallback_value(json!(["A", "B"])),
        )
        .await;

    assert!(result.success, "a fallback value makes the request succeed");
    assert!(result.degraded);
    assert!(!result.from_cache);
    assert_eq!(result.data, Some(json!(["A", "B"])));
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind.as_str(), "insufficient_data");

    let stats = gw.get_stats().await;
    assert_eq!(stats.degraded_responses, 1);
    assert_eq!(stats.failed_requests, 1);
}

#[tokio::test]
async fn breaker_opens_then_probes_after_cooldown() {
    let gw = gateway(|c| {
        c.breaker.threshold = 2;
        c.breaker.cooldown_ms = 60;
        c.retry.max_retries = 0;
    });
    let calls = Arc::new(AtomicUsize::new(0));

    for name in ["a", "b"] {
        let fetch = scripted_fetch(
            Arc::clone(&calls),
            vec![Err(FetchError::Connection("refused".into()))],
            Duration::ZERO,
        );
        let result =
            gw.optimized_request("music", &params(name), fetch, RequestOptions::new()).await;
        assert!(!result.success);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Open: the next request is rejected without touching the upstream
    let fetch = scripted_fetch(Arc::clone(&calls), vec![Ok(json!("unused"))], Duration::ZERO);
    let rejected =
        gw.optimized_request("music", &params("c"), fetch, RequestOptions::new()).await;
    assert!(!rejected.success);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(rejected.errors.last().unwrap().context.as_deref(), Some("circuit_open"));
    assert_eq!(gw.get_stats().await.circuit_breaker_states["music"].state.as_str(), "open");

    tokio::time::sleep(Duration::from_millis(80)).await;

    // Cooldown elapsed: one probe is admitted and closes the circuit
    let fetch = scripted_fetch(Arc::clone(&calls), vec![Ok(json!("recovered"))], Duration::ZERO);
    let probe = gw.optimized_request("music", &params("d"), fetch, RequestOptions::new()).await;
    assert!(probe.success);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(gw.get_stats().await.circuit_breaker_states["music"].state.as_str(), "closed");
}

#[tokio::test]
async fn retry_budget_bounds_upstream_calls() {
    let gw = gateway(|c| c.retry.max_retries = 2);
    let calls = Arc::new(AtomicUsize::new(0));
    let fetch = scripted_fetch(
        Arc::clone(&calls),
        vec![Err(FetchError::Timeout), Err(FetchError::Timeout), Err(FetchError::Timeout)],
        Duration::ZERO,
    );

    let result = gw.optimized_request("music", &params("x"), fetch, RequestOptions::new()).await;

    assert!(!result.success);
    // One initial attempt plus exactly max_retries retries
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.errors.last().unwrap().kind.as_str(), "upstream_timeout");
}

#[tokio::test]
async fn expired_entries_are_refetched() {
    let gw = gateway(|c| {
        c.cache.base_ttl_ms = 30;
        c.cache.min_ttl_ms = 30;
        c.cache.max_ttl_ms = 30;
    });
    let calls = Arc::new(AtomicUsize::new(0));
    let fetch =
        scripted_fetch(Arc::clone(&calls), vec![Ok(json!(1)), Ok(json!(2))], Duration::ZERO);

    let first = gw
        .optimized_request("music", &params("x"), Arc::clone(&fetch), RequestOptions::new())
        .await;
    assert_eq!(first.data, Some(json!(1)));

    tokio::time::sleep(Duration::from_millis(60)).await;

    let second =
        gw.optimized_request("music", &params("x"), fetch, RequestOptions::new()).await;
    assert!(!second.from_cache, "entry past its TTL must be refetched");
    assert_eq!(second.data, Some(json!(2)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn stats_roll_up_and_reset() {
    let gw = gateway(|_| {});

    let ok = scripted_fetch(
        Arc::new(AtomicUsize::new(0)),
        vec![Ok(json!("data"))],
        Duration::ZERO,
    );
    gw.optimized_request("music", &params("hit"), Arc::clone(&ok), RequestOptions::new()).await;
    gw.optimized_request("music", &params("hit"), ok, RequestOptions::new()).await;

    let bad = scripted_fetch(
        Arc::new(AtomicUsize::new(0)),
        vec![Err(FetchError::InsufficientData("sparse".into()))],
        Duration::ZERO,
    );
    gw.optimized_request("music", &params("miss"), bad, RequestOptions::new()).await;

    let stats = gw.get_stats().await;
    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.successful_requests, 2);
    assert_eq!(stats.failed_requests, 1);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 2);
    assert!((stats.cache_hit_rate - 1.0 / 3.0).abs() < 1e-9);
    assert_eq!(stats.error_breakdown["insufficient_data"], 1);
    assert!(stats.avg_response_time_ms >= 0.0);

    gw.reset_metrics();
    let zeroed = gw.get_stats().await;
    assert_eq!(zeroed.total_requests, 0);
    assert!(zeroed.error_breakdown.is_empty());
}

#[tokio::test]
async fn interactive_requests_jump_the_admission_queue() {
    // One permit forces queueing; the held slot is the first request
    let gw = Arc::new(gateway(|c| c.limits.max_concurrent_requests = 1));
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let slow = scripted_fetch(
        Arc::new(AtomicUsize::new(0)),
        vec![Ok(json!("slow"))],
        Duration::from_millis(60),
    );
    let holder = {
        let gw = Arc::clone(&gw);
        tokio::spawn(async move {
            gw.optimized_request("music", &params("hold"), slow, RequestOptions::new()).await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut waiters = Vec::new();
    for (name, priority, delay) in [
        ("background", tastegate_core::Priority::Background, Duration::from_millis(30)),
        ("interactive", tastegate_core::Priority::Interactive, Duration::ZERO),
    ] {
        let gw = Arc::clone(&gw);
        let order = Arc::clone(&order);
        let fetch =
            scripted_fetch(Arc::new(AtomicUsize::new(0)), vec![Ok(json!(name))], delay);
        waiters.push(tokio::spawn(async move {
            let result = gw
                .optimized_request(
                    "music",
                    &params(name),
                    fetch,
                    RequestOptions::new().with_priority(priority),
                )
                .await;
            order.lock().push(name);
            result
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(holder.await.unwrap().success);
    for waiter in waiters {
        assert!(waiter.await.unwrap().success);
    }

    // Interactive was queued after background but completed first
    assert_eq!(*order.lock(), vec!["interactive", "background"]);
}

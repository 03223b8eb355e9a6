//! End-to-end scenarios over an in-process fleet.
//!
//! Each test builds its own [`MemoryHub`] (one logical Redis), a handful of
//! dispatcher instances, and a throwaway axum upstream, then drives real
//! requests through election, admission and retries.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use tokio::time::sleep;

use dispatcher::client_config::RetryOptions;
use dispatcher::testing::MemoryHub;
use dispatcher::{
    Authentication, ClientSpec, Dispatcher, DispatcherError, DispatcherOptions, RateLimitSpec,
    RequestConfig,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn spawn_upstream(app: Router) -> SocketAddr {
    init_tracing();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn dispatcher_for(hub: &MemoryHub, priority: i64, spec: ClientSpec) -> Dispatcher {
    let options = DispatcherOptions::new("integration-key", hub.transport())
        .with_priority(priority)
        .with_generator("upstream", move || vec![spec.clone()]);
    Dispatcher::new(options).unwrap()
}

#[tokio::test]
async fn token_bucket_paces_requests_across_two_instances() {
    let app = Router::new().route("/item", get(|| async { "ok" }));
    let addr = spawn_upstream(app).await;

    let hub = MemoryHub::new();
    let mut spec = ClientSpec::new("test").with_rate_limit(RateLimitSpec::RequestLimit {
        interval: 100,
        tokens_to_add: 1.0,
        max_tokens: 1.0,
    });
    spec.request_options.defaults.base_url = Some(format!("http://{}", addr));

    let low = dispatcher_for(&hub, 1, spec.clone());
    let high = dispatcher_for(&hub, 2, spec);
    low.start().await.unwrap();
    high.start().await.unwrap();
    sleep(Duration::from_millis(100)).await;

    // The higher-priority instance is the admission authority.
    assert!(high.owned_clients().await.contains(&"test".to_string()));
    assert!(low.owned_clients().await.is_empty());

    // All five calls are submitted from the worker instance at once.
    let started = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..5 {
        let low = low.clone();
        handles.push(tokio::spawn(async move {
            low.handle_request(RequestConfig::get("test", "/item")).await
        }));
    }
    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.status, 200);
    }

    // One token at start plus one per 100ms refill: five calls need at
    // least four refill cycles.
    assert!(
        started.elapsed() >= Duration::from_millis(350),
        "bucket did not pace admissions: {:?}",
        started.elapsed()
    );

    low.stop().await.unwrap();
    high.stop().await.unwrap();
}

#[tokio::test]
async fn concurrency_gate_admits_in_cost_bounded_waves() {
    #[derive(Clone)]
    struct Upstream {
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    async fn slow(State(upstream): State<Upstream>) -> &'static str {
        let now = upstream.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        upstream.peak.fetch_max(now, Ordering::SeqCst);
        sleep(Duration::from_millis(150)).await;
        upstream.in_flight.fetch_sub(1, Ordering::SeqCst);
        "ok"
    }

    let upstream = Upstream {
        in_flight: Arc::new(AtomicUsize::new(0)),
        peak: Arc::new(AtomicUsize::new(0)),
    };
    let app = Router::new()
        .route("/slow", get(slow))
        .with_state(upstream.clone());
    let addr = spawn_upstream(app).await;

    let hub = MemoryHub::new();
    let mut spec = ClientSpec::new("gated")
        .with_rate_limit(RateLimitSpec::ConcurrencyLimit { max_concurrency: 2 });
    spec.request_options.defaults.base_url = Some(format!("http://{}", addr));

    let dispatcher = dispatcher_for(&hub, 1, spec);
    dispatcher.start().await.unwrap();
    sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let mut handles = Vec::new();
    for cost in [1u64, 1, 2] {
        let dispatcher = dispatcher.clone();
        handles.push(tokio::spawn(async move {
            let mut config = RequestConfig::get("gated", "/slow");
            config.cost = Some(cost);
            dispatcher.handle_request(config).await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().status, 200);
    }

    // Summed cost 4 against a gate of 2 forces at least two sequential
    // waves, whichever order the selector picks.
    assert!(
        started.elapsed() >= Duration::from_millis(280),
        "gate admitted too eagerly: {:?}",
        started.elapsed()
    );
    assert!(upstream.peak.load(Ordering::SeqCst) <= 2);

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn rate_limited_upstream_triggers_freeze_and_retry() {
    #[derive(Clone)]
    struct Flaky {
        hits: Arc<AtomicUsize>,
    }

    async fn flaky(State(state): State<Flaky>) -> StatusCode {
        if state.hits.fetch_add(1, Ordering::SeqCst) == 0 {
            StatusCode::TOO_MANY_REQUESTS
        } else {
            StatusCode::OK
        }
    }

    let flaky_state = Flaky {
        hits: Arc::new(AtomicUsize::new(0)),
    };
    let app = Router::new()
        .route("/flaky", get(flaky))
        .with_state(flaky_state.clone());
    let addr = spawn_upstream(app).await;

    let hub = MemoryHub::new();
    let mut spec = ClientSpec::new("burst").with_rate_limit(RateLimitSpec::RequestLimit {
        interval: 50,
        tokens_to_add: 10.0,
        max_tokens: 10.0,
    });
    spec.request_options.defaults.base_url = Some(format!("http://{}", addr));

    let dispatcher = dispatcher_for(&hub, 1, spec);
    dispatcher.start().await.unwrap();
    sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let response = dispatcher
        .handle_request(RequestConfig::get("burst", "/flaky"))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(flaky_state.hits.load(Ordering::SeqCst), 2);
    // The first retry backs off for at least one refill cycle.
    assert!(started.elapsed() >= Duration::from_millis(45));

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn retries_are_bounded_and_errors_surface() {
    #[derive(Clone)]
    struct Broken {
        hits: Arc<AtomicUsize>,
    }

    async fn broken(State(state): State<Broken>) -> StatusCode {
        state.hits.fetch_add(1, Ordering::SeqCst);
        StatusCode::INTERNAL_SERVER_ERROR
    }

    let broken_state = Broken {
        hits: Arc::new(AtomicUsize::new(0)),
    };
    let app = Router::new()
        .route("/broken", get(broken))
        .with_state(broken_state.clone());
    let addr = spawn_upstream(app).await;

    let hub = MemoryHub::new();
    let mut spec = ClientSpec::new("sad")
        .with_rate_limit(RateLimitSpec::ConcurrencyLimit { max_concurrency: 4 });
    spec.request_options.defaults.base_url = Some(format!("http://{}", addr));
    spec.retry_options = RetryOptions {
        max_retries: Some(1),
        retry_backoff_base_time: Some(20),
        ..RetryOptions::default()
    };

    let dispatcher = dispatcher_for(&hub, 1, spec);
    dispatcher.start().await.unwrap();
    sleep(Duration::from_millis(50)).await;

    let result = dispatcher
        .handle_request(RequestConfig::get("sad", "/broken"))
        .await;
    match result {
        Err(DispatcherError::HttpStatus { status, .. }) => assert_eq!(status, 500),
        other => panic!("expected surfaced 500, got {:?}", other.map(|r| r.status)),
    }
    // One initial attempt plus exactly one retry.
    assert_eq!(broken_state.hits.load(Ordering::SeqCst), 2);

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn sub_client_uses_parent_auth_and_own_base_url() {
    async fn echo_auth(headers: HeaderMap) -> String {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    let app = Router::new().route("/echo", get(echo_auth));
    let addr = spawn_upstream(app).await;

    let hub = MemoryHub::new();
    let mut parent = ClientSpec::new("api")
        .with_rate_limit(RateLimitSpec::ConcurrencyLimit { max_concurrency: 5 });
    parent.authentication = Some(Authentication::token("X"));
    let mut child = ClientSpec::new("images");
    child.request_options.defaults.base_url = Some(format!("http://{}", addr));
    parent.sub_clients.push(child);

    let dispatcher = dispatcher_for(&hub, 1, parent);
    dispatcher.start().await.unwrap();
    sleep(Duration::from_millis(50)).await;

    assert!(dispatcher
        .client_names()
        .await
        .contains(&"api:images".to_string()));

    let response = dispatcher
        .handle_request(RequestConfig::get("api:images", "/echo"))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "Bearer X");

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn default_client_executes_without_configuration() {
    let app = Router::new().route("/ping", get(|| async { "pong" }));
    let addr = spawn_upstream(app).await;

    let hub = MemoryHub::new();
    let options = DispatcherOptions::new("integration-key", hub.transport());
    let dispatcher = Dispatcher::new(options).unwrap();
    dispatcher.start().await.unwrap();

    let response = dispatcher
        .handle_request(RequestConfig::get(
            "default",
            &format!("http://{}/ping", addr),
        ))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "pong");

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn graceful_controller_handoff_keeps_serving() {
    let app = Router::new().route("/item", get(|| async { "ok" }));
    let addr = spawn_upstream(app).await;

    let hub = MemoryHub::new();
    let mut spec = ClientSpec::new("test")
        .with_rate_limit(RateLimitSpec::ConcurrencyLimit { max_concurrency: 2 });
    spec.request_options.defaults.base_url = Some(format!("http://{}", addr));

    let first = dispatcher_for(&hub, 1, spec.clone());
    let second = dispatcher_for(&hub, 2, spec.clone());
    let third = dispatcher_for(&hub, 3, spec);
    first.start().await.unwrap();
    second.start().await.unwrap();
    third.start().await.unwrap();
    sleep(Duration::from_millis(100)).await;

    assert!(third.owned_clients().await.contains(&"test".to_string()));

    // The top instance leaves; the next priority takes over and admission
    // keeps working for the survivors.
    third.stop().await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert!(second.owned_clients().await.contains(&"test".to_string()));

    let response = first
        .handle_request(RequestConfig::get("test", "/item"))
        .await
        .unwrap();
    assert_eq!(response.status, 200);

    first.stop().await.unwrap();
    second.stop().await.unwrap();
}

#[tokio::test]
async fn regenerate_clients_rebuilds_from_generators() {
    init_tracing();
    let hub = MemoryHub::new();
    let generation = Arc::new(AtomicUsize::new(0));
    let options = {
        let generation = generation.clone();
        DispatcherOptions::new("integration-key", hub.transport()).with_generator(
            "dynamic",
            move || {
                let n = generation.load(Ordering::SeqCst);
                vec![ClientSpec::new(&format!("svc-{}", n))]
            },
        )
    };
    let dispatcher = Dispatcher::new(options).unwrap();
    dispatcher.start().await.unwrap();
    sleep(Duration::from_millis(50)).await;

    assert!(dispatcher.client_names().await.contains(&"svc-0".to_string()));

    generation.store(1, Ordering::SeqCst);
    dispatcher.regenerate_clients(None).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    let names = dispatcher.client_names().await;
    assert!(names.contains(&"svc-1".to_string()));
    assert!(!names.contains(&"svc-0".to_string()));

    dispatcher.stop().await.unwrap();
}

/// Exercises the real Redis transport. Run with a local Redis:
/// `REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`
#[tokio::test]
#[ignore = "requires a running Redis"]
async fn redis_transport_round_trips_pubsub_and_storage() {
    use dispatcher::{RedisTransport, Transport};

    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let transport = RedisTransport::connect(&url).await.unwrap();

    let mut receiver = transport
        .subscribe(vec!["dispatcher-test:channel".to_string()])
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    transport
        .publish("dispatcher-test:channel", "hello")
        .await
        .unwrap();
    let message = tokio::time::timeout(Duration::from_secs(2), receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.payload, "hello");

    transport
        .set_with_expiry("dispatcher-test:key", "value", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        transport.get("dispatcher-test:key").await.unwrap(),
        Some("value".to_string())
    );
    transport.delete("dispatcher-test:key").await.unwrap();
}

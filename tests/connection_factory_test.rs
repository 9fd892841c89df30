//! Connection factory behavior against the in-memory backend

mod common;

use common::{init_test_logging, test_config, FakeBackend};
use futures::future::join_all;
use realtime_sync::{CircuitState, ConnectionFactory, ConnectionStatus, SyncError};
use std::time::Duration;
use tracing::info;

#[tokio::test(start_paused = true)]
async fn test_open_circuit_rejects_before_any_network_call() {
    init_test_logging();
    info!("🧪 Two creation failures with threshold 2, then a fast rejection");

    let backend = FakeBackend::unreachable();
    let factory = ConnectionFactory::new(
        test_config().with_circuit_breaker_threshold(2),
        backend.client_factory(),
    );

    let first = factory.get_connection().await.unwrap_err();
    assert!(matches!(first, SyncError::ConnectionUnavailable { .. }));
    assert!(!first.is_circuit_open());
    assert_eq!(factory.circuit_state(), CircuitState::Closed);

    let second = factory.get_connection().await.unwrap_err();
    assert!(matches!(second, SyncError::ConnectionUnavailable { .. }));
    assert_eq!(factory.circuit_state(), CircuitState::Open);
    assert_eq!(backend.creates(), 2);

    let third = factory.get_connection().await.unwrap_err();
    assert!(third.is_circuit_open());
    assert!(third.retry_after().is_some());
    assert_eq!(backend.creates(), 2, "rejection must not touch the backend");

    let health = factory.health();
    assert_eq!(health.status, ConnectionStatus::Failed);
    assert_eq!(health.failure_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_sequence_backs_off_between_attempts() {
    init_test_logging();

    let backend = FakeBackend::unreachable();
    let factory = ConnectionFactory::new(
        test_config()
            .with_max_retries(3)
            .with_retry_delays_ms(1_000, 30_000),
        backend.client_factory(),
    );

    let started = tokio::time::Instant::now();
    factory.get_connection().await.unwrap_err();

    // Two backoff sleeps: 1s then 2s
    assert_eq!(backend.creates(), 3);
    assert_eq!(started.elapsed(), Duration::from_millis(3_000));
    assert_eq!(factory.stats().connection_failures, 3);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_share_one_attempt() {
    init_test_logging();

    let backend = FakeBackend::new();
    backend.set_create_delay(Duration::from_millis(500));
    let factory = ConnectionFactory::new(test_config(), backend.client_factory());

    let results = join_all((0..10).map(|_| {
        let factory = factory.clone();
        async move { factory.get_connection().await }
    }))
    .await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(backend.creates(), 1);
    assert_eq!(factory.status(), ConnectionStatus::Connected);

    factory.get_connection().await.unwrap();
    assert_eq!(backend.creates(), 1, "healthy client is reused");
}

#[tokio::test(start_paused = true)]
async fn test_half_open_probe_recovers_connection() {
    init_test_logging();

    let backend = FakeBackend::unreachable();
    let config = test_config()
        .with_circuit_breaker_threshold(2)
        .with_retry_delays_ms(1_000, 10_000);
    let factory = ConnectionFactory::new(config, backend.client_factory());

    factory.get_connection().await.unwrap_err();
    factory.get_connection().await.unwrap_err();
    assert_eq!(factory.circuit_state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(factory.circuit_state(), CircuitState::HalfOpen);

    backend.set_create_failing(false);
    factory.get_connection().await.unwrap();

    let health = factory.health();
    assert_eq!(health.status, ConnectionStatus::Connected);
    assert_eq!(health.failure_count, 0);
    assert!(health.last_connected_at.is_some());
    assert_eq!(factory.circuit_state(), CircuitState::Closed);
    assert_eq!(backend.creates(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failed_half_open_probe_reopens_circuit() {
    init_test_logging();

    let backend = FakeBackend::unreachable();
    let config = test_config()
        .with_max_retries(3)
        .with_circuit_breaker_threshold(2)
        .with_retry_delays_ms(1_000, 10_000);
    let factory = ConnectionFactory::new(config, backend.client_factory());

    factory.get_connection().await.unwrap_err();
    assert_eq!(factory.circuit_state(), CircuitState::Open);
    assert_eq!(backend.creates(), 2, "sequence stops once the circuit opens");

    tokio::time::sleep(Duration::from_secs(10)).await;
    factory.get_connection().await.unwrap_err();
    assert_eq!(backend.creates(), 3, "half-open admits exactly one attempt");
    assert_eq!(factory.circuit_state(), CircuitState::Open);
    assert!(factory.health().failure_count >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_probe_failure_counts_as_connection_failure() {
    init_test_logging();

    let backend = FakeBackend::new();
    backend.set_probe_failing(true);
    let factory = ConnectionFactory::new(test_config(), backend.client_factory());

    let error = factory.get_connection().await.unwrap_err();
    assert!(error.is_connection_level());
    assert_eq!(factory.health().failure_count, 1);
    assert!(factory.current_client().is_none());

    backend.set_probe_failing(false);
    factory.get_connection().await.unwrap();
    assert!(factory.current_client().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_probe_timeout_is_a_failure() {
    init_test_logging();

    let backend = FakeBackend::new();
    backend.set_probe_delay(Duration::from_secs(5));
    let factory = ConnectionFactory::new(
        test_config().with_probe_timeout_ms(100),
        backend.client_factory(),
    );

    let error = factory.get_connection().await.unwrap_err();
    assert!(error.to_string().contains("100"), "{error}");
    assert_eq!(factory.health().failure_count, 1);

    // A slow creation does not count against the probe timeout
    backend.set_probe_delay(Duration::ZERO);
    backend.set_create_delay(Duration::from_millis(500));
    factory.get_connection().await.unwrap();
    assert_eq!(factory.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_background_probe_decay_never_opens_circuit() {
    init_test_logging();

    let backend = FakeBackend::new();
    let config = test_config()
        .with_circuit_breaker_threshold(2)
        .with_health_check_interval_ms(1_000);
    let factory = ConnectionFactory::new(config, backend.client_factory());
    let mut status = factory.status_watch();

    factory.get_connection().await.unwrap();
    factory.start_health_probe();

    backend.set_probe_failing(true);
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert_eq!(*status.borrow_and_update(), ConnectionStatus::Disconnected);
    assert_eq!(factory.health().failure_count, 1);
    assert_eq!(factory.circuit_state(), CircuitState::Closed);
    assert_eq!(factory.stats().health_probe_failures, 1);

    factory.shutdown().await;
    assert!(!factory.is_health_probe_running());
    assert_eq!(factory.health().failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_abandons_in_flight_attempt() {
    init_test_logging();
    info!("🧪 Shutdown while a connection attempt is still creating its client");

    let backend = FakeBackend::new();
    backend.set_create_delay(Duration::from_secs(2));
    let factory = ConnectionFactory::new(test_config(), backend.client_factory());

    let attempt = tokio::spawn({
        let factory = factory.clone();
        async move { factory.get_connection().await }
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    factory.shutdown().await;
    assert!(factory.is_shut_down());

    let result = attempt.await.unwrap();
    assert!(matches!(result, Err(SyncError::ShutDown)));
    assert_eq!(backend.creates(), 1);
    assert!(factory.current_client().is_none());
    assert_eq!(factory.status(), ConnectionStatus::Disconnected);
    assert_eq!(*factory.status_watch().borrow(), ConnectionStatus::Disconnected);

    assert!(matches!(
        factory.get_connection().await,
        Err(SyncError::ShutDown)
    ));
    assert_eq!(backend.creates(), 1, "no attempt after shutdown");
}

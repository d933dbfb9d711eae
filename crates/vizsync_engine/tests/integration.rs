//! Integration tests for the retry engine, optimistic state and dispatcher.

use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use vizsync_engine::{
    CircuitBreakerConfig, CircuitState, DispatcherConfig, DispatcherHandlers, DrainReport,
    EmitOptions, EventDispatcher, MemoryChannel, OptimisticObservers, OptimisticState,
    RecoveryConfig, RecoveryError, RecoveryObservers, RetryConfig, RetryEngine, Severity,
};
use vizsync_protocol::{event_names, DeviceStatus, DeviceStatusUpdate};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn scenario_config() -> RecoveryConfig {
    RecoveryConfig::new(
        RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1000))
            .with_backoff_multiplier(2.0)
            .with_jitter(false),
        CircuitBreakerConfig::new(2, 1, Duration::from_millis(200)),
    )
}

#[tokio::test(start_paused = true)]
async fn failing_operation_opens_breaker_and_rejects_next_call() {
    init_tracing();

    let breaker_changes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&breaker_changes);
    let engine = RetryEngine::with_observers(
        scenario_config(),
        RecoveryObservers::new().on_circuit_breaker_change(move |open| sink.lock().push(open)),
    )
    .unwrap();

    let start = Instant::now();
    let attempt_times = Arc::new(Mutex::new(Vec::new()));
    let times = Arc::clone(&attempt_times);
    let failures = Arc::new(AtomicU32::new(0));

    let result: Result<(), _> = engine
        .retry_with(
            "ping",
            || {
                times.lock().push(start.elapsed().as_millis());
                async { Err::<(), _>("connection refused") }
            },
            |_| {},
            |_| {
                failures.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;

    assert!(matches!(
        result,
        Err(RecoveryError::MaxAttemptsExceeded { attempts: 3, .. })
    ));
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(*attempt_times.lock(), vec![0, 100, 300]);
    assert_eq!(engine.circuit_state(), CircuitState::Open);
    assert_eq!(*breaker_changes.lock(), vec![true]);

    let invocations = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&invocations);
    let second: Result<u32, _> = engine
        .retry("ping", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>(1) }
        })
        .await;

    assert!(matches!(second, Err(RecoveryError::CircuitOpen { .. })));
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    let info = engine.get_error("ping").unwrap();
    assert_eq!(info.severity, Severity::Critical);
    assert!(info.error.contains("Circuit breaker is OPEN"));
    assert!(engine.has_critical_errors());
}

#[tokio::test(start_paused = true)]
async fn breaker_recovers_after_cool_down() {
    let engine = RetryEngine::new(RecoveryConfig::new(
        RetryConfig::new(1),
        CircuitBreakerConfig::new(1, 1, Duration::from_millis(200)),
    ))
    .unwrap();

    let first: Result<(), _> = engine
        .retry("sync", || async { Err::<(), _>("timeout") })
        .await;
    assert!(first.is_err());
    assert!(engine.is_circuit_breaker_open());

    tokio::time::advance(Duration::from_millis(250)).await;

    let value = engine
        .retry("sync", || async { Ok::<_, String>("done") })
        .await
        .unwrap();
    assert_eq!(value, "done");
    assert_eq!(engine.circuit_state(), CircuitState::Closed);
    assert!(engine.get_error("sync").is_none());
}

#[test]
fn optimistic_updates_roll_back_to_baseline() {
    let commits = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&commits);
    let state = OptimisticState::with_observers(
        10,
        OptimisticObservers::new().on_commit(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    state.update_optimistic("u1", |v| v + 1, None);
    assert_eq!(state.state(), 11);
    state.update_optimistic("u2", |v| v + 1, Some(json!({ "source": "ui" })));
    assert_eq!(state.state(), 12);

    assert_eq!(state.rollback_all(), 2);
    assert_eq!(state.state(), 10);
    assert!(!state.has_pending_updates());

    state.update_optimistic("u3", |v| v * 2, None);
    assert!(state.commit_optimistic("u3"));
    assert!(!state.commit_optimistic("u3"));
    assert_eq!(state.state(), 20);
    assert_eq!(commits.load(Ordering::SeqCst), 1);
}

#[test]
fn offline_session_overflows_conflicts_and_recovers() {
    init_tracing();

    let channel = MemoryChannel::disconnected();
    let dispatcher = EventDispatcher::new(
        DispatcherConfig::default()
            .with_offline_queue_size(3)
            .with_retry_attempts(2),
        channel.clone(),
        DispatcherHandlers::new(),
    )
    .unwrap();

    let ids: Vec<String> = (0..4)
        .map(|n| {
            dispatcher.emit_custom_event("content:push", json!({ "n": n }), EmitOptions::default())
        })
        .collect();
    assert_eq!(dispatcher.offline_queue_len(), 3);
    assert_eq!(dispatcher.offline_queue()[0].id, ids[1]);

    channel.set_fail_emits(true);
    channel.connect();
    channel.disconnect();
    channel.connect();

    assert_eq!(dispatcher.offline_queue_len(), 0);
    let conflicted: Vec<String> = dispatcher
        .conflicted_changes()
        .into_iter()
        .map(|item| item.id)
        .collect();
    assert_eq!(conflicted, ids[1..].to_vec());

    channel.set_fail_emits(false);
    for id in &conflicted {
        assert!(dispatcher.requeue_conflicted(id));
    }
    assert_eq!(
        dispatcher.sync_offline_queue(),
        DrainReport {
            delivered: 3,
            failed: 0,
            conflicted: 0
        }
    );

    let delivered: Vec<i64> = channel
        .emitted()
        .iter()
        .filter_map(|(_, payload)| payload["n"].as_i64())
        .collect();
    assert_eq!(delivered, vec![1, 2, 3]);
}

#[test]
fn optimistic_device_update_confirmed_by_status_event() {
    let channel = MemoryChannel::new();
    let dispatcher = EventDispatcher::new(
        DispatcherConfig::default(),
        channel.clone(),
        DispatcherHandlers::new(),
    )
    .unwrap();

    let update = DeviceStatusUpdate {
        device_id: "lobby-1".into(),
        status: DeviceStatus::Offline,
        last_seen: "2024-05-01T12:00:00Z".into(),
        current_playlist_id: Some("morning".into()),
    };
    let id = dispatcher.emit_device_update(&update).unwrap();

    let (event, payload) = channel.emitted().remove(0);
    assert_eq!(event, event_names::DEVICE_UPDATE);
    assert_eq!(payload["eventId"], json!(id));
    assert_eq!(dispatcher.sync_state().pending_changes.len(), 1);

    channel.deliver(event_names::DEVICE_STATUS, serde_json::to_value(&update).unwrap());
    assert!(dispatcher.sync_state().pending_changes.is_empty());
}

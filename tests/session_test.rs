//! Push-session lifecycle tests: auth deadline, heartbeat supervision,
//! and degradation to pull fallback.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use scribe::config::{Config, SessionConfig};
use scribe::services::{
    AuthService, ConflictEngine, ConnectionSupervisor, FallbackManager, OperationQueue,
    SqliteStore, SyncCoordinator,
};
use scribe::types::{CLOSE_AUTH_TIMEOUT, CLOSE_HEARTBEAT_TIMEOUT};

struct Harness {
    supervisor: Arc<ConnectionSupervisor>,
    fallback: Arc<FallbackManager>,
    auth: Arc<AuthService>,
}

fn harness(session: SessionConfig) -> Harness {
    let config = Config::from_env();
    let store = Arc::new(SqliteStore::new_in_memory().unwrap());
    let engine = ConflictEngine::new(store.clone(), config.policy, config.conflicts);
    let queue = Arc::new(OperationQueue::new(3, 1_000));
    let coordinator = SyncCoordinator::new(store, engine, queue, config.sync);
    let fallback = FallbackManager::new(config.health, config.polling, coordinator.clone());
    let auth = Arc::new(AuthService::new(Some("session-test".to_string())));
    let supervisor = ConnectionSupervisor::new(
        session,
        "scribe-test".to_string(),
        auth.clone(),
        coordinator,
        fallback.clone(),
    );
    Harness {
        supervisor,
        fallback,
        auth,
    }
}

fn fast_session() -> SessionConfig {
    SessionConfig {
        heartbeat_interval_ms: 40,
        heartbeat_timeout_ms: 120,
        auth_timeout_ms: 80,
        max_auth_attempts: 3,
        max_sessions_per_user: 0,
    }
}

fn frame_type(json: &str) -> String {
    serde_json::from_str::<serde_json::Value>(json)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(String::from))
        .unwrap_or_default()
}

async fn drain_until(
    rx: &mut mpsc::UnboundedReceiver<String>,
    wanted: &str,
    budget: Duration,
) -> Option<String> {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(frame)) if frame_type(&frame) == wanted => return Some(frame),
            Ok(Some(_)) => continue,
            _ => return None,
        }
    }
}

/// A session that never authenticates is closed with 4000 at the deadline.
#[tokio::test]
async fn test_auth_deadline_closes_session() {
    let h = harness(fast_session());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _session = h.supervisor.register(tx);

    let close = drain_until(&mut rx, "close", Duration::from_millis(500))
        .await
        .expect("close frame expected");
    assert!(close.contains("auth-timeout"));
    assert!(close.contains(&CLOSE_AUTH_TIMEOUT.to_string()));
    assert_eq!(h.supervisor.session_count(), 0);
}

/// An authenticated session that stops answering pings is closed with
/// 4002 and the disconnect lands in the health record.
#[tokio::test]
async fn test_heartbeat_timeout_closes_session_and_records_disconnect() {
    let h = harness(fast_session());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = h.supervisor.register(tx);

    let token = h.auth.issue_token(7, "laptop", 60_000);
    let auth = format!(r#"{{"type":"auth","token":"{}","timestamp":1}}"#, token);
    h.supervisor.handle_message(&session, &auth).await;

    // Say nothing and wait out the heartbeat timeout.
    let close = drain_until(&mut rx, "close", Duration::from_millis(2_000))
        .await
        .expect("close frame expected");
    assert!(close.contains("heartbeat-timeout"));
    assert!(close.contains(&CLOSE_HEARTBEAT_TIMEOUT.to_string()));
    assert_eq!(h.supervisor.session_count(), 0);

    let health = h.fallback.health_of("laptop").expect("health record expected");
    assert_eq!(health.disconnect_times.len(), 1);
}

/// Pings keep a session alive past the heartbeat timeout.
#[tokio::test]
async fn test_pings_keep_session_alive() {
    let h = harness(fast_session());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = h.supervisor.register(tx);

    let token = h.auth.issue_token(7, "laptop", 60_000);
    let auth = format!(r#"{{"type":"auth","token":"{}","timestamp":1}}"#, token);
    h.supervisor.handle_message(&session, &auth).await;

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        h.supervisor
            .handle_message(&session, r#"{"type":"ping","timestamp":1}"#)
            .await;
    }

    assert_eq!(h.supervisor.session_count(), 1);
    // Drain; no close frame should have arrived.
    while let Ok(frame) = rx.try_recv() {
        assert_ne!(frame_type(&frame), "close");
    }
}

/// Repeated session drops trip the disconnect threshold, start the pull
/// loop, and a clean reconnect restores push health.
#[tokio::test]
async fn test_fallback_trigger_and_recovery_through_sessions() {
    let h = harness(SessionConfig {
        heartbeat_interval_ms: 10_000,
        heartbeat_timeout_ms: 20_000,
        auth_timeout_ms: 10_000,
        max_auth_attempts: 3,
        max_sessions_per_user: 0,
    });

    // Three authenticated sessions dropping inside the observation window.
    for _ in 0..3 {
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = h.supervisor.register(tx);
        let token = h.auth.issue_token(9, "flaky-phone", 60_000);
        let auth = format!(r#"{{"type":"auth","token":"{}","timestamp":1}}"#, token);
        h.supervisor.handle_message(&session, &auth).await;
        h.supervisor.handle_disconnect(&session, "transport-error");
    }

    assert!(h.fallback.needs_fallback("flaky-phone"));
    assert!(h.fallback.pull_active("flaky-phone"));

    // A clean reconnect with successful auth exits fallback...
    let (tx, _rx) = mpsc::unbounded_channel();
    let session = h.supervisor.register(tx);
    let token = h.auth.issue_token(9, "flaky-phone", 60_000);
    let auth = format!(r#"{{"type":"auth","token":"{}","timestamp":1}}"#, token);
    h.supervisor.handle_message(&session, &auth).await;

    assert!(!h.fallback.needs_fallback("flaky-phone"));
    assert!(!h.fallback.pull_active("flaky-phone"));

    // ...and one heartbeat completes recovery.
    h.supervisor
        .handle_message(&session, r#"{"type":"ping","timestamp":1}"#)
        .await;
    assert_eq!(
        h.fallback.health_of("flaky-phone").unwrap().status,
        scribe::types::HealthStatus::Healthy
    );
}

/// The per-user session cap closes the oldest session on connect.
#[tokio::test]
async fn test_session_cap_closes_oldest() {
    let h = harness(SessionConfig {
        heartbeat_interval_ms: 10_000,
        heartbeat_timeout_ms: 20_000,
        auth_timeout_ms: 10_000,
        max_auth_attempts: 3,
        max_sessions_per_user: 1,
    });

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let session_a = h.supervisor.register(tx_a);
    let token_a = h.auth.issue_token(5, "first", 60_000);
    let auth_a = format!(r#"{{"type":"auth","token":"{}","timestamp":1}}"#, token_a);
    h.supervisor.handle_message(&session_a, &auth_a).await;

    let (tx_b, _rx_b) = mpsc::unbounded_channel();
    let session_b = h.supervisor.register(tx_b);
    let token_b = h.auth.issue_token(5, "second", 60_000);
    let auth_b = format!(r#"{{"type":"auth","token":"{}","timestamp":1}}"#, token_b);
    h.supervisor.handle_message(&session_b, &auth_b).await;

    let close = drain_until(&mut rx_a, "close", Duration::from_millis(200)).await;
    assert!(close.is_some(), "oldest session should be closed");
    assert_eq!(h.supervisor.session_count(), 1);
    assert!(session_b.is_authenticated());
}

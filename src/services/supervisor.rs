//! Connection supervisor: push-session lifecycle management.
//!
//! Owns the session table, the authentication deadline, heartbeat
//! supervision, sync routing, and user-scoped broadcast. The transport
//! handler only shuttles frames; every protocol decision lives here.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::ErrorCode;
use crate::services::{AuthService, FallbackManager, SyncCoordinator, TokenVerifier};
use crate::types::{
    ClientEnvelope, ServerEnvelope, CLOSE_AUTH_FAILED, CLOSE_AUTH_TIMEOUT,
    CLOSE_HEARTBEAT_TIMEOUT, PROTOCOL_VERSION,
};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Authenticated,
    Disconnected,
}

/// A live push session.
pub struct Session {
    pub connection_id: Uuid,
    /// 0 until authenticated.
    pub user_id: AtomicI64,
    pub client_id: Mutex<String>,
    pub state: Mutex<SessionState>,
    pub connected_at: i64,
    pub last_heartbeat_at: AtomicI64,
    pub missed_heartbeats: AtomicU32,
    auth_attempts: AtomicU32,
    tx: mpsc::UnboundedSender<String>,
    /// Signalled when the supervisor wants the transport closed.
    pub closed: Notify,
    auth_deadline: Mutex<Option<JoinHandle<()>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    fn send_envelope(&self, envelope: &ServerEnvelope) -> bool {
        match serde_json::to_string(envelope) {
            Ok(json) => self.tx.send(json).is_ok(),
            Err(e) => {
                warn!("Failed to serialize envelope: {}", e);
                false
            }
        }
    }

    /// Whether this session has completed authentication.
    pub fn is_authenticated(&self) -> bool {
        *self.state.lock().unwrap() == SessionState::Authenticated
    }

    fn touch(&self) {
        self.last_heartbeat_at
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.missed_heartbeats.store(0, Ordering::Relaxed);
    }
}

/// Supervises all push sessions for the server.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    config: SessionConfig,
    server_id: String,
    auth: Arc<AuthService>,
    coordinator: Arc<SyncCoordinator>,
    fallback: Arc<FallbackManager>,
    sessions: Arc<DashMap<Uuid, Arc<Session>>>,
    /// userId -> live session ids.
    user_sessions: Arc<DashMap<i64, HashSet<Uuid>>>,
    shut_down: Arc<AtomicBool>,
}

impl ConnectionSupervisor {
    /// Create a new supervisor.
    pub fn new(
        config: SessionConfig,
        server_id: String,
        auth: Arc<AuthService>,
        coordinator: Arc<SyncCoordinator>,
        fallback: Arc<FallbackManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            server_id,
            auth,
            coordinator,
            fallback,
            sessions: Arc::new(DashMap::new()),
            user_sessions: Arc::new(DashMap::new()),
            shut_down: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Register a new inbound connection: allocate the id, store the
    /// session, send the handshake, and arm the authentication deadline.
    pub fn register(&self, tx: mpsc::UnboundedSender<String>) -> Arc<Session> {
        let now = chrono::Utc::now().timestamp_millis();
        let session = Arc::new(Session {
            connection_id: Uuid::new_v4(),
            user_id: AtomicI64::new(0),
            client_id: Mutex::new(String::new()),
            state: Mutex::new(SessionState::Connected),
            connected_at: now,
            last_heartbeat_at: AtomicI64::new(now),
            missed_heartbeats: AtomicU32::new(0),
            auth_attempts: AtomicU32::new(0),
            tx,
            closed: Notify::new(),
            auth_deadline: Mutex::new(None),
            heartbeat_task: Mutex::new(None),
        });
        self.sessions
            .insert(session.connection_id, session.clone());
        info!("Push session {} connected", session.connection_id);

        session.send_envelope(&ServerEnvelope::Handshake {
            server_id: self.server_id.clone(),
            protocol_version: PROTOCOL_VERSION,
            connection_id: session.connection_id.to_string(),
            timestamp: now,
        });

        // Arm the auth deadline; it is aborted the moment auth verifies.
        let supervisor = self.clone();
        let session_for_deadline = session.clone();
        let deadline = Duration::from_millis(self.config.auth_timeout_ms);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if !session_for_deadline.is_authenticated() {
                info!(
                    "Session {} missed the auth deadline",
                    session_for_deadline.connection_id
                );
                supervisor.close_session(
                    &session_for_deadline,
                    CLOSE_AUTH_TIMEOUT,
                    "auth-timeout",
                );
            }
        });
        *session.auth_deadline.lock().unwrap() = Some(handle);

        session
    }

    /// Handle one inbound frame. Unknown message types get an error
    /// envelope; the session survives.
    pub async fn handle_message(&self, session: &Arc<Session>, text: &str) {
        session.touch();

        let envelope: ClientEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(
                    "Session {} sent an unparseable message: {}",
                    session.connection_id, e
                );
                session.send_envelope(&ServerEnvelope::Error {
                    error_code: ErrorCode::ProtocolMismatch,
                    error_message: format!("unrecognized message: {}", e),
                    details: None,
                    timestamp: chrono::Utc::now().timestamp_millis(),
                });
                return;
            }
        };

        match envelope {
            ClientEnvelope::Auth { token, .. } => self.handle_auth(session, &token),
            ClientEnvelope::Ping { timestamp } => {
                session.send_envelope(&ServerEnvelope::Pong { timestamp });
                self.note_heartbeat(session);
            }
            ClientEnvelope::Pong { .. } => {
                self.note_heartbeat(session);
            }
            ClientEnvelope::Sync { data, .. } => {
                if !session.is_authenticated() {
                    session.send_envelope(&ServerEnvelope::Error {
                        error_code: ErrorCode::AuthFailed,
                        error_message: "sync before authentication".to_string(),
                        details: None,
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    });
                    return;
                }

                let user_id = session.user_id.load(Ordering::Relaxed);
                let client_id = session.client_id.lock().unwrap().clone();
                let request_id = data.request_id.clone();
                let started = std::time::Instant::now();

                match self.coordinator.process_request(user_id, data).await {
                    Ok(response) => {
                        self.fallback.record_response_time(
                            &client_id,
                            user_id,
                            started.elapsed().as_millis() as u64,
                        );
                        session.send_envelope(&ServerEnvelope::SyncResponse {
                            request_id,
                            data: Box::new(response),
                            timestamp: chrono::Utc::now().timestamp_millis(),
                        });
                    }
                    Err(e) => {
                        session.send_envelope(&ServerEnvelope::Error {
                            error_code: e.code(),
                            error_message: e.to_string(),
                            details: None,
                            timestamp: chrono::Utc::now().timestamp_millis(),
                        });
                    }
                }
            }
        }
    }

    fn note_heartbeat(&self, session: &Arc<Session>) {
        if session.is_authenticated() {
            let client_id = session.client_id.lock().unwrap().clone();
            self.fallback.note_heartbeat(&client_id);
        }
    }

    fn handle_auth(&self, session: &Arc<Session>, token: &str) {
        let now = chrono::Utc::now().timestamp_millis();
        match self.auth.verify(token) {
            Ok(claims) => {
                session.user_id.store(claims.user_id, Ordering::Relaxed);
                *session.client_id.lock().unwrap() = claims.client_id.clone();
                *session.state.lock().unwrap() = SessionState::Authenticated;

                if let Some(handle) = session.auth_deadline.lock().unwrap().take() {
                    handle.abort();
                }

                self.user_sessions
                    .entry(claims.user_id)
                    .or_default()
                    .insert(session.connection_id);
                self.enforce_session_cap(claims.user_id, session.connection_id);
                self.start_heartbeat(session);

                info!(
                    "Session {} authenticated as user {} ({})",
                    session.connection_id, claims.user_id, claims.client_id
                );
                session.send_envelope(&ServerEnvelope::Auth {
                    success: true,
                    user_id: Some(claims.user_id),
                    error: None,
                    timestamp: now,
                });

                self.fallback
                    .record_connection(&claims.client_id, claims.user_id);
            }
            Err(e) => {
                let attempts = session.auth_attempts.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "Session {} auth attempt {} failed: {}",
                    session.connection_id, attempts, e
                );
                session.send_envelope(&ServerEnvelope::Auth {
                    success: false,
                    user_id: None,
                    error: Some(e.to_string()),
                    timestamp: now,
                });
                if attempts >= self.config.max_auth_attempts {
                    self.close_session(session, CLOSE_AUTH_FAILED, "auth-failed");
                }
            }
        }
    }

    /// Close the oldest session when a user exceeds the configured cap.
    fn enforce_session_cap(&self, user_id: i64, newest: Uuid) {
        if self.config.max_sessions_per_user == 0 {
            return;
        }
        let session_ids: Vec<Uuid> = self
            .user_sessions
            .get(&user_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        if session_ids.len() <= self.config.max_sessions_per_user {
            return;
        }

        let oldest = session_ids
            .iter()
            .filter(|id| **id != newest)
            .filter_map(|id| self.sessions.get(id).map(|s| (*id, s.connected_at)))
            .min_by_key(|(_, connected_at)| *connected_at);

        if let Some((oldest_id, _)) = oldest {
            if let Some(session) = self.sessions.get(&oldest_id).map(|s| s.clone()) {
                info!(
                    "User {} exceeded session cap; closing oldest session {}",
                    user_id, oldest_id
                );
                self.close_session(&session, CLOSE_AUTH_TIMEOUT, "session-cap");
            }
        }
    }

    /// Schedule heartbeat pings and the silence watchdog for a session.
    /// A re-authentication replaces the running task.
    fn start_heartbeat(&self, session: &Arc<Session>) {
        if let Some(old) = session.heartbeat_task.lock().unwrap().take() {
            old.abort();
        }
        let supervisor = self.clone();
        let task_session = session.clone();
        let interval_ms = self.config.heartbeat_interval_ms;
        let timeout_ms = self.config.heartbeat_timeout_ms as i64;

        let handle = tokio::spawn(async move {
            let session = task_session;
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;

                let last = session.last_heartbeat_at.load(Ordering::Relaxed);
                let now = chrono::Utc::now().timestamp_millis();
                if now - last > timeout_ms {
                    info!(
                        "Session {} heartbeat timed out ({} ms silent)",
                        session.connection_id,
                        now - last
                    );
                    supervisor.close_session(
                        &session,
                        CLOSE_HEARTBEAT_TIMEOUT,
                        "heartbeat-timeout",
                    );
                    break;
                }

                session.missed_heartbeats.fetch_add(1, Ordering::Relaxed);
                if !session.send_envelope(&ServerEnvelope::Ping { timestamp: now }) {
                    supervisor.handle_disconnect(&session, "transport-error");
                    break;
                }
            }
        });
        *session.heartbeat_task.lock().unwrap() = Some(handle);
    }

    /// Send a close envelope, tear the session down, and report the
    /// disconnection to the fallback manager.
    pub fn close_session(&self, session: &Arc<Session>, code: u16, reason: &str) {
        session.send_envelope(&ServerEnvelope::Close {
            reason: reason.to_string(),
            code,
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
        self.handle_disconnect(session, reason);
    }

    /// Bookkeeping for a session that is gone (or about to be).
    pub fn handle_disconnect(&self, session: &Arc<Session>, reason: &str) {
        let was_authenticated = {
            let mut state = session.state.lock().unwrap();
            if *state == SessionState::Disconnected {
                return;
            }
            let was_authenticated = *state == SessionState::Authenticated;
            *state = SessionState::Disconnected;
            was_authenticated
        };

        if was_authenticated {
            let user_id = session.user_id.load(Ordering::Relaxed);
            let client_id = session.client_id.lock().unwrap().clone();
            self.fallback
                .record_disconnection(&client_id, user_id, reason);
            if let Some(mut set) = self.user_sessions.get_mut(&user_id) {
                set.remove(&session.connection_id);
            }
        }

        if let Some(handle) = session.auth_deadline.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = session.heartbeat_task.lock().unwrap().take() {
            handle.abort();
        }
        self.sessions.remove(&session.connection_id);
        session.closed.notify_waiters();
        info!(
            "Push session {} disconnected ({})",
            session.connection_id, reason
        );
    }

    /// Send a message to every authenticated session of a user.
    /// Best-effort: a failed send removes the offending session.
    pub fn broadcast_to_user(&self, user_id: i64, envelope: &ServerEnvelope) {
        let json = match serde_json::to_string(envelope) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize broadcast: {}", e);
                return;
            }
        };

        let session_ids: Vec<Uuid> = self
            .user_sessions
            .get(&user_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();

        for id in session_ids {
            if let Some(session) = self.sessions.get(&id).map(|s| s.clone()) {
                if session.tx.send(json.clone()).is_err() {
                    self.handle_disconnect(&session, "transport-error");
                }
            }
        }
    }

    /// Shut the supervisor down: cancel timers, close every session, and
    /// hand off to the fallback manager. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Supervisor shutting down {} sessions", self.sessions.len());
        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|s| s.clone()).collect();
        for session in sessions {
            self.close_session(&session, 1001, "server-shutdown");
        }
        self.fallback.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::services::{ConflictEngine, OperationQueue, SqliteStore};

    fn harness() -> (
        Arc<ConnectionSupervisor>,
        Arc<AuthService>,
        mpsc::UnboundedReceiver<String>,
        Arc<Session>,
    ) {
        let config = Config::from_env();
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let engine = ConflictEngine::new(store.clone(), config.policy, config.conflicts);
        let queue = Arc::new(OperationQueue::new(3, 1_000));
        let coordinator = SyncCoordinator::new(store, engine, queue, config.sync);
        let fallback = FallbackManager::new(config.health, config.polling, coordinator.clone());
        let auth = Arc::new(AuthService::new(Some("test-secret".to_string())));
        let supervisor = ConnectionSupervisor::new(
            config.session,
            "scribe-test".to_string(),
            auth.clone(),
            coordinator,
            fallback,
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let session = supervisor.register(tx);
        (supervisor, auth, rx, session)
    }

    fn envelope_type(json: &str) -> String {
        serde_json::from_str::<serde_json::Value>(json)
            .ok()
            .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(String::from))
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_register_sends_handshake() {
        let (_supervisor, _auth, mut rx, session) = harness();
        let first = rx.recv().await.unwrap();
        assert_eq!(envelope_type(&first), "handshake");
        assert!(first.contains(&session.connection_id.to_string()));
    }

    #[tokio::test]
    async fn test_successful_auth_flow() {
        let (supervisor, auth, mut rx, session) = harness();
        rx.recv().await.unwrap(); // handshake

        let token = auth.issue_token(7, "web-1", 60_000);
        let message = format!(r#"{{"type":"auth","token":"{}","timestamp":1}}"#, token);
        supervisor.handle_message(&session, &message).await;

        let reply = rx.recv().await.unwrap();
        assert_eq!(envelope_type(&reply), "auth");
        assert!(reply.contains("\"success\":true"));
        assert!(session.is_authenticated());
        assert_eq!(session.user_id.load(Ordering::Relaxed), 7);
    }

    #[tokio::test]
    async fn test_repeated_auth_failures_close_session() {
        let (supervisor, _auth, mut rx, session) = harness();
        rx.recv().await.unwrap(); // handshake

        for _ in 0..3 {
            supervisor
                .handle_message(&session, r#"{"type":"auth","token":"bogus","timestamp":1}"#)
                .await;
        }

        let mut saw_close = false;
        while let Ok(frame) = rx.try_recv() {
            if envelope_type(&frame) == "close" {
                assert!(frame.contains("auth-failed"));
                assert!(frame.contains(&CLOSE_AUTH_FAILED.to_string()));
                saw_close = true;
            }
        }
        assert!(saw_close);
        assert_eq!(supervisor.session_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_message_type_fails_loudly_but_keeps_session() {
        let (supervisor, _auth, mut rx, session) = harness();
        rx.recv().await.unwrap(); // handshake

        supervisor
            .handle_message(&session, r#"{"type":"warp","timestamp":1}"#)
            .await;

        let reply = rx.recv().await.unwrap();
        assert_eq!(envelope_type(&reply), "error");
        assert_eq!(supervisor.session_count(), 1);
    }

    #[tokio::test]
    async fn test_ping_answers_pong() {
        let (supervisor, _auth, mut rx, session) = harness();
        rx.recv().await.unwrap(); // handshake

        supervisor
            .handle_message(&session, r#"{"type":"ping","timestamp":42}"#)
            .await;

        let reply = rx.recv().await.unwrap();
        assert_eq!(envelope_type(&reply), "pong");
        assert!(reply.contains("42"));
    }

    #[tokio::test]
    async fn test_sync_before_auth_rejected() {
        let (supervisor, _auth, mut rx, session) = harness();
        rx.recv().await.unwrap(); // handshake

        let message = r#"{"type":"sync","data":{"requestId":"r1","clientId":"c1","protocolVersion":1,"operations":[]},"timestamp":1}"#;
        supervisor.handle_message(&session, message).await;

        let reply = rx.recv().await.unwrap();
        assert_eq!(envelope_type(&reply), "error");
        assert!(reply.contains("auth-failed"));
    }

    #[tokio::test]
    async fn test_sync_round_trip_over_session() {
        let (supervisor, auth, mut rx, session) = harness();
        rx.recv().await.unwrap(); // handshake

        let token = auth.issue_token(7, "web-1", 60_000);
        let message = format!(r#"{{"type":"auth","token":"{}","timestamp":1}}"#, token);
        supervisor.handle_message(&session, &message).await;
        rx.recv().await.unwrap(); // auth reply

        let sync = r#"{"type":"sync","data":{"requestId":"req-9","clientId":"web-1","protocolVersion":1,"operations":[{"operationId":"op1","kind":"create","entityKind":"note","payload":{"title":"Hi","content":""},"clientTimestamp":1}]},"timestamp":1}"#;
        supervisor.handle_message(&session, sync).await;

        let reply = rx.recv().await.unwrap();
        assert_eq!(envelope_type(&reply), "sync_response");
        assert!(reply.contains("req-9"));
        assert!(reply.contains("\"success\":true"));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_user_sessions() {
        let (supervisor, auth, mut rx_a, session_a) = harness();
        rx_a.recv().await.unwrap(); // handshake

        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let session_b = supervisor.register(tx_b);
        rx_b.recv().await.unwrap(); // handshake

        let token = auth.issue_token(7, "web-1", 60_000);
        let auth_a = format!(r#"{{"type":"auth","token":"{}","timestamp":1}}"#, token);
        supervisor.handle_message(&session_a, &auth_a).await;
        rx_a.recv().await.unwrap();
        let token_b = auth.issue_token(7, "mobile-1", 60_000);
        let auth_b = format!(r#"{{"type":"auth","token":"{}","timestamp":1}}"#, token_b);
        supervisor.handle_message(&session_b, &auth_b).await;
        rx_b.recv().await.unwrap();

        supervisor.broadcast_to_user(
            7,
            &ServerEnvelope::Ping {
                timestamp: 1_234_567,
            },
        );

        assert!(rx_a.recv().await.unwrap().contains("1234567"));
        assert!(rx_b.recv().await.unwrap().contains("1234567"));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (supervisor, _auth, _rx, _session) = harness();
        supervisor.shutdown();
        supervisor.shutdown();
        assert_eq!(supervisor.session_count(), 0);
    }
}

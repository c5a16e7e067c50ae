//! Scribe - multi-client synchronization server for notes, folders, and
//! periodic reviews.
//!
//! Clients hold local replicas; the server is the authoritative store and
//! reconciles concurrent edits. Two cooperating halves: a bidirectional
//! sync protocol over a heartbeat-supervised push channel (with graceful
//! degradation to periodic pull), and a version-aware conflict engine that
//! classifies divergent updates and applies deterministic resolutions.

pub mod api;
pub mod config;
pub mod error;
pub mod services;
pub mod types;
pub mod websocket;

use std::sync::Arc;

use config::Config;
use services::{
    AuthService, ConflictEngine, ConnectionSupervisor, FallbackManager, OperationQueue,
    SqliteStore, SyncCoordinator,
};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<SqliteStore>,
    pub auth: Arc<AuthService>,
    pub engine: Arc<ConflictEngine>,
    pub queue: Arc<OperationQueue>,
    pub coordinator: Arc<SyncCoordinator>,
    pub fallback: Arc<FallbackManager>,
    pub supervisor: Arc<ConnectionSupervisor>,
}

impl AppState {
    /// Wire the full service graph over the given store.
    pub fn build(config: Arc<Config>, store: Arc<SqliteStore>) -> Self {
        let auth = Arc::new(AuthService::new(config.auth_secret.clone()));
        let engine = ConflictEngine::new(
            store.clone(),
            config.policy.clone(),
            config.conflicts.clone(),
        );
        let queue = Arc::new(OperationQueue::new(
            config.sync.max_retries,
            config.sync.retry_delay_ms,
        ));
        let coordinator = SyncCoordinator::new(
            store.clone(),
            engine.clone(),
            queue.clone(),
            config.sync.clone(),
        );
        let fallback = FallbackManager::new(
            config.health.clone(),
            config.polling.clone(),
            coordinator.clone(),
        );
        let supervisor = ConnectionSupervisor::new(
            config.session.clone(),
            config.server_id.clone(),
            auth.clone(),
            coordinator.clone(),
            fallback.clone(),
        );

        Self {
            config,
            store,
            auth,
            engine,
            queue,
            coordinator,
            fallback,
            supervisor,
        }
    }
}

// Re-export commonly used types
pub use error::{AppError, ErrorCode, Result};
pub use types::*;

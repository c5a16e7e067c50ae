use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scribe::config::Config;
use scribe::services::{ConnectionSupervisor, SqliteStore, SyncEvent};
use scribe::types::{ServerEnvelope, UpdateData, UpdateKind};
use scribe::{api, websocket, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scribe=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Arc::new(Config::from_env());
    info!("Starting scribe server on {}:{}", config.host, config.port);

    let store = Arc::new(SqliteStore::new(&config.db_path)?);
    info!("SQLite database initialized at {}", config.db_path);

    let state = AppState::build(config.clone(), store);

    // Start the conflict registry retention sweeper
    state.engine.clone().start();

    // Fan coordinator events out to push sessions
    {
        let supervisor = state.supervisor.clone();
        let events = state.coordinator.subscribe();
        tokio::spawn(async move {
            forward_events(supervisor, events).await;
        });
    }

    // Drive queued operations on a timer
    {
        let coordinator = state.coordinator.clone();
        let queue = state.queue.clone();
        let pass_interval = config.sync.retry_delay_ms.max(250);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(pass_interval));
            loop {
                interval.tick().await;
                for user_id in queue.users_with_pending() {
                    let (processed, succeeded) = coordinator.process_queue(user_id);
                    if processed > 0 {
                        info!(
                            "Queue pass for user {}: {}/{} succeeded",
                            user_id, succeeded, processed
                        );
                    }
                }
            }
        });
    }

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build the router
    let app = Router::new()
        .merge(api::router())
        .route("/ws", get(websocket::ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    // Start the server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Scribe server listening on {}", addr);

    let supervisor = state.supervisor.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            supervisor.shutdown();
        })
        .await?;

    Ok(())
}

/// Relay coordinator events to every push session of the affected user.
async fn forward_events(
    supervisor: Arc<ConnectionSupervisor>,
    mut events: tokio::sync::broadcast::Receiver<SyncEvent>,
) {
    loop {
        match events.recv().await {
            Ok(SyncEvent::EntityChanged {
                user_id, update, ..
            }) => {
                let envelope = ServerEnvelope::ServerUpdate {
                    entity_kind: update.entity_kind,
                    entity_id: Some(update.entity_id),
                    update_kind: UpdateKind::Incremental,
                    update_data: UpdateData {
                        operation_kind: update.operation_kind,
                        version: update.version,
                        payload: update.payload,
                        modified_at: update.modified_at,
                        modified_by: update.modified_by,
                    },
                    timestamp: chrono::Utc::now().timestamp_millis(),
                };
                supervisor.broadcast_to_user(user_id, &envelope);
            }
            Ok(SyncEvent::ConflictDetected {
                user_id,
                conflict,
                requires_manual,
            }) => {
                let envelope = ServerEnvelope::Conflict {
                    conflict,
                    requires_manual_resolution: requires_manual,
                    timestamp: chrono::Utc::now().timestamp_millis(),
                };
                supervisor.broadcast_to_user(user_id, &envelope);
            }
            Ok(SyncEvent::StatusChanged {
                user_id,
                sync_id,
                old_status,
                new_status,
                progress,
            }) => {
                let envelope = ServerEnvelope::StatusChange {
                    sync_id,
                    old_status,
                    new_status,
                    progress: Some(progress),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                };
                supervisor.broadcast_to_user(user_id, &envelope);
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!("Event relay lagged by {} messages", n);
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                info!("Coordinator event channel closed");
                break;
            }
        }
    }
}

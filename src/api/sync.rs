//! Sync HTTP surface: batch sync, pull-mode polling, job control, queue
//! administration, conflict management, and fallback controls.

use axum::{
    extract::{Path, Query, State},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::auth::AuthedUser;
use crate::error::{AppError, Result};
use crate::services::diff_fields;
use crate::types::{
    ConflictRecord, ConflictStats, ConflictStatus, EntityKind, PullPriority, QueueStats,
    QueuedOperation, ResolutionStrategy, ServerUpdate, SyncJob, SyncOperation, SyncRequest,
    SyncResponse,
};
use crate::AppState;

/// Create the sync router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sync", post(submit_sync))
        .route("/poll", post(poll))
        .route("/status", get(sync_status))
        .route("/cancel", post(cancel_sync))
        .route("/retry", post(retry_sync))
        .route("/queue", get(list_queue).post(enqueue_operation).delete(clear_queue))
        .route("/queue/process", post(process_queue))
        .route("/queue/status", get(queue_status))
        .route("/queue/stats", get(queue_stats))
        .route("/queue/:op_id", delete(remove_queued))
        .route("/conflicts", get(list_conflicts))
        .route("/conflicts/stats", get(conflict_stats))
        .route("/conflicts/resolve", post(batch_resolve))
        .route("/conflicts/:id", get(conflict_detail))
        .route("/conflicts/:id/resolve", post(resolve_conflict))
        .route("/conflicts/:id/ignore", post(ignore_conflict))
        .route("/data-diff", post(data_diff))
        .route("/fallback-status", get(fallback_status))
        .route("/force-fallback", post(force_fallback))
        .route("/exit-fallback", post(exit_fallback))
}

// =============================================================================
// Sync + poll
// =============================================================================

/// Submit a batch sync request.
async fn submit_sync(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(request): Json<SyncRequest>,
) -> Result<Json<SyncResponse>> {
    let response = state.coordinator.process_request(user.user_id, request).await?;
    Ok(Json(response))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollRequest {
    #[serde(default)]
    since: Option<i64>,
    #[serde(default)]
    entity_kinds: Option<Vec<EntityKind>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PollResponse {
    success: bool,
    updates: Vec<ServerUpdate>,
    has_more: bool,
    server_time: i64,
    suggested_interval_ms: u64,
}

/// Pull-mode incremental fetch.
async fn poll(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(request): Json<PollRequest>,
) -> Result<Json<PollResponse>> {
    let since = request.since.unwrap_or(0);
    let (updates, has_more) = state
        .coordinator
        .poll(user.user_id, since, request.entity_kinds.as_deref())?;

    Ok(Json(PollResponse {
        success: true,
        updates,
        has_more,
        server_time: chrono::Utc::now().timestamp_millis(),
        suggested_interval_ms: state.fallback.suggested_interval(&user.client_id),
    }))
}

// =============================================================================
// Job control
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncJobView {
    #[serde(flatten)]
    job: SyncJob,
    progress: u8,
}

impl From<SyncJob> for SyncJobView {
    fn from(job: SyncJob) -> Self {
        let progress = job.progress();
        Self { job, progress }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery {
    sync_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    success: bool,
    syncs: Vec<SyncJobView>,
}

/// Active and recent sync jobs for the caller.
async fn sync_status(
    State(state): State<AppState>,
    user: AuthedUser,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>> {
    let syncs = match query.sync_id {
        Some(sync_id) => {
            let job = state
                .coordinator
                .get_job(user.user_id, &sync_id)
                .ok_or_else(|| AppError::NotFound(format!("sync job {}", sync_id)))?;
            vec![job.into()]
        }
        None => state
            .coordinator
            .jobs_for(user.user_id)
            .into_iter()
            .map(SyncJobView::from)
            .collect(),
    };
    Ok(Json(StatusResponse { success: true, syncs }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncIdRequest {
    sync_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelResponse {
    success: bool,
    sync: SyncJobView,
}

/// Cancel an in-flight sync job.
async fn cancel_sync(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(request): Json<SyncIdRequest>,
) -> Result<Json<CancelResponse>> {
    let job = state.coordinator.cancel_sync(user.user_id, &request.sync_id)?;
    Ok(Json(CancelResponse {
        success: true,
        sync: job.into(),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RetryResponse {
    success: bool,
    requeued: usize,
}

/// Requeue a job's failed operations.
async fn retry_sync(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(request): Json<SyncIdRequest>,
) -> Result<Json<RetryResponse>> {
    let requeued = state.coordinator.retry(user.user_id, &request.sync_id)?;
    Ok(Json(RetryResponse {
        success: true,
        requeued,
    }))
}

// =============================================================================
// Queue administration
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueListResponse {
    success: bool,
    operations: Vec<QueuedOperation>,
}

async fn list_queue(
    State(state): State<AppState>,
    user: AuthedUser,
) -> Json<QueueListResponse> {
    Json(QueueListResponse {
        success: true,
        operations: state.queue.list(user.user_id),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueRequest {
    operation: SyncOperation,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueResponse {
    success: bool,
    operation: QueuedOperation,
}

async fn enqueue_operation(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(request): Json<EnqueueRequest>,
) -> Json<EnqueueResponse> {
    let item = state
        .queue
        .enqueue(user.user_id, &user.client_id, request.operation);
    Json(EnqueueResponse {
        success: true,
        operation: item,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueMutationResponse {
    success: bool,
    affected: usize,
}

async fn clear_queue(
    State(state): State<AppState>,
    user: AuthedUser,
) -> Json<QueueMutationResponse> {
    let affected = state.queue.cancel_all(user.user_id);
    Json(QueueMutationResponse {
        success: true,
        affected,
    })
}

async fn remove_queued(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(op_id): Path<String>,
) -> Result<Json<QueueMutationResponse>> {
    if !state.queue.cancel(user.user_id, &op_id) {
        return Err(AppError::NotFound(format!("queued operation {}", op_id)));
    }
    Ok(Json(QueueMutationResponse {
        success: true,
        affected: 1,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProcessQueueResponse {
    success: bool,
    processed: usize,
    succeeded: usize,
}

async fn process_queue(
    State(state): State<AppState>,
    user: AuthedUser,
) -> Json<ProcessQueueResponse> {
    let (processed, succeeded) = state.coordinator.process_queue(user.user_id);
    Json(ProcessQueueResponse {
        success: true,
        processed,
        succeeded,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueStatusResponse {
    success: bool,
    stats: QueueStats,
    pending: Vec<QueuedOperation>,
}

async fn queue_status(
    State(state): State<AppState>,
    user: AuthedUser,
) -> Json<QueueStatusResponse> {
    let pending = state
        .queue
        .list(user.user_id)
        .into_iter()
        .filter(|op| op.status == crate::types::QueuedOperationStatus::Pending)
        .collect();
    Json(QueueStatusResponse {
        success: true,
        stats: state.queue.stats(user.user_id),
        pending,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueStatsResponse {
    success: bool,
    stats: QueueStats,
}

async fn queue_stats(State(state): State<AppState>, user: AuthedUser) -> Json<QueueStatsResponse> {
    Json(QueueStatsResponse {
        success: true,
        stats: state.queue.stats(user.user_id),
    })
}

// =============================================================================
// Conflicts
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConflictListQuery {
    status: Option<String>,
    limit: Option<usize>,
    page: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConflictListResponse {
    success: bool,
    conflicts: Vec<ConflictRecord>,
}

async fn list_conflicts(
    State(state): State<AppState>,
    user: AuthedUser,
    Query(query): Query<ConflictListQuery>,
) -> Result<Json<ConflictListResponse>> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some("unresolved") => Some(ConflictStatus::Unresolved),
        Some("resolved") => Some(ConflictStatus::Resolved),
        Some("ignored") => Some(ConflictStatus::Ignored),
        Some(other) => {
            return Err(AppError::BadRequest(format!(
                "unknown conflict status '{}'",
                other
            )))
        }
    };
    let limit = query.limit.unwrap_or(50).min(500);
    let offset = query.page.unwrap_or(0) * limit;

    Ok(Json(ConflictListResponse {
        success: true,
        conflicts: state.engine.list(user.user_id, status, limit, offset),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConflictDetailResponse {
    success: bool,
    conflict: ConflictRecord,
}

async fn conflict_detail(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(conflict_id): Path<String>,
) -> Result<Json<ConflictDetailResponse>> {
    let conflict = state
        .engine
        .lookup(user.user_id, &conflict_id)
        .ok_or_else(|| AppError::NotFound(format!("conflict {}", conflict_id)))?;
    Ok(Json(ConflictDetailResponse {
        success: true,
        conflict,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveRequest {
    strategy: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResolveResponse {
    success: bool,
    conflict: ConflictRecord,
    resolved_payload: Map<String, Value>,
    new_version: i64,
}

/// Apply an explicit resolution to a conflict and persist the outcome.
async fn resolve_conflict(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(conflict_id): Path<String>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<ResolveResponse>> {
    let strategy = ResolutionStrategy::parse(&request.strategy).ok_or_else(|| {
        AppError::BadRequest(format!("unknown resolution strategy '{}'", request.strategy))
    })?;

    let conflict = state
        .engine
        .lookup(user.user_id, &conflict_id)
        .ok_or_else(|| AppError::NotFound(format!("conflict {}", conflict_id)))?;

    let outcome = state.engine.resolve(&conflict, strategy);
    if !outcome.success {
        if outcome.manual_required {
            return Err(AppError::ConflictUnresolved(
                "manual-required: submit a concrete strategy".to_string(),
            ));
        }
        return Err(AppError::BadRequest(format!(
            "strategy {:?} cannot resolve this conflict",
            strategy
        )));
    }

    let resolved_payload = outcome.resolved_payload.clone().unwrap_or_default();
    if outcome.new_version > conflict.server.version {
        state.store.apply_resolved(
            user.user_id,
            conflict.entity_kind,
            conflict.entity_id,
            resolved_payload.clone(),
            outcome.new_version,
            &user.client_id,
        )?;
    }
    let conflict = state.engine.mark_resolved(
        user.user_id,
        &conflict_id,
        strategy,
        resolved_payload.clone(),
    )?;

    Ok(Json(ResolveResponse {
        success: true,
        conflict,
        resolved_payload,
        new_version: outcome.new_version,
    }))
}

async fn ignore_conflict(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(conflict_id): Path<String>,
) -> Result<Json<ConflictDetailResponse>> {
    let conflict = state.engine.mark_ignored(user.user_id, &conflict_id)?;
    Ok(Json(ConflictDetailResponse {
        success: true,
        conflict,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchResolveRequest {
    conflict_ids: Vec<String>,
    strategy: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchResolveItem {
    conflict_id: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchResolveResponse {
    success: bool,
    results: Vec<BatchResolveItem>,
}

/// Resolve several conflicts with one strategy; per-conflict failures do
/// not abort the batch.
async fn batch_resolve(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(request): Json<BatchResolveRequest>,
) -> Result<Json<BatchResolveResponse>> {
    let strategy = ResolutionStrategy::parse(&request.strategy).ok_or_else(|| {
        AppError::BadRequest(format!("unknown resolution strategy '{}'", request.strategy))
    })?;

    let mut results = Vec::with_capacity(request.conflict_ids.len());
    for conflict_id in &request.conflict_ids {
        let item = match state.engine.lookup(user.user_id, conflict_id) {
            None => BatchResolveItem {
                conflict_id: conflict_id.clone(),
                success: false,
                error: Some("not found".to_string()),
            },
            Some(conflict) => {
                let outcome = state.engine.resolve(&conflict, strategy);
                if outcome.success {
                    let payload = outcome.resolved_payload.clone().unwrap_or_default();
                    let persisted = if outcome.new_version > conflict.server.version {
                        state
                            .store
                            .apply_resolved(
                                user.user_id,
                                conflict.entity_kind,
                                conflict.entity_id,
                                payload.clone(),
                                outcome.new_version,
                                &user.client_id,
                            )
                            .map(|_| ())
                    } else {
                        Ok(())
                    };
                    match persisted.and_then(|_| {
                        state
                            .engine
                            .mark_resolved(user.user_id, conflict_id, strategy, payload)
                    }) {
                        Ok(_) => BatchResolveItem {
                            conflict_id: conflict_id.clone(),
                            success: true,
                            error: None,
                        },
                        Err(e) => BatchResolveItem {
                            conflict_id: conflict_id.clone(),
                            success: false,
                            error: Some(e.to_string()),
                        },
                    }
                } else {
                    BatchResolveItem {
                        conflict_id: conflict_id.clone(),
                        success: false,
                        error: Some("manual-required".to_string()),
                    }
                }
            }
        };
        results.push(item);
    }

    Ok(Json(BatchResolveResponse {
        success: true,
        results,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConflictStatsResponse {
    success: bool,
    stats: ConflictStats,
}

async fn conflict_stats(
    State(state): State<AppState>,
    user: AuthedUser,
) -> Json<ConflictStatsResponse> {
    Json(ConflictStatsResponse {
        success: true,
        stats: state.engine.stats(user.user_id),
    })
}

// =============================================================================
// Data diff
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataDiffRequest {
    entity_kind: EntityKind,
    entity_id: i64,
    payload: Map<String, Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DataDiffResponse {
    success: bool,
    entity_id: i64,
    server_version: i64,
    deleted: bool,
    conflict_fields: Vec<String>,
    server_payload: Map<String, Value>,
}

/// Field-level diff between a supplied client copy and the server record.
async fn data_diff(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(request): Json<DataDiffRequest>,
) -> Result<Json<DataDiffResponse>> {
    let entity = state
        .store
        .get(user.user_id, request.entity_kind, request.entity_id)?
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "{} {}",
                request.entity_kind.table_name(),
                request.entity_id
            ))
        })?;

    let server_payload = entity.payload_json();
    Ok(Json(DataDiffResponse {
        success: true,
        entity_id: entity.id,
        server_version: entity.version,
        deleted: entity.is_deleted(),
        conflict_fields: diff_fields(&server_payload, &request.payload),
        server_payload,
    }))
}

// =============================================================================
// Fallback controls
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FallbackQuery {
    client_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FallbackStatusResponse {
    success: bool,
    client_id: String,
    in_fallback: bool,
    pull_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    health: Option<crate::types::ClientHealth>,
}

async fn fallback_status(
    State(state): State<AppState>,
    user: AuthedUser,
    Query(query): Query<FallbackQuery>,
) -> Json<FallbackStatusResponse> {
    let client_id = query.client_id.unwrap_or(user.client_id);
    Json(FallbackStatusResponse {
        success: true,
        in_fallback: state.fallback.needs_fallback(&client_id),
        pull_active: state.fallback.pull_active(&client_id),
        health: state.fallback.health_of(&client_id),
        client_id,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForceFallbackRequest {
    client_id: Option<String>,
    priority: Option<PullPriority>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FallbackMutationResponse {
    success: bool,
    client_id: String,
    in_fallback: bool,
}

async fn force_fallback(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(request): Json<ForceFallbackRequest>,
) -> Json<FallbackMutationResponse> {
    let client_id = request.client_id.unwrap_or(user.client_id);
    state.fallback.force_fallback(
        &client_id,
        user.user_id,
        request.priority.unwrap_or(PullPriority::Normal),
    );
    Json(FallbackMutationResponse {
        success: true,
        in_fallback: true,
        client_id,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExitFallbackRequest {
    client_id: Option<String>,
}

async fn exit_fallback(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(request): Json<ExitFallbackRequest>,
) -> Json<FallbackMutationResponse> {
    let client_id = request.client_id.unwrap_or(user.client_id);
    state.fallback.exit_fallback(&client_id);
    Json(FallbackMutationResponse {
        success: true,
        in_fallback: false,
        client_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_response_serialization() {
        let response = PollResponse {
            success: true,
            updates: Vec::new(),
            has_more: false,
            server_time: 1_700_000_000_000,
            suggested_interval_ms: 5_000,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"hasMore\":false"));
        assert!(json.contains("\"suggestedIntervalMs\":5000"));
    }

    #[test]
    fn test_sync_job_view_flattens_progress() {
        let view = SyncJobView::from(SyncJob {
            sync_id: "s1".to_string(),
            user_id: 1,
            client_id: "c1".to_string(),
            status: crate::types::SyncJobStatus::Syncing,
            start_time: 0,
            end_time: None,
            total_operations: 4,
            completed_operations: 1,
            successful_operations: 1,
            failed_operations: 0,
            conflicts_detected: 0,
            conflicts_resolved: 0,
        });

        let json = serde_json::to_string(&view).unwrap();
        assert!(json.contains("\"syncId\":\"s1\""));
        assert!(json.contains("\"progress\":25"));
    }

    #[test]
    fn test_unknown_strategy_is_rejected_before_any_mutation() {
        assert!(ResolutionStrategy::parse("coin-flip").is_none());
    }
}

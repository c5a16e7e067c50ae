//! Sync coordinator: end-to-end processing of batch sync requests.
//!
//! Every operation is filtered through the conflict engine before it
//! touches the store. Per-operation failures never abort the batch; the
//! response reports each outcome in submission order.

use dashmap::DashMap;
use serde_json::Map;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{AppError, ErrorCode, Result};
use crate::services::{ConflictEngine, OperationQueue, SqliteStore};
use crate::types::{
    ConflictRecord, ConflictStatus, Entity, EntityKind, NewClientState, OperationKind,
    OperationResult, ResolutionStrategy, ServerUpdate, SyncJob, SyncJobStatus, SyncOperation,
    SyncRequest, SyncResponse, PROTOCOL_VERSION,
};

/// Jobs kept per user in the recent-history ring.
const JOB_HISTORY_LIMIT: usize = 50;

/// Events other components (push sessions, fallback) subscribe to.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A sync job changed status.
    StatusChanged {
        user_id: i64,
        sync_id: String,
        old_status: SyncJobStatus,
        new_status: SyncJobStatus,
        progress: u8,
    },
    /// An entity changed server-side.
    EntityChanged {
        user_id: i64,
        origin_client: String,
        update: ServerUpdate,
    },
    /// A conflict was detected and remains unresolved.
    ConflictDetected {
        user_id: i64,
        conflict: Box<ConflictRecord>,
        requires_manual: bool,
    },
}

/// Coordinates sync requests across the engine, store, and queue.
pub struct SyncCoordinator {
    store: Arc<SqliteStore>,
    engine: Arc<ConflictEngine>,
    queue: Arc<OperationQueue>,
    config: SyncConfig,
    /// Jobs currently syncing.
    active_jobs: DashMap<String, SyncJob>,
    /// Cancellation flags per sync id, observed between operations.
    cancel_flags: DashMap<String, Arc<AtomicBool>>,
    /// Completed jobs, most recent last, bounded per user.
    job_history: DashMap<i64, VecDeque<SyncJob>>,
    /// Create idempotence: (user, operation id) -> created entity id.
    applied_creates: DashMap<(i64, String), i64>,
    /// Failed operations per sync id, kept for retry.
    failed_operations: DashMap<String, Vec<SyncOperation>>,
    events_tx: broadcast::Sender<SyncEvent>,
}

impl SyncCoordinator {
    /// Create a new coordinator.
    pub fn new(
        store: Arc<SqliteStore>,
        engine: Arc<ConflictEngine>,
        queue: Arc<OperationQueue>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            store,
            engine,
            queue,
            config,
            active_jobs: DashMap::new(),
            cancel_flags: DashMap::new(),
            job_history: DashMap::new(),
            applied_creates: DashMap::new(),
            failed_operations: DashMap::new(),
            events_tx,
        })
    }

    /// Subscribe to coordinator events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events_tx.subscribe()
    }

    // =========================================================================
    // Request processing
    // =========================================================================

    /// Process a batch sync request for an authenticated user.
    pub async fn process_request(&self, user_id: i64, request: SyncRequest) -> Result<SyncResponse> {
        if request.protocol_version != PROTOCOL_VERSION {
            return Err(AppError::ProtocolMismatch(format!(
                "server speaks protocol {}, client sent {}",
                PROTOCOL_VERSION, request.protocol_version
            )));
        }

        let sync_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut job = SyncJob {
            sync_id: sync_id.clone(),
            user_id,
            client_id: request.client_id.clone(),
            status: SyncJobStatus::Syncing,
            start_time: chrono::Utc::now().timestamp_millis(),
            end_time: None,
            total_operations: request.operations.len() as u32,
            completed_operations: 0,
            successful_operations: 0,
            failed_operations: 0,
            conflicts_detected: 0,
            conflicts_resolved: 0,
        };
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.cancel_flags.insert(sync_id.clone(), cancel_flag.clone());
        self.active_jobs.insert(sync_id.clone(), job.clone());

        info!(
            "Sync {} started: user {} client {} ({} ops)",
            sync_id,
            user_id,
            request.client_id,
            request.operations.len()
        );

        let mut results: Vec<OperationResult> = Vec::with_capacity(request.operations.len());
        let mut conflicts: Vec<ConflictRecord> = Vec::new();
        let mut failed_ops: Vec<SyncOperation> = Vec::new();
        let mut cancelled = false;
        let mut timed_out = false;

        for operation in &request.operations {
            if cancel_flag.load(Ordering::Relaxed) {
                cancelled = true;
                break;
            }
            if started.elapsed().as_millis() as u64 > self.config.sync_timeout_ms {
                warn!("Sync {} exceeded {} ms", sync_id, self.config.sync_timeout_ms);
                timed_out = true;
            }
            if timed_out {
                results.push(OperationResult {
                    operation_id: operation.operation_id.clone(),
                    success: false,
                    entity_kind: operation.entity_kind,
                    entity_id: operation.entity_id,
                    version: None,
                    payload: None,
                    conflict_id: None,
                    error: Some("sync job timed out".to_string()),
                    error_code: Some(ErrorCode::TimedOut),
                });
                job.completed_operations += 1;
                job.failed_operations += 1;
                failed_ops.push(operation.clone());
                continue;
            }

            let result = self.apply_operation(
                user_id,
                &request.client_id,
                operation,
                request.default_resolution_strategy,
                &mut job,
                &mut conflicts,
            );

            job.completed_operations += 1;
            if result.success {
                job.successful_operations += 1;
            } else {
                job.failed_operations += 1;
                failed_ops.push(operation.clone());
            }
            results.push(result);
            self.active_jobs.insert(sync_id.clone(), job.clone());
        }

        // Server-side changes the client has not yet seen.
        let since = request.client_state.last_sync_time;
        let (server_updates, _) = self.collect_updates(
            user_id,
            since,
            request.entity_kinds_wanted.as_deref(),
            self.config.default_batch_size,
        )?;

        let unresolved_remaining = conflicts.iter().any(|c| {
            self.engine
                .lookup(user_id, &c.conflict_id)
                .map(|latest| latest.status == ConflictStatus::Unresolved)
                .unwrap_or(false)
        });

        let final_status = if cancelled {
            SyncJobStatus::Cancelled
        } else if timed_out {
            SyncJobStatus::Failed
        } else if unresolved_remaining {
            SyncJobStatus::Conflict
        } else {
            SyncJobStatus::Success
        };

        let now = chrono::Utc::now().timestamp_millis();
        job.status = final_status;
        job.end_time = Some(now);
        if !failed_ops.is_empty() {
            self.failed_operations.insert(sync_id.clone(), failed_ops);
        }
        self.finish_job(&job);

        let _ = self.events_tx.send(SyncEvent::StatusChanged {
            user_id,
            sync_id: sync_id.clone(),
            old_status: SyncJobStatus::Syncing,
            new_status: final_status,
            progress: job.progress(),
        });

        info!(
            "Sync {} finished {:?}: {}/{} ok, {} conflicts ({} resolved)",
            sync_id,
            final_status,
            job.successful_operations,
            job.total_operations,
            job.conflicts_detected,
            job.conflicts_resolved
        );

        Ok(SyncResponse {
            request_id: request.request_id,
            server_time: now,
            status: final_status,
            operation_results: results,
            server_updates,
            conflicts,
            new_client_state: NewClientState {
                client_id: request.client_id,
                last_sync_time: now,
                last_sync_id: sync_id,
            },
        })
    }

    /// Dispatch a single operation through the engine and store.
    fn apply_operation(
        &self,
        user_id: i64,
        client_id: &str,
        operation: &SyncOperation,
        default_strategy: Option<ResolutionStrategy>,
        job: &mut SyncJob,
        conflicts: &mut Vec<ConflictRecord>,
    ) -> OperationResult {
        let mut result = OperationResult {
            operation_id: operation.operation_id.clone(),
            success: false,
            entity_kind: operation.entity_kind,
            entity_id: operation.entity_id,
            version: None,
            payload: None,
            conflict_id: None,
            error: None,
            error_code: None,
        };

        // Load current state; creates never need it.
        let current = if operation.kind == OperationKind::Create {
            None
        } else {
            match operation.entity_id {
                Some(id) => match self.store.get(user_id, operation.entity_kind, id) {
                    Ok(entity) => entity,
                    Err(e) => {
                        result.error = Some(e.to_string());
                        result.error_code = Some(e.code());
                        return result;
                    }
                },
                None => {
                    result.error = Some("operation is missing entityId".to_string());
                    result.error_code = Some(ErrorCode::Internal);
                    return result;
                }
            }
        };

        // Classification is the engine's job, never re-implemented here.
        let conflict = match self.engine.detect(user_id, operation, current.as_ref()) {
            Ok(conflict) => conflict,
            Err(e) => {
                result.error = Some(e.to_string());
                result.error_code = Some(e.code());
                return result;
            }
        };

        if let Some(conflict) = conflict {
            job.conflicts_detected += 1;
            result.conflict_id = Some(conflict.conflict_id.clone());

            let strategy = default_strategy.unwrap_or(conflict.suggested_strategy);
            let outcome = self.engine.resolve(&conflict, strategy);

            if outcome.success {
                let resolved_payload = outcome.resolved_payload.clone().unwrap_or_default();
                // A write is only needed when the resolution advanced the
                // version; server-wins leaves the row untouched.
                let persisted = if outcome.new_version > conflict.server.version {
                    self.store
                        .apply_resolved(
                            user_id,
                            conflict.entity_kind,
                            conflict.entity_id,
                            resolved_payload.clone(),
                            outcome.new_version,
                            client_id,
                        )
                        .map(Some)
                } else {
                    Ok(None)
                };

                match persisted {
                    Ok(written) => {
                        if let Err(e) = self.engine.mark_resolved(
                            user_id,
                            &conflict.conflict_id,
                            strategy,
                            resolved_payload,
                        ) {
                            warn!("Failed to mark conflict resolved: {}", e);
                        }
                        job.conflicts_resolved += 1;
                        result.success = true;
                        result.entity_id = Some(conflict.entity_id);
                        result.version = Some(outcome.new_version);
                        if let Some(entity) = written {
                            self.emit_entity_changed(user_id, client_id, &entity);
                        }
                    }
                    Err(e) => {
                        result.error = Some(e.to_string());
                        result.error_code = Some(e.code());
                    }
                }
            } else {
                let _ = self.events_tx.send(SyncEvent::ConflictDetected {
                    user_id,
                    conflict: Box::new(conflict.clone()),
                    requires_manual: outcome.manual_required,
                });
                result.error = Some(format!(
                    "conflict requires manual resolution ({})",
                    conflict.kind.as_str()
                ));
                result.error_code = Some(ErrorCode::ConflictUnresolved);
            }

            // Refresh the snapshot handed back to the client.
            if let Some(latest) = self.engine.lookup(user_id, &conflict.conflict_id) {
                conflicts.push(latest);
            } else {
                conflicts.push(conflict);
            }
            return result;
        }

        // No conflict: dispatch to the store.
        let applied: Result<Option<Entity>> = match operation.kind {
            OperationKind::Create => {
                // A replayed create returns the original entity.
                let key = (user_id, operation.operation_id.clone());
                if let Some(existing_id) = self.applied_creates.get(&key).map(|e| *e) {
                    debug!(
                        "Create {} replayed; returning entity {}",
                        operation.operation_id, existing_id
                    );
                    self.store.get(user_id, operation.entity_kind, existing_id)
                } else {
                    let payload = operation.payload.clone().unwrap_or_default();
                    match self
                        .store
                        .create(user_id, operation.entity_kind, payload, client_id)
                    {
                        Ok(entity) => {
                            self.applied_creates.insert(key, entity.id);
                            Ok(Some(entity))
                        }
                        Err(e) => Err(e),
                    }
                }
            }
            OperationKind::Update => {
                let empty = Map::new();
                let changes = operation.changes.as_ref().unwrap_or(&empty);
                self.store
                    .update(
                        user_id,
                        operation.entity_kind,
                        operation.entity_id.unwrap_or_default(),
                        changes,
                        operation.from_version,
                        client_id,
                    )
                    .map(Some)
            }
            OperationKind::Delete => self
                .store
                .soft_delete(
                    user_id,
                    operation.entity_kind,
                    operation.entity_id.unwrap_or_default(),
                    client_id,
                )
                .map(Some),
            OperationKind::Read => Ok(current),
        };

        match applied {
            Ok(Some(entity)) => {
                result.success = true;
                result.entity_id = Some(entity.id);
                result.version = Some(entity.version);
                if matches!(operation.kind, OperationKind::Read | OperationKind::Create) {
                    result.payload = Some(entity.payload_json());
                }
                if operation.kind != OperationKind::Read {
                    self.emit_entity_changed(user_id, client_id, &entity);
                }
            }
            Ok(None) => {
                result.error = Some(format!(
                    "{} {} not found",
                    operation.entity_kind.table_name(),
                    operation.entity_id.unwrap_or_default()
                ));
                result.error_code = Some(ErrorCode::NotFound);
            }
            Err(e) => {
                result.error = Some(e.to_string());
                result.error_code = Some(e.code());
            }
        }
        result
    }

    fn emit_entity_changed(&self, user_id: i64, origin_client: &str, entity: &Entity) {
        let _ = self.events_tx.send(SyncEvent::EntityChanged {
            user_id,
            origin_client: origin_client.to_string(),
            update: Self::entity_to_update(entity),
        });
    }

    /// Convert an entity row into a server update: tombstones become
    /// deletes with no payload, everything else a full-payload update.
    pub fn entity_to_update(entity: &Entity) -> ServerUpdate {
        if entity.is_deleted() {
            ServerUpdate {
                entity_kind: entity.kind(),
                entity_id: entity.id,
                operation_kind: OperationKind::Delete,
                version: entity.version,
                payload: None,
                modified_at: entity.updated_at,
                modified_by: entity.modified_by.clone(),
            }
        } else {
            ServerUpdate {
                entity_kind: entity.kind(),
                entity_id: entity.id,
                operation_kind: OperationKind::Update,
                version: entity.version,
                payload: Some(entity.payload_json()),
                modified_at: entity.updated_at,
                modified_by: entity.modified_by.clone(),
            }
        }
    }

    /// Collect changes since the cursor, restricted to the wanted kinds.
    /// Returns the updates (oldest first) and whether more remain.
    pub fn collect_updates(
        &self,
        user_id: i64,
        since: i64,
        kinds: Option<&[EntityKind]>,
        limit: usize,
    ) -> Result<(Vec<ServerUpdate>, bool)> {
        let all_kinds = EntityKind::all();
        let wanted: Vec<EntityKind> = match kinds {
            Some(kinds) if !kinds.is_empty() => kinds.to_vec(),
            _ => all_kinds.to_vec(),
        };

        let mut updates = Vec::new();
        let mut has_more = false;
        for kind in wanted {
            let entities = self
                .store
                .list_changed_since(user_id, kind, since, limit + 1)?;
            if entities.len() > limit {
                has_more = true;
            }
            updates.extend(entities.iter().take(limit).map(Self::entity_to_update));
        }
        updates.sort_by_key(|u| u.modified_at);
        if updates.len() > limit {
            has_more = true;
            updates.truncate(limit);
        }
        Ok((updates, has_more))
    }

    /// Pull-mode fetch shared by the HTTP poll route and the pull loop.
    pub fn poll(
        &self,
        user_id: i64,
        since: i64,
        kinds: Option<&[EntityKind]>,
    ) -> Result<(Vec<ServerUpdate>, bool)> {
        self.collect_updates(user_id, since, kinds, self.config.default_batch_size)
    }

    // =========================================================================
    // Job tracking
    // =========================================================================

    fn finish_job(&self, job: &SyncJob) {
        self.active_jobs.remove(&job.sync_id);
        self.cancel_flags.remove(&job.sync_id);
        let mut history = self.job_history.entry(job.user_id).or_default();
        history.push_back(job.clone());
        while history.len() > JOB_HISTORY_LIMIT {
            history.pop_front();
        }
    }

    /// A user's active and recent jobs, newest first.
    pub fn jobs_for(&self, user_id: i64) -> Vec<SyncJob> {
        let mut jobs: Vec<SyncJob> = self
            .active_jobs
            .iter()
            .filter(|j| j.user_id == user_id)
            .map(|j| j.clone())
            .collect();
        if let Some(history) = self.job_history.get(&user_id) {
            jobs.extend(history.iter().rev().cloned());
        }
        jobs
    }

    /// Look up one job by id.
    pub fn get_job(&self, user_id: i64, sync_id: &str) -> Option<SyncJob> {
        if let Some(job) = self.active_jobs.get(sync_id) {
            if job.user_id == user_id {
                return Some(job.clone());
            }
            return None;
        }
        self.job_history
            .get(&user_id)
            .and_then(|h| h.iter().find(|j| j.sync_id == sync_id).cloned())
    }

    /// Cancel an in-flight sync job. In-flight operations observe the flag
    /// between dispatches; applied operations are not rolled back.
    pub fn cancel_sync(&self, user_id: i64, sync_id: &str) -> Result<SyncJob> {
        let flag = self
            .cancel_flags
            .get(sync_id)
            .map(|f| f.clone())
            .ok_or_else(|| AppError::NotFound(format!("sync job {}", sync_id)))?;

        let mut job = self
            .active_jobs
            .get_mut(sync_id)
            .filter(|j| j.user_id == user_id)
            .ok_or_else(|| AppError::NotFound(format!("sync job {}", sync_id)))?;

        flag.store(true, Ordering::Relaxed);
        job.status = SyncJobStatus::Cancelled;
        job.end_time = Some(chrono::Utc::now().timestamp_millis());
        info!("Sync {} cancelled by user {}", sync_id, user_id);
        Ok(job.clone())
    }

    /// Requeue a finished job's failed operations onto the operations
    /// queue. Returns how many were queued.
    pub fn retry(&self, user_id: i64, sync_id: &str) -> Result<usize> {
        let job = self
            .get_job(user_id, sync_id)
            .ok_or_else(|| AppError::NotFound(format!("sync job {}", sync_id)))?;

        let failed = self
            .failed_operations
            .remove(sync_id)
            .map(|(_, ops)| ops)
            .unwrap_or_default();
        for operation in &failed {
            self.queue.enqueue(user_id, &job.client_id, operation.clone());
        }
        info!(
            "Requeued {} failed operations of sync {}",
            failed.len(),
            sync_id
        );
        Ok(failed.len())
    }

    /// Run one processing pass over a user's due queued operations.
    /// Returns (processed, succeeded).
    pub fn process_queue(&self, user_id: i64) -> (usize, usize) {
        let due = self.queue.take_due(user_id, self.config.default_batch_size);
        let mut succeeded = 0;
        let processed = due.len();

        for item in due {
            let mut scratch_job = SyncJob {
                sync_id: format!("queue-{}", item.id),
                user_id,
                client_id: item.client_id.clone(),
                status: SyncJobStatus::Syncing,
                start_time: chrono::Utc::now().timestamp_millis(),
                end_time: None,
                total_operations: 1,
                completed_operations: 0,
                successful_operations: 0,
                failed_operations: 0,
                conflicts_detected: 0,
                conflicts_resolved: 0,
            };
            let mut conflicts = Vec::new();
            let result = self.apply_operation(
                user_id,
                &item.client_id,
                &item.operation,
                None,
                &mut scratch_job,
                &mut conflicts,
            );
            if result.success {
                self.queue.complete(&item.id);
                succeeded += 1;
            } else {
                self.queue
                    .fail(&item.id, result.error.as_deref().unwrap_or("unknown error"));
            }
        }
        (processed, succeeded)
    }
}

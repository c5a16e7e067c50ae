//! Conflict engine: classification, resolution policy, and the in-memory
//! conflict registry.
//!
//! The engine is the single authority on conflict classification. The sync
//! coordinator hands every proposed operation through `detect` and never
//! re-implements the decision procedure.

use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConflictConfig, ConflictPolicy};
use crate::error::{AppError, Result};
use crate::services::SqliteStore;
use crate::types::{
    ClientSnapshot, ConflictKind, ConflictRecord, ConflictStats, ConflictStatus, Entity,
    EntityKind, OperationKind, Resolution, ResolutionOutcome, ResolutionStrategy, ServerSnapshot,
    SyncOperation,
};

/// Signal for "did this field change server-side concurrently?".
///
/// The default implementation answers no; deployments with a
/// recent-operations index can install a real one.
pub trait RecentChangeIndex: Send + Sync {
    fn field_changed_recently(
        &self,
        user_id: i64,
        kind: EntityKind,
        entity_id: i64,
        field: &str,
    ) -> bool;
}

/// Always-false default signal.
pub struct NoRecentChanges;

impl RecentChangeIndex for NoRecentChanges {
    fn field_changed_recently(&self, _: i64, _: EntityKind, _: i64, _: &str) -> bool {
        false
    }
}

/// Field names whose canonicalized values differ between the two sides.
/// Absent keys compare as JSON null; comparisons are deep and exact.
pub fn diff_fields(server: &Map<String, Value>, client: &Map<String, Value>) -> Vec<String> {
    let mut fields = Vec::new();
    for key in server.keys().chain(client.keys()) {
        if fields.iter().any(|f| f == key) {
            continue;
        }
        let left = server.get(key).unwrap_or(&Value::Null);
        let right = client.get(key).unwrap_or(&Value::Null);
        if left != right {
            fields.push(key.clone());
        }
    }
    fields.sort();
    fields
}

/// Shallow field merge: start from the server payload, overwrite every key
/// the client payload carries with a differing value. Nested objects and
/// arrays are replaced wholesale, not recursively merged.
pub fn merge_payloads(
    server: &Map<String, Value>,
    client: &Map<String, Value>,
) -> Map<String, Value> {
    let mut merged = server.clone();
    for (key, value) in client {
        if server.get(key) != Some(value) {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Conflict classification, resolution, and registry.
pub struct ConflictEngine {
    store: Arc<SqliteStore>,
    policy: ConflictPolicy,
    config: ConflictConfig,
    registry: DashMap<String, ConflictRecord>,
    recent_changes: Arc<dyn RecentChangeIndex>,
}

impl ConflictEngine {
    /// Create an engine with the always-false concurrent-change signal.
    pub fn new(store: Arc<SqliteStore>, policy: ConflictPolicy, config: ConflictConfig) -> Arc<Self> {
        Self::with_recent_changes(store, policy, config, Arc::new(NoRecentChanges))
    }

    /// Create an engine with a custom concurrent-change signal.
    pub fn with_recent_changes(
        store: Arc<SqliteStore>,
        policy: ConflictPolicy,
        config: ConflictConfig,
        recent_changes: Arc<dyn RecentChangeIndex>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            policy,
            config,
            registry: DashMap::new(),
            recent_changes,
        })
    }

    /// Start the hourly retention sweeper.
    pub fn start(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            loop {
                interval.tick().await;
                self.sweep();
            }
        });
    }

    // =========================================================================
    // Detection
    // =========================================================================

    /// Classify a proposed operation against the current server record.
    /// Returns the stored conflict record when a conflict is detected.
    ///
    /// Decision procedure, first match wins:
    /// 1. creates never conflict;
    /// 2. update against a tombstone (or nothing) is delete-vs-update;
    /// 3. a stale `fromVersion` is a version mismatch, subclassified by the
    ///    proposed changes (rename / folder-move / concurrent-update, or
    ///    update-vs-delete for a stale delete);
    /// 4. a parent pointer that is missing or would form a cycle is
    ///    parent-missing.
    pub fn detect(
        &self,
        user_id: i64,
        operation: &SyncOperation,
        current: Option<&Entity>,
    ) -> Result<Option<ConflictRecord>> {
        if operation.kind == OperationKind::Create {
            return Ok(None);
        }

        let client_changes = operation
            .changes
            .as_ref()
            .or(operation.payload.as_ref())
            .cloned()
            .unwrap_or_default();

        // 2. Update against a tombstone (or a record that never existed):
        //    the server side is the deleter.
        let tombstoned = current.map(|e| e.is_deleted()).unwrap_or(true);
        if tombstoned && operation.kind == OperationKind::Update {
            let conflict = self.build_conflict(
                user_id,
                operation,
                current,
                ConflictKind::DeleteVsUpdate,
                client_changes,
                None,
            );
            return Ok(Some(self.save(conflict)));
        }

        let current = match current {
            Some(entity) if !entity.is_deleted() => entity,
            _ => return Ok(None),
        };

        // 3. Stale fromVersion: subclassify by the proposed changes.
        if let Some(from_version) = operation.from_version {
            if current.version > from_version {
                let server_payload = current.payload_json();
                let kind = match operation.kind {
                    OperationKind::Delete => ConflictKind::UpdateVsDelete,
                    _ => {
                        let title_differs = client_changes
                            .get("title")
                            .map(|v| server_payload.get("title") != Some(v))
                            .unwrap_or(false);
                        let parent_differs = ["folderId", "parentId"].iter().any(|field| {
                            client_changes
                                .get(*field)
                                .map(|v| server_payload.get(*field) != Some(v))
                                .unwrap_or(false)
                        });
                        if title_differs {
                            ConflictKind::Rename
                        } else if parent_differs {
                            ConflictKind::FolderMove
                        } else {
                            ConflictKind::ConcurrentUpdate
                        }
                    }
                };

                // A rename is only suggested append-suffix when the title
                // demonstrably changed concurrently; otherwise latest-wins
                // resolves it.
                let suggested = if kind == ConflictKind::Rename
                    && !self.recent_changes.field_changed_recently(
                        user_id,
                        operation.entity_kind,
                        current.id,
                        "title",
                    ) {
                    Some(ResolutionStrategy::LatestWins)
                } else {
                    None
                };

                let conflict = self.build_conflict(
                    user_id,
                    operation,
                    Some(current),
                    kind,
                    client_changes,
                    suggested,
                );
                return Ok(Some(self.save(conflict)));
            }
        }

        // 4. Parent integrity on pointer-carrying operations.
        if let (Some(parent_field), Some(parent_kind)) = (
            operation.entity_kind.parent_field(),
            operation.entity_kind.parent_kind(),
        ) {
            if let Some(parent_value) = client_changes.get(parent_field) {
                if let Some(parent_id) = parent_value.as_i64() {
                    let missing = !self.store.exists(user_id, parent_kind, parent_id)?;
                    let cycle = !missing
                        && operation.entity_kind == EntityKind::Folder
                        && self
                            .store
                            .would_create_cycle(user_id, current.id, parent_id)?;
                    if missing || cycle {
                        let conflict = self.build_conflict(
                            user_id,
                            operation,
                            Some(current),
                            ConflictKind::ParentMissing,
                            client_changes,
                            None,
                        );
                        return Ok(Some(self.save(conflict)));
                    }
                }
            }
        }

        Ok(None)
    }

    fn build_conflict(
        &self,
        user_id: i64,
        operation: &SyncOperation,
        current: Option<&Entity>,
        kind: ConflictKind,
        client_changes: Map<String, Value>,
        suggested_override: Option<ResolutionStrategy>,
    ) -> ConflictRecord {
        let now = chrono::Utc::now().timestamp_millis();
        let entity_id = current.map(|e| e.id).or(operation.entity_id).unwrap_or(0);

        let server_payload = current.map(|e| e.payload_json()).unwrap_or_default();
        let server_version = current.map(|e| e.version).unwrap_or(0);
        let server_modified_at = current.map(|e| e.updated_at).unwrap_or(0);
        let server_deleted = current.map(|e| e.is_deleted()).unwrap_or(true);
        let modified_by = current
            .map(|e| e.modified_by.clone())
            .unwrap_or_else(|| crate::services::store::SERVER_WRITER.to_string());

        // The client's proposed state: the server record with the proposed
        // changes laid over it. Keeps resolution payloads complete even for
        // partial updates.
        let client_payload = merge_payloads(&server_payload, &client_changes);
        let conflict_fields = diff_fields(&server_payload, &client_payload);

        ConflictRecord {
            conflict_id: Uuid::new_v4().to_string(),
            user_id,
            kind,
            entity_kind: operation.entity_kind,
            entity_id,
            operation_id: operation.operation_id.clone(),
            server: ServerSnapshot {
                version: server_version,
                payload: server_payload,
                modified_at: server_modified_at,
                modified_by,
                deleted: server_deleted,
            },
            client: ClientSnapshot {
                from_version: operation.from_version.unwrap_or(0),
                payload: client_payload,
                modified_at: operation.client_timestamp,
                operation_kind: operation.kind,
            },
            conflict_fields,
            suggested_strategy: suggested_override
                .unwrap_or_else(|| self.policy.suggested_for(kind)),
            status: ConflictStatus::Unresolved,
            detected_at: now,
            resolution: None,
        }
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Execute a resolution strategy against a conflict's snapshots.
    /// Pure with respect to the store; persisting the outcome is the
    /// caller's job.
    pub fn resolve(&self, conflict: &ConflictRecord, strategy: ResolutionStrategy) -> ResolutionOutcome {
        let server_version = conflict.server.version;
        match strategy {
            ResolutionStrategy::ServerWins => ResolutionOutcome {
                success: true,
                resolved_payload: Some(conflict.server.payload.clone()),
                new_version: server_version,
                manual_required: false,
            },
            ResolutionStrategy::ClientWins => ResolutionOutcome {
                success: true,
                resolved_payload: Some(conflict.client.payload.clone()),
                new_version: server_version + 1,
                manual_required: false,
            },
            ResolutionStrategy::LatestWins => {
                // Ties break to the client.
                if conflict.client.modified_at >= conflict.server.modified_at {
                    ResolutionOutcome {
                        success: true,
                        resolved_payload: Some(conflict.client.payload.clone()),
                        new_version: server_version + 1,
                        manual_required: false,
                    }
                } else {
                    ResolutionOutcome {
                        success: true,
                        resolved_payload: Some(conflict.server.payload.clone()),
                        new_version: server_version,
                        manual_required: false,
                    }
                }
            }
            ResolutionStrategy::Merge => ResolutionOutcome {
                success: true,
                resolved_payload: Some(merge_payloads(
                    &conflict.server.payload,
                    &conflict.client.payload,
                )),
                new_version: server_version + 1,
                manual_required: false,
            },
            ResolutionStrategy::AppendSuffix => {
                let mut payload = conflict.client.payload.clone();
                let suffix_field = if payload.contains_key("title") {
                    "title"
                } else {
                    "name"
                };
                match payload.get(suffix_field).and_then(Value::as_str) {
                    Some(existing) => {
                        let now = chrono::Utc::now().timestamp_millis();
                        let renamed = format!("{} ({})", existing, now);
                        payload.insert(suffix_field.to_string(), Value::String(renamed));
                        ResolutionOutcome {
                            success: true,
                            resolved_payload: Some(payload),
                            new_version: server_version + 1,
                            manual_required: false,
                        }
                    }
                    None => {
                        warn!(
                            "append-suffix on conflict {} without a renameable field",
                            conflict.conflict_id
                        );
                        ResolutionOutcome {
                            success: false,
                            resolved_payload: None,
                            new_version: server_version,
                            manual_required: false,
                        }
                    }
                }
            }
            ResolutionStrategy::Manual => ResolutionOutcome::manual(server_version),
        }
    }

    // =========================================================================
    // Registry
    // =========================================================================

    fn save(&self, conflict: ConflictRecord) -> ConflictRecord {
        debug!(
            "Detected {} conflict {} on {} {} (user {})",
            conflict.kind.as_str(),
            conflict.conflict_id,
            conflict.entity_kind.table_name(),
            conflict.entity_id,
            conflict.user_id
        );
        self.registry
            .insert(conflict.conflict_id.clone(), conflict.clone());
        self.enforce_size_cap();
        conflict
    }

    /// Look up a conflict, authorizing by owner.
    pub fn lookup(&self, user_id: i64, conflict_id: &str) -> Option<ConflictRecord> {
        self.registry
            .get(conflict_id)
            .filter(|c| c.user_id == user_id)
            .map(|c| c.clone())
    }

    /// List a user's conflicts, most recent first.
    pub fn list(
        &self,
        user_id: i64,
        status: Option<ConflictStatus>,
        limit: usize,
        offset: usize,
    ) -> Vec<ConflictRecord> {
        let mut conflicts: Vec<ConflictRecord> = self
            .registry
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .filter(|entry| status.map(|s| entry.status == s).unwrap_or(true))
            .map(|entry| entry.clone())
            .collect();
        conflicts.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        conflicts.into_iter().skip(offset).take(limit).collect()
    }

    /// Transition a conflict to resolved, recording the outcome. The
    /// transition only succeeds from `unresolved`.
    pub fn mark_resolved(
        &self,
        user_id: i64,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        payload: Map<String, Value>,
    ) -> Result<ConflictRecord> {
        let mut entry = self
            .registry
            .get_mut(conflict_id)
            .filter(|c| c.user_id == user_id)
            .ok_or_else(|| AppError::NotFound(format!("conflict {}", conflict_id)))?;

        if entry.status != ConflictStatus::Unresolved {
            return Err(AppError::ConflictUnresolved(format!(
                "conflict {} is already {:?}",
                conflict_id, entry.status
            )));
        }

        entry.status = ConflictStatus::Resolved;
        entry.resolution = Some(Resolution {
            strategy,
            payload,
            resolved_at: chrono::Utc::now().timestamp_millis(),
        });
        Ok(entry.clone())
    }

    /// Mark a conflict ignored. Only possible from `unresolved`.
    pub fn mark_ignored(&self, user_id: i64, conflict_id: &str) -> Result<ConflictRecord> {
        let mut entry = self
            .registry
            .get_mut(conflict_id)
            .filter(|c| c.user_id == user_id)
            .ok_or_else(|| AppError::NotFound(format!("conflict {}", conflict_id)))?;

        if entry.status != ConflictStatus::Unresolved {
            return Err(AppError::ConflictUnresolved(format!(
                "conflict {} is already {:?}",
                conflict_id, entry.status
            )));
        }

        entry.status = ConflictStatus::Ignored;
        Ok(entry.clone())
    }

    /// Registry counters for a user.
    pub fn stats(&self, user_id: i64) -> ConflictStats {
        let mut stats = ConflictStats::default();
        for entry in self.registry.iter() {
            if entry.user_id != user_id {
                continue;
            }
            stats.total += 1;
            match entry.status {
                ConflictStatus::Unresolved => stats.unresolved += 1,
                ConflictStatus::Resolved => stats.resolved += 1,
                ConflictStatus::Ignored => stats.ignored += 1,
            }
            *stats
                .by_kind
                .entry(entry.kind.as_str().to_string())
                .or_insert(0) += 1;
        }
        stats
    }

    /// Number of records in the registry, all users.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Age-then-size eviction pass.
    pub fn sweep(&self) {
        let retention_ms = self.config.retention_days as i64 * 86_400_000;
        let cutoff = chrono::Utc::now().timestamp_millis() - retention_ms;

        let before = self.registry.len();
        self.registry.retain(|_, c| c.detected_at >= cutoff);
        let aged_out = before - self.registry.len();
        if aged_out > 0 {
            info!("Conflict sweep evicted {} aged records", aged_out);
        }

        self.enforce_size_cap();
    }

    fn enforce_size_cap(&self) {
        let excess = self.registry.len().saturating_sub(self.config.max_records);
        if excess == 0 {
            return;
        }
        let mut entries: Vec<(String, i64)> = self
            .registry
            .iter()
            .map(|e| (e.conflict_id.clone(), e.detected_at))
            .collect();
        entries.sort_by_key(|(_, detected_at)| *detected_at);
        for (conflict_id, _) in entries.into_iter().take(excess) {
            self.registry.remove(&conflict_id);
        }
        info!("Conflict registry size cap evicted {} oldest records", excess);
    }
}

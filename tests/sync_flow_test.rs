//! End-to-end sync pipeline tests: batch processing, conflict detection,
//! auto-resolution, and cursor semantics.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use scribe::config::Config;
use scribe::services::{ConflictEngine, OperationQueue, SqliteStore, SyncCoordinator};
use scribe::types::{
    ConflictKind, ConflictStatus, EntityKind, OperationKind, ResolutionStrategy, SyncJobStatus,
    SyncOperation, SyncRequest, PROTOCOL_VERSION,
};

struct Harness {
    store: Arc<SqliteStore>,
    engine: Arc<ConflictEngine>,
    coordinator: Arc<SyncCoordinator>,
}

fn harness() -> Harness {
    let config = Config::from_env();
    let store = Arc::new(SqliteStore::new_in_memory().unwrap());
    let engine = ConflictEngine::new(store.clone(), config.policy, config.conflicts);
    let queue = Arc::new(OperationQueue::new(
        config.sync.max_retries,
        config.sync.retry_delay_ms,
    ));
    let coordinator = SyncCoordinator::new(store.clone(), engine.clone(), queue, config.sync);
    Harness {
        store,
        engine,
        coordinator,
    }
}

fn request(client_id: &str, operations: Vec<SyncOperation>) -> SyncRequest {
    SyncRequest {
        request_id: uuid::Uuid::new_v4().to_string(),
        client_id: client_id.to_string(),
        protocol_version: PROTOCOL_VERSION,
        client_state: Default::default(),
        operations,
        default_resolution_strategy: None,
        entity_kinds_wanted: None,
    }
}

fn note_payload(title: &str, content: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("title".to_string(), json!(title));
    map.insert("content".to_string(), json!(content));
    map
}

fn create_note(h: &Harness, user_id: i64, title: &str) -> i64 {
    h.store
        .create(user_id, EntityKind::Note, note_payload(title, "body"), "seed-client")
        .unwrap()
        .id
}

/// Concurrent title edit: the client edited from a stale version with a
/// later wall clock; latest-wins auto-resolution takes the client title
/// and bumps the version past the server's.
#[tokio::test]
async fn test_concurrent_title_edit_resolves_latest_wins() {
    let h = harness();
    let note_id = create_note(&h, 1, "Draft");

    // Server-side edit brings the note to version 2.
    let mut bump = Map::new();
    bump.insert("title".to_string(), json!("Draft (server)"));
    let server_copy = h
        .store
        .update(1, EntityKind::Note, note_id, &bump, None, "desktop")
        .unwrap();
    assert_eq!(server_copy.version, 2);

    let mut changes = Map::new();
    changes.insert("title".to_string(), json!("Final"));
    let op = SyncOperation {
        operation_id: "title-edit".to_string(),
        kind: OperationKind::Update,
        entity_kind: EntityKind::Note,
        entity_id: Some(note_id),
        payload: None,
        changes: Some(changes),
        from_version: Some(1),
        client_timestamp: server_copy.updated_at + 1_000,
    };

    let response = h
        .coordinator
        .process_request(1, request("web", vec![op]))
        .await
        .unwrap();

    assert_eq!(response.conflicts.len(), 1);
    let conflict = &response.conflicts[0];
    assert_eq!(conflict.kind, ConflictKind::Rename);
    assert_eq!(conflict.status, ConflictStatus::Resolved);

    let resolved = h.store.get(1, EntityKind::Note, note_id).unwrap().unwrap();
    assert_eq!(resolved.version, 3);
    assert_eq!(
        resolved.payload_json().get("title"),
        Some(&json!("Final"))
    );
    assert_eq!(response.status, SyncJobStatus::Success);
}

/// Delete-vs-update: the server deleted the note first; server-wins keeps
/// the tombstone and the version stays put.
#[tokio::test]
async fn test_update_on_deleted_note_keeps_tombstone() {
    let h = harness();
    let note_id = create_note(&h, 1, "Doomed");

    // Bring the note to version 4, then delete (version 5 is the tombstone
    // for this test's bookkeeping; what matters is it never moves again).
    let mut bump = Map::new();
    bump.insert("content".to_string(), json!("v2"));
    h.store.update(1, EntityKind::Note, note_id, &bump, None, "desktop").unwrap();
    bump.insert("content".to_string(), json!("v3"));
    h.store.update(1, EntityKind::Note, note_id, &bump, None, "desktop").unwrap();
    let tombstone = h.store.soft_delete(1, EntityKind::Note, note_id, "desktop").unwrap();
    let tombstone_version = tombstone.version;

    let mut changes = Map::new();
    changes.insert("content".to_string(), json!("late edit"));
    let op = SyncOperation {
        operation_id: "late-edit".to_string(),
        kind: OperationKind::Update,
        entity_kind: EntityKind::Note,
        entity_id: Some(note_id),
        payload: None,
        changes: Some(changes),
        from_version: Some(tombstone_version - 1),
        client_timestamp: chrono::Utc::now().timestamp_millis(),
    };

    let response = h
        .coordinator
        .process_request(1, request("web", vec![op]))
        .await
        .unwrap();

    let conflict = &response.conflicts[0];
    assert_eq!(conflict.kind, ConflictKind::DeleteVsUpdate);
    assert_eq!(conflict.suggested_strategy, ResolutionStrategy::ServerWins);
    assert_eq!(conflict.status, ConflictStatus::Resolved);

    // Server snapshot untouched: still a tombstone at the same version.
    let after = h.store.get(1, EntityKind::Note, note_id).unwrap().unwrap();
    assert!(after.is_deleted());
    assert_eq!(after.version, tombstone_version);
}

/// Parent cycle: re-parenting A under its own descendant is surfaced as a
/// manual parent-missing-family conflict and nothing is written.
#[tokio::test]
async fn test_parent_cycle_requires_manual_resolution() {
    let h = harness();
    let mut a = Map::new();
    a.insert("name".to_string(), json!("A"));
    let folder_a = h.store.create(1, EntityKind::Folder, a, "seed").unwrap();
    let mut b = Map::new();
    b.insert("name".to_string(), json!("B"));
    b.insert("parentId".to_string(), json!(folder_a.id));
    let folder_b = h.store.create(1, EntityKind::Folder, b, "seed").unwrap();

    let mut changes = Map::new();
    changes.insert("parentId".to_string(), json!(folder_b.id));
    let op = SyncOperation {
        operation_id: "make-cycle".to_string(),
        kind: OperationKind::Update,
        entity_kind: EntityKind::Folder,
        entity_id: Some(folder_a.id),
        payload: None,
        changes: Some(changes),
        from_version: Some(folder_a.version),
        client_timestamp: chrono::Utc::now().timestamp_millis(),
    };

    let response = h
        .coordinator
        .process_request(1, request("web", vec![op]))
        .await
        .unwrap();

    let conflict = &response.conflicts[0];
    assert_eq!(conflict.kind, ConflictKind::ParentMissing);
    assert_eq!(conflict.suggested_strategy, ResolutionStrategy::Manual);
    assert_eq!(conflict.status, ConflictStatus::Unresolved);
    assert!(!response.operation_results[0].success);
    assert_eq!(response.status, SyncJobStatus::Conflict);

    // No mutation happened.
    let after = h.store.get(1, EntityKind::Folder, folder_a.id).unwrap().unwrap();
    assert_eq!(after.version, folder_a.version);
    match after.payload_json().get("parentId") {
        None | Some(Value::Null) => {}
        other => panic!("parent changed: {:?}", other),
    }

    // The stored conflict is available for later adjudication.
    assert_eq!(h.engine.stats(1).unresolved, 1);
}

/// Mixed batch: a valid create, an auto-resolvable conflicting update, and
/// a delete of a missing entity. Results keep submission order; one bad
/// operation never aborts the batch.
#[tokio::test]
async fn test_mixed_batch_preserves_order_and_counters() {
    let h = harness();
    let note_id = create_note(&h, 1, "Shared");
    let mut bump = Map::new();
    bump.insert("content".to_string(), json!("server edit"));
    let server_copy = h
        .store
        .update(1, EntityKind::Note, note_id, &bump, None, "desktop")
        .unwrap();

    let mut stale = Map::new();
    stale.insert("content".to_string(), json!("client edit"));
    let operations = vec![
        SyncOperation {
            operation_id: "op-create".to_string(),
            kind: OperationKind::Create,
            entity_kind: EntityKind::Note,
            entity_id: None,
            payload: Some(note_payload("Brand new", "")),
            changes: None,
            from_version: None,
            client_timestamp: chrono::Utc::now().timestamp_millis(),
        },
        SyncOperation {
            operation_id: "op-conflict".to_string(),
            kind: OperationKind::Update,
            entity_kind: EntityKind::Note,
            entity_id: Some(note_id),
            payload: None,
            changes: Some(stale),
            from_version: Some(1),
            client_timestamp: server_copy.updated_at + 500,
        },
        SyncOperation {
            operation_id: "op-ghost".to_string(),
            kind: OperationKind::Delete,
            entity_kind: EntityKind::Note,
            entity_id: Some(424_242),
            payload: None,
            changes: None,
            from_version: None,
            client_timestamp: chrono::Utc::now().timestamp_millis(),
        },
    ];

    let response = h
        .coordinator
        .process_request(1, request("web", operations))
        .await
        .unwrap();

    let ids: Vec<&str> = response
        .operation_results
        .iter()
        .map(|r| r.operation_id.as_str())
        .collect();
    assert_eq!(ids, vec!["op-create", "op-conflict", "op-ghost"]);

    let flags: Vec<bool> = response
        .operation_results
        .iter()
        .map(|r| r.success)
        .collect();
    assert_eq!(flags, vec![true, true, false]);
    assert_eq!(response.status, SyncJobStatus::Success);

    let job = h
        .coordinator
        .get_job(1, &response.new_client_state.last_sync_id)
        .unwrap();
    assert_eq!(job.successful_operations, 2);
    assert_eq!(job.failed_operations, 1);
    assert_eq!(job.conflicts_detected, 1);
    assert_eq!(job.conflicts_resolved, 1);
}

/// Every server update in a response respects the client's cursor.
#[tokio::test]
async fn test_no_server_update_older_than_cursor() {
    let h = harness();
    create_note(&h, 1, "Old note");
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let cursor = chrono::Utc::now().timestamp_millis();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    create_note(&h, 1, "New note");

    let mut req = request("web", vec![]);
    req.client_state.last_sync_time = cursor;
    let response = h.coordinator.process_request(1, req).await.unwrap();

    assert!(!response.server_updates.is_empty());
    for update in &response.server_updates {
        assert!(update.modified_at >= cursor);
    }
}

/// Tombstones travel as payload-less delete updates.
#[tokio::test]
async fn test_tombstones_surface_as_delete_updates() {
    let h = harness();
    let note_id = create_note(&h, 1, "Short-lived");
    h.store.soft_delete(1, EntityKind::Note, note_id, "desktop").unwrap();

    let response = h.coordinator.process_request(1, request("web", vec![])).await.unwrap();
    let update = response
        .server_updates
        .iter()
        .find(|u| u.entity_id == note_id)
        .expect("tombstone update expected");
    assert_eq!(update.operation_kind, OperationKind::Delete);
    assert!(update.payload.is_none());
}

/// Resolving a stored conflict by hand through the engine writes the
/// resolved payload at the engine-computed version.
#[tokio::test]
async fn test_manual_conflict_resolved_via_engine_api() {
    let h = harness();
    let note_id = create_note(&h, 1, "Contested");
    let mut bump = Map::new();
    bump.insert("content".to_string(), json!("server"));
    let server_copy = h
        .store
        .update(1, EntityKind::Note, note_id, &bump, None, "desktop")
        .unwrap();

    let mut stale = Map::new();
    stale.insert("content".to_string(), json!("client"));
    let op = SyncOperation {
        operation_id: "contested".to_string(),
        kind: OperationKind::Update,
        entity_kind: EntityKind::Note,
        entity_id: Some(note_id),
        payload: None,
        changes: Some(stale),
        from_version: Some(1),
        client_timestamp: server_copy.updated_at - 10_000,
    };
    // Manual default blocks auto-resolution.
    let mut req = request("web", vec![op]);
    req.default_resolution_strategy = Some(ResolutionStrategy::Manual);
    let response = h.coordinator.process_request(1, req).await.unwrap();
    assert_eq!(response.status, SyncJobStatus::Conflict);
    let conflict_id = response.conflicts[0].conflict_id.clone();

    // Adjudicate client-wins.
    let conflict = h.engine.lookup(1, &conflict_id).unwrap();
    let outcome = h.engine.resolve(&conflict, ResolutionStrategy::ClientWins);
    assert!(outcome.success);
    h.store
        .apply_resolved(
            1,
            EntityKind::Note,
            note_id,
            outcome.resolved_payload.clone().unwrap(),
            outcome.new_version,
            "web",
        )
        .unwrap();
    h.engine
        .mark_resolved(
            1,
            &conflict_id,
            ResolutionStrategy::ClientWins,
            outcome.resolved_payload.unwrap(),
        )
        .unwrap();

    let after = h.store.get(1, EntityKind::Note, note_id).unwrap().unwrap();
    assert_eq!(after.version, server_copy.version + 1);
    assert_eq!(after.payload_json().get("content"), Some(&json!("client")));
    assert_eq!(h.engine.stats(1).resolved, 1);
}

/// Cancelling a finished job is an error; cancelling an unknown job is an
/// error; cancellation state is visible on the job record.
#[tokio::test]
async fn test_cancel_unknown_job_fails() {
    let h = harness();
    assert!(h.coordinator.cancel_sync(1, "nope").is_err());
}

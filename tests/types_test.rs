//! Wire-format tests for the push envelopes and sync protocol bodies.

use serde_json::json;

use scribe::types::{
    ClientEnvelope, ConflictKind, EntityKind, OperationKind, ResolutionStrategy, ServerEnvelope,
    SyncRequest, UpdateData, UpdateKind, CLOSE_AUTH_FAILED, CLOSE_AUTH_TIMEOUT,
    CLOSE_HEARTBEAT_TIMEOUT, CLOSE_PROTOCOL_MISMATCH, PROTOCOL_VERSION,
};

#[test]
fn test_close_codes_match_protocol() {
    assert_eq!(CLOSE_AUTH_TIMEOUT, 4000);
    assert_eq!(CLOSE_AUTH_FAILED, 4001);
    assert_eq!(CLOSE_HEARTBEAT_TIMEOUT, 4002);
    assert_eq!(CLOSE_PROTOCOL_MISMATCH, 4003);
}

#[test]
fn test_client_sync_envelope_parses() {
    let json = format!(
        r#"{{
            "type": "sync",
            "timestamp": 1,
            "data": {{
                "requestId": "r1",
                "clientId": "web",
                "protocolVersion": {},
                "clientState": {{"lastSyncTime": 123}},
                "operations": [
                    {{
                        "operationId": "op1",
                        "kind": "update",
                        "entityKind": "note",
                        "entityId": 7,
                        "changes": {{"title": "Final"}},
                        "fromVersion": 1,
                        "clientTimestamp": 456
                    }}
                ]
            }}
        }}"#,
        PROTOCOL_VERSION
    );

    let parsed: ClientEnvelope = serde_json::from_str(&json).unwrap();
    match parsed {
        ClientEnvelope::Sync { data, .. } => {
            assert_eq!(data.client_state.last_sync_time, 123);
            let op = &data.operations[0];
            assert_eq!(op.kind, OperationKind::Update);
            assert_eq!(op.entity_kind, EntityKind::Note);
            assert_eq!(op.from_version, Some(1));
            assert_eq!(
                op.changes.as_ref().unwrap().get("title"),
                Some(&json!("Final"))
            );
        }
        _ => panic!("Wrong message type"),
    }
}

#[test]
fn test_server_update_envelope_shape() {
    let envelope = ServerEnvelope::ServerUpdate {
        entity_kind: EntityKind::Note,
        entity_id: Some(7),
        update_kind: UpdateKind::Incremental,
        update_data: UpdateData {
            operation_kind: OperationKind::Update,
            version: 3,
            payload: None,
            modified_at: 1_700_000_000_000,
            modified_by: "desktop".to_string(),
        },
        timestamp: 1_700_000_000_001,
    };

    let json = serde_json::to_value(&envelope).unwrap();
    assert_eq!(json["type"], "server_update");
    assert_eq!(json["entityKind"], "note");
    assert_eq!(json["updateKind"], "incremental");
    assert_eq!(json["updateData"]["operationKind"], "update");
    assert_eq!(json["updateData"]["modifiedBy"], "desktop");
}

#[test]
fn test_status_change_envelope_shape() {
    let envelope = ServerEnvelope::StatusChange {
        sync_id: "s1".to_string(),
        old_status: scribe::types::SyncJobStatus::Syncing,
        new_status: scribe::types::SyncJobStatus::Success,
        progress: Some(100),
        timestamp: 1,
    };

    let json = serde_json::to_value(&envelope).unwrap();
    assert_eq!(json["type"], "status_change");
    assert_eq!(json["oldStatus"], "syncing");
    assert_eq!(json["newStatus"], "success");
    assert_eq!(json["progress"], 100);
}

#[test]
fn test_conflict_kind_and_strategy_wire_names() {
    for (kind, wire) in [
        (ConflictKind::ConcurrentUpdate, "concurrent-update"),
        (ConflictKind::DeleteVsUpdate, "delete-vs-update"),
        (ConflictKind::UpdateVsDelete, "update-vs-delete"),
        (ConflictKind::Rename, "rename"),
        (ConflictKind::FolderMove, "folder-move"),
        (ConflictKind::ParentMissing, "parent-missing"),
        (ConflictKind::UniqueViolation, "unique-violation"),
        (ConflictKind::VersionMismatch, "version-mismatch"),
    ] {
        assert_eq!(serde_json::to_value(kind).unwrap(), json!(wire));
    }

    for (strategy, wire) in [
        (ResolutionStrategy::ServerWins, "server-wins"),
        (ResolutionStrategy::ClientWins, "client-wins"),
        (ResolutionStrategy::LatestWins, "latest-wins"),
        (ResolutionStrategy::Merge, "merge"),
        (ResolutionStrategy::AppendSuffix, "append-suffix"),
        (ResolutionStrategy::Manual, "manual"),
    ] {
        assert_eq!(serde_json::to_value(strategy).unwrap(), json!(wire));
        assert_eq!(ResolutionStrategy::parse(wire), Some(strategy));
    }
}

#[test]
fn test_sync_request_round_trip() {
    let request: SyncRequest = serde_json::from_value(json!({
        "requestId": "req",
        "clientId": "mobile",
        "protocolVersion": PROTOCOL_VERSION,
        "operations": [],
        "entityKindsWanted": ["note", "folder"]
    }))
    .unwrap();
    assert_eq!(
        request.entity_kinds_wanted,
        Some(vec![EntityKind::Note, EntityKind::Folder])
    );

    let back = serde_json::to_value(&request).unwrap();
    assert_eq!(back["clientId"], "mobile");
    assert_eq!(back["entityKindsWanted"][0], "note");
}

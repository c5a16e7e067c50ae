//! Sync protocol types: batch requests, per-operation results, job records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::conflict::{ConflictRecord, ResolutionStrategy};
use super::entity::EntityKind;
use crate::error::ErrorCode;

/// Protocol version this server speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Kind of a client-submitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Read,
}

/// A single client operation inside a sync batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub operation_id: String,
    pub kind: OperationKind,
    pub entity_kind: EntityKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<i64>,
    /// Full payload for creates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
    /// Partial field changes for updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<Map<String, Value>>,
    /// Server version the client derived this operation from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_version: Option<i64>,
    pub client_timestamp: i64,
}

/// Client cursor state sent with a sync request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientState {
    /// Wall-clock instant separating seen from unseen server updates.
    #[serde(default)]
    pub last_sync_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_id: Option<String>,
}

/// Batch sync request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub request_id: String,
    pub client_id: String,
    pub protocol_version: u32,
    #[serde(default)]
    pub client_state: ClientState,
    #[serde(default)]
    pub operations: Vec<SyncOperation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_resolution_strategy: Option<ResolutionStrategy>,
    /// Restrict collected server updates to these kinds; absent means all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_kinds_wanted: Option<Vec<EntityKind>>,
}

/// Outcome of one operation, in submission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub operation_id: String,
    pub success: bool,
    pub entity_kind: EntityKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    /// Full record, returned for reads and creates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

/// A server-side change the client has not yet seen.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerUpdate {
    pub entity_kind: EntityKind,
    pub entity_id: i64,
    /// `delete` for tombstones, `update` otherwise.
    pub operation_kind: OperationKind,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
    pub modified_at: i64,
    pub modified_by: String,
}

/// Terminal and transient states of a sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncJobStatus {
    Syncing,
    Success,
    Conflict,
    Failed,
    Cancelled,
}

/// Transient record tracking one sync request end to end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJob {
    pub sync_id: String,
    pub user_id: i64,
    pub client_id: String,
    pub status: SyncJobStatus,
    pub start_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    pub total_operations: u32,
    pub completed_operations: u32,
    pub successful_operations: u32,
    pub failed_operations: u32,
    pub conflicts_detected: u32,
    pub conflicts_resolved: u32,
}

impl SyncJob {
    /// Integer progress 0-100.
    pub fn progress(&self) -> u8 {
        if self.total_operations == 0 {
            return 100;
        }
        let pct =
            (self.completed_operations as f64 / self.total_operations as f64 * 100.0).round();
        pct.min(100.0) as u8
    }
}

/// Updated cursor returned to the client after a sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewClientState {
    pub client_id: String,
    pub last_sync_time: i64,
    pub last_sync_id: String,
}

/// Structured response to a sync request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub request_id: String,
    pub server_time: i64,
    pub status: SyncJobStatus,
    pub operation_results: Vec<OperationResult>,
    pub server_updates: Vec<ServerUpdate>,
    pub conflicts: Vec<ConflictRecord>,
    pub new_client_state: NewClientState,
}

/// Lifecycle of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuedOperationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

/// An operation deferred to the operations queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: String,
    pub user_id: i64,
    pub client_id: String,
    pub operation: SyncOperation,
    pub status: QueuedOperationStatus,
    pub retry_count: u32,
    pub created_at: i64,
    pub scheduled_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempted_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Queue counters for the status/stats endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_rounding() {
        let mut job = SyncJob {
            sync_id: "s1".to_string(),
            user_id: 1,
            client_id: "c1".to_string(),
            status: SyncJobStatus::Syncing,
            start_time: 0,
            end_time: None,
            total_operations: 3,
            completed_operations: 1,
            successful_operations: 1,
            failed_operations: 0,
            conflicts_detected: 0,
            conflicts_resolved: 0,
        };
        assert_eq!(job.progress(), 33);

        job.completed_operations = 3;
        assert_eq!(job.progress(), 100);

        job.total_operations = 0;
        assert_eq!(job.progress(), 100);
    }

    #[test]
    fn test_sync_request_deserializes_minimal() {
        let json = r#"{
            "requestId": "r1",
            "clientId": "web-1",
            "protocolVersion": 1,
            "operations": []
        }"#;
        let request: SyncRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.request_id, "r1");
        assert_eq!(request.client_state.last_sync_time, 0);
        assert!(request.entity_kinds_wanted.is_none());
    }

    #[test]
    fn test_operation_result_omits_empty_fields() {
        let result = OperationResult {
            operation_id: "op1".to_string(),
            success: true,
            entity_kind: EntityKind::Note,
            entity_id: Some(1),
            version: Some(1),
            payload: None,
            conflict_id: None,
            error: None,
            error_code: None,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("error"));
        assert!(!json.contains("conflictId"));
    }
}

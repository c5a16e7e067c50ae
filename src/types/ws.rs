//! Push-channel envelopes exchanged over the WebSocket transport.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::conflict::ConflictRecord;
use super::entity::EntityKind;
use super::sync::{OperationKind, SyncJobStatus, SyncRequest, SyncResponse};
use crate::error::ErrorCode;

/// Close code: authentication deadline expired.
pub const CLOSE_AUTH_TIMEOUT: u16 = 4000;
/// Close code: too many failed authentication attempts.
pub const CLOSE_AUTH_FAILED: u16 = 4001;
/// Close code: heartbeat timeout.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4002;
/// Close code: unsupported protocol version.
pub const CLOSE_PROTOCOL_MISMATCH: u16 = 4003;

/// Incoming message from a push client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    Auth { token: String, timestamp: i64 },
    Ping { timestamp: i64 },
    Pong { timestamp: i64 },
    Sync { data: SyncRequest, timestamp: i64 },
}

/// Whether a pushed update carries the full record or a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Incremental,
    Full,
}

/// Body of a `server_update` push.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateData {
    pub operation_kind: OperationKind,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
    pub modified_at: i64,
    pub modified_by: String,
}

/// Outgoing message to a push client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    #[serde(rename_all = "camelCase")]
    Handshake {
        server_id: String,
        protocol_version: u32,
        connection_id: String,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    Auth {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: i64,
    },
    Ping {
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    SyncResponse {
        request_id: String,
        data: Box<SyncResponse>,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    ServerUpdate {
        entity_kind: EntityKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        entity_id: Option<i64>,
        update_kind: UpdateKind,
        update_data: UpdateData,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    Conflict {
        conflict: Box<ConflictRecord>,
        requires_manual_resolution: bool,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    StatusChange {
        sync_id: String,
        old_status: SyncJobStatus,
        new_status: SyncJobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error_code: ErrorCode,
        error_message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
        timestamp: i64,
    },
    Close {
        reason: String,
        code: u16,
        timestamp: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_envelope_parses_auth() {
        let json = r#"{"type":"auth","token":"abc","timestamp":123}"#;
        let parsed: ClientEnvelope = serde_json::from_str(json).unwrap();
        match parsed {
            ClientEnvelope::Auth { token, timestamp } => {
                assert_eq!(token, "abc");
                assert_eq!(timestamp, 123);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_unknown_type_fails_loudly() {
        let json = r#"{"type":"teleport","timestamp":1}"#;
        assert!(serde_json::from_str::<ClientEnvelope>(json).is_err());
    }

    #[test]
    fn test_handshake_serialization() {
        let envelope = ServerEnvelope::Handshake {
            server_id: "scribe-1".to_string(),
            protocol_version: 1,
            connection_id: "conn-1".to_string(),
            timestamp: 42,
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"type\":\"handshake\""));
        assert!(json.contains("\"protocolVersion\":1"));
        assert!(json.contains("\"connectionId\":\"conn-1\""));
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(CLOSE_AUTH_TIMEOUT, 4000);
        assert_eq!(CLOSE_AUTH_FAILED, 4001);
        assert_eq!(CLOSE_HEARTBEAT_TIMEOUT, 4002);
        assert_eq!(CLOSE_PROTOCOL_MISMATCH, 4003);
    }
}

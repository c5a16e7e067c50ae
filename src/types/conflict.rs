//! Conflict records produced by the conflict engine.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use super::OperationKind;
use crate::types::EntityKind;

/// Closed set of conflict classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    ConcurrentUpdate,
    DeleteVsUpdate,
    UpdateVsDelete,
    Rename,
    FolderMove,
    ParentMissing,
    UniqueViolation,
    VersionMismatch,
}

impl ConflictKind {
    /// Wire identifier, also used as the histogram key in stats.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::ConcurrentUpdate => "concurrent-update",
            ConflictKind::DeleteVsUpdate => "delete-vs-update",
            ConflictKind::UpdateVsDelete => "update-vs-delete",
            ConflictKind::Rename => "rename",
            ConflictKind::FolderMove => "folder-move",
            ConflictKind::ParentMissing => "parent-missing",
            ConflictKind::UniqueViolation => "unique-violation",
            ConflictKind::VersionMismatch => "version-mismatch",
        }
    }
}

/// Closed set of resolution strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    ServerWins,
    ClientWins,
    LatestWins,
    Merge,
    /// Rename only: keep the client title with a disambiguating suffix.
    AppendSuffix,
    Manual,
}

impl ResolutionStrategy {
    /// Parse a wire identifier. Unknown values are an explicit error,
    /// never a silent default.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "server-wins" => Some(ResolutionStrategy::ServerWins),
            "client-wins" => Some(ResolutionStrategy::ClientWins),
            "latest-wins" => Some(ResolutionStrategy::LatestWins),
            "merge" => Some(ResolutionStrategy::Merge),
            "append-suffix" => Some(ResolutionStrategy::AppendSuffix),
            "manual" => Some(ResolutionStrategy::Manual),
            _ => None,
        }
    }
}

/// Lifecycle status of a conflict record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Unresolved,
    Resolved,
    Ignored,
}

/// Server-side state captured at detection time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSnapshot {
    pub version: i64,
    pub payload: Map<String, Value>,
    pub modified_at: i64,
    /// Client id of the last writer when known, otherwise "server".
    pub modified_by: String,
    pub deleted: bool,
}

/// Client-proposed state captured at detection time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSnapshot {
    /// The server version the client claims to have derived its edit from.
    pub from_version: i64,
    pub payload: Map<String, Value>,
    pub modified_at: i64,
    pub operation_kind: OperationKind,
}

/// Recorded outcome of a successful resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    pub payload: Map<String, Value>,
    pub resolved_at: i64,
}

/// A divergence the server could not silently apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub conflict_id: String,
    pub user_id: i64,
    pub kind: ConflictKind,
    pub entity_kind: EntityKind,
    pub entity_id: i64,
    pub operation_id: String,
    pub server: ServerSnapshot,
    pub client: ClientSnapshot,
    /// Field names whose canonicalized values differ between the sides.
    pub conflict_fields: Vec<String>,
    pub suggested_strategy: ResolutionStrategy,
    pub status: ConflictStatus,
    pub detected_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
}

/// Result of executing a resolution strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionOutcome {
    pub success: bool,
    /// Present when `success`; the payload the winning side produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_payload: Option<Map<String, Value>>,
    pub new_version: i64,
    /// True when the strategy was `manual` and user adjudication is needed.
    #[serde(default)]
    pub manual_required: bool,
}

impl ResolutionOutcome {
    /// The outcome for a `manual` strategy: nothing happens.
    pub fn manual(server_version: i64) -> Self {
        Self {
            success: false,
            resolved_payload: None,
            new_version: server_version,
            manual_required: true,
        }
    }
}

/// Registry counters returned by the stats endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictStats {
    pub total: u64,
    pub unresolved: u64,
    pub resolved: u64,
    pub ignored: u64,
    pub by_kind: HashMap<String, u64>,
}

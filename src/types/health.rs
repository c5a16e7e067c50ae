//! Connection health records used by the fallback manager.

use serde::{Deserialize, Serialize};

use super::sync::ServerUpdate;

/// Health classification for a client's push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Recovering,
}

/// Pull-loop cadence class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullPriority {
    Normal,
    High,
}

/// Per-client connection health record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientHealth {
    pub client_id: String,
    pub user_id: i64,
    pub status: HealthStatus,
    /// Disconnect timestamps within the observation window.
    pub disconnect_times: Vec<i64>,
    pub timeout_count: u32,
    /// Most recent response-time samples, bounded to 100.
    pub response_times: Vec<u64>,
    pub mean_response_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connect_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_disconnect_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_timeout_at: Option<i64>,
    pub needs_fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ClientHealth {
    /// Fresh healthy record for a client.
    pub fn new(client_id: String, user_id: i64) -> Self {
        Self {
            client_id,
            user_id,
            status: HealthStatus::Healthy,
            disconnect_times: Vec::new(),
            timeout_count: 0,
            response_times: Vec::new(),
            mean_response_ms: 0.0,
            last_connect_at: None,
            last_disconnect_at: None,
            last_timeout_at: None,
            needs_fallback: false,
            reason: None,
        }
    }
}

/// Envelope handed to a degraded client's pull callback on each tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollEnvelope {
    pub updates: Vec<ServerUpdate>,
    pub has_more: bool,
    pub server_time: i64,
    pub suggested_next_interval_ms: u64,
}

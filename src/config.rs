use std::env;

use crate::types::{ConflictKind, ResolutionStrategy};

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Identifier this server presents in handshakes.
    pub server_id: String,
    /// SQLite database path.
    pub db_path: String,
    /// Secret used to sign authentication tokens (random if unset).
    pub auth_secret: Option<String>,
    /// Push session settings.
    pub session: SessionConfig,
    /// Sync pipeline settings.
    pub sync: SyncConfig,
    /// Conflict registry settings.
    pub conflicts: ConflictConfig,
    /// Connection health thresholds.
    pub health: HealthConfig,
    /// Pull-loop cadence bounds.
    pub polling: PollingConfig,
    /// Per-kind suggested resolution strategies.
    pub policy: ConflictPolicy,
}

/// Push session lifecycle settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between server-initiated pings (ms).
    pub heartbeat_interval_ms: u64,
    /// Silence threshold before a session is closed (ms).
    pub heartbeat_timeout_ms: u64,
    /// Deadline for the first successful auth message (ms).
    pub auth_timeout_ms: u64,
    /// Failed auth attempts tolerated before the session is closed.
    pub max_auth_attempts: u32,
    /// Sessions allowed per user (0 = unbounded).
    pub max_sessions_per_user: usize,
}

/// Sync pipeline settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Wall-clock bound for a whole sync job (ms).
    pub sync_timeout_ms: u64,
    /// Retry attempts for queued operations.
    pub max_retries: u32,
    /// Delay between queued-operation retries (ms).
    pub retry_delay_ms: u64,
    /// Server updates returned per batch.
    pub default_batch_size: usize,
}

/// Conflict registry retention settings.
#[derive(Debug, Clone)]
pub struct ConflictConfig {
    /// Days a conflict record is retained.
    pub retention_days: u32,
    /// Registry size cap; oldest records are evicted beyond it.
    pub max_records: usize,
    /// Bound on a single resolution execution (ms).
    pub resolution_timeout_ms: u64,
}

/// Connection health thresholds.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Disconnects within the window that trigger fallback.
    pub disconnect_threshold: usize,
    /// Observation window for disconnect counting (ms).
    pub disconnect_window_ms: u64,
    /// Response time beyond which a client is degraded (ms).
    pub timeout_threshold_ms: u64,
    /// Delay before automatic fallback exit is attempted (ms).
    pub auto_recovery_delay_ms: u64,
}

/// Pull-loop cadence bounds.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Normal-priority tick interval (ms).
    pub normal_interval_ms: u64,
    /// High-priority tick interval (ms).
    pub high_priority_interval_ms: u64,
    /// Lower clamp for adaptive intervals (ms).
    pub min_interval_ms: u64,
    /// Upper clamp for adaptive intervals (ms).
    pub max_interval_ms: u64,
}

/// Per-kind suggested resolution strategies.
#[derive(Debug, Clone)]
pub struct ConflictPolicy {
    pub concurrent_update: ResolutionStrategy,
    pub delete_vs_update: ResolutionStrategy,
    pub update_vs_delete: ResolutionStrategy,
    pub rename: ResolutionStrategy,
    pub folder_move: ResolutionStrategy,
    pub parent_missing: ResolutionStrategy,
    pub unique_violation: ResolutionStrategy,
    pub version_mismatch: ResolutionStrategy,
}

impl ConflictPolicy {
    /// Suggested strategy for a conflict kind.
    pub fn suggested_for(&self, kind: ConflictKind) -> ResolutionStrategy {
        match kind {
            ConflictKind::ConcurrentUpdate => self.concurrent_update,
            ConflictKind::DeleteVsUpdate => self.delete_vs_update,
            ConflictKind::UpdateVsDelete => self.update_vs_delete,
            ConflictKind::Rename => self.rename,
            ConflictKind::FolderMove => self.folder_move,
            ConflictKind::ParentMissing => self.parent_missing,
            ConflictKind::UniqueViolation => self.unique_violation,
            ConflictKind::VersionMismatch => self.version_mismatch,
        }
    }
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self {
            concurrent_update: ResolutionStrategy::LatestWins,
            delete_vs_update: ResolutionStrategy::ServerWins,
            update_vs_delete: ResolutionStrategy::LatestWins,
            rename: ResolutionStrategy::AppendSuffix,
            folder_move: ResolutionStrategy::LatestWins,
            parent_missing: ResolutionStrategy::Manual,
            unique_violation: ResolutionStrategy::Manual,
            version_mismatch: ResolutionStrategy::LatestWins,
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_strategy(key: &str, default: ResolutionStrategy) -> ResolutionStrategy {
    env::var(key)
        .ok()
        .and_then(|v| ResolutionStrategy::parse(&v))
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = ConflictPolicy::default();

        Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3002),
            server_id: env::var("SERVER_ID").unwrap_or_else(|_| "scribe".to_string()),
            db_path: env::var("DB_PATH").unwrap_or_else(|_| "scribe.db".to_string()),
            auth_secret: env::var("AUTH_SECRET").ok(),
            session: SessionConfig {
                heartbeat_interval_ms: env_u64("HEARTBEAT_INTERVAL_MS", 30_000),
                heartbeat_timeout_ms: env_u64("HEARTBEAT_TIMEOUT_MS", 60_000),
                auth_timeout_ms: env_u64("AUTH_TIMEOUT_MS", 5_000),
                max_auth_attempts: env_u64("MAX_AUTH_ATTEMPTS", 3) as u32,
                max_sessions_per_user: env_usize("MAX_SESSIONS_PER_USER", 0),
            },
            sync: SyncConfig {
                sync_timeout_ms: env_u64("SYNC_TIMEOUT_MS", 60_000),
                max_retries: env_u64("MAX_RETRIES", 3) as u32,
                retry_delay_ms: env_u64("RETRY_DELAY_MS", 1_000),
                default_batch_size: env_usize("DEFAULT_BATCH_SIZE", 100),
            },
            conflicts: ConflictConfig {
                retention_days: env_u64("CONFLICT_RETENTION_DAYS", 30) as u32,
                max_records: env_usize("MAX_CONFLICT_RECORDS", 1_000),
                resolution_timeout_ms: env_u64("CONFLICT_RESOLUTION_TIMEOUT_MS", 30_000),
            },
            health: HealthConfig {
                disconnect_threshold: env_usize("DISCONNECT_THRESHOLD", 3),
                disconnect_window_ms: env_u64("DISCONNECT_TIME_WINDOW_MS", 60_000),
                timeout_threshold_ms: env_u64("TIMEOUT_THRESHOLD_MS", 5_000),
                auto_recovery_delay_ms: env_u64("AUTO_RECOVERY_DELAY_MS", 30_000),
            },
            polling: PollingConfig {
                normal_interval_ms: env_u64("POLL_NORMAL_INTERVAL_MS", 5_000),
                high_priority_interval_ms: env_u64("POLL_HIGH_PRIORITY_INTERVAL_MS", 1_000),
                min_interval_ms: env_u64("POLL_MIN_INTERVAL_MS", 1_000),
                max_interval_ms: env_u64("POLL_MAX_INTERVAL_MS", 30_000),
            },
            policy: ConflictPolicy {
                concurrent_update: env_strategy(
                    "POLICY_CONCURRENT_UPDATE",
                    defaults.concurrent_update,
                ),
                delete_vs_update: env_strategy("POLICY_DELETE_VS_UPDATE", defaults.delete_vs_update),
                update_vs_delete: env_strategy("POLICY_UPDATE_VS_DELETE", defaults.update_vs_delete),
                rename: env_strategy("POLICY_RENAME", defaults.rename),
                folder_move: env_strategy("POLICY_FOLDER_MOVE", defaults.folder_move),
                parent_missing: env_strategy("POLICY_PARENT_MISSING", defaults.parent_missing),
                unique_violation: env_strategy("POLICY_UNIQUE_VIOLATION", defaults.unique_violation),
                version_mismatch: env_strategy("POLICY_VERSION_MISMATCH", defaults.version_mismatch),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_table() {
        let policy = ConflictPolicy::default();
        assert_eq!(
            policy.suggested_for(ConflictKind::ConcurrentUpdate),
            ResolutionStrategy::LatestWins
        );
        assert_eq!(
            policy.suggested_for(ConflictKind::DeleteVsUpdate),
            ResolutionStrategy::ServerWins
        );
        assert_eq!(
            policy.suggested_for(ConflictKind::Rename),
            ResolutionStrategy::AppendSuffix
        );
        assert_eq!(
            policy.suggested_for(ConflictKind::ParentMissing),
            ResolutionStrategy::Manual
        );
    }

    #[test]
    fn test_spec_defaults() {
        let config = Config::from_env();
        assert_eq!(config.session.heartbeat_interval_ms, 30_000);
        assert_eq!(config.session.heartbeat_timeout_ms, 60_000);
        assert_eq!(config.sync.sync_timeout_ms, 60_000);
        assert_eq!(config.conflicts.retention_days, 30);
        assert_eq!(config.conflicts.max_records, 1_000);
        assert_eq!(config.health.disconnect_threshold, 3);
        assert_eq!(config.polling.normal_interval_ms, 5_000);
    }
}

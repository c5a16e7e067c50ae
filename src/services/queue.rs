//! Operations queue for work the coordinator cannot apply synchronously.
//!
//! Failed operations are rescheduled with a delay until the retry budget
//! runs out; the coordinator drives processing passes.

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::types::{QueueStats, QueuedOperation, QueuedOperationStatus, SyncOperation};

/// In-memory operations queue.
pub struct OperationQueue {
    items: DashMap<String, QueuedOperation>,
    max_retries: u32,
    retry_delay_ms: u64,
}

impl OperationQueue {
    /// Create a queue with the given retry budget and delay.
    pub fn new(max_retries: u32, retry_delay_ms: u64) -> Self {
        Self {
            items: DashMap::new(),
            max_retries,
            retry_delay_ms,
        }
    }

    /// Enqueue an operation for deferred execution.
    pub fn enqueue(
        &self,
        user_id: i64,
        client_id: &str,
        operation: SyncOperation,
    ) -> QueuedOperation {
        let now = chrono::Utc::now().timestamp_millis();
        let item = QueuedOperation {
            id: Uuid::new_v4().to_string(),
            user_id,
            client_id: client_id.to_string(),
            operation,
            status: QueuedOperationStatus::Pending,
            retry_count: 0,
            created_at: now,
            scheduled_at: now,
            attempted_at: None,
            completed_at: None,
            error: None,
        };
        debug!("Queued operation {} for user {}", item.id, user_id);
        self.items.insert(item.id.clone(), item.clone());
        item
    }

    /// All of a user's queued operations, oldest first.
    pub fn list(&self, user_id: i64) -> Vec<QueuedOperation> {
        let mut items: Vec<QueuedOperation> = self
            .items
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.clone())
            .collect();
        items.sort_by_key(|i| i.created_at);
        items
    }

    /// Cancel a single pending operation.
    pub fn cancel(&self, user_id: i64, id: &str) -> bool {
        if let Some(mut entry) = self.items.get_mut(id) {
            if entry.user_id == user_id && entry.status == QueuedOperationStatus::Pending {
                entry.status = QueuedOperationStatus::Cancelled;
                entry.completed_at = Some(chrono::Utc::now().timestamp_millis());
                return true;
            }
        }
        false
    }

    /// Cancel every pending operation for a user, returning the count.
    pub fn cancel_all(&self, user_id: i64) -> usize {
        let now = chrono::Utc::now().timestamp_millis();
        let mut cancelled = 0;
        for mut entry in self.items.iter_mut() {
            if entry.user_id == user_id && entry.status == QueuedOperationStatus::Pending {
                entry.status = QueuedOperationStatus::Cancelled;
                entry.completed_at = Some(now);
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Pending operations whose schedule has come due, oldest first.
    /// Marks them processing before returning.
    pub fn take_due(&self, user_id: i64, limit: usize) -> Vec<QueuedOperation> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut due: Vec<QueuedOperation> = Vec::new();
        for mut entry in self.items.iter_mut() {
            if due.len() >= limit {
                break;
            }
            if entry.user_id == user_id
                && entry.status == QueuedOperationStatus::Pending
                && entry.scheduled_at <= now
            {
                entry.status = QueuedOperationStatus::Processing;
                entry.attempted_at = Some(now);
                due.push(entry.clone());
            }
        }
        due.sort_by_key(|i| i.created_at);
        due
    }

    /// Mark a processing operation completed.
    pub fn complete(&self, id: &str) {
        if let Some(mut entry) = self.items.get_mut(id) {
            entry.status = QueuedOperationStatus::Completed;
            entry.completed_at = Some(chrono::Utc::now().timestamp_millis());
            entry.error = None;
        }
    }

    /// Record a failure: reschedule with the retry delay, or fail
    /// permanently once the retry budget is spent.
    pub fn fail(&self, id: &str, error: &str) {
        if let Some(mut entry) = self.items.get_mut(id) {
            entry.retry_count += 1;
            entry.error = Some(error.to_string());
            if entry.retry_count > self.max_retries {
                entry.status = QueuedOperationStatus::Failed;
                entry.completed_at = Some(chrono::Utc::now().timestamp_millis());
                debug!("Operation {} failed permanently: {}", id, error);
            } else {
                entry.status = QueuedOperationStatus::Pending;
                entry.scheduled_at = chrono::Utc::now().timestamp_millis()
                    + self.retry_delay_ms as i64 * entry.retry_count as i64;
            }
        }
    }

    /// Reset a failed operation to pending for another attempt.
    pub fn reset_failed(&self, user_id: i64, id: &str) -> bool {
        if let Some(mut entry) = self.items.get_mut(id) {
            if entry.user_id == user_id && entry.status == QueuedOperationStatus::Failed {
                entry.status = QueuedOperationStatus::Pending;
                entry.retry_count = 0;
                entry.scheduled_at = chrono::Utc::now().timestamp_millis();
                entry.completed_at = None;
                entry.error = None;
                return true;
            }
        }
        false
    }

    /// Users that currently have pending operations, for the background
    /// processing pass.
    pub fn users_with_pending(&self) -> Vec<i64> {
        let mut users: Vec<i64> = self
            .items
            .iter()
            .filter(|e| e.status == QueuedOperationStatus::Pending)
            .map(|e| e.user_id)
            .collect();
        users.sort_unstable();
        users.dedup();
        users
    }

    /// Counters for a user's queue.
    pub fn stats(&self, user_id: i64) -> QueueStats {
        let mut stats = QueueStats::default();
        for entry in self.items.iter() {
            if entry.user_id != user_id {
                continue;
            }
            match entry.status {
                QueuedOperationStatus::Pending => stats.pending += 1,
                QueuedOperationStatus::Processing => stats.processing += 1,
                QueuedOperationStatus::Completed => stats.completed += 1,
                QueuedOperationStatus::Failed => stats.failed += 1,
                QueuedOperationStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }
}

//! Fallback manager: push-health tracking, degradation to periodic pull,
//! and recovery back to push.
//!
//! The supervisor feeds this service connection events; when a client's
//! health crosses the configured thresholds the manager flips it to pull
//! mode and drives the coordinator on a timer until the client reconnects
//! cleanly.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{HealthConfig, PollingConfig};
use crate::services::SyncCoordinator;
use crate::types::{ClientHealth, HealthStatus, PollEnvelope, PullPriority};

/// Bounded response-time sample buffer length.
const RESPONSE_SAMPLE_LIMIT: usize = 100;

/// Callback a degraded client's pull loop delivers batches to.
pub type PullSink = Arc<dyn Fn(PollEnvelope) + Send + Sync>;

struct PullLoop {
    task: JoinHandle<()>,
    priority: PullPriority,
}

/// Per-client health tracking and pull-loop management.
#[derive(Clone)]
pub struct FallbackManager {
    config: HealthConfig,
    polling: PollingConfig,
    coordinator: Arc<SyncCoordinator>,
    health: Arc<DashMap<String, ClientHealth>>,
    pull_loops: Arc<DashMap<String, PullLoop>>,
    /// Pull cursor per client; advanced on every delivered tick.
    cursors: Arc<DashMap<String, i64>>,
    sinks: Arc<DashMap<String, PullSink>>,
}

impl FallbackManager {
    /// Create a new fallback manager.
    pub fn new(
        config: HealthConfig,
        polling: PollingConfig,
        coordinator: Arc<SyncCoordinator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            polling,
            coordinator,
            health: Arc::new(DashMap::new()),
            pull_loops: Arc::new(DashMap::new()),
            cursors: Arc::new(DashMap::new()),
            sinks: Arc::new(DashMap::new()),
        })
    }

    /// Install the callback a client's pull loop delivers to. Ticks
    /// without a sink do not advance the cursor.
    pub fn set_sink(&self, client_id: &str, sink: PullSink) {
        self.sinks.insert(client_id.to_string(), sink);
    }

    fn entry(
        &self,
        client_id: &str,
        user_id: i64,
    ) -> dashmap::mapref::one::RefMut<'_, String, ClientHealth> {
        let mut entry = self
            .health
            .entry(client_id.to_string())
            .or_insert_with(|| ClientHealth::new(client_id.to_string(), user_id));
        if entry.user_id == 0 {
            entry.user_id = user_id;
        }
        entry
    }

    // =========================================================================
    // Health events
    // =========================================================================

    /// A push session authenticated for this client.
    pub fn record_connection(&self, client_id: &str, user_id: i64) {
        let was_degraded = {
            let mut health = self.entry(client_id, user_id);
            let was_degraded = health.needs_fallback || health.status == HealthStatus::Degraded;
            health.last_connect_at = Some(chrono::Utc::now().timestamp_millis());
            health.needs_fallback = false;
            health.reason = None;
            health.status = if was_degraded {
                HealthStatus::Recovering
            } else {
                HealthStatus::Healthy
            };
            was_degraded
        };

        if was_degraded {
            info!("Client {} reconnected; leaving fallback", client_id);
            self.stop_pull_loop(client_id);
        }
    }

    /// One successful heartbeat completes recovery.
    pub fn note_heartbeat(&self, client_id: &str) {
        if let Some(mut health) = self.health.get_mut(client_id) {
            if health.status == HealthStatus::Recovering {
                health.status = HealthStatus::Healthy;
                debug!("Client {} recovered", client_id);
            }
        }
    }

    /// A push session for this client dropped.
    pub fn record_disconnection(&self, client_id: &str, user_id: i64, reason: &str) {
        let now = chrono::Utc::now().timestamp_millis();
        let window_start = now - self.config.disconnect_window_ms as i64;

        let degrade = {
            let mut health = self.entry(client_id, user_id);
            health.last_disconnect_at = Some(now);
            health.disconnect_times.push(now);
            health.disconnect_times.retain(|&t| t >= window_start);
            health.disconnect_times.len() >= self.config.disconnect_threshold
        };

        if degrade {
            self.degrade(
                client_id,
                user_id,
                &format!(
                    "{} disconnects within window: {}",
                    self.config.disconnect_threshold, reason
                ),
            );
        }
    }

    /// A request or heartbeat for this client timed out.
    pub fn record_timeout(&self, client_id: &str, user_id: i64, duration_ms: u64) {
        let (over_threshold, mean) = {
            let mut health = self.entry(client_id, user_id);
            health.timeout_count += 1;
            health.last_timeout_at = Some(chrono::Utc::now().timestamp_millis());
            Self::push_sample(&mut health, duration_ms);
            (
                duration_ms > self.config.timeout_threshold_ms
                    || health.mean_response_ms > self.config.timeout_threshold_ms as f64,
                health.mean_response_ms,
            )
        };

        if over_threshold {
            self.degrade(
                client_id,
                user_id,
                &format!(
                    "slow responses (last {} ms, mean {:.0} ms)",
                    duration_ms, mean
                ),
            );
        }
    }

    /// Record a response-time sample without any degradation decision.
    pub fn record_response_time(&self, client_id: &str, user_id: i64, duration_ms: u64) {
        let mut health = self.entry(client_id, user_id);
        Self::push_sample(&mut health, duration_ms);
    }

    fn push_sample(health: &mut ClientHealth, duration_ms: u64) {
        health.response_times.push(duration_ms);
        if health.response_times.len() > RESPONSE_SAMPLE_LIMIT {
            let excess = health.response_times.len() - RESPONSE_SAMPLE_LIMIT;
            health.response_times.drain(..excess);
        }
        health.mean_response_ms =
            health.response_times.iter().sum::<u64>() as f64 / health.response_times.len() as f64;
    }

    fn degrade(&self, client_id: &str, user_id: i64, reason: &str) {
        let newly_degraded = {
            let mut health = self.entry(client_id, user_id);
            let newly = !health.needs_fallback;
            health.status = HealthStatus::Degraded;
            health.needs_fallback = true;
            health.reason = Some(reason.to_string());
            newly
        };

        if newly_degraded {
            warn!("Client {} degraded: {}", client_id, reason);
            self.start_pull_loop(client_id, user_id, PullPriority::Normal);
            self.schedule_auto_recovery(client_id.to_string());
        }
    }

    fn schedule_auto_recovery(&self, client_id: String) {
        let manager = self.clone();
        let delay = Duration::from_millis(self.config.auto_recovery_delay_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let still_degraded = manager
                .health
                .get(&client_id)
                .map(|h| h.needs_fallback)
                .unwrap_or(false);
            if still_degraded {
                info!(
                    "Auto-recovery window elapsed for {}; exiting fallback",
                    client_id
                );
                manager.exit_fallback(&client_id);
            }
        });
    }

    /// Pure fallback decision.
    pub fn needs_fallback(&self, client_id: &str) -> bool {
        self.health
            .get(client_id)
            .map(|h| h.needs_fallback)
            .unwrap_or(false)
    }

    /// Current health record for a client.
    pub fn health_of(&self, client_id: &str) -> Option<ClientHealth> {
        self.health.get(client_id).map(|h| h.clone())
    }

    /// Whether a pull loop is currently running for this client.
    pub fn pull_active(&self, client_id: &str) -> bool {
        self.pull_loops
            .get(client_id)
            .map(|l| !l.task.is_finished())
            .unwrap_or(false)
    }

    // =========================================================================
    // Pull loop
    // =========================================================================

    fn interval_for(&self, priority: PullPriority) -> u64 {
        let base = match priority {
            PullPriority::Normal => self.polling.normal_interval_ms,
            PullPriority::High => self.polling.high_priority_interval_ms,
        };
        base.clamp(self.polling.min_interval_ms, self.polling.max_interval_ms)
    }

    /// Suggested client-side interval: mean response time doubled, clamped
    /// to the configured bounds; the normal default with no samples.
    pub fn suggested_interval(&self, client_id: &str) -> u64 {
        let mean = self
            .health
            .get(client_id)
            .map(|h| h.mean_response_ms)
            .unwrap_or(0.0);
        if mean <= 0.0 {
            return self.polling.normal_interval_ms;
        }
        ((mean * 2.0) as u64).clamp(self.polling.min_interval_ms, self.polling.max_interval_ms)
    }

    /// Start (or reprioritize) the pull loop for a client. Idempotent:
    /// starting at the running priority is a no-op.
    pub fn start_pull_loop(&self, client_id: &str, user_id: i64, priority: PullPriority) {
        if let Some(existing) = self.pull_loops.get(client_id) {
            if existing.priority == priority && !existing.task.is_finished() {
                return;
            }
        }
        self.stop_pull_loop(client_id);

        let interval_ms = self.interval_for(priority);
        self.cursors
            .entry(client_id.to_string())
            .or_insert_with(|| chrono::Utc::now().timestamp_millis());

        info!(
            "Starting {:?}-priority pull loop for {} every {} ms",
            priority, client_id, interval_ms
        );

        let manager = self.clone();
        let client = client_id.to_string();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.pull_tick(&client, user_id);
            }
        });

        self.pull_loops
            .insert(client_id.to_string(), PullLoop { task, priority });
    }

    /// One pull tick: fetch changes past the cursor, advance it, deliver.
    fn pull_tick(&self, client_id: &str, user_id: i64) {
        let sink = match self.sinks.get(client_id) {
            Some(sink) => sink.clone(),
            None => {
                debug!("Pull tick for {} skipped: no sink installed", client_id);
                return;
            }
        };

        let since = self.cursors.get(client_id).map(|c| *c).unwrap_or(0);
        let now = chrono::Utc::now().timestamp_millis();

        match self.coordinator.poll(user_id, since, None) {
            Ok((updates, has_more)) => {
                self.cursors.insert(client_id.to_string(), now);
                let envelope = PollEnvelope {
                    updates,
                    has_more,
                    server_time: now,
                    suggested_next_interval_ms: self.suggested_interval(client_id),
                };
                sink(envelope);
            }
            Err(e) => {
                warn!("Pull tick for {} failed: {}", client_id, e);
            }
        }
    }

    /// Stop the pull loop for a client. Idempotent.
    pub fn stop_pull_loop(&self, client_id: &str) {
        if let Some((_, pull)) = self.pull_loops.remove(client_id) {
            pull.task.abort();
            debug!("Stopped pull loop for {}", client_id);
        }
    }

    // =========================================================================
    // Administrative hooks
    // =========================================================================

    /// Force a client into fallback regardless of health.
    pub fn force_fallback(&self, client_id: &str, user_id: i64, priority: PullPriority) {
        {
            let mut health = self.entry(client_id, user_id);
            health.status = HealthStatus::Degraded;
            health.needs_fallback = true;
            health.reason = Some("forced".to_string());
        }
        self.start_pull_loop(client_id, user_id, priority);
    }

    /// Exit fallback: stop the pull loop and clear the flag.
    pub fn exit_fallback(&self, client_id: &str) {
        self.stop_pull_loop(client_id);
        if let Some(mut health) = self.health.get_mut(client_id) {
            health.needs_fallback = false;
            health.reason = None;
            if health.status == HealthStatus::Degraded {
                health.status = HealthStatus::Recovering;
            }
        }
    }

    /// Stop every pull loop. Idempotent.
    pub fn shutdown(&self) {
        let clients: Vec<String> = self.pull_loops.iter().map(|e| e.key().clone()).collect();
        for client_id in clients {
            self.stop_pull_loop(&client_id);
        }
    }
}

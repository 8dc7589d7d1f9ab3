//! # Polling Supervisor (C7)
//!
//! Per-agent channel pollers with adaptive backoff. Each agent gets one
//! supervised `tokio::task` that polls its subscribed channels, hands a
//! batch to the caller's handler, and acks every message the handler
//! returned success for. Backoff grows when a poll comes back empty and
//! resets the moment a poll finds work.

use crate::errors::FabricError;
use crate::messaging::{Message, MessageBus};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A caller-registered handler invoked with each non-empty poll batch.
#[async_trait]
pub trait PollingHandler: Send + Sync {
    async fn handle(&self, messages: Vec<Message>) -> Result<(), FabricError>;
}

#[derive(Debug, Default)]
struct AgentStats {
    message_count: AtomicU64,
    error_count: AtomicU64,
    poll_count: AtomicU64,
    success_count: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct PollingStatsSnapshot {
    pub message_count: u64,
    pub error_count: u64,
    pub current_interval_s: f64,
    pub success_rate: f64,
}

struct PollerHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<AgentStats>,
    current_interval: Arc<std::sync::Mutex<f64>>,
}

#[derive(Debug, Clone)]
pub struct PollingSupervisor {
    bus: MessageBus,
    pollers: Arc<DashMap<String, PollerHandleDebug>>,
}

// `JoinHandle`/`watch::Sender` aren't `Debug` in a useful way; wrap so the
// supervisor itself can still derive `Debug` for its own diagnostics.
struct PollerHandleDebug(PollerHandle);
impl std::fmt::Debug for PollerHandleDebug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller").finish()
    }
}

impl PollingSupervisor {
    pub fn new(bus: MessageBus) -> Self {
        Self {
            bus,
            pollers: Arc::new(DashMap::new()),
        }
    }

    /// Spawn a poller loop for `agent` across `channels`. On stop, the
    /// previous poller for this agent (if any) is cancelled and joined
    /// first.
    pub async fn start_polling(
        &self,
        agent: &str,
        channels: Vec<String>,
        handler: Arc<dyn PollingHandler>,
        base_interval_s: u64,
        max_interval_s: u64,
        backoff_factor: f64,
        batch_size: i64,
    ) {
        self.stop_polling(agent).await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let stats = Arc::new(AgentStats::default());
        let current_interval = Arc::new(std::sync::Mutex::new(base_interval_s as f64));

        let bus = self.bus.clone();
        let agent_owned = agent.to_string();
        let stats_clone = stats.clone();
        let interval_clone = current_interval.clone();

        let join = tokio::spawn(async move {
            poll_loop(
                bus,
                agent_owned,
                channels,
                handler,
                base_interval_s as f64,
                max_interval_s as f64,
                backoff_factor,
                batch_size,
                stats_clone,
                interval_clone,
                stop_rx,
            )
            .await;
        });

        self.pollers.insert(
            agent.to_string(),
            PollerHandleDebug(PollerHandle {
                stop_tx,
                join,
                stats,
                current_interval,
            }),
        );
    }

    /// Cancel `agent`'s loop and wait for it to return.
    pub async fn stop_polling(&self, agent: &str) {
        if let Some((_, handle)) = self.pollers.remove(agent) {
            let _ = handle.0.stop_tx.send(true);
            let _ = handle.0.join.await;
        }
    }

    pub async fn stop_all(&self) {
        let agents: Vec<String> = self.pollers.iter().map(|e| e.key().clone()).collect();
        for agent in agents {
            self.stop_polling(&agent).await;
        }
    }

    pub fn stats(&self, agent: &str) -> Option<PollingStatsSnapshot> {
        self.pollers.get(agent).map(|entry| {
            let s = &entry.0.stats;
            let polls = s.poll_count.load(Ordering::Relaxed);
            let successes = s.success_count.load(Ordering::Relaxed);
            let success_rate = if polls == 0 { 1.0 } else { successes as f64 / polls as f64 };
            PollingStatsSnapshot {
                message_count: s.message_count.load(Ordering::Relaxed),
                error_count: s.error_count.load(Ordering::Relaxed),
                current_interval_s: *entry.0.current_interval.lock().unwrap(),
                success_rate,
            }
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn poll_loop(
    bus: MessageBus,
    agent: String,
    channels: Vec<String>,
    handler: Arc<dyn PollingHandler>,
    base_interval_s: f64,
    max_interval_s: f64,
    backoff_factor: f64,
    batch_size: i64,
    stats: Arc<AgentStats>,
    current_interval: Arc<std::sync::Mutex<f64>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        if *stop_rx.borrow() {
            return;
        }

        stats.poll_count.fetch_add(1, Ordering::Relaxed);
        let mut all_messages = Vec::new();
        for channel in &channels {
            if *stop_rx.borrow() {
                return;
            }

            match bus.poll(channel, &agent, batch_size, false).await {
                Ok(messages) => all_messages.extend(messages),
                Err(e) => {
                    stats.error_count.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, agent, channel, "poll failed");
                }
            }
        }

        let received_any = !all_messages.is_empty();
        if received_any {
            stats.message_count.fetch_add(all_messages.len() as u64, Ordering::Relaxed);
            match handler.handle(all_messages.clone()).await {
                Ok(()) => {
                    stats.success_count.fetch_add(1, Ordering::Relaxed);
                    for msg in &all_messages {
                        if let Err(e) = bus.ack(msg.id, &agent).await {
                            warn!(error = %e, message_id = msg.id, "failed to ack after handler success");
                        }
                    }
                }
                Err(e) => {
                    stats.error_count.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, agent, "poll handler failed");
                }
            }
        }

        let sleep_for = {
            let mut interval = current_interval.lock().unwrap();
            if received_any {
                *interval = base_interval_s;
            } else {
                *interval = (*interval * backoff_factor).min(max_interval_s);
            }
            Duration::from_secs_f64(*interval)
        };

        debug!(agent, sleep_s = sleep_for.as_secs_f64(), "poll loop sleeping");
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return;
                }
            }
        }
    }
}

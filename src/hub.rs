//! # Coordination Hub (C8)
//!
//! Lifecycle owner: constructs every other component from one
//! `FabricConfig`, starts background schedulers, and exposes aggregate
//! health. Nothing outside this module should construct `StoreGateway`,
//! `MessageBus`, etc. directly in application code — `Hub` is the
//! intended entry point.

use crate::cache::ResultCache;
use crate::config::FabricConfig;
use crate::errors::FabricResult;
use crate::messaging::MessageBus;
use crate::polling::PollingSupervisor;
use crate::session::SessionStore;
use crate::store::{HealthStatus, StoreGateway};
use crate::subscription::NotificationService;
use crate::tasks::TaskQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Owns the whole coordination fabric graph for one process.
pub struct CoordinationHub {
    pub messages: MessageBus,
    pub cache: Arc<ResultCache>,
    pub sessions: SessionStore,
    pub tasks: TaskQueue,
    pub notifications: NotificationService,
    pub polling: PollingSupervisor,
    store: Arc<StoreGateway>,
    cleanup_interval: Duration,
    cleanup_stop: Option<watch::Sender<bool>>,
    cleanup_handle: Option<JoinHandle<()>>,
}

impl CoordinationHub {
    /// Construct the whole graph: pool, then every component, leaf-first.
    pub async fn new(config: FabricConfig) -> FabricResult<Self> {
        let store = Arc::new(StoreGateway::connect(&config).await?);
        let messages = MessageBus::new(store.clone());
        let cache = Arc::new(ResultCache::new(store.clone()));
        let sessions = SessionStore::new(store.clone());
        let tasks = TaskQueue::new(store.clone(), &config);
        let notifications = NotificationService::new(store.clone());
        let polling = PollingSupervisor::new(messages.clone());

        Ok(Self {
            messages,
            cache,
            sessions,
            tasks,
            notifications,
            polling,
            store,
            cleanup_interval: Duration::from_secs(config.cleanup_interval_s),
            cleanup_stop: None,
            cleanup_handle: None,
        })
    }

    /// Boot background work: the cache cleanup scheduler and subscription
    /// rehydration. The polling supervisor stays passive until callers
    /// register pollers via `self.polling.start_polling`.
    pub async fn start(&mut self) -> FabricResult<()> {
        let rehydrated = self.notifications.rehydrate().await?;
        info!(rehydrated, "rehydrated persisted subscriptions");

        let (stop_tx, stop_rx) = watch::channel(false);
        let cache = self.cache.clone();
        let interval = self.cleanup_interval;
        let handle = tokio::spawn(async move {
            cache.run_cleanup_loop(interval, stop_rx).await;
        });

        self.cleanup_stop = Some(stop_tx);
        self.cleanup_handle = Some(handle);
        info!("coordination hub started");
        Ok(())
    }

    /// Tear down in reverse: stop all pollers, stop the cache scheduler,
    /// close the pool.
    pub async fn stop(&mut self) {
        self.polling.stop_all().await;

        if let Some(stop_tx) = self.cleanup_stop.take() {
            let _ = stop_tx.send(true);
        }
        if let Some(handle) = self.cleanup_handle.take() {
            let _ = handle.await;
        }

        self.store.pool().close().await;
        info!("coordination hub stopped");
    }

    pub async fn health_check(&self) -> HealthStatus {
        self.store.health_check().await
    }
}

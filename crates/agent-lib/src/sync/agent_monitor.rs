//! AgentInfo synchronization loops
//!
//! `AgentMonitor` owns the IP cache and the reconciliation queue. It runs
//! three loops until shutdown:
//! - the learning consumer, folding learned addresses into the IP cache
//! - a periodic ticker, enqueueing an unconditional sync
//! - a single worker, draining the queue and persisting AgentInfo

use super::merge::{merge_agent_info, should_sync_on_learn};
use super::queue::RateLimitingQueue;
use super::store::{AgentInfoIndex, AgentInfoStore, StoreError};
use crate::builder::{build_agent_info, BuildError};
use crate::health::{components, HealthRegistry};
use crate::ipcache::{IpCache, LearnedAddresses};
use crate::models::AgentInfo;
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::ovsdb::OvsdbMonitor;
use anyhow::Result;
use chrono::Utc;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for the AgentInfo sync loops
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Unconditional sync interval (default: 60 seconds)
    pub sync_interval: Duration,
    /// Delay before retrying a failed sync (default: 1 second)
    pub retry_delay: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(60),
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Failure of one sync attempt
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("couldn't build agentinfo: {0}")]
    Build(#[from] BuildError),

    #[error("couldn't fetch agentinfo {name}: {source}")]
    Get {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("couldn't create agentinfo {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("couldn't update agentinfo {name}: {source}")]
    Update {
        name: String,
        #[source]
        source: StoreError,
    },
}

impl SyncError {
    /// A race with another writer, resolved by retrying shortly
    pub fn is_expected_race(&self) -> bool {
        match self {
            SyncError::Create { source, .. } => source.is_already_exists(),
            SyncError::Update { source, .. } => source.is_conflict(),
            _ => false,
        }
    }
}

/// What a successful sync did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    Updated,
}

/// Publishes this node's AgentInfo and keeps it current
pub struct AgentMonitor {
    name: String,
    config: MonitorConfig,
    store: Arc<dyn AgentInfoStore>,
    index: Option<Arc<dyn AgentInfoIndex>>,
    ovsdb: Arc<OvsdbMonitor>,
    ip_cache: Arc<IpCache>,
    queue: Arc<RateLimitingQueue<String>>,
    health: Option<HealthRegistry>,
    metrics: AgentMetrics,
    logger: StructuredLogger,
    last_persisted: RwLock<Option<AgentInfo>>,
}

impl AgentMonitor {
    /// Identity of this agent, used as object name and queue key
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<RateLimitingQueue<String>> {
        &self.queue
    }

    pub fn ip_cache(&self) -> &Arc<IpCache> {
        &self.ip_cache
    }

    /// The AgentInfo returned by the store on the last successful sync
    pub fn last_persisted(&self) -> Option<AgentInfo> {
        self.last_persisted
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run every loop until shutdown
    pub async fn run(
        self: Arc<Self>,
        learned: mpsc::Receiver<LearnedAddresses>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            agent = %self.name,
            interval_secs = self.config.sync_interval.as_secs(),
            "Starting AgentInfo monitor"
        );

        if let Some(health) = &self.health {
            health.register(components::AGENTINFO_SYNC).await;
            health.register(components::IP_LEARNING).await;
        }

        // Latched stop flag, also seen by loops first polled after it is set
        let (stop_tx, stop_rx) = watch::channel(false);
        let learning = tokio::spawn(Arc::clone(&self).learning_loop(learned, stop_rx.clone()));
        let ticker = tokio::spawn(Arc::clone(&self).ticker_loop(stop_rx));
        let worker = tokio::spawn(Arc::clone(&self).worker_loop());

        let _ = shutdown.recv().await;
        info!(agent = %self.name, "Shutting down AgentInfo monitor");
        self.queue.shut_down();
        let _ = stop_tx.send(true);

        for (task, handle) in [("learning", learning), ("ticker", ticker), ("worker", worker)] {
            if let Err(e) = handle.await {
                debug!(task = task, error = %e, "AgentInfo monitor task ended abnormally");
            }
        }
    }

    async fn learning_loop(
        self: Arc<Self>,
        mut learned: mpsc::Receiver<LearnedAddresses>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                batch = learned.recv() => {
                    match batch {
                        Some(batch) => self.update_ofport_ip_addresses(&batch).await,
                        None => {
                            warn!("Address learning channel closed");
                            if let Some(health) = &self.health {
                                health
                                    .set_unhealthy(components::IP_LEARNING, "learning channel closed")
                                    .await;
                            }
                            break;
                        }
                    }
                }
                _ = stop.changed() => break,
            }
        }
    }

    async fn ticker_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.queue.add(self.name.clone()),
                _ = stop.changed() => break,
            }
        }
    }

    async fn worker_loop(self: Arc<Self>) {
        while self.process_next_item().await {}
        debug!("AgentInfo sync worker stopped");
    }

    /// Handle one queue item. Returns false once the queue has shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let start = Instant::now();
        let result = self.sync_agent_info().await;
        self.metrics
            .observe_sync_latency(start.elapsed().as_secs_f64());

        match result {
            Ok(_) => {
                self.queue.forget(&key);
                self.metrics.inc_sync_success();
                if let Some(health) = &self.health {
                    health.set_healthy(components::AGENTINFO_SYNC).await;
                }
            }
            Err(e) => {
                self.queue.add_after(key.clone(), self.config.retry_delay);
                let expected = e.is_expected_race();
                self.metrics.inc_sync_failure(expected);
                self.logger.log_sync_failure(&self.name, &e, expected);
                if let Some(health) = &self.health {
                    health
                        .set_degraded(components::AGENTINFO_SYNC, e.to_string())
                        .await;
                }
            }
        }

        self.queue.done(&key);
        true
    }

    /// Fold a learning batch into the IP cache and enqueue a sync when an
    /// address is not yet reflected in the persisted AgentInfo.
    ///
    /// The decision is made while still holding the cache lock, so a sync
    /// can not drain a cache that misses this batch.
    pub async fn update_ofport_ip_addresses(&self, batch: &LearnedAddresses) {
        let mut entries = self.ip_cache.lock().await;
        let stats = entries.learn(batch, Utc::now());
        self.metrics
            .add_addresses_learned(stats.accepted, stats.discarded);
        self.metrics.set_ip_cache_ports(entries.len());

        if stats.discarded > 0 {
            debug!(
                discarded = stats.discarded,
                "Discarded non global unicast addresses"
            );
        }

        let should_sync = match self.fetch_agent_info().await {
            Ok(remote) => should_sync_on_learn(&entries, &remote),
            Err(e) => {
                debug!(agent = %self.name, error = %e, "AgentInfo unavailable, syncing now");
                true
            }
        };

        if should_sync {
            self.queue.add(self.name.clone());
        }
    }

    /// Persisted AgentInfo for this agent, read from the index once it has
    /// synced and from the store otherwise.
    pub async fn fetch_agent_info(&self) -> Result<AgentInfo, StoreError> {
        if let Some(index) = self.index.as_ref().filter(|index| index.has_synced()) {
            return index
                .get_by_key(&self.name)
                .ok_or_else(|| StoreError::NotFound(self.name.clone()));
        }
        self.store.get(&self.name).await
    }

    /// One sync attempt: build, fetch, then create or merge and update.
    ///
    /// The IP cache stays locked for the whole attempt and is cleared only
    /// after the store accepted the object.
    pub async fn sync_agent_info(&self) -> Result<SyncOutcome, SyncError> {
        let mut entries = self.ip_cache.lock().await;

        let mut info = build_agent_info(&self.name, &self.ovsdb, &entries)?;
        self.metrics
            .set_snapshot_size(info.ovs_info.bridges.len(), info.interface_count());

        let (persisted, outcome) = match self.fetch_agent_info().await {
            Err(e) if e.is_not_found() => {
                let created = self.store.create(&info).await.map_err(|source| {
                    SyncError::Create {
                        name: self.name.clone(),
                        source,
                    }
                })?;
                (created, SyncOutcome::Created)
            }
            Err(source) => {
                return Err(SyncError::Get {
                    name: self.name.clone(),
                    source,
                })
            }
            Ok(remote) => {
                merge_agent_info(&mut info, &remote);
                info.metadata = remote.metadata;
                let updated = self.store.update(&info).await.map_err(|source| {
                    SyncError::Update {
                        name: self.name.clone(),
                        source,
                    }
                })?;
                (updated, SyncOutcome::Updated)
            }
        };

        entries.clear();
        self.metrics.set_ip_cache_ports(0);

        self.logger.log_agentinfo_synced(
            &self.name,
            outcome == SyncOutcome::Created,
            persisted.ovs_info.bridges.len(),
            persisted.interface_count(),
            persisted.metadata.resource_version.as_deref(),
        );
        *self
            .last_persisted
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(persisted);

        Ok(outcome)
    }
}

/// Builder for the AgentInfo monitor
pub struct AgentMonitorBuilder {
    name: Option<String>,
    store: Option<Arc<dyn AgentInfoStore>>,
    index: Option<Arc<dyn AgentInfoIndex>>,
    ovsdb: Option<Arc<OvsdbMonitor>>,
    ip_cache: Option<Arc<IpCache>>,
    queue: Option<Arc<RateLimitingQueue<String>>>,
    health: Option<HealthRegistry>,
    config: MonitorConfig,
}

impl AgentMonitorBuilder {
    pub fn new() -> Self {
        Self {
            name: None,
            store: None,
            index: None,
            ovsdb: None,
            ip_cache: None,
            queue: None,
            health: None,
            config: MonitorConfig::default(),
        }
    }

    /// Set the agent identity
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn store(mut self, store: Arc<dyn AgentInfoStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set a read-through index consulted once it has synced
    pub fn index(mut self, index: Arc<dyn AgentInfoIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn ovsdb(mut self, ovsdb: Arc<OvsdbMonitor>) -> Self {
        self.ovsdb = Some(ovsdb);
        self
    }

    pub fn ip_cache(mut self, ip_cache: Arc<IpCache>) -> Self {
        self.ip_cache = Some(ip_cache);
        self
    }

    pub fn queue(mut self, queue: Arc<RateLimitingQueue<String>>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.config.sync_interval = interval;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    /// Build the monitor and point the cache mirror's change triggers at
    /// its queue
    pub fn build(self) -> Result<AgentMonitor> {
        let name = self
            .name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Agent name is required"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("AgentInfo store is required"))?;
        let ovsdb = self
            .ovsdb
            .ok_or_else(|| anyhow::anyhow!("OVSDB monitor is required"))?;
        if self.config.sync_interval.is_zero() {
            anyhow::bail!("Sync interval must be greater than zero");
        }

        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(RateLimitingQueue::new()));
        ovsdb.set_sync_queue(Arc::clone(&queue), name.clone());

        Ok(AgentMonitor {
            logger: StructuredLogger::new(name.clone()),
            name,
            config: self.config,
            store,
            index: self.index,
            ovsdb,
            ip_cache: self.ip_cache.unwrap_or_default(),
            queue,
            health: self.health,
            metrics: AgentMetrics::new(),
            last_persisted: RwLock::new(None),
        })
    }
}

impl Default for AgentMonitorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

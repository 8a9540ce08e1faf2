//! Cache mirror driver
//!
//! Applies table-update notifications to the replicated tables, turns
//! interface changes into endpoint events and requests an AgentInfo sync
//! after every applied batch.

use super::cache::{OvsdbCache, TableUpdates};
use super::endpoint::{collect_endpoints, diff_endpoints, EndpointEvent, EndpointEventHandler};
use crate::health::{components, HealthRegistry};
use crate::observability::AgentMetrics;
use crate::sync::RateLimitingQueue;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Queue and key to notify when the replicated state changes
struct SyncTrigger {
    queue: Arc<RateLimitingQueue<String>>,
    key: String,
}

/// Owner of the replicated switch database tables
pub struct OvsdbMonitor {
    cache: Mutex<OvsdbCache>,
    /// Serializes apply + dispatch so events for a key stay ordered
    dispatch: Mutex<()>,
    handlers: RwLock<Vec<Arc<dyn EndpointEventHandler>>>,
    sync_trigger: RwLock<Option<SyncTrigger>>,
    health: RwLock<Option<HealthRegistry>>,
    metrics: AgentMetrics,
}

impl Default for OvsdbMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl OvsdbMonitor {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(OvsdbCache::new()),
            dispatch: Mutex::new(()),
            handlers: RwLock::new(Vec::new()),
            sync_trigger: RwLock::new(None),
            health: RwLock::new(None),
            metrics: AgentMetrics::new(),
        }
    }

    /// Run `read` against a stable view of every replicated table.
    ///
    /// The cache lock is held for the duration of the call and released on
    /// every exit path, including an early error return from `read`.
    pub fn locked_access<T>(&self, read: impl FnOnce(&OvsdbCache) -> T) -> T {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        read(&cache)
    }

    /// Register a handler for endpoint events
    pub fn register_event_handler(&self, handler: Arc<dyn EndpointEventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Request a sync of `key` on `queue` after every applied batch
    pub fn set_sync_queue(&self, queue: Arc<RateLimitingQueue<String>>, key: impl Into<String>) {
        *self
            .sync_trigger
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(SyncTrigger {
            queue,
            key: key.into(),
        });
    }

    /// Apply one change notification and dispatch the resulting endpoint
    /// events. Returns the dispatched events.
    pub fn apply_table_updates(&self, updates: &TableUpdates) -> Vec<EndpointEvent> {
        let _dispatch = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);

        let events = {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            let before = collect_endpoints(&cache);
            cache.apply(updates);
            let after = collect_endpoints(&cache);
            diff_endpoints(&before, &after)
        };

        if !events.is_empty() {
            let handlers: Vec<_> = self
                .handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for event in &events {
                debug!(
                    interface = %event.key(),
                    kind = event.kind(),
                    "Dispatching endpoint event"
                );
                self.metrics.inc_endpoint_events(event.kind());
                for handler in &handlers {
                    handler.handle(event);
                }
            }
        }

        if let Some(trigger) = self
            .sync_trigger
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            trigger.queue.add(trigger.key.clone());
        }

        events
    }

    /// Report the mirror's state under `ovsdb_monitor`
    pub fn set_health(&self, health: HealthRegistry) {
        *self.health.write().unwrap_or_else(PoisonError::into_inner) = Some(health);
    }

    /// Number of replicated rows across all tables
    pub fn row_count(&self) -> usize {
        self.locked_access(|cache| cache.row_count())
    }

    /// Consume table-update notifications until shutdown or until the
    /// sender side is dropped.
    pub async fn run(
        self: Arc<Self>,
        mut updates: mpsc::Receiver<TableUpdates>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Starting switch database cache mirror");

        loop {
            tokio::select! {
                update = updates.recv() => {
                    match update {
                        Some(update) => {
                            let events = self.apply_table_updates(&update);
                            debug!(
                                tables = update.tables.len(),
                                endpoint_events = events.len(),
                                "Applied table updates"
                            );
                        }
                        None => {
                            warn!("Table update source closed");
                            let health = self
                                .health
                                .read()
                                .unwrap_or_else(PoisonError::into_inner)
                                .clone();
                            if let Some(health) = health {
                                health
                                    .set_unhealthy(components::OVSDB_MONITOR, "table update source closed")
                                    .await;
                            }
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down switch database cache mirror");
                    break;
                }
            }
        }
    }
}

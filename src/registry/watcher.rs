//! Cluster watch driver.
//!
//! Bridges the orchestrator's list/watch protocol onto the registry
//! callbacks. The driver relists on a fixed period (the informer resync),
//! synthesizes tombstone deletes for names that vanished between watch
//! sessions, and feeds live notifications through until the stream ends or
//! shutdown is signalled.
//!
//! ```text
//! relist ──> on_add + on_update per item, tombstone on_delete per vanished name
//!   │
//!   └─> watch ──> ADDED    -> on_add + on_update
//!                 MODIFIED -> on_update
//!                 DELETED  -> on_delete
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::constants::WATCH_RESYNC_PERIOD;
use crate::platform::{object_name, PlatformClient, WatchEventKind, WatchObject};
use crate::registry::ClusterRegistry;

/// Pause before retrying after a failed watch subscription.
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct ClusterWatcher {
    platform: Arc<dyn PlatformClient>,
    registry: Arc<ClusterRegistry>,
    namespace: String,
}

impl ClusterWatcher {
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        registry: Arc<ClusterRegistry>,
        namespace: String,
    ) -> Self {
        Self {
            platform,
            registry,
            namespace,
        }
    }

    /// Runs the list/watch loop until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<()>) {
        info!(namespace = %self.namespace, "Starting cluster watcher");

        // Last-seen object per name, the source of tombstone payloads.
        let mut known: HashMap<String, Value> = HashMap::new();

        loop {
            self.relist(&mut known).await;

            match self.platform.watch_clusters(&self.namespace).await {
                Ok(mut stream) => {
                    let resync = tokio::time::sleep(WATCH_RESYNC_PERIOD);
                    tokio::pin!(resync);

                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => {
                                info!("Cluster watcher shutting down");
                                return;
                            }
                            _ = &mut resync => break,
                            delivery = stream.recv() => match delivery {
                                Some(event) => self.apply(event.kind, event.object, &mut known).await,
                                None => {
                                    warn!(namespace = %self.namespace, "Cluster watch stream ended, relisting");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(namespace = %self.namespace, error = %e, "Failed to open cluster watch");
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
                    }
                }
            }
        }
    }

    /// Reconciles the registry against a fresh list: every current object is
    /// re-announced, and names that disappeared while the watch was down are
    /// deleted via tombstones carrying their last-known payload.
    async fn relist(&self, known: &mut HashMap<String, Value>) {
        let items = match self.platform.list_clusters(&self.namespace).await {
            Ok(items) => items,
            Err(e) => {
                error!(namespace = %self.namespace, error = %e, "Cluster relist failed");
                return;
            }
        };

        let mut seen = HashSet::new();
        for obj in items {
            if let Some(name) = object_name(&obj) {
                seen.insert(name.to_string());
                known.insert(name.to_string(), obj.clone());
            }
            self.registry.on_add(&obj).await;
            self.registry.on_update(&obj).await;
        }

        let vanished: Vec<String> = known
            .keys()
            .filter(|name| !seen.contains(*name))
            .cloned()
            .collect();
        for name in vanished {
            if let Some(last_known) = known.remove(&name) {
                info!(cluster = %name, "Cluster vanished between watch sessions");
                self.registry
                    .on_delete(&WatchObject::Tombstone { last_known })
                    .await;
            }
        }
    }

    async fn apply(
        &self,
        kind: WatchEventKind,
        object: Value,
        known: &mut HashMap<String, Value>,
    ) {
        match kind {
            WatchEventKind::Added => {
                if let Some(name) = object_name(&object) {
                    known.insert(name.to_string(), object.clone());
                }
                self.registry.on_add(&object).await;
                self.registry.on_update(&object).await;
            }
            WatchEventKind::Modified => {
                if let Some(name) = object_name(&object) {
                    known.insert(name.to_string(), object.clone());
                }
                self.registry.on_update(&object).await;
            }
            WatchEventKind::Deleted => {
                if let Some(name) = object_name(&object) {
                    known.remove(name);
                }
                self.registry.on_delete(&WatchObject::Object(object)).await;
            }
        }
    }
}

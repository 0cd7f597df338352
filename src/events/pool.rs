//! Event-watcher pool.
//!
//! One watcher task per cluster that at least one client subscribes to.
//! Lifecycle is refcounted by enumeration, not by back-pointers: the
//! connection layer computes the union of all client watch sets and calls
//! [`EventWatcherPool::reconcile`] with it after every membership change.
//!
//! ```text
//! start_for(C):  seed cache from one-shot list ──> spawn watch task
//! watch task:    platform event ──filter──> broadcast channel ("event")
//! reconcile(S):  cancel watcher + drop cache for every cluster ∉ S
//! ```
//!
//! A watcher whose upstream stream ends on its own keeps its pool entry; it
//! is only ever cleaned up by reconciliation. Restart happens when a later
//! subscription follows a reconcile that removed the stale entry.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::constants::{APP_LABEL, CLUSTER_KIND, CLUSTER_LABEL, OPERATOR_APP};
use crate::events::EventCache;
use crate::message::{ClusterEvent, Message};
use crate::platform::{PlatformClient, PlatformEvent};

pub struct EventWatcherPool {
    watchers: Mutex<HashMap<String, WatcherEntry>>,
    cache: Arc<EventCache>,
    platform: Arc<dyn PlatformClient>,
    broadcast: mpsc::Sender<Message>,
    namespace: String,
}

struct WatcherEntry {
    /// Dropping the sender cancels the watcher task.
    _shutdown: watch::Sender<()>,
}

impl EventWatcherPool {
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        cache: Arc<EventCache>,
        broadcast: mpsc::Sender<Message>,
        namespace: String,
    ) -> Self {
        Self {
            watchers: Mutex::new(HashMap::new()),
            cache,
            platform,
            broadcast,
            namespace,
        }
    }

    pub fn has_watcher(&self, cluster: &str) -> bool {
        self.watchers.lock().unwrap().contains_key(cluster)
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().unwrap().len()
    }

    /// Ensures a watcher is running for `cluster`; idempotent.
    ///
    /// The first caller seeds the cluster's event cache from a one-shot
    /// list (a failed list seeds empty) and spawns the watch task. A failed
    /// watch subscription leaves no pool entry, so a later call retries.
    pub async fn start_for(&self, cluster: &str) {
        let shutdown_rx = {
            let mut watchers = self.watchers.lock().unwrap();
            if watchers.contains_key(cluster) {
                debug!(cluster, "Event watcher already running");
                return;
            }
            // Reserve the slot before any await so concurrent calls for the
            // same cluster cannot both start a watcher.
            let (shutdown_tx, shutdown_rx) = watch::channel(());
            watchers.insert(
                cluster.to_string(),
                WatcherEntry {
                    _shutdown: shutdown_tx,
                },
            );
            shutdown_rx
        };

        let initial = self.initial_events(cluster).await;
        info!(
            cluster,
            initial_event_count = initial.len(),
            "Starting event watcher"
        );
        self.cache.seed(cluster, initial);

        let stream = match self.platform.watch_events(&self.namespace).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(cluster, error = %e, "Failed to subscribe to event watch");
                self.watchers.lock().unwrap().remove(cluster);
                self.cache.remove(cluster);
                return;
            }
        };

        let platform = Arc::clone(&self.platform);
        let broadcast = self.broadcast.clone();
        let cluster = cluster.to_string();
        tokio::spawn(run_watcher(
            platform, broadcast, cluster, stream, shutdown_rx,
        ));
    }

    /// Stops every watcher whose cluster has no subscriber left and frees
    /// that cluster's event cache.
    pub fn reconcile(&self, active: &HashSet<String>) {
        let mut watchers = self.watchers.lock().unwrap();
        let before = watchers.len();

        watchers.retain(|cluster, _entry| {
            if active.contains(cluster) {
                return true;
            }
            self.cache.remove(cluster);
            info!(cluster, "Removed event watcher for inactive cluster");
            false
        });

        let removed = before - watchers.len();
        if removed > 0 {
            info!(
                removed_watchers = removed,
                remaining_watchers = watchers.len(),
                "Cleaned up unused event watchers"
            );
        }
    }

    async fn initial_events(&self, cluster: &str) -> Vec<ClusterEvent> {
        let listed = match self.platform.list_events(&self.namespace).await {
            Ok(listed) => listed,
            Err(e) => {
                error!(cluster, error = %e, "Failed to list initial events");
                return Vec::new();
            }
        };

        let mut initial = Vec::new();
        for event in listed {
            if is_relevant(self.platform.as_ref(), cluster, &event).await {
                initial.push(to_cluster_event(cluster, event));
            }
        }
        initial
    }
}

/// Watch task body: forward relevant platform events onto the broadcast
/// channel until cancelled or the upstream stream ends.
async fn run_watcher(
    platform: Arc<dyn PlatformClient>,
    broadcast: mpsc::Sender<Message>,
    cluster: String,
    mut stream: mpsc::Receiver<PlatformEvent>,
    mut shutdown: watch::Receiver<()>,
) {
    debug!(cluster, "Event watcher task started");
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!(cluster, "Event watcher cancelled");
                break;
            }
            delivery = stream.recv() => match delivery {
                Some(event) => {
                    if !is_relevant(platform.as_ref(), &cluster, &event).await {
                        continue;
                    }
                    debug!(
                        cluster,
                        kind = %event.involved_kind,
                        object = %event.involved_name,
                        "Broadcasting event"
                    );
                    let event = to_cluster_event(&cluster, event);
                    if broadcast.send(Message::Event { event }).await.is_err() {
                        break;
                    }
                }
                None => {
                    warn!(cluster, "Event watch stream ended");
                    break;
                }
            }
        }
    }
    debug!(cluster, "Event watcher task stopped");
}

/// Relevance of a platform event to one cluster.
///
/// Relevant when the involved object is the cluster resource itself, or a
/// pod labeled as belonging to the cluster or to the operator. Deleted pods
/// (NotFound) are silently irrelevant; any other lookup error skips the
/// event.
pub(crate) async fn is_relevant(
    platform: &dyn PlatformClient,
    cluster: &str,
    event: &PlatformEvent,
) -> bool {
    if event.involved_kind == CLUSTER_KIND && event.involved_name == cluster {
        return true;
    }

    if event.involved_kind != "Pod" {
        return false;
    }

    let labels = match platform
        .pod_labels(&event.involved_namespace, &event.involved_name)
        .await
    {
        Ok(labels) => labels,
        Err(e) if e.is_not_found() => return false,
        Err(e) => {
            error!(
                pod = %event.involved_name,
                error = %e,
                "Failed to fetch pod labels, skipping event"
            );
            return false;
        }
    };

    labels.get(CLUSTER_LABEL).map(String::as_str) == Some(cluster)
        || labels.get(APP_LABEL).map(String::as_str) == Some(OPERATOR_APP)
}

fn to_cluster_event(cluster: &str, event: PlatformEvent) -> ClusterEvent {
    ClusterEvent {
        cluster_name: cluster.to_string(),
        name: event.name,
        message: event.message,
        kind: event.involved_kind,
        object_name: event.involved_name,
    }
}

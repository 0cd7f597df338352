//! Cluster registry.
//!
//! Authoritative set of known cluster names and their last-reported
//! conditions. Populated exclusively through the watch callbacks
//! ([`ClusterRegistry::on_add`] / [`on_update`](ClusterRegistry::on_update) /
//! [`on_delete`](ClusterRegistry::on_delete)); read by the dispatcher and
//! the HTTP routes. Every state transition emits the corresponding snapshot
//! onto the shared broadcast channel.
//!
//! All callbacks are defensive: unrecognized payload shapes log a warning
//! and return, they never propagate an error back into the watch binding.

mod watcher;


pub use watcher::ClusterWatcher;

use std::collections::HashSet;
use std::sync::RwLock;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::PlatformError;
use crate::message::{ConditionsSnapshot, Message};
use crate::platform::{
    extract_conditions, has_deletion_marker, object_name, PlatformClient, WatchObject,
};

pub struct ClusterRegistry {
    clusters: RwLock<HashSet<String>>,
    conditions: RwLock<ConditionsSnapshot>,
    broadcast: mpsc::Sender<Message>,
}

impl ClusterRegistry {
    pub fn new(broadcast: mpsc::Sender<Message>) -> Self {
        Self {
            clusters: RwLock::new(HashSet::new()),
            conditions: RwLock::new(ConditionsSnapshot::new()),
            broadcast,
        }
    }

    /// Sorted snapshot of the known cluster names.
    pub fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.read().unwrap().iter().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.clusters.read().unwrap().contains(name)
    }

    /// Copy of the full conditions mapping.
    pub fn conditions_snapshot(&self) -> ConditionsSnapshot {
        self.conditions.read().unwrap().clone()
    }

    /// Watch callback: a cluster object appeared.
    ///
    /// Objects already marked for deletion are ignored. Only a genuinely new
    /// name emits a `clusters` snapshot; re-adds are idempotent.
    pub async fn on_add(&self, obj: &serde_json::Value) {
        let Some(name) = object_name(obj) else {
            warn!("Add delivered an object without a name, skipping");
            return;
        };

        if has_deletion_marker(obj) {
            debug!(cluster = name, "Skipping add for cluster marked for deletion");
            return;
        }

        let inserted = self.clusters.write().unwrap().insert(name.to_string());
        if inserted {
            info!(cluster = name, "Cluster added");
            self.broadcast_clusters().await;
        } else {
            debug!(cluster = name, "Cluster already known");
        }
    }

    /// Watch callback: a cluster object changed; refresh its conditions.
    ///
    /// Updates for names no longer in the registry are dropped (a delete
    /// raced ahead of this update).
    pub async fn on_update(&self, obj: &serde_json::Value) {
        let Some(name) = object_name(obj) else {
            warn!("Update delivered an object without a name, skipping");
            return;
        };

        if !self.contains(name) {
            debug!(cluster = name, "Dropping conditions update for unknown cluster");
            return;
        }

        let conditions = extract_conditions(obj);
        self.conditions
            .write()
            .unwrap()
            .insert(name.to_string(), conditions);
        debug!(cluster = name, "Conditions updated");

        self.broadcast_conditions().await;
    }

    /// Watch callback: a cluster object was deleted, directly or via a
    /// tombstone. Unknown names are no-ops.
    pub async fn on_delete(&self, obj: &WatchObject) {
        let Some(name) = obj.name() else {
            warn!("Delete delivered an unrecognized payload, skipping");
            return;
        };

        let removed = self.clusters.write().unwrap().remove(name);
        if !removed {
            debug!(cluster = name, "Delete for unknown cluster, ignoring");
            return;
        }

        self.conditions.write().unwrap().remove(name);
        info!(cluster = name, "Cluster removed");

        self.broadcast_clusters().await;
        self.broadcast_conditions().await;
    }

    /// Walks every current cluster object and refreshes its conditions, so a
    /// freshly connected client promptly sees the current state.
    pub async fn load_conditions(
        &self,
        platform: &dyn PlatformClient,
        namespace: &str,
    ) -> std::result::Result<(), PlatformError> {
        let clusters = platform.list_clusters(namespace).await?;
        info!(
            namespace,
            cluster_count = clusters.len(),
            "Loading cluster conditions"
        );
        for obj in &clusters {
            self.on_update(obj).await;
        }
        Ok(())
    }

    async fn broadcast_clusters(&self) {
        let clusters = self.cluster_names();
        if self
            .broadcast
            .send(Message::ClustersList { clusters })
            .await
            .is_err()
        {
            debug!("Broadcast channel closed, dropping clusters snapshot");
        }
    }

    async fn broadcast_conditions(&self) {
        let conditions = self.conditions_snapshot();
        if self
            .broadcast
            .send(Message::Conditions { conditions })
            .await
            .is_err()
        {
            debug!("Broadcast channel closed, dropping conditions snapshot");
        }
    }
}

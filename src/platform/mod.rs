//! Orchestrator boundary.
//!
//! The broker never talks to Kubernetes directly; everything it needs is
//! behind [`PlatformClient`]: one-shot lists, watch subscriptions, pod label
//! lookups and pod log streams. Watch payloads for the cluster resource are
//! open maps ([`serde_json::Value`]); the rest of the crate only ever looks
//! at the projections in [`object`].

mod api;
mod object;

pub use api::InClusterClient;
pub use object::{extract_conditions, has_deletion_marker, object_name, WatchObject};

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;

use crate::errors::PlatformError;

/// A platform event projected down to the fields the broker cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformEvent {
    pub name: String,
    pub message: String,
    pub involved_kind: String,
    pub involved_name: String,
    pub involved_namespace: String,
}

/// Kind of a raw watch notification for the cluster resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Added,
    Modified,
    Deleted,
}

/// One raw notification from the cluster watch stream.
#[derive(Debug, Clone)]
pub struct RawWatchEvent {
    pub kind: WatchEventKind,
    pub object: serde_json::Value,
}

/// Options for a pod log stream.
#[derive(Debug, Clone, Default)]
pub struct LogStreamOptions {
    pub container: String,
    pub follow: bool,
    pub since_time: Option<DateTime<Utc>>,
}

/// Line-oriented pod log stream.
pub type LogStream = Box<dyn AsyncBufRead + Send + Unpin>;

/// Client-side view of the orchestrator.
///
/// Watch subscriptions hand back an `mpsc::Receiver`; the stream ends when
/// the receiver yields `None` (server-side EOF) or the receiver is dropped.
/// Callers own reconnection policy.
#[async_trait]
pub trait PlatformClient: Send + Sync + 'static {
    /// Current cluster objects in the namespace, as unstructured payloads.
    async fn list_clusters(
        &self,
        namespace: &str,
    ) -> std::result::Result<Vec<serde_json::Value>, PlatformError>;

    /// Live watch on the cluster resource.
    async fn watch_clusters(
        &self,
        namespace: &str,
    ) -> std::result::Result<mpsc::Receiver<RawWatchEvent>, PlatformError>;

    /// One-shot list of current events in the namespace.
    async fn list_events(
        &self,
        namespace: &str,
    ) -> std::result::Result<Vec<PlatformEvent>, PlatformError>;

    /// Live watch on platform events in the namespace.
    async fn watch_events(
        &self,
        namespace: &str,
    ) -> std::result::Result<mpsc::Receiver<PlatformEvent>, PlatformError>;

    /// Labels of a pod. Deleted pods surface as [`PlatformError::NotFound`].
    async fn pod_labels(
        &self,
        namespace: &str,
        name: &str,
    ) -> std::result::Result<HashMap<String, String>, PlatformError>;

    /// Names of operator pods (label `app=couchbase-operator`).
    async fn operator_pods(
        &self,
        namespace: &str,
    ) -> std::result::Result<Vec<String>, PlatformError>;

    /// Opens a line-oriented log stream from one pod.
    async fn pod_log_stream(
        &self,
        namespace: &str,
        pod: &str,
        options: LogStreamOptions,
    ) -> std::result::Result<LogStream, PlatformError>;
}

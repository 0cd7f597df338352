//! In-cluster REST binding for [`PlatformClient`].
//!
//! Talks to the API server with the pod's service-account credentials.
//! Watch subscriptions use the chunked watch protocol: one JSON object per
//! line, `{"type": "ADDED|MODIFIED|DELETED", "object": {…}}`. Reader tasks
//! stop as soon as their receiver is dropped.

use std::collections::HashMap;
use std::env;
use std::fs;

use async_trait::async_trait;
use chrono::SecondsFormat;
use futures::StreamExt;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::constants::{APP_LABEL, CLUSTER_GROUP, CLUSTER_RESOURCE, CLUSTER_VERSION, OPERATOR_APP};
use crate::errors::PlatformError;

use super::{
    LogStream, LogStreamOptions, PlatformClient, PlatformEvent, RawWatchEvent, WatchEventKind,
};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Buffer of watch subscription channels handed to callers.
const WATCH_CHANNEL_CAPACITY: usize = 64;

pub struct InClusterClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl InClusterClient {
    /// Builds a client from the pod's mounted service-account credentials.
    pub fn from_cluster_env() -> std::result::Result<Self, PlatformError> {
        let host = env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            PlatformError::Credentials("KUBERNETES_SERVICE_HOST not set".to_string())
        })?;
        let port = env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

        let token = fs::read_to_string(format!("{SERVICE_ACCOUNT_DIR}/token"))
            .map_err(|e| PlatformError::Credentials(format!("cannot read token: {e}")))?
            .trim()
            .to_string();
        let ca = fs::read(format!("{SERVICE_ACCOUNT_DIR}/ca.crt"))
            .map_err(|e| PlatformError::Credentials(format!("cannot read CA bundle: {e}")))?;
        let cert = reqwest::Certificate::from_pem(&ca)?;

        let http = reqwest::Client::builder()
            .add_root_certificate(cert)
            .build()?;

        Ok(Self {
            http,
            base_url: format!("https://{host}:{port}"),
            token,
        })
    }

    fn clusters_path(namespace: &str) -> String {
        format!(
            "/apis/{CLUSTER_GROUP}/{CLUSTER_VERSION}/namespaces/{namespace}/{CLUSTER_RESOURCE}"
        )
    }

    async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> std::result::Result<Value, PlatformError> {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PlatformError::ApiStatus {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.json().await?)
    }

    /// Opens a chunked response as a line reader.
    async fn get_lines(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> std::result::Result<LogStream, PlatformError> {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PlatformError::ApiStatus {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)))
            .boxed();
        Ok(Box::new(StreamReader::new(stream)))
    }

    /// Spawns a reader that decodes watch lines and forwards them until the
    /// receiver is dropped or the server closes the stream.
    async fn spawn_watch(
        &self,
        path: String,
    ) -> std::result::Result<mpsc::Receiver<(WatchEventKind, Value)>, PlatformError> {
        let reader = self
            .get_lines(&path, &[("watch", "true".to_string())])
            .await?;
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut lines = reader.lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Some(event) = decode_watch_line(&line) else {
                            continue;
                        };
                        if tx.send(event).await.is_err() {
                            debug!(path, "Watch receiver dropped, closing stream");
                            return;
                        }
                    }
                    Ok(None) => {
                        debug!(path, "Watch stream ended");
                        return;
                    }
                    Err(e) => {
                        warn!(path, error = %e, "Watch stream read failed");
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

fn decode_watch_line(line: &str) -> Option<(WatchEventKind, Value)> {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "Malformed watch line, skipping");
            return None;
        }
    };
    let kind = match value.get("type").and_then(|t| t.as_str()) {
        Some("ADDED") => WatchEventKind::Added,
        Some("MODIFIED") => WatchEventKind::Modified,
        Some("DELETED") => WatchEventKind::Deleted,
        // BOOKMARK and ERROR notifications carry nothing the broker needs
        other => {
            debug!(?other, "Ignoring watch notification");
            return None;
        }
    };
    let object = value.get("object")?.clone();
    Some((kind, object))
}

/// Projects a platform event payload down to [`PlatformEvent`].
fn event_from_value(value: &Value) -> PlatformEvent {
    let text = |v: &Value, path: &[&str]| -> String {
        let mut cur = v;
        for key in path {
            match cur.get(key) {
                Some(next) => cur = next,
                None => return String::new(),
            }
        }
        cur.as_str().unwrap_or_default().to_string()
    };

    PlatformEvent {
        name: text(value, &["metadata", "name"]),
        message: text(value, &["message"]),
        involved_kind: text(value, &["involvedObject", "kind"]),
        involved_name: text(value, &["involvedObject", "name"]),
        involved_namespace: text(value, &["involvedObject", "namespace"]),
    }
}

#[async_trait]
impl PlatformClient for InClusterClient {
    async fn list_clusters(
        &self,
        namespace: &str,
    ) -> std::result::Result<Vec<Value>, PlatformError> {
        let list = self.get_json(&Self::clusters_path(namespace), &[]).await?;
        Ok(list
            .get("items")
            .and_then(|i| i.as_array())
            .cloned()
            .unwrap_or_default())
    }

    async fn watch_clusters(
        &self,
        namespace: &str,
    ) -> std::result::Result<mpsc::Receiver<RawWatchEvent>, PlatformError> {
        let mut raw = self.spawn_watch(Self::clusters_path(namespace)).await?;
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some((kind, object)) = raw.recv().await {
                if tx.send(RawWatchEvent { kind, object }).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn list_events(
        &self,
        namespace: &str,
    ) -> std::result::Result<Vec<PlatformEvent>, PlatformError> {
        let list = self
            .get_json(&format!("/api/v1/namespaces/{namespace}/events"), &[])
            .await?;
        Ok(list
            .get("items")
            .and_then(|i| i.as_array())
            .map(|items| items.iter().map(event_from_value).collect())
            .unwrap_or_default())
    }

    async fn watch_events(
        &self,
        namespace: &str,
    ) -> std::result::Result<mpsc::Receiver<PlatformEvent>, PlatformError> {
        let mut raw = self
            .spawn_watch(format!("/api/v1/namespaces/{namespace}/events"))
            .await?;
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some((kind, object)) = raw.recv().await {
                // Only fresh events matter; modifications are count bumps
                if kind != WatchEventKind::Added {
                    continue;
                }
                if tx.send(event_from_value(&object)).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn pod_labels(
        &self,
        namespace: &str,
        name: &str,
    ) -> std::result::Result<HashMap<String, String>, PlatformError> {
        let path = format!("/api/v1/namespaces/{namespace}/pods/{name}");
        let pod = match self.get_json(&path, &[]).await {
            Ok(pod) => pod,
            Err(PlatformError::ApiStatus { status, .. })
                if status == StatusCode::NOT_FOUND.as_u16() =>
            {
                return Err(PlatformError::NotFound {
                    kind: "Pod",
                    name: name.to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        let labels = pod
            .get("metadata")
            .and_then(|m| m.get("labels"))
            .and_then(|l| l.as_object())
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        Ok(labels)
    }

    async fn operator_pods(
        &self,
        namespace: &str,
    ) -> std::result::Result<Vec<String>, PlatformError> {
        let list = self
            .get_json(
                &format!("/api/v1/namespaces/{namespace}/pods"),
                &[("labelSelector", format!("{APP_LABEL}={OPERATOR_APP}"))],
            )
            .await?;
        Ok(list
            .get("items")
            .and_then(|i| i.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|pod| {
                        pod.get("metadata")
                            .and_then(|m| m.get("name"))
                            .and_then(|n| n.as_str())
                            .map(str::to_string)
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn pod_log_stream(
        &self,
        namespace: &str,
        pod: &str,
        options: LogStreamOptions,
    ) -> std::result::Result<LogStream, PlatformError> {
        let mut query = vec![
            ("container", options.container.clone()),
            ("follow", options.follow.to_string()),
        ];
        if let Some(since) = options.since_time {
            query.push((
                "sinceTime",
                since.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }
        self.get_lines(
            &format!("/api/v1/namespaces/{namespace}/pods/{pod}/log"),
            &query,
        )
        .await
    }
}

#[cfg(test)]
mod api_test {
    use super::*;
    use serde_json::json;

    #[test]
    fn watch_line_decoding() {
        let line = r#"{"type":"ADDED","object":{"metadata":{"name":"alpha"}}}"#;
        let (kind, object) = decode_watch_line(line).expect("decodes");
        assert_eq!(kind, WatchEventKind::Added);
        assert_eq!(object["metadata"]["name"], "alpha");

        assert!(decode_watch_line("not json").is_none());
        assert!(decode_watch_line(r#"{"type":"BOOKMARK","object":{}}"#).is_none());
        assert!(decode_watch_line(r#"{"type":"ADDED"}"#).is_none());
    }

    #[test]
    fn event_projection_tolerates_missing_fields() {
        let full = json!({
            "metadata": {"name": "ev-1"},
            "message": "Created pod",
            "involvedObject": {"kind": "Pod", "name": "alpha-0000", "namespace": "ns"}
        });
        let event = event_from_value(&full);
        assert_eq!(event.name, "ev-1");
        assert_eq!(event.involved_kind, "Pod");
        assert_eq!(event.involved_namespace, "ns");

        let sparse = event_from_value(&json!({}));
        assert!(sparse.name.is_empty());
        assert!(sparse.involved_kind.is_empty());
    }
}

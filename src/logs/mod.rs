//! Operator log streaming.
//!
//! One task per active log session. The task picks an operator pod by
//! label, opens a line stream through the platform boundary, applies the
//! session's time window and cluster filter, and forwards surviving lines
//! onto the shared broadcast channel stamped with the log-session id.
//!
//! Lines are parsed as the operator's JSON log format (`{"ts": …,
//! "cluster": "namespace/name", …}`) on a best-effort basis: lines that do
//! not parse are forwarded as-is, bypassing the filters.


use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::constants::OPERATOR_CONTAINER;
use crate::message::Message;
use crate::platform::{LogStreamOptions, PlatformClient};

/// Parameters of one log session, decoded from the client's `logs` frame.
#[derive(Debug, Clone, Default)]
pub struct LogSessionOptions {
    pub follow: bool,
    pub start_time: Option<DateTime<Utc>>,
    /// Only honored when not following.
    pub end_time: Option<DateTime<Utc>>,
    /// Cluster names to keep; empty means no filtering.
    pub clusters: HashSet<String>,
}

/// Timestamp and cluster of an operator log line.
#[derive(Debug, Deserialize)]
struct LogEntry {
    #[serde(default)]
    ts: Option<DateTime<Utc>>,
    #[serde(default)]
    cluster: Option<String>,
}

pub async fn run_log_stream(
    platform: Arc<dyn PlatformClient>,
    broadcast: mpsc::Sender<Message>,
    namespace: String,
    session_id: String,
    options: LogSessionOptions,
    mut shutdown: watch::Receiver<()>,
) {
    info!(
        namespace,
        session_id,
        follow = options.follow,
        clusters = ?options.clusters,
        "Starting log watcher"
    );

    let pods = match platform.operator_pods(&namespace).await {
        Ok(pods) => pods,
        Err(e) => {
            error!(namespace, session_id, error = %e, "Failed to list operator pods");
            return;
        }
    };
    let Some(pod) = pods.first() else {
        warn!(namespace, session_id, "No operator pods found, log watching disabled");
        return;
    };

    let stream = match platform
        .pod_log_stream(
            &namespace,
            pod,
            LogStreamOptions {
                container: OPERATOR_CONTAINER.to_string(),
                follow: options.follow,
                since_time: options.start_time,
            },
        )
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            error!(namespace, pod, session_id, error = %e, "Failed to establish log stream");
            return;
        }
    };
    info!(namespace, pod, session_id, "Log stream established");

    // The operator tags lines with "namespace/name"
    let allowed: HashSet<String> = options
        .clusters
        .iter()
        .map(|name| format!("{namespace}/{name}"))
        .collect();

    let mut lines = stream.lines();
    let mut line_count: u64 = 0;
    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                info!(session_id, lines_processed = line_count, "Log watcher terminated");
                return;
            }
            next = lines.next_line() => {
                let line = match next {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!(session_id, lines_processed = line_count, "Log stream ended");
                        return;
                    }
                    Err(e) => {
                        error!(pod, session_id, error = %e, "Failed reading log line");
                        return;
                    }
                };

                match serde_json::from_str::<LogEntry>(&line) {
                    Ok(entry) => {
                        if let (Some(end), false, Some(ts)) =
                            (options.end_time, options.follow, entry.ts)
                        {
                            if ts > end {
                                info!(session_id, lines_processed = line_count, "Log watcher reached end time");
                                return;
                            }
                        }

                        if !allowed.is_empty() {
                            match entry.cluster {
                                Some(ref cluster) if allowed.contains(cluster) => {}
                                _ => continue,
                            }
                        }
                    }
                    // Unparseable lines are forwarded unfiltered
                    Err(e) => debug!(session_id, error = %e, "Failed parsing log entry, sending anyway"),
                }

                let message = Message::Log {
                    session_id: session_id.clone(),
                    line,
                };
                tokio::select! {
                    biased;

                    _ = shutdown.changed() => return,
                    sent = broadcast.send(message) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
                line_count += 1;
            }
        }
    }
}

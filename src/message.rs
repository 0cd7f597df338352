//! Broker message model and client wire frames.
//!
//! Everything that flows through the shared broadcast channel is a
//! [`Message`] variant; the dispatcher's routing is exhaustive over the
//! variants. [`Frame`] is the outbound wire representation actually written
//! to a client, and [`ClientRequest`] the inbound one. Wire field names are
//! part of the browser protocol and must not change.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Ordered condition maps as reported on a cluster's status. The maps are
/// captured as-is and never interpreted by the broker.
pub type ConditionSet = Vec<serde_json::Map<String, serde_json::Value>>;

/// Snapshot of every known cluster's conditions.
pub type ConditionsSnapshot = HashMap<String, ConditionSet>;

/// A platform event projected down to the fields clients render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEvent {
    #[serde(rename = "clusterName")]
    pub cluster_name: String,
    pub name: String,
    pub message: String,
    pub kind: String,
    #[serde(rename = "objectName")]
    pub object_name: String,
}

/// Internal broker message, produced by watch callbacks, watcher tasks,
/// replay tasks and log tasks, and consumed solely by the dispatcher.
#[derive(Debug, Clone)]
pub enum Message {
    /// Snapshot of the known cluster names.
    ClustersList { clusters: Vec<String> },
    /// Snapshot of every cluster's conditions.
    Conditions { conditions: ConditionsSnapshot },
    /// A live event observed by a cluster's watcher.
    Event { event: ClusterEvent },
    /// A cached event replayed towards the client whose session id matches.
    CachedEvent {
        event: ClusterEvent,
        session_id: String,
    },
    /// One raw operator log line for a specific log session.
    Log { session_id: String, line: String },
}

/// Outbound wire frame, one per message written to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "clusters")]
    Clusters { clusters: Vec<String> },

    #[serde(rename = "clusterConditions")]
    ClusterConditions { conditions: ConditionsSnapshot },

    #[serde(rename = "event")]
    Event {
        #[serde(flatten)]
        event: ClusterEvent,
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    #[serde(rename = "cachedevent")]
    CachedEvent {
        #[serde(flatten)]
        event: ClusterEvent,
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    #[serde(rename = "log")]
    Log {
        #[serde(rename = "sessionId")]
        session_id: String,
        message: String,
    },
}

/// Inbound client frame. Unknown `type` tags fail deserialization and are
/// logged and ignored by the connection handler.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientRequest {
    /// Replace the client's watch set and start a new event session.
    #[serde(rename = "clustersevents")]
    ClustersEvents {
        #[serde(rename = "sessionId", default)]
        session_id: String,
        #[serde(default)]
        clusters: Vec<String>,
    },

    /// Start (non-empty session id) or stop (empty) a log stream.
    #[serde(rename = "logs")]
    Logs {
        #[serde(rename = "sessionId", default)]
        session_id: String,
        #[serde(default)]
        follow: bool,
        #[serde(rename = "startTime", default)]
        start_time: String,
        #[serde(rename = "endTime", default)]
        end_time: String,
        #[serde(rename = "clusterMap", default)]
        cluster_map: HashMap<String, bool>,
    },
}

#[cfg(test)]
mod message_test {
    use super::*;

    fn sample_event() -> ClusterEvent {
        ClusterEvent {
            cluster_name: "alpha".into(),
            name: "alpha-pod-restart".into(),
            message: "Pod restarted".into(),
            kind: "Pod".into(),
            object_name: "alpha-0000".into(),
        }
    }

    #[test]
    fn clusters_frame_wire_shape() {
        let frame = Frame::Clusters {
            clusters: vec!["alpha".into(), "beta".into()],
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "clusters", "clusters": ["alpha", "beta"]})
        );
    }

    #[test]
    fn event_frame_flattens_event_fields() {
        let frame = Frame::Event {
            event: sample_event(),
            session_id: "s1".into(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "event",
                "clusterName": "alpha",
                "name": "alpha-pod-restart",
                "message": "Pod restarted",
                "kind": "Pod",
                "objectName": "alpha-0000",
                "sessionId": "s1",
            })
        );
    }

    #[test]
    fn cached_event_frame_uses_cachedevent_tag() {
        let frame = Frame::CachedEvent {
            event: sample_event(),
            session_id: "s2".into(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "cachedevent");
        assert_eq!(value["sessionId"], "s2");
    }

    #[test]
    fn log_frame_wire_shape() {
        let frame = Frame::Log {
            session_id: "L1".into(),
            message: "{\"ts\":\"2024-01-01T00:00:00Z\"}\n".into(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "log");
        assert_eq!(value["sessionId"], "L1");
        assert!(value["message"].as_str().unwrap().starts_with("{\"ts\""));
    }

    #[test]
    fn outbound_frames_round_trip() {
        let frames = vec![
            Frame::Clusters {
                clusters: vec!["alpha".into()],
            },
            Frame::ClusterConditions {
                conditions: HashMap::from([("alpha".to_string(), ConditionSet::new())]),
            },
            Frame::Event {
                event: sample_event(),
                session_id: "s1".into(),
            },
            Frame::CachedEvent {
                event: sample_event(),
                session_id: "s1".into(),
            },
            Frame::Log {
                session_id: "L1".into(),
                message: "line".into(),
            },
        ];
        for frame in frames {
            let encoded = serde_json::to_string(&frame).unwrap();
            let decoded: Frame = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn subscribe_request_parses() {
        let raw = r#"{"type":"clustersevents","sessionId":"s1","clusters":["alpha","beta"]}"#;
        match serde_json::from_str::<ClientRequest>(raw).unwrap() {
            ClientRequest::ClustersEvents {
                session_id,
                clusters,
            } => {
                assert_eq!(session_id, "s1");
                assert_eq!(clusters, vec!["alpha", "beta"]);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn logs_request_defaults_unset_fields() {
        let raw = r#"{"type":"logs","sessionId":"L1","follow":true,"clusterMap":{"delta":true}}"#;
        match serde_json::from_str::<ClientRequest>(raw).unwrap() {
            ClientRequest::Logs {
                session_id,
                follow,
                start_time,
                end_time,
                cluster_map,
            } => {
                assert_eq!(session_id, "L1");
                assert!(follow);
                assert!(start_time.is_empty());
                assert!(end_time.is_empty());
                assert_eq!(cluster_map.get("delta"), Some(&true));
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn unknown_request_tag_is_rejected() {
        let raw = r#"{"type":"subscribe","sessionId":"x"}"#;
        assert!(serde_json::from_str::<ClientRequest>(raw).is_err());
    }
}

//! Projections over unstructured cluster payloads.
//!
//! The cluster resource arrives as a nested open map. The broker only ever
//! needs two projections out of it: the object name and the ordered
//! `status.conditions` sequence. Everything here is defensive; unrecognized
//! shapes yield `None`/empty rather than errors.

use serde_json::Value;
use tracing::warn;

use crate::message::ConditionSet;

/// A watch delivery: either a live object or a tombstone wrapping the
/// last-known state of an object deleted while the watch was disconnected.
#[derive(Debug, Clone)]
pub enum WatchObject {
    Object(Value),
    Tombstone { last_known: Value },
}

impl WatchObject {
    /// Name of the underlying object, unwrapping tombstones.
    pub fn name(&self) -> Option<&str> {
        match self {
            WatchObject::Object(obj) => object_name(obj),
            WatchObject::Tombstone { last_known } => object_name(last_known),
        }
    }
}

/// `metadata.name` of an unstructured object.
pub fn object_name(obj: &Value) -> Option<&str> {
    obj.get("metadata")?.get("name")?.as_str()
}

/// True when the object is already marked for deletion.
pub fn has_deletion_marker(obj: &Value) -> bool {
    obj.get("metadata")
        .and_then(|m| m.get("deletionTimestamp"))
        .is_some_and(|ts| !ts.is_null())
}

/// Best-effort extraction of `status.conditions`.
///
/// A missing `status`, missing `conditions`, or any non-map element yields
/// an empty (or shorter) sequence; extraction never fails.
pub fn extract_conditions(obj: &Value) -> ConditionSet {
    let Some(raw) = obj
        .get("status")
        .and_then(|s| s.get("conditions"))
        .and_then(|c| c.as_array())
    else {
        return ConditionSet::new();
    };

    let mut conditions = ConditionSet::with_capacity(raw.len());
    for condition in raw {
        match condition.as_object() {
            Some(map) => conditions.push(map.clone()),
            None => warn!(?condition, "Condition item is not a map, skipping"),
        }
    }
    conditions
}

#[cfg(test)]
mod object_test {
    use super::*;
    use serde_json::json;

    #[test]
    fn name_extraction() {
        let obj = json!({"metadata": {"name": "alpha"}});
        assert_eq!(object_name(&obj), Some("alpha"));
        assert_eq!(object_name(&json!({"metadata": {}})), None);
        assert_eq!(object_name(&json!("not an object")), None);
    }

    #[test]
    fn tombstone_unwraps_to_inner_name() {
        let tombstone = WatchObject::Tombstone {
            last_known: json!({"metadata": {"name": "beta"}}),
        };
        assert_eq!(tombstone.name(), Some("beta"));

        let malformed = WatchObject::Tombstone {
            last_known: json!(42),
        };
        assert_eq!(malformed.name(), None);
    }

    #[test]
    fn deletion_marker_detection() {
        let deleting = json!({"metadata": {"name": "x", "deletionTimestamp": "2024-05-01T00:00:00Z"}});
        assert!(has_deletion_marker(&deleting));

        let live = json!({"metadata": {"name": "x"}});
        assert!(!has_deletion_marker(&live));

        let null_marker = json!({"metadata": {"name": "x", "deletionTimestamp": null}});
        assert!(!has_deletion_marker(&null_marker));
    }

    #[test]
    fn conditions_extraction_is_best_effort() {
        let obj = json!({
            "status": {
                "conditions": [
                    {"type": "Available", "status": "True"},
                    "garbage",
                    {"type": "Balanced", "status": "False"},
                ]
            }
        });
        let conditions = extract_conditions(&obj);
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0]["type"], "Available");
        assert_eq!(conditions[1]["type"], "Balanced");
    }

    #[test]
    fn missing_status_or_conditions_yield_empty() {
        assert!(extract_conditions(&json!({})).is_empty());
        assert!(extract_conditions(&json!({"status": {}})).is_empty());
        assert!(extract_conditions(&json!({"status": {"conditions": "nope"}})).is_empty());
    }
}

//! Process-wide constants.

use std::time::Duration;

/// API group of the watched cluster resource.
pub const CLUSTER_GROUP: &str = "couchbase.com";

/// API version of the watched cluster resource.
pub const CLUSTER_VERSION: &str = "v2";

/// Plural resource name used in watch/list paths.
pub const CLUSTER_RESOURCE: &str = "couchbaseclusters";

/// Kind reported on events attached to the cluster resource itself.
pub const CLUSTER_KIND: &str = "CouchbaseCluster";

/// Pod label carrying the owning cluster name.
pub const CLUSTER_LABEL: &str = "couchbase_cluster";

/// Pod label key identifying the application.
pub const APP_LABEL: &str = "app";

/// `app` label value of operator pods.
pub const OPERATOR_APP: &str = "couchbase-operator";

/// Container to stream operator logs from.
pub const OPERATOR_CONTAINER: &str = "couchbase-operator";

/// Upper bound on cached events per cluster. Oldest entries are evicted
/// first once the bound is reached.
pub const EVENT_CACHE_CAPACITY: usize = 1000;

/// Buffer of the shared broadcast channel feeding the dispatcher.
pub const BROADCAST_CHANNEL_CAPACITY: usize = 256;

/// Per-client outbound queue bound. A client that cannot drain this queue
/// in time is treated as disconnected.
pub const CLIENT_OUTBOUND_CAPACITY: usize = 256;

/// Relist period of the cluster watch.
pub const WATCH_RESYNC_PERIOD: Duration = Duration::from_secs(30);

/// Port of the per-cluster admin UI service.
pub const CLUSTER_UI_PORT: u16 = 8091;

/// Local operator metrics endpoint scraped by `/metrics`.
pub const OPERATOR_METRICS_URL: &str = "http://localhost:8383/metrics";

/// Path prefixes that identify requests destined for the cluster admin API.
pub const API_PATH_PREFIXES: &[&str] = &[
    "/pools",
    "/settings",
    "/controller",
    "/nodes",
    "/indexes",
    "/query",
];

/// Metric families exposed through the JSON rendering of `/metrics`.
/// Everything else from the operator endpoint is dropped.
pub const METRIC_ALLOWLIST: &[&str] = &[
    "couchbase_operator_reconcile_total",
    "couchbase_operator_reconcile_errors_total",
    "couchbase_operator_cluster_members",
    "couchbase_operator_cluster_ready",
    "couchbase_operator_pods_created_total",
    "couchbase_operator_pods_deleted_total",
    "couchbase_operator_rebalance_running",
    "controller_runtime_reconcile_time_seconds",
];

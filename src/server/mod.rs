//! HTTP surface: dashboard snapshots, the WebSocket endpoint, the filtered
//! metrics endpoint, and the admin UI/API reverse proxies.

mod metrics;
mod proxy;
mod ws;

pub use metrics::{parse_families, MetricFamily, MetricSample};

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde_json::json;
use tracing::warn;

use crate::broker::BrokerState;
use crate::constants::API_PATH_PREFIXES;
use crate::registry::ClusterRegistry;

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<BrokerState>,
    pub registry: Arc<ClusterRegistry>,
    pub http: reqwest::Client,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", any(root))
        .route("/cluster/:name", get(cluster_page))
        .route("/ws", get(ws::handle_upgrade))
        .route("/metrics", get(metrics::handle_metrics))
        .route("/cui/*path", any(proxy::ui_proxy))
        .fallback(fallback)
        .with_state(state)
}

/// Dashboard root. Requests that look like admin API calls are proxied
/// instead of answered locally.
async fn root(State(state): State<AppState>, req: Request) -> Response {
    if is_api_request(req.method(), req.headers(), req.uri().path()) {
        return proxy::forward_api(&state, req).await;
    }
    Json(json!({ "clusters": state.registry.cluster_names() })).into_response()
}

async fn cluster_page(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    if !state.registry.contains(&name) {
        warn!(cluster = %name, "Requested cluster not found");
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(json!({ "name": name })).into_response()
}

/// Unmatched paths: admin API calls go to the proxy, the rest is 404.
async fn fallback(State(state): State<AppState>, req: Request) -> Response {
    if is_api_request(req.method(), req.headers(), req.uri().path()) {
        return proxy::forward_api(&state, req).await;
    }
    StatusCode::NOT_FOUND.into_response()
}

/// Heuristic for requests destined for the cluster admin API rather than
/// browser navigation.
fn is_api_request(method: &Method, headers: &HeaderMap, path: &str) -> bool {
    let header_str = |name: header::HeaderName| -> &str {
        headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
    };

    if header_str(header::HeaderName::from_static("x-requested-with")) == "XMLHttpRequest" {
        return true;
    }

    let accept = header_str(header::ACCEPT);
    if (accept.contains("application/json")
        || accept.contains("application/xml")
        || accept.contains("*/*"))
        && !accept.contains("text/html")
    {
        return true;
    }

    if header_str(header::CONTENT_TYPE) == "application/json" {
        return true;
    }

    // Explicit browser navigation
    if accept.contains("text/html")
        && method == Method::GET
        && header_str(header::HeaderName::from_static("sec-fetch-mode")) == "navigate"
    {
        return false;
    }

    API_PATH_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix))
}

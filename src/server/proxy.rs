//! Reverse proxies to the per-cluster admin endpoint.
//!
//! Two entry points share one forwarding core:
//! - the UI proxy (`/cui/{cluster}/…`), which strips the prefix and
//!   rewrites redirect locations back under it;
//! - the API proxy, which resolves the target cluster from the `Referer`
//!   header (the admin UI issues API calls from pages under `/cui/…`) and
//!   forwards the request path untouched.
//!
//! Targets follow the operator's service naming:
//! `http://{cluster}-ui.{namespace}.svc.cluster.local:8091`.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{error, info};

use crate::constants::CLUSTER_UI_PORT;

use super::AppState;

/// Cap on buffered request bodies; admin API payloads are small.
const MAX_PROXY_BODY: usize = 16 * 1024 * 1024;

fn target_base(cluster: &str, namespace: &str) -> String {
    format!("http://{cluster}-ui.{namespace}.svc.cluster.local:{CLUSTER_UI_PORT}")
}

/// `/cui/{cluster}/…` — admin UI pass-through.
pub async fn ui_proxy(State(state): State<AppState>, req: Request) -> Response {
    let path = req.uri().path();
    let Some(rest) = path.strip_prefix("/cui/") else {
        return (StatusCode::BAD_REQUEST, "Cluster name is required").into_response();
    };
    let (cluster, stripped) = rest.split_once('/').unwrap_or((rest, ""));
    if cluster.is_empty() {
        return (StatusCode::BAD_REQUEST, "Cluster name is required").into_response();
    }
    let cluster = cluster.to_string();
    info!(cluster, path, "Proxying to cluster admin UI");

    let mut target = format!("{}/{stripped}", target_base(&cluster, state.broker.namespace()));
    if let Some(query) = req.uri().query() {
        target.push('?');
        target.push_str(query);
    }

    forward(&state, req, target, Some(format!("/cui/{cluster}"))).await
}

/// API requests resolved through the `Referer` header. Reached via the
/// root and fallback routes once their heuristic classifies a request as
/// an admin API call.
pub(super) async fn forward_api(state: &AppState, req: Request) -> Response {
    let Some(referer) = req
        .headers()
        .get(header::REFERER)
        .and_then(|v| v.to_str().ok())
    else {
        return (
            StatusCode::BAD_REQUEST,
            "API requests require a Referer header to determine target cluster",
        )
            .into_response();
    };

    let referer_path = url_path(referer);
    let Some(rest) = referer_path.strip_prefix("/cui/") else {
        return (StatusCode::BAD_REQUEST, "Referer path must start with /cui/").into_response();
    };
    let cluster = rest.split('/').next().unwrap_or_default().to_string();
    if cluster.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            "Could not determine cluster name from referer",
        )
            .into_response();
    }

    info!(cluster, path = req.uri().path(), "Proxying API request");

    let mut target = format!(
        "{}{}",
        target_base(&cluster, state.broker.namespace()),
        req.uri().path()
    );
    if let Some(query) = req.uri().query() {
        target.push('?');
        target.push_str(query);
    }

    // API responses go back verbatim; only the UI proxy rewrites redirects
    forward(state, req, target, None).await
}

/// Forwards one buffered request and relays the upstream response.
async fn forward(
    state: &AppState,
    req: Request,
    target: String,
    location_prefix: Option<String>,
) -> Response {
    let method = req.method().clone();
    let mut headers = req.headers().clone();
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    let body = match axum::body::to_bytes(req.into_body(), MAX_PROXY_BODY).await {
        Ok(body) => body,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("Unreadable request body: {e}"))
                .into_response()
        }
    };

    let upstream = match state
        .http
        .request(method, target)
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(upstream) => upstream,
        Err(e) => {
            error!(error = %e, "Proxy error");
            return (StatusCode::BAD_GATEWAY, format!("Proxy error: {e}")).into_response();
        }
    };

    let status = upstream.status();
    let mut builder = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if name == header::TRANSFER_ENCODING
            || name == header::CONNECTION
            || name == header::CONTENT_LENGTH
        {
            continue;
        }
        if name == header::LOCATION && status.is_redirection() {
            if let (Some(prefix), Ok(location)) = (&location_prefix, value.to_str()) {
                let rewritten = format!("{prefix}{}", url_path(location));
                builder = builder.header(header::LOCATION, rewritten);
                continue;
            }
        }
        builder = builder.header(name, value);
    }

    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "Failed to read proxied response body");
            return (StatusCode::BAD_GATEWAY, format!("Proxy error: {e}")).into_response();
        }
    };

    builder
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

/// Path component of an absolute or relative URL.
fn url_path(url: &str) -> &str {
    let without_scheme = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    if without_scheme.len() == url.len() && url.starts_with('/') {
        // Already a bare path
        let end = url.find(['?', '#']).unwrap_or(url.len());
        return &url[..end];
    }
    match without_scheme.find('/') {
        Some(at) => {
            let path = &without_scheme[at..];
            let end = path.find(['?', '#']).unwrap_or(path.len());
            &path[..end]
        }
        None => "/",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_path_handles_absolute_and_relative_forms() {
        assert_eq!(url_path("http://host:3000/cui/alpha/ui/index.html"), "/cui/alpha/ui/index.html");
        assert_eq!(url_path("https://host/cui/alpha"), "/cui/alpha");
        assert_eq!(url_path("/ui/index.html?x=1"), "/ui/index.html");
        assert_eq!(url_path("http://host"), "/");
    }

    #[test]
    fn target_base_follows_service_naming() {
        assert_eq!(
            target_base("alpha", "observed"),
            "http://alpha-ui.observed.svc.cluster.local:8091"
        );
    }
}

//! Operator metrics endpoint.
//!
//! Scrapes the operator's local Prometheus endpoint. JSON requests get the
//! exposition parsed into families and filtered down to the allow-list;
//! everything else gets the raw text passed through.

use std::collections::{BTreeMap, HashMap};

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::constants::{METRIC_ALLOWLIST, OPERATOR_METRICS_URL};

use super::AppState;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricFamily {
    pub name: String,
    pub help: String,
    #[serde(rename = "type")]
    pub family_type: String,
    pub metrics: Vec<MetricSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub labels: BTreeMap<String, String>,
    pub value: String,
}

pub async fn handle_metrics(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let response = match state.http.get(OPERATOR_METRICS_URL).send().await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "Failed to get metrics from local endpoint");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to fetch metrics: {e}"),
            )
                .into_response();
        }
    };

    let status = response.status();
    if !status.is_success() {
        error!(status = status.as_u16(), "Non-OK status from metrics endpoint");
        return (
            StatusCode::BAD_GATEWAY,
            format!("Failed to fetch metrics: received status {status}"),
        )
            .into_response();
    }

    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "Failed to read metrics response body");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to read metrics: {e}"),
            )
                .into_response();
        }
    };

    let accepts_json = headers
        .get(header::ACCEPT)
        .and_then(|accept| accept.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"));

    if accepts_json {
        let filtered: Vec<MetricFamily> = parse_families(&body)
            .into_iter()
            .filter(|family| METRIC_ALLOWLIST.contains(&family.name.as_str()))
            .collect();
        return Json(filtered).into_response();
    }

    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
        .into_response()
}

/// Parses a Prometheus text exposition into families.
///
/// Samples whose name carries a histogram/summary suffix (`_bucket`,
/// `_sum`, `_count`) fold into the family announced by `# TYPE`.
pub fn parse_families(text: &str) -> Vec<MetricFamily> {
    let mut families: Vec<MetricFamily> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("# HELP ") {
            if let Some((name, help)) = rest.split_once(' ') {
                let at = family_at(&mut families, &mut index, name);
                families[at].help = help.to_string();
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("# TYPE ") {
            if let Some((name, family_type)) = rest.split_once(' ') {
                let at = family_at(&mut families, &mut index, name);
                families[at].family_type = family_type.to_string();
            }
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        let Some((name, sample)) = parse_sample(line) else {
            continue;
        };
        let family_name = base_family_name(&name, &index);
        let at = family_at(&mut families, &mut index, &family_name);
        families[at].metrics.push(sample);
    }

    families
}

fn family_at(
    families: &mut Vec<MetricFamily>,
    index: &mut HashMap<String, usize>,
    name: &str,
) -> usize {
    if let Some(&at) = index.get(name) {
        return at;
    }
    families.push(MetricFamily {
        name: name.to_string(),
        ..Default::default()
    });
    let at = families.len() - 1;
    index.insert(name.to_string(), at);
    at
}

/// Resolves a sample name to its family, folding histogram/summary series.
fn base_family_name(sample_name: &str, index: &HashMap<String, usize>) -> String {
    if index.contains_key(sample_name) {
        return sample_name.to_string();
    }
    for suffix in ["_bucket", "_sum", "_count"] {
        if let Some(stripped) = sample_name.strip_suffix(suffix) {
            if index.contains_key(stripped) {
                return stripped.to_string();
            }
        }
    }
    sample_name.to_string()
}

fn parse_sample(line: &str) -> Option<(String, MetricSample)> {
    let (name, labels, rest) = match line.find('{') {
        Some(open) => {
            let close = line.rfind('}')?;
            (
                &line[..open],
                parse_labels(&line[open + 1..close]),
                line[close + 1..].trim(),
            )
        }
        None => {
            let (name, rest) = line.split_once(char::is_whitespace)?;
            (name, BTreeMap::new(), rest.trim())
        }
    };

    let value = rest.split_whitespace().next()?.to_string();
    Some((
        name.to_string(),
        MetricSample { labels, value },
    ))
}

/// Parses `k1="v1",k2="v2"` label pairs, honoring escaped quotes.
fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    let mut chars = raw.chars().peekable();

    loop {
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' {
                break;
            }
            chars.next();
            if c != ',' && !c.is_whitespace() {
                key.push(c);
            }
        }
        if chars.next().is_none() {
            break;
        }
        if chars.peek() != Some(&'"') {
            break;
        }
        chars.next();

        let mut value = String::new();
        let mut escaped = false;
        for c in chars.by_ref() {
            if escaped {
                value.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                break;
            } else {
                value.push(c);
            }
        }
        if !key.is_empty() {
            labels.insert(key, value);
        }
        if chars.peek().is_none() {
            break;
        }
    }

    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPOSITION: &str = r#"
# HELP couchbase_operator_cluster_ready Whether the cluster is ready
# TYPE couchbase_operator_cluster_ready gauge
couchbase_operator_cluster_ready{cluster="alpha"} 1
couchbase_operator_cluster_ready{cluster="beta"} 0
# HELP controller_runtime_reconcile_time_seconds Reconcile latency
# TYPE controller_runtime_reconcile_time_seconds histogram
controller_runtime_reconcile_time_seconds_bucket{le="0.005"} 12
controller_runtime_reconcile_time_seconds_sum 0.8
controller_runtime_reconcile_time_seconds_count 14
# HELP go_goroutines Number of goroutines
# TYPE go_goroutines gauge
go_goroutines 42
"#;

    #[test]
    fn families_are_grouped_with_help_and_type() {
        let families = parse_families(EXPOSITION);
        let ready = families
            .iter()
            .find(|f| f.name == "couchbase_operator_cluster_ready")
            .expect("family present");
        assert_eq!(ready.family_type, "gauge");
        assert_eq!(ready.metrics.len(), 2);
        assert_eq!(ready.metrics[0].labels["cluster"], "alpha");
        assert_eq!(ready.metrics[0].value, "1");
    }

    #[test]
    fn histogram_series_fold_into_one_family() {
        let families = parse_families(EXPOSITION);
        let histogram = families
            .iter()
            .find(|f| f.name == "controller_runtime_reconcile_time_seconds")
            .expect("family present");
        assert_eq!(histogram.metrics.len(), 3);
        assert_eq!(histogram.metrics[0].labels["le"], "0.005");
    }

    #[test]
    fn allowlist_filter_drops_unlisted_families() {
        let filtered: Vec<MetricFamily> = parse_families(EXPOSITION)
            .into_iter()
            .filter(|family| METRIC_ALLOWLIST.contains(&family.name.as_str()))
            .collect();
        assert!(filtered.iter().any(|f| f.name == "couchbase_operator_cluster_ready"));
        assert!(!filtered.iter().any(|f| f.name == "go_goroutines"));
    }

    #[test]
    fn labels_with_escapes_parse() {
        let labels = parse_labels(r#"path="/api\"v1\"",code="200""#);
        assert_eq!(labels["path"], "/api\"v1\"");
        assert_eq!(labels["code"], "200");
    }

    #[test]
    fn unlabeled_sample_parses() {
        let (name, sample) = parse_sample("go_goroutines 42").unwrap();
        assert_eq!(name, "go_goroutines");
        assert!(sample.labels.is_empty());
        assert_eq!(sample.value, "42");
    }
}

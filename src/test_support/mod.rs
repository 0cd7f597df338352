//! Test doubles for the orchestrator boundary.
//!
//! `MockPlatform` is the mockall mock for expectation-style tests;
//! `FakePlatform` is a programmable in-memory platform for tests that need
//! live watch channels or log streams.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::PlatformError;
use crate::platform::{
    LogStream, LogStreamOptions, PlatformClient, PlatformEvent, RawWatchEvent,
};

mockall::mock! {
    pub Platform {}

    #[async_trait]
    impl PlatformClient for Platform {
        async fn list_clusters(
            &self,
            namespace: &str,
        ) -> std::result::Result<Vec<serde_json::Value>, PlatformError>;

        async fn watch_clusters(
            &self,
            namespace: &str,
        ) -> std::result::Result<mpsc::Receiver<RawWatchEvent>, PlatformError>;

        async fn list_events(
            &self,
            namespace: &str,
        ) -> std::result::Result<Vec<PlatformEvent>, PlatformError>;

        async fn watch_events(
            &self,
            namespace: &str,
        ) -> std::result::Result<mpsc::Receiver<PlatformEvent>, PlatformError>;

        async fn pod_labels(
            &self,
            namespace: &str,
            name: &str,
        ) -> std::result::Result<HashMap<String, String>, PlatformError>;

        async fn operator_pods(
            &self,
            namespace: &str,
        ) -> std::result::Result<Vec<String>, PlatformError>;

        async fn pod_log_stream(
            &self,
            namespace: &str,
            pod: &str,
            options: LogStreamOptions,
        ) -> std::result::Result<LogStream, PlatformError>;
    }
}

/// Programmable in-memory platform.
#[derive(Default)]
pub struct FakePlatform {
    /// Returned by `list_events`.
    pub initial_events: Mutex<Vec<PlatformEvent>>,
    /// Senders of every watch subscription opened through `watch_events`.
    pub event_watch_txs: Mutex<Vec<mpsc::Sender<PlatformEvent>>>,
    /// Pod name -> labels; missing pods yield `NotFound`.
    pub pod_labels: Mutex<HashMap<String, HashMap<String, String>>>,
    /// Returned by `operator_pods`.
    pub operator_pods: Mutex<Vec<String>>,
    /// Log lines served by `pod_log_stream`, already newline-free.
    pub log_lines: Mutex<Vec<String>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_initial_events(&self, events: Vec<PlatformEvent>) {
        *self.initial_events.lock().unwrap() = events;
    }

    pub fn set_pod_labels(&self, pod: &str, labels: &[(&str, &str)]) {
        self.pod_labels.lock().unwrap().insert(
            pod.to_string(),
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }

    pub fn set_operator_pods(&self, pods: &[&str]) {
        *self.operator_pods.lock().unwrap() = pods.iter().map(|p| p.to_string()).collect();
    }

    pub fn set_log_lines(&self, lines: &[&str]) {
        *self.log_lines.lock().unwrap() = lines.iter().map(|l| l.to_string()).collect();
    }

    /// Pushes a live event into every open watch subscription.
    pub async fn emit_event(&self, event: PlatformEvent) {
        let txs: Vec<mpsc::Sender<PlatformEvent>> =
            self.event_watch_txs.lock().unwrap().clone();
        for tx in txs {
            let _ = tx.send(event.clone()).await;
        }
    }

    /// Number of watch subscriptions whose receiver is still alive.
    pub fn open_event_watches(&self) -> usize {
        self.event_watch_txs
            .lock()
            .unwrap()
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

#[async_trait]
impl PlatformClient for FakePlatform {
    async fn list_clusters(
        &self,
        _namespace: &str,
    ) -> std::result::Result<Vec<serde_json::Value>, PlatformError> {
        Ok(Vec::new())
    }

    async fn watch_clusters(
        &self,
        _namespace: &str,
    ) -> std::result::Result<mpsc::Receiver<RawWatchEvent>, PlatformError> {
        let (_tx, rx) = mpsc::channel(8);
        Ok(rx)
    }

    async fn list_events(
        &self,
        _namespace: &str,
    ) -> std::result::Result<Vec<PlatformEvent>, PlatformError> {
        Ok(self.initial_events.lock().unwrap().clone())
    }

    async fn watch_events(
        &self,
        _namespace: &str,
    ) -> std::result::Result<mpsc::Receiver<PlatformEvent>, PlatformError> {
        let (tx, rx) = mpsc::channel(64);
        self.event_watch_txs.lock().unwrap().push(tx);
        Ok(rx)
    }

    async fn pod_labels(
        &self,
        _namespace: &str,
        name: &str,
    ) -> std::result::Result<HashMap<String, String>, PlatformError> {
        match self.pod_labels.lock().unwrap().get(name) {
            Some(labels) => Ok(labels.clone()),
            None => Err(PlatformError::NotFound {
                kind: "Pod",
                name: name.to_string(),
            }),
        }
    }

    async fn operator_pods(
        &self,
        _namespace: &str,
    ) -> std::result::Result<Vec<String>, PlatformError> {
        Ok(self.operator_pods.lock().unwrap().clone())
    }

    async fn pod_log_stream(
        &self,
        _namespace: &str,
        _pod: &str,
        _options: LogStreamOptions,
    ) -> std::result::Result<LogStream, PlatformError> {
        let mut buffer = String::new();
        for line in self.log_lines.lock().unwrap().iter() {
            buffer.push_str(line);
            buffer.push('\n');
        }
        Ok(Box::new(tokio::io::BufReader::new(std::io::Cursor::new(
            buffer.into_bytes(),
        ))))
    }
}

/// Convenience constructor for event fixtures.
pub fn platform_event(kind: &str, name: &str, namespace: &str) -> PlatformEvent {
    PlatformEvent {
        name: format!("ev-{name}"),
        message: format!("synthetic event for {name}"),
        involved_kind: kind.to_string(),
        involved_name: name.to_string(),
        involved_namespace: namespace.to_string(),
    }
}

//! Central broadcast loop and shared broker state.
//!
//! A single dispatcher task drains the shared message channel and routes
//! each message to the eligible clients. Every iteration runs two phases in
//! order: first drain the deferred queues of clients whose replay finished,
//! then receive and dispatch one message. That discipline is what gives
//! each client the ordering guarantee: cached events, then events deferred
//! during replay, then live traffic.
//!
//! All client writes are non-blocking queue pushes; any failed push closes
//! that client and removes it from every set.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::events::{EventCache, EventWatcherPool};
use crate::logs::{self, LogSessionOptions};
use crate::message::{ClusterEvent, ConditionsSnapshot, Frame, Message};
use crate::platform::PlatformClient;

use super::replay::replay_cached_events;
use super::session::{ClientHandle, ClientId};

/// State shared between the dispatcher, connection handlers and replay
/// tasks.
pub struct BrokerState {
    clients: RwLock<HashMap<ClientId, Arc<ClientHandle>>>,
    /// Clients with a non-empty deferred queue, visited by the
    /// drain-pending phase.
    pending: Mutex<HashSet<ClientId>>,
    next_client_id: AtomicU64,
    cache: Arc<EventCache>,
    pool: EventWatcherPool,
    broadcast: mpsc::Sender<Message>,
    platform: Arc<dyn PlatformClient>,
    namespace: String,
}

impl BrokerState {
    pub(super) fn new(
        platform: Arc<dyn PlatformClient>,
        cache: Arc<EventCache>,
        pool: EventWatcherPool,
        broadcast: mpsc::Sender<Message>,
        namespace: String,
    ) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            next_client_id: AtomicU64::new(1),
            cache,
            pool,
            broadcast,
            platform,
            namespace,
        }
    }

    /// Sender side of the shared broadcast channel.
    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.broadcast.clone()
    }

    pub fn platform(&self) -> Arc<dyn PlatformClient> {
        Arc::clone(&self.platform)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap().len()
    }

    pub fn pool(&self) -> &EventWatcherPool {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<EventCache> {
        &self.cache
    }

    /// Registers a new connection: fresh session state, inserted into the
    /// connected set. Returns the handle plus the receivers the connection
    /// task owns.
    pub fn register_client(
        &self,
    ) -> (Arc<ClientHandle>, mpsc::Receiver<Frame>, watch::Receiver<()>) {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (handle, outbound_rx, close_rx) = ClientHandle::new(id);
        let count = {
            let mut clients = self.clients.write().unwrap();
            clients.insert(id, Arc::clone(&handle));
            clients.len()
        };
        info!(client_id = id, active_clients = count, "Client connected");
        (handle, outbound_rx, close_rx)
    }

    /// Removes a client from every set, cancels its log task, signals its
    /// connection closed, and reconciles the watcher pool. Idempotent.
    pub fn remove_client(&self, id: ClientId) {
        let (handle, remaining) = {
            let mut clients = self.clients.write().unwrap();
            let handle = clients.remove(&id);
            (handle, clients.len())
        };
        self.pending.lock().unwrap().remove(&id);

        let Some(handle) = handle else { return };
        if handle.cancel_log_task() {
            debug!(client_id = id, "Client log watcher cancelled");
        }
        handle.signal_close();
        info!(client_id = id, remaining_clients = remaining, "Client disconnected");

        self.reconcile_watchers();
    }

    /// Union of every connected client's watch set.
    pub fn active_clusters(&self) -> HashSet<String> {
        let clients = self.clients.read().unwrap();
        let mut active = HashSet::new();
        for handle in clients.values() {
            for cluster in handle.state().watch_set.iter() {
                active.insert(cluster.clone());
            }
        }
        active
    }

    /// Stops watchers that lost their last subscriber.
    pub fn reconcile_watchers(&self) {
        let active = self.active_clusters();
        self.pool.reconcile(&active);
    }

    /// Handles a `clustersevents` frame: new watch set and event session,
    /// cleared deferral state, a watcher plus replay task per cluster, and
    /// a final pool reconciliation.
    pub async fn subscribe_events(
        &self,
        client: &Arc<ClientHandle>,
        session_id: String,
        clusters: Vec<String>,
    ) {
        debug!(
            client_id = client.id(),
            session_id,
            clusters = ?clusters,
            "Client requested cluster events"
        );
        {
            let mut state = client.state();
            state.event_session_id = session_id;
            state.deferred.clear();
            state.watch_set = clusters.iter().cloned().collect();
        }
        self.pending.lock().unwrap().remove(&client.id());

        for cluster in &clusters {
            self.pool.start_for(cluster).await;
            tokio::spawn(replay_cached_events(
                self.broadcast.clone(),
                Arc::clone(&self.cache),
                Arc::clone(client),
                cluster.clone(),
            ));
        }

        self.reconcile_watchers();
    }

    /// Handles a `logs` frame with a non-empty session id: cancels any
    /// prior log task and spawns a fresh one bound to the new session.
    pub fn start_log_session(
        &self,
        client: &Arc<ClientHandle>,
        session_id: String,
        options: LogSessionOptions,
    ) {
        if client.cancel_log_task() {
            debug!(client_id = client.id(), "Previous log watcher cancelled for new request");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        {
            let mut state = client.state();
            state.log_session_id = session_id.clone();
            state.log_shutdown = Some(shutdown_tx);
        }

        tokio::spawn(logs::run_log_stream(
            self.platform(),
            self.broadcast.clone(),
            self.namespace.clone(),
            session_id,
            options,
            shutdown_rx,
        ));
    }

    /// Handles a `logs` frame with an empty session id.
    pub fn stop_log_session(&self, client: &Arc<ClientHandle>) {
        if client.cancel_log_task() {
            debug!(client_id = client.id(), "Log watcher stopped by client request");
        }
    }

    fn client(&self, id: ClientId) -> Option<Arc<ClientHandle>> {
        self.clients.read().unwrap().get(&id).cloned()
    }

    fn client_snapshot(&self) -> Vec<Arc<ClientHandle>> {
        self.clients.read().unwrap().values().cloned().collect()
    }

    fn mark_pending(&self, id: ClientId) {
        self.pending.lock().unwrap().insert(id);
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self, id: ClientId) -> bool {
        self.pending.lock().unwrap().contains(&id)
    }
}

/// The dispatcher. Owns the receive side of the shared message channel.
pub struct Broker {
    state: Arc<BrokerState>,
    rx: mpsc::Receiver<Message>,
}

impl Broker {
    pub(super) fn new(state: Arc<BrokerState>, rx: mpsc::Receiver<Message>) -> Self {
        Self { state, rx }
    }

    pub fn state(&self) -> Arc<BrokerState> {
        Arc::clone(&self.state)
    }

    /// Runs the dispatch loop until shutdown or channel closure.
    pub async fn run(mut self, mut shutdown: watch::Receiver<()>) {
        info!("Message dispatcher started");
        loop {
            self.drain_pending();
            tokio::select! {
                _ = shutdown.changed() => break,
                delivery = self.rx.recv() => match delivery {
                    Some(message) => self.dispatch(message),
                    None => break,
                }
            }
        }
        info!("Message dispatcher stopped");
    }

    /// Phase 1: deliver deferred events of clients whose replay finished.
    ///
    /// Clients still replaying stay in the pending set untouched. A write
    /// failure mid-drain terminates that client without attempting its
    /// remaining deferred messages.
    pub(crate) fn drain_pending(&self) {
        let pending: Vec<ClientId> = {
            self.state.pending.lock().unwrap().iter().copied().collect()
        };

        for id in pending {
            let Some(handle) = self.state.client(id) else {
                self.state.pending.lock().unwrap().remove(&id);
                continue;
            };

            let deferred = {
                let mut state = handle.state();
                if state.replaying {
                    continue;
                }
                std::mem::take(&mut state.deferred)
            };

            debug!(client_id = id, queued_events = deferred.len(), "Draining deferred events");
            let mut failed = false;
            for frame in deferred {
                if handle.send(frame).is_err() {
                    failed = true;
                    break;
                }
            }

            if failed {
                warn!(client_id = id, "Failed draining deferred events, disconnecting client");
                self.state.remove_client(id);
            } else {
                self.state.pending.lock().unwrap().remove(&id);
            }
        }
    }

    /// Phase 2: route one message from the shared channel.
    pub(crate) fn dispatch(&self, message: Message) {
        match message {
            Message::ClustersList { clusters } => {
                debug!(cluster_count = clusters.len(), "Broadcasting cluster list");
                self.broadcast_frame(Frame::Clusters { clusters });
            }
            Message::Conditions { conditions } => {
                debug!(cluster_count = conditions.len(), "Broadcasting cluster conditions");
                self.broadcast_conditions(conditions);
            }
            Message::Event { event } => self.dispatch_event(event),
            Message::CachedEvent { event, session_id } => {
                self.dispatch_cached_event(event, session_id)
            }
            Message::Log { session_id, line } => self.dispatch_log(session_id, line),
        }
    }

    fn broadcast_conditions(&self, conditions: ConditionsSnapshot) {
        self.broadcast_frame(Frame::ClusterConditions { conditions });
    }

    /// Snapshot frames go to every connected client.
    fn broadcast_frame(&self, frame: Frame) {
        let mut failed = Vec::new();
        for handle in self.state.client_snapshot() {
            if handle.send(frame.clone()).is_err() {
                failed.push(handle.id());
            }
        }
        self.disconnect_failed(failed);
    }

    /// Live events: cache first, then deliver or defer per client.
    fn dispatch_event(&self, event: ClusterEvent) {
        self.state.cache.append(&event.cluster_name, event.clone());

        let mut failed = Vec::new();
        for handle in self.state.client_snapshot() {
            let frame = {
                let mut state = handle.state();
                if !state.watch_set.contains(&event.cluster_name) {
                    continue;
                }
                let frame = Frame::Event {
                    event: event.clone(),
                    session_id: state.event_session_id.clone(),
                };
                if state.replaying {
                    state.deferred.push_back(frame);
                    None
                } else {
                    Some(frame)
                }
            };

            match frame {
                Some(frame) => {
                    if handle.send(frame).is_err() {
                        failed.push(handle.id());
                    }
                }
                None => self.state.mark_pending(handle.id()),
            }
        }
        self.disconnect_failed(failed);
    }

    /// Cached events target exactly the client whose current event session
    /// matches the stamp; a stale stamp silently drops.
    fn dispatch_cached_event(&self, event: ClusterEvent, session_id: String) {
        let mut failed = Vec::new();
        for handle in self.state.client_snapshot() {
            let eligible = {
                let state = handle.state();
                state.watch_set.contains(&event.cluster_name)
                    && state.event_session_id == session_id
            };
            if !eligible {
                continue;
            }
            let frame = Frame::CachedEvent {
                event: event.clone(),
                session_id: session_id.clone(),
            };
            if handle.send(frame).is_err() {
                failed.push(handle.id());
            }
        }
        self.disconnect_failed(failed);
    }

    fn dispatch_log(&self, session_id: String, line: String) {
        let mut failed = Vec::new();
        for handle in self.state.client_snapshot() {
            let eligible = { handle.state().log_session_id == session_id };
            if !eligible {
                continue;
            }
            let frame = Frame::Log {
                session_id: session_id.clone(),
                message: line.clone(),
            };
            if handle.send(frame).is_err() {
                failed.push(handle.id());
            }
        }
        self.disconnect_failed(failed);
    }

    fn disconnect_failed(&self, failed: Vec<ClientId>) {
        for id in failed {
            warn!(client_id = id, "Failed to send message to client, disconnecting");
            self.state.remove_client(id);
        }
    }
}

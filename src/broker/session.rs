//! Per-client session state.
//!
//! A [`ClientHandle`] is created on connection open and shared between the
//! connection task, the dispatcher and replay tasks. All mutable per-client
//! fields live behind one mutex; none of the critical sections span an
//! await point.
//!
//! Outbound delivery goes through a bounded queue drained by the connection
//! task. The dispatcher never blocks on a socket: a queue that is full or
//! closed counts as a write failure and disconnects the client.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};

use crate::constants::CLIENT_OUTBOUND_CAPACITY;
use crate::message::Frame;

pub type ClientId = u64;

/// Error returned by [`ClientHandle::send`]; the client must be treated as
/// disconnected.
#[derive(Debug)]
pub struct SendError;

pub struct ClientHandle {
    id: ClientId,
    outbound: mpsc::Sender<Frame>,
    state: Mutex<ClientState>,
    /// Signals the connection task to close the socket.
    close: watch::Sender<()>,
}

#[derive(Default)]
pub struct ClientState {
    /// Cluster names this client receives events for.
    pub watch_set: HashSet<String>,
    /// Epoch id of the current event subscription, stamped on every event
    /// delivered to this client.
    pub event_session_id: String,
    /// Epoch id of the current log session; empty when none.
    pub log_session_id: String,
    /// Dropping this cancels the running log task.
    pub log_shutdown: Option<watch::Sender<()>>,
    /// Set while a replay task is pushing cached events for this client.
    pub replaying: bool,
    /// Live events that arrived while `replaying` was set, in arrival order.
    pub deferred: VecDeque<Frame>,
}

impl ClientHandle {
    /// Creates a handle plus the receivers owned by the connection task:
    /// the outbound frame queue and the close signal.
    pub fn new(id: ClientId) -> (Arc<Self>, mpsc::Receiver<Frame>, watch::Receiver<()>) {
        let (outbound, outbound_rx) = mpsc::channel(CLIENT_OUTBOUND_CAPACITY);
        let (close, close_rx) = watch::channel(());
        let handle = Arc::new(Self {
            id,
            outbound,
            state: Mutex::new(ClientState::default()),
            close,
        });
        (handle, outbound_rx, close_rx)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap()
    }

    /// Enqueues one frame for the connection task to write.
    ///
    /// Fails when the queue is full (client too slow) or closed (connection
    /// task gone); both mean the client is done.
    pub fn send(&self, frame: Frame) -> Result<(), SendError> {
        self.outbound.try_send(frame).map_err(|_| SendError)
    }

    /// Tells the connection task to close the socket.
    pub fn signal_close(&self) {
        let _ = self.close.send(());
    }

    /// Cancels the active log task, if any, and clears the log session.
    /// Returns true when a task was actually cancelled.
    pub fn cancel_log_task(&self) -> bool {
        let shutdown = {
            let mut state = self.state();
            state.log_session_id.clear();
            state.log_shutdown.take()
        };
        shutdown.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_fails_once_queue_is_full() {
        let (handle, _outbound_rx, _close_rx) = ClientHandle::new(1);
        for _ in 0..CLIENT_OUTBOUND_CAPACITY {
            handle
                .send(Frame::Clusters { clusters: vec![] })
                .expect("queue has room");
        }
        assert!(handle.send(Frame::Clusters { clusters: vec![] }).is_err());
    }

    #[test]
    fn send_fails_after_connection_task_drops_receiver() {
        let (handle, outbound_rx, _close_rx) = ClientHandle::new(1);
        drop(outbound_rx);
        assert!(handle.send(Frame::Clusters { clusters: vec![] }).is_err());
    }

    #[test]
    fn cancel_log_task_clears_session_and_reports_prior_task() {
        let (handle, _outbound_rx, _close_rx) = ClientHandle::new(1);
        assert!(!handle.cancel_log_task());

        let (shutdown_tx, _shutdown_rx) = tokio::sync::watch::channel(());
        {
            let mut state = handle.state();
            state.log_session_id = "L1".to_string();
            state.log_shutdown = Some(shutdown_tx);
        }
        assert!(handle.cancel_log_task());
        assert!(handle.state().log_session_id.is_empty());
        assert!(handle.state().log_shutdown.is_none());
    }
}

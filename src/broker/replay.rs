//! Replay task: one-shot transfer of a cluster's event cache to one client.
//!
//! The task never writes to the client directly; it pushes session-stamped
//! `cachedevent` messages onto the shared broadcast channel, so replayed
//! and live traffic stay serialized through the single dispatcher. While
//! the task runs, the client's replay flag routes live events into its
//! deferred queue; the flag is cleared on every exit path via a drop guard.
//!
//! The session id is captured once, up front. If the client re-subscribes
//! with a new id mid-replay, the dispatcher drops the stale cached events
//! because their stamp no longer matches.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::events::EventCache;
use crate::message::Message;

use super::session::ClientHandle;

/// Clears the replay flag on drop, including panic and cancellation paths.
struct ReplayGuard {
    client: Arc<ClientHandle>,
}

impl Drop for ReplayGuard {
    fn drop(&mut self) {
        self.client.state().replaying = false;
    }
}

pub async fn replay_cached_events(
    broadcast: mpsc::Sender<Message>,
    cache: Arc<EventCache>,
    client: Arc<ClientHandle>,
    cluster: String,
) {
    let snapshot = match cache.snapshot(&cluster) {
        Some(snapshot) if !snapshot.is_empty() => snapshot,
        _ => {
            debug!(cluster, client_id = client.id(), "No cached events to replay");
            return;
        }
    };

    let session_id = client.state().event_session_id.clone();
    debug!(
        cluster,
        client_id = client.id(),
        session_id,
        event_count = snapshot.len(),
        "Replaying cached events"
    );

    client.state().replaying = true;
    let _guard = ReplayGuard {
        client: Arc::clone(&client),
    };

    for event in snapshot {
        let message = Message::CachedEvent {
            event,
            session_id: session_id.clone(),
        };
        if broadcast.send(message).await.is_err() {
            debug!(cluster, "Broadcast channel closed during replay");
            break;
        }
    }
}

//! The concurrent fan-in/fan-out broker.
//!
//! ```text
//! watch callbacks ─┐
//! watcher tasks   ─┼─> broadcast channel ─> dispatcher ─> per-client queues
//! replay tasks    ─┤                            │
//! log tasks       ─┘                            └─> connection tasks ─> sockets
//! ```
//!
//! Exactly one dispatcher task consumes the shared channel; replay tasks
//! write onto the same channel so replayed and live traffic serialize
//! naturally.

mod dispatch;
mod replay;
mod session;

#[cfg(test)]
mod dispatch_test;

pub use dispatch::{Broker, BrokerState};
pub use session::{ClientHandle, ClientId, ClientState};

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::constants::BROADCAST_CHANNEL_CAPACITY;
use crate::events::{EventCache, EventWatcherPool};
use crate::platform::PlatformClient;

/// Wires up the broadcast channel, event cache, watcher pool and shared
/// state, returning the dispatcher to spawn and the state to share.
pub fn build(platform: Arc<dyn PlatformClient>, namespace: String) -> (Broker, Arc<BrokerState>) {
    let (tx, rx) = mpsc::channel(BROADCAST_CHANNEL_CAPACITY);
    let cache = Arc::new(EventCache::new());
    let pool = EventWatcherPool::new(
        Arc::clone(&platform),
        Arc::clone(&cache),
        tx.clone(),
        namespace.clone(),
    );
    let state = Arc::new(BrokerState::new(platform, cache, pool, tx, namespace));
    let broker = Broker::new(Arc::clone(&state), rx);
    (broker, state)
}

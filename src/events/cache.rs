//! Per-cluster bounded event cache.
//!
//! One FIFO of recently observed events per cluster with a live watcher.
//! Appends evict the oldest entry once the capacity is reached; snapshots
//! copy. Entries are stored untagged and stamped `cachedevent` only when a
//! replay hands them to a specific client.

use std::collections::VecDeque;

use dashmap::DashMap;

use crate::constants::EVENT_CACHE_CAPACITY;
use crate::message::ClusterEvent;

pub struct EventCache {
    caches: DashMap<String, VecDeque<ClusterEvent>>,
    capacity: usize,
}

impl EventCache {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            caches: DashMap::new(),
            capacity,
        }
    }

    /// Seeds a cluster's cache from a one-shot event list. Only the newest
    /// `capacity` entries are kept.
    pub fn seed(&self, cluster: &str, events: Vec<ClusterEvent>) {
        let mut queue: VecDeque<ClusterEvent> = events.into();
        while queue.len() > self.capacity {
            queue.pop_front();
        }
        self.caches.insert(cluster.to_string(), queue);
    }

    /// Appends one event, evicting the oldest entry at capacity.
    ///
    /// A cache entry exists only while the cluster's watcher does; events
    /// still in flight after the watcher was reconciled away are dropped
    /// rather than resurrecting the entry.
    pub fn append(&self, cluster: &str, event: ClusterEvent) {
        let Some(mut queue) = self.caches.get_mut(cluster) else {
            return;
        };
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(event);
    }

    /// Copy of the current sequence, `None` when no watcher seeded it.
    pub fn snapshot(&self, cluster: &str) -> Option<Vec<ClusterEvent>> {
        self.caches
            .get(cluster)
            .map(|queue| queue.iter().cloned().collect())
    }

    /// Drops a cluster's cache when its watcher stops.
    pub fn remove(&self, cluster: &str) {
        self.caches.remove(cluster);
    }

    pub fn contains(&self, cluster: &str) -> bool {
        self.caches.contains_key(cluster)
    }

    pub fn len(&self, cluster: &str) -> usize {
        self.caches.get(cluster).map(|q| q.len()).unwrap_or(0)
    }
}

impl Default for EventCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(cluster: &str, seq: usize) -> ClusterEvent {
        ClusterEvent {
            cluster_name: cluster.to_string(),
            name: format!("ev-{seq}"),
            message: format!("message {seq}"),
            kind: "Pod".to_string(),
            object_name: format!("{cluster}-{seq:04}"),
        }
    }

    #[test]
    fn append_preserves_insertion_order() {
        let cache = EventCache::with_capacity(10);
        cache.seed("alpha", Vec::new());
        for seq in 0..3 {
            cache.append("alpha", event("alpha", seq));
        }

        let snapshot = cache.snapshot("alpha").expect("cache entry exists");
        let names: Vec<&str> = snapshot.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["ev-0", "ev-1", "ev-2"]);
    }

    #[test]
    fn append_at_capacity_evicts_exactly_the_oldest() {
        let cache = EventCache::with_capacity(3);
        cache.seed("alpha", Vec::new());
        for seq in 0..3 {
            cache.append("alpha", event("alpha", seq));
        }
        assert_eq!(cache.len("alpha"), 3);

        cache.append("alpha", event("alpha", 3));

        assert_eq!(cache.len("alpha"), 3);
        let snapshot = cache.snapshot("alpha").unwrap();
        assert_eq!(snapshot[0].name, "ev-1");
        assert_eq!(snapshot[2].name, "ev-3");
    }

    #[test]
    fn seed_truncates_to_newest_entries() {
        let cache = EventCache::with_capacity(2);
        cache.seed("alpha", (0..5).map(|seq| event("alpha", seq)).collect());

        let snapshot = cache.snapshot("alpha").unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name, "ev-3");
        assert_eq!(snapshot[1].name, "ev-4");
    }

    #[test]
    fn append_without_watcher_entry_is_dropped() {
        let cache = EventCache::with_capacity(10);
        cache.append("alpha", event("alpha", 0));
        assert!(!cache.contains("alpha"));

        // The same holds after the entry is removed again
        cache.seed("alpha", Vec::new());
        cache.remove("alpha");
        cache.append("alpha", event("alpha", 1));
        assert!(!cache.contains("alpha"));
    }

    #[test]
    fn snapshot_is_a_copy() {
        let cache = EventCache::with_capacity(10);
        cache.seed("alpha", Vec::new());
        cache.append("alpha", event("alpha", 0));

        let snapshot = cache.snapshot("alpha").unwrap();
        cache.append("alpha", event("alpha", 1));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(cache.len("alpha"), 2);
    }

    #[test]
    fn clusters_are_isolated() {
        let cache = EventCache::with_capacity(10);
        cache.seed("alpha", Vec::new());
        cache.seed("beta", Vec::new());
        cache.append("alpha", event("alpha", 0));
        cache.append("beta", event("beta", 0));

        assert_eq!(cache.len("alpha"), 1);
        assert_eq!(cache.len("beta"), 1);

        cache.remove("alpha");
        assert!(!cache.contains("alpha"));
        assert!(cache.contains("beta"));
    }

    #[test]
    fn snapshot_of_unknown_cluster_is_none() {
        let cache = EventCache::new();
        assert!(cache.snapshot("ghost").is_none());
    }
}

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::Clock;

#[derive(Debug, Default)]
struct Entries {
    // Insertion order; never reordered, so the front is always the oldest
    order: VecDeque<(String, Instant)>,
    index: HashMap<String, Instant>,
}

impl Entries {
    fn purge_expired(&mut self, now: Instant, ttl: Duration) -> usize {
        let mut removed = 0;
        while let Some((_, inserted)) = self.order.front() {
            if *inserted + ttl > now {
                break;
            }
            if let Some((key, _)) = self.order.pop_front() {
                self.index.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let (key, _) = self.order.pop_front()?;
        self.index.remove(&key);
        Some(key)
    }

    fn is_live(&self, key: &str, now: Instant, ttl: Duration) -> bool {
        self.index
            .get(key)
            .map(|inserted| *inserted + ttl > now)
            .unwrap_or(false)
    }
}

/// Bounded, time-aware set of already-handled delivery keys.
///
/// Two independent bounds apply: at most `capacity` keys are kept (the
/// oldest insert is evicted first), and each key expires `ttl` after it was
/// inserted. Expired keys are never reported by `seen`; their memory is
/// reclaimed on the next insert or by the background sweeper.
pub struct DedupStore {
    entries: Mutex<Entries>,
    capacity: usize,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl DedupStore {
    pub fn new(capacity: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            capacity: capacity.max(1),
            ttl,
            clock,
        }
    }

    pub async fn seen(&self, key: &str) -> bool {
        let entries = self.entries.lock().await;
        entries.is_live(key, self.clock.now(), self.ttl)
    }

    /// Record `key`. Marking a live key again is a no-op.
    pub async fn mark(&self, key: &str) {
        self.check_and_mark(key).await;
    }

    /// Atomically test and record `key`. Returns `true` if the key was new.
    pub async fn check_and_mark(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        entries.purge_expired(now, self.ttl);
        if entries.is_live(key, now, self.ttl) {
            return false;
        }

        while entries.index.len() >= self.capacity {
            match entries.evict_oldest() {
                Some(evicted) => debug!("Dedup store full, evicted {}", evicted),
                None => break,
            }
        }

        entries.order.push_back((key.to_string(), now));
        entries.index.insert(key.to_string(), now);
        true
    }

    /// Remove `key` so a later delivery with the same key is accepted again.
    pub async fn forget(&self, key: &str) {
        let mut entries = self.entries.lock().await;
        if entries.index.remove(key).is_some() {
            entries.order.retain(|(k, _)| k != key);
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        entries.purge_expired(now, self.ttl)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.index.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Periodically purge expired entries for as long as the store is alive.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let removed = store.purge_expired().await;
                if removed > 0 {
                    debug!("Swept {} expired dedup entries", removed);
                }
            }
        })
    }
}

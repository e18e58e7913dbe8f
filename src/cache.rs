use crate::config::DedupConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Keyed storage with sliding expiration.
pub trait CacheStore: Send {
    /// Whether `key` is present and unexpired; a hit refreshes it.
    fn get(&mut self, key: &str, now: Instant) -> bool;
    fn set(&mut self, key: &str, now: Instant);
    fn evict(&mut self, key: &str) -> bool;
    fn clear(&mut self);
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded in-memory store. When full, expired entries go first, then the
/// least recently touched one.
pub struct MemoryStore {
    entries: HashMap<String, Instant>,
    capacity: usize,
    sliding_expiration: Duration,
}

impl MemoryStore {
    pub fn new(capacity: usize, sliding_expiration: Duration) -> Self {
        MemoryStore {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            sliding_expiration,
        }
    }

    fn is_expired(&self, touched: Instant, now: Instant) -> bool {
        now.saturating_duration_since(touched) >= self.sliding_expiration
    }

    fn make_room(&mut self, now: Instant) {
        let sliding = self.sliding_expiration;
        self.entries
            .retain(|_, touched| now.saturating_duration_since(*touched) < sliding);

        while self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, touched)| **touched)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

impl CacheStore for MemoryStore {
    fn get(&mut self, key: &str, now: Instant) -> bool {
        let touched = match self.entries.get(key) {
            Some(touched) => *touched,
            None => return false,
        };
        if self.is_expired(touched, now) {
            self.entries.remove(key);
            return false;
        }
        self.entries.insert(key.to_string(), now);
        true
    }

    fn set(&mut self, key: &str, now: Instant) {
        if !self.entries.contains_key(key) && self.entries.len() >= self.capacity {
            self.make_room(now);
        }
        self.entries.insert(key.to_string(), now);
    }

    fn evict(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Remembers which messages were already evaluated.
pub struct DedupCache {
    store: Box<dyn CacheStore>,
    clock: Arc<dyn Clock>,
}

impl DedupCache {
    pub fn new(config: &DedupConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &DedupConfig, clock: Arc<dyn Clock>) -> Self {
        let store = MemoryStore::new(
            config.capacity,
            Duration::from_secs(config.sliding_expiration_hours.saturating_mul(3600)),
        );
        Self::with_store(Box::new(store), clock)
    }

    pub fn with_store(store: Box<dyn CacheStore>, clock: Arc<dyn Clock>) -> Self {
        DedupCache { store, clock }
    }

    /// False the first time `message_id` is offered, true while it stays cached.
    pub fn seen(&mut self, message_id: &str) -> bool {
        let now = self.clock.now();
        if self.store.get(message_id, now) {
            return true;
        }
        self.store.set(message_id, now);
        false
    }

    pub fn forget(&mut self, message_id: &str) -> bool {
        self.store.evict(message_id)
    }

    pub fn reset(&mut self) {
        self.store.clear();
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

//! The set of live relays advertised to matched peers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Registry of relay public addresses.
///
/// Each insertion gets a generation number; removal is a no-op unless
/// the generation matches, so the keepalive loop of a replaced
/// registration cannot evict its successor.
pub struct Registry {
    relays: Mutex<HashMap<String, u64>>,
    next_gen: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            relays: Mutex::new(HashMap::new()),
            next_gen: AtomicU64::new(1),
        }
    }

    /// Inserts (or replaces) a relay, returning the generation to pass
    /// back to [`remove`](Registry::remove).
    pub fn insert(&self, addr: String) -> u64 {
        let generation = self.next_gen.fetch_add(1, Ordering::Relaxed);
        self.relays.lock().unwrap().insert(addr, generation);
        generation
    }

    /// Removes the relay if `generation` still owns the entry.
    pub fn remove(&self, addr: &str, generation: u64) {
        let mut relays = self.relays.lock().unwrap();
        if relays.get(addr).is_some_and(|g| *g == generation) {
            relays.remove(addr);
        }
    }

    /// Snapshot of currently registered relay addresses, unordered.
    pub fn addrs(&self) -> Vec<String> {
        self.relays.lock().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_snapshot() {
        let registry = Registry::new();
        registry.insert("1.2.3.4:7778".to_string());
        registry.insert("5.6.7.8:7778".to_string());

        let mut addrs = registry.addrs();
        addrs.sort();
        assert_eq!(addrs, vec!["1.2.3.4:7778", "5.6.7.8:7778"]);
    }

    #[test]
    fn test_stale_generation_cannot_evict() {
        let registry = Registry::new();
        let old = registry.insert("1.2.3.4:7778".to_string());
        let new = registry.insert("1.2.3.4:7778".to_string());

        registry.remove("1.2.3.4:7778", old);
        assert_eq!(registry.addrs(), vec!["1.2.3.4:7778"]);

        registry.remove("1.2.3.4:7778", new);
        assert!(registry.addrs().is_empty());
    }
}

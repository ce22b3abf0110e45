//! Per-key call throttling.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Remembers the last accepted call per key and rejects calls inside the window.
#[derive(Debug)]
pub struct Throttle<K> {
    window: Duration,
    last: Mutex<HashMap<K, Instant>>,
}

impl<K: Eq + Hash + Clone> Throttle<K> {
    /// Create a throttle with the given window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Record a call for `key` and return true, unless the previous accepted
    /// call for `key` happened less than one window ago.
    pub fn try_acquire(&self, key: &K) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock();

        match last.get(key) {
            Some(at) if now.duration_since(*at) < self.window => false,
            _ => {
                last.insert(key.clone(), now);
                true
            }
        }
    }
}

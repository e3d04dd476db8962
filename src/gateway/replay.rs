//! Short-TTL replay suppression. Single-node: a concurrent map of request
//! fingerprints with an atomic check-and-insert.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::utils::clock::Clock;

pub struct ReplayStore {
    entries: RwLock<HashMap<String, DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
}

impl ReplayStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// True if the fingerprint is live in the store.
    pub fn seen(&self, fingerprint: &str) -> bool {
        let now = self.clock.now();
        self.entries
            .read()
            .unwrap()
            .get(fingerprint)
            .map(|deadline| *deadline > now)
            .unwrap_or(false)
    }

    /// Idempotent: extends nothing if the fingerprint is already live.
    pub fn remember(&self, fingerprint: &str, ttl_ms: u64) {
        let now = self.clock.now();
        let deadline = now + Duration::milliseconds(ttl_ms as i64);
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .entry(fingerprint.to_string())
            .or_insert(deadline);
        if *entry <= now {
            *entry = deadline;
        }
    }

    /// Atomic check-and-insert: for concurrent identical fingerprints,
    /// exactly one caller observes `false`.
    pub fn check_and_remember(&self, fingerprint: &str, ttl_ms: u64) -> bool {
        let now = self.clock.now();
        let deadline = now + Duration::milliseconds(ttl_ms as i64);
        let mut entries = self.entries.write().unwrap();
        match entries.get_mut(fingerprint) {
            Some(existing) if *existing > now => true,
            Some(expired) => {
                *expired = deadline;
                false
            }
            None => {
                entries.insert(fingerprint.to_string(), deadline);
                false
            }
        }
    }

    /// Drop expired fingerprints; called from a background sweep.
    pub fn sweep(&self) {
        let now = self.clock.now();
        self.entries
            .write()
            .unwrap()
            .retain(|_, deadline| *deadline > now);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

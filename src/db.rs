//! Per-database keyspace state
//!
//! One `Db` is a pair of dicts — key -> object and key -> expiry
//! timestamp — plus the bookkeeping for WATCH and blocking list pops.
//! Everything that needs server-wide context (lazy expiration with
//! propagation, hit/miss stats, watcher signalling) lives in the keyspace
//! methods on `Server`; what is here never reaches outside one database.

use crate::dict::Dict;
use crate::object::Value;
use crate::ClientId;
use rand::Rng;
use std::collections::VecDeque;

pub struct Db {
    pub id: usize,
    /// key -> value object
    pub entries: Dict<Value>,
    /// key -> absolute expiry, wall milliseconds. Invariant: every key
    /// here exists in `entries`.
    pub expires: Dict<u64>,
    /// key -> clients that WATCHed it
    pub watched_keys: Dict<Vec<ClientId>>,
    /// key -> clients blocked waiting for a push, FIFO
    pub blocked_keys: Dict<VecDeque<ClientId>>,
    /// keys that received data while clients were blocked on them
    pub ready_keys: Vec<Vec<u8>>,
}

impl Db {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            entries: Dict::new(),
            expires: Dict::new(),
            watched_keys: Dict::new(),
            blocked_keys: Dict::new(),
            ready_keys: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw lookup without expiry semantics.
    pub fn peek(&self, key: &[u8]) -> Option<&Value> {
        self.entries.find(key)
    }

    /// Is the key past its expiry at `now`? Keys without a TTL never are.
    pub fn logically_expired(&self, key: &[u8], now_ms: u64) -> bool {
        match self.expires.find(key) {
            Some(&when) => when <= now_ms,
            None => false,
        }
    }

    pub fn get_expire(&self, key: &[u8]) -> Option<u64> {
        self.expires.find(key).copied()
    }

    /// Attach an expiry. The key must exist.
    pub fn set_expire(&mut self, key: &[u8], when_ms: u64) {
        debug_assert!(self.entries.contains(key), "expiry for a missing key");
        self.expires.upsert(key, when_ms);
    }

    /// Drop a TTL, making the key persistent. True when one existed.
    pub fn remove_expire(&mut self, key: &[u8]) -> bool {
        self.expires.remove(key).is_some()
    }

    /// Unlink a key and its expiry, returning the detached value.
    pub fn remove_entry(&mut self, key: &[u8]) -> Option<Value> {
        let value = self.entries.remove(key)?;
        self.expires.remove(key);
        Some(value)
    }

    /// Uniformly random live key, skipping up to 100 already-expired ones
    /// (their deletion belongs to the expiry paths, not here).
    pub fn random_key(&self, rng: &mut impl Rng, now_ms: u64) -> Option<Vec<u8>> {
        for _ in 0..100 {
            let (key, _) = self.entries.random_entry(rng)?;
            if !self.logically_expired(key, now_ms) {
                return Some(key.to_vec());
            }
        }
        None
    }

    /// Detach the whole keyspace (FLUSHDB); watch and block state stays.
    pub fn take_all(&mut self) -> (Dict<Value>, Dict<u64>) {
        (
            std::mem::take(&mut self.entries),
            std::mem::take(&mut self.expires),
        )
    }

    // ---- watch bookkeeping ----

    pub fn add_watcher(&mut self, key: &[u8], id: ClientId) {
        match self.watched_keys.find_mut(key) {
            Some(ids) => {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            None => {
                let _ = self.watched_keys.insert(key, vec![id]);
            }
        }
    }

    pub fn remove_watcher(&mut self, key: &[u8], id: ClientId) {
        if let Some(ids) = self.watched_keys.find_mut(key) {
            ids.retain(|&w| w != id);
            if ids.is_empty() {
                self.watched_keys.remove(key);
            }
        }
    }

    pub fn watchers_of(&self, key: &[u8]) -> Vec<ClientId> {
        self.watched_keys.find(key).cloned().unwrap_or_default()
    }

    /// Every client watching any key in this db (database flushes touch
    /// them all).
    pub fn all_watchers(&self) -> Vec<ClientId> {
        let mut out = Vec::new();
        for (_, ids) in self.watched_keys.iter() {
            out.extend_from_slice(ids);
        }
        out
    }

    // ---- blocking bookkeeping ----

    pub fn add_blocked(&mut self, key: &[u8], id: ClientId) {
        match self.blocked_keys.find_mut(key) {
            Some(q) => q.push_back(id),
            None => {
                let mut q = VecDeque::new();
                q.push_back(id);
                let _ = self.blocked_keys.insert(key, q);
            }
        }
    }

    pub fn remove_blocked(&mut self, key: &[u8], id: ClientId) {
        if let Some(q) = self.blocked_keys.find_mut(key) {
            q.retain(|&b| b != id);
            if q.is_empty() {
                self.blocked_keys.remove(key);
            }
        }
    }

    /// Mark a key as ready because a push landed on it while clients were
    /// blocked. Deduplicated per event-loop tick.
    pub fn signal_key_ready(&mut self, key: &[u8]) {
        if self.blocked_keys.contains(key) && !self.ready_keys.iter().any(|k| k == key) {
            self.ready_keys.push(key.to_vec());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Object;
    use rand::thread_rng;
    use std::sync::Arc;

    fn value(s: &str) -> Value {
        Arc::new(Object::string_from(s.as_bytes()))
    }

    #[test]
    fn test_expiry_invariant() {
        let mut db = Db::new(0);
        let _ = db.entries.insert(b"k", value("v"));
        db.set_expire(b"k", 1000);
        assert!(!db.logically_expired(b"k", 999));
        assert!(db.logically_expired(b"k", 1000));
        assert!(db.logically_expired(b"k", 5000));
        assert!(db.remove_expire(b"k"));
        assert!(!db.logically_expired(b"k", 5000));
        assert!(!db.remove_expire(b"k"));
    }

    #[test]
    fn test_remove_entry_clears_expiry() {
        let mut db = Db::new(0);
        let _ = db.entries.insert(b"k", value("v"));
        db.set_expire(b"k", 1);
        let v = db.remove_entry(b"k");
        assert!(v.is_some());
        assert!(db.get_expire(b"k").is_none());
        assert!(db.remove_entry(b"k").is_none());
    }

    #[test]
    fn test_random_key_skips_expired() {
        let mut db = Db::new(0);
        let _ = db.entries.insert(b"dead", value("v"));
        db.set_expire(b"dead", 10);
        let _ = db.entries.insert(b"live", value("v"));
        for _ in 0..20 {
            let k = db.random_key(&mut thread_rng(), 1_000_000).unwrap();
            assert_eq!(k, b"live".to_vec());
        }
    }

    #[test]
    fn test_watchers() {
        let mut db = Db::new(0);
        db.add_watcher(b"k", 1);
        db.add_watcher(b"k", 2);
        db.add_watcher(b"k", 1);
        assert_eq!(db.watchers_of(b"k"), vec![1, 2]);
        db.remove_watcher(b"k", 1);
        assert_eq!(db.watchers_of(b"k"), vec![2]);
        db.remove_watcher(b"k", 2);
        assert!(db.watchers_of(b"k").is_empty());
        assert_eq!(db.watched_keys.len(), 0);
    }

    #[test]
    fn test_blocking_queue_fifo() {
        let mut db = Db::new(0);
        db.add_blocked(b"list", 10);
        db.add_blocked(b"list", 11);
        db.signal_key_ready(b"list");
        db.signal_key_ready(b"list");
        assert_eq!(db.ready_keys.len(), 1);
        let q = db.blocked_keys.find(b"list").unwrap();
        assert_eq!(q.front(), Some(&10));
        db.remove_blocked(b"list", 10);
        let q = db.blocked_keys.find(b"list").unwrap();
        assert_eq!(q.front(), Some(&11));
        db.remove_blocked(b"list", 11);
        assert!(!db.blocked_keys.contains(b"list"));
    }

    #[test]
    fn test_signal_without_blockers_is_noop() {
        let mut db = Db::new(0);
        db.signal_key_ready(b"nobody");
        assert!(db.ready_keys.is_empty());
    }
}

//! Keyspace operations: lookups with lazy expiration, writes with
//! watcher signalling, and the active expiration cycle
//!
//! These live on `Server` rather than `Db` because an expiring key has
//! server-wide consequences: the deletion is propagated downstream and
//! every connection watching the key goes dirty.

use super::Server;
use crate::object::Value;
use rand::thread_rng;
use std::time::Instant;
use tracing::trace;

impl Server {
    pub fn now_ms(&self) -> u64 {
        self.cached_ms
    }

    pub fn update_clock(&mut self) {
        self.cached_ms = self.clock.now_ms();
    }

    /// Lazy expiration: if `key` is past its TTL, delete it (propagating
    /// a DEL downstream) and report true. On a replica nothing is
    /// deleted — the key is only *reported* gone until the primary's
    /// authoritative DEL arrives.
    pub fn expire_if_needed(&mut self, dbid: usize, key: &[u8]) -> bool {
        if !self.dbs[dbid].logically_expired(key, self.cached_ms) {
            return false;
        }
        if self.config.replica {
            return true;
        }
        self.delete_expired(dbid, key);
        true
    }

    fn delete_expired(&mut self, dbid: usize, key: &[u8]) {
        if self.dbs[dbid].remove_entry(key).is_none() {
            return;
        }
        self.stats.expired_keys += 1;
        self.dirty += 1;
        trace!("expired key removed from db {dbid}");
        let argv = vec![b"del".to_vec(), key.to_vec()];
        self.propagate_command(dbid, &argv);
        self.touch_watched_key(dbid, key);
    }

    /// Read-path lookup: lazy-expires, counts hits/misses, refreshes the
    /// object's recency stamp unless `no_touch`.
    pub fn lookup_read(&mut self, dbid: usize, key: &[u8], no_touch: bool) -> Option<Value> {
        self.dbs[dbid].entries.rehash_step();
        self.dbs[dbid].expires.rehash_step();
        if self.expire_if_needed(dbid, key) {
            self.stats.keyspace_misses += 1;
            return None;
        }
        match self.dbs[dbid].peek(key) {
            Some(v) => {
                if !no_touch {
                    v.touch_lru(self.lru_clock);
                }
                self.stats.keyspace_hits += 1;
                Some(v.clone())
            }
            None => {
                self.stats.keyspace_misses += 1;
                None
            }
        }
    }

    /// Write-path lookup: same expiry semantics, no stats or recency
    /// update.
    pub fn lookup_write(&mut self, dbid: usize, key: &[u8]) -> Option<Value> {
        self.dbs[dbid].entries.rehash_step();
        self.dbs[dbid].expires.rehash_step();
        if self.expire_if_needed(dbid, key) {
            return None;
        }
        self.dbs[dbid].peek(key).cloned()
    }

    /// Insert or overwrite a key, clearing any previous TTL unless asked
    /// to keep it. Watchers go dirty; a new list key wakes blockers.
    pub fn set_key(&mut self, dbid: usize, key: &[u8], value: Value, keep_ttl: bool) {
        let is_list = value.object_type() == crate::object::ObjectType::List;
        let existed = self.dbs[dbid].entries.upsert(key, value).is_some();
        if !keep_ttl {
            self.dbs[dbid].expires.remove(key);
        }
        if !existed && is_list {
            self.dbs[dbid].signal_key_ready(key);
        }
        self.touch_watched_key(dbid, key);
        self.dirty += 1;
    }

    /// Remove a key. Synchronous deletion drops the value inline; the
    /// asynchronous flavor hands it to the reclaimer thread.
    pub fn delete_key(&mut self, dbid: usize, key: &[u8], async_free: bool) -> bool {
        let Some(value) = self.dbs[dbid].remove_entry(key) else {
            return false;
        };
        if async_free {
            self.lazyfree.free_object(value);
        }
        self.touch_watched_key(dbid, key);
        self.dirty += 1;
        true
    }

    /// Empty one database, touching every connection that watched any of
    /// its keys.
    pub fn empty_db(&mut self, dbid: usize, async_free: bool) -> usize {
        let removed = self.dbs[dbid].len();
        let (entries, expires) = self.dbs[dbid].take_all();
        if async_free {
            self.lazyfree.free_table(entries);
        }
        drop(expires);
        for id in self.dbs[dbid].all_watchers() {
            self.mark_dirty_cas(id);
        }
        self.dirty += removed as u64;
        removed
    }

    /// Record an in-place mutation of `key`: watchers go dirty and the
    /// change becomes eligible for propagation.
    pub fn signal_write(&mut self, dbid: usize, key: &[u8]) {
        self.touch_watched_key(dbid, key);
        self.dirty += 1;
    }

    /// Mark every connection watching `key` as having a broken
    /// compare-and-set; their next EXEC returns the null result.
    pub fn touch_watched_key(&mut self, dbid: usize, key: &[u8]) {
        if self.dbs[dbid].watched_keys.is_empty() {
            return;
        }
        for id in self.dbs[dbid].watchers_of(key) {
            self.mark_dirty_cas(id);
        }
    }

    /// Timer-driven expiration: sample the expiry index, delete what is
    /// already dead, repeat while more than a quarter of each sample was
    /// expired, all under a time budget.
    pub fn active_expire_cycle(&mut self, budget_ms: u64) {
        const SAMPLE: usize = 20;
        if self.config.replica {
            return;
        }
        let start = Instant::now();
        let now = self.cached_ms;
        let mut rng = thread_rng();
        for dbid in 0..self.dbs.len() {
            loop {
                if self.dbs[dbid].expires.is_empty() {
                    break;
                }
                let mut samples: Vec<(Vec<u8>, u64)> = Vec::with_capacity(SAMPLE);
                self.dbs[dbid].expires.sample_entries(&mut rng, SAMPLE, |k, &when| {
                    samples.push((k.to_vec(), when));
                });
                if samples.is_empty() {
                    break;
                }
                let sampled = samples.len();
                let mut expired = 0usize;
                for (key, when) in samples {
                    if when <= now {
                        self.delete_expired(dbid, &key);
                        expired += 1;
                    }
                }
                // Under 25% expired: this db is clean enough for now.
                if expired * 4 < sampled {
                    break;
                }
                if start.elapsed().as_millis() as u64 >= budget_ms {
                    trace!("active expire cycle hit its {budget_ms}ms budget");
                    return;
                }
            }
        }
    }
}

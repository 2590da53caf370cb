//! Server state, clients, and command dispatch
//!
//! One `Server` owns every database, every client, and every shared
//! structure; all of it is mutated from the single event-loop thread.
//! Clients are addressed by id. During command execution the current
//! client is detached from the registry, so handlers can reach other
//! clients (publish fanout, watcher signalling) without aliasing.
//!
//! Anything a handler needs from the event loop — arming a block-timeout
//! timer, waking another client's socket, stopping the loop — is queued
//! as a [`PostAction`] and applied by the network glue after the handler
//! returns. Tests drive the server without any loop at all.

pub mod keyspace;
pub mod net;
pub mod resp;

use crate::clock::ServerClock;
use crate::commands::{self, CommandIndex, QUEUE_BYPASS, SUBSCRIBER_OK, WRITE};
use crate::config::Config;
use crate::db::Db;
use crate::error::ReplyError;
use crate::lazyfree::LazyFree;
use crate::object::SharedObjects;
use crate::propagate::{NullPropagator, Propagator, PROPAGATE_ALL};
use crate::pubsub::PubSub;
use crate::ClientId;
use resp::{reply_error, reply_simple};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use tracing::{debug, info};

/// A command captured while the connection is in the queuing state.
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub cmd: usize,
    pub argv: Vec<Vec<u8>>,
}

/// Why and how a client is parked waiting for list data.
#[derive(Debug, Clone)]
pub struct BlockedState {
    /// Keys the client waits on, in argument order.
    pub keys: Vec<Vec<u8>>,
    /// Absolute deadline, wall ms. None blocks forever.
    pub timeout_at: Option<u64>,
    /// BRPOPLPUSH destination.
    pub push_target: Option<Vec<u8>>,
    /// Pop from the head (BLPOP) or tail (BRPOP/BRPOPLPUSH).
    pub pop_head: bool,
    /// Loop timer armed for the timeout, once the glue registered it.
    pub timer_id: Option<u64>,
}

/// Deferred requests toward the event-loop glue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostAction {
    /// Arm a one-shot timer for a blocked client's timeout.
    ArmBlockTimer { client: ClientId, fire_in_ms: u64 },
    /// Disarm a block timer (client served or gone).
    CancelTimer { timer_id: u64 },
    /// A non-current client got output; flush its socket.
    Wake { client: ClientId },
    /// Stop the event loop.
    Shutdown,
}

pub struct Client {
    pub id: ClientId,
    /// -1 for in-process (test) clients.
    pub fd: RawFd,
    pub db_index: usize,
    /// Reply dialect: 2 or 3.
    pub resp: u8,
    /// Unparsed inbound bytes.
    pub query: Vec<u8>,
    /// Pending outbound bytes.
    pub out: Vec<u8>,
    /// Current command vector.
    pub argv: Vec<Vec<u8>>,
    /// Canonical argv for propagation when the handler rewrote itself.
    pub rewritten: Option<Vec<Vec<u8>>>,
    pub should_close: bool,

    // transaction state
    pub in_multi: bool,
    pub dirty_cas: bool,
    pub dirty_exec: bool,
    pub multi_queue: Vec<QueuedCommand>,
    pub watched: Vec<(usize, Vec<u8>)>,

    // pub/sub state (ordered, mirrors the server maps)
    pub sub_channels: Vec<Vec<u8>>,
    pub sub_patterns: Vec<Vec<u8>>,

    pub block: Option<BlockedState>,
}

impl Client {
    fn new(id: ClientId, fd: RawFd) -> Self {
        Self {
            id,
            fd,
            db_index: 0,
            resp: 2,
            query: Vec::new(),
            out: Vec::new(),
            argv: Vec::new(),
            rewritten: None,
            should_close: false,
            in_multi: false,
            dirty_cas: false,
            dirty_exec: false,
            multi_queue: Vec::new(),
            watched: Vec::new(),
            sub_channels: Vec::new(),
            sub_patterns: Vec::new(),
            block: None,
        }
    }

    #[cfg(test)]
    pub fn mock(id: ClientId) -> Self {
        Self::new(id, -1)
    }

    pub fn subscription_count(&self) -> usize {
        self.sub_channels.len() + self.sub_patterns.len()
    }

    pub fn is_subscriber(&self) -> bool {
        self.subscription_count() > 0
    }

    /// Leave the queuing state, dropping everything MULTI accumulated.
    pub fn discard_multi(&mut self) {
        self.in_multi = false;
        self.dirty_exec = false;
        self.dirty_cas = false;
        self.multi_queue.clear();
    }
}

#[derive(Debug, Default)]
pub struct Stats {
    pub keyspace_hits: u64,
    pub keyspace_misses: u64,
    pub expired_keys: u64,
    pub total_commands: u64,
    pub total_connections: u64,
}

pub struct Server {
    pub config: Config,
    pub dbs: Vec<Db>,
    pub clients: HashMap<ClientId, Client>,
    next_client_id: ClientId,
    pub shared: SharedObjects,
    pub pubsub: PubSub,
    pub lazyfree: LazyFree,
    pub propagator: Box<dyn Propagator>,
    pub clock: ServerClock,
    /// Cached wall ms, refreshed once per dispatch/cron tick.
    pub cached_ms: u64,
    /// Second-resolution recency clock stamped into objects on access.
    pub lru_clock: u32,
    /// Mutation counter; a delta across a handler triggers propagation.
    pub dirty: u64,
    pub stats: Stats,
    pub shutdown: bool,
    pub cron_loops: u64,
    pub actions: Vec<PostAction>,
    commands: CommandIndex,
    pending_dirty_cas: Vec<ClientId>,
    in_exec: bool,
    exec_multi_emitted: bool,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self::with_propagator(config, Box::new(NullPropagator))
    }

    pub fn with_propagator(config: Config, propagator: Box<dyn Propagator>) -> Self {
        let mut clock = ServerClock::new();
        let cached_ms = clock.now_ms();
        let dbs = (0..config.databases).map(Db::new).collect();
        info!(
            "server core ready: {} databases, hz {}",
            config.databases, config.hz
        );
        Self {
            config,
            dbs,
            clients: HashMap::new(),
            next_client_id: 1,
            shared: SharedObjects::new(),
            pubsub: PubSub::new(),
            lazyfree: LazyFree::spawn(),
            propagator,
            clock,
            cached_ms,
            lru_clock: (cached_ms / 1000) as u32,
            dirty: 0,
            stats: Stats::default(),
            shutdown: false,
            cron_loops: 0,
            actions: Vec::new(),
            commands: CommandIndex::new(),
            pending_dirty_cas: Vec::new(),
            in_exec: false,
            exec_multi_emitted: false,
        }
    }

    // ---- client lifecycle ----

    pub fn create_client(&mut self, fd: RawFd) -> ClientId {
        let id = self.next_client_id;
        self.next_client_id += 1;
        self.clients.insert(id, Client::new(id, fd));
        self.stats.total_connections += 1;
        debug!("client {id} connected (fd {fd})");
        id
    }

    /// In-process client without a socket; tests and tools use these.
    pub fn mock_client(&mut self) -> ClientId {
        self.create_client(-1)
    }

    pub fn client(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn client_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(&id)
    }

    /// Drain a client's pending output.
    pub fn take_output(&mut self, id: ClientId) -> Vec<u8> {
        self.clients
            .get_mut(&id)
            .map(|c| std::mem::take(&mut c.out))
            .unwrap_or_default()
    }

    /// Disconnect: unwatch, unsubscribe, unblock, forget.
    pub fn remove_client(&mut self, id: ClientId) {
        let Some(c) = self.clients.remove(&id) else { return };
        for (dbid, key) in &c.watched {
            self.dbs[*dbid].remove_watcher(key, id);
        }
        self.pubsub.drop_client(id, &c.sub_channels, &c.sub_patterns);
        if let Some(block) = &c.block {
            for key in &block.keys {
                self.dbs[c.db_index].remove_blocked(key, id);
            }
            if let Some(timer_id) = block.timer_id {
                self.actions.push(PostAction::CancelTimer { timer_id });
            }
        }
        debug!("client {id} removed");
    }

    // ---- dispatch ----

    /// Run one command for a client. The main entry point for both the
    /// network layer and tests.
    pub fn execute(&mut self, id: ClientId, argv: Vec<Vec<u8>>) {
        self.update_clock();
        let Some(mut c) = self.clients.remove(&id) else { return };
        debug_assert!(c.block.is_none(), "blocked clients do not dispatch");
        c.argv = argv;
        self.process_command(&mut c);
        c.argv = Vec::new();
        // A handler touching a key the current client watches cannot set
        // the flag directly (the client is detached); apply it now.
        for pid in std::mem::take(&mut self.pending_dirty_cas) {
            if pid == c.id {
                c.dirty_cas = true;
            }
        }
        if let Some(block) = &c.block {
            for key in block.keys.clone() {
                self.dbs[c.db_index].add_blocked(&key, c.id);
            }
            if let Some(at) = block.timeout_at {
                let fire_in_ms = at.saturating_sub(self.cached_ms);
                self.actions.push(PostAction::ArmBlockTimer { client: c.id, fire_in_ms });
            }
        }
        self.clients.insert(id, c);
        self.serve_ready_keys();
        if self.shutdown {
            self.actions.push(PostAction::Shutdown);
        }
    }

    fn process_command(&mut self, c: &mut Client) {
        let Some(name_raw) = c.argv.first() else { return };
        let name = name_raw.to_ascii_lowercase();
        let Some(cmd) = self.commands.lookup(&name) else {
            if c.in_multi {
                c.dirty_exec = true;
            }
            let printable = String::from_utf8_lossy(&name).into_owned();
            reply_error(c, &ReplyError::UnknownCommand(printable));
            return;
        };
        let spec = commands::spec(cmd);
        if !commands::arity_ok(spec.arity, c.argv.len()) {
            if c.in_multi {
                c.dirty_exec = true;
            }
            reply_error(c, &ReplyError::Arity(spec.name.into()));
            return;
        }
        if c.is_subscriber() && c.resp == 2 && spec.flags & SUBSCRIBER_OK == 0 {
            reply_error(
                c,
                &ReplyError::message(format!(
                    "Can't execute '{}': only (P)SUBSCRIBE / (P)UNSUBSCRIBE / PING / RESET \
                     are allowed in this context",
                    spec.name
                )),
            );
            return;
        }
        if c.in_multi && spec.flags & commands::NO_MULTI != 0 {
            c.dirty_exec = true;
            reply_error(
                c,
                &ReplyError::message(format!(
                    "{} is not allowed in transactions",
                    spec.name.to_uppercase()
                )),
            );
            return;
        }
        if c.in_multi && spec.flags & QUEUE_BYPASS == 0 {
            c.multi_queue.push(QueuedCommand { cmd, argv: c.argv.clone() });
            reply_simple(c, "QUEUED");
            return;
        }
        self.call_command(c, cmd);
    }

    /// Invoke a handler and propagate its effect when it dirtied the
    /// dataset. Shared by dispatch and EXEC.
    pub(crate) fn call_command(&mut self, c: &mut Client, cmd: usize) {
        let spec = commands::spec(cmd);
        if self.config.replica && spec.flags & WRITE != 0 {
            reply_error(c, &ReplyError::ReadOnly);
            return;
        }
        let dirty_before = self.dirty;
        c.rewritten = None;
        (spec.handler)(self, c);
        self.stats.total_commands += 1;
        if self.dirty != dirty_before {
            let argv = match c.rewritten.take() {
                Some(rw) => {
                    // Keep the canonical form for any queue that still
                    // holds this command.
                    c.argv = rw.clone();
                    rw
                }
                None => c.argv.clone(),
            };
            self.propagate_command(c.db_index, &argv);
        }
    }

    /// Forward one command to the persistence log and replicas, wrapping
    /// a transaction's first write in a MULTI marker.
    pub fn propagate_command(&mut self, db_id: usize, argv: &[Vec<u8>]) {
        if self.in_exec && !self.exec_multi_emitted {
            self.exec_multi_emitted = true;
            let marker = vec![b"multi".to_vec()];
            self.propagator.propagate(db_id, &marker, PROPAGATE_ALL);
            self.propagator.feed_backlog(&resp::encode_command(&marker));
        }
        self.propagator.propagate(db_id, argv, PROPAGATE_ALL);
        self.propagator.feed_backlog(&resp::encode_command(argv));
    }

    /// True while EXEC is draining a queue; nothing may suspend then.
    pub fn executing_transaction(&self) -> bool {
        self.in_exec
    }

    /// EXEC runs its queue inside this bracket so the downstream stream
    /// sees the block atomically.
    pub(crate) fn exec_bracket_begin(&mut self) {
        self.in_exec = true;
        self.exec_multi_emitted = false;
    }

    pub(crate) fn exec_bracket_end(&mut self, db_id: usize) {
        if self.exec_multi_emitted {
            let marker = vec![b"exec".to_vec()];
            self.propagator.propagate(db_id, &marker, PROPAGATE_ALL);
            self.propagator.feed_backlog(&resp::encode_command(&marker));
        }
        self.in_exec = false;
        self.exec_multi_emitted = false;
    }

    // ---- blocked clients ----

    /// A push landed on keys clients were blocked on; serve them FIFO.
    /// Runs after every command (and the glue runs it before sleeping).
    pub fn serve_ready_keys(&mut self) {
        loop {
            let mut any = false;
            for dbid in 0..self.dbs.len() {
                if self.dbs[dbid].ready_keys.is_empty() {
                    continue;
                }
                any = true;
                let ready = std::mem::take(&mut self.dbs[dbid].ready_keys);
                for key in ready {
                    self.serve_blocked_on_key(dbid, &key);
                }
            }
            if !any {
                break;
            }
        }
    }

    fn serve_blocked_on_key(&mut self, dbid: usize, key: &[u8]) {
        loop {
            // Next candidate still genuinely blocked on this key.
            let candidate = loop {
                let Some(queue) = self.dbs[dbid].blocked_keys.find_mut(key) else {
                    return;
                };
                let Some(id) = queue.pop_front() else {
                    self.dbs[dbid].blocked_keys.remove(key);
                    return;
                };
                match self.clients.get(&id) {
                    Some(cl) if cl.block.is_some() => break id,
                    _ => continue,
                }
            };
            let Some(value) = self.dbs[dbid].peek(key).cloned() else {
                // Key vanished again; park the candidate at the front for
                // the next signal.
                match self.dbs[dbid].blocked_keys.find_mut(key) {
                    Some(queue) => queue.push_front(candidate),
                    None => self.dbs[dbid].add_blocked(key, candidate),
                }
                return;
            };
            if value.object_type() != crate::object::ObjectType::List {
                // Wrong type landed on the key; the blocker keeps waiting.
                match self.dbs[dbid].blocked_keys.find_mut(key) {
                    Some(queue) => queue.push_front(candidate),
                    None => self.dbs[dbid].add_blocked(key, candidate),
                }
                return;
            }
            let (pop_head, push_target) = {
                let cl = self.clients.get(&candidate).unwrap();
                let b = cl.block.as_ref().unwrap();
                (b.pop_head, b.push_target.clone())
            };
            if let Some(target) = &push_target {
                let target_clash = self
                    .dbs[dbid]
                    .peek(target)
                    .is_some_and(|t| t.object_type() != crate::object::ObjectType::List);
                if target_clash {
                    // Nothing is popped; the would-be receiver learns why.
                    let cl = self.clients.get_mut(&candidate).unwrap();
                    resp::reply_error(cl, &ReplyError::WrongType);
                    self.unblock_client(candidate);
                    self.actions.push(PostAction::Wake { client: candidate });
                    continue;
                }
            }
            let Some(popped) = self.pop_from_list_key(dbid, key, pop_head) else {
                return;
            };
            match &push_target {
                None => {
                    let pop_cmd: &[u8] = if pop_head { b"lpop" } else { b"rpop" };
                    self.propagate_command(dbid, &[pop_cmd.to_vec(), key.to_vec()]);
                    let cl = self.clients.get_mut(&candidate).unwrap();
                    resp::reply_array_len(cl, 2);
                    resp::reply_bulk(cl, key);
                    resp::reply_bulk(cl, &popped);
                }
                Some(target) => {
                    let target = target.clone();
                    self.push_to_list_key(dbid, &target, &popped, true);
                    self.propagate_command(
                        dbid,
                        &[b"rpoplpush".to_vec(), key.to_vec(), target.clone()],
                    );
                    let cl = self.clients.get_mut(&candidate).unwrap();
                    resp::reply_bulk(cl, &popped);
                }
            }
            self.unblock_client(candidate);
            self.actions.push(PostAction::Wake { client: candidate });
            if self.dbs[dbid].peek(key).is_none() {
                return;
            }
        }
    }

    /// Pop one element from a list key, deleting the key when it empties.
    pub(crate) fn pop_from_list_key(
        &mut self,
        dbid: usize,
        key: &[u8],
        head: bool,
    ) -> Option<Vec<u8>> {
        let value = self.dbs[dbid].entries.find_mut(key)?;
        let obj = std::sync::Arc::make_mut(value);
        let popped = obj.list_mut().pop(head)?;
        let emptied = obj.list_ref().is_empty();
        if emptied {
            self.dbs[dbid].remove_entry(key);
        }
        self.signal_write(dbid, key);
        Some(popped)
    }

    /// Push one element, creating the list if missing; signals readiness
    /// and watchers.
    pub(crate) fn push_to_list_key(&mut self, dbid: usize, key: &[u8], data: &[u8], head: bool) {
        let (fill, depth) = (self.config.list_fill, self.config.list_compress_depth);
        match self.dbs[dbid].entries.find_mut(key) {
            Some(value) => {
                let obj = std::sync::Arc::make_mut(value);
                let ql = obj.list_mut();
                if head {
                    ql.push_head(data);
                } else {
                    ql.push_tail(data);
                }
            }
            None => {
                let mut obj = crate::object::Object::list(fill, depth);
                if head {
                    obj.list_mut().push_head(data);
                } else {
                    obj.list_mut().push_tail(data);
                }
                let _ = self.dbs[dbid]
                    .entries
                    .insert(key, std::sync::Arc::new(obj));
            }
        }
        self.dbs[dbid].signal_key_ready(key);
        self.touch_watched_key(dbid, key);
        self.dirty += 1;
    }

    /// Flag a connection's compare-and-set as broken, wherever the
    /// connection currently is (registry or detached for dispatch).
    pub(crate) fn mark_dirty_cas(&mut self, id: ClientId) {
        match self.clients.get_mut(&id) {
            Some(cl) => cl.dirty_cas = true,
            None => self.pending_dirty_cas.push(id),
        }
    }

    /// Detach a client from every blocking registration.
    pub fn unblock_client(&mut self, id: ClientId) {
        let Some(cl) = self.clients.get_mut(&id) else { return };
        let Some(block) = cl.block.take() else { return };
        let dbid = cl.db_index;
        for key in &block.keys {
            self.dbs[dbid].remove_blocked(key, id);
        }
        if let Some(timer_id) = block.timer_id {
            self.actions.push(PostAction::CancelTimer { timer_id });
        }
    }

    /// The block timeout fired: reply empty and release the client.
    pub fn on_block_timeout(&mut self, id: ClientId) {
        let Some(cl) = self.clients.get_mut(&id) else { return };
        let Some(block) = &cl.block else { return };
        if block.push_target.is_some() {
            resp::reply_null(cl);
        } else {
            resp::reply_null_array(cl);
        }
        // The timer already fired; forget it so unblock does not cancel.
        if let Some(b) = cl.block.as_mut() {
            b.timer_id = None;
        }
        self.unblock_client(id);
        self.actions.push(PostAction::Wake { client: id });
    }

    // ---- cron ----

    /// Periodic housekeeping, driven by a loop timer. Returns the next
    /// period in milliseconds.
    pub fn cron(&mut self) -> u64 {
        self.cron_loops += 1;
        self.update_clock();
        self.lru_clock = (self.cached_ms / 1000) as u32;
        if !self.config.replica {
            self.active_expire_cycle(25);
        }
        self.databases_cron();
        (1000 / self.config.hz.max(1)) as u64
    }

    fn databases_cron(&mut self) {
        for db in &mut self.dbs {
            if db.entries.needs_resize() {
                db.entries.resize();
            }
            if db.expires.needs_resize() {
                db.expires.resize();
            }
        }
        // Spend up to a millisecond advancing one in-flight migration.
        for db in &mut self.dbs {
            if db.entries.is_rehashing() {
                db.entries.rehash_ms(1);
                return;
            }
            if db.expires.is_rehashing() {
                db.expires.rehash_ms(1);
                return;
            }
        }
    }
}

//! Command table: names, handlers, arity, dispatch flags

pub mod generic;
pub mod hash;
pub mod list;
pub mod multi;
pub mod pubsub;
pub mod string;

use crate::dict::Dict;
use crate::server::{Client, Server};

pub type Handler = fn(&mut Server, &mut Client);

/// Mutates the dataset; refused on a read-only replica.
pub const WRITE: u32 = 1 << 0;
/// Pure read.
pub const READONLY: u32 = 1 << 1;
/// Server administration.
pub const ADMIN: u32 = 1 << 2;
/// Executes immediately even while the connection is queuing a
/// transaction (EXEC, DISCARD, MULTI, WATCH, RESET).
pub const QUEUE_BYPASS: u32 = 1 << 3;
/// Allowed while the connection is in subscriber mode on the 2-array
/// protocol.
pub const SUBSCRIBER_OK: u32 = 1 << 4;
/// O(1)-ish.
pub const FAST: u32 = 1 << 5;
/// May park the client waiting for data.
pub const MAY_BLOCK: u32 = 1 << 6;
/// Refused inside MULTI (would make no sense queued).
pub const NO_MULTI: u32 = 1 << 7;

pub struct CommandSpec {
    pub name: &'static str,
    pub handler: Handler,
    /// Positive: exact argc (command included). Negative: minimum argc.
    pub arity: i32,
    pub flags: u32,
}

macro_rules! cmd {
    ($name:literal, $handler:path, $arity:literal, $flags:expr) => {
        CommandSpec { name: $name, handler: $handler, arity: $arity, flags: $flags }
    };
}

static COMMANDS: &[CommandSpec] = &[
    // strings
    cmd!("get", string::get, 2, READONLY | FAST),
    cmd!("set", string::set, -3, WRITE),
    cmd!("setnx", string::setnx, 3, WRITE | FAST),
    cmd!("getset", string::getset, 3, WRITE),
    cmd!("setrange", string::setrange, 4, WRITE),
    cmd!("getrange", string::getrange, 4, READONLY),
    cmd!("incr", string::incr, 2, WRITE | FAST),
    cmd!("decr", string::decr, 2, WRITE | FAST),
    cmd!("incrby", string::incrby, 3, WRITE | FAST),
    cmd!("decrby", string::decrby, 3, WRITE | FAST),
    cmd!("incrbyfloat", string::incrbyfloat, 3, WRITE | FAST),
    cmd!("append", string::append, 3, WRITE),
    cmd!("strlen", string::strlen, 2, READONLY | FAST),
    cmd!("mget", string::mget, -2, READONLY | FAST),
    cmd!("mset", string::mset, -3, WRITE),
    cmd!("msetnx", string::msetnx, -3, WRITE),
    // lists
    cmd!("lpush", list::lpush, -3, WRITE | FAST),
    cmd!("rpush", list::rpush, -3, WRITE | FAST),
    cmd!("lpushx", list::lpushx, -3, WRITE | FAST),
    cmd!("rpushx", list::rpushx, -3, WRITE | FAST),
    cmd!("lpop", list::lpop, 2, WRITE | FAST),
    cmd!("rpop", list::rpop, 2, WRITE | FAST),
    cmd!("llen", list::llen, 2, READONLY | FAST),
    cmd!("lindex", list::lindex, 3, READONLY),
    cmd!("lset", list::lset, 4, WRITE),
    cmd!("linsert", list::linsert, 5, WRITE),
    cmd!("lrange", list::lrange, 4, READONLY),
    cmd!("ltrim", list::ltrim, 4, WRITE),
    cmd!("lrem", list::lrem, 4, WRITE),
    cmd!("rpoplpush", list::rpoplpush, 3, WRITE),
    cmd!("blpop", list::blpop, -3, WRITE | MAY_BLOCK),
    cmd!("brpop", list::brpop, -3, WRITE | MAY_BLOCK),
    cmd!("brpoplpush", list::brpoplpush, 4, WRITE | MAY_BLOCK),
    // hashes
    cmd!("hset", hash::hset, -4, WRITE | FAST),
    cmd!("hsetnx", hash::hsetnx, 4, WRITE | FAST),
    cmd!("hget", hash::hget, 3, READONLY | FAST),
    cmd!("hmset", hash::hmset, -4, WRITE | FAST),
    cmd!("hmget", hash::hmget, -3, READONLY | FAST),
    cmd!("hgetall", hash::hgetall, 2, READONLY),
    cmd!("hdel", hash::hdel, -3, WRITE | FAST),
    cmd!("hlen", hash::hlen, 2, READONLY | FAST),
    cmd!("hstrlen", hash::hstrlen, 3, READONLY | FAST),
    cmd!("hexists", hash::hexists, 3, READONLY | FAST),
    cmd!("hkeys", hash::hkeys, 2, READONLY),
    cmd!("hvals", hash::hvals, 2, READONLY),
    cmd!("hincrby", hash::hincrby, 4, WRITE | FAST),
    cmd!("hincrbyfloat", hash::hincrbyfloat, 4, WRITE | FAST),
    cmd!("hscan", hash::hscan, -3, READONLY),
    // keyspace
    cmd!("exists", generic::exists, -2, READONLY | FAST),
    cmd!("del", generic::del, -2, WRITE),
    cmd!("unlink", generic::unlink, -2, WRITE | FAST),
    cmd!("expire", generic::expire, 3, WRITE | FAST),
    cmd!("pexpire", generic::pexpire, 3, WRITE | FAST),
    cmd!("expireat", generic::expireat, 3, WRITE | FAST),
    cmd!("pexpireat", generic::pexpireat, 3, WRITE | FAST),
    cmd!("ttl", generic::ttl, 2, READONLY | FAST),
    cmd!("pttl", generic::pttl, 2, READONLY | FAST),
    cmd!("persist", generic::persist, 2, WRITE | FAST),
    cmd!("type", generic::type_cmd, 2, READONLY | FAST),
    cmd!("keys", generic::keys, 2, READONLY),
    cmd!("scan", generic::scan, -2, READONLY),
    cmd!("randomkey", generic::randomkey, 1, READONLY),
    cmd!("rename", generic::rename, 3, WRITE),
    cmd!("renamenx", generic::renamenx, 3, WRITE | FAST),
    cmd!("move", generic::move_cmd, 3, WRITE | FAST),
    cmd!("dbsize", generic::dbsize, 1, READONLY | FAST),
    cmd!("select", generic::select, 2, FAST),
    cmd!("swapdb", generic::swapdb, 3, WRITE | FAST),
    cmd!("flushdb", generic::flushdb, -1, WRITE),
    cmd!("flushall", generic::flushall, -1, WRITE),
    cmd!("shutdown", generic::shutdown, -1, ADMIN),
    cmd!("ping", generic::ping, -1, FAST | SUBSCRIBER_OK),
    cmd!("echo", generic::echo, 2, FAST),
    cmd!("object", generic::object, -2, READONLY),
    cmd!("command", generic::command_cmd, -1, READONLY),
    cmd!("reset", generic::reset, 1, QUEUE_BYPASS | SUBSCRIBER_OK | FAST),
    // pub/sub
    cmd!("subscribe", pubsub::subscribe, -2, SUBSCRIBER_OK | NO_MULTI),
    cmd!("unsubscribe", pubsub::unsubscribe, -1, SUBSCRIBER_OK | NO_MULTI),
    cmd!("psubscribe", pubsub::psubscribe, -2, SUBSCRIBER_OK | NO_MULTI),
    cmd!("punsubscribe", pubsub::punsubscribe, -1, SUBSCRIBER_OK | NO_MULTI),
    cmd!("publish", pubsub::publish, 3, FAST),
    cmd!("pubsub", pubsub::pubsub_cmd, -2, READONLY),
    // transactions
    cmd!("multi", multi::multi, 1, QUEUE_BYPASS | FAST),
    cmd!("exec", multi::exec, 1, QUEUE_BYPASS),
    cmd!("discard", multi::discard, 1, QUEUE_BYPASS | FAST),
    cmd!("watch", multi::watch, -2, QUEUE_BYPASS | FAST),
    cmd!("unwatch", multi::unwatch, 1, QUEUE_BYPASS | FAST),
];

pub fn spec(idx: usize) -> &'static CommandSpec {
    &COMMANDS[idx]
}

pub fn count() -> usize {
    COMMANDS.len()
}

pub fn names() -> impl Iterator<Item = &'static str> {
    COMMANDS.iter().map(|c| c.name)
}

pub fn arity_ok(arity: i32, argc: usize) -> bool {
    if arity >= 0 {
        argc == arity as usize
    } else {
        argc >= (-arity) as usize
    }
}

/// Case-insensitive name -> table index, itself one of our dicts.
pub struct CommandIndex {
    index: Dict<usize>,
}

impl CommandIndex {
    pub fn new() -> Self {
        let mut index = Dict::new();
        for (i, spec) in COMMANDS.iter().enumerate() {
            let existing = index.insert(spec.name.as_bytes(), i);
            debug_assert!(existing.is_ok(), "duplicate command name {}", spec.name);
        }
        Self { index }
    }

    /// `name` must already be lowercased.
    pub fn lookup(&self, name: &[u8]) -> Option<usize> {
        self.index.find(name).copied()
    }
}

impl Default for CommandIndex {
    fn default() -> Self {
        Self::new()
    }
}

//! Keyspace and connection commands

use crate::error::ReplyError;
use crate::glob::glob_match;
use crate::server::resp::*;
use crate::server::{Client, Server};
use crate::util::parse_i64;
use rand::thread_rng;
use std::sync::Arc;
use tracing::{info, warn};

pub fn exists(s: &mut Server, c: &mut Client) {
    let keys: Vec<Vec<u8>> = c.argv[1..].to_vec();
    let mut count = 0;
    for key in keys {
        if s.lookup_read(c.db_index, &key, false).is_some() {
            count += 1;
        }
    }
    reply_int(c, count);
}

fn del_generic(s: &mut Server, c: &mut Client, async_free: bool) {
    let keys: Vec<Vec<u8>> = c.argv[1..].to_vec();
    let mut removed = 0;
    for key in keys {
        // Expire first so a dead key does not count as deleted.
        if s.expire_if_needed(c.db_index, &key) {
            continue;
        }
        if s.delete_key(c.db_index, &key, async_free) {
            removed += 1;
        }
    }
    reply_int(c, removed);
}

pub fn del(s: &mut Server, c: &mut Client) {
    del_generic(s, c, false);
}

pub fn unlink(s: &mut Server, c: &mut Client) {
    del_generic(s, c, true);
}

fn expire_generic(s: &mut Server, c: &mut Client, unit_ms: u64, absolute: bool) {
    let key = c.argv[1].clone();
    let Some(raw) = parse_i64(&c.argv[2]) else {
        return reply_error(c, &ReplyError::NotInteger);
    };
    if s.lookup_write(c.db_index, &key).is_none() {
        return reply_int(c, 0);
    }
    let when_ms = if absolute {
        raw.saturating_mul(unit_ms as i64)
    } else {
        (s.now_ms() as i64).saturating_add(raw.saturating_mul(unit_ms as i64))
    };
    let when_ms = when_ms.max(0) as u64;
    if when_ms <= s.now_ms() && !s.config.replica {
        // Already in the past: this is a delete, and downstream must see
        // it as one.
        s.delete_key(c.db_index, &key, false);
        c.rewritten = Some(vec![b"del".to_vec(), key]);
        return reply_int(c, 1);
    }
    s.dbs[c.db_index].set_expire(&key, when_ms);
    s.signal_write(c.db_index, &key);
    c.rewritten = Some(vec![
        b"pexpireat".to_vec(),
        key,
        when_ms.to_string().into_bytes(),
    ]);
    reply_int(c, 1);
}

pub fn expire(s: &mut Server, c: &mut Client) {
    expire_generic(s, c, 1000, false);
}

pub fn pexpire(s: &mut Server, c: &mut Client) {
    expire_generic(s, c, 1, false);
}

pub fn expireat(s: &mut Server, c: &mut Client) {
    expire_generic(s, c, 1000, true);
}

pub fn pexpireat(s: &mut Server, c: &mut Client) {
    expire_generic(s, c, 1, true);
}

fn ttl_generic(s: &mut Server, c: &mut Client, in_seconds: bool) {
    let key = c.argv[1].clone();
    if s.lookup_read(c.db_index, &key, true).is_none() {
        return reply_int(c, -2);
    }
    let Some(when) = s.dbs[c.db_index].get_expire(&key) else {
        return reply_int(c, -1);
    };
    let remaining = when.saturating_sub(s.now_ms());
    if in_seconds {
        reply_int(c, ((remaining + 500) / 1000) as i64);
    } else {
        reply_int(c, remaining as i64);
    }
}

pub fn ttl(s: &mut Server, c: &mut Client) {
    ttl_generic(s, c, true);
}

pub fn pttl(s: &mut Server, c: &mut Client) {
    ttl_generic(s, c, false);
}

pub fn persist(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    if s.lookup_write(c.db_index, &key).is_none() {
        return reply_int(c, 0);
    }
    if s.dbs[c.db_index].remove_expire(&key) {
        s.signal_write(c.db_index, &key);
        reply_int(c, 1);
    } else {
        reply_int(c, 0);
    }
}

pub fn type_cmd(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    match s.lookup_read(c.db_index, &key, true) {
        Some(v) => reply_simple(c, v.object_type().name()),
        None => reply_simple(c, "none"),
    }
}

pub fn keys(s: &mut Server, c: &mut Client) {
    let pattern = c.argv[1].clone();
    let all_keys = {
        let db = &s.dbs[c.db_index];
        let mut out = Vec::with_capacity(db.len());
        let mut cursor = 0u64;
        loop {
            cursor = db.entries.scan(cursor, |k, _| out.push(k.to_vec()));
            if cursor == 0 {
                break;
            }
        }
        out
    };
    let mut matched = Vec::new();
    for key in all_keys {
        if s.expire_if_needed(c.db_index, &key) {
            continue;
        }
        if glob_match(&pattern, &key) {
            matched.push(key);
        }
    }
    reply_array_len(c, matched.len());
    for key in matched {
        reply_bulk(c, &key);
    }
}

pub fn scan(s: &mut Server, c: &mut Client) {
    let Some(cursor) = std::str::from_utf8(&c.argv[1])
        .ok()
        .and_then(|t| t.parse::<u64>().ok())
    else {
        return reply_error(c, &ReplyError::InvalidCursor);
    };
    let mut pattern: Option<Vec<u8>> = None;
    let mut count = 10usize;
    let mut i = 2;
    while i < c.argv.len() {
        match c.argv[i].to_ascii_lowercase().as_slice() {
            b"match" if i + 1 < c.argv.len() => {
                pattern = Some(c.argv[i + 1].clone());
                i += 2;
            }
            b"count" if i + 1 < c.argv.len() => {
                let Some(n) = parse_i64(&c.argv[i + 1]).filter(|&n| n > 0) else {
                    return reply_error(c, &ReplyError::Syntax);
                };
                count = n as usize;
                i += 2;
            }
            _ => return reply_error(c, &ReplyError::Syntax),
        }
    }
    let mut collected: Vec<Vec<u8>> = Vec::new();
    let mut cur = cursor;
    loop {
        cur = s.dbs[c.db_index].entries.scan(cur, |k, _| {
            collected.push(k.to_vec());
        });
        if cur == 0 || collected.len() >= count {
            break;
        }
    }
    let now = s.now_ms();
    collected.retain(|k| {
        !s.dbs[c.db_index].logically_expired(k, now)
            && pattern.as_deref().map_or(true, |p| glob_match(p, k))
    });
    reply_array_len(c, 2);
    reply_bulk(c, cur.to_string().as_bytes());
    reply_array_len(c, collected.len());
    for k in collected {
        reply_bulk(c, &k);
    }
}

pub fn randomkey(s: &mut Server, c: &mut Client) {
    s.dbs[c.db_index].entries.rehash_step();
    let key = s.dbs[c.db_index].random_key(&mut thread_rng(), s.now_ms());
    match key {
        Some(k) => reply_bulk(c, &k),
        None => reply_null(c),
    }
}

fn rename_generic(s: &mut Server, c: &mut Client, fail_on_target: bool) {
    let src = c.argv[1].clone();
    let dst = c.argv[2].clone();
    let Some(value) = s.lookup_write(c.db_index, &src) else {
        return reply_error(c, &ReplyError::NoKey);
    };
    if src == dst {
        return if fail_on_target {
            reply_int(c, 0)
        } else {
            reply_simple(c, "OK")
        };
    }
    let dst_exists = s.lookup_write(c.db_index, &dst).is_some();
    if fail_on_target && dst_exists {
        return reply_int(c, 0);
    }
    let ttl = s.dbs[c.db_index].get_expire(&src);
    s.dbs[c.db_index].remove_entry(&src);
    s.set_key(c.db_index, &dst, value, false);
    if let Some(when) = ttl {
        s.dbs[c.db_index].set_expire(&dst, when);
    }
    s.signal_write(c.db_index, &src);
    s.dbs[c.db_index].signal_key_ready(&dst);
    if fail_on_target {
        reply_int(c, 1)
    } else {
        reply_simple(c, "OK")
    }
}

pub fn rename(s: &mut Server, c: &mut Client) {
    rename_generic(s, c, false);
}

pub fn renamenx(s: &mut Server, c: &mut Client) {
    rename_generic(s, c, true);
}

pub fn move_cmd(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    let Some(target) = parse_i64(&c.argv[2])
        .filter(|&n| n >= 0)
        .map(|n| n as usize)
        .filter(|&n| n < s.dbs.len())
    else {
        return reply_error(c, &ReplyError::DbIndexOutOfRange);
    };
    if target == c.db_index {
        return reply_error(
            c,
            &ReplyError::message("source and destination objects are the same"),
        );
    }
    let Some(value) = s.lookup_write(c.db_index, &key) else {
        return reply_int(c, 0);
    };
    // A populated destination blocks the move.
    if s.dbs[target].peek(&key).is_some() && !s.dbs[target].logically_expired(&key, s.now_ms()) {
        return reply_int(c, 0);
    }
    let ttl = s.dbs[c.db_index].get_expire(&key);
    s.dbs[c.db_index].remove_entry(&key);
    s.signal_write(c.db_index, &key);
    s.set_key(target, &key, value, false);
    if let Some(when) = ttl {
        s.dbs[target].set_expire(&key, when);
    }
    reply_int(c, 1);
}

pub fn dbsize(s: &mut Server, c: &mut Client) {
    reply_int(c, s.dbs[c.db_index].len() as i64);
}

pub fn select(s: &mut Server, c: &mut Client) {
    let Some(index) = parse_i64(&c.argv[1])
        .filter(|&n| n >= 0)
        .map(|n| n as usize)
        .filter(|&n| n < s.dbs.len())
    else {
        return reply_error(c, &ReplyError::DbIndexOutOfRange);
    };
    c.db_index = index;
    reply_simple(c, "OK");
}

pub fn swapdb(s: &mut Server, c: &mut Client) {
    let parse_db = |raw: &[u8], limit: usize| {
        parse_i64(raw)
            .filter(|&n| n >= 0)
            .map(|n| n as usize)
            .filter(|&n| n < limit)
    };
    let (Some(a), Some(b)) = (
        parse_db(&c.argv[1], s.dbs.len()),
        parse_db(&c.argv[2], s.dbs.len()),
    ) else {
        return reply_error(c, &ReplyError::DbIndexOutOfRange);
    };
    if a != b {
        // Swap the data, not the watch/block registrations: those belong
        // to connections, which stay pointed at their db index.
        let (first, second) = (a.min(b), a.max(b));
        let (left, right) = s.dbs.split_at_mut(second);
        std::mem::swap(&mut left[first].entries, &mut right[0].entries);
        std::mem::swap(&mut left[first].expires, &mut right[0].expires);
        for dbid in [a, b] {
            for id in s.dbs[dbid].all_watchers() {
                s.mark_dirty_cas(id);
            }
            let blocked: Vec<Vec<u8>> = s.dbs[dbid]
                .blocked_keys
                .iter()
                .map(|(k, _)| k.to_vec())
                .collect();
            for key in blocked {
                if s.dbs[dbid].peek(&key).is_some() {
                    s.dbs[dbid].signal_key_ready(&key);
                }
            }
        }
        s.dirty += 1;
    }
    reply_simple(c, "OK");
}

fn parse_flush_flag(c: &Client) -> Result<bool, ()> {
    match c.argv.get(1) {
        None => Ok(false),
        Some(flag) if flag.eq_ignore_ascii_case(b"async") => Ok(true),
        Some(flag) if flag.eq_ignore_ascii_case(b"sync") => Ok(false),
        Some(_) => Err(()),
    }
}

pub fn flushdb(s: &mut Server, c: &mut Client) {
    let Ok(async_free) = parse_flush_flag(c) else {
        return reply_error(c, &ReplyError::Syntax);
    };
    let removed = s.empty_db(c.db_index, async_free);
    info!("flushdb db {} removed {removed} keys (async={async_free})", c.db_index);
    reply_simple(c, "OK");
}

pub fn flushall(s: &mut Server, c: &mut Client) {
    let Ok(async_free) = parse_flush_flag(c) else {
        return reply_error(c, &ReplyError::Syntax);
    };
    let mut removed = 0;
    for dbid in 0..s.dbs.len() {
        removed += s.empty_db(dbid, async_free);
    }
    info!("flushall removed {removed} keys (async={async_free})");
    reply_simple(c, "OK");
}

pub fn shutdown(s: &mut Server, c: &mut Client) {
    let save = match c.argv.get(1) {
        None => true,
        Some(f) if f.eq_ignore_ascii_case(b"save") => true,
        Some(f) if f.eq_ignore_ascii_case(b"nosave") => false,
        Some(_) => return reply_error(c, &ReplyError::Syntax),
    };
    if save {
        // The snapshotter is an external collaborator; the request is
        // forwarded through the propagation hook.
        s.propagate_command(c.db_index, &[b"save".to_vec()]);
    }
    warn!("shutdown requested (save={save})");
    s.shutdown = true;
    c.should_close = true;
}

pub fn ping(_s: &mut Server, c: &mut Client) {
    match c.argv.get(1).cloned() {
        Some(msg) if c.argv.len() == 2 => reply_bulk(c, &msg),
        None => reply_simple(c, "PONG"),
        _ => reply_error(c, &ReplyError::Arity("ping".into())),
    }
}

pub fn echo(_s: &mut Server, c: &mut Client) {
    let msg = c.argv[1].clone();
    reply_bulk(c, &msg);
}

pub fn object(s: &mut Server, c: &mut Client) {
    let sub = c.argv[1].to_ascii_lowercase();
    if sub.as_slice() == b"help" {
        reply_array_len(c, 1);
        reply_bulk(c, b"OBJECT ENCODING|REFCOUNT|IDLETIME <key>");
        return;
    }
    let Some(key) = c.argv.get(2).cloned() else {
        return reply_error(c, &ReplyError::Syntax);
    };
    let Some(value) = s.lookup_read(c.db_index, &key, true) else {
        return reply_error(c, &ReplyError::NoKey);
    };
    match sub.as_slice() {
        b"encoding" => reply_bulk(c, value.encoding().name().as_bytes()),
        b"refcount" => reply_int(c, Arc::strong_count(&value) as i64 - 1),
        b"idletime" => {
            let idle = (s.lru_clock as i64 - value.lru() as i64).max(0);
            reply_int(c, idle);
        }
        _ => reply_error(c, &ReplyError::Syntax),
    }
}

pub fn command_cmd(_s: &mut Server, c: &mut Client) {
    match c.argv.get(1).map(|a| a.to_ascii_lowercase()) {
        None => {
            let names: Vec<&'static str> = crate::commands::names().collect();
            reply_array_len(c, names.len());
            for name in names {
                reply_bulk(c, name.as_bytes());
            }
        }
        Some(sub) if sub == b"count" => {
            reply_int(c, crate::commands::count() as i64);
        }
        Some(_) => reply_error(c, &ReplyError::Syntax),
    }
}

pub fn reset(s: &mut Server, c: &mut Client) {
    c.discard_multi();
    crate::commands::multi::unwatch_all(s, c);
    s.pubsub.drop_client(c.id, &c.sub_channels, &c.sub_patterns);
    c.sub_channels.clear();
    c.sub_patterns.clear();
    if let Some(block) = c.block.take() {
        for key in &block.keys {
            s.dbs[c.db_index].remove_blocked(key, c.id);
        }
        if let Some(timer_id) = block.timer_id {
            s.actions.push(crate::server::PostAction::CancelTimer { timer_id });
        }
    }
    c.db_index = 0;
    reply_simple(c, "RESET");
}

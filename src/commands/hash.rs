//! Hash commands

use crate::error::ReplyError;
use crate::object::{Object, ObjectType, Value};
use crate::server::resp::*;
use crate::server::{Client, Server};
use crate::util::{format_f64, parse_f64, parse_i64};
use std::sync::Arc;

fn read_hash(s: &mut Server, c: &mut Client, key: &[u8]) -> Result<Option<Value>, ()> {
    match s.lookup_read(c.db_index, key, false) {
        Some(v) if v.object_type() != ObjectType::Hash => {
            reply_error(c, &ReplyError::WrongType);
            Err(())
        }
        other => Ok(other),
    }
}

fn write_hash(s: &mut Server, c: &mut Client, key: &[u8]) -> Result<Option<Value>, ()> {
    match s.lookup_write(c.db_index, key) {
        Some(v) if v.object_type() != ObjectType::Hash => {
            reply_error(c, &ReplyError::WrongType);
            Err(())
        }
        other => Ok(other),
    }
}

/// Mutable access to the hash object at `key`, creating it on demand.
fn hash_for_update<'a>(s: &'a mut Server, dbid: usize, key: &[u8]) -> &'a mut Object {
    if !s.dbs[dbid].entries.contains(key) {
        let _ = s.dbs[dbid].entries.insert(key, Arc::new(Object::hash()));
    }
    let slot = s.dbs[dbid].entries.find_mut(key).unwrap();
    Arc::make_mut(slot)
}

pub fn hset(s: &mut Server, c: &mut Client) {
    if (c.argv.len() - 2) % 2 != 0 {
        return reply_error(c, &ReplyError::Arity("hset".into()));
    }
    let key = c.argv[1].clone();
    if write_hash(s, c, &key).is_err() {
        return;
    }
    let pairs: Vec<Vec<u8>> = c.argv[2..].to_vec();
    let (max_entries, max_value) = (
        s.config.hash_max_packed_entries,
        s.config.hash_max_packed_value,
    );
    let dbid = c.db_index;
    let mut added = 0;
    {
        let obj = hash_for_update(s, dbid, &key);
        for pair in pairs.chunks(2) {
            if obj.hash_set(&pair[0], &pair[1], max_entries, max_value) {
                added += 1;
            }
        }
    }
    s.signal_write(dbid, &key);
    reply_int(c, added);
}

pub fn hsetnx(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    let field = c.argv[2].clone();
    let value = c.argv[3].clone();
    let existing = match write_hash(s, c, &key) {
        Ok(v) => v,
        Err(()) => return,
    };
    if existing.is_some_and(|h| h.hash_exists(&field)) {
        return reply_int(c, 0);
    }
    let (max_entries, max_value) = (
        s.config.hash_max_packed_entries,
        s.config.hash_max_packed_value,
    );
    let dbid = c.db_index;
    hash_for_update(s, dbid, &key).hash_set(&field, &value, max_entries, max_value);
    s.signal_write(dbid, &key);
    reply_int(c, 1);
}

pub fn hget(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    let field = c.argv[2].clone();
    match read_hash(s, c, &key) {
        Ok(Some(h)) => match h.hash_get(&field) {
            Some(v) => reply_bulk(c, &v),
            None => reply_null(c),
        },
        Ok(None) => reply_null(c),
        Err(()) => {}
    }
}

pub fn hmset(s: &mut Server, c: &mut Client) {
    if (c.argv.len() - 2) % 2 != 0 {
        return reply_error(c, &ReplyError::Arity("hmset".into()));
    }
    let key = c.argv[1].clone();
    if write_hash(s, c, &key).is_err() {
        return;
    }
    let pairs: Vec<Vec<u8>> = c.argv[2..].to_vec();
    let (max_entries, max_value) = (
        s.config.hash_max_packed_entries,
        s.config.hash_max_packed_value,
    );
    let dbid = c.db_index;
    {
        let obj = hash_for_update(s, dbid, &key);
        for pair in pairs.chunks(2) {
            obj.hash_set(&pair[0], &pair[1], max_entries, max_value);
        }
    }
    s.signal_write(dbid, &key);
    reply_simple(c, "OK");
}

pub fn hmget(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    let fields: Vec<Vec<u8>> = c.argv[2..].to_vec();
    let hash = match read_hash(s, c, &key) {
        Ok(v) => v,
        Err(()) => return,
    };
    reply_array_len(c, fields.len());
    for field in fields {
        match hash.as_ref().and_then(|h| h.hash_get(&field)) {
            Some(v) => reply_bulk(c, &v),
            None => reply_null(c),
        }
    }
}

pub fn hgetall(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    match read_hash(s, c, &key) {
        Ok(Some(h)) => {
            let pairs = h.hash_pairs();
            reply_array_len(c, pairs.len() * 2);
            for (f, v) in pairs {
                reply_bulk(c, &f);
                reply_bulk(c, &v);
            }
        }
        Ok(None) => reply_array_len(c, 0),
        Err(()) => {}
    }
}

pub fn hdel(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    let fields: Vec<Vec<u8>> = c.argv[2..].to_vec();
    match write_hash(s, c, &key) {
        Ok(Some(_)) => {}
        Ok(None) => return reply_int(c, 0),
        Err(()) => return,
    }
    let dbid = c.db_index;
    let (removed, emptied) = {
        let slot = s.dbs[dbid].entries.find_mut(&key).unwrap();
        let obj = Arc::make_mut(slot);
        let mut removed = 0;
        for field in fields {
            if obj.hash_del(&field) {
                removed += 1;
            }
        }
        (removed, obj.hash_len() == 0)
    };
    if emptied {
        s.dbs[dbid].remove_entry(&key);
    }
    if removed > 0 {
        s.signal_write(dbid, &key);
    }
    reply_int(c, removed);
}

pub fn hlen(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    match read_hash(s, c, &key) {
        Ok(Some(h)) => reply_int(c, h.hash_len() as i64),
        Ok(None) => reply_int(c, 0),
        Err(()) => {}
    }
}

pub fn hstrlen(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    let field = c.argv[2].clone();
    match read_hash(s, c, &key) {
        Ok(Some(h)) => reply_int(c, h.hash_get(&field).map_or(0, |v| v.len()) as i64),
        Ok(None) => reply_int(c, 0),
        Err(()) => {}
    }
}

pub fn hexists(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    let field = c.argv[2].clone();
    match read_hash(s, c, &key) {
        Ok(Some(h)) => reply_int(c, h.hash_exists(&field) as i64),
        Ok(None) => reply_int(c, 0),
        Err(()) => {}
    }
}

fn hash_field_list(s: &mut Server, c: &mut Client, want_keys: bool) {
    let key = c.argv[1].clone();
    match read_hash(s, c, &key) {
        Ok(Some(h)) => {
            let pairs = h.hash_pairs();
            reply_array_len(c, pairs.len());
            for (f, v) in pairs {
                reply_bulk(c, if want_keys { &f } else { &v });
            }
        }
        Ok(None) => reply_array_len(c, 0),
        Err(()) => {}
    }
}

pub fn hkeys(s: &mut Server, c: &mut Client) {
    hash_field_list(s, c, true);
}

pub fn hvals(s: &mut Server, c: &mut Client) {
    hash_field_list(s, c, false);
}

pub fn hincrby(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    let field = c.argv[2].clone();
    let Some(delta) = parse_i64(&c.argv[3]) else {
        return reply_error(c, &ReplyError::NotInteger);
    };
    let existing = match write_hash(s, c, &key) {
        Ok(v) => v,
        Err(()) => return,
    };
    let current = match existing.and_then(|h| h.hash_get(&field)) {
        Some(raw) => match parse_i64(&raw) {
            Some(n) => n,
            None => return reply_error(c, &ReplyError::message("hash value is not an integer")),
        },
        None => 0,
    };
    let Some(new) = current.checked_add(delta) else {
        return reply_error(c, &ReplyError::Overflow);
    };
    let (max_entries, max_value) = (
        s.config.hash_max_packed_entries,
        s.config.hash_max_packed_value,
    );
    let dbid = c.db_index;
    hash_for_update(s, dbid, &key).hash_set(
        &field,
        new.to_string().as_bytes(),
        max_entries,
        max_value,
    );
    s.signal_write(dbid, &key);
    reply_int(c, new);
}

pub fn hincrbyfloat(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    let field = c.argv[2].clone();
    let Some(delta) = parse_f64(&c.argv[3]) else {
        return reply_error(c, &ReplyError::NotFloat);
    };
    let existing = match write_hash(s, c, &key) {
        Ok(v) => v,
        Err(()) => return,
    };
    let current = match existing.and_then(|h| h.hash_get(&field)) {
        Some(raw) => match parse_f64(&raw) {
            Some(f) => f,
            None => return reply_error(c, &ReplyError::message("hash value is not a float")),
        },
        None => 0.0,
    };
    let new = current + delta;
    if new.is_nan() || new.is_infinite() {
        return reply_error(c, &ReplyError::NanOrInfinity);
    }
    let formatted = format_f64(new);
    let (max_entries, max_value) = (
        s.config.hash_max_packed_entries,
        s.config.hash_max_packed_value,
    );
    let dbid = c.db_index;
    hash_for_update(s, dbid, &key).hash_set(&field, &formatted, max_entries, max_value);
    s.signal_write(dbid, &key);
    // Replay must apply the computed value, not redo the float math.
    c.rewritten = Some(vec![b"hset".to_vec(), key, field, formatted.clone()]);
    reply_bulk(c, &formatted);
}

pub fn hscan(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    let Some(cursor) = std::str::from_utf8(&c.argv[2])
        .ok()
        .and_then(|t| t.parse::<u64>().ok())
    else {
        return reply_error(c, &ReplyError::InvalidCursor);
    };
    let mut pattern: Option<Vec<u8>> = None;
    let mut count = 10usize;
    let mut i = 3;
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
    let hash = match read_hash(s, c, &key) {
        Ok(Some(h)) => h,
        Ok(None) => {
            reply_array_len(c, 2);
            reply_bulk(c, b"0");
            reply_array_len(c, 0);
            return;
        }
        Err(()) => return,
    };
    let (next, mut pairs) = hash.hash_scan(cursor, count);
    if let Some(p) = pattern {
        pairs.retain(|(f, _)| crate::glob::glob_match(&p, f));
    }
    reply_array_len(c, 2);
    reply_bulk(c, next.to_string().as_bytes());
    reply_array_len(c, pairs.len() * 2);
    for (f, v) in pairs {
        reply_bulk(c, &f);
        reply_bulk(c, &v);
    }
}

//! String commands

use crate::error::ReplyError;
use crate::object::{encode_string_value, Object, ObjectType, Value};
use crate::server::resp::*;
use crate::server::{Client, Server};
use crate::util::{format_f64, parse_f64, parse_i64};
use std::sync::Arc;

/// Hard cap on any string value, matching the bulk limit.
const MAX_STRING_SIZE: usize = 512 * 1024 * 1024;

/// Type-check a read: replies WRONGTYPE and returns Err on mismatch.
fn read_string(s: &mut Server, c: &mut Client, key: &[u8]) -> Result<Option<Value>, ()> {
    match s.lookup_read(c.db_index, key, false) {
        Some(v) if v.object_type() != ObjectType::String => {
            reply_error(c, &ReplyError::WrongType);
            Err(())
        }
        other => Ok(other),
    }
}

fn write_string(s: &mut Server, c: &mut Client, key: &[u8]) -> Result<Option<Value>, ()> {
    match s.lookup_write(c.db_index, key) {
        Some(v) if v.object_type() != ObjectType::String => {
            reply_error(c, &ReplyError::WrongType);
            Err(())
        }
        other => Ok(other),
    }
}

pub fn get(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    match read_string(s, c, &key) {
        Ok(Some(v)) => reply_bulk(c, &v.string_bytes()),
        Ok(None) => reply_null(c),
        Err(()) => {}
    }
}

pub fn set(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    let value = c.argv[2].clone();
    let mut nx = false;
    let mut xx = false;
    let mut expire_at: Option<u64> = None;
    let mut i = 3;
    while i < c.argv.len() {
        let opt = c.argv[i].to_ascii_lowercase();
        match opt.as_slice() {
            b"nx" => nx = true,
            b"xx" => xx = true,
            b"ex" | b"px" | b"pxat" => {
                let Some(raw) = c.argv.get(i + 1) else {
                    return reply_error(c, &ReplyError::Syntax);
                };
                let Some(n) = parse_i64(raw) else {
                    return reply_error(c, &ReplyError::NotInteger);
                };
                let at = match opt.as_slice() {
                    b"ex" => {
                        if n <= 0 {
                            return reply_error(
                                c,
                                &ReplyError::message("invalid expire time in 'set' command"),
                            );
                        }
                        s.now_ms() + n as u64 * 1000
                    }
                    b"px" => {
                        if n <= 0 {
                            return reply_error(
                                c,
                                &ReplyError::message("invalid expire time in 'set' command"),
                            );
                        }
                        s.now_ms() + n as u64
                    }
                    _ => n.max(0) as u64,
                };
                expire_at = Some(at);
                i += 1;
            }
            _ => return reply_error(c, &ReplyError::Syntax),
        }
        i += 1;
    }
    if nx && xx {
        return reply_error(c, &ReplyError::Syntax);
    }
    let exists = match write_string(s, c, &key) {
        Ok(v) => v.is_some(),
        Err(()) => return,
    };
    if (nx && exists) || (xx && !exists) {
        return reply_null(c);
    }
    let obj = encode_string_value(&s.shared, &value);
    s.set_key(c.db_index, &key, obj, false);
    if let Some(at) = expire_at {
        s.dbs[c.db_index].set_expire(&key, at);
        // Relative TTLs must not be replayed relative to a later clock.
        c.rewritten = Some(vec![
            b"set".to_vec(),
            key.clone(),
            value,
            b"pxat".to_vec(),
            at.to_string().into_bytes(),
        ]);
    }
    reply_simple(c, "OK");
}

pub fn setnx(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    let value = c.argv[2].clone();
    let exists = match write_string(s, c, &key) {
        Ok(v) => v.is_some(),
        Err(()) => return,
    };
    if exists {
        return reply_int(c, 0);
    }
    let obj = encode_string_value(&s.shared, &value);
    s.set_key(c.db_index, &key, obj, false);
    reply_int(c, 1);
}

pub fn getset(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    let value = c.argv[2].clone();
    let old = match read_string(s, c, &key) {
        Ok(v) => v,
        Err(()) => return,
    };
    match old {
        Some(v) => reply_bulk(c, &v.string_bytes()),
        None => reply_null(c),
    }
    let obj = encode_string_value(&s.shared, &value);
    s.set_key(c.db_index, &key, obj, false);
}

pub fn setrange(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    let Some(offset) = parse_i64(&c.argv[2]).filter(|&o| o >= 0) else {
        return reply_error(c, &ReplyError::OffsetOutOfRange);
    };
    let offset = offset as usize;
    let data = c.argv[3].clone();
    let existing = match write_string(s, c, &key) {
        Ok(v) => v,
        Err(()) => return,
    };
    if data.is_empty() {
        // Nothing to write; never creates or pads.
        let len = existing.map(|v| v.string_len()).unwrap_or(0);
        return reply_int(c, len as i64);
    }
    if offset + data.len() > MAX_STRING_SIZE {
        return reply_error(
            c,
            &ReplyError::message("string exceeds maximum allowed size (proto-max-bulk-len)"),
        );
    }
    let dbid = c.db_index;
    let len = match s.dbs[dbid].entries.find_mut(&key) {
        Some(slot) => Arc::make_mut(slot).string_setrange(offset, &data),
        None => {
            let mut obj = Object::raw_string(Vec::new());
            let len = obj.string_setrange(offset, &data);
            let _ = s.dbs[dbid].entries.insert(&key, Arc::new(obj));
            len
        }
    };
    s.signal_write(dbid, &key);
    reply_int(c, len as i64);
}

pub fn getrange(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    let (Some(start), Some(end)) = (parse_i64(&c.argv[2]), parse_i64(&c.argv[3])) else {
        return reply_error(c, &ReplyError::NotInteger);
    };
    let value = match read_string(s, c, &key) {
        Ok(Some(v)) => v,
        Ok(None) => return reply_bulk(c, b""),
        Err(()) => return,
    };
    let bytes = value.string_bytes();
    let len = bytes.len() as i64;
    let mut start = if start < 0 { (len + start).max(0) } else { start };
    let mut end = if end < 0 { (len + end).max(0) } else { end };
    end = end.min(len - 1);
    start = start.min(len);
    if len == 0 || start > end {
        return reply_bulk(c, b"");
    }
    reply_bulk(c, &bytes[start as usize..=end as usize]);
}

fn incr_decr(s: &mut Server, c: &mut Client, delta: i64) {
    let key = c.argv[1].clone();
    let existing = match write_string(s, c, &key) {
        Ok(v) => v,
        Err(()) => return,
    };
    let current = match &existing {
        Some(v) => match v.string_as_int() {
            Some(n) => n,
            None => return reply_error(c, &ReplyError::NotInteger),
        },
        None => 0,
    };
    let Some(new) = current.checked_add(delta) else {
        return reply_error(c, &ReplyError::Overflow);
    };
    let obj = s
        .shared
        .integer(new)
        .unwrap_or_else(|| Arc::new(Object::from_int(new)));
    // Counter updates keep any TTL attached to the key.
    let dbid = c.db_index;
    s.dbs[dbid].entries.upsert(&key, obj);
    s.signal_write(dbid, &key);
    reply_int(c, new);
}

pub fn incr(s: &mut Server, c: &mut Client) {
    incr_decr(s, c, 1);
}

pub fn decr(s: &mut Server, c: &mut Client) {
    incr_decr(s, c, -1);
}

pub fn incrby(s: &mut Server, c: &mut Client) {
    let Some(delta) = parse_i64(&c.argv[2]) else {
        return reply_error(c, &ReplyError::NotInteger);
    };
    incr_decr(s, c, delta);
}

pub fn decrby(s: &mut Server, c: &mut Client) {
    let Some(delta) = parse_i64(&c.argv[2]) else {
        return reply_error(c, &ReplyError::NotInteger);
    };
    let Some(neg) = delta.checked_neg() else {
        return reply_error(c, &ReplyError::Overflow);
    };
    incr_decr(s, c, neg);
}

pub fn incrbyfloat(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    let Some(delta) = parse_f64(&c.argv[2]) else {
        return reply_error(c, &ReplyError::NotFloat);
    };
    let existing = match write_string(s, c, &key) {
        Ok(v) => v,
        Err(()) => return,
    };
    let current = match &existing {
        Some(v) => match parse_f64(&v.string_bytes()) {
            Some(f) => f,
            None => return reply_error(c, &ReplyError::NotFloat),
        },
        None => 0.0,
    };
    let new = current + delta;
    if new.is_nan() || new.is_infinite() {
        return reply_error(c, &ReplyError::NanOrInfinity);
    }
    let formatted = format_f64(new);
    let dbid = c.db_index;
    s.dbs[dbid]
        .entries
        .upsert(&key, Arc::new(Object::string_from(&formatted)));
    s.signal_write(dbid, &key);
    // Float math is not replay-safe; downstream gets the result.
    c.rewritten = Some(vec![b"set".to_vec(), key, formatted.clone()]);
    reply_bulk(c, &formatted);
}

pub fn append(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    let data = c.argv[2].clone();
    if let Err(()) = write_string(s, c, &key) {
        return;
    }
    let dbid = c.db_index;
    let len = match s.dbs[dbid].entries.find_mut(&key) {
        Some(slot) => Arc::make_mut(slot).string_append(&data),
        None => {
            let len = data.len();
            let _ = s.dbs[dbid]
                .entries
                .insert(&key, Arc::new(Object::raw_string(data)));
            len
        }
    };
    s.signal_write(dbid, &key);
    reply_int(c, len as i64);
}

pub fn strlen(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    match read_string(s, c, &key) {
        Ok(Some(v)) => reply_int(c, v.string_len() as i64),
        Ok(None) => reply_int(c, 0),
        Err(()) => {}
    }
}

pub fn mget(s: &mut Server, c: &mut Client) {
    let keys: Vec<Vec<u8>> = c.argv[1..].to_vec();
    reply_array_len(c, keys.len());
    for key in keys {
        match s.lookup_read(c.db_index, &key, false) {
            Some(v) if v.object_type() == ObjectType::String => {
                reply_bulk(c, &v.string_bytes());
            }
            _ => reply_null(c),
        }
    }
}

pub fn mset(s: &mut Server, c: &mut Client) {
    if (c.argv.len() - 1) % 2 != 0 {
        return reply_error(c, &ReplyError::Arity("mset".into()));
    }
    for pair in c.argv[1..].to_vec().chunks(2) {
        let obj = encode_string_value(&s.shared, &pair[1]);
        s.set_key(c.db_index, &pair[0], obj, false);
    }
    reply_simple(c, "OK");
}

pub fn msetnx(s: &mut Server, c: &mut Client) {
    if (c.argv.len() - 1) % 2 != 0 {
        return reply_error(c, &ReplyError::Arity("msetnx".into()));
    }
    let pairs: Vec<Vec<u8>> = c.argv[1..].to_vec();
    for pair in pairs.chunks(2) {
        if s.lookup_write(c.db_index, &pair[0]).is_some() {
            return reply_int(c, 0);
        }
    }
    for pair in pairs.chunks(2) {
        let obj = encode_string_value(&s.shared, &pair[1]);
        s.set_key(c.db_index, &pair[0], obj, false);
    }
    reply_int(c, 1);
}

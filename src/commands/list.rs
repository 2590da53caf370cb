//! List commands, including the blocking pop family

use crate::error::ReplyError;
use crate::object::{ObjectType, Value};
use crate::server::resp::*;
use crate::server::{BlockedState, Client, Server};
use crate::util::{parse_f64, parse_i64};
use std::sync::Arc;

fn read_list(s: &mut Server, c: &mut Client, key: &[u8]) -> Result<Option<Value>, ()> {
    match s.lookup_read(c.db_index, key, false) {
        Some(v) if v.object_type() != ObjectType::List => {
            reply_error(c, &ReplyError::WrongType);
            Err(())
        }
        other => Ok(other),
    }
}

fn write_list(s: &mut Server, c: &mut Client, key: &[u8]) -> Result<Option<Value>, ()> {
    match s.lookup_write(c.db_index, key) {
        Some(v) if v.object_type() != ObjectType::List => {
            reply_error(c, &ReplyError::WrongType);
            Err(())
        }
        other => Ok(other),
    }
}

fn push_generic(s: &mut Server, c: &mut Client, head: bool, require_existing: bool) {
    let key = c.argv[1].clone();
    let existing = match write_list(s, c, &key) {
        Ok(v) => v,
        Err(()) => return,
    };
    if require_existing && existing.is_none() {
        return reply_int(c, 0);
    }
    let values: Vec<Vec<u8>> = c.argv[2..].to_vec();
    for v in &values {
        s.push_to_list_key(c.db_index, &key, v, head);
    }
    let len = s.dbs[c.db_index]
        .peek(&key)
        .map(|v| v.list_ref().len())
        .unwrap_or(0);
    reply_int(c, len as i64);
}

pub fn lpush(s: &mut Server, c: &mut Client) {
    push_generic(s, c, true, false);
}

pub fn rpush(s: &mut Server, c: &mut Client) {
    push_generic(s, c, false, false);
}

pub fn lpushx(s: &mut Server, c: &mut Client) {
    push_generic(s, c, true, true);
}

pub fn rpushx(s: &mut Server, c: &mut Client) {
    push_generic(s, c, false, true);
}

fn pop_generic(s: &mut Server, c: &mut Client, head: bool) {
    let key = c.argv[1].clone();
    match write_list(s, c, &key) {
        Ok(Some(_)) => {}
        Ok(None) => return reply_null(c),
        Err(()) => return,
    }
    match s.pop_from_list_key(c.db_index, &key, head) {
        Some(v) => reply_bulk(c, &v),
        None => reply_null(c),
    }
}

pub fn lpop(s: &mut Server, c: &mut Client) {
    pop_generic(s, c, true);
}

pub fn rpop(s: &mut Server, c: &mut Client) {
    pop_generic(s, c, false);
}

pub fn llen(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    match read_list(s, c, &key) {
        Ok(Some(v)) => reply_int(c, v.list_ref().len() as i64),
        Ok(None) => reply_int(c, 0),
        Err(()) => {}
    }
}

pub fn lindex(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    let Some(index) = parse_i64(&c.argv[2]) else {
        return reply_error(c, &ReplyError::NotInteger);
    };
    match read_list(s, c, &key) {
        Ok(Some(_)) => {}
        Ok(None) => return reply_null(c),
        Err(()) => return,
    }
    // Reads decompress a node transiently; that needs the live object.
    let dbid = c.db_index;
    let value = {
        let slot = s.dbs[dbid].entries.find_mut(&key).unwrap();
        Arc::make_mut(slot).list_mut().get(index)
    };
    match value {
        Some(v) => reply_bulk(c, &v),
        None => reply_null(c),
    }
}

pub fn lset(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    let Some(index) = parse_i64(&c.argv[2]) else {
        return reply_error(c, &ReplyError::NotInteger);
    };
    let data = c.argv[3].clone();
    match write_list(s, c, &key) {
        Ok(Some(_)) => {}
        Ok(None) => return reply_error(c, &ReplyError::NoKey),
        Err(()) => return,
    }
    let dbid = c.db_index;
    let ok = {
        let slot = s.dbs[dbid].entries.find_mut(&key).unwrap();
        Arc::make_mut(slot).list_mut().replace_at(index, &data)
    };
    if !ok {
        return reply_error(c, &ReplyError::IndexOutOfRange);
    }
    s.signal_write(dbid, &key);
    reply_simple(c, "OK");
}

pub fn linsert(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    let after = match c.argv[2].to_ascii_lowercase().as_slice() {
        b"before" => false,
        b"after" => true,
        _ => return reply_error(c, &ReplyError::Syntax),
    };
    let pivot = c.argv[3].clone();
    let data = c.argv[4].clone();
    match write_list(s, c, &key) {
        Ok(Some(_)) => {}
        Ok(None) => return reply_int(c, 0),
        Err(()) => return,
    }
    let dbid = c.db_index;
    let new_len = {
        let slot = s.dbs[dbid].entries.find_mut(&key).unwrap();
        let ql = Arc::make_mut(slot).list_mut();
        let mut cursor = ql.cursor(true);
        let mut found = None;
        while let Some(v) = cursor.next(ql) {
            if v == pivot {
                found = cursor.handle();
                break;
            }
        }
        match found {
            Some(handle) => {
                ql.insert_at(handle, after, &data);
                Some(ql.len())
            }
            None => None,
        }
    };
    match new_len {
        Some(len) => {
            s.signal_write(dbid, &key);
            reply_int(c, len as i64);
        }
        None => reply_int(c, -1),
    }
}

pub fn lrange(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    let (Some(start), Some(stop)) = (parse_i64(&c.argv[2]), parse_i64(&c.argv[3])) else {
        return reply_error(c, &ReplyError::NotInteger);
    };
    match read_list(s, c, &key) {
        Ok(Some(_)) => {}
        Ok(None) => return reply_array_len(c, 0),
        Err(()) => return,
    }
    let dbid = c.db_index;
    let values = {
        let slot = s.dbs[dbid].entries.find_mut(&key).unwrap();
        let ql = Arc::make_mut(slot).list_mut();
        let len = ql.len() as i64;
        let mut start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        let mut out = Vec::new();
        if start <= stop && stop >= 0 {
            start = start.min(len);
            let mut cursor = ql.cursor(true);
            let mut index = 0i64;
            while let Some(v) = cursor.next(ql) {
                if index > stop {
                    break;
                }
                if index >= start {
                    out.push(v);
                }
                index += 1;
            }
        }
        out
    };
    reply_array_len(c, values.len());
    for v in values {
        reply_bulk(c, &v);
    }
}

pub fn ltrim(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    let (Some(start), Some(stop)) = (parse_i64(&c.argv[2]), parse_i64(&c.argv[3])) else {
        return reply_error(c, &ReplyError::NotInteger);
    };
    match write_list(s, c, &key) {
        Ok(Some(_)) => {}
        Ok(None) => return reply_simple(c, "OK"),
        Err(()) => return,
    }
    let dbid = c.db_index;
    let emptied = {
        let slot = s.dbs[dbid].entries.find_mut(&key).unwrap();
        let ql = Arc::make_mut(slot).list_mut();
        let len = ql.len() as i64;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = (if stop < 0 { len + stop } else { stop }).min(len - 1);
        if start > stop || start >= len {
            // Everything goes.
            ql.delete_range(0, len as usize);
        } else {
            // Trim the tail first so head indexes stay valid.
            if stop + 1 < len {
                ql.delete_range(stop + 1, (len - stop - 1) as usize);
            }
            if start > 0 {
                ql.delete_range(0, start as usize);
            }
        }
        ql.is_empty()
    };
    if emptied {
        s.dbs[dbid].remove_entry(&key);
    }
    s.signal_write(dbid, &key);
    reply_simple(c, "OK");
}

pub fn lrem(s: &mut Server, c: &mut Client) {
    let key = c.argv[1].clone();
    let Some(count) = parse_i64(&c.argv[2]) else {
        return reply_error(c, &ReplyError::NotInteger);
    };
    let needle = c.argv[3].clone();
    match write_list(s, c, &key) {
        Ok(Some(_)) => {}
        Ok(None) => return reply_int(c, 0),
        Err(()) => return,
    }
    let dbid = c.db_index;
    let (removed, emptied) = {
        let slot = s.dbs[dbid].entries.find_mut(&key).unwrap();
        let ql = Arc::make_mut(slot).list_mut();
        let from_head = count >= 0;
        let limit = if count == 0 {
            usize::MAX
        } else {
            count.unsigned_abs() as usize
        };
        let mut removed = 0usize;
        let mut cursor = ql.cursor(from_head);
        while removed < limit {
            let Some(v) = cursor.next(ql) else { break };
            if v == needle {
                cursor.delete_current(ql);
                removed += 1;
            }
        }
        (removed, ql.is_empty())
    };
    if emptied {
        s.dbs[dbid].remove_entry(&key);
    }
    if removed > 0 {
        s.signal_write(dbid, &key);
    }
    reply_int(c, removed as i64);
}

pub fn rpoplpush(s: &mut Server, c: &mut Client) {
    let src = c.argv[1].clone();
    let dst = c.argv[2].clone();
    let src_value = match write_list(s, c, &src) {
        Ok(v) => v,
        Err(()) => return,
    };
    if src_value.is_none() {
        return reply_null(c);
    }
    // Destination must be a list (or missing) before popping anything.
    match write_list(s, c, &dst) {
        Ok(_) => {}
        Err(()) => return,
    }
    let Some(popped) = s.pop_from_list_key(c.db_index, &src, false) else {
        return reply_null(c);
    };
    s.push_to_list_key(c.db_index, &dst, &popped, true);
    reply_bulk(c, &popped);
}

fn blocking_pop(s: &mut Server, c: &mut Client, head: bool) {
    let timeout_raw = c.argv.last().unwrap().clone();
    let Some(timeout) = parse_f64(&timeout_raw).filter(|t| t.is_finite()) else {
        return reply_error(c, &ReplyError::message("timeout is not a float or out of range"));
    };
    if timeout < 0.0 {
        return reply_error(c, &ReplyError::message("timeout is negative"));
    }
    let keys: Vec<Vec<u8>> = c.argv[1..c.argv.len() - 1].to_vec();
    for key in &keys {
        let value = match write_list(s, c, key) {
            Ok(v) => v,
            Err(()) => return,
        };
        if value.is_some() {
            let Some(popped) = s.pop_from_list_key(c.db_index, key, head) else {
                continue;
            };
            let pop_cmd: &[u8] = if head { b"lpop" } else { b"rpop" };
            c.rewritten = Some(vec![pop_cmd.to_vec(), key.clone()]);
            reply_array_len(c, 2);
            reply_bulk(c, key);
            reply_bulk(c, &popped);
            return;
        }
    }
    if s.executing_transaction() {
        // Inside a transaction nothing may suspend; behave as the
        // non-blocking miss.
        return reply_null_array(c);
    }
    let timeout_at = if timeout == 0.0 {
        None
    } else {
        Some(s.now_ms() + (timeout * 1000.0) as u64)
    };
    c.block = Some(BlockedState {
        keys,
        timeout_at,
        push_target: None,
        pop_head: head,
        timer_id: None,
    });
}

pub fn blpop(s: &mut Server, c: &mut Client) {
    blocking_pop(s, c, true);
}

pub fn brpop(s: &mut Server, c: &mut Client) {
    blocking_pop(s, c, false);
}

pub fn brpoplpush(s: &mut Server, c: &mut Client) {
    let src = c.argv[1].clone();
    let dst = c.argv[2].clone();
    let Some(timeout) = parse_f64(&c.argv[3]).filter(|t| t.is_finite()) else {
        return reply_error(c, &ReplyError::message("timeout is not a float or out of range"));
    };
    if timeout < 0.0 {
        return reply_error(c, &ReplyError::message("timeout is negative"));
    }
    let src_value = match write_list(s, c, &src) {
        Ok(v) => v,
        Err(()) => return,
    };
    match write_list(s, c, &dst) {
        Ok(_) => {}
        Err(()) => return,
    }
    if src_value.is_some() {
        if let Some(popped) = s.pop_from_list_key(c.db_index, &src, false) {
            s.push_to_list_key(c.db_index, &dst, &popped, true);
            c.rewritten = Some(vec![b"rpoplpush".to_vec(), src, dst]);
            return reply_bulk(c, &popped);
        }
    }
    if s.executing_transaction() {
        return reply_null(c);
    }
    let timeout_at = if timeout == 0.0 {
        None
    } else {
        Some(s.now_ms() + (timeout * 1000.0) as u64)
    };
    c.block = Some(BlockedState {
        keys: vec![src],
        timeout_at,
        push_target: Some(dst),
        pop_head: false,
        timer_id: None,
    });
}

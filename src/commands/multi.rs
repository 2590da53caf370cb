//! Transaction commands: MULTI / EXEC / DISCARD / WATCH / UNWATCH
//!
//! The connection state machine is normal -> (MULTI) -> queuing ->
//! (EXEC | DISCARD) -> normal. Failed queue-time validation poisons the
//! queue; a touched watched key poisons the compare-and-set. EXEC checks
//! both before running anything.

use crate::error::ReplyError;
use crate::server::resp::*;
use crate::server::{Client, Server};

pub fn multi(_s: &mut Server, c: &mut Client) {
    if c.in_multi {
        return reply_error(c, &ReplyError::message("MULTI calls can not be nested"));
    }
    c.in_multi = true;
    reply_simple(c, "OK");
}

pub fn discard(s: &mut Server, c: &mut Client) {
    if !c.in_multi {
        return reply_error(c, &ReplyError::message("DISCARD without MULTI"));
    }
    unwatch_all(s, c);
    c.discard_multi();
    reply_simple(c, "OK");
}

pub fn exec(s: &mut Server, c: &mut Client) {
    if !c.in_multi {
        return reply_error(c, &ReplyError::message("EXEC without MULTI"));
    }
    if c.dirty_exec {
        // A queued command failed validation back then; surface it now.
        unwatch_all(s, c);
        c.discard_multi();
        return reply_error(c, &ReplyError::ExecAbort);
    }
    if c.dirty_cas {
        // Optimistic locking lost: a watched key changed under us.
        unwatch_all(s, c);
        c.discard_multi();
        return reply_null_array(c);
    }
    unwatch_all(s, c);
    let queue = std::mem::take(&mut c.multi_queue);
    reply_array_len(c, queue.len());
    s.exec_bracket_begin();
    for queued in queue {
        c.argv = queued.argv;
        s.call_command(c, queued.cmd);
    }
    s.exec_bracket_end(c.db_index);
    c.discard_multi();
}

pub fn watch(s: &mut Server, c: &mut Client) {
    if c.in_multi {
        return reply_error(c, &ReplyError::message("WATCH inside MULTI is not allowed"));
    }
    let keys: Vec<Vec<u8>> = c.argv[1..].to_vec();
    for key in keys {
        let entry = (c.db_index, key.clone());
        if !c.watched.contains(&entry) {
            s.dbs[c.db_index].add_watcher(&key, c.id);
            c.watched.push(entry);
        }
    }
    reply_simple(c, "OK");
}

pub fn unwatch(s: &mut Server, c: &mut Client) {
    unwatch_all(s, c);
    c.dirty_cas = false;
    reply_simple(c, "OK");
}

/// Drop every watch registration this connection holds.
pub fn unwatch_all(s: &mut Server, c: &mut Client) {
    for (dbid, key) in c.watched.drain(..) {
        s.dbs[dbid].remove_watcher(&key, c.id);
    }
}

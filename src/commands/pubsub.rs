//! Pub/sub commands

use crate::error::ReplyError;
use crate::propagate::PROPAGATE_REPLICAS;
use crate::server::resp::*;
use crate::server::{Client, PostAction, Server};
use crate::ClientId;

fn notify_subscribed(c: &mut Client, kind: &str, name: &[u8]) {
    reply_array_len(c, 3);
    reply_bulk(c, kind.as_bytes());
    reply_bulk(c, name);
    reply_int(c, c.subscription_count() as i64);
}

fn notify_unsubscribed(c: &mut Client, kind: &str, name: Option<&[u8]>) {
    reply_array_len(c, 3);
    reply_bulk(c, kind.as_bytes());
    match name {
        Some(n) => reply_bulk(c, n),
        None => reply_null(c),
    }
    reply_int(c, c.subscription_count() as i64);
}

pub fn subscribe(s: &mut Server, c: &mut Client) {
    let channels: Vec<Vec<u8>> = c.argv[1..].to_vec();
    for ch in channels {
        if s.pubsub.subscribe(c.id, &ch) {
            c.sub_channels.push(ch.clone());
        }
        notify_subscribed(c, "subscribe", &ch);
    }
}

pub fn unsubscribe(s: &mut Server, c: &mut Client) {
    let targets: Vec<Vec<u8>> = if c.argv.len() > 1 {
        c.argv[1..].to_vec()
    } else {
        c.sub_channels.clone()
    };
    if targets.is_empty() {
        // Nothing was subscribed; a single notification still goes out.
        notify_unsubscribed(c, "unsubscribe", None);
        return;
    }
    for ch in targets {
        if s.pubsub.unsubscribe(c.id, &ch) {
            c.sub_channels.retain(|e| e != &ch);
        }
        notify_unsubscribed(c, "unsubscribe", Some(&ch));
    }
}

pub fn psubscribe(s: &mut Server, c: &mut Client) {
    let patterns: Vec<Vec<u8>> = c.argv[1..].to_vec();
    for p in patterns {
        if s.pubsub.subscribe_pattern(c.id, &p) {
            c.sub_patterns.push(p.clone());
        }
        notify_subscribed(c, "psubscribe", &p);
    }
}

pub fn punsubscribe(s: &mut Server, c: &mut Client) {
    let targets: Vec<Vec<u8>> = if c.argv.len() > 1 {
        c.argv[1..].to_vec()
    } else {
        c.sub_patterns.clone()
    };
    if targets.is_empty() {
        notify_unsubscribed(c, "punsubscribe", None);
        return;
    }
    for p in targets {
        // A never-subscribed pattern is a quiet no-op that still
        // acknowledges.
        if s.pubsub.unsubscribe_pattern(c.id, &p) {
            c.sub_patterns.retain(|e| e != &p);
        }
        notify_unsubscribed(c, "punsubscribe", Some(&p));
    }
}

fn write_message(
    target: &mut Client,
    pattern: Option<&[u8]>,
    channel: &[u8],
    payload: &[u8],
) {
    match pattern {
        Some(p) => {
            reply_array_len(target, 4);
            reply_bulk(target, b"pmessage");
            reply_bulk(target, p);
            reply_bulk(target, channel);
            reply_bulk(target, payload);
        }
        None => {
            reply_array_len(target, 3);
            reply_bulk(target, b"message");
            reply_bulk(target, channel);
            reply_bulk(target, payload);
        }
    }
}

pub fn publish(s: &mut Server, c: &mut Client) {
    let channel = c.argv[1].clone();
    let payload = c.argv[2].clone();
    let deliveries = s.pubsub.publish(&channel);
    let mut receivers = 0i64;
    let mut woken: Vec<ClientId> = Vec::new();
    for d in &deliveries {
        if d.target == c.id {
            // The publisher is its own subscriber here.
            write_message(c, d.pattern.as_deref(), &channel, &payload);
            receivers += 1;
            continue;
        }
        if let Some(target) = s.clients.get_mut(&d.target) {
            write_message(target, d.pattern.as_deref(), &channel, &payload);
            receivers += 1;
            if !woken.contains(&d.target) {
                woken.push(d.target);
            }
        }
    }
    for id in woken {
        s.actions.push(PostAction::Wake { client: id });
    }
    // Messages reach the replicas' subscribers too.
    let argv = c.argv.clone();
    s.propagator.propagate(c.db_index, &argv, PROPAGATE_REPLICAS);
    reply_int(c, receivers);
}

pub fn pubsub_cmd(s: &mut Server, c: &mut Client) {
    match c.argv[1].to_ascii_lowercase().as_slice() {
        b"channels" => {
            let pattern = c.argv.get(2).cloned();
            let channels = s.pubsub.channels_list(pattern.as_deref());
            reply_array_len(c, channels.len());
            for ch in channels {
                reply_bulk(c, &ch);
            }
        }
        b"numsub" => {
            let channels: Vec<Vec<u8>> = c.argv[2..].to_vec();
            reply_array_len(c, channels.len() * 2);
            for ch in channels {
                let n = s.pubsub.subscriber_count(&ch);
                reply_bulk(c, &ch);
                reply_int(c, n as i64);
            }
        }
        b"numpat" => {
            reply_int(c, s.pubsub.pattern_count() as i64);
        }
        _ => reply_error(
            c,
            &ReplyError::message(format!(
                "Unknown PUBSUB subcommand or wrong number of arguments for '{}'",
                String::from_utf8_lossy(&c.argv[1])
            )),
        ),
    }
}

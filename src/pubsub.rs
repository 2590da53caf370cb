//! Channel and pattern subscription routing
//!
//! Server-side half of pub/sub: a channel -> subscribers map plus an
//! ordered (subscriber, pattern) sequence. Each client mirrors its own
//! subscriptions; the command layer keeps the two sides in step. Publish
//! resolves deliveries here and the server writes the actual messages.

use crate::dict::Dict;
use crate::glob::glob_match;
use crate::ClientId;

/// One resolved delivery of a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub target: ClientId,
    /// Present when the delivery came from a pattern subscription.
    pub pattern: Option<Vec<u8>>,
}

#[derive(Default)]
pub struct PubSub {
    /// channel name -> subscribers in subscription order
    channels: Dict<Vec<ClientId>>,
    /// (subscriber, pattern) pairs in subscription order
    patterns: Vec<(ClientId, Vec<u8>)>,
}

impl PubSub {
    pub fn new() -> Self {
        Self { channels: Dict::new(), patterns: Vec::new() }
    }

    /// Register `id` on a channel. False when it was already subscribed.
    pub fn subscribe(&mut self, id: ClientId, channel: &[u8]) -> bool {
        match self.channels.find_mut(channel) {
            Some(subs) => {
                if subs.contains(&id) {
                    return false;
                }
                subs.push(id);
                true
            }
            None => {
                let _ = self.channels.insert(channel, vec![id]);
                true
            }
        }
    }

    /// Drop `id` from a channel, removing the channel once empty. False
    /// when it was not subscribed.
    pub fn unsubscribe(&mut self, id: ClientId, channel: &[u8]) -> bool {
        let Some(subs) = self.channels.find_mut(channel) else {
            return false;
        };
        let Some(pos) = subs.iter().position(|&s| s == id) else {
            return false;
        };
        subs.remove(pos);
        if subs.is_empty() {
            self.channels.remove(channel);
        }
        true
    }

    /// Append a pattern subscription. False on an exact duplicate.
    pub fn subscribe_pattern(&mut self, id: ClientId, pattern: &[u8]) -> bool {
        if self
            .patterns
            .iter()
            .any(|(s, p)| *s == id && p.as_slice() == pattern)
        {
            return false;
        }
        self.patterns.push((id, pattern.to_vec()));
        true
    }

    pub fn unsubscribe_pattern(&mut self, id: ClientId, pattern: &[u8]) -> bool {
        let Some(pos) = self
            .patterns
            .iter()
            .position(|(s, p)| *s == id && p.as_slice() == pattern)
        else {
            return false;
        };
        self.patterns.remove(pos);
        true
    }

    /// Resolve the fanout for a message: exact subscribers first in
    /// subscription order, then every matching pattern pair.
    pub fn publish(&self, channel: &[u8]) -> Vec<Delivery> {
        let mut out = Vec::new();
        if let Some(subs) = self.channels.find(channel) {
            for &id in subs {
                out.push(Delivery { target: id, pattern: None });
            }
        }
        for (id, pattern) in &self.patterns {
            if glob_match(pattern, channel) {
                out.push(Delivery { target: *id, pattern: Some(pattern.clone()) });
            }
        }
        out
    }

    /// Active channel names, optionally filtered by a glob pattern.
    pub fn channels_list(&self, pattern: Option<&[u8]>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for (name, _) in self.channels.iter() {
            let keep = match pattern {
                Some(p) => glob_match(p, name),
                None => true,
            };
            if keep {
                out.push(name.to_vec());
            }
        }
        out
    }

    /// Subscriber count for an exact channel.
    pub fn subscriber_count(&self, channel: &[u8]) -> usize {
        self.channels.find(channel).map_or(0, |s| s.len())
    }

    /// Total pattern subscriptions across all clients.
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Remove every registration of a disconnecting client.
    pub fn drop_client(&mut self, id: ClientId, channels: &[Vec<u8>], patterns: &[Vec<u8>]) {
        for ch in channels {
            self.unsubscribe(id, ch);
        }
        for p in patterns {
            self.unsubscribe_pattern(id, p);
        }
    }
}

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use {dashmap::DashMap, serde::Serialize};

use crate::message::NormalizedMessage;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextEntry {
    pub sender_id: String,
    pub body: String,
    pub timestamp: u64,
}

/// Immutable view handed to every agent triggered by one inbound message.
pub type ContextSnapshot = Arc<[ContextEntry]>;

/// Recent inbound messages per `(channel, peer)`.
///
/// Fan-out agents each keep private histories, but they all read the same
/// snapshot taken when the triggering message arrived.
pub struct RecentContext {
    window: AtomicUsize,
    buffers: DashMap<(String, String), VecDeque<ContextEntry>>,
}

impl RecentContext {
    pub fn new(window: usize) -> Self {
        Self {
            window: AtomicUsize::new(window),
            buffers: DashMap::new(),
        }
    }

    pub fn set_window(&self, window: usize) {
        self.window.store(window, Ordering::Relaxed);
    }

    /// Record `msg` and return the buffer including it.
    pub fn record(&self, msg: &NormalizedMessage) -> ContextSnapshot {
        let window = self.window.load(Ordering::Relaxed).max(1);
        let mut buf = self
            .buffers
            .entry((msg.channel.clone(), msg.peer.id.clone()))
            .or_default();
        buf.push_back(ContextEntry {
            sender_id: msg.sender_id.clone(),
            body: msg.body.clone(),
            timestamp: msg.timestamp,
        });
        while buf.len() > window {
            buf.pop_front();
        }
        buf.iter().cloned().collect::<Vec<_>>().into()
    }

    pub fn snapshot(&self, channel: &str, peer_id: &str) -> ContextSnapshot {
        self.buffers
            .get(&(channel.to_string(), peer_id.to_string()))
            .map(|b| b.iter().cloned().collect::<Vec<_>>().into())
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }
}

//! Matching incoming lines to commands that are waiting for a reply.
//!
//! The protocol has no sequence numbers, so the only thing tying a reply to
//! its request is the key (`@PWR`, `@VOL`, ...). At most one pending
//! response may exist per key; the IO task holds back a queued command whose
//! key is still outstanding.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use avrlink_core::error::{Error, Result};

use crate::protocol;
use crate::queue::Reply;

/// A written command whose reply has not arrived yet.
#[derive(Debug)]
pub struct PendingResponse {
    /// Correlation key expected at the start of the reply.
    pub key: String,
    /// When the command was written.
    pub sent_at: Instant,
    /// When the command times out.
    pub deadline: Instant,
    reply: Reply,
}

impl PendingResponse {
    /// Fulfil the continuation. Consumes the entry, so it can only happen once.
    pub fn complete(self, result: Result<String>) {
        let _ = self.reply.send(result);
    }
}

/// Outcome of offering a line to the correlator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    /// The line answered the pending command with this key.
    Resolved { key: String },
    /// No command with the line's key is pending.
    Unsolicited,
}

/// Map from correlation key to the command waiting on it.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: HashMap<String, PendingResponse>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for a reply to a command just written at `now`.
    ///
    /// If a response for `key` was already pending it is completed with
    /// [`Error::Dropped`]; callers are expected to prevent that.
    pub fn register(&mut self, key: String, reply: Reply, now: Instant, timeout: Duration) {
        let entry = PendingResponse {
            key: key.clone(),
            sent_at: now,
            deadline: now + timeout,
            reply,
        };
        if let Some(previous) = self.pending.insert(key, entry) {
            warn!(key = %previous.key, "replacing pending response with the same key");
            previous.complete(Err(Error::Dropped));
        }
    }

    /// Whether a response with this key is outstanding.
    pub fn contains(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    /// Offer an incoming line (without terminator).
    ///
    /// If its key is pending, the entry is removed and its continuation
    /// receives the line. A line with any other key never touches pending
    /// entries.
    pub fn resolve(&mut self, line: &str) -> Correlation {
        let key = protocol::extract_key(line);
        match self.pending.remove(key) {
            Some(entry) => {
                let key = entry.key.clone();
                entry.complete(Ok(line.to_string()));
                Correlation::Resolved { key }
            }
            None => Correlation::Unsolicited,
        }
    }

    /// Time out every entry whose deadline is at or before `now`.
    ///
    /// Each expired continuation receives [`Error::Timeout`]. Returns the
    /// expired keys, earliest deadline first.
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let mut due: Vec<(Instant, String)> = self
            .pending
            .values()
            .filter(|p| p.deadline <= now)
            .map(|p| (p.deadline, p.key.clone()))
            .collect();
        due.sort();

        let mut expired = Vec::with_capacity(due.len());
        for (_, key) in due {
            if let Some(entry) = self.pending.remove(&key) {
                entry.complete(Err(Error::Timeout));
                expired.push(key);
            }
        }
        expired
    }

    /// Fail every pending entry with an error built by `make_err`.
    ///
    /// Returns how many entries were failed.
    pub fn fail_all(&mut self, mut make_err: impl FnMut() -> Error) -> usize {
        let n = self.pending.len();
        for (_, entry) in self.pending.drain() {
            entry.complete(Err(make_err()));
        }
        n
    }

    /// Remove every pending entry without completing it.
    pub fn drain(&mut self) -> Vec<PendingResponse> {
        self.pending.drain().map(|(_, entry)| entry).collect()
    }

    /// The earliest deadline among pending entries.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Pending keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.pending.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

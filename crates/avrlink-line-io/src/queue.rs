//! Bounded FIFO of commands waiting to be written.
//!
//! [`CommandQueue`] holds no timers of its own. It remembers when the channel
//! becomes free again (`ready_at`) and the IO task asks it, with an explicit
//! `now`, whether the head may be sent. That keeps the queue a plain value
//! that tests can drive with any clock.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use avrlink_core::error::{Error, Result};

use crate::protocol;

/// Continuation for a command that expects a reply.
///
/// Receives the matching response line (without terminator) or the reason
/// the command failed. Fulfilled at most once.
pub type Reply = oneshot::Sender<Result<String>>;

/// A command submitted to the device but not yet written.
#[derive(Debug)]
pub struct Command {
    /// Wire body, e.g. `@PWR:?\r`.
    pub body: String,
    /// Correlation key derived from `body`, e.g. `@PWR`.
    pub key: String,
    /// `None` for fire-and-forget commands.
    pub reply: Option<Reply>,
    /// When the command was submitted.
    pub enqueued_at: Instant,
}

impl Command {
    /// Create a command, deriving its key from `body`.
    pub fn new(body: impl Into<String>, reply: Option<Reply>, now: Instant) -> Self {
        let body = body.into();
        let key = protocol::extract_key(&body).to_string();
        Self {
            body,
            key,
            reply,
            enqueued_at: now,
        }
    }

    /// Whether a caller is waiting for the reply.
    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Complete the continuation (if any) with an error.
    pub fn fail(self, err: Error) {
        if let Some(reply) = self.reply {
            let _ = reply.send(Err(err));
        }
    }
}

/// Ordered buffer of not-yet-sent commands with a capacity bound.
#[derive(Debug)]
pub struct CommandQueue {
    commands: VecDeque<Command>,
    capacity: usize,
    /// `None` means the channel is free. Otherwise the instant the
    /// inter-command spacing ends.
    ready_at: Option<Instant>,
}

impl CommandQueue {
    /// Create an empty queue. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            commands: VecDeque::new(),
            capacity: capacity.max(1),
            ready_at: None,
        }
    }

    /// Append a command to the tail.
    ///
    /// If the queue would exceed its capacity, every queued command is removed
    /// first and returned; the new command is then the only one retained.
    /// The returned vector is empty when nothing overflowed.
    pub fn push(&mut self, command: Command) -> Vec<Command> {
        let evicted = if self.commands.len() + 1 > self.capacity {
            self.commands.drain(..).collect()
        } else {
            Vec::new()
        };
        self.commands.push_back(command);
        evicted
    }

    /// Whether the inter-command spacing has elapsed at `now`.
    pub fn is_ready(&self, now: Instant) -> bool {
        match self.ready_at {
            None => true,
            Some(at) => now >= at,
        }
    }

    /// The command that would be sent next.
    pub fn front(&self) -> Option<&Command> {
        self.commands.front()
    }

    /// Take the head command if the channel is ready, and mark the channel
    /// busy until `now + delay`.
    pub fn pop(&mut self, now: Instant, delay: Duration) -> Option<Command> {
        if !self.is_ready(now) {
            return None;
        }
        let command = self.commands.pop_front()?;
        self.ready_at = Some(now + delay);
        Some(command)
    }

    /// When the queue next needs attention: the end of the current spacing
    /// interval, if commands are waiting for it.
    pub fn next_wake(&self, now: Instant) -> Option<Instant> {
        match self.ready_at {
            Some(at) if at > now && !self.commands.is_empty() => Some(at),
            _ => None,
        }
    }

    /// Remove and return every queued command.
    pub fn clear(&mut self) -> Vec<Command> {
        self.commands.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

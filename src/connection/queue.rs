//! Bounded outbound buffer used while the connection is not usable

use serde_json::Value;
use std::collections::VecDeque;
use tether_shared::Envelope;
use tokio::time::Instant;
use tracing::warn;

/// A message the application wants delivered to the backend
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub msg_type: String,
    pub session_id: Option<String>,
    pub data: Option<Value>,
}

impl OutboundMessage {
    pub fn new(msg_type: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            msg_type: msg_type.into(),
            session_id: None,
            data,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Wrap into a wire envelope stamped with the send time
    pub fn to_envelope(&self) -> Envelope {
        let envelope = Envelope::new(self.msg_type.clone(), self.data.clone());
        match &self.session_id {
            Some(session_id) => envelope.with_session(session_id.clone()),
            None => envelope,
        }
    }
}

impl From<Envelope> for OutboundMessage {
    fn from(envelope: Envelope) -> Self {
        Self {
            msg_type: envelope.msg_type,
            session_id: envelope.session_id,
            data: envelope.data,
        }
    }
}

/// An outbound message waiting for the next connected window
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: OutboundMessage,
    pub enqueued_at: Instant,
}

/// FIFO with drop-oldest eviction
#[derive(Debug)]
pub struct MessageQueue {
    items: VecDeque<QueuedMessage>,
    capacity: usize,
    dropped: u64,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Append a message, evicting the oldest one when full
    ///
    /// Returns the evicted message, if any.
    pub fn enqueue(&mut self, message: OutboundMessage) -> Option<QueuedMessage> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };

        if let Some(old) = &evicted {
            self.dropped += 1;
            warn!(
                msg_type = %old.message.msg_type,
                queued_ms = old.enqueued_at.elapsed().as_millis() as u64,
                dropped = self.dropped,
                "Outbound queue full, dropped oldest message"
            );
        }

        self.items.push_back(QueuedMessage {
            message,
            enqueued_at: Instant::now(),
        });
        evicted
    }

    /// Put messages that were already in flight back ahead of everything queued
    ///
    /// `messages` is oldest first. If that overflows the bound, the oldest
    /// entries are evicted as with `enqueue`.
    pub fn requeue_front(&mut self, messages: Vec<OutboundMessage>) {
        let now = Instant::now();
        for message in messages.into_iter().rev() {
            self.items.push_front(QueuedMessage {
                message,
                enqueued_at: now,
            });
        }

        while self.items.len() > self.capacity {
            if let Some(old) = self.items.pop_front() {
                self.dropped += 1;
                warn!(
                    msg_type = %old.message.msg_type,
                    dropped = self.dropped,
                    "Outbound queue full, dropped oldest message"
                );
            }
        }
    }

    /// Take every queued message in enqueue order
    pub fn drain(&mut self) -> Vec<QueuedMessage> {
        self.items.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages lost to eviction since creation
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}

//! [MODULE C7] Broadcast Channel — fan-out of state-change notifications to
//! an unbounded number of short-lived subscribers.
//!
//! Grounded in the original Python `WebSocketManager.broadcast`'s explicit
//! connection list, translated to `tokio::sync::broadcast::channel` — a
//! lagged subscriber is dropped rather than blocking the sender, which gives
//! the same backpressure contract for free (spec.md §4.7).

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::queue::PromptStatus;

pub const DEFAULT_CAPACITY: usize = 256;

/// Message taxonomy per spec.md §4.7. Each payload carries just enough for
/// a subscriber to decide whether to refetch full state through C6.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastEvent {
    StatusUpdate {
        prompt_id: String,
        status: PromptStatus,
        at: DateTime<Utc>,
    },
    ExecutionStarted {
        prompt_id: String,
        at: DateTime<Utc>,
    },
    ExecutionCompleted {
        prompt_id: String,
        status: PromptStatus,
        at: DateTime<Utc>,
    },
    IdleTick {
        at: DateTime<Utc>,
    },
}

#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<BroadcastEvent>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.tx.subscribe()
    }

    /// Publish to every current subscriber. `send` only errs when there are
    /// no receivers, which is not a failure condition here.
    pub fn publish(&self, event: BroadcastEvent) {
        let _ = self.tx.send(event);
    }
}

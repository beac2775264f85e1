//! Engine-emitted events for external consumers (dashboard statistics and the
//! like). Delivery is fire-and-forget over a broadcast channel; the engine
//! keeps running totals so a late consumer can still report aggregates.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    VoteAccepted {
        poll_id: String,
        option_id: String,
        revision: u64,
    },
    PollClosed {
        poll_id: String,
        revision: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub polls_created: u64,
    pub votes_received: u64,
    pub polls_closed: u64,
}

pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    polls_created: AtomicU64,
    votes_received: AtomicU64,
    polls_closed: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            polls_created: AtomicU64::new(0),
            votes_received: AtomicU64::new(0),
            polls_closed: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn poll_created(&self) {
        self.polls_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn vote_accepted(&self, poll_id: &str, option_id: &str, revision: u64) {
        self.votes_received.fetch_add(1, Ordering::Relaxed);
        self.emit(EngineEvent::VoteAccepted {
            poll_id: poll_id.to_string(),
            option_id: option_id.to_string(),
            revision,
        });
    }

    pub fn poll_closed(&self, poll_id: &str, revision: u64) {
        self.polls_closed.fetch_add(1, Ordering::Relaxed);
        self.emit(EngineEvent::PollClosed {
            poll_id: poll_id.to_string(),
            revision,
        });
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            polls_created: self.polls_created.load(Ordering::Relaxed),
            votes_received: self.votes_received.load(Ordering::Relaxed),
            polls_closed: self.polls_closed.load(Ordering::Relaxed),
        }
    }

    fn emit(&self, event: EngineEvent) {
        // No receivers is fine; the counters above still advance.
        if self.tx.receiver_count() > 0 {
            let _ = self.tx.send(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

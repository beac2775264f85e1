//! Room membership and delta fan-out.
//!
//! A room is the set of live connections subscribed to one poll. Deltas are
//! published from inside the poll's critical section, and each member's
//! outbound queue is FIFO, so every subscriber observes revisions in
//! non-decreasing order. A member whose queue is full stops receiving deltas
//! and is flagged stale instead; its connection task is woken to drop the
//! stale backlog and resynchronize from a fresh snapshot. A slow subscriber
//! therefore never blocks the dispatcher or its room-mates.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::models::PollStatus;

pub type ConnectionId = u64;

/// What the dispatcher fans out to room members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    Delta {
        poll_id: String,
        option_id: String,
        new_count: u64,
        revision: u64,
    },
    Closed {
        poll_id: String,
        revision: u64,
    },
}

impl RoomEvent {
    pub fn poll_id(&self) -> &str {
        match self {
            RoomEvent::Delta { poll_id, .. } | RoomEvent::Closed { poll_id, .. } => poll_id,
        }
    }

    pub fn revision(&self) -> u64 {
        match self {
            RoomEvent::Delta { revision, .. } | RoomEvent::Closed { revision, .. } => *revision,
        }
    }
}

struct Member {
    conn_id: ConnectionId,
    tx: mpsc::Sender<RoomEvent>,
    notify: Arc<Notify>,
    stale: bool,
}

struct Room {
    status: PollStatus,
    members: Vec<Member>,
}

pub struct RoomRegistry {
    rooms: DashMap<String, Room>,
    by_connection: DashMap<ConnectionId, HashSet<String>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            by_connection: DashMap::new(),
        }
    }

    /// Joins a connection to a poll's room, creating the room lazily.
    /// Re-subscribing replaces the previous membership and clears any stale
    /// flag, since the caller is about to receive a fresh snapshot anyway.
    pub fn subscribe(
        &self,
        conn_id: ConnectionId,
        poll_id: &str,
        status: PollStatus,
        tx: mpsc::Sender<RoomEvent>,
        notify: Arc<Notify>,
    ) {
        self.by_connection
            .entry(conn_id)
            .or_default()
            .insert(poll_id.to_string());

        let mut room = self.rooms.entry(poll_id.to_string()).or_insert_with(|| Room {
            status,
            members: Vec::new(),
        });
        room.members.retain(|m| m.conn_id != conn_id);
        room.members.push(Member {
            conn_id,
            tx,
            notify,
            stale: false,
        });
        debug!("connection {} joined room {}", conn_id, poll_id);
    }

    pub fn unsubscribe(&self, conn_id: ConnectionId, poll_id: &str) {
        if let Some(mut polls) = self.by_connection.get_mut(&conn_id) {
            polls.remove(poll_id);
        }
        self.remove_member(conn_id, poll_id);
    }

    /// Drops every subscription the connection holds. Called on disconnect;
    /// never touches poll state.
    pub fn remove_connection(&self, conn_id: ConnectionId) {
        let polls: Vec<String> = match self.by_connection.remove(&conn_id) {
            Some((_, polls)) => polls.into_iter().collect(),
            None => return,
        };
        for poll_id in polls {
            self.remove_member(conn_id, &poll_id);
        }
        debug!("connection {} removed from all rooms", conn_id);
    }

    pub fn members_of(&self, poll_id: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(poll_id)
            .map(|room| room.members.iter().map(|m| m.conn_id).collect())
            .unwrap_or_default()
    }

    /// Fans an event out to every member of the poll's room. Delivery is
    /// best-effort per member: a full queue flags the member stale and wakes
    /// it for resync instead of blocking; a closed queue drops the member.
    pub fn publish(&self, poll_id: &str, event: RoomEvent) {
        let closed = matches!(event, RoomEvent::Closed { .. });
        let mut empty = false;

        if let Some(mut room) = self.rooms.get_mut(poll_id) {
            if closed {
                room.status = PollStatus::Closed;
            }
            room.members.retain_mut(|member| {
                if member.stale {
                    // Held back until its connection resynchronizes.
                    return true;
                }
                match member.tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            "connection {} lagging on poll {}, forcing resync",
                            member.conn_id, poll_id
                        );
                        member.stale = true;
                        member.notify.notify_one();
                        true
                    }
                    Err(TrySendError::Closed(_)) => false,
                }
            });
            empty = room.members.is_empty();
        }

        if closed && empty {
            self.gc(poll_id);
        }
    }

    /// Fatal-path escape hatch: every member of the room is flagged stale and
    /// woken, forcing the whole room onto fresh snapshots.
    pub fn force_resync(&self, poll_id: &str) {
        if let Some(mut room) = self.rooms.get_mut(poll_id) {
            for member in room.members.iter_mut() {
                member.stale = true;
                member.notify.notify_one();
            }
        }
    }

    /// Clears and returns the polls on which this connection was flagged
    /// stale. The caller must follow up with a fresh snapshot for each.
    pub fn take_stale(&self, conn_id: ConnectionId) -> Vec<String> {
        let polls: Vec<String> = self
            .by_connection
            .get(&conn_id)
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default();

        let mut stale = Vec::new();
        for poll_id in polls {
            if let Some(mut room) = self.rooms.get_mut(&poll_id) {
                if let Some(member) = room.members.iter_mut().find(|m| m.conn_id == conn_id) {
                    if member.stale {
                        member.stale = false;
                        stale.push(poll_id);
                    }
                }
            }
        }
        stale
    }

    fn remove_member(&self, conn_id: ConnectionId, poll_id: &str) {
        let mut empty_and_closed = false;
        if let Some(mut room) = self.rooms.get_mut(poll_id) {
            room.members.retain(|m| m.conn_id != conn_id);
            empty_and_closed = room.members.is_empty() && room.status == PollStatus::Closed;
        }
        if empty_and_closed {
            self.gc(poll_id);
        }
    }

    // Rooms for active polls are kept even when empty; the tally store stays
    // authoritative regardless. Closed and empty means nobody can come back
    // for deltas, so the room itself can go.
    fn gc(&self, poll_id: &str) {
        self.rooms
            .remove_if(poll_id, |_, room| {
                room.members.is_empty() && room.status == PollStatus::Closed
            });
    }

    #[cfg(test)]
    fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

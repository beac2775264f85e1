//! The vote processor: validates and applies votes against the tally store
//! and ledger, one poll at a time, and hands the resulting deltas to the
//! room dispatcher from inside the same critical section that produced them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, info};
use tokio::sync::{Mutex, Notify, broadcast, mpsc};

use crate::db::{PollRepository, RepoError};
use crate::error::VoteError;
use crate::events::{EngineEvent, EngineStats, EventBus};
use crate::models::{LedgerEntry, Poll};
use crate::rooms::{ConnectionId, RoomEvent, RoomRegistry};
use crate::store::{PollState, TallyStore};

/// Outcome of an accepted vote: the delta the room saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteReceipt {
    pub poll_id: String,
    pub option_id: String,
    pub new_count: u64,
    pub revision: u64,
}

pub struct Engine {
    store: TallyStore,
    rooms: RoomRegistry,
    events: EventBus,
    repo: Arc<dyn PollRepository>,
}

impl Engine {
    pub fn new(repo: Arc<dyn PollRepository>) -> Self {
        Self {
            store: TallyStore::new(),
            rooms: RoomRegistry::new(),
            events: EventBus::new(),
            repo,
        }
    }

    /// Registers a new poll with the durable store and the live tallies.
    pub async fn create_poll(&self, poll: Poll) -> Result<Poll, VoteError> {
        self.repo.create_poll(&poll).await?;
        let state = self.store.insert(poll, Vec::new());
        let snapshot = state.lock().await.poll.clone();
        self.events.poll_created();
        info!("poll {} created", snapshot.id);
        Ok(snapshot)
    }

    /// Validates and applies one vote. Ledger insertion, tally increment,
    /// revision bump and delta publish happen as one per-poll critical
    /// section; either all take effect or none do.
    pub async fn submit_vote(
        &self,
        poll_id: &str,
        voter_id: &str,
        option_id: &str,
    ) -> Result<VoteReceipt, VoteError> {
        let state = self.ensure_loaded(poll_id).await?;
        let now = Utc::now();

        let (receipt, entry) = {
            let mut st = state.lock().await;
            if !st.poll.is_open_at(now) {
                return Err(VoteError::PollClosed(poll_id.to_string()));
            }
            if !st.poll.has_option(option_id) {
                return Err(VoteError::InvalidOption {
                    poll_id: poll_id.to_string(),
                    option_id: option_id.to_string(),
                });
            }
            if st.has_voted(voter_id) {
                return Err(VoteError::AlreadyVoted(poll_id.to_string()));
            }

            let (new_count, revision) = st.apply_vote(voter_id, option_id, now);
            // Published under the poll lock: subscribers see revisions in the
            // order the store produced them.
            self.rooms.publish(
                poll_id,
                RoomEvent::Delta {
                    poll_id: poll_id.to_string(),
                    option_id: option_id.to_string(),
                    new_count,
                    revision,
                },
            );
            if !st.is_consistent() {
                error!(
                    "tally/ledger divergence on poll {} at revision {}, forcing room resync",
                    poll_id, revision
                );
                self.rooms.force_resync(poll_id);
            }

            let receipt = VoteReceipt {
                poll_id: poll_id.to_string(),
                option_id: option_id.to_string(),
                new_count,
                revision,
            };
            let entry = LedgerEntry {
                poll_id: poll_id.to_string(),
                voter_id: voter_id.to_string(),
                option_id: option_id.to_string(),
                accepted_at: now,
            };
            (receipt, entry)
        };

        // Write-through happens outside the critical section. The vote is
        // already applied and broadcast; a store failure is logged, and the
        // idempotent insert makes the replay safe after a restart.
        if let Err(e) = self.repo.record_vote(&entry).await {
            error!("failed to persist vote on poll {}: {}", poll_id, e);
        }
        self.events
            .vote_accepted(poll_id, option_id, receipt.revision);

        Ok(receipt)
    }

    /// Joins a connection to the poll's room and returns the baseline
    /// snapshot. Both happen under the poll lock, so no delta published after
    /// the snapshot can be missed and none before it can be replayed.
    pub async fn subscribe(
        &self,
        conn_id: ConnectionId,
        poll_id: &str,
        tx: mpsc::Sender<RoomEvent>,
        notify: Arc<Notify>,
    ) -> Result<Poll, VoteError> {
        let state = self.ensure_loaded(poll_id).await?;
        let st = state.lock().await;
        self.rooms
            .subscribe(conn_id, poll_id, st.poll.status, tx, notify);
        Ok(st.poll.clone())
    }

    pub fn unsubscribe(&self, conn_id: ConnectionId, poll_id: &str) {
        self.rooms.unsubscribe(conn_id, poll_id);
    }

    pub fn drop_connection(&self, conn_id: ConnectionId) {
        self.rooms.remove_connection(conn_id);
    }

    /// One-way transition to closed, from an explicit request or the end-date
    /// sweep. Closing an already-closed poll is a no-op returning the current
    /// revision.
    pub async fn close_poll(&self, poll_id: &str) -> Result<u64, VoteError> {
        let state = self.ensure_loaded(poll_id).await?;
        let revision = {
            let mut st = state.lock().await;
            match st.set_closed() {
                Some(revision) => {
                    self.rooms.publish(
                        poll_id,
                        RoomEvent::Closed {
                            poll_id: poll_id.to_string(),
                            revision,
                        },
                    );
                    revision
                }
                None => return Ok(st.poll.revision),
            }
        };

        if let Err(e) = self.repo.mark_closed(poll_id).await {
            error!("failed to persist closure of poll {}: {}", poll_id, e);
        }
        self.events.poll_closed(poll_id, revision);
        info!("poll {} closed at revision {}", poll_id, revision);
        Ok(revision)
    }

    /// Full current state of a poll, for resynchronization.
    pub async fn snapshot(&self, poll_id: &str) -> Result<Poll, VoteError> {
        let state = self.ensure_loaded(poll_id).await?;
        let st = state.lock().await;
        Ok(st.poll.clone())
    }

    /// Active polls whose end date has elapsed, per the durable store.
    pub async fn expired_poll_ids(&self, now: DateTime<Utc>) -> Result<Vec<String>, RepoError> {
        Ok(self
            .repo
            .list_active()
            .await?
            .into_iter()
            .filter(|poll| poll.ends_at.map(|end| end <= now).unwrap_or(false))
            .map(|poll| poll.id)
            .collect())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> EngineStats {
        self.events.stats()
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    /// Read-through load: unseen polls are fetched from the repository along
    /// with their accepted votes, and the tallies rebuilt from the ledger.
    async fn ensure_loaded(&self, poll_id: &str) -> Result<Arc<Mutex<PollState>>, VoteError> {
        if let Some(state) = self.store.get(poll_id) {
            return Ok(state);
        }
        let poll = self
            .repo
            .get_poll(poll_id)
            .await?
            .ok_or_else(|| VoteError::UnknownPoll(poll_id.to_string()))?;
        let entries = self.repo.poll_votes(poll_id).await?;
        Ok(self.store.insert(poll, entries))
    }
}

//! In-memory authoritative state for live polls: per-option tallies, the vote
//! ledger and the revision counter, one lock per poll.
//!
//! All mutation of a poll goes through its `PollState` lock. Two polls never
//! contend with each other; two writers on the same poll serialize. Snapshot
//! reads take the same lock, so they observe either the pre- or post-mutation
//! state, never a torn one.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::models::{LedgerEntry, Poll, PollStatus};

/// One poll's live state: the tally, the ledger that feeds it, and the
/// revision counter. Ledger insertion and tally increment happen in the same
/// critical section so the two can never diverge.
pub struct PollState {
    pub poll: Poll,
    voters: HashSet<String>,
    ledger: Vec<LedgerEntry>,
}

impl PollState {
    fn new(poll: Poll, entries: Vec<LedgerEntry>) -> Self {
        let mut state = Self {
            poll,
            voters: HashSet::new(),
            ledger: Vec::new(),
        };
        for entry in entries {
            // Rebuild tallies from the durable ledger; duplicates are skipped
            // the same way a live duplicate vote would be.
            if state.voters.contains(&entry.voter_id) {
                continue;
            }
            if let Some(option) = state
                .poll
                .options
                .iter_mut()
                .find(|o| o.id == entry.option_id)
            {
                option.vote_count += 1;
                state.poll.revision += 1;
                state.voters.insert(entry.voter_id.clone());
                state.ledger.push(entry);
            }
        }
        if state.poll.status == PollStatus::Closed {
            // The closing transition consumed one revision as well.
            state.poll.revision += 1;
        }
        state
    }

    pub fn has_voted(&self, voter_id: &str) -> bool {
        self.voters.contains(voter_id)
    }

    /// Applies one accepted vote: ledger entry, tally increment and revision
    /// bump as a single unit. Caller has already validated the vote.
    pub fn apply_vote(&mut self, voter_id: &str, option_id: &str, now: DateTime<Utc>) -> (u64, u64) {
        let option = self
            .poll
            .options
            .iter_mut()
            .find(|o| o.id == option_id)
            .expect("option validated before apply");
        option.vote_count += 1;
        let new_count = option.vote_count;

        self.voters.insert(voter_id.to_string());
        self.ledger.push(LedgerEntry {
            poll_id: self.poll.id.clone(),
            voter_id: voter_id.to_string(),
            option_id: option_id.to_string(),
            accepted_at: now,
        });

        self.poll.revision += 1;
        (new_count, self.poll.revision)
    }

    /// One-way transition to `Closed`. Returns the new revision, or `None`
    /// if the poll was already closed.
    pub fn set_closed(&mut self) -> Option<u64> {
        if self.poll.status == PollStatus::Closed {
            return None;
        }
        self.poll.status = PollStatus::Closed;
        self.poll.revision += 1;
        Some(self.poll.revision)
    }

    pub fn ledger_len(&self) -> usize {
        self.ledger.len()
    }

    /// Tally/ledger agreement: the sum of option counts must equal the number
    /// of accepted ledger entries.
    pub fn is_consistent(&self) -> bool {
        self.poll.total_votes() == self.ledger.len() as u64
    }
}

pub struct TallyStore {
    polls: DashMap<String, Arc<Mutex<PollState>>>,
}

impl TallyStore {
    pub fn new() -> Self {
        Self {
            polls: DashMap::new(),
        }
    }

    /// Registers a poll (with its previously accepted votes, if restoring
    /// from the repository). Returns the existing state if the poll was
    /// already present, so concurrent loads converge on one instance.
    pub fn insert(&self, poll: Poll, entries: Vec<LedgerEntry>) -> Arc<Mutex<PollState>> {
        self.polls
            .entry(poll.id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(PollState::new(poll, entries))))
            .clone()
    }

    pub fn get(&self, poll_id: &str) -> Option<Arc<Mutex<PollState>>> {
        self.polls.get(poll_id).map(|s| s.clone())
    }

    pub fn contains(&self, poll_id: &str) -> bool {
        self.polls.contains_key(poll_id)
    }

    pub async fn snapshot(&self, poll_id: &str) -> Option<Poll> {
        let state = self.get(poll_id)?;
        let state = state.lock().await;
        Some(state.poll.clone())
    }

    pub fn poll_ids(&self) -> Vec<String> {
        self.polls.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for TallyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_poll() -> Poll {
        Poll::new(
            "creator".into(),
            "q".into(),
            vec!["a".into(), "b".into()],
            None,
        )
    }

    #[tokio::test]
    async fn apply_vote_bumps_count_ledger_and_revision_together() {
        let store = TallyStore::new();
        let poll = sample_poll();
        let option_a = poll.options[0].id.clone();
        let state = store.insert(poll, Vec::new());

        let mut st = state.lock().await;
        let (count, rev) = st.apply_vote("u1", &option_a, Utc::now());
        assert_eq!((count, rev), (1, 1));
        assert!(st.has_voted("u1"));
        assert_eq!(st.ledger_len(), 1);
        assert!(st.is_consistent());
    }

    #[tokio::test]
    async fn revisions_increase_by_one_per_change() {
        let store = TallyStore::new();
        let poll = sample_poll();
        let option_a = poll.options[0].id.clone();
        let option_b = poll.options[1].id.clone();
        let state = store.insert(poll, Vec::new());

        let mut st = state.lock().await;
        let (_, r1) = st.apply_vote("u1", &option_a, Utc::now());
        let (_, r2) = st.apply_vote("u2", &option_b, Utc::now());
        let r3 = st.set_closed().unwrap();
        assert_eq!((r1, r2, r3), (1, 2, 3));
        // Closing is terminal; a second close does not bump the revision.
        assert_eq!(st.set_closed(), None);
        assert_eq!(st.poll.revision, 3);
    }

    #[tokio::test]
    async fn rebuild_from_ledger_restores_counts_and_revision() {
        let store = TallyStore::new();
        let poll = sample_poll();
        let poll_id = poll.id.clone();
        let option_a = poll.options[0].id.clone();
        let entries = vec![
            LedgerEntry {
                poll_id: poll_id.clone(),
                voter_id: "u1".into(),
                option_id: option_a.clone(),
                accepted_at: Utc::now(),
            },
            // Duplicate voter must not double-count on rebuild.
            LedgerEntry {
                poll_id: poll_id.clone(),
                voter_id: "u1".into(),
                option_id: option_a.clone(),
                accepted_at: Utc::now(),
            },
            LedgerEntry {
                poll_id: poll_id.clone(),
                voter_id: "u2".into(),
                option_id: option_a.clone(),
                accepted_at: Utc::now(),
            },
        ];
        store.insert(poll, entries);

        let snapshot = store.snapshot(&poll_id).await.unwrap();
        assert_eq!(snapshot.options[0].vote_count, 2);
        assert_eq!(snapshot.revision, 2);
    }

    #[tokio::test]
    async fn insert_is_idempotent_per_poll() {
        let store = TallyStore::new();
        let poll = sample_poll();
        let poll_id = poll.id.clone();
        let option_a = poll.options[0].id.clone();

        let first = store.insert(poll.clone(), Vec::new());
        first.lock().await.apply_vote("u1", &option_a, Utc::now());

        // A racing second load must not wipe the applied vote.
        store.insert(poll, Vec::new());
        assert_eq!(
            store.snapshot(&poll_id).await.unwrap().options[0].vote_count,
            1
        );
    }
}

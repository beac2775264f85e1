//! In-memory repository, used by the test suite and by embedders that want
//! the engine without a database behind it.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{PollRepository, RepoError};
use crate::models::{LedgerEntry, Poll, PollStatus};

#[derive(Default)]
pub struct MemoryRepository {
    polls: DashMap<String, Poll>,
    votes: DashMap<String, Vec<LedgerEntry>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PollRepository for MemoryRepository {
    async fn create_poll(&self, poll: &Poll) -> Result<(), RepoError> {
        self.polls.insert(poll.id.clone(), poll.clone());
        Ok(())
    }

    async fn get_poll(&self, poll_id: &str) -> Result<Option<Poll>, RepoError> {
        Ok(self.polls.get(poll_id).map(|p| p.clone()))
    }

    async fn list_active(&self) -> Result<Vec<Poll>, RepoError> {
        Ok(self
            .polls
            .iter()
            .filter(|p| p.status == PollStatus::Active)
            .map(|p| p.clone())
            .collect())
    }

    async fn record_vote(&self, entry: &LedgerEntry) -> Result<(), RepoError> {
        let mut entries = self.votes.entry(entry.poll_id.clone()).or_default();
        if entries.iter().any(|e| e.voter_id == entry.voter_id) {
            return Ok(());
        }
        entries.push(entry.clone());
        Ok(())
    }

    async fn poll_votes(&self, poll_id: &str) -> Result<Vec<LedgerEntry>, RepoError> {
        Ok(self
            .votes
            .get(poll_id)
            .map(|e| e.clone())
            .unwrap_or_default())
    }

    async fn mark_closed(&self, poll_id: &str) -> Result<(), RepoError> {
        if let Some(mut poll) = self.polls.get_mut(poll_id) {
            poll.status = PollStatus::Closed;
        }
        Ok(())
    }
}

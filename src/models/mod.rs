use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollStatus {
    Active,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Poll {
    pub id: String,
    pub creator_id: String,
    pub question: String,
    pub options: Vec<PollOption>,
    pub status: PollStatus,
    pub created_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    /// Bumped by exactly one on every accepted vote or status change.
    pub revision: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollOption {
    pub id: String,
    pub text: String,
    pub vote_count: u64,
}

/// One accepted vote. At most one entry may exist per (poll_id, voter_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub poll_id: String,
    pub voter_id: String,
    pub option_id: String,
    pub accepted_at: DateTime<Utc>,
}

impl Poll {
    pub fn new(
        creator_id: String,
        question: String,
        options: Vec<String>,
        duration_minutes: Option<i64>,
    ) -> Self {
        let now = Utc::now();
        let ends_at = duration_minutes.map(|mins| now + chrono::Duration::minutes(mins));

        let options = options
            .into_iter()
            .map(|text| PollOption {
                id: Uuid::new_v4().to_string(),
                text,
                vote_count: 0,
            })
            .collect();

        Self {
            id: Uuid::new_v4().to_string(),
            creator_id,
            question,
            options,
            status: PollStatus::Active,
            created_at: now,
            ends_at,
            revision: 0,
        }
    }

    /// Active and, if an end date is set, not yet past it.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.status == PollStatus::Active && self.ends_at.map(|end| now < end).unwrap_or(true)
    }

    pub fn has_option(&self, option_id: &str) -> bool {
        self.options.iter().any(|option| option.id == option_id)
    }

    pub fn total_votes(&self) -> u64 {
        self.options.iter().map(|option| option.vote_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_poll_starts_active_at_revision_zero() {
        let poll = Poll::new(
            "creator".into(),
            "Best crab?".into(),
            vec!["Ferris".into(), "Corro".into()],
            None,
        );
        assert_eq!(poll.status, PollStatus::Active);
        assert_eq!(poll.revision, 0);
        assert_eq!(poll.options.len(), 2);
        assert!(poll.options.iter().all(|o| o.vote_count == 0));
        assert!(poll.is_open_at(Utc::now()));
    }

    #[test]
    fn poll_with_elapsed_end_date_is_not_open() {
        let mut poll = Poll::new("creator".into(), "q".into(), vec!["a".into()], Some(5));
        poll.ends_at = Some(Utc::now() - chrono::Duration::minutes(1));
        assert_eq!(poll.status, PollStatus::Active);
        assert!(!poll.is_open_at(Utc::now()));
    }
}

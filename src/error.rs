use thiserror::Error;

/// Terminal, user-visible vote rejections. The engine never retries these.
#[derive(Debug, Error)]
pub enum VoteError {
    #[error("unknown poll: {0}")]
    UnknownPoll(String),

    #[error("poll {0} is closed")]
    PollClosed(String),

    #[error("option {option_id} does not belong to poll {poll_id}")]
    InvalidOption { poll_id: String, option_id: String },

    #[error("voter has already voted in poll {0}")]
    AlreadyVoted(String),

    #[error("internal error: {0}")]
    Internal(#[from] Box<dyn std::error::Error + Send + Sync>),
}

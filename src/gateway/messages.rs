//! JSON wire messages exchanged with clients.

use serde::{Deserialize, Serialize};

use crate::error::VoteError;
use crate::models::Poll;
use crate::rooms::RoomEvent;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { poll_id: String },
    Unsubscribe { poll_id: String },
    Vote { poll_id: String, option_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Snapshot {
        poll: Poll,
        revision: u64,
    },
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
    Error {
        code: ErrorCode,
        #[serde(skip_serializing_if = "Option::is_none")]
        poll_id: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnknownPoll,
    PollClosed,
    InvalidOption,
    AlreadyVoted,
}

impl ServerMessage {
    pub fn snapshot(poll: Poll) -> Self {
        let revision = poll.revision;
        ServerMessage::Snapshot { poll, revision }
    }
}

impl From<RoomEvent> for ServerMessage {
    fn from(event: RoomEvent) -> Self {
        match event {
            RoomEvent::Delta {
                poll_id,
                option_id,
                new_count,
                revision,
            } => ServerMessage::Delta {
                poll_id,
                option_id,
                new_count,
                revision,
            },
            RoomEvent::Closed { poll_id, revision } => ServerMessage::Closed { poll_id, revision },
        }
    }
}

impl ErrorCode {
    /// Wire code for a rejection. Internal failures have no client-facing
    /// code and map to `None`.
    pub fn from_vote_error(err: &VoteError) -> Option<Self> {
        match err {
            VoteError::UnknownPoll(_) => Some(ErrorCode::UnknownPoll),
            VoteError::PollClosed(_) => Some(ErrorCode::PollClosed),
            VoteError::InvalidOption { .. } => Some(ErrorCode::InvalidOption),
            VoteError::AlreadyVoted(_) => Some(ErrorCode::AlreadyVoted),
            VoteError::Internal(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_parse_from_tagged_json() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","poll_id":"p1"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { poll_id } if poll_id == "p1"));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"vote","poll_id":"p1","option_id":"o1"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Vote { .. }));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"shout"}"#).is_err());
    }

    #[test]
    fn delta_serializes_with_type_tag() {
        let json = serde_json::to_string(&ServerMessage::Delta {
            poll_id: "p1".into(),
            option_id: "o1".into(),
            new_count: 3,
            revision: 7,
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"type":"delta","poll_id":"p1","option_id":"o1","new_count":3,"revision":7}"#
        );
    }

    #[test]
    fn error_omits_absent_poll_id() {
        let json = serde_json::to_string(&ServerMessage::Error {
            code: ErrorCode::AlreadyVoted,
            poll_id: None,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"error","code":"already_voted"}"#);
    }

    #[test]
    fn every_rejection_has_a_wire_code() {
        assert_eq!(
            ErrorCode::from_vote_error(&VoteError::PollClosed("p".into())),
            Some(ErrorCode::PollClosed)
        );
        assert_eq!(
            ErrorCode::from_vote_error(&VoteError::Internal("boom".into())),
            None
        );
    }
}

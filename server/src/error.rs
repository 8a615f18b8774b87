//! Rejections returned by the session orchestrator.
//!
//! None of these are fatal. The session is left exactly as it was and the
//! network layer reports the message to the offending connection only.

use shared::kinds::UnknownKind;
use shared::{MiniGameKind, ParticipantId, SessionState};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("unknown mini-game '{0}'")]
    InvalidVoteTarget(String),

    #[error("voting is not open")]
    NotVoting,

    #[error("no round is in progress")]
    NoActiveRound,

    #[error("unknown participant '{0}'")]
    UnknownParticipant(ParticipantId),

    #[error("the session has ended, restart to play again")]
    AlreadyEnded,

    #[error("cannot {event} while the session is {from}")]
    InvalidTransition {
        from: SessionState,
        event: &'static str,
    },

    #[error("a result from '{0}' was already recorded this round")]
    DuplicateResult(ParticipantId),

    #[error("result is for {got} but the round is playing {expected}")]
    ResultModeMismatch {
        expected: MiniGameKind,
        got: MiniGameKind,
    },
}

impl From<UnknownKind> for SessionError {
    fn from(err: UnknownKind) -> Self {
        SessionError::InvalidVoteTarget(err.0)
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

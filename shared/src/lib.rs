//! Wire protocol and pure game logic shared by the session server and its clients.
//!
//! Everything in this crate is deterministic given its inputs: pattern
//! generation takes an explicit random source, and timing judgment is a
//! function of absolute timestamps only.

pub mod codec;
pub mod judge;
pub mod kinds;
pub mod pattern;
pub mod round;

pub use judge::{CueTimer, JudgmentTier};
pub use kinds::{Difficulty, MiniGameKind};
pub use pattern::{Cue, PatternSpec};
pub use round::{JudgmentCounts, RoundDriver, RoundOutcome};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable identity chosen by the client
pub type ParticipantId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Voting,
    RoundActive,
    Scoring,
    Ended,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Voting => "voting",
            SessionState::RoundActive => "round_active",
            SessionState::Scoring => "scoring",
            SessionState::Ended => "ended",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    // Client -> server
    Identify {
        participant_id: ParticipantId,
        name: String,
    },
    Vote {
        game_mode: String,
    },
    GameResult {
        game_mode: String,
        score: u32,
        time_ms: u64,
        success: bool,
        judgments: JudgmentCounts,
    },
    StartGame,
    RestartGame,
    UserLeave {
        participant_id: ParticipantId,
    },
    Heartbeat {
        timestamp: u64,
    },

    // Server -> client
    Identified {
        participant_id: ParticipantId,
        state: SessionState,
    },
    VotingStarted {
        round: u32,
        duration_seconds: u32,
    },
    VoteUpdate {
        votes: BTreeMap<MiniGameKind, u32>,
    },
    VotingEnded {
        round: u32,
        selected_mode: MiniGameKind,
        votes: BTreeMap<MiniGameKind, u32>,
    },
    RoundStarted {
        round: u32,
        mode: MiniGameKind,
    },
    RoundInit {
        round: u32,
        mode: MiniGameKind,
        pattern: PatternSpec,
    },
    RoundEnded {
        round: u32,
        results: Vec<RoundResultEntry>,
    },
    GameEnded {
        ranking: Vec<Standing>,
        round_results: BTreeMap<u32, Vec<RoundResultEntry>>,
    },
    GameReset,
    UserDisconnected {
        participant_id: ParticipantId,
    },
    ParticipantList {
        participants: Vec<ParticipantInfo>,
    },
    Status {
        message: String,
    },
}

/// One line of a closed round, in rank order
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RoundResultEntry {
    pub participant_id: ParticipantId,
    pub name: String,
    pub score: u32,
    pub points_awarded: u32,
    pub total_score: u32,
    pub submitted: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Standing {
    pub participant_id: ParticipantId,
    pub name: String,
    pub score: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub participant_id: ParticipantId,
    pub name: String,
    pub score: u32,
    pub live: bool,
}

/// Milliseconds since the unix epoch, for heartbeat payloads
pub fn timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

//! Mini-game kinds and the rules table that drives pattern generation and scoring.
//!
//! Every per-kind difference lives in one [`MiniGameRules`] entry. Adding a
//! kind means adding a variant and a table row; nothing else branches on it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Rounds above this index are played on [`Difficulty::Hard`].
pub const HARD_AFTER_ROUND: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MiniGameKind {
    /// Type a key sequence in order before the clock runs out.
    AjaePattern,
    /// Press the shown key when the shrinking ring meets the target.
    Gyeokdol,
    /// Hit the target zone on one or more lanes.
    StarForce,
}

impl MiniGameKind {
    pub const ALL: [MiniGameKind; 3] = [
        MiniGameKind::AjaePattern,
        MiniGameKind::Gyeokdol,
        MiniGameKind::StarForce,
    ];

    /// Wire name used in `vote` and `game_result` payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            MiniGameKind::AjaePattern => "ajaePattern",
            MiniGameKind::Gyeokdol => "gyeokdol",
            MiniGameKind::StarForce => "starforce",
        }
    }

    pub fn rules(&self) -> &'static MiniGameRules {
        match self {
            MiniGameKind::AjaePattern => &RULES[0],
            MiniGameKind::Gyeokdol => &RULES[1],
            MiniGameKind::StarForce => &RULES[2],
        }
    }
}

impl fmt::Display for MiniGameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown mini-game '{0}'")]
pub struct UnknownKind(pub String);

impl FromStr for MiniGameKind {
    type Err = UnknownKind;

    /// Wire names are matched case-insensitively; older clients report
    /// `starForce` in results while voting for `starforce`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MiniGameKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Difficulty {
    Normal,
    Hard,
}

impl Difficulty {
    pub fn for_round(round: u32) -> Self {
        if round > HARD_AFTER_ROUND {
            Difficulty::Hard
        } else {
            Difficulty::Normal
        }
    }
}

/// How a kind turns player input into judgments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JudgeMode {
    /// Correct key while the cue is armed resolves it as Perfect; only the
    /// round time limit can miss it.
    KeyOrder,
    /// Distance of the shrinking ring from its target decides the tier.
    Timing,
}

/// How the hard time limit of a round is derived
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeLimit {
    /// `max(floor_ms, start_ms - per_round_ms * round)`
    Countdown {
        start_ms: u32,
        per_round_ms: u32,
        floor_ms: u32,
    },
    /// Longest lane schedule plus a fixed slack
    FromCues { slack_ms: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DifficultyRules {
    pub keys: &'static [&'static str],
    pub base_cue_count: usize,
    /// Cue window before the per-round speed-up is applied
    pub base_duration_ms: u32,
    pub lanes: u8,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringRules {
    pub perfect_points: u32,
    pub good_points: u32,
    pub miss_points: u32,
    /// Multiplier applied to the 0-100 accuracy percentage
    pub accuracy_weight: f64,
    /// Points per second left on the clock
    pub time_bonus_per_sec: f64,
    /// Time bonus only counts for a successful run
    pub bonus_requires_success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MiniGameRules {
    pub kind: MiniGameKind,
    pub judge: JudgeMode,
    pub normal: DifficultyRules,
    pub hard: DifficultyRules,
    pub time_limit: TimeLimit,
    pub scoring: ScoringRules,
}

impl MiniGameRules {
    pub fn for_difficulty(&self, difficulty: Difficulty) -> &DifficultyRules {
        match difficulty {
            Difficulty::Normal => &self.normal,
            Difficulty::Hard => &self.hard,
        }
    }
}

const HOME_ROW: [&str; 8] = ["a", "s", "d", "f", "j", "k", "l", ";"];
const QWER: [&str; 4] = ["q", "w", "e", "r"];
const QWER_ASDF: [&str; 8] = ["q", "w", "e", "r", "a", "s", "d", "f"];

static RULES: [MiniGameRules; 3] = [
    MiniGameRules {
        kind: MiniGameKind::AjaePattern,
        judge: JudgeMode::KeyOrder,
        normal: DifficultyRules {
            keys: &["a", "s", "d", "f"],
            base_cue_count: 4,
            base_duration_ms: 0,
            lanes: 1,
        },
        hard: DifficultyRules {
            keys: &HOME_ROW,
            base_cue_count: 4,
            base_duration_ms: 0,
            lanes: 1,
        },
        time_limit: TimeLimit::Countdown {
            start_ms: 10_000,
            per_round_ms: 1_500,
            floor_ms: 2_000,
        },
        scoring: ScoringRules {
            perfect_points: 0,
            good_points: 0,
            miss_points: 0,
            accuracy_weight: 1.0,
            time_bonus_per_sec: 10.0,
            bonus_requires_success: true,
        },
    },
    MiniGameRules {
        kind: MiniGameKind::Gyeokdol,
        judge: JudgeMode::Timing,
        normal: DifficultyRules {
            keys: &QWER,
            base_cue_count: 8,
            base_duration_ms: 1_500,
            lanes: 1,
        },
        hard: DifficultyRules {
            keys: &QWER_ASDF,
            base_cue_count: 12,
            base_duration_ms: 1_400,
            lanes: 1,
        },
        time_limit: TimeLimit::FromCues { slack_ms: 2_000 },
        scoring: ScoringRules {
            perfect_points: 100,
            good_points: 50,
            miss_points: 0,
            accuracy_weight: 2.0,
            time_bonus_per_sec: 5.0,
            bonus_requires_success: false,
        },
    },
    MiniGameRules {
        kind: MiniGameKind::StarForce,
        judge: JudgeMode::Timing,
        normal: DifficultyRules {
            keys: &["space"],
            base_cue_count: 8,
            base_duration_ms: 2_000,
            lanes: 1,
        },
        hard: DifficultyRules {
            keys: &QWER,
            base_cue_count: 8,
            base_duration_ms: 1_800,
            lanes: 4,
        },
        time_limit: TimeLimit::FromCues { slack_ms: 2_000 },
        scoring: ScoringRules {
            perfect_points: 100,
            good_points: 50,
            miss_points: 10,
            accuracy_weight: 2.0,
            time_bonus_per_sec: 0.0,
            bonus_requires_success: false,
        },
    },
];

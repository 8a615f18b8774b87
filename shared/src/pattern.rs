//! Cue pattern generation for a round.
//!
//! Output is deterministic for a given random source, so the server can seed
//! one pattern per round and every participant plays the same cues.

use crate::kinds::{Difficulty, JudgeMode, MiniGameKind, TimeLimit};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Shortest cue window a human can still react to
pub const MIN_CUE_DURATION_MS: u32 = 600;
pub const SPEED_UP_PER_ROUND: f64 = 0.05;
pub const MAX_SPEED_UP_STEPS: u32 = 7;
/// Gap before a cue that repeats the previous key in its lane
pub const SAME_KEY_GAP_MS: u32 = 150;
/// Gap before a cue with a different key
pub const KEY_CHANGE_GAP_MS: u32 = 300;

/// One timed input prompt. Immutable once generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cue {
    pub key: String,
    pub duration_ms: u32,
    /// Pause between the previous cue in the lane resolving and this one arming
    pub gap_ms: u32,
    pub lane: Option<u8>,
}

impl Cue {
    pub fn lane_index(&self) -> usize {
        self.lane.map(usize::from).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSpec {
    pub kind: MiniGameKind,
    pub difficulty: Difficulty,
    pub round: u32,
    pub lanes: u8,
    /// Hard limit for the whole round, measured from round start
    pub time_limit_ms: u32,
    pub cues: Vec<Cue>,
}

impl PatternSpec {
    pub fn len(&self) -> usize {
        self.cues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cues.is_empty()
    }

    pub fn lane_cues(&self, lane: usize) -> impl Iterator<Item = &Cue> {
        self.cues.iter().filter(move |cue| cue.lane_index() == lane)
    }

    /// Time a flawless run needs on the busiest lane
    pub fn schedule_ms(&self) -> u32 {
        (0..usize::from(self.lanes.max(1)))
            .map(|lane| {
                self.lane_cues(lane).fold(0u32, |total, cue| {
                    total
                        .saturating_add(cue.gap_ms)
                        .saturating_add(cue.duration_ms)
                })
            })
            .max()
            .unwrap_or(0)
    }
}

/// Per-cue window after the speed-up curve for `round` (1-based).
///
/// Non-increasing in `round` and never below [`MIN_CUE_DURATION_MS`].
pub fn cue_duration_ms(base_ms: u32, round: u32) -> u32 {
    let steps = round.saturating_sub(1).min(MAX_SPEED_UP_STEPS);
    let factor = 1.0 - SPEED_UP_PER_ROUND * f64::from(steps);
    let scaled = (f64::from(base_ms) * factor).floor() as u32;
    scaled.max(MIN_CUE_DURATION_MS)
}

fn gap_before(previous: Option<&str>, key: &str) -> u32 {
    match previous {
        None => 0,
        Some(prev) if prev == key => SAME_KEY_GAP_MS,
        Some(_) => KEY_CHANGE_GAP_MS,
    }
}

/// Builds the cue list for one round of `kind`.
pub fn generate<R: Rng + ?Sized>(
    kind: MiniGameKind,
    difficulty: Difficulty,
    round: u32,
    rng: &mut R,
) -> PatternSpec {
    let rules = kind.rules();
    let tier = rules.for_difficulty(difficulty);
    let lanes = tier.lanes.max(1);
    let count = tier.base_cue_count + round as usize;

    let countdown = match rules.time_limit {
        TimeLimit::Countdown {
            start_ms,
            per_round_ms,
            floor_ms,
        } => Some(start_ms.saturating_sub(per_round_ms.saturating_mul(round)).max(floor_ms)),
        TimeLimit::FromCues { .. } => None,
    };

    let mut last_key: Vec<Option<&str>> = vec![None; usize::from(lanes)];
    let mut cues = Vec::with_capacity(count);

    for _ in 0..count {
        let (lane, key) = if lanes > 1 {
            let lane = rng.gen_range(0..usize::from(lanes));
            (Some(lane as u8), tier.keys[lane])
        } else {
            (None, tier.keys[rng.gen_range(0..tier.keys.len())])
        };

        let slot = lane.map(usize::from).unwrap_or(0);
        let (duration_ms, gap_ms) = match rules.judge {
            // Sequence games only race the round clock
            JudgeMode::KeyOrder => (countdown.unwrap_or(u32::MAX), 0),
            JudgeMode::Timing => (
                cue_duration_ms(tier.base_duration_ms, round),
                gap_before(last_key[slot], key),
            ),
        };
        last_key[slot] = Some(key);

        cues.push(Cue {
            key: key.to_string(),
            duration_ms,
            gap_ms,
            lane,
        });
    }

    let mut spec = PatternSpec {
        kind,
        difficulty,
        round,
        lanes,
        time_limit_ms: 0,
        cues,
    };
    spec.time_limit_ms = match rules.time_limit {
        TimeLimit::Countdown { .. } => countdown.unwrap_or(0),
        TimeLimit::FromCues { slack_ms } => spec.schedule_ms() + slack_ms,
    };
    spec
}

/// Pattern for `round` at the difficulty that round is played on.
pub fn for_round<R: Rng + ?Sized>(kind: MiniGameKind, round: u32, rng: &mut R) -> PatternSpec {
    generate(kind, Difficulty::for_round(round), round, rng)
}

//! Automated input for a round.
//!
//! The player watches the cues armed by a [`RoundDriver`] and schedules one
//! press per cue around its target, spread by a configurable jitter. Presses
//! are only delivered on frame boundaries, the same way a real input loop
//! would observe them.

use rand::rngs::StdRng;
use rand::Rng;
use shared::judge::JudgmentTier;
use shared::kinds::JudgeMode;
use shared::{PatternSpec, RoundDriver, RoundOutcome};
use std::collections::HashMap;

/// Delay before reacting to a key-order prompt
pub const REACTION_MS: f64 = 180.0;
/// How far ahead of a ring's target the player aims, so the press lands
/// inside the window on the next frame
pub const AIM_LEAD_MS: f64 = 40.0;

#[derive(Debug, Clone, Copy, PartialEq)]
struct PlannedPress {
    armed_at_ms: f64,
    press_at_ms: f64,
}

pub struct AutoPlayer {
    rng: StdRng,
    jitter_ms: f64,
    /// Next press per lane, keyed to the cue it was planned for
    planned: HashMap<usize, PlannedPress>,
}

impl AutoPlayer {
    pub fn new(jitter_ms: u64, rng: StdRng) -> Self {
        Self {
            rng,
            jitter_ms: jitter_ms as f64,
            planned: HashMap::new(),
        }
    }

    fn offset(&mut self) -> f64 {
        if self.jitter_ms <= 0.0 {
            return 0.0;
        }
        self.rng.gen_range(-self.jitter_ms..=self.jitter_ms)
    }

    /// Advances `driver` to `now_ms` and presses every key that is due.
    ///
    /// Returns the judgments produced by this frame's presses.
    pub fn step(&mut self, driver: &mut RoundDriver, now_ms: f64) -> Vec<(String, JudgmentTier)> {
        driver.advance(now_ms);
        let judge = driver.spec().kind.rules().judge;

        let armed: Vec<(usize, String, f64, f64)> = driver
            .armed()
            .map(|(lane, cue, timer)| (lane, cue.key.clone(), timer.armed_at_ms, timer.deadline()))
            .collect();

        let mut due = Vec::new();
        for (lane, key, armed_at_ms, deadline) in armed {
            let stale = self
                .planned
                .get(&lane)
                .map_or(true, |plan| plan.armed_at_ms != armed_at_ms);
            if stale {
                let press_at_ms = match judge {
                    JudgeMode::KeyOrder => armed_at_ms + REACTION_MS + self.offset().abs(),
                    JudgeMode::Timing => deadline - AIM_LEAD_MS + self.offset(),
                };
                self.planned.insert(
                    lane,
                    PlannedPress {
                        armed_at_ms,
                        press_at_ms,
                    },
                );
            }
            if self
                .planned
                .get(&lane)
                .is_some_and(|plan| plan.press_at_ms <= now_ms)
            {
                due.push(key);
            }
        }

        due.into_iter()
            .filter_map(|key| driver.press(&key, now_ms).map(|tier| (key, tier)))
            .collect()
    }
}

/// Plays a whole round without a network, sampling every `frame_ms`.
pub fn play_offline(
    participant_id: &str,
    pattern: PatternSpec,
    player: &mut AutoPlayer,
    frame_ms: f64,
) -> RoundOutcome {
    let mut driver = RoundDriver::new(participant_id, pattern);
    let mut now_ms = 0.0;

    // Reaching the time limit always finishes the round
    loop {
        player.step(&mut driver, now_ms);
        if let Some(outcome) = driver.outcome() {
            return outcome.clone();
        }
        now_ms += frame_ms.max(1.0);
    }
}

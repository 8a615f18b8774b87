//! Timing judgment shared by every mini-game.
//!
//! A cue is armed at an absolute timestamp and shrinks from [`START_SCALE`]
//! to [`TARGET_SCALE`] over its duration. Everything here is computed from
//! `now - armed_at`; callers sample at whatever rate their frame loop runs
//! and get the same judgment for the same press time.

use serde::{Deserialize, Serialize};

pub const START_SCALE: f64 = 3.0;
pub const TARGET_SCALE: f64 = 1.0;
pub const PERFECT_WINDOW: f64 = 0.2;
pub const GOOD_WINDOW: f64 = 0.5;

/// Discrete quality of a single action against a cue, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JudgmentTier {
    Perfect,
    Good,
    Miss,
}

/// Normalized elapsed fraction of a cue, clamped to `[0, 1]`.
///
/// A non-positive duration is treated as already elapsed.
pub fn progress(duration_ms: f64, elapsed_ms: f64) -> f64 {
    if duration_ms <= 0.0 {
        return 1.0;
    }
    (elapsed_ms / duration_ms).clamp(0.0, 1.0)
}

/// Ring scale at a given progress: 3.0 when armed, 1.0 at the target.
pub fn visual_scale(progress: f64) -> f64 {
    START_SCALE - (START_SCALE - TARGET_SCALE) * progress
}

/// Maps distance from the target scale onto a tier.
///
/// `[0, 0.2)` Perfect, `[0.2, 0.5)` Good, `[0.5, ∞)` Miss.
pub fn classify(diff: f64) -> JudgmentTier {
    if diff < PERFECT_WINDOW {
        JudgmentTier::Perfect
    } else if diff < GOOD_WINDOW {
        JudgmentTier::Good
    } else {
        JudgmentTier::Miss
    }
}

/// Judges an action taken `elapsed_ms` after the cue was armed.
///
/// The window is closed at the target, so an action exactly at
/// `elapsed == duration` is still judged by distance. Anything later is a
/// miss.
pub fn judge_action(duration_ms: f64, elapsed_ms: f64) -> JudgmentTier {
    if elapsed_ms > duration_ms {
        return JudgmentTier::Miss;
    }
    let scale = visual_scale(progress(duration_ms, elapsed_ms));
    classify((scale - TARGET_SCALE).abs())
}

/// Lifecycle of one armed cue. Resolves exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct CueTimer {
    pub armed_at_ms: f64,
    pub duration_ms: f64,
    resolution: Option<(JudgmentTier, f64)>,
}

impl CueTimer {
    pub fn arm(armed_at_ms: f64, duration_ms: f64) -> Self {
        Self {
            armed_at_ms,
            duration_ms,
            resolution: None,
        }
    }

    pub fn elapsed(&self, now_ms: f64) -> f64 {
        (now_ms - self.armed_at_ms).max(0.0)
    }

    pub fn progress(&self, now_ms: f64) -> f64 {
        progress(self.duration_ms, self.elapsed(now_ms))
    }

    pub fn scale(&self, now_ms: f64) -> f64 {
        visual_scale(self.progress(now_ms))
    }

    /// Instant at which the cue reaches its target
    pub fn deadline(&self) -> f64 {
        self.armed_at_ms + self.duration_ms
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    pub fn resolution(&self) -> Option<JudgmentTier> {
        self.resolution.map(|(tier, _)| tier)
    }

    /// Time at which the cue was resolved
    pub fn resolved_at(&self) -> Option<f64> {
        self.resolution.map(|(_, at)| at)
    }

    /// Judges an action by timing. Returns `None` if already resolved.
    pub fn press(&mut self, now_ms: f64) -> Option<JudgmentTier> {
        if self.is_resolved() {
            return None;
        }
        let tier = judge_action(self.duration_ms, self.elapsed(now_ms));
        self.resolution = Some((tier, now_ms));
        Some(tier)
    }

    /// Resolves with a fixed tier regardless of timing (key-order games).
    pub fn resolve_with(&mut self, tier: JudgmentTier, now_ms: f64) -> Option<JudgmentTier> {
        if self.is_resolved() {
            return None;
        }
        self.resolution = Some((tier, now_ms));
        Some(tier)
    }

    /// Resolves as Miss once the target has passed without an action.
    ///
    /// The miss is stamped at the deadline rather than at `now_ms`, so a
    /// late sample does not shift when the next cue arms.
    pub fn expire(&mut self, now_ms: f64) -> Option<JudgmentTier> {
        if self.is_resolved() || self.elapsed(now_ms) <= self.duration_ms {
            return None;
        }
        self.resolution = Some((JudgmentTier::Miss, self.deadline()));
        Some(JudgmentTier::Miss)
    }
}

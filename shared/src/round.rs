//! Per-participant round execution.
//!
//! A [`RoundDriver`] owns one participant's play of a [`PatternSpec`]: it
//! arms cues lane by lane, feeds absolute timestamps into the judge, tallies
//! the result and produces exactly one [`RoundOutcome`].

use crate::judge::{CueTimer, JudgmentTier};
use crate::kinds::{JudgeMode, MiniGameKind, MiniGameRules};
use crate::pattern::{Cue, PatternSpec};
use crate::ParticipantId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Weight of a Good hit in the accuracy percentage
pub const GOOD_ACCURACY_WEIGHT: f64 = 0.6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgmentCounts {
    pub perfect: u32,
    pub good: u32,
    pub miss: u32,
}

impl JudgmentCounts {
    pub fn record(&mut self, tier: JudgmentTier) {
        match tier {
            JudgmentTier::Perfect => self.perfect += 1,
            JudgmentTier::Good => self.good += 1,
            JudgmentTier::Miss => self.miss += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.perfect + self.good + self.miss
    }

    /// Accuracy in percent; 0 when nothing was judged
    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let weighted = f64::from(self.perfect) + f64::from(self.good) * GOOD_ACCURACY_WEIGHT;
        weighted / f64::from(total) * 100.0
    }
}

/// One participant's result for one round. Immutable after submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundOutcome {
    pub participant_id: ParticipantId,
    pub kind: MiniGameKind,
    pub success: bool,
    pub score: u32,
    pub elapsed_ms: u64,
    pub judgments: JudgmentCounts,
}

/// Final score for a finished run under `rules`.
pub fn score_run(
    rules: &MiniGameRules,
    counts: &JudgmentCounts,
    success: bool,
    remaining_ms: f64,
) -> u32 {
    let scoring = &rules.scoring;
    let points = counts.perfect * scoring.perfect_points
        + counts.good * scoring.good_points
        + counts.miss * scoring.miss_points;

    let bonus = if scoring.bonus_requires_success && !success {
        0.0
    } else {
        (remaining_ms.max(0.0) / 1000.0 * scoring.time_bonus_per_sec).round()
    };

    (f64::from(points) + counts.accuracy() * scoring.accuracy_weight + bonus).round() as u32
}

/// Something observable that happened while advancing the round
#[derive(Debug, Clone, PartialEq)]
pub enum CueEvent {
    Armed {
        lane: usize,
        key: String,
        at_ms: f64,
    },
    Resolved {
        lane: usize,
        key: String,
        tier: JudgmentTier,
        at_ms: f64,
    },
    Finished {
        success: bool,
        at_ms: f64,
    },
}

#[derive(Debug)]
struct Lane {
    queue: VecDeque<Cue>,
    armed: Option<(Cue, CueTimer)>,
    /// When the previous cue in this lane resolved
    released_at_ms: f64,
}

impl Lane {
    fn is_drained(&self) -> bool {
        self.armed.is_none() && self.queue.is_empty()
    }

    fn pending(&self) -> u32 {
        self.queue.len() as u32 + u32::from(self.armed.is_some())
    }
}

pub struct RoundDriver {
    participant_id: ParticipantId,
    spec: PatternSpec,
    rules: &'static MiniGameRules,
    lanes: Vec<Lane>,
    counts: JudgmentCounts,
    outcome: Option<RoundOutcome>,
}

impl RoundDriver {
    pub fn new(participant_id: impl Into<ParticipantId>, spec: PatternSpec) -> Self {
        let lane_count = usize::from(spec.lanes.max(1));
        let mut lanes: Vec<Lane> = (0..lane_count)
            .map(|_| Lane {
                queue: VecDeque::new(),
                armed: None,
                released_at_ms: 0.0,
            })
            .collect();
        for cue in &spec.cues {
            let slot = cue.lane_index().min(lane_count - 1);
            lanes[slot].queue.push_back(cue.clone());
        }

        Self {
            participant_id: participant_id.into(),
            rules: spec.kind.rules(),
            spec,
            lanes,
            counts: JudgmentCounts::default(),
            outcome: None,
        }
    }

    pub fn spec(&self) -> &PatternSpec {
        &self.spec
    }

    pub fn counts(&self) -> &JudgmentCounts {
        &self.counts
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn outcome(&self) -> Option<&RoundOutcome> {
        self.outcome.as_ref()
    }

    /// Currently armed cues as `(lane, cue, timer)`
    pub fn armed(&self) -> impl Iterator<Item = (usize, &Cue, &CueTimer)> {
        self.lanes
            .iter()
            .enumerate()
            .filter_map(|(i, lane)| lane.armed.as_ref().map(|(cue, timer)| (i, cue, timer)))
    }

    /// Brings the round up to `now_ms` (milliseconds since round start).
    ///
    /// Expired cues resolve as Miss at their own deadline and the next cue
    /// arms relative to that, so one sparse sample yields the same timeline
    /// as many dense ones.
    pub fn advance(&mut self, now_ms: f64) -> Vec<CueEvent> {
        let mut events = Vec::new();
        if self.is_finished() {
            return events;
        }

        let limit_ms = f64::from(self.spec.time_limit_ms);
        let horizon = now_ms.min(limit_ms);

        for (index, lane) in self.lanes.iter_mut().enumerate() {
            loop {
                if let Some((cue, timer)) = lane.armed.as_mut() {
                    match timer.expire(horizon) {
                        Some(tier) => {
                            let at_ms = timer.deadline();
                            self.counts.record(tier);
                            events.push(CueEvent::Resolved {
                                lane: index,
                                key: cue.key.clone(),
                                tier,
                                at_ms,
                            });
                            lane.released_at_ms = at_ms;
                            lane.armed = None;
                        }
                        None => break,
                    }
                } else if let Some(next) = lane.queue.front() {
                    let arm_at = lane.released_at_ms + f64::from(next.gap_ms);
                    if arm_at > horizon {
                        break;
                    }
                    if let Some(cue) = lane.queue.pop_front() {
                        events.push(CueEvent::Armed {
                            lane: index,
                            key: cue.key.clone(),
                            at_ms: arm_at,
                        });
                        let timer = CueTimer::arm(arm_at, f64::from(cue.duration_ms));
                        lane.armed = Some((cue, timer));
                    }
                } else {
                    break;
                }
            }
        }

        if self.lanes.iter().all(Lane::is_drained) {
            let at_ms = self
                .lanes
                .iter()
                .map(|lane| lane.released_at_ms)
                .fold(0.0, f64::max);
            self.finish(true, at_ms);
            events.push(CueEvent::Finished {
                success: true,
                at_ms,
            });
        } else if now_ms >= limit_ms {
            let unresolved: u32 = self.lanes.iter().map(Lane::pending).sum();
            self.counts.miss += unresolved;
            for lane in &mut self.lanes {
                lane.armed = None;
                lane.queue.clear();
            }
            self.finish(false, limit_ms);
            events.push(CueEvent::Finished {
                success: false,
                at_ms: limit_ms,
            });
        }

        events
    }

    /// Applies a key press at `now_ms`.
    ///
    /// The press goes to the most advanced unresolved cue bound to `key`.
    /// A key with no matching armed cue is ignored and returns `None`.
    pub fn press(&mut self, key: &str, now_ms: f64) -> Option<JudgmentTier> {
        self.advance(now_ms);
        if self.is_finished() {
            return None;
        }

        let judge = self.rules.judge;
        let lane = self
            .lanes
            .iter_mut()
            .filter(|lane| {
                lane.armed
                    .as_ref()
                    .is_some_and(|(cue, timer)| cue.key == key && !timer.is_resolved())
            })
            .min_by(|a, b| {
                let a_at = a.armed.as_ref().map(|(_, t)| t.armed_at_ms).unwrap_or(f64::MAX);
                let b_at = b.armed.as_ref().map(|(_, t)| t.armed_at_ms).unwrap_or(f64::MAX);
                a_at.total_cmp(&b_at)
            })?;

        let (_, timer) = lane.armed.as_mut()?;
        let tier = match judge {
            JudgeMode::KeyOrder => timer.resolve_with(JudgmentTier::Perfect, now_ms),
            JudgeMode::Timing => timer.press(now_ms),
        }?;
        lane.armed = None;
        lane.released_at_ms = now_ms;
        self.counts.record(tier);

        self.advance(now_ms);
        Some(tier)
    }

    fn finish(&mut self, success: bool, at_ms: f64) {
        let remaining_ms = f64::from(self.spec.time_limit_ms) - at_ms;
        let score = score_run(self.rules, &self.counts, success, remaining_ms);
        self.outcome = Some(RoundOutcome {
            participant_id: self.participant_id.clone(),
            kind: self.spec.kind,
            success,
            score,
            elapsed_ms: at_ms.max(0.0).round() as u64,
            judgments: self.counts,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::Difficulty;
    use assert_approx_eq::assert_approx_eq;

    fn cue(key: &str, duration_ms: u32, gap_ms: u32, lane: Option<u8>) -> Cue {
        Cue {
            key: key.to_string(),
            duration_ms,
            gap_ms,
            lane,
        }
    }

    fn spec(kind: MiniGameKind, lanes: u8, time_limit_ms: u32, cues: Vec<Cue>) -> PatternSpec {
        PatternSpec {
            kind,
            difficulty: Difficulty::Normal,
            round: 1,
            lanes,
            time_limit_ms,
            cues,
        }
    }

    #[test]
    fn test_press_at_target_is_perfect() {
        let mut driver = RoundDriver::new(
            "p1",
            spec(MiniGameKind::Gyeokdol, 1, 10_000, vec![cue("q", 1000, 0, None)]),
        );
        driver.advance(0.0);
        assert_eq!(driver.press("q", 1000.0), Some(JudgmentTier::Perfect));

        let outcome = driver.outcome().expect("single cue round finishes");
        assert!(outcome.success);
        assert_eq!(outcome.judgments.perfect, 1);
        assert_eq!(outcome.elapsed_ms, 1000);
    }

    #[test]
    fn test_no_action_resolves_miss() {
        let mut driver = RoundDriver::new(
            "p1",
            spec(
                MiniGameKind::Gyeokdol,
                1,
                10_000,
                vec![cue("q", 1000, 0, None), cue("w", 1000, 300, None)],
            ),
        );
        let events = driver.advance(1000.0);
        assert!(!events
            .iter()
            .any(|e| matches!(e, CueEvent::Resolved { .. })));

        let events = driver.advance(1001.0);
        assert!(events.contains(&CueEvent::Resolved {
            lane: 0,
            key: "q".to_string(),
            tier: JudgmentTier::Miss,
            at_ms: 1000.0,
        }));
        assert_eq!(driver.counts().miss, 1);
    }

    #[test]
    fn test_sparse_sampling_matches_dense() {
        let cues = vec![
            cue("q", 800, 0, None),
            cue("w", 800, 300, None),
            cue("w", 800, 150, None),
        ];

        let mut dense = RoundDriver::new("p1", spec(MiniGameKind::Gyeokdol, 1, 10_000, cues.clone()));
        let mut now = 0.0;
        while now < 5_000.0 {
            dense.advance(now);
            now += 16.0;
        }

        let mut sparse = RoundDriver::new("p1", spec(MiniGameKind::Gyeokdol, 1, 10_000, cues));
        sparse.advance(5_000.0);

        assert_eq!(dense.outcome(), sparse.outcome());
        let outcome = sparse.outcome().expect("all cues expired");
        // 800 + 300 + 800 + 150 + 800
        assert_eq!(outcome.elapsed_ms, 2_850);
        assert_eq!(outcome.judgments.miss, 3);
    }

    #[test]
    fn test_wrong_key_is_ignored() {
        let mut driver = RoundDriver::new(
            "p1",
            spec(MiniGameKind::Gyeokdol, 1, 10_000, vec![cue("q", 1000, 0, None)]),
        );
        assert_eq!(driver.press("w", 900.0), None);
        assert_eq!(driver.press("q", 950.0), Some(JudgmentTier::Perfect));
        assert_eq!(driver.press("q", 960.0), None);
    }

    #[test]
    fn test_lanes_match_on_key() {
        let mut driver = RoundDriver::new(
            "p1",
            spec(
                MiniGameKind::StarForce,
                2,
                10_000,
                vec![cue("q", 1000, 0, Some(0)), cue("w", 1000, 0, Some(1))],
            ),
        );
        driver.advance(0.0);
        assert_eq!(driver.armed().count(), 2);

        assert_eq!(driver.press("w", 1000.0), Some(JudgmentTier::Perfect));
        assert_eq!(driver.armed().count(), 1);
        assert_eq!(driver.press("q", 1001.0), None, "window already closed");
        assert_eq!(driver.counts().miss, 1);
        assert!(driver.is_finished());
    }

    #[test]
    fn test_time_limit_counts_remaining_as_miss() {
        let mut driver = RoundDriver::new(
            "p1",
            spec(
                MiniGameKind::AjaePattern,
                1,
                3_000,
                vec![
                    cue("a", 3_000, 0, None),
                    cue("s", 3_000, 0, None),
                    cue("d", 3_000, 0, None),
                ],
            ),
        );
        assert_eq!(driver.press("a", 400.0), Some(JudgmentTier::Perfect));
        assert_eq!(driver.press("d", 500.0), None);
        driver.advance(3_000.0);

        let outcome = driver.outcome().expect("time limit ends the round");
        assert!(!outcome.success);
        assert_eq!(outcome.judgments.total(), 3);
        assert_eq!(outcome.judgments.miss, 2);
        assert_eq!(outcome.elapsed_ms, 3_000);
        // round(33.3) accuracy, no time bonus on failure
        assert_eq!(outcome.score, 33);
    }

    #[test]
    fn test_key_sequence_success_earns_time_bonus() {
        let mut driver = RoundDriver::new(
            "p1",
            spec(
                MiniGameKind::AjaePattern,
                1,
                5_000,
                vec![cue("a", 5_000, 0, None), cue("s", 5_000, 0, None)],
            ),
        );
        driver.press("a", 500.0);
        driver.press("s", 1_000.0);

        let outcome = driver.outcome().expect("sequence complete");
        assert!(outcome.success);
        assert_eq!(outcome.elapsed_ms, 1_000);
        // 100 accuracy + 4s * 10
        assert_eq!(outcome.score, 140);
    }

    #[test]
    fn test_accuracy_weights_good_hits() {
        let counts = JudgmentCounts {
            perfect: 1,
            good: 1,
            miss: 2,
        };
        assert_approx_eq!(counts.accuracy(), 40.0, 1e-9);
        assert_eq!(JudgmentCounts::default().accuracy(), 0.0);
    }

    #[test]
    fn test_timing_score_formula() {
        let counts = JudgmentCounts {
            perfect: 2,
            good: 1,
            miss: 1,
        };
        // 250 points + 2 * 65 accuracy + 5/s * 4s
        let score = score_run(MiniGameKind::Gyeokdol.rules(), &counts, true, 4_000.0);
        assert_eq!(score, 400);
        // 260 points + 130, no time bonus
        let score = score_run(MiniGameKind::StarForce.rules(), &counts, true, 4_000.0);
        assert_eq!(score, 390);
    }
}

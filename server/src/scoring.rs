//! Round result aggregation.
//!
//! Pure functions over a round's outcomes. Ranking is a total order so the
//! result never depends on the order submissions arrived in.

use crate::participants::Roster;
use shared::{ParticipantId, RoundOutcome, RoundResultEntry, Standing};
use std::cmp::Ordering;

pub const FIRST_PLACE_POINTS: u32 = 3;
pub const SECOND_PLACE_POINTS: u32 = 2;
pub const PARTICIPATION_POINTS: u32 = 1;

/// Points for a 0-based rank among submitters
pub fn points_for_rank(rank: usize) -> u32 {
    match rank {
        0 => FIRST_PLACE_POINTS,
        1 => SECOND_PLACE_POINTS,
        _ => PARTICIPATION_POINTS,
    }
}

/// Success first, then higher score, then faster time, then id.
pub fn compare_outcomes(a: &RoundOutcome, b: &RoundOutcome) -> Ordering {
    b.success
        .cmp(&a.success)
        .then_with(|| b.score.cmp(&a.score))
        .then_with(|| a.elapsed_ms.cmp(&b.elapsed_ms))
        .then_with(|| a.participant_id.cmp(&b.participant_id))
}

pub fn rank(outcomes: &[RoundOutcome]) -> Vec<&RoundOutcome> {
    let mut ranked: Vec<&RoundOutcome> = outcomes.iter().collect();
    ranked.sort_by(|a, b| compare_outcomes(a, b));
    ranked
}

/// Ranks a round, awards points into `roster` and returns the result list.
///
/// Outcomes from participants no longer in the roster are dropped.
/// Non-submitters still in the roster follow every submitter with zero
/// points, ordered by id.
pub fn close_round(
    outcomes: &[RoundOutcome],
    non_submitters: &[ParticipantId],
    roster: &mut Roster,
) -> Vec<RoundResultEntry> {
    let present: Vec<RoundOutcome> = outcomes
        .iter()
        .filter(|outcome| roster.contains(&outcome.participant_id))
        .cloned()
        .collect();

    let mut entries = Vec::with_capacity(present.len() + non_submitters.len());
    for (position, outcome) in rank(&present).into_iter().enumerate() {
        let points = points_for_rank(position);
        let total_score = roster.award(&outcome.participant_id, points).unwrap_or(points);
        entries.push(RoundResultEntry {
            participant_id: outcome.participant_id.clone(),
            name: display_name(roster, &outcome.participant_id),
            score: outcome.score,
            points_awarded: points,
            total_score,
            submitted: true,
        });
    }

    let mut missing: Vec<&ParticipantId> = non_submitters
        .iter()
        .filter(|id| roster.contains(id))
        .collect();
    missing.sort();
    missing.dedup();
    for id in missing {
        entries.push(RoundResultEntry {
            participant_id: id.clone(),
            name: display_name(roster, id),
            score: 0,
            points_awarded: 0,
            total_score: roster.get(id).map(|p| p.score).unwrap_or(0),
            submitted: false,
        });
    }

    entries
}

/// Every participant by cumulative score, highest first, ties by id
pub fn final_standings(roster: &Roster) -> Vec<Standing> {
    let mut standings: Vec<Standing> = roster
        .iter()
        .map(|p| Standing {
            participant_id: p.id.clone(),
            name: p.name.clone(),
            score: p.score,
        })
        .collect();
    standings.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.participant_id.cmp(&b.participant_id))
    });
    standings
}

fn display_name(roster: &Roster, id: &str) -> String {
    roster
        .get(id)
        .map(|p| p.name.clone())
        .unwrap_or_else(|| id.to_string())
}

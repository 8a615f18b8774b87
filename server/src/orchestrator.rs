//! Session state machine.
//!
//! The orchestrator owns one session value and is driven entirely from the
//! outside: network events arrive as method calls and deadlines arrive
//! through [`SessionOrchestrator::on_timer`]. Nothing here blocks or awaits.
//! Packets meant for every participant are queued and collected with
//! [`SessionOrchestrator::take_broadcasts`].
//!
//! ```text
//! Idle --start_voting--> Voting --deadline--> RoundActive --all in / deadline--> Scoring
//!                          ^                                                      |
//!                          +------------------ results shown ---------------------+
//!                                                                                 v
//!                                               Idle <--reset-- Ended <-- last round
//! ```

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::participants::Roster;
use crate::scoring;
use crate::timers::{ManualScheduler, Scheduler, TimerId, TimerKind};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use shared::{
    pattern, MiniGameKind, Packet, ParticipantId, PatternSpec, RoundOutcome, RoundResultEntry,
    SessionState,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// The round currently being played
#[derive(Debug)]
struct ActiveRound {
    kind: MiniGameKind,
    pattern: PatternSpec,
    /// Everyone expected to report: live at round start, plus anyone who
    /// joined or submitted while the round was running
    expected: BTreeSet<ParticipantId>,
    results: BTreeMap<ParticipantId, RoundOutcome>,
}

#[derive(Debug)]
struct Session {
    state: SessionState,
    round_index: u32,
    active_kind: Option<MiniGameKind>,
    tally: BTreeMap<MiniGameKind, u32>,
    participants: Roster,
    round: Option<ActiveRound>,
    round_results: BTreeMap<u32, Vec<RoundResultEntry>>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
            round_index: 0,
            active_kind: None,
            tally: BTreeMap::new(),
            participants: Roster::new(),
            round: None,
            round_results: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ArmedTimer {
    generation: u64,
    due: Instant,
}

pub struct SessionOrchestrator<S: Scheduler> {
    config: SessionConfig,
    scheduler: S,
    rng: StdRng,
    session: Session,
    timers: HashMap<TimerKind, ArmedTimer>,
    next_generation: u64,
    outbox: Vec<Packet>,
}

impl<S: Scheduler> SessionOrchestrator<S> {
    pub fn new(config: SessionConfig, scheduler: S) -> Self {
        Self::with_rng(config, scheduler, StdRng::from_entropy())
    }

    /// Uses `rng` for tie breaks and pattern seeding
    pub fn with_rng(config: SessionConfig, scheduler: S, rng: StdRng) -> Self {
        Self {
            config,
            scheduler,
            rng,
            session: Session::new(),
            timers: HashMap::new(),
            next_generation: 0,
            outbox: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    pub fn round_index(&self) -> u32 {
        self.session.round_index
    }

    pub fn active_kind(&self) -> Option<MiniGameKind> {
        self.session.active_kind
    }

    pub fn tally(&self) -> &BTreeMap<MiniGameKind, u32> {
        &self.session.tally
    }

    pub fn participants(&self) -> &Roster {
        &self.session.participants
    }

    pub fn current_pattern(&self) -> Option<&PatternSpec> {
        self.session.round.as_ref().map(|round| &round.pattern)
    }

    pub fn round_results(&self) -> &BTreeMap<u32, Vec<RoundResultEntry>> {
        &self.session.round_results
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// Drains packets queued for every participant since the last call
    pub fn take_broadcasts(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.outbox)
    }

    /// Packets a freshly identified connection needs to join the current phase
    pub fn catch_up(&self) -> Vec<Packet> {
        let mut packets = vec![Packet::ParticipantList {
            participants: self.session.participants.infos(),
        }];
        match self.session.state {
            SessionState::Voting => {
                let remaining = self.remaining(&TimerKind::VotingDeadline).unwrap_or_default();
                packets.push(Packet::VotingStarted {
                    round: self.session.round_index + 1,
                    duration_seconds: remaining.as_secs() as u32,
                });
                packets.push(Packet::VoteUpdate {
                    votes: self.session.tally.clone(),
                });
            }
            SessionState::RoundActive => {
                if let Some(round) = &self.session.round {
                    packets.push(Packet::RoundStarted {
                        round: self.session.round_index,
                        mode: round.kind,
                    });
                    packets.push(Packet::RoundInit {
                        round: self.session.round_index,
                        mode: round.kind,
                        pattern: round.pattern.clone(),
                    });
                }
            }
            SessionState::Scoring => {
                if let Some((round, results)) = self.session.round_results.iter().next_back() {
                    packets.push(Packet::RoundEnded {
                        round: *round,
                        results: results.clone(),
                    });
                }
            }
            SessionState::Ended => {
                packets.push(Packet::GameEnded {
                    ranking: scoring::final_standings(&self.session.participants),
                    round_results: self.session.round_results.clone(),
                });
            }
            SessionState::Idle => {}
        }
        packets
    }

    /// Identity handshake: registers a participant or revives a disconnected one.
    ///
    /// Accepted in every state, including `Ended`.
    pub fn join(&mut self, participant_id: &str, name: &str) {
        let is_new = self.session.participants.upsert(participant_id, name);
        if !is_new {
            info!("Participant {} is back", participant_id);
        }
        self.disarm(&TimerKind::ReconnectGrace(participant_id.to_string()));
        self.disarm(&TimerKind::EmptyLobby);
        self.expect_late_joiner(participant_id);
        self.broadcast_roster();
        self.maybe_auto_start();
    }

    /// The participant's last connection went away. They stay in the roster
    /// for the reconnect grace period but stop counting as live.
    pub fn participant_disconnected(&mut self, participant_id: &str) -> Result<()> {
        if !self.session.participants.set_live(participant_id, false) {
            return Err(SessionError::UnknownParticipant(participant_id.to_string()));
        }
        info!("Participant {} disconnected", participant_id);

        self.outbox.push(Packet::UserDisconnected {
            participant_id: participant_id.to_string(),
        });
        self.arm(
            TimerKind::ReconnectGrace(participant_id.to_string()),
            self.config.reconnect_grace,
        );
        self.after_roster_shrank();
        Ok(())
    }

    /// Explicit departure. Removes the participant immediately.
    pub fn leave(&mut self, participant_id: &str) -> Result<()> {
        if !self.session.participants.contains(participant_id) {
            return Err(SessionError::UnknownParticipant(participant_id.to_string()));
        }
        self.remove_participant(participant_id);
        self.outbox.push(Packet::UserDisconnected {
            participant_id: participant_id.to_string(),
        });
        self.after_roster_shrank();
        Ok(())
    }

    pub fn start_voting(&mut self) -> Result<()> {
        match self.session.state {
            SessionState::Idle => {}
            SessionState::Ended => return Err(SessionError::AlreadyEnded),
            from => {
                return Err(SessionError::InvalidTransition {
                    from,
                    event: "start voting",
                })
            }
        }

        if self.session.round_index >= self.config.max_rounds {
            info!(
                "All {} rounds played; ending instead of voting",
                self.config.max_rounds
            );
            self.end_session();
            return Ok(());
        }

        self.enter_voting();
        Ok(())
    }

    pub fn cast_vote(&mut self, participant_id: &str, game_mode: &str) -> Result<()> {
        match self.session.state {
            SessionState::Voting => {}
            SessionState::Ended => return Err(SessionError::AlreadyEnded),
            _ => return Err(SessionError::NotVoting),
        }
        let kind: MiniGameKind = game_mode.parse()?;

        self.ensure_participant(participant_id);
        let round_key = self.session.round_index + 1;
        let previous = self
            .session
            .participants
            .set_vote(participant_id, round_key, kind);

        if previous == Some(kind) {
            debug!("Repeated vote from {} for {}", participant_id, kind);
            return Ok(());
        }
        if let Some(previous) = previous {
            if let Some(count) = self.session.tally.get_mut(&previous) {
                *count = count.saturating_sub(1);
            }
        }
        *self.session.tally.entry(kind).or_insert(0) += 1;

        debug!("{} voted for {} ({:?})", participant_id, kind, self.session.tally);
        self.outbox.push(Packet::VoteUpdate {
            votes: self.session.tally.clone(),
        });
        self.check_early_close();
        Ok(())
    }

    pub fn submit_result(&mut self, outcome: RoundOutcome) -> Result<()> {
        match self.session.state {
            SessionState::RoundActive => {}
            SessionState::Ended => return Err(SessionError::AlreadyEnded),
            _ => return Err(SessionError::NoActiveRound),
        }
        let expected = match &self.session.round {
            Some(round) => round.kind,
            None => return Err(SessionError::NoActiveRound),
        };
        if outcome.kind != expected {
            return Err(SessionError::ResultModeMismatch {
                expected,
                got: outcome.kind,
            });
        }
        let already = self
            .session
            .round
            .as_ref()
            .is_some_and(|round| round.results.contains_key(&outcome.participant_id));
        if already {
            return Err(SessionError::DuplicateResult(outcome.participant_id));
        }

        self.ensure_participant(&outcome.participant_id);
        info!(
            "Result from {}: score {} in {}ms (success: {})",
            outcome.participant_id, outcome.score, outcome.elapsed_ms, outcome.success
        );
        if let Some(round) = self.session.round.as_mut() {
            round.expected.insert(outcome.participant_id.clone());
            round.results.insert(outcome.participant_id.clone(), outcome);
        }

        if self.all_submitted() {
            self.close_round();
        } else {
            self.extend_submission_deadline(self.config.submission_timeout);
        }
        Ok(())
    }

    /// Returns the session to `Idle` with every score zeroed.
    /// Accepted in every state.
    pub fn reset(&mut self) {
        info!("Session reset from {}", self.session.state);
        self.cancel_state_timers();

        let session = &mut self.session;
        session.state = SessionState::Idle;
        session.round_index = 0;
        session.active_kind = None;
        session.tally.clear();
        session.round = None;
        session.round_results.clear();
        session.participants.reset_progress();

        self.outbox.push(Packet::GameReset);
        self.broadcast_roster();
        self.maybe_auto_start();
    }

    /// Handles a fired timer. Fires that are not the currently armed
    /// generation of their kind are ignored.
    pub fn on_timer(&mut self, id: TimerId) {
        let armed = self.timers.get(&id.kind).map(|armed| armed.generation);
        if armed != Some(id.generation) {
            debug!("Ignoring stale timer {:?}", id);
            return;
        }
        self.timers.remove(&id.kind);
        debug!("Timer {:?} fired in {}", id.kind, self.session.state);

        match id.kind {
            TimerKind::VotingDeadline if self.session.state == SessionState::Voting => {
                self.close_voting();
            }
            TimerKind::SubmissionDeadline if self.session.state == SessionState::RoundActive => {
                info!("Submission deadline reached; closing round");
                self.close_round();
            }
            TimerKind::ResultsDisplay if self.session.state == SessionState::Scoring => {
                if self.session.round_index < self.config.max_rounds {
                    self.enter_voting();
                } else {
                    self.end_session();
                }
            }
            TimerKind::ReconnectGrace(participant_id) => {
                if !self.session.participants.is_live(&participant_id)
                    && self.session.participants.contains(&participant_id)
                {
                    info!("Participant {} did not return; removing", participant_id);
                    self.remove_participant(&participant_id);
                    self.after_roster_shrank();
                }
            }
            TimerKind::EmptyLobby => {
                if self.session.participants.live_count() == 0 {
                    info!("Lobby empty; resetting session");
                    self.reset();
                }
            }
            kind => warn!("Timer {:?} fired outside its state", kind),
        }
    }

    fn enter_voting(&mut self) {
        self.cancel_state_timers();
        self.session.state = SessionState::Voting;
        self.session.round = None;
        self.session.tally = MiniGameKind::ALL.iter().map(|kind| (*kind, 0)).collect();

        let round = self.session.round_index + 1;
        info!("Voting opened for round {}", round);
        self.arm(TimerKind::VotingDeadline, self.config.voting_duration);
        self.outbox.push(Packet::VotingStarted {
            round,
            duration_seconds: self.config.voting_duration.as_secs() as u32,
        });
        self.outbox.push(Packet::VoteUpdate {
            votes: self.session.tally.clone(),
        });
    }

    /// Cuts voting short once every live participant has voted
    fn check_early_close(&mut self) {
        if self.session.state != SessionState::Voting {
            return;
        }
        let live = self.session.participants.live_count();
        let voted = self
            .session
            .participants
            .live_voters(self.session.round_index + 1);
        if live == 0 || voted < live {
            return;
        }

        let floor = self.config.early_close_floor;
        if let Some(remaining) = self.remaining(&TimerKind::VotingDeadline) {
            if remaining > floor {
                info!("Everyone voted; closing voting in {:?}", floor);
                self.arm(TimerKind::VotingDeadline, floor);
            }
        }
    }

    fn close_voting(&mut self) {
        let selected = self.select_kind();
        self.cancel_state_timers();

        let session = &mut self.session;
        session.round_index += 1;
        session.active_kind = Some(selected);
        let round = session.round_index;
        let pattern = pattern::for_round(selected, round, &mut self.rng);
        let expected: BTreeSet<ParticipantId> = session
            .participants
            .live()
            .map(|p| p.id.clone())
            .collect();

        info!(
            "Round {} selected {} ({} cues, {}ms limit) with votes {:?}",
            round,
            selected,
            pattern.len(),
            pattern.time_limit_ms,
            session.tally
        );
        self.outbox.push(Packet::VotingEnded {
            round,
            selected_mode: selected,
            votes: session.tally.clone(),
        });
        self.outbox.push(Packet::RoundStarted {
            round,
            mode: selected,
        });
        self.outbox.push(Packet::RoundInit {
            round,
            mode: selected,
            pattern: pattern.clone(),
        });

        let deadline =
            Duration::from_millis(u64::from(pattern.time_limit_ms)) + self.config.submission_timeout;
        session.round = Some(ActiveRound {
            kind: selected,
            pattern,
            expected,
            results: BTreeMap::new(),
        });
        session.state = SessionState::RoundActive;
        self.arm(TimerKind::SubmissionDeadline, deadline);
    }

    /// Kind with the highest tally; ties broken uniformly at random
    fn select_kind(&mut self) -> MiniGameKind {
        let best = MiniGameKind::ALL
            .iter()
            .map(|kind| self.session.tally.get(kind).copied().unwrap_or(0))
            .max()
            .unwrap_or(0);
        let tied: Vec<MiniGameKind> = MiniGameKind::ALL
            .into_iter()
            .filter(|kind| self.session.tally.get(kind).copied().unwrap_or(0) == best)
            .collect();
        if tied.len() > 1 {
            debug!("Tie between {:?} at {} votes", tied, best);
        }
        tied.choose(&mut self.rng)
            .copied()
            .unwrap_or(MiniGameKind::Gyeokdol)
    }

    /// Every expected participant who is still live has reported
    fn all_submitted(&self) -> bool {
        let Some(round) = &self.session.round else {
            return false;
        };
        if round.results.is_empty() {
            return false;
        }
        round
            .expected
            .iter()
            .filter(|id| self.session.participants.is_live(id))
            .all(|id| round.results.contains_key(id))
    }

    /// Moves the submission deadline out to `now + after`, never earlier
    fn extend_submission_deadline(&mut self, after: Duration) {
        let wanted = self.scheduler.now() + after;
        let current = self.timers.get(&TimerKind::SubmissionDeadline).map(|t| t.due);
        if current.map_or(true, |due| wanted > due) {
            self.arm(TimerKind::SubmissionDeadline, after);
        }
    }

    /// Someone identifying mid-round gets the pattern through `catch_up`
    /// and is owed a result slot plus a full round of time to play it.
    fn expect_late_joiner(&mut self, participant_id: &str) {
        if self.session.state != SessionState::RoundActive {
            return;
        }
        let Some(round) = self.session.round.as_mut() else {
            return;
        };
        if !round.expected.insert(participant_id.to_string()) {
            return;
        }
        let playtime = Duration::from_millis(u64::from(round.pattern.time_limit_ms));
        info!(
            "Participant {} joined round {} in progress",
            participant_id, self.session.round_index
        );
        self.extend_submission_deadline(playtime + self.config.submission_timeout);
    }

    fn close_round(&mut self) {
        self.cancel_state_timers();
        let Some(round) = self.session.round.take() else {
            warn!("No round to close");
            return;
        };

        let outcomes: Vec<RoundOutcome> = round.results.into_values().collect();
        let non_submitters: Vec<ParticipantId> = round
            .expected
            .iter()
            .filter(|id| !outcomes.iter().any(|o| &o.participant_id == *id))
            .cloned()
            .collect();

        let entries = scoring::close_round(&outcomes, &non_submitters, &mut self.session.participants);
        let round_index = self.session.round_index;
        info!(
            "Round {} closed: {} results, {} missing",
            round_index,
            outcomes.len(),
            non_submitters.len()
        );

        self.session.round_results.insert(round_index, entries.clone());
        self.session.state = SessionState::Scoring;
        self.outbox.push(Packet::RoundEnded {
            round: round_index,
            results: entries,
        });

        let display = if round_index < self.config.max_rounds {
            self.config.inter_round_delay
        } else {
            self.config.final_results_delay
        };
        self.arm(TimerKind::ResultsDisplay, display);
    }

    fn end_session(&mut self) {
        self.cancel_state_timers();
        self.session.state = SessionState::Ended;
        self.session.round = None;

        let ranking = scoring::final_standings(&self.session.participants);
        info!("Session ended after {} rounds", self.session.round_index);
        self.outbox.push(Packet::GameEnded {
            ranking,
            round_results: self.session.round_results.clone(),
        });
    }

    fn ensure_participant(&mut self, participant_id: &str) {
        if self.session.participants.ensure(participant_id) {
            warn!("Auto-registered unknown participant {}", participant_id);
            self.broadcast_roster();
        }
    }

    fn remove_participant(&mut self, participant_id: &str) {
        let Some(removed) = self.session.participants.remove(participant_id) else {
            return;
        };
        info!("Participant {} ({}) removed", removed.id, removed.name);
        self.disarm(&TimerKind::ReconnectGrace(participant_id.to_string()));

        if self.session.state == SessionState::Voting {
            if let Some(kind) = removed.vote(self.session.round_index + 1) {
                if let Some(count) = self.session.tally.get_mut(&kind) {
                    *count = count.saturating_sub(1);
                }
                self.outbox.push(Packet::VoteUpdate {
                    votes: self.session.tally.clone(),
                });
            }
        }
        if let Some(round) = self.session.round.as_mut() {
            round.expected.remove(participant_id);
            round.results.remove(participant_id);
        }
    }

    /// Re-evaluates completion conditions after someone stopped counting
    fn after_roster_shrank(&mut self) {
        self.broadcast_roster();
        match self.session.state {
            SessionState::Voting => self.check_early_close(),
            SessionState::RoundActive if self.all_submitted() => self.close_round(),
            _ => {}
        }
        if self.session.participants.live_count() == 0
            && !self.timers.contains_key(&TimerKind::EmptyLobby)
        {
            self.arm(TimerKind::EmptyLobby, self.config.empty_lobby_reset);
        }
    }

    fn maybe_auto_start(&mut self) {
        let wanted = self.config.auto_start_players;
        if wanted == 0 || self.session.state != SessionState::Idle {
            return;
        }
        if self.session.participants.live_count() >= wanted {
            info!("{} participants live; starting automatically", wanted);
            if let Err(e) = self.start_voting() {
                warn!("Auto start failed: {}", e);
            }
        }
    }

    fn broadcast_roster(&mut self) {
        self.outbox.push(Packet::ParticipantList {
            participants: self.session.participants.infos(),
        });
    }

    fn arm(&mut self, kind: TimerKind, after: Duration) {
        self.disarm(&kind);
        self.next_generation += 1;
        let generation = self.next_generation;
        let due = self.scheduler.now() + after;
        self.scheduler.schedule(
            TimerId {
                kind: kind.clone(),
                generation,
            },
            after,
        );
        self.timers.insert(kind, ArmedTimer { generation, due });
    }

    fn disarm(&mut self, kind: &TimerKind) {
        if let Some(armed) = self.timers.remove(kind) {
            self.scheduler.cancel(&TimerId {
                kind: kind.clone(),
                generation: armed.generation,
            });
        }
    }

    fn cancel_state_timers(&mut self) {
        for kind in TimerKind::STATE_BOUND {
            self.disarm(&kind);
        }
    }

    fn remaining(&self, kind: &TimerKind) -> Option<Duration> {
        self.timers
            .get(kind)
            .map(|armed| armed.due.saturating_duration_since(self.scheduler.now()))
    }
}

impl SessionOrchestrator<ManualScheduler> {
    /// Moves the manual clock forward by `by`, firing every timer that falls
    /// due on the way in order.
    pub fn advance(&mut self, by: Duration) {
        let target = self.scheduler.elapsed() + by;
        while let Some(id) = self.scheduler.pop_due(target) {
            self.on_timer(id);
        }
        self.scheduler.set_elapsed(target);
    }
}

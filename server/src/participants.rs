//! Participant roster for one session.

use log::info;
use shared::{MiniGameKind, ParticipantId, ParticipantInfo};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    /// Cumulative points across closed rounds
    pub score: u32,
    /// Has at least one open connection
    pub live: bool,
    /// Vote per round key, overwritten until voting closes
    votes: BTreeMap<u32, MiniGameKind>,
}

impl Participant {
    pub fn new(id: impl Into<ParticipantId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            score: 0,
            live: true,
            votes: BTreeMap::new(),
        }
    }

    pub fn vote(&self, round: u32) -> Option<MiniGameKind> {
        self.votes.get(&round).copied()
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            participant_id: self.id.clone(),
            name: self.name.clone(),
            score: self.score,
            live: self.live,
        }
    }
}

/// Placeholder name for a participant that never identified itself
pub fn guest_name(id: &str) -> String {
    let prefix: String = id.chars().take(5).collect();
    format!("Player-{}", prefix)
}

#[derive(Debug, Default)]
pub struct Roster {
    participants: BTreeMap<ParticipantId, Participant>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or revives `id`. Returns true if the participant is new.
    ///
    /// An empty `name` keeps the current one, or falls back to a guest name.
    pub fn upsert(&mut self, id: &str, name: &str) -> bool {
        match self.participants.get_mut(id) {
            Some(participant) => {
                participant.live = true;
                if !name.is_empty() {
                    participant.name = name.to_string();
                }
                false
            }
            None => {
                let name = if name.is_empty() {
                    guest_name(id)
                } else {
                    name.to_string()
                };
                info!("Participant {} joined as {}", id, name);
                self.participants
                    .insert(id.to_string(), Participant::new(id, name));
                true
            }
        }
    }

    /// Makes sure `id` exists without touching a known participant
    pub fn ensure(&mut self, id: &str) -> bool {
        if self.participants.contains_key(id) {
            return false;
        }
        self.upsert(id, "")
    }

    pub fn remove(&mut self, id: &str) -> Option<Participant> {
        self.participants.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.participants.contains_key(id)
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.get(id).is_some_and(|p| p.live)
    }

    pub fn set_live(&mut self, id: &str, live: bool) -> bool {
        match self.participants.get_mut(id) {
            Some(participant) => {
                participant.live = live;
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn live(&self) -> impl Iterator<Item = &Participant> {
        self.iter().filter(|p| p.live)
    }

    pub fn live_count(&self) -> usize {
        self.live().count()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Records a vote and returns the one it replaced
    pub fn set_vote(&mut self, id: &str, round: u32, kind: MiniGameKind) -> Option<MiniGameKind> {
        self.participants
            .get_mut(id)
            .and_then(|p| p.votes.insert(round, kind))
    }

    /// Live participants with a vote recorded for `round`
    pub fn live_voters(&self, round: u32) -> usize {
        self.live().filter(|p| p.vote(round).is_some()).count()
    }

    pub fn award(&mut self, id: &str, points: u32) -> Option<u32> {
        self.participants.get_mut(id).map(|p| {
            p.score += points;
            p.score
        })
    }

    /// Zeroes scores and forgets vote history; identities stay
    pub fn reset_progress(&mut self) {
        for participant in self.participants.values_mut() {
            participant.score = 0;
            participant.votes.clear();
        }
    }

    pub fn infos(&self) -> Vec<ParticipantInfo> {
        self.iter().map(Participant::info).collect()
    }
}

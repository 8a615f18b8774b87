//! Cancellable deadline timers for the session orchestrator.
//!
//! Timers never call back into the orchestrator directly. A firing timer
//! produces its [`TimerId`], which the owner feeds back through the same
//! event path as network traffic. Every arm gets a fresh generation, so a
//! fire that raced with a cancel can be recognised and dropped.

use crate::network::ServerMessage;
use log::{debug, error};
use shared::ParticipantId;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKind {
    VotingDeadline,
    SubmissionDeadline,
    ResultsDisplay,
    ReconnectGrace(ParticipantId),
    EmptyLobby,
}

impl TimerKind {
    /// Kinds that belong to a single session state and die with it
    pub const STATE_BOUND: [TimerKind; 3] = [
        TimerKind::VotingDeadline,
        TimerKind::SubmissionDeadline,
        TimerKind::ResultsDisplay,
    ];

    pub fn is_state_bound(&self) -> bool {
        Self::STATE_BOUND.contains(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub kind: TimerKind,
    pub generation: u64,
}

pub trait Scheduler {
    fn now(&self) -> Instant;

    /// Fires `id` once after `after` unless cancelled first
    fn schedule(&mut self, id: TimerId, after: Duration);

    fn cancel(&mut self, id: &TimerId);
}

/// Runs each timer as a sleeping tokio task that posts back to the server loop.
pub struct TokioScheduler {
    tx: mpsc::UnboundedSender<ServerMessage>,
    tasks: HashMap<TimerId, JoinHandle<()>>,
}

impl TokioScheduler {
    pub fn new(tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            tx,
            tasks: HashMap::new(),
        }
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn schedule(&mut self, id: TimerId, after: Duration) {
        self.tasks.retain(|_, task| !task.is_finished());

        let tx = self.tx.clone();
        let fired = id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            debug!("Timer {:?} fired", fired);
            if let Err(e) = tx.send(ServerMessage::TimerFired(fired)) {
                error!("Failed to deliver timer to main loop: {}", e);
            }
        });

        if let Some(previous) = self.tasks.insert(id, task) {
            previous.abort();
        }
    }

    fn cancel(&mut self, id: &TimerId) {
        if let Some(task) = self.tasks.remove(id) {
            task.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for task in self.tasks.values() {
            task.abort();
        }
    }
}

/// Deterministic clock and timer queue for driving the orchestrator in tests.
///
/// Time only moves when the owner pops a due timer or sets the clock.
#[derive(Debug)]
pub struct ManualScheduler {
    origin: Instant,
    elapsed: Duration,
    queue: Vec<(Duration, TimerId)>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Duration::ZERO,
            queue: Vec::new(),
        }
    }

    /// Time since the scheduler was created
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_armed(&self, kind: &TimerKind) -> bool {
        self.queue.iter().any(|(_, id)| &id.kind == kind)
    }

    /// When a timer of `kind` is due, measured from creation
    pub fn due(&self, kind: &TimerKind) -> Option<Duration> {
        self.queue
            .iter()
            .find(|(_, id)| &id.kind == kind)
            .map(|(due, _)| *due)
    }

    /// Removes the earliest timer due at or before `until` and moves the
    /// clock to its due time. Ties fire in scheduling order.
    pub fn pop_due(&mut self, until: Duration) -> Option<TimerId> {
        let (index, _) = self
            .queue
            .iter()
            .enumerate()
            .filter(|(_, (due, _))| *due <= until)
            .min_by_key(|(index, (due, _))| (*due, *index))?;
        let (due, id) = self.queue.remove(index);
        self.elapsed = self.elapsed.max(due);
        Some(id)
    }

    /// Moves the clock forward without firing anything
    pub fn set_elapsed(&mut self, elapsed: Duration) {
        self.elapsed = self.elapsed.max(elapsed);
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> Instant {
        self.origin + self.elapsed
    }

    fn schedule(&mut self, id: TimerId, after: Duration) {
        self.queue.retain(|(_, queued)| queued != &id);
        self.queue.push((self.elapsed + after, id));
    }

    fn cancel(&mut self, id: &TimerId) {
        self.queue.retain(|(_, queued)| queued != id);
    }
}

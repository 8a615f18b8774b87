use crate::player::AutoPlayer;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use shared::codec::{read_packet, write_packet, CodecError};
use shared::{
    timestamp_ms, MiniGameKind, Packet, ParticipantId, RoundDriver, SessionState, Standing,
};
use std::time::{Duration, Instant};
use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;

pub type ClientResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// How a bot identifies itself and plays
#[derive(Debug, Clone)]
pub struct BotOptions {
    pub participant_id: ParticipantId,
    pub name: String,
    /// Always vote for this kind; random when unset
    pub vote: Option<MiniGameKind>,
    /// Spread of press timing around each cue's target
    pub jitter_ms: u64,
    /// Ask the server to open voting once identified
    pub start: bool,
    pub frame: Duration,
    pub seed: Option<u64>,
}

impl BotOptions {
    pub fn new(participant_id: impl Into<ParticipantId>) -> Self {
        let participant_id = participant_id.into();
        Self {
            name: participant_id.clone(),
            participant_id,
            vote: None,
            jitter_ms: 60,
            start: false,
            frame: Duration::from_millis(16),
            seed: None,
        }
    }
}

struct ActiveRound {
    round: u32,
    driver: RoundDriver,
    started: Instant,
    reported: bool,
}

pub struct Client {
    options: BotOptions,
    writer: OwnedWriteHalf,
    incoming: mpsc::UnboundedReceiver<Packet>,
    reader: JoinHandle<()>,

    player: AutoPlayer,
    rng: StdRng,
    round: Option<ActiveRound>,
    rounds_played: u32,
    ranking: Option<Vec<Standing>>,

    ping_ms: u64,
}

impl Client {
    pub async fn connect(server_addr: &str, options: BotOptions) -> ClientResult<Self> {
        info!("Connecting to {}...", server_addr);
        let stream = TcpStream::connect(server_addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, writer) = stream.into_split();

        // read_packet is not cancel safe, so frames are read on their own task
        let (packet_tx, incoming) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                match read_packet(&mut reader).await {
                    Ok(packet) => {
                        if packet_tx.send(packet).is_err() {
                            break;
                        }
                    }
                    Err(CodecError::Malformed(e)) => warn!("Dropping malformed packet: {}", e),
                    Err(CodecError::Closed) => break,
                    Err(e) => {
                        warn!("Lost connection to server: {}", e);
                        break;
                    }
                }
            }
        });

        let mut rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let player = AutoPlayer::new(options.jitter_ms, StdRng::seed_from_u64(rng.gen()));

        Ok(Client {
            options,
            writer,
            incoming,
            reader,
            player,
            rng,
            round: None,
            rounds_played: 0,
            ranking: None,
            ping_ms: 0,
        })
    }

    pub fn rounds_played(&self) -> u32 {
        self.rounds_played
    }

    pub fn ping_ms(&self) -> u64 {
        self.ping_ms
    }

    async fn send_packet(&mut self, packet: &Packet) -> ClientResult<()> {
        write_packet(&mut self.writer, packet).await?;
        Ok(())
    }

    fn pick_vote(&mut self) -> MiniGameKind {
        match self.options.vote {
            Some(kind) => kind,
            None => *MiniGameKind::ALL
                .choose(&mut self.rng)
                .unwrap_or(&MiniGameKind::Gyeokdol),
        }
    }

    /// Returns false once the session is over
    async fn handle_packet(&mut self, packet: Packet) -> ClientResult<bool> {
        match packet {
            Packet::Identified {
                participant_id,
                state,
            } => {
                info!("Identified as {} (session {})", participant_id, state);
                if self.options.start && state == SessionState::Idle {
                    self.send_packet(&Packet::StartGame).await?;
                }
            }

            Packet::VotingStarted {
                round,
                duration_seconds,
            } => {
                let kind = self.pick_vote();
                info!(
                    "Voting for round {} open for {}s, voting {}",
                    round, duration_seconds, kind
                );
                self.send_packet(&Packet::Vote {
                    game_mode: kind.as_str().to_string(),
                })
                .await?;
            }

            Packet::VoteUpdate { votes } => {
                debug!("Votes: {:?}", votes);
            }

            Packet::VotingEnded {
                round,
                selected_mode,
                ..
            } => {
                info!("Round {} will play {}", round, selected_mode);
            }

            Packet::RoundStarted { round, mode } => {
                debug!("Round {} started ({})", round, mode);
            }

            Packet::RoundInit {
                round,
                mode,
                pattern,
            } => {
                if self.round.as_ref().is_some_and(|active| active.round == round) {
                    return Ok(true);
                }
                info!("Playing {} with {} cues", mode, pattern.len());
                self.round = Some(ActiveRound {
                    round,
                    driver: RoundDriver::new(self.options.participant_id.clone(), pattern),
                    started: Instant::now(),
                    reported: false,
                });
            }

            Packet::RoundEnded { round, results } => {
                let me = &self.options.participant_id;
                match results.iter().position(|entry| &entry.participant_id == me) {
                    Some(place) => {
                        let entry = &results[place];
                        info!(
                            "Round {}: placed {} with {} (+{}, total {})",
                            round,
                            place + 1,
                            entry.score,
                            entry.points_awarded,
                            entry.total_score
                        );
                    }
                    None => info!("Round {} ended", round),
                }
                self.round = None;
            }

            Packet::GameEnded { ranking, .. } => {
                for (place, standing) in ranking.iter().enumerate() {
                    info!("{}. {} - {}", place + 1, standing.name, standing.score);
                }
                self.ranking = Some(ranking);
                return Ok(false);
            }

            Packet::GameReset => {
                info!("Session was reset");
                self.round = None;
                self.rounds_played = 0;
                if self.options.start {
                    self.send_packet(&Packet::StartGame).await?;
                }
            }

            Packet::UserDisconnected { participant_id } => {
                info!("{} disconnected", participant_id);
            }

            Packet::ParticipantList { participants } => {
                debug!("{} participants", participants.len());
            }

            Packet::Status { message } => {
                warn!("Server: {}", message);
            }

            Packet::Heartbeat { timestamp } => {
                self.ping_ms = timestamp_ms().saturating_sub(timestamp);
            }

            other => {
                warn!("Unexpected packet: {:?}", other);
            }
        }

        Ok(true)
    }

    /// Advances the local round and reports the outcome once it exists
    async fn update_round(&mut self) -> ClientResult<()> {
        let report = match self.round.as_mut() {
            Some(active) if !active.reported => {
                let now_ms = active.started.elapsed().as_secs_f64() * 1000.0;
                self.player.step(&mut active.driver, now_ms);
                match active.driver.outcome() {
                    Some(outcome) => {
                        active.reported = true;
                        Some(outcome.clone())
                    }
                    None => None,
                }
            }
            _ => None,
        };

        if let Some(outcome) = report {
            info!(
                "Finished {} (success: {}, score: {}, {}ms)",
                outcome.kind, outcome.success, outcome.score, outcome.elapsed_ms
            );
            self.rounds_played += 1;
            self.send_packet(&Packet::GameResult {
                game_mode: outcome.kind.as_str().to_string(),
                score: outcome.score,
                time_ms: outcome.elapsed_ms,
                success: outcome.success,
                judgments: outcome.judgments,
            })
            .await?;
        }
        Ok(())
    }

    /// Plays until the session ends. Returns the final ranking, or None if
    /// the server went away first.
    pub async fn run(&mut self) -> ClientResult<Option<Vec<Standing>>> {
        let identify = Packet::Identify {
            participant_id: self.options.participant_id.clone(),
            name: self.options.name.clone(),
        };
        self.send_packet(&identify).await?;

        let mut frame_interval = interval(self.options.frame);
        let mut heartbeat_interval = interval(HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                packet = self.incoming.recv() => {
                    match packet {
                        Some(packet) => {
                            if !self.handle_packet(packet).await? {
                                break;
                            }
                        },
                        None => {
                            warn!("Server closed the connection");
                            break;
                        }
                    }
                },

                _ = frame_interval.tick() => {
                    self.update_round().await?;
                },

                _ = heartbeat_interval.tick() => {
                    self.send_packet(&Packet::Heartbeat { timestamp: timestamp_ms() }).await?;
                },
            }
        }

        Ok(self.ranking.take())
    }

    /// Announces departure so the server skips the reconnect grace
    pub async fn leave(&mut self) -> ClientResult<()> {
        let packet = Packet::UserLeave {
            participant_id: self.options.participant_id.clone(),
        };
        self.send_packet(&packet).await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

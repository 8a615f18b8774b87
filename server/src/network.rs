//! Server network layer: TCP connections feeding the session orchestrator

use crate::client_manager::{ClientManager, Connection, ConnectionId};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::orchestrator::SessionOrchestrator;
use crate::timers::{TimerId, TokioScheduler};
use log::{debug, error, info, warn};
use shared::codec::{read_packet, write_packet, CodecError};
use shared::{MiniGameKind, Packet, ParticipantId, RoundOutcome};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::interval;

pub type ServerResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Messages sent from network and timer tasks to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    Accepted {
        stream: TcpStream,
        addr: SocketAddr,
    },
    PacketReceived {
        connection_id: ConnectionId,
        packet: Packet,
    },
    ConnectionClosed {
        connection_id: ConnectionId,
    },
    TimerFired(TimerId),
    Shutdown,
}

/// Session server. Owns the connection registry and the orchestrator; both
/// are only touched from [`Server::run`].
pub struct Server {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    clients: ClientManager,
    session: SessionOrchestrator<TokioScheduler>,
    heartbeat_timeout: Duration,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Server {
    /// Binds the listening socket and builds an idle session
    ///
    /// Session timers are scheduled on the tokio runtime and fire back into
    /// this server's own message channel. Nothing is accepted until
    /// [`Server::run`] is called.
    pub async fn new(addr: &str, config: SessionConfig) -> ServerResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Server listening on {}", local_addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let scheduler = TokioScheduler::new(server_tx.clone());

        Ok(Server {
            listener: Some(listener),
            local_addr,
            clients: ClientManager::new(config.max_connections),
            heartbeat_timeout: config.heartbeat_timeout,
            session: SessionOrchestrator::new(config, scheduler),
            server_tx,
            server_rx,
        })
    }

    /// Address actually bound, useful when listening on port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for injecting messages, e.g. [`ServerMessage::Shutdown`]
    pub fn handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns task that accepts incoming connections
    ///
    /// Accepted sockets are handed to the main loop rather than registered
    /// here, so the connection registry is only ever touched from one task.
    /// Runs at most once; the listener is moved into the task.
    fn spawn_acceptor(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if let Err(e) = server_tx.send(ServerMessage::Accepted { stream, addr }) {
                            error!("Failed to hand connection to main loop: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Registers a connection and spawns its reader and writer tasks
    ///
    /// The reader decodes frames and forwards them to the main loop; the
    /// writer drains the connection's outgoing queue. When the server is
    /// full the socket gets a single `Status` packet and is closed.
    fn register_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        let (packet_tx, mut packet_rx) = mpsc::unbounded_channel::<Packet>();
        let Some(connection_id) = self.clients.add_connection(addr, packet_tx) else {
            warn!("Rejecting {}: server full", addr);
            tokio::spawn(async move {
                let mut stream = stream;
                let full = Packet::Status {
                    message: "Server full".to_string(),
                };
                let _ = write_packet(&mut stream, &full).await;
            });
            return;
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle for {}: {}", addr, e);
        }
        let (read_half, mut write_half) = stream.into_split();

        tokio::spawn(async move {
            while let Some(packet) = packet_rx.recv().await {
                if let Err(e) = write_packet(&mut write_half, &packet).await {
                    warn!("Failed to write to connection {}: {}", connection_id, e);
                    break;
                }
            }
        });

        let server_tx = self.server_tx.clone();
        let reader = tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                match read_packet(&mut reader).await {
                    Ok(packet) => {
                        let message = ServerMessage::PacketReceived {
                            connection_id,
                            packet,
                        };
                        if server_tx.send(message).is_err() {
                            return;
                        }
                    }
                    Err(CodecError::Malformed(e)) => {
                        warn!("Dropping malformed packet from {}: {}", connection_id, e);
                    }
                    Err(CodecError::Closed) => break,
                    Err(e) => {
                        warn!("Connection {} failed: {}", connection_id, e);
                        break;
                    }
                }
            }
            let _ = server_tx.send(ServerMessage::ConnectionClosed { connection_id });
        });
        self.clients.attach_reader(connection_id, reader);
    }

    /// Processes one incoming packet on behalf of its connection
    ///
    /// Session events are forwarded to the orchestrator. A rejected event
    /// is answered with a `Status` packet to the sender only; everyone
    /// else never hears about it.
    fn handle_packet(&mut self, connection_id: ConnectionId, packet: Packet) {
        self.clients.touch(connection_id);

        let result = match packet {
            Packet::Identify {
                participant_id,
                name,
            } => {
                self.identify(connection_id, participant_id, &name);
                Ok(())
            }

            Packet::Vote { game_mode } => {
                let participant = self.participant_for(connection_id);
                self.session.cast_vote(&participant, &game_mode)
            }

            Packet::GameResult {
                game_mode,
                score,
                time_ms,
                success,
                judgments,
            } => {
                let participant = self.participant_for(connection_id);
                game_mode
                    .parse::<MiniGameKind>()
                    .map_err(SessionError::from)
                    .and_then(|kind| {
                        self.session.submit_result(RoundOutcome {
                            participant_id: participant,
                            kind,
                            success,
                            score,
                            elapsed_ms: time_ms,
                            judgments,
                        })
                    })
            }

            Packet::StartGame => self.session.start_voting(),

            Packet::RestartGame => {
                self.session.reset();
                Ok(())
            }

            Packet::UserLeave { participant_id } => {
                if self.clients.participant_of(connection_id) == Some(&participant_id) {
                    self.clients.unbind(connection_id);
                    self.session.leave(&participant_id)
                } else {
                    Err(SessionError::UnknownParticipant(participant_id))
                }
            }

            Packet::Heartbeat { timestamp } => {
                self.clients
                    .send_to(connection_id, Packet::Heartbeat { timestamp });
                Ok(())
            }

            other => {
                warn!(
                    "Unexpected packet type from connection {}: {:?}",
                    connection_id, other
                );
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("Rejected event from connection {}: {}", connection_id, e);
            self.clients.send_to(
                connection_id,
                Packet::Status {
                    message: e.to_string(),
                },
            );
        }
    }

    /// Binds the connection to a participant and brings it up to date
    ///
    /// Sends `Identified` followed by whatever packets the newcomer needs
    /// for the current phase. A connection that switches identity releases
    /// the participant it spoke for before.
    fn identify(&mut self, connection_id: ConnectionId, participant_id: ParticipantId, name: &str) {
        if let Some(previous) = self.clients.bind(connection_id, participant_id.clone()) {
            if previous != participant_id {
                self.release_participant(&previous);
            }
        }
        self.session.join(&participant_id, name);

        self.clients.send_to(
            connection_id,
            Packet::Identified {
                participant_id,
                state: self.session.state(),
            },
        );
        for packet in self.session.catch_up() {
            self.clients.send_to(connection_id, packet);
        }
    }

    /// Participant the connection speaks for, inventing a guest identity if
    /// it never identified
    fn participant_for(&mut self, connection_id: ConnectionId) -> ParticipantId {
        if let Some(participant) = self.clients.participant_of(connection_id) {
            return participant.clone();
        }
        let guest = format!("{:08x}", rand::random::<u32>());
        info!(
            "Connection {} sent an event before identifying; using {}",
            connection_id, guest
        );
        self.clients.bind(connection_id, guest.clone());
        guest
    }

    /// Forgets a connection whose reader reported it closed
    fn drop_connection(&mut self, connection_id: ConnectionId) {
        if let Some(connection) = self.clients.remove_connection(connection_id) {
            self.connection_lost(connection);
        }
    }

    fn connection_lost(&mut self, connection: Connection) {
        if let Some(participant) = &connection.participant {
            self.release_participant(participant);
        }
    }

    /// Marks a participant disconnected once none of its connections remain
    fn release_participant(&mut self, participant: &str) {
        if self.clients.connections_for(participant) > 0 {
            return;
        }
        if let Err(e) = self.session.participant_disconnected(participant) {
            debug!("Release of {} ignored: {}", participant, e);
        }
    }

    /// Sends everything the orchestrator queued to every connection
    fn flush_broadcasts(&mut self) {
        for packet in self.session.take_broadcasts() {
            self.clients.broadcast(&packet);
        }
    }

    /// Main server loop: every session event is handled here, one at a time
    ///
    /// Selects over the message channel (accepts, packets, closes, timer
    /// firings) and a one second interval that sweeps silent connections.
    /// Broadcasts are flushed after each message so they go out in the
    /// order the session produced them. Returns on
    /// [`ServerMessage::Shutdown`].
    pub async fn run(&mut self) -> ServerResult<()> {
        self.spawn_acceptor();

        let mut timeout_interval = interval(Duration::from_secs(1));

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::Accepted { stream, addr }) => {
                            self.register_connection(stream, addr);
                        },
                        Some(ServerMessage::PacketReceived { connection_id, packet }) => {
                            debug!("Connection {} sent {:?}", connection_id, packet);
                            self.handle_packet(connection_id, packet);
                        },
                        Some(ServerMessage::ConnectionClosed { connection_id }) => {
                            self.drop_connection(connection_id);
                        },
                        Some(ServerMessage::TimerFired(id)) => {
                            self.session.on_timer(id);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = timeout_interval.tick() => {
                    for connection in self.clients.check_timeouts(self.heartbeat_timeout) {
                        self.connection_lost(connection);
                    }
                },
            }

            self.flush_broadcasts();
        }

        Ok(())
    }
}

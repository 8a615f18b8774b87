//! Connection registry for the session server
//!
//! Tracks every open TCP connection, which participant (if any) it speaks
//! for, and when it was last heard from. A participant may hold several
//! connections; they only count as gone once the last one closes.

use log::{debug, info, warn};
use shared::{Packet, ParticipantId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type ConnectionId = u64;

/// One open connection and its outgoing queue
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    /// Last time we received any packet on this connection
    pub last_seen: Instant,
    /// Participant bound by an identity handshake
    pub participant: Option<ParticipantId>,
    sender: mpsc::UnboundedSender<Packet>,
    reader: Option<JoinHandle<()>>,
}

impl Connection {
    /// Creates a connection entry that has just been heard from
    pub fn new(id: ConnectionId, addr: SocketAddr, sender: mpsc::UnboundedSender<Packet>) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            participant: None,
            sender,
            reader: None,
        }
    }

    /// Queues a packet for the connection's writer task
    pub fn send(&self, packet: Packet) -> bool {
        self.sender.send(packet).is_ok()
    }

    /// Checks if nothing has arrived on this connection for `timeout`
    ///
    /// Any packet counts, heartbeats included, so an idle but healthy
    /// client stays alive as long as its heartbeat interval is shorter.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Registry of every open connection
///
/// Owns the outgoing queue of each connection and the participant it is
/// bound to. Capacity is enforced per connection rather than per
/// participant, since one participant may reconnect before the old socket
/// has been noticed as closed.
pub struct ClientManager {
    /// Open connections indexed by their id
    connections: HashMap<ConnectionId, Connection>,
    /// Next id handed out; ids are never reused
    next_connection_id: ConnectionId,
    /// Connections refused beyond this many
    max_connections: usize,
}

impl ClientManager {
    /// Creates an empty registry with the given capacity
    ///
    /// Connection ids start at 1 and increase for every accepted socket.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            next_connection_id: 1,
            max_connections,
        }
    }

    /// Registers a newly accepted connection
    ///
    /// Assigns the next connection id and stores the sender half of the
    /// connection's outgoing queue. Returns None when the server is at
    /// capacity; the caller is expected to close the socket.
    pub fn add_connection(
        &mut self,
        addr: SocketAddr,
        sender: mpsc::UnboundedSender<Packet>,
    ) -> Option<ConnectionId> {
        if self.connections.len() >= self.max_connections {
            return None;
        }

        let id = self.next_connection_id;
        self.next_connection_id += 1;

        info!("Connection {} opened from {}", id, addr);
        self.connections.insert(id, Connection::new(id, addr, sender));
        Some(id)
    }

    /// Ties the reader task's lifetime to the connection entry
    ///
    /// The task is aborted when the entry is dropped. If the connection
    /// is already gone the task is aborted right away.
    pub fn attach_reader(&mut self, id: ConnectionId, reader: JoinHandle<()>) {
        match self.connections.get_mut(&id) {
            Some(connection) => connection.reader = Some(reader),
            None => reader.abort(),
        }
    }

    /// Removes a connection, returning it so the caller can release its
    /// participant binding
    pub fn remove_connection(&mut self, id: ConnectionId) -> Option<Connection> {
        let connection = self.connections.remove(&id)?;
        info!("Connection {} from {} closed", id, connection.addr);
        Some(connection)
    }

    /// Marks the connection as heard from now
    pub fn touch(&mut self, id: ConnectionId) {
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.last_seen = Instant::now();
        }
    }

    /// Binds `id` to a participant, returning the one it spoke for before
    ///
    /// A connection speaks for at most one participant. Identifying again
    /// under a different id moves the binding and hands back the old id so
    /// the server can treat it as disconnected.
    pub fn bind(&mut self, id: ConnectionId, participant: ParticipantId) -> Option<ParticipantId> {
        let connection = self.connections.get_mut(&id)?;
        debug!("Connection {} speaks for {}", id, participant);
        connection.participant.replace(participant)
    }

    /// Clears the binding of `id` without closing the connection
    pub fn unbind(&mut self, id: ConnectionId) -> Option<ParticipantId> {
        self.connections.get_mut(&id)?.participant.take()
    }

    /// Participant the connection currently speaks for, if any
    pub fn participant_of(&self, id: ConnectionId) -> Option<&ParticipantId> {
        self.connections.get(&id)?.participant.as_ref()
    }

    /// Counts open connections bound to `participant`
    ///
    /// A participant is only considered disconnected once this drops to
    /// zero.
    pub fn connections_for(&self, participant: &str) -> usize {
        self.connections
            .values()
            .filter(|c| c.participant.as_deref() == Some(participant))
            .count()
    }

    /// Queues a packet for a single connection
    ///
    /// Returns false if the connection is unknown or its writer task has
    /// already exited.
    pub fn send_to(&self, id: ConnectionId, packet: Packet) -> bool {
        match self.connections.get(&id) {
            Some(connection) => connection.send(packet),
            None => false,
        }
    }

    /// Queues `packet` on every open connection
    ///
    /// Connections whose writer has exited are logged and skipped; they
    /// get cleaned up when their reader reports the close.
    pub fn broadcast(&self, packet: &Packet) {
        for connection in self.connections.values() {
            if !connection.send(packet.clone()) {
                warn!("Writer for connection {} is gone", connection.id);
            }
        }
    }

    /// Removes and returns connections silent for longer than `timeout`
    ///
    /// Called periodically by the server loop. Dropping the returned
    /// entries aborts their reader tasks.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<Connection> {
        let timed_out: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.is_timed_out(timeout))
            .map(|c| c.id)
            .collect();

        timed_out
            .into_iter()
            .filter_map(|id| {
                info!("Connection {} timed out", id);
                self.remove_connection(id)
            })
            .collect()
    }

    /// Number of open connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

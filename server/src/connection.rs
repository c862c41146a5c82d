//! Registry of live socket connections.
//!
//! Connections are identified by monotonically increasing ids that are never
//! reused. A connection starts anonymous, gains an identity on login and may
//! then occupy at most one seat in one session.

use crate::clock::ClockSync;
use log::debug;
use shared::{Identity, SeatId, ServerMessage, SessionToken};
use std::collections::HashMap;
use tokio::sync::mpsc;

pub type ConnectionId = u64;

/// Cloneable handle onto a connection's writer task. Sends never block;
/// messages for a closed connection are dropped.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl Outbox {
    pub fn new(tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Outbox { tx }
    }

    pub fn send(&self, message: ServerMessage) {
        if self.tx.send(message).is_err() {
            debug!("Writer gone, dropping outbound message");
        }
    }
}

/// The seat a connection occupies inside a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatRef {
    pub session: SessionToken,
    pub seat: SeatId,
}

#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub address: String,
    pub outbox: Outbox,
    pub clock: ClockSync,
    pub identity: Option<Identity>,
    pub seat: Option<SeatRef>,
}

impl Connection {
    pub fn is_logged_in(&self) -> bool {
        self.identity.is_some()
    }

    pub fn display_name(&self) -> &str {
        self.identity
            .as_ref()
            .map(|identity| identity.username.as_str())
            .unwrap_or(self.address.as_str())
    }
}

#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: HashMap<ConnectionId, Connection>,
    next_id: ConnectionId,
}

impl ConnectionTable {
    pub fn new() -> Self {
        ConnectionTable {
            connections: HashMap::new(),
            next_id: 0,
        }
    }

    /// Registers a connection and hands out its id. Ids are never reused,
    /// so a stale id can always be told apart from a new connection.
    pub fn add(&mut self, address: String, outbox: Outbox) -> ConnectionId {
        self.next_id += 1;
        let id = self.next_id;
        self.connections.insert(
            id,
            Connection {
                id,
                address,
                outbox,
                clock: ClockSync::new(),
                identity: None,
                seat: None,
            },
        );
        id
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn set_seat(&mut self, id: ConnectionId, seat: SeatRef) {
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.seat = Some(seat);
        }
    }

    pub fn clear_seat(&mut self, id: ConnectionId) {
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.seat = None;
        }
    }

    pub fn ping_of(&self, id: ConnectionId) -> i64 {
        self.get(id).map(|c| c.clock.ping()).unwrap_or(0)
    }

    pub fn offset_of(&self, id: ConnectionId) -> i64 {
        self.get(id).map(|c| c.clock.offset()).unwrap_or(0)
    }

    pub fn is_synced(&self, id: ConnectionId) -> bool {
        self.get(id).map(|c| c.clock.is_synced()).unwrap_or(false)
    }

    /// True when any live connection is logged in under `identifier`.
    pub fn identifier_in_use(&self, identifier: &str) -> bool {
        self.connections.values().any(|connection| {
            connection
                .identity
                .as_ref()
                .map_or(false, |identity| identity.identifier == identifier)
        })
    }
}

//! Transport boundary: live sockets, room membership and fan-out.
//!
//! The hub only talks to [`Transport`]; [`RoomTable`] is the in-process implementation backed
//! by one unbounded channel per socket, drained by the WebSocket writer task.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Frame queued for a socket's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized JSON text frame.
    Text(Arc<str>),
    /// Close the socket.
    Close,
}

/// Handles the socket task keeps for its own side of the transport.
pub struct Attachment {
    /// Frames to write to the socket.
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    /// Flips to `true` when the hub forces the connection closed.
    pub closed: watch::Receiver<bool>,
}

/// Room-based message channel the relay hub depends on.
pub trait Transport: Send + Sync {
    /// Register a live socket and return the receiving half of its queues.
    fn attach(&self, connection_id: &str) -> Attachment;
    /// Forget a socket and drop all of its room memberships.
    fn detach(&self, connection_id: &str);
    fn is_attached(&self, connection_id: &str) -> bool;
    fn join(&self, connection_id: &str, room: &str);
    fn leave(&self, connection_id: &str, room: &str);
    /// Queue a raw frame for one socket; `false` when the socket is gone.
    fn send_raw(&self, connection_id: &str, frame: Arc<str>) -> bool;
    /// Queue a frame for every member of `room` that is not in any of `except` rooms.
    fn broadcast_raw(&self, room: &str, except: &[&str], frame: Arc<str>) -> usize;
    /// Queue a frame for every attached socket.
    fn broadcast_all_raw(&self, frame: Arc<str>) -> usize;
    /// Stop processing for a socket and ask its writer to close it.
    fn disconnect(&self, connection_id: &str) -> bool;
    fn connection_count(&self) -> usize;
}

/// Serialize `value` once, or log and return `None`.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Option<Arc<str>> {
    match serde_json::to_string(value) {
        Ok(text) => Some(Arc::from(text)),
        Err(err) => {
            warn!(error = %err, "failed to serialize outbound message");
            None
        }
    }
}

/// Typed helpers layered on top of the raw [`Transport`] calls.
pub trait TransportExt: Transport {
    fn send<T: Serialize + ?Sized>(&self, connection_id: &str, value: &T) -> bool {
        encode(value).is_some_and(|frame| self.send_raw(connection_id, frame))
    }

    fn broadcast<T: Serialize + ?Sized>(&self, room: &str, except: &[&str], value: &T) -> usize {
        encode(value).map_or(0, |frame| self.broadcast_raw(room, except, frame))
    }

    fn broadcast_all<T: Serialize + ?Sized>(&self, value: &T) -> usize {
        encode(value).map_or(0, |frame| self.broadcast_all_raw(frame))
    }
}

impl<T: Transport + ?Sized> TransportExt for T {}

struct Member {
    tx: mpsc::UnboundedSender<Outbound>,
    closed: watch::Sender<bool>,
    rooms: DashSet<String>,
}

/// In-process [`Transport`] keeping membership in lock-free maps.
#[derive(Default)]
pub struct RoomTable {
    members: DashMap<String, Member>,
    rooms: DashMap<String, DashSet<String>>,
}

impl RoomTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Members of `room`, mostly useful for diagnostics and tests.
    pub fn room_members(&self, room: &str) -> Vec<String> {
        self.rooms
            .get(room)
            .map(|members| members.iter().map(|id| id.clone()).collect())
            .unwrap_or_default()
    }

    fn in_any(&self, connection_id: &str, rooms: &[&str]) -> bool {
        rooms.iter().any(|room| {
            self.rooms
                .get(*room)
                .is_some_and(|members| members.contains(connection_id))
        })
    }

    fn queue(&self, connection_id: &str, frame: Outbound) -> bool {
        let Some(tx) = self.members.get(connection_id).map(|m| m.tx.clone()) else {
            return false;
        };
        if tx.send(frame).is_err() {
            debug!(id = %connection_id, "writer closed; dropping frame");
            return false;
        }
        true
    }
}

impl Transport for RoomTable {
    fn attach(&self, connection_id: &str) -> Attachment {
        let (tx, outbound) = mpsc::unbounded_channel();
        let (closed_tx, closed) = watch::channel(false);
        let previous = self.members.insert(
            connection_id.to_string(),
            Member {
                tx,
                closed: closed_tx,
                rooms: DashSet::new(),
            },
        );
        if previous.is_some() {
            warn!(id = %connection_id, "replaced an attached socket with the same id");
        }
        Attachment { outbound, closed }
    }

    fn detach(&self, connection_id: &str) {
        let Some((_, member)) = self.members.remove(connection_id) else {
            return;
        };
        for room in member.rooms.iter() {
            let now_empty = self.rooms.get(room.as_str()).is_some_and(|members| {
                members.remove(connection_id);
                members.is_empty()
            });
            if now_empty {
                self.rooms.remove_if(room.as_str(), |_, members| members.is_empty());
            }
        }
    }

    fn is_attached(&self, connection_id: &str) -> bool {
        self.members.contains_key(connection_id)
    }

    fn join(&self, connection_id: &str, room: &str) {
        let Some(member) = self.members.get(connection_id) else {
            return;
        };
        member.rooms.insert(room.to_string());
        drop(member);
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection_id.to_string());
    }

    fn leave(&self, connection_id: &str, room: &str) {
        if let Some(member) = self.members.get(connection_id) {
            member.rooms.remove(room);
        }
        let now_empty = self.rooms.get(room).is_some_and(|members| {
            members.remove(connection_id);
            members.is_empty()
        });
        if now_empty {
            self.rooms.remove_if(room, |_, members| members.is_empty());
        }
    }

    fn send_raw(&self, connection_id: &str, frame: Arc<str>) -> bool {
        self.queue(connection_id, Outbound::Text(frame))
    }

    fn broadcast_raw(&self, room: &str, except: &[&str], frame: Arc<str>) -> usize {
        let targets: Vec<String> = match self.rooms.get(room) {
            Some(members) => members.iter().map(|id| id.clone()).collect(),
            None => return 0,
        };

        targets
            .into_iter()
            .filter(|id| !self.in_any(id, except))
            .filter(|id| self.queue(id, Outbound::Text(frame.clone())))
            .count()
    }

    fn broadcast_all_raw(&self, frame: Arc<str>) -> usize {
        let targets: Vec<String> = self.members.iter().map(|m| m.key().clone()).collect();
        targets
            .into_iter()
            .filter(|id| self.queue(id, Outbound::Text(frame.clone())))
            .count()
    }

    fn disconnect(&self, connection_id: &str) -> bool {
        let Some(member) = self.members.get(connection_id) else {
            return false;
        };
        let _ = member.closed.send(true);
        let _ = member.tx.send(Outbound::Close);
        true
    }

    fn connection_count(&self) -> usize {
        self.members.len()
    }
}

//! Topic rooms that fan job snapshots out to live connections.
//!
//! A room exists while it has members. Explicit unsubscribes leave at once;
//! an unexpected disconnect from a connection with a stable client id keeps
//! the membership for a grace window, so a reconnect under the same client
//! id within that window takes over the seat without the room noticing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::events::{EventBus, EventKind, ListenerId};
use crate::jobs::JobRegistry;
use crate::models::Job;
use crate::sync;

pub const DEFAULT_LEAVE_GRACE: Duration = Duration::from_secs(180);

const JOB_ROOM_PREFIX: &str = "download:";

pub fn room_for_job(job_id: &str) -> String {
    format!("{JOB_ROOM_PREFIX}{job_id}")
}

pub fn job_for_room(room: &str) -> Option<&str> {
    room.strip_prefix(JOB_ROOM_PREFIX).filter(|id| !id.is_empty())
}

/// Messages pushed to a connection.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Job {
        room: String,
        event: EventKind,
        job: Job
    },
    Status {
        room: String,
        job: Option<Job>
    },
    Error {
        message: String
    }
}

pub type ConnectionSender = mpsc::UnboundedSender<ServerMessage>;

/// Handle to one live connection's outbound queue.
#[derive(Debug, Clone)]
pub struct Connection {
    id: String,
    client_id: Option<String>,
    tx: ConnectionSender
}

impl Connection {
    pub fn new(id: impl Into<String>, client_id: Option<String>, tx: ConnectionSender) -> Self {
        Self {
            id: id.into(),
            client_id: client_id.filter(|c| !c.is_empty()),
            tx
        }
    }

    /// Creates a connection with a fresh id and returns its outbound receiver.
    pub fn channel(client_id: Option<String>) -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(uuid7::uuid7().to_string(), client_id, tx), rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

struct PendingLeave {
    client_id: String,
    timer: AbortHandle
}

/// Seats are keyed by connection id, so every live connection gets its own
/// even when several share a client id. Pending leaves are keyed by
/// `(room, connection id)` and remember the client id that may reclaim them.
#[derive(Default)]
struct Rooms {
    members: HashMap<String, HashMap<String, Connection>>,
    pending: HashMap<(String, String), PendingLeave>
}

impl Rooms {
    /// Drops the stale seats `client_id` left behind in `room`. Returns how
    /// many were reclaimed.
    fn reclaim(&mut self, room: &str, client_id: &str) -> usize {
        let stale: Vec<(String, String)> = self
            .pending
            .iter()
            .filter(|((r, _), leave)| r == room && leave.client_id == client_id)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &stale {
            if let Some(leave) = self.pending.remove(key) {
                leave.timer.abort();
            }
            self.remove_member(room, &key.1);
        }
        stale.len()
    }

    fn cancel_pending(&mut self, room: &str, conn_id: &str) {
        if let Some(leave) = self.pending.remove(&(room.to_string(), conn_id.to_string())) {
            leave.timer.abort();
        }
    }

    fn remove_member(&mut self, room: &str, conn_id: &str) -> bool {
        let Some(members) = self.members.get_mut(room) else {
            return false;
        };
        if members.remove(conn_id).is_none() {
            return false;
        }
        if members.is_empty() {
            self.members.remove(room);
            tracing::debug!(room = %room, "room deleted");
        }
        true
    }
}

pub struct RoomBroadcaster {
    rooms: Arc<Mutex<Rooms>>,
    registry: Arc<JobRegistry>,
    grace: Duration
}

impl RoomBroadcaster {
    pub fn new(registry: Arc<JobRegistry>, grace: Duration) -> Self {
        Self {
            rooms: Arc::new(Mutex::new(Rooms::default())),
            registry,
            grace
        }
    }

    /// Forwards every bus event to the job's room.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> ListenerId {
        let weak = Arc::downgrade(self);
        bus.on_any(move |event| {
            if let Some(rooms) = weak.upgrade() {
                let room = room_for_job(&event.job_id);
                rooms.publish_to_room(&room, &ServerMessage::Job {
                    room: room.clone(),
                    event: event.kind,
                    job: event.job.clone()
                });
            }
            Ok(())
        })
    }

    /// Joins `conn` to `room` and replays the job's latest snapshot to it.
    ///
    /// A connection carrying a client id takes over the seats that client
    /// left pending in this room. The replay is read and sent under the room
    /// lock so it cannot overtake a newer snapshot being published
    /// concurrently.
    pub fn subscribe(&self, room: &str, conn: &Connection) -> Option<Job> {
        let mut rooms = sync::lock(&self.rooms);
        if let Some(client_id) = conn.client_id() {
            if rooms.reclaim(room, client_id) > 0 {
                tracing::info!(room = %room, client = %client_id, "client rejoined within grace window");
            }
        }
        rooms
            .members
            .entry(room.to_string())
            .or_default()
            .insert(conn.id.clone(), conn.clone());

        let job = job_for_room(room).and_then(|id| self.registry.get(id));
        if let Some(job) = &job {
            conn.send(ServerMessage::Status {
                room: room.to_string(),
                job: Some(job.clone())
            });
        }
        job
    }

    pub fn unsubscribe(&self, room: &str, conn: &Connection) -> bool {
        let mut rooms = sync::lock(&self.rooms);
        rooms.cancel_pending(room, &conn.id);
        rooms.remove_member(room, &conn.id)
    }

    /// Handles an unexpected disconnect. Memberships of connections with a
    /// client id are kept for the grace window; others are dropped at once.
    pub fn disconnect(&self, conn: &Connection) {
        let runtime = tokio::runtime::Handle::try_current().ok();
        let mut rooms = sync::lock(&self.rooms);

        let joined: Vec<String> = rooms
            .members
            .iter()
            .filter(|(_, members)| members.contains_key(&conn.id))
            .map(|(room, _)| room.clone())
            .collect();

        for room in joined {
            match (&runtime, conn.client_id.as_ref()) {
                (Some(runtime), Some(client_id)) if !self.grace.is_zero() => {
                    let state = Arc::clone(&self.rooms);
                    let grace = self.grace;
                    let key = (room.clone(), conn.id.clone());
                    let timer_key = key.clone();
                    let timer = runtime.spawn(async move {
                        tokio::time::sleep(grace).await;
                        let mut rooms = sync::lock(&state);
                        if let Some(leave) = rooms.pending.remove(&timer_key) {
                            rooms.remove_member(&timer_key.0, &timer_key.1);
                            tracing::info!(room = %timer_key.0, client = %leave.client_id, "grace window expired");
                        }
                    });
                    let leave = PendingLeave {
                        client_id: client_id.clone(),
                        timer: timer.abort_handle()
                    };
                    if let Some(old) = rooms.pending.insert(key, leave) {
                        old.timer.abort();
                    }
                    tracing::debug!(room = %room, client = %client_id, "deferred leave scheduled");
                }
                _ => {
                    rooms.remove_member(&room, &conn.id);
                }
            }
        }
    }

    /// Sends the job's latest snapshot (or `null` when unknown) to `conn`.
    pub fn request_status(&self, room: &str, conn: &Connection) -> Option<Job> {
        let _rooms = sync::lock(&self.rooms);
        let job = job_for_room(room).and_then(|id| self.registry.get(id));
        conn.send(ServerMessage::Status {
            room: room.to_string(),
            job: job.clone()
        });
        job
    }

    /// Sends `message` to every open member and returns the delivery count.
    /// Closed members are pruned unless they sit in a grace window.
    pub fn publish_to_room(&self, room: &str, message: &ServerMessage) -> usize {
        let mut guard = sync::lock(&self.rooms);
        let rooms = &mut *guard;
        let Some(members) = rooms.members.get_mut(room) else {
            return 0;
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (conn_id, conn) in members.iter() {
            if conn.is_open() && conn.send(message.clone()) {
                delivered += 1;
            } else if !rooms.pending.contains_key(&(room.to_string(), conn_id.clone())) {
                closed.push(conn_id.clone());
            }
        }

        for conn_id in closed {
            members.remove(&conn_id);
            tracing::debug!(room = %room, conn_id = %conn_id, "pruned closed connection");
        }
        if members.is_empty() {
            rooms.members.remove(room);
        }
        delivered
    }

    pub fn room_count(&self) -> usize {
        sync::lock(&self.rooms).members.len()
    }

    pub fn member_count(&self, room: &str) -> usize {
        sync::lock(&self.rooms).members.get(room).map_or(0, HashMap::len)
    }

    pub fn has_pending_leave(&self, room: &str, client_id: &str) -> bool {
        sync::lock(&self.rooms)
            .pending
            .iter()
            .any(|((r, _), leave)| r == room && leave.client_id == client_id)
    }
}

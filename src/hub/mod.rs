//! Room Hub (C7, §4.7): in-memory collaboration rooms keyed by diagram id.
//!
//! All state-mutating operations run under a single coarse [`parking_lot::Mutex`]
//! guarding [`HubState`], per the explicit recommendation in spec §5 ("a
//! single coarse hub mutex is acceptable and recommended given the small
//! per-op work") — the same locking idiom [`crate::protected::ProtectedStorage`]
//! uses for its circuit-breaker state.

pub mod connection;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::auth::{Identity, Role};
use crate::codec::{
    self, ClientMessage, CursorPosition, DiagramChange, ParticipantInfo, RoomSnapshot, ServerMessage,
};
use crate::error::HubError;
use crate::protected::ProtectedStorage;

pub use connection::{Connection, NORMAL_CLOSURE_CODE};

/// Server ping cadence (§4.7, §6.1).
pub const PING_INTERVAL: Duration = Duration::from_secs(15);
/// Hard cap on live participants in a single room (§4.7 `JoinRoom`).
pub const MAX_PARTICIPANTS: usize = 50;
/// Rate-limit window width (§4.7 `CheckRateLimit`).
pub const WINDOW_MS: u64 = 1000;
/// Messages allowed per window before a warning is issued.
pub const MAX_MESSAGES: u32 = 20;
/// Warnings tolerated before the connection is closed.
pub const MAX_WARNINGS: u32 = 3;
/// Idle duration after which a participant is dropped from presence (§4.7).
pub const PRESENCE_TIMEOUT: Duration = Duration::from_secs(30);
/// How long an empty room survives before being reaped (§4.7).
pub const EMPTY_ROOM_TTL: Duration = Duration::from_secs(30 * 60);
/// Idle duration after which a connection itself is reaped (§4.7).
pub const CONNECTION_STALE_TIMEOUT: Duration = Duration::from_secs(90);

const PARTICIPANT_COLORS: &[&str] = &[
    "#ef4444", "#f97316", "#eab308", "#22c55e", "#06b6d4", "#3b82f6", "#8b5cf6", "#ec4899",
];

/// Identifies one registered connection. Opaque and process-local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

/// Outcome of [`Hub::check_rate_limit`] (§4.7 `CheckRateLimit`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitOutcome {
    /// Message may proceed to its handler.
    Allowed,
    /// Over the window limit; a warning frame was sent. Carries the warning count.
    Warned(u32),
    /// `MAX_WARNINGS` reached; an error frame was sent and the connection
    /// closed. The caller must stop reading from this connection.
    Exceeded,
}

struct Participant {
    connection_id: ConnectionId,
    id: String,
    name: String,
    color: String,
    cursor: Option<CursorPosition>,
    selection: Vec<String>,
    last_seen: Instant,
    user_id: Option<String>,
}

impl Participant {
    fn to_wire(&self) -> ParticipantInfo {
        ParticipantInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            color: self.color.clone(),
            cursor: self.cursor,
            selection: self.selection.clone(),
            last_seen: epoch_ms(),
            user_id: self.user_id.clone(),
        }
    }
}

struct Room {
    version: u64,
    participants: HashMap<ConnectionId, Participant>,
}

impl Room {
    fn new() -> Self {
        Self { version: 0, participants: HashMap::new() }
    }

    fn snapshot(&self, diagram_id: &str) -> RoomSnapshot {
        RoomSnapshot {
            diagram_id: diagram_id.to_string(),
            participants: self.participants.values().map(Participant::to_wire).collect(),
            version: self.version,
        }
    }
}

struct ConnectionState {
    participant_id: String,
    identity: Identity,
    conn: Arc<dyn Connection>,
    room: Option<String>,
    last_activity: Instant,
    rate_window_start: Instant,
    rate_count: u32,
    warnings: u32,
    ping_task: tokio::task::JoinHandle<()>,
}

struct HubState {
    rooms: HashMap<String, Room>,
    connections: HashMap<ConnectionId, ConnectionState>,
    room_connections: HashMap<String, HashSet<ConnectionId>>,
    empty_room_timestamps: HashMap<String, Instant>,
    color_index: usize,
}

fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// The real-time collaboration hub (C7). Cheap to share via `Arc`; every
/// public method locks the shared state internally for the duration of one
/// logical operation.
pub struct Hub {
    state: Mutex<HubState>,
    next_connection_id: AtomicU64,
    storage: Arc<ProtectedStorage>,
}

impl Hub {
    pub fn new(storage: Arc<ProtectedStorage>) -> Self {
        Self {
            state: Mutex::new(HubState {
                rooms: HashMap::new(),
                connections: HashMap::new(),
                room_connections: HashMap::new(),
                empty_room_timestamps: HashMap::new(),
                color_index: 0,
            }),
            next_connection_id: AtomicU64::new(1),
            storage,
        }
    }

    /// `Register(ws)` (§4.7): allocates a participant id, snapshots identity,
    /// and starts the per-connection ping emitter. The emitter holds only the
    /// `Connection` handle, never the hub, so it self-terminates on a dead
    /// peer without the hub's cleanup sweep having to reach it (§9 "Background
    /// timers and leak avoidance").
    pub fn register(&self, conn: Arc<dyn Connection>) -> ConnectionId {
        let identity = conn.identity();
        let id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let participant_id = uuid::Uuid::new_v4().simple().to_string();

        let ping_task = {
            let conn = conn.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(PING_INTERVAL).await;
                    if !conn.is_open() {
                        break;
                    }
                    conn.send(&codec::encode_server_message(&ServerMessage::Pong));
                }
            })
        };

        let now = Instant::now();
        let mut state = self.state.lock();
        state.connections.insert(
            id,
            ConnectionState {
                participant_id,
                identity,
                conn,
                room: None,
                last_activity: now,
                rate_window_start: now,
                rate_count: 0,
                warnings: 0,
                ping_task,
            },
        );
        id
    }

    /// `Disconnect(ws)` (§4.7): stops the ping emitter, leaves any room, and
    /// drops connection state.
    pub fn disconnect(&self, id: ConnectionId) {
        self.leave_room(id);
        let mut state = self.state.lock();
        if let Some(conn_state) = state.connections.remove(&id) {
            conn_state.ping_task.abort();
        }
    }

    /// `JoinRoom(ws, diagramId, name)` (§4.7).
    pub fn join_room(&self, id: ConnectionId, diagram_id: String, name: String) -> Result<(), HubError> {
        self.leave_room(id);

        let mut state = self.state.lock();
        if !state.connections.contains_key(&id) {
            return Err(HubError::NotRegistered);
        }

        let room = state.rooms.entry(diagram_id.clone()).or_insert_with(Room::new);
        if room.participants.len() >= MAX_PARTICIPANTS {
            return Err(HubError::RoomFull);
        }

        let color_idx = state.color_index;
        state.color_index = (state.color_index + 1) % PARTICIPANT_COLORS.len();
        let color = PARTICIPANT_COLORS[color_idx].to_string();

        let conn_state = state.connections.get_mut(&id).expect("checked above");
        conn_state.room = Some(diagram_id.clone());
        let participant = Participant {
            connection_id: id,
            id: conn_state.participant_id.clone(),
            name,
            color,
            cursor: None,
            selection: Vec::new(),
            last_seen: Instant::now(),
            user_id: conn_state.identity.user_id.clone(),
        };
        let wire_participant = participant.to_wire();

        let room = state.rooms.get_mut(&diagram_id).expect("just inserted");
        room.participants.insert(id, participant);
        let snapshot = room.snapshot(&diagram_id);

        state.room_connections.entry(diagram_id.clone()).or_default().insert(id);
        state.empty_room_timestamps.remove(&diagram_id);

        let joiner_conn = state.connections[&id].conn.clone();
        joiner_conn.send(&codec::encode_server_message(&ServerMessage::Joined {
            participant: wire_participant.clone(),
            room: snapshot,
        }));

        drop(state);
        self.broadcast(&diagram_id, &ServerMessage::ParticipantJoined { participant: wire_participant }, Some(id));
        Ok(())
    }

    /// `LeaveRoom(ws)` (§4.7).
    pub fn leave_room(&self, id: ConnectionId) {
        let (diagram_id, participant_id, became_empty) = {
            let mut state = self.state.lock();
            let Some(conn_state) = state.connections.get_mut(&id) else { return };
            let Some(diagram_id) = conn_state.room.take() else { return };

            let Some(room) = state.rooms.get_mut(&diagram_id) else { return (diagram_id, String::new(), false) };
            let participant_id = room.participants.remove(&id).map(|p| p.id).unwrap_or_default();
            if let Some(conns) = state.room_connections.get_mut(&diagram_id) {
                conns.remove(&id);
            }
            let became_empty = room.participants.is_empty();
            if became_empty {
                state.empty_room_timestamps.insert(diagram_id.clone(), Instant::now());
            }
            (diagram_id, participant_id, became_empty)
        };

        if !participant_id.is_empty() {
            self.broadcast(&diagram_id, &ServerMessage::ParticipantLeft { participant_id }, None);
        }
        let _ = became_empty;
    }

    /// `UpdateCursor(ws, x, y)` (§4.7).
    pub fn update_cursor(&self, id: ConnectionId, cursor: CursorPosition) {
        let (diagram_id, participant_id) = {
            let mut state = self.state.lock();
            let Some(conn_state) = state.connections.get_mut(&id) else { return };
            conn_state.last_activity = Instant::now();
            let Some(diagram_id) = conn_state.room.clone() else { return };
            let Some(room) = state.rooms.get_mut(&diagram_id) else { return };
            let Some(p) = room.participants.get_mut(&id) else { return };
            p.cursor = Some(cursor);
            p.last_seen = Instant::now();
            (diagram_id, p.id.clone())
        };
        self.broadcast(&diagram_id, &ServerMessage::CursorUpdate { participant_id, cursor }, Some(id));
    }

    /// `UpdateSelection(ws, nodeIds)` (§4.7).
    pub fn update_selection(&self, id: ConnectionId, node_ids: Vec<String>) {
        let (diagram_id, participant_id, echoed) = {
            let mut state = self.state.lock();
            let Some(conn_state) = state.connections.get_mut(&id) else { return };
            conn_state.last_activity = Instant::now();
            let Some(diagram_id) = conn_state.room.clone() else { return };
            let Some(room) = state.rooms.get_mut(&diagram_id) else { return };
            let Some(p) = room.participants.get_mut(&id) else { return };
            p.selection = node_ids.clone();
            p.last_seen = Instant::now();
            (diagram_id, p.id.clone(), node_ids)
        };
        self.broadcast(
            &diagram_id,
            &ServerMessage::SelectionUpdate { participant_id, node_ids: echoed },
            Some(id),
        );
    }

    /// `HandleChanges(ws, changes, baseVersion)` (§4.7).
    ///
    /// The hub's `room.version` is validated and bumped purely in memory; the
    /// room is the authority for broadcast ordering. The corresponding
    /// storage write happens afterward via [`crate::storage::Storage::transform`]
    /// and is best-effort — its failure is logged, not propagated to the
    /// room, since the room's version sequence has already been committed to
    /// every connected client by the time the write could fail (§5 "a REST
    /// update followed by a `sync` broadcast is not atomic").
    pub fn handle_changes(&self, id: ConnectionId, changes: Vec<DiagramChange>, base_version: u64) {
        let (diagram_id, participant_id, new_version, accepted) = {
            let mut state = self.state.lock();
            let Some(conn_state) = state.connections.get_mut(&id) else { return };
            conn_state.last_activity = Instant::now();
            let Some(diagram_id) = conn_state.room.clone() else {
                conn_state.conn.send(&codec::encode_server_message(&ServerMessage::error(
                    HubError::NotInRoom.code(),
                    HubError::NotInRoom,
                )));
                return;
            };
            let participant_id = state.connections[&id].participant_id.clone();
            let room = state.rooms.get_mut(&diagram_id).expect("connection's room must exist");
            if base_version != room.version {
                let current_version = room.version;
                state.connections[&id].conn.send(&codec::encode_server_message(&ServerMessage::Conflict {
                    message: "baseVersion does not match the room's current version".into(),
                    current_version,
                }));
                (diagram_id, participant_id, current_version, false)
            } else {
                room.version += 1;
                (diagram_id, participant_id, room.version, true)
            }
        };

        if !accepted {
            return;
        }

        self.broadcast(
            &diagram_id,
            &ServerMessage::Changes { changes: changes.clone(), author: participant_id, version: new_version },
            None,
        );

        let storage = self.storage.clone();
        let diagram_id_for_write = diagram_id.clone();
        tokio::spawn(async move {
            let result = storage
                .transform(
                    diagram_id_for_write.clone(),
                    move |mut spec| {
                        for change in changes.clone() {
                            if let Err(e) = codec::apply_change(&mut spec, change) {
                                tracing::warn!(diagram_id = %diagram_id_for_write, error = %e, "dropped invalid change during persist");
                            }
                        }
                        spec
                    },
                    Some("collaborative edit".into()),
                    3,
                )
                .await;
            if let Err(e) = result {
                tracing::warn!(diagram_id = %diagram_id, error = %e, "failed to persist hub change batch");
            }
        });
    }

    /// `BroadcastSync(diagramId, spec, newVersion?)` (§4.9, C9 entry point).
    /// Rooms not present for `diagram_id` silently skip the notification.
    pub fn broadcast_sync(&self, diagram_id: &str, spec: crate::spec::DiagramSpec, new_version: Option<u64>) {
        let version = {
            let mut state = self.state.lock();
            let Some(room) = state.rooms.get_mut(diagram_id) else { return };
            room.version = new_version.unwrap_or(room.version + 1);
            room.version
        };
        self.broadcast(diagram_id, &ServerMessage::Sync { spec, version }, None);
    }

    /// `CheckRateLimit(ws)` (§4.7): token-window limiter. Also performs the
    /// side effects described in the spec (sending the warning/error frame
    /// and, on `Exceeded`, closing the connection) so callers only need to
    /// stop reading on `Exceeded`.
    pub fn check_rate_limit(&self, id: ConnectionId) -> RateLimitOutcome {
        let (outcome, conn) = {
            let mut state = self.state.lock();
            let Some(conn_state) = state.connections.get_mut(&id) else {
                return RateLimitOutcome::Allowed;
            };
            let now = Instant::now();
            if now.duration_since(conn_state.rate_window_start) >= Duration::from_millis(WINDOW_MS) {
                conn_state.rate_window_start = now;
                conn_state.rate_count = 0;
            }
            conn_state.rate_count += 1;
            if conn_state.rate_count <= MAX_MESSAGES {
                (RateLimitOutcome::Allowed, None)
            } else {
                conn_state.warnings += 1;
                if conn_state.warnings >= MAX_WARNINGS {
                    (RateLimitOutcome::Exceeded, Some(conn_state.conn.clone()))
                } else {
                    (RateLimitOutcome::Warned(conn_state.warnings), Some(conn_state.conn.clone()))
                }
            }
        };

        match &outcome {
            RateLimitOutcome::Allowed => {}
            RateLimitOutcome::Warned(k) => {
                if let Some(conn) = conn {
                    conn.send(&codec::encode_server_message(&ServerMessage::error(
                        "RATE_LIMIT_WARNING",
                        format!("Rate limit warning ({k}/{MAX_WARNINGS})"),
                    )));
                }
            }
            RateLimitOutcome::Exceeded => {
                if let Some(conn) = conn {
                    conn.send(&codec::encode_server_message(&ServerMessage::error(
                        "RATE_LIMIT_EXCEEDED",
                        "too many messages; closing connection",
                    )));
                    conn.close(NORMAL_CLOSURE_CODE, "rate limit exceeded");
                }
                self.disconnect(id);
            }
        }
        outcome
    }

    /// `UpdateActivity(ws)` (§4.7): stamps `lastActivity`, consulted by the
    /// stale-connection sweep in [`Hub::cleanup_inactive`].
    pub fn update_activity(&self, id: ConnectionId) {
        let mut state = self.state.lock();
        if let Some(conn_state) = state.connections.get_mut(&id) {
            conn_state.last_activity = Instant::now();
        }
    }

    /// `CleanupInactive()` (§4.7): the periodic sweep. Intended to run every
    /// `PRESENCE_TIMEOUT/2`.
    pub fn cleanup_inactive(&self) {
        let now = Instant::now();

        let stale_participants: Vec<(String, ConnectionId, String)> = {
            let state = self.state.lock();
            state
                .rooms
                .iter()
                .flat_map(|(diagram_id, room)| {
                    room.participants.values().filter_map(|p| {
                        if now.duration_since(p.last_seen) > PRESENCE_TIMEOUT {
                            Some((diagram_id.clone(), p.connection_id, p.id.clone()))
                        } else {
                            None
                        }
                    })
                })
                .collect()
        };
        for (diagram_id, conn_id, participant_id) in stale_participants {
            let became_empty = {
                let mut state = self.state.lock();
                if let Some(room) = state.rooms.get_mut(&diagram_id) {
                    room.participants.remove(&conn_id);
                    if let Some(conns) = state.room_connections.get_mut(&diagram_id) {
                        conns.remove(&conn_id);
                    }
                    room.participants.is_empty()
                } else {
                    false
                }
            };
            if let Some(conn_state) = self.state.lock().connections.get_mut(&conn_id) {
                conn_state.room = None;
            }
            if became_empty {
                self.state.lock().empty_room_timestamps.insert(diagram_id.clone(), now);
            }
            self.broadcast(&diagram_id, &ServerMessage::ParticipantLeft { participant_id }, None);
        }

        {
            let mut state = self.state.lock();
            let expired: Vec<String> = state
                .empty_room_timestamps
                .iter()
                .filter(|(_, at)| now.duration_since(**at) > EMPTY_ROOM_TTL)
                .map(|(id, _)| id.clone())
                .collect();
            for diagram_id in expired {
                state.rooms.remove(&diagram_id);
                state.room_connections.remove(&diagram_id);
                state.empty_room_timestamps.remove(&diagram_id);
            }
        }

        let stale_connections: Vec<ConnectionId> = {
            let state = self.state.lock();
            state
                .connections
                .iter()
                .filter(|(_, c)| now.duration_since(c.last_activity) > CONNECTION_STALE_TIMEOUT || !c.conn.is_open())
                .map(|(id, _)| *id)
                .collect()
        };
        for id in stale_connections {
            self.disconnect(id);
        }
    }

    /// `CanWrite(ws)` (§4.7): `true` iff `userId` is set and `role != viewer`.
    pub fn can_write(&self, id: ConnectionId) -> bool {
        let state = self.state.lock();
        state
            .connections
            .get(&id)
            .map(|c| c.identity.user_id.is_some() && c.identity.role != Some(Role::Viewer))
            .unwrap_or(false)
    }

    /// `CloseAll(reason)` (§4.7): shutdown hook.
    pub fn close_all(&self, reason: &str) {
        let connections: Vec<Arc<dyn Connection>> = {
            let mut state = self.state.lock();
            let conns = state.connections.values().map(|c| c.conn.clone()).collect();
            for c in state.connections.values() {
                c.ping_task.abort();
            }
            state.rooms.clear();
            state.room_connections.clear();
            state.empty_room_timestamps.clear();
            state.connections.clear();
            conns
        };
        let frame = codec::encode_server_message(&ServerMessage::error("SERVER_SHUTDOWN", reason));
        for conn in connections {
            conn.send(&frame);
            conn.close(NORMAL_CLOSURE_CODE, reason);
        }
    }

    /// Dispatches a decoded [`ClientMessage`] for a registered connection.
    /// Centralizes the tag-to-operation mapping the connection-handling code
    /// in `src/bin/server.rs` drives per inbound frame.
    pub fn dispatch(&self, id: ConnectionId, message: ClientMessage) {
        self.update_activity(id);
        match message {
            ClientMessage::Join { diagram_id, name } => {
                if let Err(e) = self.join_room(id, diagram_id, name) {
                    if let Some(conn) = self.connection_handle(id) {
                        conn.send(&codec::encode_server_message(&ServerMessage::error(e.code(), e)));
                    }
                }
            }
            ClientMessage::Leave => self.leave_room(id),
            ClientMessage::Cursor { x, y } => self.update_cursor(id, CursorPosition { x, y }),
            ClientMessage::Selection { node_ids } => self.update_selection(id, node_ids),
            ClientMessage::Change { changes, base_version } => self.handle_changes(id, changes, base_version),
            ClientMessage::Ping => {
                if let Some(conn) = self.connection_handle(id) {
                    conn.send(&codec::encode_server_message(&ServerMessage::Pong));
                }
            }
        }
    }

    fn connection_handle(&self, id: ConnectionId) -> Option<Arc<dyn Connection>> {
        self.state.lock().connections.get(&id).map(|c| c.conn.clone())
    }

    /// Sends `message` to every connection in `diagram_id`'s room, skipping
    /// `exclude` if given. A closed peer is logged and skipped rather than
    /// allowed to block the broadcast (§5 "hub `Send` on a slow peer").
    fn broadcast(&self, diagram_id: &str, message: &ServerMessage, exclude: Option<ConnectionId>) {
        let targets: Vec<Arc<dyn Connection>> = {
            let state = self.state.lock();
            let Some(members) = state.room_connections.get(diagram_id) else { return };
            members
                .iter()
                .filter(|id| Some(**id) != exclude)
                .filter_map(|id| state.connections.get(id))
                .map(|c| c.conn.clone())
                .collect()
        };
        let frame = codec::encode_server_message(message);
        for conn in targets {
            if conn.is_open() {
                conn.send(&frame);
            } else {
                tracing::debug!(diagram_id, "skipped broadcast to closed connection");
            }
        }
    }
}

//! Session management for connected players
//!
//! This module owns everything the server knows about a connection beyond
//! its transport state:
//! - the session lifecycle (connecting, active, disconnect-pending)
//! - the tank slot each session controls and its display name
//! - the per-session outbox of encoded chunks awaiting the next flush
//! - decoding of inbound chunks into input flags, chat and commands
//!
//! A session that sends anything malformed is never dropped on the spot.
//! It is marked disconnect-pending and removed by [`SessionManager::sweep`]
//! at the end of the tick, so the rest of the tick sees a stable roster.

use crate::game::Simulator;
use crate::replication::{name_change_chunk, tank_chunk, tank_kill_chunk, ReplicationEncoder};
use log::{debug, info, warn};
use shared::protocol::split_batch;
use shared::{
    Action, Channel, Chunk, MessageKind, ProtocolError, SendQueue, MAX_CHAT_LEN, MAX_NAME_LEN,
    ORIGIN_SERVER,
};
use std::collections::HashMap;
use std::fmt;

/// Sent privately to every new session after its baseline
pub const WELCOME_NOTICE: &str = "Welcome to MOAG!";
/// Broadcast to the existing sessions when someone joins
pub const JOIN_NOTICE: &str = "A challenger appears!";
pub const UNKNOWN_COMMAND_NOTICE: &str = ": unknown command.";
pub const INVALID_NAME_NOTICE: &str = ": invalid nickname.";

/// Transport-level identity of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Reasons a session operation is refused
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("server is full")]
    ServerFull,

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
}

/// Lifecycle of a session
///
/// A session is only removed from `DisconnectPending` by the sweep at the
/// end of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    DisconnectPending,
}

/// One connected player
#[derive(Debug)]
pub struct Session {
    /// Transport connection this session belongs to
    pub conn: ConnectionId,
    /// Tank slot the session controls; also its id in chat and name chunks
    pub tank_id: u8,
    pub state: SessionState,
    /// Display name, `p<id>` until the player picks one
    pub name: String,
    /// Why the session is being dropped, once it is
    pub close_reason: Option<String>,
    outbox: SendQueue,
}

impl Session {
    fn new(conn: ConnectionId, tank_id: u8) -> Self {
        Self {
            conn,
            tank_id,
            state: SessionState::Connecting,
            name: format!("p{}", tank_id),
            close_reason: None,
            outbox: SendQueue::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    fn push(&mut self, chunk: &Chunk) {
        self.outbox.push(chunk);
    }

    fn notice(&mut self, text: &str) {
        self.push(&notice_chunk(text));
    }

    fn mark_for_disconnect(&mut self, reason: impl Into<String>) {
        if self.state != SessionState::DisconnectPending {
            self.state = SessionState::DisconnectPending;
            self.close_reason = Some(reason.into());
        }
    }
}

fn notice_chunk(text: &str) -> Chunk {
    Chunk::ServerMsg {
        origin: ORIGIN_SERVER,
        kind: MessageKind::Notice,
        text: text.as_bytes().to_vec(),
    }
}

/// Parsed form of a chat line that starts with '/'
#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Nick(&'a str),
    Shutdown,
    Unknown,
}

fn parse_command(line: &str) -> Command<'_> {
    let body = line.strip_prefix('/').unwrap_or(line);
    let (name, rest) = match body.split_once(' ') {
        Some((name, rest)) => (name, rest),
        None => (body, ""),
    };
    match name {
        "n" | "nick" => Command::Nick(rest.trim()),
        "shutdown" => Command::Shutdown,
        _ => Command::Unknown,
    }
}

/// Validates raw chat bytes: trailing NULs are dropped, then the text must
/// be non-empty, at most [`MAX_CHAT_LEN`] bytes and valid UTF-8.
fn clean_message(raw: &[u8]) -> Option<&str> {
    let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    let text = &raw[..end];
    if text.is_empty() || text.len() > MAX_CHAT_LEN {
        return None;
    }
    std::str::from_utf8(text).ok()
}

/// Roster of sessions and their outboxes
pub struct SessionManager {
    sessions: HashMap<ConnectionId, Session>,
    max_sessions: usize,
    allow_shutdown: bool,
    shutdown_requested: bool,
}

impl SessionManager {
    pub fn new(max_sessions: usize, allow_shutdown: bool) -> Self {
        Self {
            sessions: HashMap::new(),
            max_sessions,
            allow_shutdown,
            shutdown_requested: false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Looks up a session, pending ones included
    pub fn session(&self, conn: ConnectionId) -> Option<&Session> {
        self.sessions.get(&conn)
    }

    /// Set once an allowed `/shutdown` has been received
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
    }

    /// Names of every session ordered by tank id
    fn roster(&self) -> Vec<(u8, String)> {
        let mut names: Vec<(u8, String)> = self
            .sessions
            .values()
            .filter(|s| s.state != SessionState::DisconnectPending)
            .map(|s| (s.tank_id, s.name.clone()))
            .collect();
        names.sort_by_key(|(id, _)| *id);
        names
    }

    /// Admits a new connection: claims a tank, queues the baseline and the
    /// welcome notice for it and announces the new tank to everyone else.
    pub fn connect(
        &mut self,
        conn: ConnectionId,
        sim: &mut Simulator,
    ) -> Result<u8, SessionError> {
        if let Some(existing) = self.sessions.get(&conn) {
            return Ok(existing.tank_id);
        }
        if self.sessions.len() >= self.max_sessions {
            return Err(SessionError::ServerFull);
        }
        let tank_id = sim.add_tank().ok_or(SessionError::ServerFull)?;

        let mut session = Session::new(conn, tank_id);
        let name = session.name.clone();
        self.broadcast(&notice_chunk(JOIN_NOTICE));
        if let Some(tank) = sim.store().tank(tank_id) {
            self.broadcast(&tank_chunk(tank_id, tank, Action::Spawn));
        }
        self.broadcast(&name_change_chunk(tank_id, &name));

        let mut names = self.roster();
        names.push((tank_id, name));
        names.sort_by_key(|(id, _)| *id);

        let baseline = ReplicationEncoder::baseline(
            sim,
            names.iter().map(|(id, name)| (*id, name.as_str())),
        );
        for chunk in &baseline {
            session.push(chunk);
        }
        session.notice(WELCOME_NOTICE);
        session.state = SessionState::Active;

        info!("Session {} joined as tank {}", conn, tank_id);
        self.sessions.insert(conn, session);
        Ok(tank_id)
    }

    /// Marks a session for removal at the next sweep
    pub fn disconnect(&mut self, conn: ConnectionId, reason: &str) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(&conn)
            .ok_or(SessionError::UnknownConnection(conn))?;
        session.mark_for_disconnect(reason);
        Ok(())
    }

    /// Queues a chunk for every active session
    pub fn broadcast(&mut self, chunk: &Chunk) {
        let channel = chunk.channel();
        let bytes = chunk.encode();
        for session in self.sessions.values_mut().filter(|s| s.is_active()) {
            session.outbox.push_encoded(channel, bytes.clone());
        }
    }

    /// Queues several chunks for every active session
    ///
    /// Each chunk is encoded once and the bytes are shared between outboxes.
    pub fn broadcast_all(&mut self, chunks: &[Chunk]) {
        for chunk in chunks {
            self.broadcast(chunk);
        }
    }

    fn send_to(&mut self, conn: ConnectionId, chunk: &Chunk) {
        if let Some(session) = self.sessions.get_mut(&conn) {
            session.push(chunk);
        }
    }

    /// Processes one inbound batch. Any decoding failure or chunk a client
    /// may not send marks the session disconnect-pending; nothing after the
    /// bad chunk is processed.
    pub fn handle_payload(
        &mut self,
        conn: ConnectionId,
        payload: &[u8],
        sim: &mut Simulator,
    ) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get(&conn)
            .ok_or(SessionError::UnknownConnection(conn))?;
        if !session.is_active() {
            return Ok(());
        }

        if let Err(e) = self.process_chunks(conn, payload, sim) {
            warn!("Protocol violation from session {}: {}", conn, e);
            if let Some(session) = self.sessions.get_mut(&conn) {
                session.mark_for_disconnect(e.to_string());
            }
        }
        Ok(())
    }

    fn process_chunks(
        &mut self,
        conn: ConnectionId,
        payload: &[u8],
        sim: &mut Simulator,
    ) -> Result<(), ProtocolError> {
        for raw in split_batch(payload)? {
            match Chunk::decode(raw)? {
                Chunk::Input { key, .. } => {
                    if let Some(session) = self.sessions.get(&conn) {
                        sim.apply_input(session.tank_id, key);
                    }
                }
                Chunk::ClientMsg { text } => self.handle_message(conn, &text),
                other => return Err(ProtocolError::UnexpectedChunk(other.chunk_type())),
            }
        }
        Ok(())
    }

    fn handle_message(&mut self, conn: ConnectionId, raw: &[u8]) {
        let Some(text) = clean_message(raw) else {
            debug!("Dropping unusable chat line from session {}", conn);
            return;
        };
        let Some(tank_id) = self.sessions.get(&conn).map(|s| s.tank_id) else {
            return;
        };

        if !text.starts_with('/') {
            self.broadcast(&Chunk::ServerMsg {
                origin: tank_id,
                kind: MessageKind::Chat,
                text: text.as_bytes().to_vec(),
            });
            return;
        }

        match parse_command(text) {
            Command::Nick(name) => self.rename(conn, name),
            Command::Shutdown if self.allow_shutdown => {
                info!("Shutdown requested by session {}", conn);
                self.shutdown_requested = true;
            }
            Command::Shutdown | Command::Unknown => {
                self.send_to(conn, &notice_chunk(UNKNOWN_COMMAND_NOTICE));
            }
        }
    }

    fn rename(&mut self, conn: ConnectionId, name: &str) {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            self.send_to(conn, &notice_chunk(INVALID_NAME_NOTICE));
            return;
        }
        let Some(session) = self.sessions.get_mut(&conn) else {
            return;
        };

        let old = std::mem::replace(&mut session.name, name.to_string());
        let tank_id = session.tank_id;
        info!("Session {} renamed from {} to {}", conn, old, name);

        self.broadcast(&notice_chunk(&format!(": {} is now known as {}.", old, name)));
        self.broadcast(&name_change_chunk(tank_id, name));
    }

    /// Removes every disconnect-pending session, frees its tank and tells
    /// the remaining sessions. Returns the removed connections.
    pub fn sweep(&mut self, sim: &mut Simulator) -> Vec<ConnectionId> {
        let mut pending: Vec<ConnectionId> = self
            .sessions
            .values()
            .filter(|s| s.state == SessionState::DisconnectPending)
            .map(|s| s.conn)
            .collect();
        pending.sort();

        for conn in &pending {
            if let Some(session) = self.sessions.remove(conn) {
                sim.remove_tank(session.tank_id);
                info!(
                    "Session {} (tank {}) left: {}",
                    conn,
                    session.tank_id,
                    session.close_reason.as_deref().unwrap_or("disconnected")
                );
                self.broadcast(&tank_kill_chunk(session.tank_id));
            }
        }
        pending
    }

    /// Drains one session's outbox into at most one batch per channel
    pub fn flush(&mut self, conn: ConnectionId) -> Vec<(Channel, Vec<u8>)> {
        self.sessions
            .get_mut(&conn)
            .map(|s| s.outbox.flush())
            .unwrap_or_default()
    }

    /// Drains every active session's outbox
    pub fn flush_all(&mut self) -> Vec<(ConnectionId, Vec<(Channel, Vec<u8>)>)> {
        self.sessions
            .values_mut()
            .filter(|s| s.is_active() && !s.outbox.is_empty())
            .map(|s| (s.conn, s.outbox.flush()))
            .collect()
    }

    pub fn connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.sessions.keys().copied()
    }
}

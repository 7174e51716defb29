//! In-memory room relay for development and integration tests.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌──► Client A  (document:updated, echo)
//!             ├── Room (note_id) ─────┼──► Client B
//! Client B ──┘    version counter    └──► Client C
//!                 members by session
//! ```
//!
//! Each room keeps:
//! - a version counter bumped by every `document:edit`
//! - the members currently joined, keyed by session id
//!
//! Nothing is persisted. Rooms disappear with their last member, and so
//! does their version.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::coords::DocumentPosition;
use crate::error::{ProtocolError, RelayError};
use crate::presence::color_for_user;
use crate::protocol::{
    decode_payload, events, CollaborationUser, ConflictPayload, CursorMovedPayload,
    DocumentUpdatedPayload, Envelope, JoinPayload, LeavePayload, UserLeftPayload,
};

/// Environment variable overriding [`RelayConfig::bind_addr`].
pub const ENV_RELAY_ADDR: &str = "SCRIBE_RELAY_ADDR";

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum members per room; further joins are refused
    pub max_peers_per_room: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            max_peers_per_room: 100,
        }
    }
}

impl RelayConfig {
    /// Defaults, with the bind address taken from `SCRIBE_RELAY_ADDR` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var(ENV_RELAY_ADDR) {
            if !addr.trim().is_empty() {
                config.bind_addr = addr.trim().to_string();
            }
        }
        config
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_edits: u64,
    pub conflicts: u64,
    pub active_rooms: usize,
}

/// Identity carried by the bearer token: `userId[:userName]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenIdentity {
    pub user_id: String,
    pub user_name: String,
}

impl TokenIdentity {
    pub fn parse(token: &str) -> Option<Self> {
        let token = token.trim();
        let (user_id, user_name) = match token.split_once(':') {
            Some((id, name)) if !name.trim().is_empty() => (id.trim(), name.trim()),
            Some((id, _)) => (id.trim(), id.trim()),
            None => (token, token),
        };
        if user_id.is_empty() {
            return None;
        }
        Some(Self {
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
        })
    }

    fn from_request(request: &Request) -> Option<Self> {
        let value = request.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
        let token = value.strip_prefix("Bearer ")?;
        Self::parse(token)
    }
}

/// Edits are forwarded verbatim, so operations stay raw here.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditFrame {
    note_id: String,
    #[serde(default)]
    operations: Vec<Value>,
    #[serde(default)]
    version: u64,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct CursorFrame {
    note_id: String,
    position: DocumentPosition,
}

struct Member {
    user: CollaborationUser,
    read_only: bool,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct RelayRoom {
    version: u64,
    members: HashMap<String, Member>,
}

impl RelayRoom {
    fn users(&self) -> Vec<&CollaborationUser> {
        self.members.values().map(|m| &m.user).collect()
    }

    /// Send to every member except `except`. Returns how many were reached.
    fn broadcast(&self, frame: &str, except: Option<&str>) -> usize {
        self.members
            .iter()
            .filter(|(session, _)| Some(session.as_str()) != except)
            .filter(|(_, member)| member.tx.send(Message::text(frame)).is_ok())
            .count()
    }
}

type Rooms = Arc<RwLock<HashMap<String, RelayRoom>>>;

/// One live socket.
struct Connection {
    addr: SocketAddr,
    user: CollaborationUser,
    tx: mpsc::UnboundedSender<Message>,
    joined: HashSet<String>,
}

impl Connection {
    fn send(&self, frame: &str) {
        if self.tx.send(Message::text(frame)).is_err() {
            log::debug!("Writer for {} already closed", self.addr);
        }
    }
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    /// Rooms: note_id → members + version
    rooms: Rooms,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, RelayError> {
        TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })
    }

    /// Bind and serve until the accept loop fails.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept WebSocket connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        if let Ok(addr) = listener.local_addr() {
            log::info!("Relay listening on {addr}");
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// Current version of a room, if it has members.
    pub async fn room_version(&self, note_id: &str) -> Option<u64> {
        self.rooms.read().await.get(note_id).map(|room| room.version)
    }

    pub async fn member_count(&self, note_id: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(note_id)
            .map_or(0, |room| room.members.len())
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Rooms,
        stats: Arc<RwLock<RelayStats>>,
        config: RelayConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut identity = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            match TokenIdentity::from_request(req) {
                Some(found) => {
                    identity = Some(found);
                    Ok(resp)
                }
                None => Err(unauthorized()),
            }
        })
        .await?;
        let Some(identity) = identity else {
            return Ok(());
        };

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let session_id = Uuid::new_v4().to_string();
        let color = color_for_user(&identity.user_id).to_string();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if ws_sender.send(message).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        log::info!(
            "{} ({}) connected from {addr} as session {session_id}",
            identity.user_name,
            identity.user_id
        );

        let mut conn = Connection {
            addr,
            user: CollaborationUser::new(identity.user_id, identity.user_name, session_id, color),
            tx,
            joined: HashSet::new(),
        };

        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    stats.write().await.total_messages += 1;
                    match Envelope::decode(text.as_str()) {
                        Ok(envelope) => {
                            if let Err(e) =
                                Self::handle_frame(&mut conn, envelope, &rooms, &stats, &config).await
                            {
                                log::warn!("Dropping frame from {addr}: {e}");
                            }
                        }
                        Err(e) => log::warn!("Failed to decode frame from {addr}: {e}"),
                    }
                }
                Ok(Message::Close(_)) => {
                    log::info!("Connection closed from {addr}");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("WebSocket error from {addr}: {e}");
                    break;
                }
            }
        }

        let joined: Vec<String> = conn.joined.drain().collect();
        for note_id in joined {
            Self::leave_room(&conn, &note_id, &rooms, &stats).await;
        }
        drop(conn);
        let _ = writer.await;

        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        Ok(())
    }

    async fn handle_frame(
        conn: &mut Connection,
        envelope: Envelope,
        rooms: &Rooms,
        stats: &Arc<RwLock<RelayStats>>,
        config: &RelayConfig,
    ) -> Result<(), ProtocolError> {
        match envelope.event.as_str() {
            events::DOCUMENT_JOIN => {
                let join: JoinPayload = decode_payload(&envelope.event, &envelope.data)?;
                Self::join_room(conn, join, rooms, stats, config).await?;
            }

            events::DOCUMENT_LEAVE => {
                let leave: LeavePayload = decode_payload(&envelope.event, &envelope.data)?;
                if conn.joined.remove(&leave.note_id) {
                    Self::leave_room(conn, &leave.note_id, rooms, stats).await;
                }
            }

            events::DOCUMENT_EDIT => {
                let edit: EditFrame = decode_payload(&envelope.event, &envelope.data)?;
                Self::relay_edit(conn, edit, rooms, stats).await?;
            }

            events::CURSOR_UPDATE => {
                let cursor: CursorFrame = decode_payload(&envelope.event, &envelope.data)?;
                let moved = CursorMovedPayload {
                    user_id: conn.user.user_id.clone(),
                    user_name: conn.user.user_name.clone(),
                    position: cursor.position,
                    color: conn.user.color.clone(),
                };
                let frame = Envelope::with_payload(events::CURSOR_MOVED, &moved)?.encode()?;
                let rooms_r = rooms.read().await;
                match rooms_r.get(&cursor.note_id) {
                    Some(room) if room.members.contains_key(&conn.user.session_id) => {
                        room.broadcast(&frame, Some(&conn.user.session_id));
                    }
                    _ => log::debug!("Cursor from {} outside {}", conn.addr, cursor.note_id),
                }
            }

            other => log::debug!("Unhandled event {other} from {}", conn.addr),
        }
        Ok(())
    }

    async fn join_room(
        conn: &mut Connection,
        join: JoinPayload,
        rooms: &Rooms,
        stats: &Arc<RwLock<RelayStats>>,
        config: &RelayConfig,
    ) -> Result<(), ProtocolError> {
        let joined_frame = Envelope::with_payload(events::USER_JOINED, &conn.user)?.encode()?;

        let mut rooms_w = rooms.write().await;
        let room = rooms_w.entry(join.note_id.clone()).or_default();
        let already_member = room.members.contains_key(&conn.user.session_id);
        if !already_member && room.members.len() >= config.max_peers_per_room {
            log::warn!("Room {} is full, refusing {}", join.note_id, conn.user.user_id);
            let error = Envelope::new(events::ERROR, json!({ "message": "room is full" })).encode()?;
            conn.send(&error);
            if room.members.is_empty() {
                rooms_w.remove(&join.note_id);
            }
            return Ok(());
        }

        room.members.insert(
            conn.user.session_id.clone(),
            Member {
                user: conn.user.clone(),
                read_only: join.read_only,
                tx: conn.tx.clone(),
            },
        );
        let users = Envelope::new(events::DOCUMENT_USERS, json!({ "users": room.users() })).encode()?;
        conn.send(&users);
        if !already_member {
            room.broadcast(&joined_frame, Some(&conn.user.session_id));
        }
        let room_count = rooms_w.len();
        drop(rooms_w);

        conn.joined.insert(join.note_id.clone());
        stats.write().await.active_rooms = room_count;
        log::info!(
            "{} ({}) joined {}{}",
            conn.user.user_name,
            conn.user.user_id,
            join.note_id,
            if join.read_only { " read-only" } else { "" }
        );
        Ok(())
    }

    async fn leave_room(
        conn: &Connection,
        note_id: &str,
        rooms: &Rooms,
        stats: &Arc<RwLock<RelayStats>>,
    ) {
        let left = UserLeftPayload {
            user_id: conn.user.user_id.clone(),
            session_id: conn.user.session_id.clone(),
        };
        let frame = Envelope::with_payload(events::USER_LEFT, &left).and_then(|e| e.encode());

        let mut rooms_w = rooms.write().await;
        if let Some(room) = rooms_w.get_mut(note_id) {
            room.members.remove(&conn.user.session_id);
            match &frame {
                Ok(frame) => {
                    room.broadcast(frame, None);
                }
                Err(e) => log::error!("Failed to encode leave for {note_id}: {e}"),
            }
            if room.members.is_empty() {
                rooms_w.remove(note_id);
                log::info!("Room {note_id} removed (empty)");
            }
        }
        let room_count = rooms_w.len();
        drop(rooms_w);

        stats.write().await.active_rooms = room_count;
        log::info!("{} left {note_id}", conn.user.user_id);
    }

    async fn relay_edit(
        conn: &Connection,
        edit: EditFrame,
        rooms: &Rooms,
        stats: &Arc<RwLock<RelayStats>>,
    ) -> Result<(), ProtocolError> {
        let mut rooms_w = rooms.write().await;
        let Some(room) = rooms_w.get_mut(&edit.note_id) else {
            log::debug!("Edit from {} for unjoined room {}", conn.addr, edit.note_id);
            return Ok(());
        };
        match room.members.get(&conn.user.session_id) {
            Some(member) if member.read_only => {
                log::warn!("Read-only member {} tried to edit {}", conn.user.user_id, edit.note_id);
                return Ok(());
            }
            Some(_) => {}
            None => {
                log::debug!("Edit from non-member {} for {}", conn.user.user_id, edit.note_id);
                return Ok(());
            }
        }

        let stale = edit.version < room.version;
        room.version += 1;
        let version = room.version;

        if stale {
            let conflict = ConflictPayload {
                current_version: version,
                your_version: edit.version,
            };
            conn.send(&Envelope::with_payload(events::DOCUMENT_CONFLICT, &conflict)?.encode()?);
        }

        let updated = DocumentUpdatedPayload {
            operations: edit.operations,
            version,
            user_id: conn.user.user_id.clone(),
            user_name: conn.user.user_name.clone(),
            timestamp: Some(timestamp_millis()),
        };
        let frame = Envelope::with_payload(events::DOCUMENT_UPDATED, &updated)?.encode()?;
        let reached = room.broadcast(&frame, None);
        drop(rooms_w);

        {
            let mut s = stats.write().await;
            s.total_edits += 1;
            if stale {
                s.conflicts += 1;
            }
        }
        log::debug!(
            "Edit by {} on {} -> v{version} ({reached} members){}",
            conn.user.user_id,
            edit.note_id,
            if stale { ", stale" } else { "" }
        );
        Ok(())
    }
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("missing bearer token".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

fn timestamp_millis() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_identity_parse() {
        assert_eq!(
            TokenIdentity::parse("u1:Alice"),
            Some(TokenIdentity {
                user_id: "u1".into(),
                user_name: "Alice".into()
            })
        );
        assert_eq!(TokenIdentity::parse("bob").unwrap().user_name, "bob");
        assert_eq!(TokenIdentity::parse("bob:").unwrap().user_name, "bob");
        assert!(TokenIdentity::parse("").is_none());
        assert!(TokenIdentity::parse(":Name").is_none());
    }

    #[test]
    fn test_config_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:5000");
        assert_eq!(config.max_peers_per_room, 100);
    }

    #[test]
    fn test_room_broadcast_skips_sender() {
        let mut room = RelayRoom::default();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        room.members.insert(
            "s-a".into(),
            Member {
                user: CollaborationUser::new("a", "A", "s-a", "#FF5733"),
                read_only: false,
                tx: tx_a,
            },
        );
        room.members.insert(
            "s-b".into(),
            Member {
                user: CollaborationUser::new("b", "B", "s-b", "#8C33FF"),
                read_only: false,
                tx: tx_b,
            },
        );

        assert_eq!(room.broadcast("hello", Some("s-a")), 1);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), Message::text("hello"));

        assert_eq!(room.broadcast("all", None), 2);
        assert_eq!(room.users().len(), 2);
    }

    #[tokio::test]
    async fn test_bind_error_names_address() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let server = RelayServer::new(RelayConfig {
            bind_addr: addr.clone(),
            ..RelayConfig::default()
        });
        match server.bind().await {
            Err(RelayError::Bind { addr: reported, .. }) => assert_eq!(reported, addr),
            other => panic!("expected bind error, got {other:?}"),
        }
    }
}

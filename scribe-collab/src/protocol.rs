//! JSON wire protocol for document rooms.
//!
//! Every frame is a text message:
//! ```text
//! { "event": "document:edit", "data": { "noteId": "...", "operations": [...], "version": 3 } }
//! ```
//!
//! | Direction | Event | Payload |
//! |-----------|-------|---------|
//! | out | `document:join` | [`JoinPayload`] |
//! | out | `document:leave` | [`LeavePayload`] |
//! | out | `document:edit` | [`EditPayload`] |
//! | out | `cursor:update` | [`CursorUpdatePayload`] |
//! | in | `document:users` | [`UsersPayload`] |
//! | in | `document:user:joined` | [`CollaborationUser`] |
//! | in | `document:user:left` | [`UserLeftPayload`] |
//! | in | `document:updated` | [`DocumentUpdatedPayload`] |
//! | in | `document:conflict` | [`ConflictPayload`] |
//! | in | `cursor:moved` | [`CursorMovedPayload`] |

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::coords::DocumentPosition;
use crate::document::Document;
use crate::error::ProtocolError;

/// Event names, shared by client and relay.
pub mod events {
    pub const DOCUMENT_JOIN: &str = "document:join";
    pub const DOCUMENT_LEAVE: &str = "document:leave";
    pub const DOCUMENT_EDIT: &str = "document:edit";
    pub const CURSOR_UPDATE: &str = "cursor:update";

    pub const DOCUMENT_USERS: &str = "document:users";
    pub const USER_JOINED: &str = "document:user:joined";
    pub const USER_LEFT: &str = "document:user:left";
    pub const DOCUMENT_UPDATED: &str = "document:updated";
    pub const DOCUMENT_CONFLICT: &str = "document:conflict";
    pub const CURSOR_MOVED: &str = "cursor:moved";

    /// Dispatched locally by the transport, never sent over the wire.
    pub const CONNECTED: &str = "connected";
    pub const DISCONNECTED: &str = "disconnected";
    pub const CONNECT_ERROR: &str = "connect_error";
    pub const MAX_RECONNECT_ATTEMPTS_REACHED: &str = "max-reconnect-attempts-reached";
    pub const ERROR: &str = "error";
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Build a frame from any serializable payload.
    pub fn with_payload<T: Serialize>(event: &str, payload: &T) -> Result<Self, ProtocolError> {
        let data = serde_json::to_value(payload)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(event, data))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed {
            event: "<frame>".to_string(),
            reason: e.to_string(),
        })
    }
}

/// Decode the payload of `event` into its typed form.
pub fn decode_payload<T: DeserializeOwned>(event: &str, data: &Value) -> Result<T, ProtocolError> {
    T::deserialize(data).map_err(|e| ProtocolError::Malformed {
        event: event.to_string(),
        reason: e.to_string(),
    })
}

/// `null` and missing strings both decode as empty.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// A roster entry as announced by the server.
///
/// Fields decode leniently; whether the entry is admitted is decided by
/// [`CollaborationUser::is_valid`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationUser {
    #[serde(default, deserialize_with = "lenient_string")]
    pub user_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub user_name: String,
    #[serde(default, alias = "socketId", deserialize_with = "lenient_string")]
    pub session_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub color: String,
}

/// Non-empty and not a stringified `undefined`/`null`.
pub fn is_present(value: &str) -> bool {
    !value.is_empty() && value != "undefined" && value != "null"
}

impl CollaborationUser {
    pub fn new(
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        session_id: impl Into<String>,
        color: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            session_id: session_id.into(),
            color: color.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        is_present(&self.user_id)
            && is_present(&self.user_name)
            && is_present(&self.session_id)
            && is_present(&self.color)
    }
}

/// One change in a `document:edit` / `document:updated` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Operation {
    Insert {
        position: usize,
        #[serde(default)]
        text: String,
    },
    Delete {
        position: usize,
        #[serde(default)]
        length: usize,
    },
    Replace {
        position: usize,
        #[serde(default)]
        length: usize,
        #[serde(default)]
        text: String,
    },
    SetContent {
        content: Document,
    },
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Insert { .. } => "insert",
            Operation::Delete { .. } => "delete",
            Operation::Replace { .. } => "replace",
            Operation::SetContent { .. } => "setContent",
        }
    }
}

/// Decode an operation list element by element, skipping the ones that
/// do not parse.
pub fn decode_operations(values: &[Value]) -> (Vec<Operation>, usize) {
    let mut skipped = 0;
    let operations = values
        .iter()
        .filter_map(|value| match Operation::deserialize(value) {
            Ok(op) => Some(op),
            Err(e) => {
                log::warn!("Skipping malformed operation: {e}");
                skipped += 1;
                None
            }
        })
        .collect();
    (operations, skipped)
}

// ───────────────────────────────────────────────────────────────────
// Outbound payloads
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub note_id: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeavePayload {
    pub note_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditPayload {
    pub note_id: String,
    pub operations: Vec<Operation>,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorUpdatePayload {
    pub note_id: String,
    pub position: DocumentPosition,
}

// ───────────────────────────────────────────────────────────────────
// Inbound payloads
// ───────────────────────────────────────────────────────────────────

/// Roster snapshot. Entries stay raw so a bad one cannot sink the rest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsersPayload {
    #[serde(default)]
    pub users: Vec<Value>,
}

impl UsersPayload {
    /// Entries that decode; the roster applies its own validity gate.
    pub fn decoded(&self) -> Vec<CollaborationUser> {
        self.users
            .iter()
            .filter_map(|raw| CollaborationUser::deserialize(raw).ok())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeftPayload {
    #[serde(deserialize_with = "lenient_string")]
    pub user_id: String,
    #[serde(default, alias = "socketId", deserialize_with = "lenient_string")]
    pub session_id: String,
}

/// Remote edit relayed by the server. Operations stay raw and are decoded
/// one by one when applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentUpdatedPayload {
    #[serde(default)]
    pub operations: Vec<Value>,
    pub version: u64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub user_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictPayload {
    pub current_version: u64,
    pub your_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorMovedPayload {
    #[serde(default, alias = "id", deserialize_with = "lenient_string")]
    pub user_id: String,
    #[serde(default, alias = "name", deserialize_with = "lenient_string")]
    pub user_name: String,
    pub position: DocumentPosition,
    #[serde(default, deserialize_with = "lenient_string")]
    pub color: String,
}

/// Inbound room messages a document session reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomMessage {
    Users(UsersPayload),
    UserJoined(CollaborationUser),
    UserLeft(UserLeftPayload),
    Updated(DocumentUpdatedPayload),
    Conflict(ConflictPayload),
    /// The transport (re)connected
    Connected,
}

impl RoomMessage {
    /// Parse an inbound frame for the document session.
    pub fn parse(event: &str, data: &Value) -> Result<Self, ProtocolError> {
        match event {
            events::DOCUMENT_USERS => decode_payload(event, data).map(RoomMessage::Users),
            events::USER_JOINED => decode_payload(event, data).map(RoomMessage::UserJoined),
            events::USER_LEFT => decode_payload(event, data).map(RoomMessage::UserLeft),
            events::DOCUMENT_UPDATED => decode_payload(event, data).map(RoomMessage::Updated),
            events::DOCUMENT_CONFLICT => decode_payload(event, data).map(RoomMessage::Conflict),
            events::CONNECTED => Ok(RoomMessage::Connected),
            other => Err(ProtocolError::UnexpectedEvent(other.to_string())),
        }
    }
}

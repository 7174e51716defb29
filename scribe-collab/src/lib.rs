//! # scribe-collab: Document sync and presence for the note editor
//!
//! Client side of the collaboration protocol: joins a note's room over a
//! WebSocket, broadcasts local edits, applies remote ones and shows where
//! other people's carets are.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   JSON frames    ┌──────────────┐
//! │ Transport    │ ◄──────────────► │ Relay/server │
//! │ (per user)   │   bearer token   │ (rooms)      │
//! └──────┬───────┘                  └──────────────┘
//!        │ handlers → inboxes
//!        ▼
//! ┌──────────────┐  RemoteApply   ┌──────────────┐
//! │ Document     │ ─────────────► │ Editor       │
//! │ Session      │ ◄───────────── │ surface      │
//! └──────┬───────┘  EditorEvent   └──────────────┘
//!        │ shared roster
//!        ▼
//! ┌──────────────┐
//! │ Cursor       │
//! │ Broadcaster  │
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`transport`]: Authenticated socket with reconnects and a handler registry
//! - [`protocol`]: Event names and JSON payloads
//! - [`document`]: Rich-text tree the editor holds
//! - [`coords`]: Offset ⇄ (line, column) translation
//! - [`editor`]: Editor, identity and credential seams
//! - [`session`]: Room membership and edit sync
//! - [`presence`]: Roster and remote cursor state
//! - [`cursor`]: Caret broadcasting and rendering
//! - [`client`]: Async driver for one open note
//! - [`relay`]: In-memory relay for development and tests

pub mod client;
pub mod config;
pub mod coords;
pub mod cursor;
pub mod debounce;
pub mod document;
pub mod editor;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use client::CollabClient;
pub use config::{CollabConfig, ReconnectPolicy, ENV_WS_URL};
pub use coords::{coordinate_to_position, position_to_coordinate, DocumentPosition};
pub use cursor::{visible_cursors, CursorBroadcaster, RenderedCursor};
pub use debounce::Debouncer;
pub use document::{Document, Mark, Node};
pub use editor::{
    ChangeOrigin, CredentialStore, EditorEvent, EditorSurface, IdentityProvider, MemoryEditor,
    Selection, StaticCredentials, StaticIdentity,
};
pub use error::{EditError, ProtocolError, RelayError, TransportError};
pub use presence::{
    color_for_user, initials, CursorInfo, CursorUser, PresenceRoster, RosterSummary, SharedRoster,
    PALETTE,
};
pub use protocol::{events, CollaborationUser, Envelope, Operation, RoomMessage};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use session::{
    apply_operations, ApplyGate, ApplyReport, DocumentSession, RemoteApply, SessionEvent,
    SessionState,
};
pub use transport::{
    ConnectionState, Handler, HandlerId, HandlerRegistry, MemoryTransport, Transport,
    TransportSession,
};

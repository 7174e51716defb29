//! Document session: the sync state machine for one open note.
//!
//! ```text
//!            join()                 transport connected
//!   Idle ───────────► Joining ─────────────────────────► Joined
//!    ▲                  │ not connected: retry after        │
//!    │                  │ join_retry_delay (optionally      │ leave()
//!    │                  │ bounded → JoinAbandoned)          ▼
//!    └──────────────────┴────────────────────────────── Leaving
//! ```
//!
//! Outbound: local document changes are debounced and sent as one
//! `document:edit` carrying the whole document and the highest version
//! seen so far. Inbound: `document:updated` advances that version, drops
//! the local user's own echo and applies everything else inside a
//! [`RemoteApply`] scope, so the resulting editor notifications are never
//! mistaken for local edits.
//!
//! Handlers registered on the transport only forward parsed messages into
//! the session's inbox; all state changes happen on the caller's task in
//! [`DocumentSession::process_pending`] / [`DocumentSession::handle_message`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::mpsc;

use crate::config::CollabConfig;
use crate::debounce::Debouncer;
use crate::document::Document;
use crate::editor::{ChangeOrigin, EditorSurface, IdentityProvider};
use crate::error::EditError;
use crate::presence::{PresenceRoster, SharedRoster};
use crate::protocol::{
    decode_operations, events, ConflictPayload, DocumentUpdatedPayload, EditPayload,
    JoinPayload, LeavePayload, Operation, RoomMessage,
};
use crate::transport::{HandlerId, Transport};

/// Events the session listens to while in a room.
const ROOM_EVENTS: [&str; 6] = [
    events::DOCUMENT_USERS,
    events::USER_JOINED,
    events::USER_LEFT,
    events::DOCUMENT_UPDATED,
    events::DOCUMENT_CONFLICT,
    events::CONNECTED,
];

// ───────────────────────────────────────────────────────────────────
// Remote-apply scope
// ───────────────────────────────────────────────────────────────────

/// Tracks whether a remote update is currently being applied.
///
/// Cloned into every component that must ignore editor notifications
/// caused by remote updates.
#[derive(Debug, Clone, Default)]
pub struct ApplyGate(Arc<AtomicUsize>);

impl ApplyGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a remote-apply scope. It closes when the token is dropped,
    /// including during unwinding.
    pub fn enter(&self) -> RemoteApply<'_> {
        self.0.fetch_add(1, Ordering::SeqCst);
        RemoteApply { gate: self }
    }

    pub fn is_applying(&self) -> bool {
        self.0.load(Ordering::SeqCst) > 0
    }
}

/// Proof that a remote update is being applied. Required by every
/// [`EditorSurface`] mutation.
#[must_use]
pub struct RemoteApply<'a> {
    gate: &'a ApplyGate,
}

impl Drop for RemoteApply<'_> {
    fn drop(&mut self) {
        self.gate.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Result of applying one batch of remote operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    /// Whole-document replacements skipped because nothing changed
    pub unchanged: usize,
    pub failed: usize,
}

/// Apply `operations` to `editor`, each one independently.
///
/// A failing operation is logged and counted; the rest still run.
pub fn apply_operations<E>(editor: &mut E, operations: &[Operation], scope: &RemoteApply<'_>) -> ApplyReport
where
    E: EditorSurface + ?Sized,
{
    let mut report = ApplyReport::default();
    for operation in operations {
        let result = match operation {
            Operation::SetContent { content } => replace_content(editor, content, scope),
            Operation::Insert { position, text } => {
                editor.insert_text(*position, text, scope).map(|_| true)
            }
            Operation::Delete { position, length } => range_end(editor, *position, *length)
                .and_then(|end| editor.delete_range(*position, end, scope))
                .map(|_| true),
            Operation::Replace {
                position,
                length,
                text,
            } => replace_range(editor, *position, *length, text, scope),
        };
        match result {
            Ok(true) => report.applied += 1,
            Ok(false) => report.unchanged += 1,
            Err(e) => {
                log::warn!("Failed to apply remote {} operation: {e}", operation.kind());
                report.failed += 1;
            }
        }
    }
    report
}

/// End of a remote `position..position + length` range.
fn range_end<E>(editor: &E, position: usize, length: usize) -> Result<usize, EditError>
where
    E: EditorSurface + ?Sized,
{
    position.checked_add(length).ok_or_else(|| EditError::OutOfRange {
        position,
        size: editor.document().content_size(),
    })
}

/// Delete then insert at `position`. If the insert is rejected the
/// document and selection are restored, so the op fails as a whole.
fn replace_range<E>(
    editor: &mut E,
    position: usize,
    length: usize,
    text: &str,
    scope: &RemoteApply<'_>,
) -> Result<bool, EditError>
where
    E: EditorSurface + ?Sized,
{
    let end = range_end(editor, position, length)?;
    let before = editor.document();
    let selection = editor.selection();
    editor.delete_range(position, end, scope)?;

    if let Err(e) = editor.insert_text(position, text, scope) {
        editor.replace_document(before, scope)?;
        editor.set_selection(selection, scope);
        return Err(e);
    }
    Ok(true)
}

/// Replace the document unless it is already identical, keeping the
/// local selection where it still fits. Returns whether anything changed.
fn replace_content<E>(editor: &mut E, content: &Document, scope: &RemoteApply<'_>) -> Result<bool, EditError>
where
    E: EditorSurface + ?Sized,
{
    if editor.document().same_serialized(content) {
        return Ok(false);
    }
    let selection = editor.selection();
    editor.replace_document(content.clone(), scope)?;
    // A blurred editor keeps whatever the replacement left; focus is not stolen
    if editor.is_focused() {
        editor.set_selection(selection.clamped(content.content_size()), scope);
    }
    Ok(true)
}

// ───────────────────────────────────────────────────────────────────
// Session
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Joining,
    Joined,
    Leaving,
}

/// Notifications for the host application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Joined { note_id: String },
    Left { note_id: String },
    RosterChanged,
    RemoteUpdateApplied {
        version: u64,
        user_name: String,
        report: ApplyReport,
    },
    Conflict { current_version: u64, your_version: u64 },
    JoinAbandoned { attempts: u32 },
}

/// Client-side membership in one document room.
pub struct DocumentSession {
    note_id: String,
    read_only: bool,
    transport: Arc<dyn Transport>,
    identity: Arc<dyn IdentityProvider>,
    roster: SharedRoster,
    gate: ApplyGate,

    state: SessionState,
    /// Highest document version observed, own or remote
    local_version: u64,
    edits: Debouncer<()>,

    join_retry_delay: Duration,
    join_retry_limit: Option<u32>,
    join_retries: u32,
    join_retry_at: Option<Instant>,

    subscriptions: Vec<(&'static str, HandlerId)>,
    inbox_tx: mpsc::UnboundedSender<RoomMessage>,
    inbox_rx: mpsc::UnboundedReceiver<RoomMessage>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl DocumentSession {
    pub fn new(
        note_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityProvider>,
        config: &CollabConfig,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            note_id: note_id.into(),
            read_only: false,
            transport,
            identity,
            roster: PresenceRoster::shared(),
            gate: ApplyGate::new(),
            state: SessionState::Idle,
            local_version: 0,
            edits: Debouncer::new(config.edit_debounce),
            join_retry_delay: config.join_retry_delay,
            join_retry_limit: config.join_retry_limit,
            join_retries: 0,
            join_retry_at: None,
            subscriptions: Vec::new(),
            inbox_tx,
            inbox_rx,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Join as a viewer: local edits are never broadcast.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Enter the room, or re-announce presence if already in it.
    ///
    /// Never fails: while the transport is not connected the announcement
    /// is retried from [`poll`](Self::poll).
    pub fn join(&mut self, now: Instant) {
        match self.state {
            SessionState::Joined => {
                log::debug!("Already joined {}, re-announcing", self.note_id);
                self.announce();
                return;
            }
            SessionState::Joining => {}
            SessionState::Idle | SessionState::Leaving => {
                self.subscribe();
                self.state = SessionState::Joining;
                self.join_retries = 0;
            }
        }
        self.try_announce(now);
    }

    /// Leave the room and reset presence state. Safe in every state.
    pub fn leave(&mut self) {
        let previous = self.state;
        self.state = SessionState::Leaving;

        if previous == SessionState::Joined {
            self.emit(events::DOCUMENT_LEAVE, &LeavePayload {
                note_id: self.note_id.clone(),
            });
        }
        self.unsubscribe();
        self.edits.cancel();
        self.join_retry_at = None;
        self.join_retries = 0;
        while self.inbox_rx.try_recv().is_ok() {}
        self.roster.write().clear();

        self.state = SessionState::Idle;
        if previous != SessionState::Idle {
            log::info!("Left document {}", self.note_id);
            self.notify(SessionEvent::Left {
                note_id: self.note_id.clone(),
            });
        }
    }

    /// Observe an editor document change. Returns whether a broadcast was
    /// scheduled.
    pub fn on_local_change(&mut self, origin: ChangeOrigin, now: Instant) -> bool {
        if origin == ChangeOrigin::Remote || self.gate.is_applying() {
            return false;
        }
        if self.read_only || self.state != SessionState::Joined {
            return false;
        }
        self.edits.schedule((), now);
        true
    }

    /// Run due timers: join retries and the debounced edit broadcast.
    pub fn poll<E>(&mut self, editor: &E, now: Instant)
    where
        E: EditorSurface + ?Sized,
    {
        if self.state == SessionState::Joining && self.join_retry_at.is_some_and(|at| now >= at) {
            self.join_retry_at = None;
            self.try_announce(now);
        }
        if self.edits.poll(now).is_some() {
            self.broadcast(editor);
        }
    }

    /// Send a pending edit right away, e.g. before leaving.
    pub fn flush<E>(&mut self, editor: &E)
    where
        E: EditorSurface + ?Sized,
    {
        if self.edits.flush().is_some() {
            self.broadcast(editor);
        }
    }

    /// Earliest instant at which [`poll`](Self::poll) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.join_retry_at, self.edits.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Handle every message already forwarded by the transport.
    pub fn process_pending<E>(&mut self, editor: &mut E, now: Instant) -> usize
    where
        E: EditorSurface + ?Sized,
    {
        let mut handled = 0;
        while let Ok(message) = self.inbox_rx.try_recv() {
            self.handle_message(editor, message, now);
            handled += 1;
        }
        handled
    }

    /// Wait for the next forwarded message.
    pub async fn next_message(&mut self) -> Option<RoomMessage> {
        self.inbox_rx.recv().await
    }

    pub fn handle_message<E>(&mut self, editor: &mut E, message: RoomMessage, now: Instant)
    where
        E: EditorSurface + ?Sized,
    {
        if !matches!(self.state, SessionState::Joining | SessionState::Joined) {
            log::trace!("Ignoring room message outside a room: {message:?}");
            return;
        }
        match message {
            RoomMessage::Users(payload) => {
                self.roster.write().set_roster(payload.decoded());
                self.notify(SessionEvent::RosterChanged);
            }
            RoomMessage::UserJoined(user) => {
                if self.roster.write().add_user(user) {
                    self.notify(SessionEvent::RosterChanged);
                }
            }
            RoomMessage::UserLeft(payload) => {
                if self
                    .roster
                    .write()
                    .remove_session(&payload.user_id, &payload.session_id)
                {
                    self.notify(SessionEvent::RosterChanged);
                }
            }
            RoomMessage::Updated(update) => self.apply_update(editor, update),
            RoomMessage::Conflict(conflict) => self.handle_conflict(conflict),
            RoomMessage::Connected => match self.state {
                SessionState::Joined => {
                    log::info!("Transport reconnected, re-joining {}", self.note_id);
                    self.announce();
                }
                _ => self.try_announce(now),
            },
        }
    }

    pub fn note_id(&self) -> &str {
        &self.note_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_joined(&self) -> bool {
        self.state == SessionState::Joined
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn local_version(&self) -> u64 {
        self.local_version
    }

    pub fn roster(&self) -> SharedRoster {
        self.roster.clone()
    }

    /// The gate shared with components that watch editor notifications.
    pub fn gate(&self) -> ApplyGate {
        self.gate.clone()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub fn identity(&self) -> Arc<dyn IdentityProvider> {
        self.identity.clone()
    }

    pub fn has_pending_edit(&self) -> bool {
        self.edits.is_pending()
    }

    // ── internals ──────────────────────────────────────────────────

    fn try_announce(&mut self, now: Instant) {
        if self.state != SessionState::Joining {
            return;
        }
        if self.transport.is_connected() {
            self.join_retry_at = None;
            self.state = SessionState::Joined;
            self.announce();
            self.roster.write().set_connected(true);
            log::info!("Joined document {}", self.note_id);
            self.notify(SessionEvent::Joined {
                note_id: self.note_id.clone(),
            });
            return;
        }

        if let Some(limit) = self.join_retry_limit {
            if self.join_retries >= limit {
                let attempts = self.join_retries;
                log::warn!("Giving up joining {} after {attempts} retries", self.note_id);
                self.unsubscribe();
                self.join_retry_at = None;
                self.state = SessionState::Idle;
                self.notify(SessionEvent::JoinAbandoned { attempts });
                return;
            }
        }
        self.join_retries += 1;
        self.join_retry_at = Some(now + self.join_retry_delay);
        log::debug!(
            "Transport not connected, retrying join of {} in {:?}",
            self.note_id,
            self.join_retry_delay
        );
    }

    fn announce(&self) {
        self.emit(events::DOCUMENT_JOIN, &JoinPayload {
            note_id: self.note_id.clone(),
            read_only: self.read_only,
        });
    }

    fn broadcast<E>(&self, editor: &E)
    where
        E: EditorSurface + ?Sized,
    {
        if self.state != SessionState::Joined || self.read_only {
            return;
        }
        self.emit(events::DOCUMENT_EDIT, &EditPayload {
            note_id: self.note_id.clone(),
            operations: vec![Operation::SetContent {
                content: editor.document(),
            }],
            version: self.local_version,
        });
    }

    fn apply_update<E>(&mut self, editor: &mut E, update: DocumentUpdatedPayload)
    where
        E: EditorSurface + ?Sized,
    {
        if update.version > self.local_version {
            self.local_version = update.version;
        }

        let own_id = self.identity.current_user_id();
        if !update.user_id.is_empty() && own_id.as_deref() == Some(update.user_id.as_str()) {
            log::trace!("Dropping own echo at version {}", update.version);
            return;
        }

        let (operations, skipped) = decode_operations(&update.operations);
        let mut report = {
            let scope = self.gate.enter();
            apply_operations(editor, &operations, &scope)
        };
        report.failed += skipped;
        log::debug!(
            "Applied update v{} from {}: {report:?}",
            update.version,
            update.user_name
        );
        self.notify(SessionEvent::RemoteUpdateApplied {
            version: update.version,
            user_name: update.user_name,
            report,
        });
    }

    fn handle_conflict(&mut self, conflict: ConflictPayload) {
        log::warn!(
            "Version conflict on {}: server at {}, we sent {}",
            self.note_id,
            conflict.current_version,
            conflict.your_version
        );
        self.local_version = conflict.current_version;
        self.notify(SessionEvent::Conflict {
            current_version: conflict.current_version,
            your_version: conflict.your_version,
        });
    }

    fn subscribe(&mut self) {
        if !self.subscriptions.is_empty() {
            return;
        }
        for event in ROOM_EVENTS {
            let inbox = self.inbox_tx.clone();
            let id = self.transport.on(
                event,
                Arc::new(move |data: &serde_json::Value| match RoomMessage::parse(event, data) {
                    Ok(message) => {
                        let _ = inbox.send(message);
                    }
                    Err(e) => log::warn!("Ignoring `{event}`: {e}"),
                }),
            );
            self.subscriptions.push((event, id));
        }
    }

    fn unsubscribe(&mut self) {
        for (event, id) in self.subscriptions.drain(..) {
            self.transport.off(event, id);
        }
    }

    fn emit<T: serde::Serialize>(&self, event: &str, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => self.transport.emit(event, value),
            Err(e) => log::warn!("Failed to encode `{event}`: {e}"),
        }
    }

    fn notify(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Build a `document:updated` payload.
pub fn updated_payload(operations: &[Operation], version: u64, user_id: &str, user_name: &str) -> serde_json::Value {
    json!({
        "operations": operations,
        "version": version,
        "userId": user_id,
        "userName": user_name,
    })
}

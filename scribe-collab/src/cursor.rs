//! Cursor broadcaster: local caret out, remote carets in.
//!
//! ```text
//! local selection change
//!       │  user-driven, editable, focused, no remote apply in progress
//!       ▼
//! position_to_coordinate() ──► Debouncer (100ms) ──► cursor:update
//!
//! cursor:moved ──► drop own ──► PresenceRoster::update_cursor()
//!                                      │
//!                                      ▼
//!                       visible_cursors() for rendering
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::config::CollabConfig;
use crate::coords::{coordinate_to_position, position_to_coordinate, DocumentPosition};
use crate::debounce::Debouncer;
use crate::document::Document;
use crate::editor::{ChangeOrigin, EditorSurface, IdentityProvider, Selection};
use crate::presence::{color_for_user, PresenceRoster, SharedRoster, ANONYMOUS};
use crate::protocol::{decode_payload, events, is_present, CursorMovedPayload, CursorUpdatePayload};
use crate::session::{ApplyGate, DocumentSession};
use crate::transport::{HandlerId, Transport};

/// A remote caret placed in the local document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCursor {
    pub user_id: String,
    pub user_name: String,
    pub color: String,
    /// Linear offset into the local document
    pub offset: usize,
}

/// Remote carets that still address a live line, ordered by user id.
///
/// Cursors on lines the local document no longer has are left out.
pub fn visible_cursors(document: &Document, roster: &PresenceRoster) -> Vec<RenderedCursor> {
    let mut cursors: Vec<RenderedCursor> = roster
        .cursors()
        .values()
        .filter_map(|info| {
            let offset = coordinate_to_position(document, info.position)?;
            Some(RenderedCursor {
                user_id: info.user.id.clone(),
                user_name: info.user.name.clone(),
                color: info.color.clone(),
                offset,
            })
        })
        .collect();
    cursors.sort_by(|a, b| a.user_id.cmp(&b.user_id));
    cursors
}

/// Publishes the local caret and collects remote ones for one note.
pub struct CursorBroadcaster {
    note_id: String,
    transport: Arc<dyn Transport>,
    identity: Arc<dyn IdentityProvider>,
    roster: SharedRoster,
    gate: ApplyGate,
    pending: Debouncer<DocumentPosition>,
    subscription: Option<HandlerId>,
    inbox_tx: mpsc::UnboundedSender<CursorMovedPayload>,
    inbox_rx: mpsc::UnboundedReceiver<CursorMovedPayload>,
}

impl CursorBroadcaster {
    pub fn new(
        note_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityProvider>,
        roster: SharedRoster,
        gate: ApplyGate,
        debounce: Duration,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            note_id: note_id.into(),
            transport,
            identity,
            roster,
            gate,
            pending: Debouncer::new(debounce),
            subscription: None,
            inbox_tx,
            inbox_rx,
        }
    }

    /// Share the session's transport, identity, roster and apply gate.
    pub fn for_session(session: &DocumentSession, config: &CollabConfig) -> Self {
        Self::new(
            session.note_id(),
            session.transport(),
            session.identity(),
            session.roster(),
            session.gate(),
            config.cursor_debounce,
        )
    }

    /// Start listening for remote cursors. Idempotent.
    pub fn start(&mut self) {
        if self.subscription.is_some() {
            return;
        }
        let inbox = self.inbox_tx.clone();
        let id = self.transport.on(
            events::CURSOR_MOVED,
            Arc::new(move |data: &serde_json::Value| {
                match decode_payload::<CursorMovedPayload>(events::CURSOR_MOVED, data) {
                    Ok(payload) => {
                        let _ = inbox.send(payload);
                    }
                    Err(e) => log::debug!("Ignoring cursor: {e}"),
                }
            }),
        );
        self.subscription = Some(id);
    }

    /// Stop listening and drop any unsent caret.
    pub fn stop(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.transport.off(events::CURSOR_MOVED, id);
        }
        self.pending.cancel();
        while self.inbox_rx.try_recv().is_ok() {}
    }

    pub fn is_started(&self) -> bool {
        self.subscription.is_some()
    }

    /// Observe a selection change. Returns whether a broadcast was
    /// scheduled.
    ///
    /// Only user-driven changes in a focused, editable editor count;
    /// selection moves caused by applying a remote update never do.
    pub fn on_selection_change<E>(&mut self, editor: &E, selection: Selection, origin: ChangeOrigin, now: Instant) -> bool
    where
        E: EditorSurface + ?Sized,
    {
        if !self.is_started() || origin == ChangeOrigin::Remote || self.gate.is_applying() {
            return false;
        }
        if !editor.is_editable() || !editor.is_focused() {
            return false;
        }
        let position = position_to_coordinate(&editor.document(), selection.from);
        self.pending.schedule(position, now);
        true
    }

    /// Send the caret once it has settled.
    pub fn poll(&mut self, now: Instant) {
        if let Some(position) = self.pending.poll(now) {
            self.send(position);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.deadline()
    }

    /// Store every forwarded remote cursor.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(payload) = self.inbox_rx.try_recv() {
            self.handle_moved(payload);
            handled += 1;
        }
        handled
    }

    /// Wait for the next forwarded remote cursor.
    pub async fn next_moved(&mut self) -> Option<CursorMovedPayload> {
        self.inbox_rx.recv().await
    }

    pub fn handle_moved(&mut self, payload: CursorMovedPayload) {
        if !is_present(&payload.user_id) {
            return;
        }
        if self.identity.current_user_id().as_deref() == Some(payload.user_id.as_str()) {
            return;
        }
        let name = if is_present(&payload.user_name) {
            payload.user_name.as_str()
        } else {
            ANONYMOUS
        };
        let color = if payload.color.is_empty() {
            color_for_user(&payload.user_id)
        } else {
            payload.color.as_str()
        };
        self.roster
            .write()
            .update_cursor(&payload.user_id, payload.position, name, color);
    }

    fn send(&self, position: DocumentPosition) {
        if !self.transport.is_connected() {
            return;
        }
        let payload = CursorUpdatePayload {
            note_id: self.note_id.clone(),
            position,
        };
        match serde_json::to_value(&payload) {
            Ok(value) => self.transport.emit(events::CURSOR_UPDATE, value),
            Err(e) => log::warn!("Failed to encode cursor update: {e}"),
        }
    }
}

impl Drop for CursorBroadcaster {
    fn drop(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.transport.off(events::CURSOR_MOVED, id);
        }
    }
}

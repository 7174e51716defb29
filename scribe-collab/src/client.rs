//! Async driver tying a transport, an editor and one document room together.
//!
//! ```text
//!   transport handlers ──► session inbox ──┐
//!   transport handlers ──► cursor inbox  ──┤
//!   editor events ─────────────────────────┼──► select! ──► DocumentSession
//!   debounce / join-retry deadlines ───────┘               CursorBroadcaster
//! ```
//!
//! Everything runs on one task, so roster, cursors and the version counter
//! are only ever touched from this loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::config::CollabConfig;
use crate::cursor::{visible_cursors, CursorBroadcaster, RenderedCursor};
use crate::editor::{EditorEvent, EditorSurface, IdentityProvider};
use crate::presence::SharedRoster;
use crate::protocol::{CursorMovedPayload, RoomMessage};
use crate::session::{DocumentSession, SessionEvent};
use crate::transport::Transport;

enum Step {
    Room(RoomMessage),
    Cursor(CursorMovedPayload),
    Editor(EditorEvent),
    EditorClosed,
    Timer,
    Shutdown,
}

/// Collaboration client for one open note.
pub struct CollabClient<E: EditorSurface> {
    session: DocumentSession,
    cursors: CursorBroadcaster,
    editor: E,
    editor_events: mpsc::UnboundedReceiver<EditorEvent>,
    editor_closed: bool,
}

impl<E: EditorSurface> CollabClient<E> {
    pub fn new(
        note_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityProvider>,
        config: &CollabConfig,
        editor: E,
        editor_events: mpsc::UnboundedReceiver<EditorEvent>,
    ) -> Self {
        let session = DocumentSession::new(note_id, transport, identity, config);
        let cursors = CursorBroadcaster::for_session(&session, config);
        Self {
            session,
            cursors,
            editor,
            editor_events,
            editor_closed: false,
        }
    }

    /// Join as a viewer.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.session = self.session.read_only(read_only);
        self
    }

    /// Join the room and start tracking cursors.
    pub fn start(&mut self) {
        self.session.join(Instant::now());
        self.cursors.start();
    }

    /// Process events until `stop` resolves.
    pub async fn drive<F>(&mut self, stop: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(stop);
        loop {
            match self.next_step(stop.as_mut()).await {
                Step::Shutdown => break,
                step => self.handle(step),
            }
        }
    }

    /// Send whatever is pending, leave the room and stop tracking cursors.
    pub fn finish(&mut self) {
        self.session.flush(&self.editor);
        self.session.leave();
        self.cursors.stop();
    }

    /// Join, run until `shutdown` resolves, then leave. Returns the editor.
    pub async fn run<F>(mut self, shutdown: F) -> E
    where
        F: Future<Output = ()>,
    {
        self.start();
        self.drive(shutdown).await;
        self.finish();
        log::info!("Collaboration on {} stopped", self.session.note_id());
        self.editor
    }

    pub fn editor(&self) -> &E {
        &self.editor
    }

    /// Local edits made here reach the session through the editor's
    /// event channel on the next [`drive`](Self::drive).
    pub fn editor_mut(&mut self) -> &mut E {
        &mut self.editor
    }

    pub fn session(&self) -> &DocumentSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut DocumentSession {
        &mut self.session
    }

    pub fn roster(&self) -> SharedRoster {
        self.session.roster()
    }

    /// Remote carets placed in the current document.
    pub fn visible_cursors(&self) -> Vec<RenderedCursor> {
        let document = self.editor.document();
        let roster = self.session.roster();
        let roster = roster.read();
        visible_cursors(&document, &roster)
    }

    /// Take the session event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.session.take_event_rx()
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.session.next_deadline(), self.cursors.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn next_step<F>(&mut self, stop: Pin<&mut F>) -> Step
    where
        F: Future<Output = ()>,
    {
        let deadline = self.next_deadline();
        let timer = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                None => std::future::pending::<()>().await,
            }
        };
        let editor_open = !self.editor_closed;

        tokio::select! {
            _ = stop => Step::Shutdown,
            Some(message) = self.session.next_message() => Step::Room(message),
            Some(moved) = self.cursors.next_moved() => Step::Cursor(moved),
            event = self.editor_events.recv(), if editor_open => match event {
                Some(event) => Step::Editor(event),
                None => Step::EditorClosed,
            },
            _ = timer => Step::Timer,
        }
    }

    fn handle(&mut self, step: Step) {
        let now = Instant::now();
        match step {
            Step::Room(message) => self.session.handle_message(&mut self.editor, message, now),
            Step::Cursor(moved) => self.cursors.handle_moved(moved),
            Step::Editor(EditorEvent::DocumentChanged { origin }) => {
                self.session.on_local_change(origin, now);
            }
            Step::Editor(EditorEvent::SelectionChanged { selection, origin }) => {
                self.cursors
                    .on_selection_change(&self.editor, selection, origin, now);
            }
            Step::EditorClosed => {
                log::debug!("Editor event channel closed");
                self.editor_closed = true;
            }
            Step::Timer | Step::Shutdown => {}
        }
        self.session.poll(&self.editor, now);
        self.cursors.poll(now);
    }
}

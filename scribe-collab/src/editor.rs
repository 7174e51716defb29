//! Interfaces to the collaborators around the sync core: the editing
//! surface, the identity provider and the credential store.
//!
//! The core never edits the document on its own behalf. Every mutation
//! method on [`EditorSurface`] demands a [`RemoteApply`] token, which only
//! exists while a remote update is being applied, so the surface can tag
//! the resulting change notifications as [`ChangeOrigin::Remote`].

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::document::Document;
use crate::error::EditError;
use crate::session::RemoteApply;

/// Selection as a pair of linear offsets. `from == to` is a caret.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Selection {
    pub from: usize,
    pub to: usize,
}

impl Selection {
    pub fn new(from: usize, to: usize) -> Self {
        Self { from, to }
    }

    pub fn caret(position: usize) -> Self {
        Self {
            from: position,
            to: position,
        }
    }

    pub fn is_caret(&self) -> bool {
        self.from == self.to
    }

    /// Both endpoints limited to `size`.
    pub fn clamped(&self, size: usize) -> Self {
        Self {
            from: self.from.min(size),
            to: self.to.min(size),
        }
    }
}

/// Who caused a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// The local user typed, clicked or pasted
    Local,
    /// A remote update was being applied
    Remote,
}

/// Notifications from the editing surface.
#[derive(Debug, Clone, PartialEq)]
pub enum EditorEvent {
    DocumentChanged { origin: ChangeOrigin },
    SelectionChanged { selection: Selection, origin: ChangeOrigin },
}

/// The rich-text editing surface, as seen by the sync core.
pub trait EditorSurface {
    /// Current document tree.
    fn document(&self) -> Document;

    fn selection(&self) -> Selection;

    fn is_focused(&self) -> bool;

    fn is_editable(&self) -> bool;

    /// Replace the whole document.
    fn replace_document(&mut self, document: Document, scope: &RemoteApply<'_>) -> Result<(), EditError>;

    fn insert_text(&mut self, position: usize, text: &str, scope: &RemoteApply<'_>) -> Result<(), EditError>;

    fn delete_range(&mut self, from: usize, to: usize, scope: &RemoteApply<'_>) -> Result<(), EditError>;

    fn set_selection(&mut self, selection: Selection, scope: &RemoteApply<'_>);
}

/// Source of the authenticated user's stable id.
pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> Option<String>;
}

/// Source of the access token attached at connect time.
pub trait CredentialStore: Send + Sync {
    fn access_token(&self) -> Option<String>;
}

/// Fixed identity.
#[derive(Debug, Clone)]
pub struct StaticIdentity(pub Option<String>);

impl StaticIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self(Some(user_id.into()))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user_id(&self) -> Option<String> {
        self.0.clone()
    }
}

impl<F> IdentityProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn current_user_id(&self) -> Option<String> {
        self()
    }
}

/// Fixed token.
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub Option<String>);

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl CredentialStore for StaticCredentials {
    fn access_token(&self) -> Option<String> {
        self.0.clone()
    }
}

impl<T: CredentialStore + ?Sized> CredentialStore for Arc<T> {
    fn access_token(&self) -> Option<String> {
        (**self).access_token()
    }
}

// ───────────────────────────────────────────────────────────────────
// Headless surface
// ───────────────────────────────────────────────────────────────────

/// In-memory editing surface.
///
/// Used for headless clients (bots, importers) and in tests. Local edits
/// go through the inherent methods; remote edits through
/// [`EditorSurface`]. Every change is reported on the event channel.
pub struct MemoryEditor {
    document: Document,
    selection: Selection,
    focused: bool,
    editable: bool,
    remote_mutations: usize,
    events: mpsc::UnboundedSender<EditorEvent>,
}

impl MemoryEditor {
    /// Create an editor and the receiver for its change notifications.
    pub fn new(document: Document) -> (Self, mpsc::UnboundedReceiver<EditorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let editor = Self {
            document,
            selection: Selection::caret(1),
            focused: false,
            editable: true,
            remote_mutations: 0,
            events,
        };
        (editor, rx)
    }

    /// Type `text` at `position` and leave the caret after it.
    pub fn type_text(&mut self, position: usize, text: &str) -> Result<(), EditError> {
        if !self.editable {
            return Err(EditError::Rejected("editor is read-only".to_string()));
        }
        self.document.insert_text(position, text)?;
        self.selection = Selection::caret(position + text.chars().count());
        self.notify_document(ChangeOrigin::Local);
        self.notify_selection(ChangeOrigin::Local);
        Ok(())
    }

    /// Delete `from..to` as the local user.
    pub fn delete(&mut self, from: usize, to: usize) -> Result<(), EditError> {
        if !self.editable {
            return Err(EditError::Rejected("editor is read-only".to_string()));
        }
        self.document.delete_range(from, to)?;
        self.selection = Selection::caret(from);
        self.notify_document(ChangeOrigin::Local);
        self.notify_selection(ChangeOrigin::Local);
        Ok(())
    }

    /// Move the local selection.
    pub fn select(&mut self, selection: Selection) {
        self.selection = selection.clamped(self.document.content_size());
        self.notify_selection(ChangeOrigin::Local);
    }

    pub fn focus(&mut self) {
        self.focused = true;
    }

    pub fn blur(&mut self) {
        self.focused = false;
    }

    pub fn set_editable(&mut self, editable: bool) {
        self.editable = editable;
    }

    pub fn current(&self) -> &Document {
        &self.document
    }

    /// Number of mutations performed through [`EditorSurface`].
    pub fn remote_mutation_count(&self) -> usize {
        self.remote_mutations
    }

    fn notify_document(&self, origin: ChangeOrigin) {
        let _ = self.events.send(EditorEvent::DocumentChanged { origin });
    }

    fn notify_selection(&self, origin: ChangeOrigin) {
        let _ = self.events.send(EditorEvent::SelectionChanged {
            selection: self.selection,
            origin,
        });
    }
}

impl EditorSurface for MemoryEditor {
    fn document(&self) -> Document {
        self.document.clone()
    }

    fn selection(&self) -> Selection {
        self.selection
    }

    fn is_focused(&self) -> bool {
        self.focused
    }

    fn is_editable(&self) -> bool {
        self.editable
    }

    fn replace_document(&mut self, document: Document, _scope: &RemoteApply<'_>) -> Result<(), EditError> {
        self.document = document;
        self.selection = self.selection.clamped(self.document.content_size());
        self.remote_mutations += 1;
        self.notify_document(ChangeOrigin::Remote);
        self.notify_selection(ChangeOrigin::Remote);
        Ok(())
    }

    fn insert_text(&mut self, position: usize, text: &str, _scope: &RemoteApply<'_>) -> Result<(), EditError> {
        self.document.insert_text(position, text)?;
        let len = text.chars().count();
        let shift = |p: usize| if p >= position { p + len } else { p };
        self.selection = Selection::new(shift(self.selection.from), shift(self.selection.to));
        self.remote_mutations += 1;
        self.notify_document(ChangeOrigin::Remote);
        Ok(())
    }

    fn delete_range(&mut self, from: usize, to: usize, _scope: &RemoteApply<'_>) -> Result<(), EditError> {
        self.document.delete_range(from, to)?;
        let removed = to - from;
        let map = |p: usize| {
            if p >= to {
                p - removed
            } else if p > from {
                from
            } else {
                p
            }
        };
        self.selection = Selection::new(map(self.selection.from), map(self.selection.to));
        self.remote_mutations += 1;
        self.notify_document(ChangeOrigin::Remote);
        Ok(())
    }

    fn set_selection(&mut self, selection: Selection, _scope: &RemoteApply<'_>) {
        self.selection = selection.clamped(self.document.content_size());
        self.remote_mutations += 1;
        self.notify_selection(ChangeOrigin::Remote);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ApplyGate;

    #[test]
    fn test_selection_clamp() {
        let sel = Selection::new(4, 40).clamped(10);
        assert_eq!(sel, Selection::new(4, 10));
        assert!(Selection::caret(3).is_caret());
    }

    #[test]
    fn test_local_typing_reports_local_events() {
        let (mut editor, mut rx) = MemoryEditor::new(Document::from_paragraphs(&["Hello"]));
        editor.type_text(6, "!").unwrap();
        assert_eq!(editor.current().lines(), vec!["Hello!"]);
        assert_eq!(
            rx.try_recv().unwrap(),
            EditorEvent::DocumentChanged { origin: ChangeOrigin::Local }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            EditorEvent::SelectionChanged {
                selection: Selection::caret(7),
                origin: ChangeOrigin::Local
            }
        );
        assert_eq!(editor.remote_mutation_count(), 0);
    }

    #[test]
    fn test_remote_mutations_report_remote_events() {
        let gate = ApplyGate::new();
        let (mut editor, mut rx) = MemoryEditor::new(Document::from_paragraphs(&["Hello"]));
        editor.select(Selection::caret(6));
        let _ = rx.try_recv();
        {
            let scope = gate.enter();
            editor.insert_text(1, ">> ", &scope).unwrap();
        }
        assert_eq!(editor.current().lines(), vec![">> Hello"]);
        assert_eq!(editor.selection(), Selection::caret(9));
        assert_eq!(
            rx.try_recv().unwrap(),
            EditorEvent::DocumentChanged { origin: ChangeOrigin::Remote }
        );
        assert_eq!(editor.remote_mutation_count(), 1);
    }

    #[test]
    fn test_remote_delete_maps_selection() {
        let gate = ApplyGate::new();
        let (mut editor, _rx) = MemoryEditor::new(Document::from_paragraphs(&["abcdef"]));
        editor.select(Selection::new(3, 7));
        let scope = gate.enter();
        editor.delete_range(2, 5, &scope).unwrap();
        assert_eq!(editor.current().lines(), vec!["aef"]);
        assert_eq!(editor.selection(), Selection::new(2, 4));
    }

    #[test]
    fn test_read_only_rejects_typing() {
        let (mut editor, _rx) = MemoryEditor::new(Document::empty());
        editor.set_editable(false);
        assert!(matches!(editor.type_text(1, "x"), Err(EditError::Rejected(_))));
    }

    #[test]
    fn test_closure_identity() {
        let provider = || Some("u-9".to_string());
        assert_eq!(provider.current_user_id(), Some("u-9".to_string()));
        assert_eq!(StaticIdentity::anonymous().current_user_id(), None);
        assert_eq!(StaticCredentials::new("t").access_token(), Some("t".to_string()));
    }
}

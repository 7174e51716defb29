//! Presence roster: who is in the document room, and where their carets are.
//!
//! ```text
//! document:users ─────────► set_roster()  ──┐
//! document:user:joined ───► add_user()    ──┤   validity gate,
//! document:user:left ─────► remove_user() ──┤   one entry per userId
//!                                           ▼
//!                                    PresenceRoster ──► other_users() / summary()
//!                                           ▲
//! cursor:moved ───────────► update_cursor() ┘
//! ```
//!
//! Remote users keep the same color on every observer: it is derived from
//! the user id with a stable string hash into [`PALETTE`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::coords::DocumentPosition;
use crate::protocol::CollaborationUser;

/// Display colors for collaborators.
pub const PALETTE: [&str; 10] = [
    "#FF5733", "#33FF57", "#3357FF", "#F033FF", "#FF33A8",
    "#33FFF5", "#FF8C33", "#8C33FF", "#FF3333", "#33FF99",
];

/// Name shown for a cursor whose sender sent none.
pub const ANONYMOUS: &str = "Anonymous";

/// Deterministic palette color for `user_id`.
///
/// Shift-and-subtract string hash over UTF-16 code units, with the shift
/// performed in 32-bit arithmetic, so every client computes the same index.
pub fn color_for_user(user_id: &str) -> &'static str {
    let mut hash: i64 = 0;
    for unit in user_id.encode_utf16() {
        let shifted = ((hash as i32) << 5) as i64;
        hash = i64::from(unit) + (shifted - hash);
    }
    PALETTE[(hash.unsigned_abs() % PALETTE.len() as u64) as usize]
}

/// Random palette color, used for the local user's own avatar.
pub fn random_color() -> &'static str {
    let bytes = Uuid::new_v4().into_bytes();
    PALETTE[bytes[0] as usize % PALETTE.len()]
}

/// Up to two upper-case initials; `"U"` for an empty name.
pub fn initials(name: &str) -> String {
    let letters: String = name
        .split(' ')
        .filter_map(|word| word.chars().next())
        .flat_map(char::to_uppercase)
        .take(2)
        .collect();
    if letters.is_empty() {
        "U".to_string()
    } else {
        letters
    }
}

/// Sender of a remote cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorUser {
    pub id: String,
    pub name: String,
}

/// Last known caret of a remote user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorInfo {
    pub position: DocumentPosition,
    pub user: CursorUser,
    pub color: String,
}

/// Avatar-stack view of the roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterSummary {
    pub visible: Vec<CollaborationUser>,
    /// Users beyond `visible`, rendered as "+N"
    pub overflow: usize,
}

/// Roster shared between the session, the cursor broadcaster and the
/// rendering side.
pub type SharedRoster = Arc<RwLock<PresenceRoster>>;

/// Users in one document room plus their cursors.
///
/// All mutation goes through these methods, so invalid entries never get
/// in and each user id appears at most once.
#[derive(Debug, Clone)]
pub struct PresenceRoster {
    users: Vec<CollaborationUser>,
    cursors: HashMap<String, CursorInfo>,
    my_color: &'static str,
    connected: bool,
}

impl Default for PresenceRoster {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self {
            users: Vec::new(),
            cursors: HashMap::new(),
            my_color: random_color(),
            connected: false,
        }
    }

    pub fn shared() -> SharedRoster {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Replace the roster wholesale.
    ///
    /// Invalid entries are dropped. Duplicate user ids collapse to the last
    /// entry, kept at the position of the first.
    pub fn set_roster(&mut self, users: impl IntoIterator<Item = CollaborationUser>) {
        let mut roster: Vec<CollaborationUser> = Vec::new();
        for user in users {
            if !user.is_valid() {
                log::debug!("Dropping invalid roster entry {user:?}");
                continue;
            }
            match roster.iter_mut().find(|u| u.user_id == user.user_id) {
                Some(existing) => *existing = user,
                None => roster.push(user),
            }
        }
        self.users = roster;
    }

    /// Add or replace one user. Returns `false` if the entry was invalid.
    pub fn add_user(&mut self, user: CollaborationUser) -> bool {
        if !user.is_valid() {
            log::warn!("Invalid user data, not adding: {user:?}");
            return false;
        }
        self.users.retain(|u| u.user_id != user.user_id);
        self.users.push(user);
        true
    }

    /// Remove a user and their cursor.
    pub fn remove_user(&mut self, user_id: &str) -> bool {
        let before = self.users.len();
        self.users.retain(|u| u.user_id != user_id);
        self.cursors.remove(user_id);
        self.users.len() != before
    }

    /// Remove a user only if `session_id` is their current session.
    ///
    /// A leave for an older session arrives after the user reconnected;
    /// it must not evict the newer entry. An empty `session_id` matches.
    pub fn remove_session(&mut self, user_id: &str, session_id: &str) -> bool {
        let current = self.users.iter().find(|u| u.user_id == user_id);
        match current {
            Some(user) if session_id.is_empty() || user.session_id == session_id => {
                self.remove_user(user_id)
            }
            Some(user) => {
                log::debug!(
                    "Ignoring stale leave of {user_id}: session {session_id} != {}",
                    user.session_id
                );
                false
            }
            None => {
                self.cursors.remove(user_id);
                false
            }
        }
    }

    pub fn users(&self) -> &[CollaborationUser] {
        &self.users
    }

    pub fn user(&self, user_id: &str) -> Option<&CollaborationUser> {
        self.users.iter().find(|u| u.user_id == user_id)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Everyone except `excluding_user_id`.
    pub fn other_users(&self, excluding_user_id: Option<&str>) -> Vec<CollaborationUser> {
        self.users
            .iter()
            .filter(|u| Some(u.user_id.as_str()) != excluding_user_id)
            .cloned()
            .collect()
    }

    /// First `max_visible` other users plus the overflow count.
    pub fn summary(&self, excluding_user_id: Option<&str>, max_visible: usize) -> RosterSummary {
        let mut others = self.other_users(excluding_user_id);
        let overflow = others.len().saturating_sub(max_visible);
        others.truncate(max_visible);
        RosterSummary {
            visible: others,
            overflow,
        }
    }

    /// Store the latest caret of `user_id`, replacing any earlier one.
    pub fn update_cursor(&mut self, user_id: &str, position: DocumentPosition, user_name: &str, color: &str) {
        self.cursors.insert(
            user_id.to_string(),
            CursorInfo {
                position,
                user: CursorUser {
                    id: user_id.to_string(),
                    name: user_name.to_string(),
                },
                color: color.to_string(),
            },
        );
    }

    pub fn cursor(&self, user_id: &str) -> Option<&CursorInfo> {
        self.cursors.get(user_id)
    }

    pub fn cursors(&self) -> &HashMap<String, CursorInfo> {
        &self.cursors
    }

    pub fn clear_cursors(&mut self) {
        self.cursors.clear();
    }

    /// Drop users and cursors. The local color is kept.
    pub fn clear(&mut self) {
        self.users.clear();
        self.cursors.clear();
        self.connected = false;
    }

    /// The local user's own display color.
    pub fn my_color(&self) -> &'static str {
        self.my_color
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    /// Whether the owning session is currently in the room.
    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

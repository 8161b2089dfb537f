//! Participants, roles, and presenter arbitration — the parts of session
//! state that are plain data and need to travel over the wire (e.g. in a
//! `resync_response`). The live actor state that *owns* this data lives in
//! `tmi-service`.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConnectionId, UserId};

/// A user's access level on a threat model, as resolved by the
/// `AccessControl` collaborator at join time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Read-only access: may observe, request presenter, but never mutate.
    Reader,
    /// May mutate the diagram and hold history entries.
    Writer,
    /// Implies `Writer`, plus may end the session and always wins
    /// presenter seizure.
    Owner,
}

impl Role {
    /// Returns `true` if this role may send `diagram_operation`/
    /// `undo_request`/`redo_request` frames.
    pub fn can_write(self) -> bool {
        matches!(self, Role::Writer | Role::Owner)
    }

    /// Returns `true` if this role may seize the presenter role outright
    /// (as opposed to merely requesting it).
    pub fn can_seize_presenter(self) -> bool {
        matches!(self, Role::Writer | Role::Owner)
    }

    /// Returns `true` if this role may send `end_session`.
    pub fn can_end_session(self) -> bool {
        matches!(self, Role::Owner)
    }
}

/// One (user, connection) pair attached to a session. A user may hold
/// multiple connections to the same session; each is a distinct
/// `Participant` sharing `user_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    /// The authenticated user this participant belongs to.
    pub user_id: UserId,
    /// The user's email, as reported by the `Authenticator`.
    pub email: String,
    /// The connection this participant rides on.
    pub connection_id: ConnectionId,
    /// When this participant joined the session.
    pub joined_at: DateTime<Utc>,
    /// The role this participant was granted at join time.
    pub role: Role,
}

/// A user reference as carried on outbound frames that name a specific
/// user (`initiating_user`, `current_presenter`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// The user's id.
    pub user_id: UserId,
    /// The user's email.
    pub email: String,
}

impl From<&Participant> for User {
    fn from(participant: &Participant) -> Self {
        User {
            user_id: participant.user_id.clone(),
            email: participant.email.clone(),
        }
    }
}

/// Presenter arbitration state: at most one presenter per session, plus an
/// ordered queue of users who have requested the role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenterState {
    /// The current presenter, if any.
    pub current_presenter: Option<UserId>,
    /// Users waiting for the presenter role, in request order.
    pub pending_requests: VecDeque<UserId>,
}

impl PresenterState {
    /// Appends `user` to the pending-request queue if not already present
    /// and not already the presenter.
    pub fn request(&mut self, user: UserId) {
        if self.current_presenter.as_ref() != Some(&user) && !self.pending_requests.contains(&user)
        {
            self.pending_requests.push_back(user);
        }
    }

    /// Sets `user` as the current presenter and removes them from the
    /// pending queue, if present.
    pub fn set_presenter(&mut self, user: UserId) {
        self.pending_requests.retain(|u| u != &user);
        self.current_presenter = Some(user);
    }

    /// Clears the presenter role if `user` currently holds it. Used when a
    /// presenter disconnects.
    pub fn release_if_presenter(&mut self, user: &UserId) {
        if self.current_presenter.as_ref() == Some(user) {
            self.current_presenter = None;
        }
    }
}

/// Per-user undo/redo bookkeeping. Entries are *original seqs* the user
/// authored and that remain reachable for undo.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryCursor {
    /// Seqs the user may still undo, most recent last.
    pub undo_stack: Vec<u64>,
    /// Seqs the user may redo, most recent last.
    pub redo_stack: Vec<u64>,
}

/// The lifecycle phase of a Session Hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Accepting participants and mutations.
    Active,
    /// Refusing new participants/mutations; flushing a final persist.
    Draining,
    /// Unregistered from the Registry; resources released.
    Closed,
}

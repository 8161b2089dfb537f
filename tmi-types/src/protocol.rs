//! The wire protocol: the frame envelope and the closed sets of inbound
//! and outbound message types from spec §6.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::diagram::{Diagram, Point};
use crate::ids::{CellId, UserId};
use crate::operation::{Operation, OperationPayload};
use crate::presence::{Participant, PresenterState, User};

/// An inbound frame: envelope fields plus the typed message.
///
/// None of the inbound message types carry a user identity field — the
/// server infers identity from the authenticated connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Client-opaque id, echoed on acknowledgement/error.
    pub message_id: Uuid,
    /// The typed message itself.
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// The closed set of client→server message types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Apply a diagram mutation. Requires writer role or above.
    DiagramOperation(DiagramOperationRequest),
    /// Undo the sender's own most recent reachable operation.
    UndoRequest,
    /// Redo the sender's own most recently undone operation.
    RedoRequest,
    /// Request the presenter role (queued; granted explicitly).
    PresenterRequest,
    /// Hand the presenter role to another participant. Requires owner or
    /// current presenter.
    ChangePresenter(ChangePresenterRequest),
    /// Broadcast a cursor position. Current presenter only; not persisted.
    PresenterCursor(CursorPayload),
    /// Broadcast a selection. Current presenter only; not persisted.
    PresenterSelection(SelectionPayload),
    /// Request a full snapshot resync.
    ResyncRequest,
    /// End the session (owner only).
    EndSession,
}

/// Payload of a `diagram_operation` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramOperationRequest {
    /// Client-chosen id for this operation, used to correlate its
    /// authoritative echo and as the log entry's `op_id`.
    pub op_id: Uuid,
    /// The mutation to apply.
    pub operation: OperationPayload,
}

/// Payload of a `change_presenter` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePresenterRequest {
    /// The user to hand the presenter role to.
    pub new_presenter: UserId,
}

/// An opaque cursor position, broadcast but never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorPayload {
    /// Cursor x in diagram coordinates.
    pub x: f64,
    /// Cursor y in diagram coordinates.
    pub y: f64,
}

/// An opaque selection set, broadcast but never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionPayload {
    /// The selected cell ids.
    pub cell_ids: Vec<CellId>,
}

/// A full-state snapshot, returned for `resync_request` and on initial
/// join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResyncSnapshot {
    /// The working diagram.
    pub diagram: Diagram,
    /// The diagram's current version (mirrors `diagram.version`).
    pub version: u64,
    /// Current presenter arbitration state.
    pub presenter: PresenterState,
    /// Currently connected participants.
    pub participants: Vec<Participant>,
}

/// Classification of an error, per spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed frame: unknown type, missing field, or oversized payload.
    BadRequest,
    /// The connection's credentials were missing or invalid.
    AuthFailed,
    /// The user has no role (or insufficient role) for the requested
    /// action.
    Forbidden,
    /// The session cannot accept this request right now (e.g. draining).
    Unavailable,
    /// The operation would violate a diagram invariant.
    ValidationFailed,
    /// The operation conflicts with concurrent state and was rejected.
    Conflict,
    /// A `test` step within a `patch` operation failed.
    PreconditionFailed,
    /// An undo/redo could not be proven safe to rebase onto current state.
    UndoConflict,
    /// There is nothing left to undo for this user.
    NothingToUndo,
    /// There is nothing left to redo for this user.
    NothingToRedo,
    /// Too many consecutive malformed frames.
    ProtocolError,
    /// The connection could not keep up with its outbound queue.
    SlowConsumer,
    /// An internal, non-user-caused failure.
    Internal,
}

/// An outbound frame: envelope fields (including the authoritative `seq`)
/// plus the typed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    /// Server-assigned id for this frame.
    pub message_id: Uuid,
    /// The session sequence number at emission. For mutations this equals
    /// the operation's `seq`; for every other frame it is the session's
    /// `next_seq` at the moment of emission, so that, for any two frames
    /// sent to a participant, `seq` order matches causal order.
    pub seq: u64,
    /// The typed message itself.
    #[serde(flatten)]
    pub message: ServerMessage,
}

/// The closed set of server→client message types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authoritative echo of an applied `diagram_operation`.
    AuthoritativeOperation {
        /// The user who originated the mutation.
        initiating_user: UserId,
        /// The applied operation.
        operation: Operation,
    },
    /// Echo of an undo/redo replay.
    HistoryOperation {
        /// The user whose undo/redo this is.
        initiating_user: UserId,
        /// The operation appended to the log as a result.
        operation: Operation,
    },
    /// A `presenter_request`/`change_presenter` was denied.
    PresenterDenied {
        /// The presenter who remains in control.
        current_presenter: User,
    },
    /// Informs all participants of the current presenter.
    CurrentPresenter {
        /// The new presenter, or `None` if the role was released.
        current_presenter: Option<UserId>,
    },
    /// Echoes a successful `change_presenter`.
    ChangePresenter {
        /// The new presenter.
        new_presenter: UserId,
    },
    /// A participant joined the session.
    ParticipantJoined {
        /// The user who joined.
        joined_user: User,
    },
    /// A participant left the session (graceful or not).
    ParticipantLeft {
        /// The user who left.
        departed_user: User,
    },
    /// A participant was forcibly removed (e.g. admin terminate).
    RemoveParticipant {
        /// The user who was removed.
        removed_user: User,
    },
    /// Broadcast of the current presenter's cursor. Not persisted.
    PresenterCursor {
        /// The presenter whose cursor this is.
        presenter: UserId,
        /// The cursor position.
        cursor: CursorPayload,
    },
    /// Broadcast of the current presenter's selection. Not persisted.
    PresenterSelection {
        /// The presenter whose selection this is.
        presenter: UserId,
        /// The selected cell ids.
        selection: SelectionPayload,
    },
    /// Full-state snapshot, in response to `resync_request`.
    ResyncResponse(ResyncSnapshot),
    /// A non-fatal, per-frame error.
    Error {
        /// The error classification.
        kind: ErrorKind,
        /// A human-readable message.
        message: String,
        /// The `message_id` of the frame that caused this error.
        message_id: Uuid,
    },
    /// Persistence is failing repeatedly but the session remains usable
    /// from memory.
    PersistenceDegraded {
        /// A human-readable description of the degradation.
        message: String,
    },
}

/// Re-exported so callers building cursor payloads don't need to depend
/// directly on [`Point`] for the common case of a plain `{x, y}` cursor.
pub type Cursor = Point;

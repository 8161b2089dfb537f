//! The three error tiers from spec §7: per-frame (non-fatal), per-
//! connection (fatal to the socket), and per-session (fatal to the
//! whole diagram). Each gets its own `thiserror` enum so the type system
//! reflects which tier a failure belongs to, the same way the teacher's
//! `api::errors::Error` maps variants to a [`CloseFrame`] — except here a
//! per-frame failure must never reach for a close.

use axum::extract::ws::{CloseFrame, close_code};
use tmi_core::OperationError;
use tmi_types::protocol::ErrorKind;
use uuid::Uuid;

/// A failure scoped to one inbound frame. Reported as an `error` frame
/// referencing the offending `message_id`; the connection and session are
/// untouched.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameError {
    /// Malformed payload: wrong shape, bad JSON-Patch path, etc.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// The sender's role does not permit this frame's action.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// The operation would violate a diagram invariant.
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    /// The operation conflicts with the current diagram state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// A `test` step within a `patch` operation failed.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    /// An undo/redo could not be proven safe to rebase.
    #[error("undo conflict")]
    UndoConflict,
    /// Nothing left to undo for this user.
    #[error("nothing to undo")]
    NothingToUndo,
    /// Nothing left to redo for this user.
    #[error("nothing to redo")]
    NothingToRedo,
    /// The session cannot accept this request right now (draining).
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// An internal, non-user-caused failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl FrameError {
    /// Classifies this error per spec §6's `ErrorKind` set.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FrameError::BadRequest(_) => ErrorKind::BadRequest,
            FrameError::Forbidden(_) => ErrorKind::Forbidden,
            FrameError::ValidationFailed(_) => ErrorKind::ValidationFailed,
            FrameError::Conflict(_) => ErrorKind::Conflict,
            FrameError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            FrameError::UndoConflict => ErrorKind::UndoConflict,
            FrameError::NothingToUndo => ErrorKind::NothingToUndo,
            FrameError::NothingToRedo => ErrorKind::NothingToRedo,
            FrameError::Unavailable(_) => ErrorKind::Unavailable,
            FrameError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Builds the `error` frame's message field.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// Maps an [`OperationError`] to the frame-error tier, per spec §4.D
/// ("failure yields an Error frame (`validation_failed` or `conflict`)").
/// `DuplicateCell` is the one case that is a conflict with existing state
/// rather than a structural invariant violation; everything else is
/// `validation_failed`.
impl From<OperationError> for FrameError {
    fn from(err: OperationError) -> Self {
        match err {
            OperationError::DuplicateCell(_) => FrameError::Conflict(err.to_string()),
            OperationError::PreconditionFailed(msg) => FrameError::PreconditionFailed(msg),
            other => FrameError::ValidationFailed(other.to_string()),
        }
    }
}

/// A failure fatal to one websocket connection. The socket is closed;
/// other participants are notified via `participant_left`.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Upgrade credentials were missing or invalid.
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// The caller has no role on this threat model.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// The hub is draining or closed and refuses new participants.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// The connection could not keep up with its outbound queue.
    #[error("slow consumer")]
    SlowConsumer,
    /// Too many consecutive malformed frames.
    #[error("protocol error")]
    ProtocolError,
    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,
    /// A transport-level websocket error.
    #[error(transparent)]
    Axum(#[from] axum::Error),
}

impl ConnectionError {
    /// Transforms the error into a [`CloseFrame`] to send before dropping
    /// the socket, mirroring the teacher's `Error::into_close_frame`.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn into_close_frame(self) -> Option<CloseFrame> {
        tracing::debug!("{self:?}");
        match self {
            ConnectionError::ConnectionClosed => None,
            ConnectionError::AuthFailed(reason) => Some(CloseFrame {
                code: close_code::POLICY,
                reason: reason.into(),
            }),
            ConnectionError::Forbidden(reason) => Some(CloseFrame {
                code: close_code::POLICY,
                reason: reason.into(),
            }),
            ConnectionError::Unavailable(reason) => Some(CloseFrame {
                code: close_code::AGAIN,
                reason: reason.into(),
            }),
            ConnectionError::SlowConsumer => Some(CloseFrame {
                code: close_code::AGAIN,
                reason: "slow consumer".into(),
            }),
            ConnectionError::ProtocolError => Some(CloseFrame {
                code: close_code::PROTOCOL,
                reason: "too many malformed frames".into(),
            }),
            ConnectionError::Axum(err) => {
                tracing::trace!("transport error: {err:?}");
                Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: "unexpected error".into(),
                })
            }
        }
    }
}

/// A failure fatal to the whole session: every participant is notified
/// with `unavailable` and disconnected, and the hub unregisters itself.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The last durable snapshot could not be loaded.
    #[error("could not load diagram snapshot: {0}")]
    SnapshotLoadFailed(String),
    /// An internal invariant was violated inside the hub itself (should
    /// not happen; surfaced rather than panicking).
    #[error("internal session failure: {0}")]
    Internal(String),
}

/// Builds the `message_id` used for server-originated frames that do not
/// correlate to a specific client frame (e.g. broadcasts).
pub fn synthetic_message_id() -> Uuid {
    Uuid::new_v4()
}

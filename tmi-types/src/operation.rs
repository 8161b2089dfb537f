//! Diagram mutation operations: the four kinds a client may request, their
//! computed inverses, and the durable log entry that wraps them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::diagram::{CellEndpoint, IdentifiedCell, Point, Size};
use crate::ids::{CellId, UserId};

/// A field-level delta on a cell's mutable attributes. `None` means "leave
/// this field unchanged"; `shape` is deliberately absent since it is
/// immutable after creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellPatch {
    /// New position, if changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Point>,
    /// New size, if changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
    /// New angle, if changed. `Some(None)` would be needed to clear it;
    /// since angle is optional we use a nested option here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angle: Option<Option<f64>>,
    /// New opaque attrs object, if changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<Value>,
    /// New opaque ports object, if changed (nodes only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Value>,
    /// New vertex list, if changed (edges only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertices: Option<Vec<Point>>,
    /// New source endpoint, if changed (edges only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<CellEndpoint>,
    /// New target endpoint, if changed (edges only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<CellEndpoint>,
}

impl CellPatch {
    /// Returns `true` if this patch touches no field at all.
    pub fn is_empty(&self) -> bool {
        self == &CellPatch::default()
    }
}

/// A single cell's worth of `update_cells` instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellUpdate {
    /// The cell to update.
    pub cell_id: CellId,
    /// The fields to change.
    pub patch: CellPatch,
}

/// A JSON-Patch (RFC 6902) operation kind, restricted to the `/cells`
/// subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOpKind {
    /// Adds a value at `path`.
    Add,
    /// Replaces the value at `path`.
    Replace,
    /// Removes the value at `path`.
    Remove,
    /// Moves a value from `from` to `path`.
    Move,
    /// Copies a value from `from` to `path`.
    Copy,
    /// Asserts the value at `path` equals `value`; failure aborts the
    /// whole patch with `precondition_failed`.
    Test,
}

/// One step of a JSON-Patch-style operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
    /// The kind of step.
    pub op: PatchOpKind,
    /// A JSON Pointer, confined to the `/cells/...` subtree.
    pub path: String,
    /// The value for `add`/`replace`/`test`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// The source pointer for `move`/`copy`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

/// The four kinds of diagram mutation, each carrying its own payload.
///
/// Serialized with an internal `kind` tag, so the wire representation
/// matches spec's `kind ∈ {add_cells, update_cells, remove_cells, patch}`
/// directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum OperationPayload {
    /// Add one or more new cells. All-or-nothing.
    AddCells(Vec<IdentifiedCell>),
    /// Apply a field-level patch to one or more existing cells.
    UpdateCells(Vec<CellUpdate>),
    /// Remove one or more cells, cascading to referencing edges.
    RemoveCells(Vec<CellId>),
    /// Apply an ordered JSON-Patch-style sequence, confined to `/cells`.
    Patch(Vec<PatchOp>),
}

impl OperationPayload {
    /// A short machine-readable tag for logging/metrics, independent of
    /// the serde representation.
    pub fn kind_name(&self) -> &'static str {
        match self {
            OperationPayload::AddCells(_) => "add_cells",
            OperationPayload::UpdateCells(_) => "update_cells",
            OperationPayload::RemoveCells(_) => "remove_cells",
            OperationPayload::Patch(_) => "patch",
        }
    }
}

/// A durable log entry: an applied operation plus everything needed to
/// undo it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// The session-assigned monotonic sequence number.
    pub seq: u64,
    /// The client-chosen id correlating request/response.
    pub op_id: Uuid,
    /// The user who authored this operation.
    pub initiating_user: UserId,
    /// The applied payload.
    pub payload: OperationPayload,
    /// The computed opposite, sufficient to undo `payload` against the
    /// pre-image it was computed from.
    pub inverse: OperationPayload,
    /// Whether this entry has been undone and is no longer reachable for
    /// a fresh undo (but may still be redone).
    pub undone: bool,
    /// Whether this entry's inverse can no longer be proven safe to
    /// apply (see the rebase policy).
    pub superseded: bool,
    /// Server clock at apply time.
    pub applied_at: DateTime<Utc>,
}

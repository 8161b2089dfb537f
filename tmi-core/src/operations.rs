//! The Operation Processor (spec §4.D): pure functions applying the four
//! mutation kinds to a diagram, enforcing its invariants, and producing
//! the inverse needed to undo them later.
//!
//! Every function here is `(pre-image, op) -> (post-image, inverse,
//! error)`. None of them read the wall clock or touch I/O; the caller
//! supplies `now` explicitly so the Session Hub stays the single source
//! of truth for time.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use json_patch::{PatchOperation, diff, patch as apply_json_patch};
use jsonptr::PointerBuf;
use serde_json::Value;
use tmi_types::diagram::{Cell, Diagram, IdentifiedCell};
use tmi_types::ids::CellId;
use tmi_types::operation::{CellPatch, CellUpdate, OperationPayload, PatchOp, PatchOpKind};

/// Everything that can go wrong applying an [`OperationPayload`] to a
/// [`Diagram`]. Every variant maps to `validation_failed` or
/// `precondition_failed` at the protocol layer (spec §7) — none of these
/// are ever `internal`.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum OperationError {
    /// `update_cells`/`remove_cells`/`patch` named a cell that doesn't
    /// exist.
    #[error("unknown cell {0}")]
    UnknownCell(CellId),
    /// `add_cells` named a `cell_id` already present in the diagram, or
    /// duplicated within the same request.
    #[error("cell {0} already exists")]
    DuplicateCell(CellId),
    /// A node's `parent`, or an edge's `source`/`target`, names a cell
    /// that does not exist in the post-image.
    #[error("cell {cell} references missing cell {missing}")]
    InvalidReference {
        /// The cell carrying the dangling reference.
        cell: CellId,
        /// The cell it references.
        missing: CellId,
    },
    /// A node's `parent` chain would cycle back to itself.
    #[error("cell {0}'s parent chain forms a cycle")]
    CycleDetected(CellId),
    /// `update_cells` attempted to change a field that doesn't apply to
    /// the patched cell's kind (e.g. `vertices` on a node).
    #[error("cell {0} does not support this patch field")]
    UnsupportedField(CellId),
    /// A `patch` step's path did not start with `/cells/`.
    #[error("patch path {0} is outside the cells subtree")]
    PatchOutsideCells(String),
    /// A `patch` step's path or pointer syntax was malformed.
    #[error("malformed patch path {0}")]
    InvalidPatchPath(String),
    /// A `patch` `test` step did not match, or an `add`/`remove`/`move`/
    /// `copy` step could not be applied against the current document.
    #[error("patch precondition failed: {0}")]
    PreconditionFailed(String),
    /// The post-image of a `patch` did not deserialize back into valid
    /// cells.
    #[error("patch produced an invalid cell: {0}")]
    MalformedResult(String),
}

/// Applies `payload` to `pre`, returning the post-image and `payload`'s
/// inverse. Leaves `pre` untouched on error — callers must not commit any
/// partial state on `Err`.
pub fn apply_operation(
    pre: &Diagram,
    payload: &OperationPayload,
    now: DateTime<Utc>,
) -> Result<(Diagram, OperationPayload), OperationError> {
    match payload {
        OperationPayload::AddCells(cells) => apply_add_cells(pre, cells, now),
        OperationPayload::UpdateCells(updates) => apply_update_cells(pre, updates, now),
        OperationPayload::RemoveCells(ids) => apply_remove_cells(pre, ids, now),
        OperationPayload::Patch(ops) => apply_patch(pre, ops, now),
    }
}

fn validate_invariants(diagram: &Diagram) -> Result<(), OperationError> {
    for (id, cell) in &diagram.cells {
        for referenced in cell.referenced_cells() {
            if !diagram.contains(referenced) {
                return Err(OperationError::InvalidReference {
                    cell: *id,
                    missing: referenced,
                });
            }
        }
    }
    for (id, cell) in &diagram.cells {
        if let Cell::Node(node) = cell
            && node.parent.is_some()
        {
            detect_cycle(diagram, *id)?;
        }
    }
    Ok(())
}

/// Walks `start`'s parent chain, bounded by the number of cells in the
/// diagram (a cycle can never be longer than that), and fails if it
/// revisits a cell.
fn detect_cycle(diagram: &Diagram, start: CellId) -> Result<(), OperationError> {
    let mut seen = HashSet::with_capacity(diagram.cells.len());
    seen.insert(start);
    let mut current = start;
    loop {
        let Some(Cell::Node(node)) = diagram.cells.get(&current) else {
            break;
        };
        let Some(parent) = node.parent else {
            break;
        };
        if !seen.insert(parent) {
            return Err(OperationError::CycleDetected(start));
        }
        current = parent;
    }
    Ok(())
}

fn apply_add_cells(
    pre: &Diagram,
    cells: &[IdentifiedCell],
    now: DateTime<Utc>,
) -> Result<(Diagram, OperationPayload), OperationError> {
    let mut seen_in_request = HashSet::with_capacity(cells.len());
    for identified in cells {
        if pre.contains(identified.id) || !seen_in_request.insert(identified.id) {
            return Err(OperationError::DuplicateCell(identified.id));
        }
    }

    let mut post = pre.clone();
    for identified in cells {
        post.cells.insert(identified.id, identified.cell.clone());
    }
    validate_invariants(&post)?;
    post.version += 1;
    post.updated_at = now;
    post.dirty = true;

    let inverse = OperationPayload::RemoveCells(cells.iter().map(|c| c.id).collect());
    Ok((post, inverse))
}

fn apply_update_cells(
    pre: &Diagram,
    updates: &[CellUpdate],
    now: DateTime<Utc>,
) -> Result<(Diagram, OperationPayload), OperationError> {
    let mut post = pre.clone();
    let mut inverse_updates = Vec::with_capacity(updates.len());

    for update in updates {
        let cell = post
            .cells
            .get(&update.cell_id)
            .ok_or(OperationError::UnknownCell(update.cell_id))?
            .clone();
        let (new_cell, undo_patch) = apply_cell_patch(update.cell_id, &cell, &update.patch)?;
        post.cells.insert(update.cell_id, new_cell);
        inverse_updates.push(CellUpdate {
            cell_id: update.cell_id,
            patch: undo_patch,
        });
    }

    validate_invariants(&post)?;
    post.version += 1;
    post.updated_at = now;
    post.dirty = true;

    // A request may patch the same cell twice; undo that in the opposite
    // order it was applied.
    inverse_updates.reverse();
    Ok((post, OperationPayload::UpdateCells(inverse_updates)))
}

fn apply_cell_patch(
    id: CellId,
    cell: &Cell,
    patch: &CellPatch,
) -> Result<(Cell, CellPatch), OperationError> {
    match cell {
        Cell::Node(node) => {
            if patch.vertices.is_some() || patch.source.is_some() || patch.target.is_some() {
                return Err(OperationError::UnsupportedField(id));
            }
            let mut node = node.clone();
            let mut undo = CellPatch::default();
            if let Some(position) = patch.position {
                undo.position = Some(node.position);
                node.position = position;
            }
            if let Some(size) = patch.size {
                undo.size = Some(node.size);
                node.size = size;
            }
            if let Some(angle) = patch.angle {
                undo.angle = Some(node.angle);
                node.angle = angle;
            }
            if let Some(attrs) = &patch.attrs {
                undo.attrs = Some(node.attrs.clone());
                node.attrs = attrs.clone();
            }
            if let Some(ports) = &patch.ports {
                undo.ports = Some(node.ports.clone());
                node.ports = ports.clone();
            }
            Ok((Cell::Node(node), undo))
        }
        Cell::Edge(edge) => {
            if patch.position.is_some()
                || patch.size.is_some()
                || patch.angle.is_some()
                || patch.ports.is_some()
            {
                return Err(OperationError::UnsupportedField(id));
            }
            let mut edge = edge.clone();
            let mut undo = CellPatch::default();
            if let Some(vertices) = &patch.vertices {
                undo.vertices = Some(edge.vertices.clone());
                edge.vertices = vertices.clone();
            }
            if let Some(source) = &patch.source {
                undo.source = Some(edge.source.clone());
                edge.source = source.clone();
            }
            if let Some(target) = &patch.target {
                undo.target = Some(edge.target.clone());
                edge.target = target.clone();
            }
            if let Some(attrs) = &patch.attrs {
                undo.attrs = Some(edge.attrs.clone());
                edge.attrs = attrs.clone();
            }
            Ok((Cell::Edge(edge), undo))
        }
    }
}

fn apply_remove_cells(
    pre: &Diagram,
    ids: &[CellId],
    now: DateTime<Utc>,
) -> Result<(Diagram, OperationPayload), OperationError> {
    for id in ids {
        if !pre.contains(*id) {
            return Err(OperationError::UnknownCell(*id));
        }
    }

    let mut to_remove: HashSet<CellId> = ids.iter().copied().collect();
    for id in ids {
        to_remove.extend(pre.edges_referencing(*id));
    }

    // Deterministic inverse ordering independent of `HashSet` iteration,
    // so two replays of the same removal always produce the same
    // `add_cells` inverse.
    let mut removed: Vec<IdentifiedCell> = to_remove
        .iter()
        .map(|id| IdentifiedCell {
            id: *id,
            cell: pre.cells[id].clone(),
        })
        .collect();
    removed.sort_by_key(|identified| identified.id.into_inner());

    let mut post = pre.clone();
    for id in &to_remove {
        post.cells.remove(id);
    }
    // A node whose parent was removed is orphaned rather than cascaded:
    // only edges referencing a removed node are cascade-removed (spec
    // §4.D); clearing the dangling parent keeps §3's reference invariant
    // satisfied without silently deleting cells the caller never asked
    // to remove.
    for cell in post.cells.values_mut() {
        if let Cell::Node(node) = cell
            && node.parent.is_some_and(|parent| to_remove.contains(&parent))
        {
            node.parent = None;
        }
    }

    validate_invariants(&post)?;
    post.version += 1;
    post.updated_at = now;
    post.dirty = true;

    Ok((post, OperationPayload::AddCells(removed)))
}

const CELLS_PREFIX: &str = "/cells";

/// Strips the `/cells` prefix every client-supplied pointer must carry,
/// rejecting anything outside that subtree (spec §4.D: "root-level
/// changes are rejected").
fn strip_cells_prefix(path: &str) -> Result<PointerBuf, OperationError> {
    let suffix = path
        .strip_prefix(CELLS_PREFIX)
        .filter(|rest| rest.starts_with('/'))
        .ok_or_else(|| OperationError::PatchOutsideCells(path.to_owned()))?;
    PointerBuf::parse(suffix).map_err(|_| OperationError::InvalidPatchPath(path.to_owned()))
}

fn to_json_patch_operation(op: &PatchOp) -> Result<PatchOperation, OperationError> {
    let path = strip_cells_prefix(&op.path)?;
    let from = |from: &Option<String>| -> Result<PointerBuf, OperationError> {
        let from = from
            .as_deref()
            .ok_or_else(|| OperationError::InvalidPatchPath(op.path.clone()))?;
        strip_cells_prefix(from)
    };
    Ok(match op.op {
        PatchOpKind::Add => PatchOperation::Add(json_patch::AddOperation {
            path,
            value: op.value.clone().unwrap_or(Value::Null),
        }),
        PatchOpKind::Replace => PatchOperation::Replace(json_patch::ReplaceOperation {
            path,
            value: op.value.clone().unwrap_or(Value::Null),
        }),
        PatchOpKind::Remove => PatchOperation::Remove(json_patch::RemoveOperation { path }),
        PatchOpKind::Move => PatchOperation::Move(json_patch::MoveOperation {
            from: from(&op.from)?,
            path,
        }),
        PatchOpKind::Copy => PatchOperation::Copy(json_patch::CopyOperation {
            from: from(&op.from)?,
            path,
        }),
        PatchOpKind::Test => PatchOperation::Test(json_patch::TestOperation {
            path,
            value: op.value.clone().unwrap_or(Value::Null),
        }),
    })
}

fn from_json_patch_operation(op: PatchOperation) -> Result<PatchOp, OperationError> {
    let restore = |p: &PointerBuf| format!("{CELLS_PREFIX}{p}");
    Ok(match op {
        PatchOperation::Add(add) => PatchOp {
            op: PatchOpKind::Add,
            path: restore(&add.path),
            value: Some(add.value),
            from: None,
        },
        PatchOperation::Replace(replace) => PatchOp {
            op: PatchOpKind::Replace,
            path: restore(&replace.path),
            value: Some(replace.value),
            from: None,
        },
        PatchOperation::Remove(remove) => PatchOp {
            op: PatchOpKind::Remove,
            path: restore(&remove.path),
            value: None,
            from: None,
        },
        PatchOperation::Move(mv) => PatchOp {
            op: PatchOpKind::Move,
            path: restore(&mv.path),
            value: None,
            from: Some(restore(&mv.from)),
        },
        PatchOperation::Copy(cp) => PatchOp {
            op: PatchOpKind::Copy,
            path: restore(&cp.path),
            value: None,
            from: Some(restore(&cp.from)),
        },
        PatchOperation::Test(test) => PatchOp {
            op: PatchOpKind::Test,
            path: restore(&test.path),
            value: Some(test.value),
            from: None,
        },
    })
}

fn apply_patch(
    pre: &Diagram,
    ops: &[PatchOp],
    now: DateTime<Utc>,
) -> Result<(Diagram, OperationPayload), OperationError> {
    let before = serde_json::to_value(&pre.cells).expect("cells always serialize to JSON");
    let mut working = before.clone();

    let json_ops = ops
        .iter()
        .map(to_json_patch_operation)
        .collect::<Result<Vec<_>, _>>()?;
    let json_patch = json_patch::Patch(json_ops);

    apply_json_patch(&mut working, &json_patch)
        .map_err(|err| OperationError::PreconditionFailed(err.to_string()))?;

    let cells: HashMap<CellId, Cell> = serde_json::from_value(working.clone())
        .map_err(|err| OperationError::MalformedResult(err.to_string()))?;

    for (id, pre_cell) in &pre.cells {
        if let Some(post_cell) = cells.get(id)
            && pre_cell.shape() != post_cell.shape()
        {
            return Err(OperationError::UnsupportedField(*id));
        }
    }

    let mut post = pre.clone();
    post.cells = cells;
    validate_invariants(&post)?;
    post.version += 1;
    post.updated_at = now;
    post.dirty = true;

    let inverse_patch = diff(&working, &before);
    let inverse_ops = inverse_patch
        .0
        .into_iter()
        .map(from_json_patch_operation)
        .collect::<Result<Vec<_>, _>>()?;

    Ok((post, OperationPayload::Patch(inverse_ops)))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use tmi_types::diagram::{Node, Point, Shape, Size};
    use tmi_types::ids::CellId;

    use super::*;

    fn node(shape: Shape, position: Point) -> Cell {
        Cell::Node(Node {
            shape,
            position,
            size: Size { w: 10.0, h: 10.0 },
            angle: None,
            attrs: json!({}),
            ports: json!({}),
            parent: None,
        })
    }

    #[test]
    fn add_cells_rejects_duplicate_id() {
        let id = CellId::new();
        let diagram = Diagram::empty(Utc::now());
        let cells = vec![
            IdentifiedCell {
                id,
                cell: node(Shape::Actor, Point { x: 0.0, y: 0.0 }),
            },
            IdentifiedCell {
                id,
                cell: node(Shape::Process, Point { x: 1.0, y: 1.0 }),
            },
        ];

        let err = apply_add_cells(&diagram, &cells, Utc::now()).unwrap_err();
        assert_eq!(err, OperationError::DuplicateCell(id));
    }

    #[test]
    fn add_cells_inverse_removes_them() {
        let id = CellId::new();
        let diagram = Diagram::empty(Utc::now());
        let cells = vec![IdentifiedCell {
            id,
            cell: node(Shape::Actor, Point { x: 0.0, y: 0.0 }),
        }];

        let (post, inverse) = apply_add_cells(&diagram, &cells, Utc::now()).unwrap();
        assert!(post.contains(id));
        assert_eq!(inverse, OperationPayload::RemoveCells(vec![id]));
    }

    #[test]
    fn remove_cells_cascades_to_referencing_edges() {
        let mut diagram = Diagram::empty(Utc::now());
        let a = CellId::new();
        let b = CellId::new();
        let edge_id = CellId::new();
        diagram
            .cells
            .insert(a, node(Shape::Actor, Point { x: 0.0, y: 0.0 }));
        diagram
            .cells
            .insert(b, node(Shape::Process, Point { x: 5.0, y: 5.0 }));
        diagram.cells.insert(
            edge_id,
            Cell::Edge(tmi_types::diagram::Edge {
                source: tmi_types::diagram::CellEndpoint::Cell(a),
                target: tmi_types::diagram::CellEndpoint::Cell(b),
                vertices: vec![],
                attrs: json!({}),
            }),
        );

        let (post, inverse) = apply_remove_cells(&diagram, &[a], Utc::now()).unwrap();
        assert!(!post.contains(a));
        assert!(!post.contains(edge_id));
        assert!(post.contains(b));
        match inverse {
            OperationPayload::AddCells(restored) => assert_eq!(restored.len(), 2),
            other => panic!("unexpected inverse {other:?}"),
        }
    }

    #[test]
    fn remove_cells_orphans_children_instead_of_cascading() {
        let mut diagram = Diagram::empty(Utc::now());
        let parent = CellId::new();
        let child = CellId::new();
        diagram
            .cells
            .insert(parent, node(Shape::SecurityBoundary, Point { x: 0.0, y: 0.0 }));
        let mut child_node = Node {
            shape: Shape::Process,
            position: Point { x: 1.0, y: 1.0 },
            size: Size { w: 1.0, h: 1.0 },
            angle: None,
            attrs: json!({}),
            ports: json!({}),
            parent: Some(parent),
        };
        diagram.cells.insert(child, Cell::Node(child_node.clone()));

        let (post, _) = apply_remove_cells(&diagram, &[parent], Utc::now()).unwrap();
        assert!(post.contains(child));
        child_node.parent = None;
        assert_eq!(post.cells[&child], Cell::Node(child_node));
    }

    #[test]
    fn update_cells_rejects_unknown_cell() {
        let diagram = Diagram::empty(Utc::now());
        let updates = vec![CellUpdate {
            cell_id: CellId::new(),
            patch: CellPatch {
                position: Some(Point { x: 1.0, y: 1.0 }),
                ..Default::default()
            },
        }];
        let err = apply_update_cells(&diagram, &updates, Utc::now()).unwrap_err();
        assert!(matches!(err, OperationError::UnknownCell(_)));
    }

    #[test]
    fn update_cells_inverse_restores_previous_position() {
        let mut diagram = Diagram::empty(Utc::now());
        let id = CellId::new();
        diagram
            .cells
            .insert(id, node(Shape::Actor, Point { x: 0.0, y: 0.0 }));

        let updates = vec![CellUpdate {
            cell_id: id,
            patch: CellPatch {
                position: Some(Point { x: 9.0, y: 9.0 }),
                ..Default::default()
            },
        }];
        let (post, inverse) = apply_update_cells(&diagram, &updates, Utc::now()).unwrap();
        match &post.cells[&id] {
            Cell::Node(n) => assert_eq!(n.position, Point { x: 9.0, y: 9.0 }),
            _ => unreachable!(),
        }
        match inverse {
            OperationPayload::UpdateCells(updates) => {
                assert_eq!(updates[0].patch.position, Some(Point { x: 0.0, y: 0.0 }));
            }
            other => panic!("unexpected inverse {other:?}"),
        }
    }

    #[test]
    fn update_cells_rejects_edge_only_field_on_node() {
        let mut diagram = Diagram::empty(Utc::now());
        let id = CellId::new();
        diagram
            .cells
            .insert(id, node(Shape::Actor, Point { x: 0.0, y: 0.0 }));

        let updates = vec![CellUpdate {
            cell_id: id,
            patch: CellPatch {
                vertices: Some(vec![]),
                ..Default::default()
            },
        }];
        let err = apply_update_cells(&diagram, &updates, Utc::now()).unwrap_err();
        assert_eq!(err, OperationError::UnsupportedField(id));
    }

    #[test]
    fn patch_rejects_paths_outside_cells() {
        let diagram = Diagram::empty(Utc::now());
        let ops = vec![PatchOp {
            op: PatchOpKind::Replace,
            path: "/version".to_owned(),
            value: Some(json!(5)),
            from: None,
        }];
        let err = apply_patch(&diagram, &ops, Utc::now()).unwrap_err();
        assert!(matches!(err, OperationError::PatchOutsideCells(_)));
    }

    #[test]
    fn patch_replaces_cell_field_and_computes_inverse() {
        let mut diagram = Diagram::empty(Utc::now());
        let id = CellId::new();
        diagram
            .cells
            .insert(id, node(Shape::Actor, Point { x: 0.0, y: 0.0 }));

        let ops = vec![PatchOp {
            op: PatchOpKind::Replace,
            path: format!("/cells/{id}/position/x"),
            value: Some(json!(42.0)),
            from: None,
        }];
        let (post, inverse) = apply_patch(&diagram, &ops, Utc::now()).unwrap();
        match &post.cells[&id] {
            Cell::Node(n) => assert_eq!(n.position.x, 42.0),
            _ => unreachable!(),
        }
        match inverse {
            OperationPayload::Patch(inverse_ops) => assert_eq!(inverse_ops.len(), 1),
            other => panic!("unexpected inverse {other:?}"),
        }
    }

    #[test]
    fn patch_test_failure_is_precondition_failed() {
        let mut diagram = Diagram::empty(Utc::now());
        let id = CellId::new();
        diagram
            .cells
            .insert(id, node(Shape::Actor, Point { x: 0.0, y: 0.0 }));

        let ops = vec![PatchOp {
            op: PatchOpKind::Test,
            path: format!("/cells/{id}/position/x"),
            value: Some(json!(999.0)),
            from: None,
        }];
        let err = apply_patch(&diagram, &ops, Utc::now()).unwrap_err();
        assert!(matches!(err, OperationError::PreconditionFailed(_)));
    }

    #[test]
    fn patch_rejects_shape_change_via_raw_path() {
        let mut diagram = Diagram::empty(Utc::now());
        let id = CellId::new();
        diagram
            .cells
            .insert(id, node(Shape::Actor, Point { x: 0.0, y: 0.0 }));

        let ops = vec![PatchOp {
            op: PatchOpKind::Replace,
            path: format!("/cells/{id}/shape"),
            value: Some(json!("process")),
            from: None,
        }];
        let err = apply_patch(&diagram, &ops, Utc::now()).unwrap_err();
        assert_eq!(err, OperationError::UnsupportedField(id));
    }

    #[test]
    fn cycle_in_parent_chain_is_rejected() {
        let mut diagram = Diagram::empty(Utc::now());
        let a = CellId::new();
        let b = CellId::new();
        let mut node_a = Node {
            shape: Shape::SecurityBoundary,
            position: Point { x: 0.0, y: 0.0 },
            size: Size { w: 1.0, h: 1.0 },
            angle: None,
            attrs: json!({}),
            ports: json!({}),
            parent: Some(b),
        };
        let node_b = Node {
            parent: Some(a),
            ..node_a.clone()
        };
        diagram.cells.insert(a, Cell::Node(node_a.clone()));
        diagram.cells.insert(b, Cell::Node(node_b));
        node_a.parent = Some(b);

        let err = validate_invariants(&diagram).unwrap_err();
        assert!(matches!(err, OperationError::CycleDetected(_)));
    }
}

//! The History & Undo Engine (spec §4.E): an append-only log of applied
//! operations plus per-user undo/redo that stays correct when other
//! participants have mutated the diagram in between.
//!
//! The three prose rebase rules in §4.E (update_cells, remove_cells,
//! add_cells) all reduce to one check: did every cell an entry touched
//! stay exactly as that entry left it? [`HistoryLog`] records a snapshot
//! of the touched cells alongside each entry (not part of the durable
//! wire [`Operation`]) and reuses that single check for all four
//! operation kinds, including `patch`.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tmi_types::diagram::{Cell, Diagram};
use tmi_types::ids::{CellId, UserId};
use tmi_types::operation::{CellUpdate, Operation, OperationPayload, PatchOp};
use uuid::Uuid;

use crate::operations::{OperationError, apply_operation};

/// The result of an undo/redo attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum UndoRedoOutcome {
    /// The inverse (or original) was rebased and applied; this is the new
    /// working diagram and the log entry appended for it.
    Applied {
        /// The post-image after applying the replay.
        diagram: Diagram,
        /// The log entry recording the replay, ready to broadcast as a
        /// `history_operation` frame.
        entry: Operation,
    },
    /// The target entry could not be proven safe to rebase past
    /// intervening operations; it has been marked superseded and state is
    /// unchanged.
    Superseded {
        /// The original seq that was superseded.
        seq: u64,
    },
    /// The user has no undoable entry.
    NothingToUndo,
    /// The user has no redoable entry.
    NothingToRedo,
}

type TouchedSnapshot = HashMap<CellId, Option<Cell>>;

/// Per-diagram undo/redo bookkeeping and the durable operation log.
///
/// This is deliberately plain data with no locking: the owning Session
/// Hub is the only task that ever touches one, so all methods take `&mut
/// self`.
#[derive(Debug, Default)]
pub struct HistoryLog {
    entries: Vec<Operation>,
    touched: Vec<TouchedSnapshot>,
    seq_index: HashMap<u64, usize>,
    cursors: HashMap<UserId, tmi_types::presence::HistoryCursor>,
    /// Maps an undone original seq to the index of the undo-replay entry
    /// that undid it, so a later `redo_request` can rebase against the
    /// state *that* replay left behind rather than the original entry's.
    undone_by: HashMap<u64, usize>,
}

impl HistoryLog {
    /// Creates an empty log, as when a Session Hub starts up.
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries applied so far, oldest first.
    pub fn entries(&self) -> &[Operation] {
        &self.entries
    }

    /// The seq to persist as `last_save_seq` after a successful autosave:
    /// the highest seq currently in the log, or 0 if empty.
    pub fn latest_seq(&self) -> u64 {
        self.entries.last().map(|e| e.seq).unwrap_or(0)
    }

    /// Entries with `seq > since`, for the persistence slice handed to
    /// the `DiagramStore` on autosave (spec §4.F).
    pub fn since(&self, since: u64) -> &[Operation] {
        let start = self.entries.partition_point(|e| e.seq <= since);
        &self.entries[start..]
    }

    /// Records a user-authored mutation: appends the entry, starts
    /// tracking its touched-cell snapshot, pushes it onto the user's undo
    /// stack, and clears their redo stack (spec §4.E: "any new operation
    /// by u clears u's redo stack").
    pub fn record_operation(&mut self, diagram_after: &Diagram, entry: Operation) {
        let user = entry.initiating_user.clone();
        let seq = entry.seq;
        self.push_entry(diagram_after, entry);
        let cursor = self.cursors.entry(user).or_default();
        cursor.undo_stack.push(seq);
        cursor.redo_stack.clear();
    }

    fn push_entry(&mut self, diagram_after: &Diagram, entry: Operation) {
        let touched = snapshot_touched(&entry.payload, diagram_after);
        self.seq_index.insert(entry.seq, self.entries.len());
        self.entries.push(entry);
        self.touched.push(touched);
    }

    fn index_of(&self, seq: u64) -> usize {
        self.seq_index[&seq]
    }

    fn rebase_is_safe(&self, index: usize, diagram: &Diagram) -> bool {
        self.touched[index]
            .iter()
            .all(|(id, expected)| diagram.cells.get(id) == expected.as_ref())
    }

    /// Attempts to undo `user`'s most recent reachable operation against
    /// `diagram`, rebasing past anything applied since. `next_seq` is the
    /// seq the Session Hub would assign the resulting replay entry.
    pub fn undo(
        &mut self,
        diagram: &Diagram,
        user: &UserId,
        next_seq: u64,
        now: DateTime<Utc>,
    ) -> Result<UndoRedoOutcome, OperationError> {
        loop {
            let Some(seq) = self
                .cursors
                .get(user)
                .and_then(|c| c.undo_stack.last())
                .copied()
            else {
                return Ok(UndoRedoOutcome::NothingToUndo);
            };
            let index = self.index_of(seq);
            if self.entries[index].superseded {
                self.cursors.entry(user.clone()).or_default().undo_stack.pop();
                continue;
            }

            if !self.rebase_is_safe(index, diagram) {
                self.entries[index].superseded = true;
                self.cursors.entry(user.clone()).or_default().undo_stack.pop();
                return Ok(UndoRedoOutcome::Superseded { seq });
            }

            let inverse = self.entries[index].inverse.clone();
            let (post, _) = apply_operation(diagram, &inverse, now)?;

            self.cursors.entry(user.clone()).or_default().undo_stack.pop();
            self.entries[index].undone = true;

            let replay = Operation {
                seq: next_seq,
                op_id: Uuid::new_v4(),
                initiating_user: user.clone(),
                payload: inverse,
                inverse: self.entries[index].payload.clone(),
                undone: false,
                superseded: false,
                applied_at: now,
            };
            self.push_entry(&post, replay.clone());
            self.undone_by.insert(seq, self.entries.len() - 1);
            self.cursors
                .entry(user.clone())
                .or_default()
                .redo_stack
                .push(seq);

            return Ok(UndoRedoOutcome::Applied {
                diagram: post,
                entry: replay,
            });
        }
    }

    /// Attempts to redo `user`'s most recently undone operation against
    /// `diagram`, rebasing past anything applied since the undo.
    pub fn redo(
        &mut self,
        diagram: &Diagram,
        user: &UserId,
        next_seq: u64,
        now: DateTime<Utc>,
    ) -> Result<UndoRedoOutcome, OperationError> {
        let Some(seq) = self
            .cursors
            .get(user)
            .and_then(|c| c.redo_stack.last())
            .copied()
        else {
            return Ok(UndoRedoOutcome::NothingToRedo);
        };
        let original_index = self.index_of(seq);
        // Rebase against the state left by the undo that put `seq` onto
        // the redo stack, not the original entry's own post-image — redo
        // reapplies forward from "just after it was undone".
        let undo_index = self.undone_by[&seq];

        if !self.rebase_is_safe(undo_index, diagram) {
            self.entries[original_index].superseded = true;
            self.cursors.entry(user.clone()).or_default().redo_stack.pop();
            return Ok(UndoRedoOutcome::Superseded { seq });
        }

        let payload = self.entries[original_index].payload.clone();
        let (post, _) = apply_operation(diagram, &payload, now)?;

        self.cursors.entry(user.clone()).or_default().redo_stack.pop();
        self.entries[original_index].undone = false;
        self.undone_by.remove(&seq);

        let replay = Operation {
            seq: next_seq,
            op_id: Uuid::new_v4(),
            initiating_user: user.clone(),
            payload,
            inverse: self.entries[original_index].inverse.clone(),
            undone: false,
            superseded: false,
            applied_at: now,
        };
        self.push_entry(&post, replay.clone());
        self.cursors.entry(user.clone()).or_default().undo_stack.push(seq);

        Ok(UndoRedoOutcome::Applied {
            diagram: post,
            entry: replay,
        })
    }
}

fn snapshot_touched(payload: &OperationPayload, diagram_after: &Diagram) -> TouchedSnapshot {
    touched_cell_ids(payload)
        .into_iter()
        .map(|id| (id, diagram_after.cells.get(&id).cloned()))
        .collect()
}

fn touched_cell_ids(payload: &OperationPayload) -> HashSet<CellId> {
    match payload {
        OperationPayload::AddCells(cells) => cells.iter().map(|c| c.id).collect(),
        OperationPayload::UpdateCells(updates) => {
            updates.iter().map(|u: &CellUpdate| u.cell_id).collect()
        }
        OperationPayload::RemoveCells(ids) => ids.iter().copied().collect(),
        OperationPayload::Patch(ops) => ops
            .iter()
            .flat_map(|op: &PatchOp| {
                cell_id_from_patch_path(&op.path)
                    .into_iter()
                    .chain(op.from.as_deref().and_then(cell_id_from_patch_path))
            })
            .collect(),
    }
}

fn cell_id_from_patch_path(path: &str) -> Option<CellId> {
    let rest = path.strip_prefix("/cells/")?;
    let segment = rest.split('/').next()?;
    Uuid::parse_str(segment).ok().map(CellId::from_uuid)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tmi_types::diagram::{IdentifiedCell, Node, Point, Shape, Size};

    use super::*;

    fn user(name: &str) -> UserId {
        UserId::from(name)
    }

    fn sample_node(x: f64) -> Cell {
        Cell::Node(Node {
            shape: Shape::Actor,
            position: Point { x, y: 0.0 },
            size: Size { w: 1.0, h: 1.0 },
            angle: None,
            attrs: json!({}),
            ports: json!({}),
            parent: None,
        })
    }

    fn add_op(seq: u64, user: &UserId, id: CellId, cell: Cell, now: DateTime<Utc>) -> Operation {
        Operation {
            seq,
            op_id: Uuid::new_v4(),
            initiating_user: user.clone(),
            payload: OperationPayload::AddCells(vec![IdentifiedCell { id, cell }]),
            inverse: OperationPayload::RemoveCells(vec![id]),
            undone: false,
            superseded: false,
            applied_at: now,
        }
    }

    #[test]
    fn undo_with_empty_log_reports_nothing_to_undo() {
        let mut log = HistoryLog::new();
        let diagram = Diagram::empty(Utc::now());
        let outcome = log
            .undo(&diagram, &user("alice"), 1, Utc::now())
            .unwrap();
        assert_eq!(outcome, UndoRedoOutcome::NothingToUndo);
    }

    #[test]
    fn undo_then_redo_round_trips() {
        let mut log = HistoryLog::new();
        let alice = user("alice");
        let now = Utc::now();

        let id = CellId::new();
        let mut diagram = Diagram::empty(now);
        diagram.cells.insert(id, sample_node(0.0));
        log.record_operation(&diagram, add_op(1, &alice, id, sample_node(0.0), now));

        let outcome = log.undo(&diagram, &alice, 2, now).unwrap();
        let UndoRedoOutcome::Applied {
            diagram: after_undo,
            ..
        } = outcome
        else {
            panic!("expected undo to apply");
        };
        assert!(!after_undo.contains(id));

        let outcome = log.redo(&after_undo, &alice, 3, now).unwrap();
        let UndoRedoOutcome::Applied {
            diagram: after_redo,
            ..
        } = outcome
        else {
            panic!("expected redo to apply");
        };
        assert!(after_redo.contains(id));
    }

    #[test]
    fn concurrent_edit_supersedes_undo() {
        let mut log = HistoryLog::new();
        let alice = user("alice");
        let bob = user("bob");
        let now = Utc::now();

        let id = CellId::new();
        let mut diagram = Diagram::empty(now);
        diagram.cells.insert(id, sample_node(0.0));
        log.record_operation(&diagram, add_op(1, &alice, id, sample_node(0.0), now));

        // Bob mutates the same cell after Alice's add.
        let bob_update = Operation {
            seq: 2,
            op_id: Uuid::new_v4(),
            initiating_user: bob.clone(),
            payload: OperationPayload::UpdateCells(vec![CellUpdate {
                cell_id: id,
                patch: tmi_types::operation::CellPatch {
                    position: Some(Point { x: 9.0, y: 9.0 }),
                    ..Default::default()
                },
            }]),
            inverse: OperationPayload::UpdateCells(vec![]),
            undone: false,
            superseded: false,
            applied_at: now,
        };
        diagram.cells.insert(id, sample_node(9.0));
        log.record_operation(&diagram, bob_update);

        // Alice's add_cells touched snapshot no longer matches (cell
        // moved), so her undo cannot be proven safe.
        let outcome = log.undo(&diagram, &alice, 3, now).unwrap();
        assert_eq!(outcome, UndoRedoOutcome::Superseded { seq: 1 });
    }

    #[test]
    fn new_operation_clears_redo_stack() {
        let mut log = HistoryLog::new();
        let alice = user("alice");
        let now = Utc::now();

        let id = CellId::new();
        let mut diagram = Diagram::empty(now);
        diagram.cells.insert(id, sample_node(0.0));
        log.record_operation(&diagram, add_op(1, &alice, id, sample_node(0.0), now));

        let outcome = log.undo(&diagram, &alice, 2, now).unwrap();
        let UndoRedoOutcome::Applied {
            diagram: after_undo,
            ..
        } = outcome
        else {
            panic!("expected undo to apply");
        };

        let id2 = CellId::new();
        let mut diagram2 = after_undo.clone();
        diagram2.cells.insert(id2, sample_node(1.0));
        log.record_operation(&diagram2, add_op(3, &alice, id2, sample_node(1.0), now));

        let outcome = log.redo(&diagram2, &alice, 4, now).unwrap();
        assert_eq!(outcome, UndoRedoOutcome::NothingToRedo);
    }
}

#![deny(missing_docs)]
//! Pure diagram mutation and undo/redo logic for the TMI collaboration
//! core (spec §4.D, §4.E).
//!
//! Everything here is a function of `(pre-image, op) -> (post-image,
//! inverse, error)` — no I/O, no async runtime, no clock reads beyond an
//! explicit `DateTime<Utc>` argument. `tmi-service` owns the actor that
//! calls into this crate and is the only place state actually lives.

pub mod history;
pub mod operations;

pub use history::{HistoryLog, UndoRedoOutcome};
pub use operations::{OperationError, apply_operation};

#![deny(missing_docs)]
//! Wire and domain types for the TMI real-time diagram collaboration core.
//!
//! This crate has no I/O and no async runtime dependency beyond the
//! `async_trait`-based collaborator interfaces in [`collaborators`] — it
//! exists so that `tmi-core` (pure mutation logic) and `tmi-service`
//! (the axum runtime) share one definition of the diagram data model, the
//! operation log, and the websocket wire protocol.
//!
//! - [`ids`] — strongly-typed identifiers.
//! - [`diagram`] — the diagram/cell data model (spec §3).
//! - [`operation`] — the four mutation kinds and the durable log entry
//!   they produce (spec §3, §4.D, §4.E).
//! - [`presence`] — participants, roles, and presenter arbitration.
//! - [`protocol`] — the websocket frame envelope and message sets
//!   (spec §6).
//! - [`collaborators`] — the external interfaces the core consumes
//!   (spec §6): `Authenticator`, `AccessControl`, `DiagramStore`,
//!   `Clock`, `EventBus`.

pub mod collaborators;
pub mod diagram;
pub mod ids;
pub mod operation;
pub mod presence;
pub mod protocol;

//! Strongly-typed identifiers used throughout the collaboration core.
//!
//! Each id is a thin transparent wrapper so we never accidentally pass a
//! `ThreatModelId` where a `DiagramId` is expected, while still
//! (de)serializing as a bare UUID or string on the wire.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generates a new random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing [`Uuid`].
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Returns the inner [`Uuid`].
            pub fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }
    };
}

uuid_id!(ThreatModelId, "Identifies a threat model (owns zero or more diagrams).");
uuid_id!(DiagramId, "Identifies a diagram; one [`crate::presence::Session`] exists per live diagram.");
uuid_id!(CellId, "Identifies a cell (node or edge) within a diagram.");
uuid_id!(ConnectionId, "Identifies a single websocket connection; distinct from the user that holds it.");

/// Identifies an authenticated user (the subject returned by the `Authenticator`).
///
/// Kept as an opaque string rather than a UUID: the core never interprets
/// this value beyond equality comparison, and authenticators may hand back
/// emails, subject claims, or any other stable identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

//! The collaborator interfaces the core consumes (spec §6): everything
//! that lives outside the real-time collaboration subsystem but that the
//! Session Hub must call into. `tmi-service` is generic over these traits
//! the same way the teacher's service is generic over
//! `OprfRequestAuthenticator` — concrete implementations (JWT
//! verification, a Postgres-backed `DiagramStore`, ...) are supplied by
//! the hosting application, not by this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::diagram::Diagram;
use crate::ids::{DiagramId, ThreatModelId};
use crate::operation::Operation;
use crate::presence::Role;

/// The user identity and metadata recovered from a verified bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    /// The user's stable subject identifier.
    pub user_id: crate::ids::UserId,
    /// The user's email, as carried in the token.
    pub email: String,
}

/// Verifies upgrade-request credentials and resolves them to a user
/// identity. Concrete implementations back onto OAuth/OIDC/SAML/JWT
/// verification, which is explicitly out of scope for this crate (spec
/// §1).
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// The error returned on missing/invalid credentials.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Verifies `token` and returns the authenticated user.
    async fn verify(&self, token: &str) -> Result<AuthenticatedUser, Self::Error>;
}

/// Resolves a user's effective role on a threat model. Concrete
/// implementations back onto the project's access-control store, which is
/// explicitly out of scope for this crate.
#[async_trait]
pub trait AccessControl: Send + Sync + 'static {
    /// The error returned on a lookup failure (not the same as "no role";
    /// that case is `Ok(None)`).
    type Error: std::error::Error + Send + Sync + 'static;

    /// Returns the caller's role on `threat_model_id`, or `None` if they
    /// have no role at all.
    async fn role_for(
        &self,
        user_id: &crate::ids::UserId,
        threat_model_id: ThreatModelId,
    ) -> Result<Option<Role>, Self::Error>;
}

/// A slice of the durable operation log to persist alongside a diagram
/// snapshot.
#[derive(Debug, Clone)]
pub struct HistorySlice {
    /// Operations applied since the last successful persist.
    pub operations: Vec<Operation>,
}

/// Loads and durably persists diagram snapshots. The Session Hub owns the
/// *working* diagram while live; this store only ever sees whole-diagram
/// snapshots at load and at autosave/close time (spec §4.F — no
/// replayable op log at startup).
#[async_trait]
pub trait DiagramStore: Send + Sync + 'static {
    /// The error returned on load/persist failure.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Loads the last durable snapshot for `diagram_id`. Implementations
    /// should return an empty diagram if none exists yet.
    async fn load(&self, diagram_id: DiagramId) -> Result<Diagram, Self::Error>;

    /// Persists `diagram` and `history` in a single transaction.
    async fn persist(
        &self,
        diagram_id: DiagramId,
        diagram: &Diagram,
        history: &HistorySlice,
    ) -> Result<(), Self::Error>;
}

/// Supplies the server's notion of "now". Abstracted so tests can control
/// time deterministically, matching how the rest of the pack treats wall
/// clock access as an injectable dependency rather than a direct
/// `Utc::now()` call scattered through the hub.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// The real-time [`Clock`], backed by the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A session-lifecycle event published for audit/observability. Fields
/// are deliberately loose (string event name + structured fields) since
/// concrete subscribers (audit log, metrics sink) vary by deployment.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    /// The diagram this event concerns.
    pub diagram_id: DiagramId,
    /// A short machine-readable event name, e.g. `"session_closed"`.
    pub name: &'static str,
    /// Freeform structured detail, serialized as JSON for transport.
    pub detail: serde_json::Value,
}

/// Fire-and-forget publication of session lifecycle events, used for
/// audit/observability. Never awaited by the hub for correctness —
/// publish failures must not affect collaboration.
pub trait EventBus: Send + Sync + 'static {
    /// Publishes `event`. Implementations must not block; if the
    /// underlying sink is slow, drop the event rather than stall the
    /// Session Hub.
    fn publish(&self, event: SessionEvent);
}

/// An [`EventBus`] that discards every event, for tests and for hosts
/// that don't care about audit trails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventBus;

impl EventBus for NoopEventBus {
    fn publish(&self, _event: SessionEvent) {}
}

//! Test harness for the Session Hub's integration tests: in-memory fakes
//! for the collaborator traits, and a thin wrapper around
//! `axum_test::TestServer` with websocket helpers, grounded on the
//! teacher's `tests/setup.rs` (`TestNode`, `ConfigurableTestAuthenticator`,
//! `NodeTestSecretManager`).

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum_test::{TestServer, TestWebSocket};
use chrono::Utc;
use parking_lot::Mutex;
use tmi_service::TmiServiceBuilder;
use tmi_service::config::TmiServiceConfig;
use tmi_types::collaborators::{AccessControl, AuthenticatedUser, Authenticator, DiagramStore, HistorySlice, NoopEventBus};
use tmi_types::diagram::Diagram;
use tmi_types::ids::{DiagramId, ThreatModelId, UserId};
use tmi_types::presence::Role;

/// Accepts any non-empty bearer token; the token itself is the user id.
pub(crate) struct TestAuthenticator;

#[derive(Debug, thiserror::Error)]
#[error("bearer token must not be empty")]
pub(crate) struct TestAuthError;

#[async_trait]
impl Authenticator for TestAuthenticator {
    type Error = TestAuthError;

    async fn verify(&self, token: &str) -> Result<AuthenticatedUser, Self::Error> {
        if token.is_empty() {
            return Err(TestAuthError);
        }
        Ok(AuthenticatedUser { user_id: UserId::from(token), email: format!("{token}@test.invalid") })
    }
}

/// Fixed role assignments for the one threat model under test. A user
/// absent from the map has no role at all (Scenario 5's Diana).
pub(crate) struct TestAccessControl {
    roles: HashMap<UserId, Role>,
}

#[async_trait]
impl AccessControl for TestAccessControl {
    type Error = Infallible;

    async fn role_for(&self, user_id: &UserId, _threat_model_id: ThreatModelId) -> Result<Option<Role>, Self::Error> {
        Ok(self.roles.get(user_id).copied())
    }
}

/// Records every persisted snapshot so crash-consistency tests can assert
/// on exactly what was durably written, not just the current state.
#[derive(Clone, Default)]
pub(crate) struct TestDiagramStore {
    current: Arc<Mutex<HashMap<DiagramId, Diagram>>>,
    pub(crate) persisted: Arc<Mutex<Vec<Diagram>>>,
}

#[async_trait]
impl DiagramStore for TestDiagramStore {
    type Error = Infallible;

    async fn load(&self, diagram_id: DiagramId) -> Result<Diagram, Self::Error> {
        Ok(self.current.lock().get(&diagram_id).cloned().unwrap_or_else(|| Diagram::empty(Utc::now())))
    }

    async fn persist(&self, diagram_id: DiagramId, diagram: &Diagram, _history: &HistorySlice) -> Result<(), Self::Error> {
        self.current.lock().insert(diagram_id, diagram.clone());
        self.persisted.lock().push(diagram.clone());
        Ok(())
    }
}

impl TestDiagramStore {
    /// Pre-populates the snapshot a hub will load on its first join, for
    /// tests that need a diagram to already contain cells.
    pub(crate) fn seed(&self, diagram_id: DiagramId, diagram: Diagram) {
        self.current.lock().insert(diagram_id, diagram);
    }
}

/// Builds a [`TmiServiceConfig`] with timeouts short enough for a test
/// suite to exercise backpressure/draining without waiting on the
/// production defaults (a 5s slow-consumer timeout would make every test
/// run take minutes).
pub(crate) fn test_config() -> TmiServiceConfig {
    TmiServiceConfig {
        ws_max_message_size: 262_144,
        protocol_error_threshold: 10,
        inbound_queue_capacity: 64,
        outbound_queue_capacity: 4,
        slow_consumer_timeout: Duration::from_millis(200),
        drain_grace: Duration::from_secs(2),
        autosave_interval: Duration::from_secs(3600),
        persist_timeout: Duration::from_secs(5),
        persist_failure_threshold: 3,
        session_idle_timeout: Duration::from_secs(3600),
    }
}

/// A running `tmi-service` router plus the threat model/diagram under
/// test and the store backing it, wired with a fixed set of named users.
pub(crate) struct TestHarness {
    pub(crate) server: TestServer,
    pub(crate) store: TestDiagramStore,
    pub(crate) threat_model_id: ThreatModelId,
    pub(crate) diagram_id: DiagramId,
}

impl TestHarness {
    /// `roles` maps bearer token (== user id) to role; a user not present
    /// has no role on the threat model.
    pub(crate) fn new(roles: &[(&str, Role)]) -> Self {
        Self::with_config(roles, test_config())
    }

    pub(crate) fn with_config(roles: &[(&str, Role)], config: TmiServiceConfig) -> Self {
        let access_control = TestAccessControl {
            roles: roles.iter().map(|(token, role)| (UserId::from(*token), *role)).collect(),
        };
        let store = TestDiagramStore::default();
        let router = TmiServiceBuilder::new(
            config,
            TestAuthenticator,
            access_control,
            store.clone(),
            tmi_types::collaborators::SystemClock,
            NoopEventBus,
        )
        .build();
        let server = TestServer::builder().http_transport().build(router).expect("can build test server");
        Self { server, store, threat_model_id: ThreatModelId::new(), diagram_id: DiagramId::new() }
    }

    /// Seeds the diagram the hub will load, before any participant joins.
    pub(crate) fn seed_diagram(&self, diagram: Diagram) {
        self.store.seed(self.diagram_id, diagram);
    }

    fn ws_path(&self) -> String {
        format!("/threat_models/{}/diagrams/{}/ws", self.threat_model_id, self.diagram_id)
    }

    /// Opens a websocket as `token`, expecting the upgrade to succeed.
    pub(crate) async fn connect(&self, token: &str) -> TestWebSocket {
        self.server
            .get_websocket(&self.ws_path())
            .add_header("Authorization", format!("Bearer {token}"))
            .await
            .into_websocket()
            .await
    }

    /// Attempts the upgrade as `token` and returns the HTTP status code,
    /// for asserting rejected connections (Scenario 5's Diana).
    pub(crate) async fn connect_status(&self, token: &str) -> axum::http::StatusCode {
        self.server.get_websocket(&self.ws_path()).add_header("Authorization", format!("Bearer {token}")).await.status_code()
    }
}

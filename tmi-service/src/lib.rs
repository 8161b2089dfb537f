#![deny(missing_docs)]
//! Runtime for the TMI real-time diagram collaboration service.
//!
//! This crate provides the websocket Session Hub that backs collaborative
//! threat-model diagram editing: one actor task per open diagram,
//! applying mutations through `tmi-core` and broadcasting the
//! authoritative result to every connected participant.
//!
//! Hosting applications supply their own authentication, access control,
//! and durable storage by implementing the [`tmi_types::collaborators`]
//! traits, then hand them to [`TmiServiceBuilder`] to obtain an
//! `axum::Router` to mount. This mirrors how the teacher's
//! `OprfServiceBuilder` takes an `OprfRequestAuthService` per module and
//! returns a `Router` for the hosting application to nest under its own
//! API surface.
//!
//! The general workflow is:
//! 1. A participant opens a websocket to the Connection Endpoint with a
//!    bearer token.
//! 2. The token is verified by the supplied `Authenticator` and the
//!    participant's role resolved by the supplied `AccessControl`.
//! 3. The [`registry::Registry`] looks up or spawns the Session Hub for
//!    the requested diagram and the connection joins it.
//! 4. The connection is pumped for its lifetime, relaying decoded frames
//!    into the hub and the hub's broadcasts back out to the socket.

use std::sync::Arc;

use axum::Router;
use tmi_types::collaborators::{AccessControl, Authenticator, Clock, DiagramStore, EventBus, SystemClock};
use tower_http::trace::TraceLayer;

pub(crate) mod api;
pub mod config;
pub mod errors;
pub(crate) mod hub;
pub mod metrics;
pub(crate) mod registry;

use config::TmiServiceConfig;
use registry::Registry;

/// Builds a `TmiService` axum [`Router`] from the collaborators a hosting
/// application supplies, the way [`config::TmiServiceConfig`] is meant to
/// be composed by concrete deployments.
pub struct TmiServiceBuilder<A, C, D, CL, E>
where
    A: Authenticator,
    C: AccessControl,
    D: DiagramStore,
    CL: Clock,
    E: EventBus,
{
    config: Arc<TmiServiceConfig>,
    authenticator: Arc<A>,
    access_control: Arc<C>,
    store: Arc<D>,
    clock: Arc<CL>,
    event_bus: Arc<E>,
}

impl<A, C, D, CL, E> TmiServiceBuilder<A, C, D, CL, E>
where
    A: Authenticator,
    C: AccessControl,
    D: DiagramStore,
    CL: Clock,
    E: EventBus,
{
    /// Starts building a service around the given collaborators.
    pub fn new(
        config: TmiServiceConfig,
        authenticator: A,
        access_control: C,
        store: D,
        clock: CL,
        event_bus: E,
    ) -> Self {
        metrics::describe_metrics();
        Self {
            config: Arc::new(config),
            authenticator: Arc::new(authenticator),
            access_control: Arc::new(access_control),
            store: Arc::new(store),
            clock: Arc::new(clock),
            event_bus: Arc::new(event_bus),
        }
    }

    /// Builds the `axum::Router` exposing the websocket Connection
    /// Endpoint. The hosting application mounts this under its own
    /// routes, the same way `oprf-service-example` nests
    /// `OprfServiceBuilder::build`'s router.
    pub fn build(self) -> Router {
        let registry = Arc::new(Registry::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            Arc::clone(&self.event_bus),
            Arc::clone(&self.config),
        ));
        let state = api::connection::ConnectionState {
            authenticator: self.authenticator,
            access_control: self.access_control,
            registry,
            config: self.config,
        };
        api::connection::routes(state).layer(TraceLayer::new_for_http())
    }
}

impl<A, C, D> TmiServiceBuilder<A, C, D, SystemClock, tmi_types::collaborators::NoopEventBus>
where
    A: Authenticator,
    C: AccessControl,
    D: DiagramStore,
{
    /// Convenience constructor for the common case of a wall-clock
    /// [`SystemClock`] and no audit event sink.
    pub fn with_defaults(config: TmiServiceConfig, authenticator: A, access_control: C, store: D) -> Self {
        Self::new(
            config,
            authenticator,
            access_control,
            store,
            SystemClock,
            tmi_types::collaborators::NoopEventBus,
        )
    }
}

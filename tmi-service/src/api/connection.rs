//! The Connection Endpoint: a single websocket route that authenticates
//! the caller, resolves their role, joins (or spawns) the Session Hub
//! for the requested diagram, and pumps frames for the connection's
//! lifetime (spec §4.A).
//!
//! Structured the way the teacher splits `routes`/`ws`/`partial_oprf`:
//! `routes()` returns a `Router`, `ws()` performs the upgrade and typed
//! header extraction, and a lifecycle function (here `run_connection`)
//! drives the socket to completion and maps the outcome to a close
//! frame via `into_close_frame`.

use std::sync::Arc;

use axum::extract::ws::{self, CloseFrame, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::any;
use axum::{Json, Router};
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;
use http::StatusCode;
use serde::Serialize;
use tmi_types::collaborators::{AccessControl, Authenticator, Clock, DiagramStore, EventBus};
use tmi_types::ids::{ConnectionId, DiagramId, ThreatModelId};
use tmi_types::protocol::{ClientFrame, ServerFrame, ServerMessage};
use tracing::{Instrument, instrument};
use uuid::Uuid;

use crate::config::TmiServiceConfig;
use crate::errors::{ConnectionError, FrameError};
use crate::hub::{JoinRequest, SessionHubHandle};
use crate::metrics::METRICS_ID_PROTOCOL_ERRORS;
use crate::registry::Registry;

/// Shared state for the connection route, cloned into every request.
pub struct ConnectionState<A, C, D, CL, E>
where
    A: Authenticator,
    C: AccessControl,
    D: DiagramStore,
    CL: Clock,
    E: EventBus,
{
    pub(crate) authenticator: Arc<A>,
    pub(crate) access_control: Arc<C>,
    pub(crate) registry: Arc<Registry<D, CL, E>>,
    pub(crate) config: Arc<TmiServiceConfig>,
}

impl<A, C, D, CL, E> Clone for ConnectionState<A, C, D, CL, E>
where
    A: Authenticator,
    C: AccessControl,
    D: DiagramStore,
    CL: Clock,
    E: EventBus,
{
    fn clone(&self) -> Self {
        Self {
            authenticator: Arc::clone(&self.authenticator),
            access_control: Arc::clone(&self.access_control),
            registry: Arc::clone(&self.registry),
            config: Arc::clone(&self.config),
        }
    }
}

#[derive(Debug, Serialize)]
struct UpgradeErrorBody {
    message: String,
}

impl IntoResponse for ConnectionError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            ConnectionError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            ConnectionError::Forbidden(_) => StatusCode::FORBIDDEN,
            ConnectionError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = UpgradeErrorBody { message: self.to_string() };
        (status, Json(body)).into_response()
    }
}

/// Builds the `Router` exposing
/// `/threat_models/{threat_model_id}/diagrams/{diagram_id}/ws`.
pub fn routes<A, C, D, CL, E>(state: ConnectionState<A, C, D, CL, E>) -> Router
where
    A: Authenticator,
    C: AccessControl,
    D: DiagramStore,
    CL: Clock,
    E: EventBus,
{
    Router::new()
        .route(
            "/threat_models/{threat_model_id}/diagrams/{diagram_id}/ws",
            any(upgrade::<A, C, D, CL, E>),
        )
        .with_state(state)
}

#[instrument(level = "debug", skip_all, fields(%threat_model_id, %diagram_id))]
async fn upgrade<A, C, D, CL, E>(
    State(state): State<ConnectionState<A, C, D, CL, E>>,
    Path((threat_model_id, diagram_id)): Path<(ThreatModelId, DiagramId)>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    ws: WebSocketUpgrade,
) -> axum::response::Response
where
    A: Authenticator,
    C: AccessControl,
    D: DiagramStore,
    CL: Clock,
    E: EventBus,
{
    let Some(TypedHeader(auth)) = auth else {
        return ConnectionError::AuthFailed("missing bearer token".into()).into_response();
    };

    let user = match state.authenticator.verify(auth.token()).await {
        Ok(user) => user,
        Err(err) => {
            tracing::debug!("authentication failed: {err}");
            return ConnectionError::AuthFailed(err.to_string()).into_response();
        }
    };

    let role = match state.access_control.role_for(&user.user_id, threat_model_id).await {
        Ok(Some(role)) => role,
        Ok(None) => {
            return ConnectionError::Forbidden("no role on this threat model".into()).into_response();
        }
        Err(err) => {
            tracing::warn!("access control lookup failed: {err}");
            return ConnectionError::Forbidden(err.to_string()).into_response();
        }
    };

    let parent_span = tracing::Span::current();
    let max_message_size = state.config.ws_max_message_size;
    let protocol_error_threshold = state.config.protocol_error_threshold;
    let slow_consumer_timeout = state.config.slow_consumer_timeout;
    let hub = state.registry.hub_for(diagram_id).await;

    ws.max_message_size(max_message_size)
        .on_failed_upgrade(|err| {
            tracing::warn!("could not establish websocket connection: {err:?}");
        })
        .on_upgrade(move |socket| {
            async move {
                let outcome = run_connection(
                    socket,
                    hub,
                    JoinRequest { user, role },
                    protocol_error_threshold,
                    slow_consumer_timeout,
                )
                .await;
                if let Err(err) = outcome {
                    tracing::debug!("connection ended: {err}");
                }
            }
            .instrument(parent_span)
        })
        .into_response()
}

/// Drives one websocket connection for its full lifetime: joins the hub,
/// pumps inbound/outbound frames, and unconditionally notifies the hub on
/// exit so `participant_left`/presenter release always fire exactly once
/// (there is no async `Drop`, so this cleanup is an explicit call rather
/// than a guard destructor).
async fn run_connection(
    mut socket: WebSocket,
    hub: SessionHubHandle,
    join: JoinRequest,
    protocol_error_threshold: u32,
    slow_consumer_timeout: std::time::Duration,
) -> Result<(), ConnectionError> {
    let response = match hub.join(join).await {
        Ok(response) => response,
        Err(err) => {
            send_close(&mut socket, err.into_close_frame()).await;
            return Ok(());
        }
    };

    let connection_id = response.connection_id;
    let mut outbound = response.outbound;
    let mut disconnect = response.disconnect;

    let snapshot_frame = ServerFrame {
        message_id: Uuid::new_v4(),
        seq: response.snapshot.version,
        message: ServerMessage::ResyncResponse(response.snapshot),
    };
    if write_frame(&mut socket, &snapshot_frame).await.is_err() {
        hub.leave(connection_id).await;
        return Ok(());
    }

    let mut bad_frame_count: u32 = 0;
    let result = pump(
        &mut socket,
        &hub,
        connection_id,
        &mut outbound,
        &mut disconnect,
        &mut bad_frame_count,
        protocol_error_threshold,
        slow_consumer_timeout,
    )
    .await;

    hub.leave(connection_id).await;

    let close_frame = match result {
        Ok(()) => None,
        Err(err) => err.into_close_frame(),
    };
    send_close(&mut socket, close_frame).await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn pump(
    socket: &mut WebSocket,
    hub: &SessionHubHandle,
    connection_id: ConnectionId,
    outbound: &mut tokio::sync::mpsc::Receiver<ServerFrame>,
    disconnect: &mut tokio::sync::oneshot::Receiver<ConnectionError>,
    bad_frame_count: &mut u32,
    protocol_error_threshold: u32,
    slow_consumer_timeout: std::time::Duration,
) -> Result<(), ConnectionError> {
    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(ws::Message::Text(text))) => {
                        handle_inbound_text(socket, hub, connection_id, text.as_bytes(), bad_frame_count, protocol_error_threshold, slow_consumer_timeout).await?;
                    }
                    Some(Ok(ws::Message::Binary(bytes))) => {
                        handle_inbound_text(socket, hub, connection_id, &bytes, bad_frame_count, protocol_error_threshold, slow_consumer_timeout).await?;
                    }
                    Some(Ok(ws::Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(ConnectionError::Axum(err)),
                }
            }
            outgoing = outbound.recv() => {
                let Some(frame) = outgoing else { return Ok(()) };
                write_frame(socket, &frame).await?;
            }
            reason = &mut *disconnect => {
                return Err(reason.unwrap_or(ConnectionError::ConnectionClosed));
            }
        }
    }
}

/// Frames just well-formed enough to carry a `message_id`, used to echo it
/// back on an `Error { kind: bad_request }` reply when the full `ClientFrame`
/// fails to deserialize.
#[derive(serde::Deserialize)]
struct MessageIdOnly {
    message_id: Uuid,
}

async fn handle_inbound_text(
    socket: &mut WebSocket,
    hub: &SessionHubHandle,
    connection_id: ConnectionId,
    bytes: &[u8],
    bad_frame_count: &mut u32,
    protocol_error_threshold: u32,
    slow_consumer_timeout: std::time::Duration,
) -> Result<(), ConnectionError> {
    match serde_json::from_slice::<ClientFrame>(bytes) {
        Ok(frame) => {
            *bad_frame_count = 0;
            hub.send_frame(connection_id, frame, slow_consumer_timeout).await
        }
        Err(err) => {
            tracing::debug!("malformed frame: {err}");
            let offending_message_id =
                serde_json::from_slice::<MessageIdOnly>(bytes).map(|m| m.message_id).unwrap_or(Uuid::nil());
            let frame_error = FrameError::BadRequest(err.to_string());
            let error_frame = ServerFrame {
                message_id: Uuid::new_v4(),
                seq: 0,
                message: ServerMessage::Error {
                    kind: frame_error.kind(),
                    message: frame_error.message(),
                    message_id: offending_message_id,
                },
            };
            write_frame(socket, &error_frame).await?;

            *bad_frame_count += 1;
            if *bad_frame_count >= protocol_error_threshold {
                metrics::counter!(METRICS_ID_PROTOCOL_ERRORS).increment(1);
                Err(ConnectionError::ProtocolError)
            } else {
                Ok(())
            }
        }
    }
}

async fn write_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), ConnectionError> {
    let json = serde_json::to_string(frame).expect("ServerFrame always serializes");
    socket.send(ws::Message::text(json)).await.map_err(ConnectionError::Axum)
}

async fn send_close(socket: &mut WebSocket, frame: Option<CloseFrame>) {
    if let Some(frame) = frame {
        let _ = socket.send(ws::Message::Close(Some(frame))).await;
    }
}

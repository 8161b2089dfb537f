//! The Session Hub: a single-threaded cooperative actor owning one
//! diagram's working state (spec §4.C). Exactly one task services one
//! inbound queue; every state transition is serialized by that queue, so
//! nothing here needs a lock around the working diagram, history, or
//! presenter state — ownership is the actor boundary itself (spec §9,
//! "Global mutable diagram state → per-session actor").
//!
//! This generalizes the teacher's lock-protected
//! `OprfKeyMaterialStore`/`OpenSessions` maps into a lock-free actor: the
//! teacher serializes access to small maps with `parking_lot::Mutex`
//! because its state is trivial key bookkeeping, whereas a live diagram
//! plus undo history is large and structured enough to want a dedicated
//! task with a real dispatch table instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable as _};
use chrono::Utc;
use tmi_core::{HistoryLog, UndoRedoOutcome, apply_operation};
use tmi_types::collaborators::{
    AuthenticatedUser, Clock, DiagramStore, EventBus, HistorySlice, SessionEvent,
};
use tmi_types::diagram::Diagram;
use tmi_types::ids::{ConnectionId, DiagramId, UserId};
use tmi_types::presence::{Participant, PresenterState, Role, SessionPhase, User};
use tmi_types::protocol::{
    ChangePresenterRequest, ClientFrame, ClientMessage, CursorPayload, ResyncSnapshot,
    SelectionPayload, ServerFrame, ServerMessage,
};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::TmiServiceConfig;
use crate::errors::{ConnectionError, FrameError};
use crate::metrics::{
    METRICS_ID_OPERATIONS_APPLIED, METRICS_ID_OPERATIONS_REJECTED, METRICS_ID_PARTICIPANTS_OPEN,
    METRICS_ID_PERSIST_DURATION, METRICS_ID_PERSIST_FAILURES, METRICS_ID_SESSIONS_OPEN,
    METRICS_ID_SLOW_CONSUMERS, METRICS_ID_UNDO_CONFLICTS,
};

/// What a new connection needs from the hub to join.
pub struct JoinRequest {
    /// The authenticated caller.
    pub user: AuthenticatedUser,
    /// The caller's resolved role on this diagram's threat model.
    pub role: Role,
}

/// What the hub hands back on a successful join.
pub struct JoinResponse {
    /// The connection id assigned to this participant.
    pub connection_id: ConnectionId,
    /// The participant's outbound frame queue.
    pub outbound: mpsc::Receiver<ServerFrame>,
    /// Fires once if the hub forcibly disconnects this participant.
    pub disconnect: oneshot::Receiver<ConnectionError>,
    /// The initial full-state snapshot (also sent as the first outbound
    /// frame, but returned directly so the caller need not race for it).
    pub snapshot: ResyncSnapshot,
}

/// Internal messages the hub's actor loop processes. Every state mutation
/// flows through here so the working diagram is touched by exactly one
/// task.
enum HubEvent {
    Join {
        request: JoinRequest,
        reply: oneshot::Sender<Result<JoinResponse, ConnectionError>>,
    },
    Frame {
        connection_id: ConnectionId,
        frame: ClientFrame,
    },
    Leave {
        connection_id: ConnectionId,
    },
    PersistCompleted {
        through_seq: u64,
        outcome: Result<(), String>,
    },
}

/// A cloneable, cheap-to-hold reference to a running Session Hub.
#[derive(Clone)]
pub struct SessionHubHandle {
    inbound: mpsc::Sender<HubEvent>,
}

impl SessionHubHandle {
    /// Returns `true` if the hub task backing this handle has exited.
    /// The Registry uses this to decide whether a cached handle is stale.
    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed()
    }

    /// Registers a new participant with the hub.
    pub async fn join(&self, request: JoinRequest) -> Result<JoinResponse, ConnectionError> {
        let (reply, reply_rx) = oneshot::channel();
        self.inbound
            .send(HubEvent::Join { request, reply })
            .await
            .map_err(|_| ConnectionError::Unavailable("session is shutting down".into()))?;
        reply_rx
            .await
            .map_err(|_| ConnectionError::Unavailable("session is shutting down".into()))?
    }

    /// Forwards one decoded client frame to the hub, applying inbound
    /// backpressure: if the inbound queue is full for longer than
    /// `timeout`, the caller should treat this connection as a slow
    /// consumer (spec §4.C: the same timeout governs both directions).
    pub async fn send_frame(
        &self,
        connection_id: ConnectionId,
        frame: ClientFrame,
        timeout: Duration,
    ) -> Result<(), ConnectionError> {
        tokio::time::timeout(
            timeout,
            self.inbound.send(HubEvent::Frame { connection_id, frame }),
        )
        .await
        .map_err(|_| ConnectionError::SlowConsumer)?
        .map_err(|_| ConnectionError::Unavailable("session is shutting down".into()))
    }

    /// Notifies the hub that a participant is gone. Best-effort: if the
    /// hub has already shut down there is nothing left to clean up.
    pub async fn leave(&self, connection_id: ConnectionId) {
        let _ = self.inbound.send(HubEvent::Leave { connection_id }).await;
    }
}

struct ParticipantHandle {
    user_id: UserId,
    email: String,
    role: Role,
    joined_at: chrono::DateTime<Utc>,
    outbound: mpsc::Sender<ServerFrame>,
    disconnect: Option<oneshot::Sender<ConnectionError>>,
}

/// The live state one Session Hub owns exclusively.
struct Session {
    diagram_id: DiagramId,
    diagram: Diagram,
    participants: HashMap<ConnectionId, ParticipantHandle>,
    presenter: PresenterState,
    history: HistoryLog,
    next_seq: u64,
    last_save_seq: u64,
    phase: SessionPhase,
    persist_failures: u32,
}

impl Session {
    /// The `seq` to stamp on a non-mutation frame: the value the *next*
    /// mutation would receive. Mutations stamp their own freshly-bumped
    /// seq instead (see [`Session::next_mutation_seq`]).
    fn current_seq(&self) -> u64 {
        self.next_seq
    }

    fn next_mutation_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn participants_snapshot(&self) -> Vec<Participant> {
        self.participants
            .iter()
            .map(|(connection_id, p)| Participant {
                user_id: p.user_id.clone(),
                email: p.email.clone(),
                connection_id: *connection_id,
                joined_at: p.joined_at,
                role: p.role,
            })
            .collect()
    }
}

/// Bundles the collaborators and self-reference a running hub needs,
/// threaded through the dispatch functions instead of passing four or
/// five separate parameters everywhere.
struct HubRuntime<D: DiagramStore> {
    store: Arc<D>,
    config: Arc<TmiServiceConfig>,
    self_tx: mpsc::Sender<HubEvent>,
}

/// Spawns a new Session Hub task for `diagram_id` and returns a handle to
/// it. The task loads the last durable snapshot before entering its
/// event loop; if that load fails the task exits immediately and the
/// handle reports every subsequent operation as `Unavailable`.
pub fn spawn<D, C, E>(
    diagram_id: DiagramId,
    store: Arc<D>,
    clock: Arc<C>,
    event_bus: Arc<E>,
    config: Arc<TmiServiceConfig>,
) -> SessionHubHandle
where
    D: DiagramStore,
    C: Clock,
    E: EventBus,
{
    let (tx, rx) = mpsc::channel(config.inbound_queue_capacity);
    let self_tx = tx.clone();
    tokio::spawn(run(diagram_id, store, clock, event_bus, config, rx, self_tx));
    SessionHubHandle { inbound: tx }
}

async fn run<D, C, E>(
    diagram_id: DiagramId,
    store: Arc<D>,
    clock: Arc<C>,
    event_bus: Arc<E>,
    config: Arc<TmiServiceConfig>,
    mut inbound_rx: mpsc::Receiver<HubEvent>,
    self_tx: mpsc::Sender<HubEvent>,
) where
    D: DiagramStore,
    C: Clock,
    E: EventBus,
{
    let diagram = match store.load(diagram_id).await {
        Ok(diagram) => diagram,
        Err(err) => {
            tracing::error!(%diagram_id, "could not load diagram snapshot: {err}");
            return;
        }
    };

    let mut session = Session {
        diagram_id,
        diagram,
        participants: HashMap::new(),
        presenter: PresenterState::default(),
        history: HistoryLog::new(),
        next_seq: 0,
        last_save_seq: 0,
        phase: SessionPhase::Active,
        persist_failures: 0,
    };
    let runtime = HubRuntime { store, config, self_tx };
    metrics::gauge!(METRICS_ID_SESSIONS_OPEN).increment(1.0);
    tracing::info!(%diagram_id, "session hub started");

    let mut autosave = tokio::time::interval(runtime.config.autosave_interval);
    autosave.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    autosave.tick().await; // first tick fires instantly; consume it up front

    let mut idle_deadline = tokio::time::Instant::now() + runtime.config.session_idle_timeout;
    let mut drain_deadline: Option<tokio::time::Instant> = None;

    loop {
        let active = session.phase == SessionPhase::Active;
        let draining = session.phase == SessionPhase::Draining;
        let dirty = session.diagram.dirty;
        let drain_sleep_until =
            drain_deadline.unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            maybe_event = inbound_rx.recv() => {
                let Some(event) = maybe_event else { break };
                idle_deadline = tokio::time::Instant::now() + runtime.config.session_idle_timeout;
                handle_event(&mut session, event, &*clock, &*event_bus, &runtime).await;
                if session.phase == SessionPhase::Draining && drain_deadline.is_none() {
                    drain_deadline = Some(tokio::time::Instant::now() + runtime.config.drain_grace);
                }
                if session.phase == SessionPhase::Draining && session.participants.is_empty() {
                    session.phase = SessionPhase::Closed;
                }
                if session.phase == SessionPhase::Closed {
                    break;
                }
            }
            _ = autosave.tick(), if dirty && active => {
                trigger_persist(&mut session, &runtime);
            }
            _ = tokio::time::sleep_until(idle_deadline), if active => {
                tracing::info!(%diagram_id, "session idle timeout reached; draining");
                enter_draining(&mut session, &runtime);
            }
            _ = tokio::time::sleep_until(drain_sleep_until), if draining => {
                tracing::warn!(%diagram_id, "drain grace elapsed; forcing close");
                disconnect_all(&mut session, "session closed").await;
                session.phase = SessionPhase::Closed;
                break;
            }
        }
    }

    final_persist(&session, &runtime).await;
    metrics::gauge!(METRICS_ID_SESSIONS_OPEN).decrement(1.0);
    tracing::info!(%diagram_id, "session hub stopped");
}

fn enter_draining<D: DiagramStore>(session: &mut Session, runtime: &HubRuntime<D>) {
    if session.phase != SessionPhase::Active {
        return;
    }
    session.phase = SessionPhase::Draining;
    if session.diagram.dirty {
        trigger_persist(session, runtime);
    }
}

async fn handle_event<D: DiagramStore, C: Clock, E: EventBus>(
    session: &mut Session,
    event: HubEvent,
    clock: &C,
    event_bus: &E,
    runtime: &HubRuntime<D>,
) {
    match event {
        HubEvent::Join { request, reply } => handle_join(session, request, reply, event_bus, runtime).await,
        HubEvent::Frame { connection_id, frame } => {
            handle_frame(session, connection_id, frame, clock, runtime).await
        }
        HubEvent::Leave { connection_id } => handle_leave(session, connection_id, event_bus, runtime).await,
        HubEvent::PersistCompleted { through_seq, outcome } => {
            handle_persist_completed(session, through_seq, outcome, runtime).await
        }
    }
}

async fn handle_join<D: DiagramStore, E: EventBus>(
    session: &mut Session,
    request: JoinRequest,
    reply: oneshot::Sender<Result<JoinResponse, ConnectionError>>,
    event_bus: &E,
    runtime: &HubRuntime<D>,
) {
    if session.phase != SessionPhase::Active {
        let _ = reply.send(Err(ConnectionError::Unavailable("session is draining".into())));
        return;
    }

    let connection_id = ConnectionId::new();
    let (outbound_tx, outbound_rx) = mpsc::channel(runtime.config.outbound_queue_capacity);
    let (disconnect_tx, disconnect_rx) = oneshot::channel();

    let snapshot = ResyncSnapshot {
        diagram: session.diagram.clone(),
        version: session.diagram.version,
        presenter: session.presenter.clone(),
        participants: session.participants_snapshot(),
    };

    let participant = ParticipantHandle {
        user_id: request.user.user_id.clone(),
        email: request.user.email.clone(),
        role: request.role,
        joined_at: Utc::now(),
        outbound: outbound_tx,
        disconnect: Some(disconnect_tx),
    };
    let joined_user = User { user_id: participant.user_id.clone(), email: participant.email.clone() };
    session.participants.insert(connection_id, participant);
    metrics::gauge!(METRICS_ID_PARTICIPANTS_OPEN).increment(1.0);

    let response = JoinResponse { connection_id, outbound: outbound_rx, disconnect: disconnect_rx, snapshot };
    if reply.send(Ok(response)).is_err() {
        // caller went away before it could take the channels; undo the
        // join immediately.
        session.participants.remove(&connection_id);
        metrics::gauge!(METRICS_ID_PARTICIPANTS_OPEN).decrement(1.0);
        return;
    }

    event_bus.publish(SessionEvent {
        diagram_id: session.diagram_id,
        name: "participant_joined",
        detail: serde_json::json!({ "user_id": joined_user.user_id.0 }),
    });
    broadcast_except(session, ServerMessage::ParticipantJoined { joined_user }, connection_id, runtime).await;
}

async fn handle_leave<D: DiagramStore, E: EventBus>(
    session: &mut Session,
    connection_id: ConnectionId,
    event_bus: &E,
    runtime: &HubRuntime<D>,
) {
    let Some(participant) = session.participants.remove(&connection_id) else {
        return;
    };
    metrics::gauge!(METRICS_ID_PARTICIPANTS_OPEN).decrement(1.0);
    session.presenter.release_if_presenter(&participant.user_id);

    let departed_user = User { user_id: participant.user_id.clone(), email: participant.email.clone() };
    event_bus.publish(SessionEvent {
        diagram_id: session.diagram_id,
        name: "participant_left",
        detail: serde_json::json!({ "user_id": departed_user.user_id.0 }),
    });

    broadcast_all(session, ServerMessage::ParticipantLeft { departed_user }, runtime).await;
    let current_presenter = session.presenter.current_presenter.clone();
    broadcast_all(session, ServerMessage::CurrentPresenter { current_presenter }, runtime).await;

    if session.participants.is_empty() {
        enter_draining(session, runtime);
    }
}

async fn handle_frame<D: DiagramStore, C: Clock>(
    session: &mut Session,
    connection_id: ConnectionId,
    frame: ClientFrame,
    clock: &C,
    runtime: &HubRuntime<D>,
) {
    let message_id = frame.message_id;
    let Some(role) = session.participants.get(&connection_id).map(|p| p.role) else {
        return;
    };

    if session.phase != SessionPhase::Active && !matches!(frame.message, ClientMessage::ResyncRequest) {
        send_error(session, connection_id, FrameError::Unavailable("session is draining".into()), message_id, runtime)
            .await;
        return;
    }

    let result = match frame.message {
        ClientMessage::DiagramOperation(req) => {
            if !role.can_write() {
                Err(FrameError::Forbidden("writer role required".into()))
            } else {
                handle_diagram_operation(session, connection_id, req, clock, runtime).await
            }
        }
        ClientMessage::UndoRequest => {
            if !role.can_write() {
                Err(FrameError::Forbidden("writer role required".into()))
            } else {
                handle_undo(session, connection_id, clock, runtime).await
            }
        }
        ClientMessage::RedoRequest => {
            if !role.can_write() {
                Err(FrameError::Forbidden("writer role required".into()))
            } else {
                handle_redo(session, connection_id, clock, runtime).await
            }
        }
        ClientMessage::PresenterRequest => handle_presenter_request(session, connection_id, runtime).await,
        ClientMessage::ChangePresenter(req) => {
            handle_change_presenter(session, connection_id, role, req, runtime).await
        }
        ClientMessage::PresenterCursor(cursor) => {
            handle_presenter_cursor(session, connection_id, cursor, runtime).await
        }
        ClientMessage::PresenterSelection(selection) => {
            handle_presenter_selection(session, connection_id, selection, runtime).await
        }
        ClientMessage::ResyncRequest => handle_resync(session, connection_id, runtime).await,
        ClientMessage::EndSession => handle_end_session(session, role, runtime).await,
    };

    if let Err(err) = result {
        send_error(session, connection_id, err, message_id, runtime).await;
    }
}

async fn handle_diagram_operation<D: DiagramStore, C: Clock>(
    session: &mut Session,
    connection_id: ConnectionId,
    req: tmi_types::protocol::DiagramOperationRequest,
    clock: &C,
    runtime: &HubRuntime<D>,
) -> Result<(), FrameError> {
    let initiating_user = session.participants[&connection_id].user_id.clone();
    let now = clock.now();
    match apply_operation(&session.diagram, &req.operation, now) {
        Ok((diagram, inverse)) => {
            session.diagram = diagram;
            let seq = session.next_mutation_seq();
            let entry = tmi_types::operation::Operation {
                seq,
                op_id: req.op_id,
                initiating_user: initiating_user.clone(),
                payload: req.operation,
                inverse,
                undone: false,
                superseded: false,
                applied_at: now,
            };
            session.history.record_operation(&session.diagram, entry.clone());
            metrics::counter!(METRICS_ID_OPERATIONS_APPLIED).increment(1);
            broadcast_all(
                session,
                ServerMessage::AuthoritativeOperation { initiating_user, operation: entry },
                runtime,
            )
            .await;
            Ok(())
        }
        Err(err) => {
            metrics::counter!(METRICS_ID_OPERATIONS_REJECTED).increment(1);
            Err(FrameError::from(err))
        }
    }
}

async fn handle_undo<D: DiagramStore, C: Clock>(
    session: &mut Session,
    connection_id: ConnectionId,
    clock: &C,
    runtime: &HubRuntime<D>,
) -> Result<(), FrameError> {
    let user = session.participants[&connection_id].user_id.clone();
    let now = clock.now();
    let next_seq = session.next_seq;
    let outcome = session.history.undo(&session.diagram, &user, next_seq, now).map_err(FrameError::from)?;
    finish_undo_redo(session, user, outcome, runtime).await
}

async fn handle_redo<D: DiagramStore, C: Clock>(
    session: &mut Session,
    connection_id: ConnectionId,
    clock: &C,
    runtime: &HubRuntime<D>,
) -> Result<(), FrameError> {
    let user = session.participants[&connection_id].user_id.clone();
    let now = clock.now();
    let next_seq = session.next_seq;
    let outcome = session.history.redo(&session.diagram, &user, next_seq, now).map_err(FrameError::from)?;
    finish_undo_redo(session, user, outcome, runtime).await
}

async fn finish_undo_redo<D: DiagramStore>(
    session: &mut Session,
    user: UserId,
    outcome: UndoRedoOutcome,
    runtime: &HubRuntime<D>,
) -> Result<(), FrameError> {
    match outcome {
        UndoRedoOutcome::Applied { diagram, entry } => {
            session.diagram = diagram;
            let seq = session.next_mutation_seq();
            debug_assert_eq!(seq, entry.seq);
            broadcast_all(
                session,
                ServerMessage::HistoryOperation { initiating_user: user, operation: entry },
                runtime,
            )
            .await;
            Ok(())
        }
        UndoRedoOutcome::Superseded { .. } => {
            metrics::counter!(METRICS_ID_UNDO_CONFLICTS).increment(1);
            Err(FrameError::UndoConflict)
        }
        UndoRedoOutcome::NothingToUndo => Err(FrameError::NothingToUndo),
        UndoRedoOutcome::NothingToRedo => Err(FrameError::NothingToRedo),
    }
}

async fn handle_presenter_request<D: DiagramStore>(
    session: &mut Session,
    connection_id: ConnectionId,
    runtime: &HubRuntime<D>,
) -> Result<(), FrameError> {
    let user = session.participants[&connection_id].user_id.clone();
    if session.presenter.current_presenter.is_none() {
        session.presenter.set_presenter(user.clone());
        broadcast_all(session, ServerMessage::CurrentPresenter { current_presenter: Some(user) }, runtime).await;
    } else {
        session.presenter.request(user);
        if let Some(current) = session.presenter.current_presenter.clone() {
            let current_presenter = session
                .participants
                .values()
                .find(|p| p.user_id == current)
                .map(|p| User { user_id: p.user_id.clone(), email: p.email.clone() });
            if let Some(current_presenter) = current_presenter {
                send_to(session, connection_id, ServerMessage::PresenterDenied { current_presenter }, runtime).await;
            }
        }
    }
    Ok(())
}

async fn handle_change_presenter<D: DiagramStore>(
    session: &mut Session,
    connection_id: ConnectionId,
    role: Role,
    req: ChangePresenterRequest,
    runtime: &HubRuntime<D>,
) -> Result<(), FrameError> {
    let caller = session.participants[&connection_id].user_id.clone();
    let is_current_presenter = session.presenter.current_presenter.as_ref() == Some(&caller);
    if !role.can_seize_presenter() && !is_current_presenter {
        return Err(FrameError::Forbidden("only a writer, the owner, or the current presenter may hand off presenting".into()));
    }
    session.presenter.set_presenter(req.new_presenter.clone());
    send_to(session, connection_id, ServerMessage::ChangePresenter { new_presenter: req.new_presenter.clone() }, runtime)
        .await;
    broadcast_all(
        session,
        ServerMessage::CurrentPresenter { current_presenter: Some(req.new_presenter) },
        runtime,
    )
    .await;
    Ok(())
}

async fn handle_presenter_cursor<D: DiagramStore>(
    session: &mut Session,
    connection_id: ConnectionId,
    cursor: CursorPayload,
    runtime: &HubRuntime<D>,
) -> Result<(), FrameError> {
    let user = session.participants[&connection_id].user_id.clone();
    if session.presenter.current_presenter.as_ref() != Some(&user) {
        return Err(FrameError::Forbidden("only the current presenter may broadcast a cursor".into()));
    }
    broadcast_except(
        session,
        ServerMessage::PresenterCursor { presenter: user, cursor },
        connection_id,
        runtime,
    )
    .await;
    Ok(())
}

async fn handle_presenter_selection<D: DiagramStore>(
    session: &mut Session,
    connection_id: ConnectionId,
    selection: SelectionPayload,
    runtime: &HubRuntime<D>,
) -> Result<(), FrameError> {
    let user = session.participants[&connection_id].user_id.clone();
    if session.presenter.current_presenter.as_ref() != Some(&user) {
        return Err(FrameError::Forbidden("only the current presenter may broadcast a selection".into()));
    }
    broadcast_except(
        session,
        ServerMessage::PresenterSelection { presenter: user, selection },
        connection_id,
        runtime,
    )
    .await;
    Ok(())
}

async fn handle_resync<D: DiagramStore>(
    session: &mut Session,
    connection_id: ConnectionId,
    runtime: &HubRuntime<D>,
) -> Result<(), FrameError> {
    let snapshot = ResyncSnapshot {
        diagram: session.diagram.clone(),
        version: session.diagram.version,
        presenter: session.presenter.clone(),
        participants: session.participants_snapshot(),
    };
    send_to(session, connection_id, ServerMessage::ResyncResponse(snapshot), runtime).await;
    Ok(())
}

async fn handle_end_session<D: DiagramStore>(
    session: &mut Session,
    role: Role,
    runtime: &HubRuntime<D>,
) -> Result<(), FrameError> {
    if !role.can_end_session() {
        return Err(FrameError::Forbidden("only the owner may end the session".into()));
    }
    enter_draining(session, runtime);
    Ok(())
}

async fn handle_persist_completed<D: DiagramStore>(
    session: &mut Session,
    through_seq: u64,
    outcome: Result<(), String>,
    runtime: &HubRuntime<D>,
) {
    match outcome {
        Ok(()) => {
            session.last_save_seq = through_seq;
            session.diagram.dirty = false;
            session.persist_failures = 0;
        }
        Err(err) => {
            session.persist_failures += 1;
            metrics::counter!(METRICS_ID_PERSIST_FAILURES).increment(1);
            tracing::warn!(%err, failures = session.persist_failures, "persist failed");
            if session.persist_failures >= runtime.config.persist_failure_threshold {
                broadcast_all(
                    session,
                    ServerMessage::PersistenceDegraded {
                        message: format!("persistence has failed {} times in a row", session.persist_failures),
                    },
                    runtime,
                )
                .await;
            }
        }
    }
}

/// Spawns the actual `DiagramStore::persist` call as a background task so
/// the actor keeps serving inbound events while it runs (spec §4.F, §5).
/// Its result is posted back through the inbound queue rather than
/// mutating `session` directly, preserving the single-writer invariant.
fn trigger_persist<D: DiagramStore>(session: &mut Session, runtime: &HubRuntime<D>) {
    let diagram = session.diagram.clone();
    let diagram_id = session.diagram_id;
    let operations = session.history.since(session.last_save_seq).to_vec();
    let through_seq = session.next_seq.saturating_sub(1);
    let timeout = runtime.config.persist_timeout;
    let store = Arc::clone(&runtime.store);
    let self_tx = runtime.self_tx.clone();
    tokio::spawn(async move {
        let start = std::time::Instant::now();
        let outcome = persist_with_retry(&*store, diagram_id, &diagram, operations, timeout).await;
        metrics::histogram!(METRICS_ID_PERSIST_DURATION).record(start.elapsed().as_millis() as f64);
        let _ = self_tx.send(HubEvent::PersistCompleted { through_seq, outcome }).await;
    });
}

async fn final_persist<D: DiagramStore>(session: &Session, runtime: &HubRuntime<D>) {
    if !session.diagram.dirty {
        return;
    }
    let operations = session.history.since(session.last_save_seq).to_vec();
    if let Err(err) = persist_with_retry(
        &*runtime.store,
        session.diagram_id,
        &session.diagram,
        operations,
        runtime.config.persist_timeout,
    )
    .await
    {
        tracing::error!(diagram_id = %session.diagram_id, %err, "final persist failed");
    }
}

async fn persist_with_retry<D: DiagramStore>(
    store: &D,
    diagram_id: DiagramId,
    diagram: &Diagram,
    operations: Vec<tmi_types::operation::Operation>,
    timeout: Duration,
) -> Result<(), String> {
    let history = HistorySlice { operations };
    let backoff = ExponentialBuilder::new().with_total_delay(Some(timeout)).without_max_times().build();
    (|| store.persist(diagram_id, diagram, &history))
        .retry(backoff)
        .sleep(tokio::time::sleep)
        .await
        .map_err(|err| err.to_string())
}

async fn disconnect_participant(session: &mut Session, connection_id: ConnectionId, reason: ConnectionError) {
    if let Some(mut participant) = session.participants.remove(&connection_id) {
        metrics::gauge!(METRICS_ID_PARTICIPANTS_OPEN).decrement(1.0);
        if let Some(disconnect) = participant.disconnect.take() {
            let _ = disconnect.send(reason);
        }
    }
}

async fn disconnect_all(session: &mut Session, reason: &str) {
    let ids: Vec<ConnectionId> = session.participants.keys().copied().collect();
    for id in ids {
        disconnect_participant(session, id, ConnectionError::Unavailable(reason.to_owned())).await;
    }
}

async fn send_to<D: DiagramStore>(
    session: &mut Session,
    connection_id: ConnectionId,
    message: ServerMessage,
    runtime: &HubRuntime<D>,
) {
    let seq = session.current_seq();
    send_frame_to(session, connection_id, message, seq, runtime).await;
}

async fn send_frame_to<D: DiagramStore>(
    session: &mut Session,
    connection_id: ConnectionId,
    message: ServerMessage,
    seq: u64,
    runtime: &HubRuntime<D>,
) {
    let Some(participant) = session.participants.get(&connection_id) else {
        return;
    };
    let frame = ServerFrame { message_id: Uuid::new_v4(), seq, message };
    let send = tokio::time::timeout(runtime.config.slow_consumer_timeout, participant.outbound.send(frame)).await;
    if !matches!(send, Ok(Ok(()))) {
        metrics::counter!(METRICS_ID_SLOW_CONSUMERS).increment(1);
        disconnect_participant(session, connection_id, ConnectionError::SlowConsumer).await;
    }
}

async fn send_error<D: DiagramStore>(
    session: &mut Session,
    connection_id: ConnectionId,
    err: FrameError,
    message_id: Uuid,
    runtime: &HubRuntime<D>,
) {
    let message = ServerMessage::Error { kind: err.kind(), message: err.message(), message_id };
    send_to(session, connection_id, message, runtime).await;
}

async fn broadcast_all<D: DiagramStore>(session: &mut Session, message: ServerMessage, runtime: &HubRuntime<D>) {
    let seq = session.current_seq();
    let ids: Vec<ConnectionId> = session.participants.keys().copied().collect();
    for id in ids {
        send_frame_to(session, id, message.clone(), seq, runtime).await;
    }
}

async fn broadcast_except<D: DiagramStore>(
    session: &mut Session,
    message: ServerMessage,
    exclude: ConnectionId,
    runtime: &HubRuntime<D>,
) {
    let seq = session.current_seq();
    let ids: Vec<ConnectionId> =
        session.participants.keys().copied().filter(|id| *id != exclude).collect();
    for id in ids {
        send_frame_to(session, id, message.clone(), seq, runtime).await;
    }
}

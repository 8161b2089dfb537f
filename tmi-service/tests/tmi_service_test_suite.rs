//! End-to-end tests for the Session Hub, exercising the websocket
//! Connection Endpoint against an in-process router the way the
//! teacher's `oprf_service_test_suite.rs` drives `tests/setup.rs`'s
//! `TestNode`, but over `axum-test`'s `ws` feature directly instead of
//! spinning up external test containers.
//!
//! Covers testable properties 1 (sequence monotonicity), 4 (presenter
//! uniqueness), 5 (role enforcement), 7 (crash-consistent persistence), 8
//! (backpressure), and Scenarios 1-6, plus the malformed-frame
//! `bad_request` path from spec §7.

mod setup;

use std::time::Duration;

use serde_json::Value;
use setup::TestHarness;
use tmi_types::diagram::{Cell, CellEndpoint, Diagram, Edge, IdentifiedCell, Node, Point, Shape, Size};
use tmi_types::ids::CellId;
use tmi_types::operation::{CellPatch, CellUpdate, OperationPayload};
use tmi_types::presence::Role;
use tmi_types::protocol::{
    ChangePresenterRequest, ClientFrame, ClientMessage, CursorPayload, DiagramOperationRequest, ErrorKind,
    ServerFrame, ServerMessage,
};
use uuid::Uuid;

fn node_cell(shape: Shape, x: f64, y: f64) -> Cell {
    Cell::Node(Node {
        shape,
        position: Point { x, y },
        size: Size { w: 80.0, h: 40.0 },
        angle: None,
        attrs: Value::Null,
        ports: Value::Null,
        parent: None,
    })
}

fn edge_cell(source: CellId, target: CellId) -> Cell {
    Cell::Edge(Edge { source: CellEndpoint::Cell(source), target: CellEndpoint::Cell(target), vertices: vec![], attrs: Value::Null })
}

fn add_cells_frame(cells: Vec<IdentifiedCell>) -> ClientFrame {
    ClientFrame {
        message_id: Uuid::new_v4(),
        message: ClientMessage::DiagramOperation(DiagramOperationRequest {
            op_id: Uuid::new_v4(),
            operation: OperationPayload::AddCells(cells),
        }),
    }
}

fn remove_cells_frame(ids: Vec<CellId>) -> ClientFrame {
    ClientFrame {
        message_id: Uuid::new_v4(),
        message: ClientMessage::DiagramOperation(DiagramOperationRequest {
            op_id: Uuid::new_v4(),
            operation: OperationPayload::RemoveCells(ids),
        }),
    }
}

fn update_cells_frame(cell_id: CellId, position: Point) -> ClientFrame {
    ClientFrame {
        message_id: Uuid::new_v4(),
        message: ClientMessage::DiagramOperation(DiagramOperationRequest {
            op_id: Uuid::new_v4(),
            operation: OperationPayload::UpdateCells(vec![CellUpdate {
                cell_id,
                patch: CellPatch { position: Some(position), ..Default::default() },
            }]),
        }),
    }
}

fn undo_frame() -> ClientFrame {
    ClientFrame { message_id: Uuid::new_v4(), message: ClientMessage::UndoRequest }
}

fn resync_frame() -> ClientFrame {
    ClientFrame { message_id: Uuid::new_v4(), message: ClientMessage::ResyncRequest }
}

/// Reads frames from `ws` until one whose message matches `pred`, skipping
/// anything else (participant-joined/left chatter interleaves with the
/// frames a given test cares about).
async fn recv_until(ws: &mut axum_test::TestWebSocket, pred: impl Fn(&ServerMessage) -> bool) -> ServerFrame {
    loop {
        let frame: ServerFrame = ws.receive_json().await;
        if pred(&frame.message) {
            return frame;
        }
    }
}

#[tokio::test]
async fn scenario_1_ordered_broadcast_and_convergence() {
    let harness = TestHarness::new(&[("alice", Role::Writer), ("bob", Role::Writer)]);
    let mut alice = harness.connect("alice").await;
    let _initial: ServerFrame = alice.receive_json().await; // resync snapshot
    let mut bob = harness.connect("bob").await;
    let _initial: ServerFrame = bob.receive_json().await;

    let c1 = CellId::new();
    let c2 = CellId::new();
    alice.send_json(&add_cells_frame(vec![IdentifiedCell { id: c1, cell: node_cell(Shape::Process, 0.0, 0.0) }])).await;
    bob.send_json(&add_cells_frame(vec![IdentifiedCell { id: c2, cell: node_cell(Shape::Store, 200.0, 0.0) }])).await;

    let mut alice_seqs = Vec::new();
    let mut bob_seqs = Vec::new();
    for _ in 0..2 {
        let frame = recv_until(&mut alice, |m| matches!(m, ServerMessage::AuthoritativeOperation { .. })).await;
        if let ServerMessage::AuthoritativeOperation { operation, .. } = frame.message {
            alice_seqs.push(operation.seq);
        }
        let frame = recv_until(&mut bob, |m| matches!(m, ServerMessage::AuthoritativeOperation { .. })).await;
        if let ServerMessage::AuthoritativeOperation { operation, .. } = frame.message {
            bob_seqs.push(operation.seq);
        }
    }
    assert!(alice_seqs[1] > alice_seqs[0], "property 1: seq must strictly increase");
    assert!(bob_seqs[1] > bob_seqs[0], "property 1: seq must strictly increase");

    alice.send_json(&resync_frame()).await;
    let frame = recv_until(&mut alice, |m| matches!(m, ServerMessage::ResyncResponse(_))).await;
    let ServerMessage::ResyncResponse(snapshot) = frame.message else { unreachable!() };
    let mut ids: Vec<_> = snapshot.diagram.cells.keys().copied().collect();
    ids.sort();
    let mut expected = vec![c1, c2];
    expected.sort();
    assert_eq!(ids, expected, "property 2: convergence on {{c1, c2}}");
}

#[tokio::test]
async fn scenario_2_cascading_delete_and_undo() {
    let harness = TestHarness::new(&[("alice", Role::Writer), ("bob", Role::Writer)]);
    let n1 = CellId::new();
    let n2 = CellId::new();
    let e1 = CellId::new();
    let mut seed = Diagram::empty(chrono::Utc::now());
    seed.cells.insert(n1, node_cell(Shape::Process, 0.0, 0.0));
    seed.cells.insert(n2, node_cell(Shape::Process, 100.0, 0.0));
    seed.cells.insert(e1, edge_cell(n1, n2));
    harness.seed_diagram(seed);

    let mut alice = harness.connect("alice").await;
    let _initial: ServerFrame = alice.receive_json().await;
    let mut bob = harness.connect("bob").await;
    let _initial: ServerFrame = bob.receive_json().await;
    let _joined = recv_until(&mut alice, |m| matches!(m, ServerMessage::ParticipantJoined { .. })).await;

    alice.send_json(&remove_cells_frame(vec![n1])).await;
    let frame = recv_until(&mut alice, |m| matches!(m, ServerMessage::AuthoritativeOperation { .. })).await;
    let ServerMessage::AuthoritativeOperation { operation, .. } = frame.message else { unreachable!() };
    let OperationPayload::RemoveCells(removed) = &operation.payload else { panic!("expected remove_cells") };
    let mut removed = removed.clone();
    removed.sort();
    let mut expected_removed = vec![n1, e1];
    expected_removed.sort();
    assert_eq!(removed, expected_removed, "property 6: cascade removes exactly the referencing edge");

    let frame = recv_until(&mut bob, |m| matches!(m, ServerMessage::AuthoritativeOperation { .. })).await;
    assert!(matches!(frame.message, ServerMessage::AuthoritativeOperation { .. }));

    alice.send_json(&undo_frame()).await;
    let frame = recv_until(&mut alice, |m| matches!(m, ServerMessage::HistoryOperation { .. })).await;
    let ServerMessage::HistoryOperation { initiating_user, .. } = &frame.message else { unreachable!() };
    assert_eq!(initiating_user.0, "alice");

    let bob_frame = recv_until(&mut bob, |m| matches!(m, ServerMessage::HistoryOperation { .. })).await;
    let ServerMessage::HistoryOperation { initiating_user, .. } = bob_frame.message else { unreachable!() };
    assert_eq!(initiating_user.0, "alice", "Bob sees the undo attributed to alice");

    alice.send_json(&resync_frame()).await;
    let frame = recv_until(&mut alice, |m| matches!(m, ServerMessage::ResyncResponse(_))).await;
    let ServerMessage::ResyncResponse(snapshot) = frame.message else { unreachable!() };
    assert!(snapshot.diagram.contains(n1));
    assert!(snapshot.diagram.contains(n2));
    assert!(snapshot.diagram.contains(e1));
}

#[tokio::test]
async fn scenario_3_undo_conflict() {
    let harness = TestHarness::new(&[("alice", Role::Writer), ("bob", Role::Writer)]);
    let mut alice = harness.connect("alice").await;
    let _initial: ServerFrame = alice.receive_json().await;
    let mut bob = harness.connect("bob").await;
    let _initial: ServerFrame = bob.receive_json().await;
    let _joined = recv_until(&mut alice, |m| matches!(m, ServerMessage::ParticipantJoined { .. })).await;

    let c1 = CellId::new();
    alice.send_json(&add_cells_frame(vec![IdentifiedCell { id: c1, cell: node_cell(Shape::Process, 0.0, 0.0) }])).await;
    let _alice_add = recv_until(&mut alice, |m| matches!(m, ServerMessage::AuthoritativeOperation { .. })).await;
    let _bob_add = recv_until(&mut bob, |m| matches!(m, ServerMessage::AuthoritativeOperation { .. })).await;

    bob.send_json(&update_cells_frame(c1, Point { x: 50.0, y: 50.0 })).await;
    let _bob_update = recv_until(&mut bob, |m| matches!(m, ServerMessage::AuthoritativeOperation { .. })).await;
    let _alice_sees_update = recv_until(&mut alice, |m| matches!(m, ServerMessage::AuthoritativeOperation { .. })).await;

    alice.send_json(&undo_frame()).await;
    let frame = recv_until(&mut alice, |m| matches!(m, ServerMessage::Error { .. })).await;
    let ServerMessage::Error { kind, .. } = frame.message else { unreachable!() };
    assert_eq!(kind, ErrorKind::UndoConflict);

    alice.send_json(&resync_frame()).await;
    let frame = recv_until(&mut alice, |m| matches!(m, ServerMessage::ResyncResponse(_))).await;
    let ServerMessage::ResyncResponse(snapshot) = frame.message else { unreachable!() };
    let Cell::Node(node) = &snapshot.diagram.cells[&c1] else { panic!("expected node") };
    assert_eq!(node.position, Point { x: 50.0, y: 50.0 }, "state unchanged by the rejected undo");
}

#[tokio::test]
async fn scenario_4_presenter_handoff() {
    let harness = TestHarness::new(&[("alice", Role::Writer), ("bob", Role::Writer), ("charlie", Role::Reader)]);
    let mut alice = harness.connect("alice").await;
    let _initial: ServerFrame = alice.receive_json().await;
    let mut bob = harness.connect("bob").await;
    let _initial: ServerFrame = bob.receive_json().await;
    let _joined = recv_until(&mut alice, |m| matches!(m, ServerMessage::ParticipantJoined { .. })).await;
    let mut charlie = harness.connect("charlie").await;
    let _initial: ServerFrame = charlie.receive_json().await;
    let _joined = recv_until(&mut alice, |m| matches!(m, ServerMessage::ParticipantJoined { .. })).await;
    let _joined = recv_until(&mut bob, |m| matches!(m, ServerMessage::ParticipantJoined { .. })).await;

    alice.send_json(&ClientFrame { message_id: Uuid::new_v4(), message: ClientMessage::PresenterRequest }).await;
    // Alice becomes presenter; the broadcast reaches everyone already
    // connected. Drain it from all three so later lookups for the
    // handoff's `CurrentPresenter` don't match this stale one instead.
    for ws in [&mut alice, &mut bob, &mut charlie] {
        let frame = recv_until(ws, |m| matches!(m, ServerMessage::CurrentPresenter { .. })).await;
        assert!(matches!(frame.message, ServerMessage::CurrentPresenter { current_presenter: Some(_) }));
    }

    charlie.send_json(&ClientFrame { message_id: Uuid::new_v4(), message: ClientMessage::PresenterRequest }).await;
    let frame = recv_until(&mut charlie, |m| matches!(m, ServerMessage::PresenterDenied { .. })).await;
    assert!(matches!(frame.message, ServerMessage::PresenterDenied { .. }));

    let charlie_id = tmi_types::ids::UserId::from("charlie");
    alice
        .send_json(&ClientFrame {
            message_id: Uuid::new_v4(),
            message: ClientMessage::ChangePresenter(ChangePresenterRequest { new_presenter: charlie_id.clone() }),
        })
        .await;

    for ws in [&mut alice, &mut bob, &mut charlie] {
        let frame = recv_until(ws, |m| matches!(m, ServerMessage::CurrentPresenter { .. })).await;
        let ServerMessage::CurrentPresenter { current_presenter } = frame.message else { unreachable!() };
        assert_eq!(current_presenter, Some(charlie_id.clone()), "property 4: presenter uniqueness — all agree on charlie");
    }

    charlie.send_json(&ClientFrame { message_id: Uuid::new_v4(), message: ClientMessage::PresenterCursor(CursorPayload { x: 1.0, y: 2.0 }) }).await;
    let alice_cursor = recv_until(&mut alice, |m| matches!(m, ServerMessage::PresenterCursor { .. })).await;
    let bob_cursor = recv_until(&mut bob, |m| matches!(m, ServerMessage::PresenterCursor { .. })).await;
    assert!(matches!(alice_cursor.message, ServerMessage::PresenterCursor { .. }));
    assert!(matches!(bob_cursor.message, ServerMessage::PresenterCursor { .. }));
}

#[tokio::test]
async fn scenario_5_role_gating() {
    let harness = TestHarness::new(&[("elena", Role::Reader)]);
    let status = harness.connect_status("diana").await;
    assert_eq!(status, axum::http::StatusCode::FORBIDDEN, "Diana has no role on the threat model");

    let mut elena = harness.connect("elena").await;
    let _initial: ServerFrame = elena.receive_json().await;

    let c1 = CellId::new();
    elena.send_json(&add_cells_frame(vec![IdentifiedCell { id: c1, cell: node_cell(Shape::Process, 0.0, 0.0) }])).await;
    let frame = recv_until(&mut elena, |m| matches!(m, ServerMessage::Error { .. })).await;
    let ServerMessage::Error { kind, .. } = frame.message else { unreachable!() };
    assert_eq!(kind, ErrorKind::Forbidden, "property 5: a reader's diagram_operation is always forbidden");
}

#[tokio::test]
async fn scenario_6_session_lifecycle() {
    let harness = TestHarness::new(&[("alice", Role::Owner), ("bob", Role::Writer)]);
    let mut alice = harness.connect("alice").await;
    let _initial: ServerFrame = alice.receive_json().await;
    let mut bob = harness.connect("bob").await;
    let _initial: ServerFrame = bob.receive_json().await;
    let _joined = recv_until(&mut alice, |m| matches!(m, ServerMessage::ParticipantJoined { .. })).await;

    let c1 = CellId::new();
    alice.send_json(&add_cells_frame(vec![IdentifiedCell { id: c1, cell: node_cell(Shape::Process, 0.0, 0.0) }])).await;
    let _alice_add = recv_until(&mut alice, |m| matches!(m, ServerMessage::AuthoritativeOperation { .. })).await;
    let _bob_add = recv_until(&mut bob, |m| matches!(m, ServerMessage::AuthoritativeOperation { .. })).await;

    alice.send_json(&ClientFrame { message_id: Uuid::new_v4(), message: ClientMessage::EndSession }).await;

    bob.send_json(&add_cells_frame(vec![IdentifiedCell { id: CellId::new(), cell: node_cell(Shape::Process, 1.0, 1.0) }])).await;
    let frame = recv_until(&mut bob, |m| matches!(m, ServerMessage::Error { .. })).await;
    let ServerMessage::Error { kind, .. } = frame.message else { unreachable!() };
    assert_eq!(kind, ErrorKind::Unavailable, "draining refuses new diagram_operation frames");

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if !harness.store.persisted.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("session must flush a final persist within the drain grace period");

    let last = harness.store.persisted.lock().last().cloned().expect("at least one persist");
    assert!(last.contains(c1), "the flushed snapshot contains the whole diagram, not a partial op");
}

#[tokio::test]
async fn backpressure_disconnects_slow_consumer() {
    let harness = TestHarness::new(&[("alice", Role::Writer), ("bob", Role::Writer)]);
    let mut alice = harness.connect("alice").await;
    let _initial: ServerFrame = alice.receive_json().await;
    // Bob connects but never reads; his outbound queue (capacity 4) backs
    // up once Alice floods it with operations, and the hub disconnects
    // him with `slow_consumer` within the configured timeout (200ms in
    // tests). Keep the socket bound to `_bob` so the connection stays
    // open without anything draining it.
    let _bob = harness.connect("bob").await;

    for i in 0..16u32 {
        let id = CellId::new();
        alice
            .send_json(&add_cells_frame(vec![IdentifiedCell {
                id,
                cell: node_cell(Shape::Process, i as f64, i as f64),
            }]))
            .await;
        let _echo = recv_until(&mut alice, |m| matches!(m, ServerMessage::AuthoritativeOperation { .. })).await;
    }

    let frame = recv_until(&mut alice, |m| matches!(m, ServerMessage::ParticipantLeft { .. })).await;
    let ServerMessage::ParticipantLeft { departed_user } = frame.message else { unreachable!() };
    assert_eq!(departed_user.user_id.0, "bob", "property 8: the slow consumer is disconnected, not the others");
}

#[tokio::test]
async fn malformed_frame_gets_bad_request_error_and_connection_stays_up() {
    let harness = TestHarness::new(&[("alice", Role::Writer)]);
    let mut alice = harness.connect("alice").await;
    let _initial: ServerFrame = alice.receive_json().await;

    alice.send_text("not json at all").await;
    let frame = recv_until(&mut alice, |m| matches!(m, ServerMessage::Error { .. })).await;
    let ServerMessage::Error { kind, .. } = frame.message else { unreachable!() };
    assert_eq!(kind, ErrorKind::BadRequest, "a single malformed frame is reported, not fatal");

    // The connection survives a single bad frame: a well-formed operation
    // right after still goes through.
    let c1 = CellId::new();
    alice.send_json(&add_cells_frame(vec![IdentifiedCell { id: c1, cell: node_cell(Shape::Process, 0.0, 0.0) }])).await;
    let frame = recv_until(&mut alice, |m| matches!(m, ServerMessage::AuthoritativeOperation { .. })).await;
    assert!(matches!(frame.message, ServerMessage::AuthoritativeOperation { .. }));
}

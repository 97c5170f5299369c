use super::*;
use crate::message::{DATA_CODE, DATA_RETRYABLE};
use crate::services::canvas::memory::MemoryCanvasStore;
use crate::services::canvas::CanvasStore;
use crate::shape::Geometry;
use crate::state::test_helpers::{join_room_raw, test_app_state, test_app_state_with_user};
use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite;

// =============================================================================
// HELPERS
// =============================================================================

fn conn(username: &str) -> (ConnCtx, mpsc::Receiver<Envelope>) {
    let identity = Identity { user_id: Uuid::new_v4(), username: username.to_owned() };
    let (tx, rx) = mpsc::channel(64);
    let ctx = ConnCtx { client_id: Uuid::new_v4(), identity, current_document: None, tx };
    (ctx, rx)
}

fn envelope_text(kind: &str, document_id: Option<Uuid>, data: serde_json::Value) -> String {
    let mut value = json!({ "kind": kind, "data": data });
    if let Some(id) = document_id {
        value["document_id"] = json!(id);
    }
    value.to_string()
}

async fn join(state: &AppState, ctx: &mut ConnCtx, document_id: Uuid) -> Vec<Envelope> {
    process_inbound_text(state, ctx, &envelope_text("join", Some(document_id), json!({}))).await
}

async fn recv(rx: &mut mpsc::Receiver<Envelope>) -> Envelope {
    tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("should receive an envelope in time")
        .expect("channel should stay open")
}

async fn assert_silent(rx: &mut mpsc::Receiver<Envelope>) {
    let result = tokio::time::timeout(Duration::from_millis(80), rx.recv()).await;
    assert!(result.is_err(), "expected no envelope, got {:?}", result);
}

fn drain(rx: &mut mpsc::Receiver<Envelope>) {
    while rx.try_recv().is_ok() {}
}

/// Poll until `cond` holds, for asserting on fire-and-forget persistence.
async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within one second");
}

fn seed_shape(document_id: Uuid, z_index: i32, created_at: i64) -> Shape {
    Shape {
        id: Uuid::new_v4(),
        document_id,
        created_by: Uuid::new_v4(),
        geometry: Geometry::Rectangle { x1: 0.0, y1: 0.0, x2: 10.0, y2: 10.0 },
        stroke_color: "#ff0000".into(),
        stroke_opacity: 1.0,
        fill_color: "none".into(),
        fill_opacity: 1.0,
        stroke_width: 2.0,
        label: None,
        z_index,
        created_at,
        updated_at: created_at,
    }
}

fn seed_event(document_id: Uuid, ts: i64) -> DrawEvent {
    DrawEvent {
        id: Uuid::new_v4(),
        document_id,
        created_by: Uuid::new_v4(),
        payload: json!({ "points": [[0.0, 0.0], [1.0, 1.0]] }),
        ts,
    }
}

fn error_code_of(envelope: &Envelope) -> &str {
    assert_eq!(envelope.kind, KIND_ERROR, "expected an error envelope, got {}", envelope.kind);
    envelope.data.get(DATA_CODE).and_then(|v| v.as_str()).expect("error should carry a code")
}

// =============================================================================
// JOIN
// =============================================================================

#[tokio::test]
async fn join_without_document_id_is_rejected() {
    let (state, _store) = test_app_state();
    let (mut ctx, _rx) = conn("alice");

    let replies = process_inbound_text(&state, &mut ctx, &envelope_text("join", None, json!({}))).await;

    assert_eq!(replies.len(), 1);
    assert_eq!(error_code_of(&replies[0]), "E_VALIDATION");
    assert!(ctx.current_document.is_none());
}

#[tokio::test]
async fn join_replies_with_snapshot_and_notifies_the_room() {
    let (state, store) = test_app_state();
    let document_id = Uuid::new_v4();

    store.insert_shape(&seed_shape(document_id, 1, 200)).await.expect("seed should succeed");
    store.insert_shape(&seed_shape(document_id, 0, 100)).await.expect("seed should succeed");
    let events: Vec<DrawEvent> = (1..=150).map(|ts| seed_event(document_id, ts)).collect();
    store
        .insert_draw_events_bulk(document_id, &events)
        .await
        .expect("seed should succeed");

    let mut peer_rx = join_room_raw(&state, document_id, Uuid::new_v4(), Uuid::new_v4(), "bob").await;

    let (mut ctx, mut rx) = conn("alice");
    let replies = join(&state, &mut ctx, document_id).await;

    assert_eq!(ctx.current_document, Some(document_id));
    assert_eq!(replies.len(), 1);
    let snapshot = &replies[0];
    assert_eq!(snapshot.kind, "state:snapshot");
    assert_eq!(snapshot.document_id, Some(document_id));

    let shapes = snapshot.data.get("shapes").and_then(|v| v.as_array()).expect("snapshot should list shapes");
    assert_eq!(shapes.len(), 2);
    // Bottom of the z-order comes first.
    assert_eq!(shapes[0].get("z_index").and_then(serde_json::Value::as_i64), Some(0));

    let draw_events = snapshot
        .data
        .get("draw_events")
        .and_then(|v| v.as_array())
        .expect("snapshot should list draw events");
    assert_eq!(draw_events.len(), 100);
    assert_eq!(draw_events[0].get("ts").and_then(serde_json::Value::as_i64), Some(51));
    assert_eq!(draw_events[99].get("ts").and_then(serde_json::Value::as_i64), Some(150));

    let members = snapshot.data.get("members").and_then(|v| v.as_array()).expect("snapshot should list members");
    assert_eq!(members.len(), 2);

    // Peers hear about the arrival, then get the refreshed roster.
    let joined = recv(&mut peer_rx).await;
    assert_eq!(joined.kind, "member:joined");
    assert_eq!(joined.data.get("username").and_then(|v| v.as_str()), Some("alice"));
    let list = recv(&mut peer_rx).await;
    assert_eq!(list.kind, "member:list");

    // The roster broadcast includes the joiner itself.
    let own_list = recv(&mut rx).await;
    assert_eq!(own_list.kind, "member:list");
    assert_eq!(
        own_list.data.get("members").and_then(|v| v.as_array()).map(Vec::len),
        Some(2)
    );
}

#[tokio::test]
async fn failed_snapshot_rolls_the_join_back() {
    let (state, store) = test_app_state();
    let document_id = Uuid::new_v4();
    store.set_fail(true);

    let (mut ctx, _rx) = conn("alice");
    let replies = join(&state, &mut ctx, document_id).await;

    assert_eq!(replies.len(), 1);
    assert_eq!(error_code_of(&replies[0]), "E_PERSISTENCE");
    assert!(ctx.current_document.is_none());
    assert!(state.rooms.read().await.is_empty(), "aborted join should not leak room state");
}

#[tokio::test]
async fn joining_a_second_document_parts_the_first() {
    let (state, _store) = test_app_state();
    let doc_a = Uuid::new_v4();
    let doc_b = Uuid::new_v4();

    let mut peer_rx = join_room_raw(&state, doc_a, Uuid::new_v4(), Uuid::new_v4(), "bob").await;

    let (mut ctx, mut rx) = conn("alice");
    join(&state, &mut ctx, doc_a).await;
    drain(&mut peer_rx);
    drain(&mut rx);

    join(&state, &mut ctx, doc_b).await;
    assert_eq!(ctx.current_document, Some(doc_b));

    let left = recv(&mut peer_rx).await;
    assert_eq!(left.kind, "member:left");
    assert_eq!(left.data.get("username").and_then(|v| v.as_str()), Some("alice"));
    let list = recv(&mut peer_rx).await;
    assert_eq!(list.kind, "member:list");
    assert_eq!(list.data.get("members").and_then(|v| v.as_array()).map(Vec::len), Some(1));
}

// =============================================================================
// OPERATIONS REQUIRE A DOCUMENT
// =============================================================================

#[tokio::test]
async fn drawing_before_joining_is_rejected() {
    let (state, _store) = test_app_state();
    let (mut ctx, _rx) = conn("alice");

    for kind in ["shape:add", "shape:update", "shape:delete", "canvas:clear", "draw:event", "chat:message"] {
        let replies = process_inbound_text(&state, &mut ctx, &envelope_text(kind, None, json!({}))).await;
        assert_eq!(replies.len(), 1, "{kind} should be rejected before join");
        assert_eq!(error_code_of(&replies[0]), "E_VALIDATION", "{kind}");
    }

    // Cursor noise from a not-yet-joined client is dropped without ceremony.
    let replies =
        process_inbound_text(&state, &mut ctx, &envelope_text("cursor:move", None, json!({ "x": 1, "y": 2 }))).await;
    assert!(replies.is_empty());
}

#[tokio::test]
async fn malformed_json_yields_a_parse_error() {
    let (state, _store) = test_app_state();
    let (mut ctx, _rx) = conn("alice");

    let replies = process_inbound_text(&state, &mut ctx, "{not json").await;
    assert_eq!(replies.len(), 1);
    assert_eq!(error_code_of(&replies[0]), "E_VALIDATION");

    let replies = process_inbound_text(&state, &mut ctx, &envelope_text("warp:speed", None, json!({}))).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(error_code_of(&replies[0]), "E_VALIDATION");
}

// =============================================================================
// SHAPES
// =============================================================================

#[tokio::test]
async fn shape_add_broadcasts_to_peers_and_persists() {
    let (state, store) = test_app_state();
    let document_id = Uuid::new_v4();
    let mut peer_rx = join_room_raw(&state, document_id, Uuid::new_v4(), Uuid::new_v4(), "bob").await;

    let (mut ctx, mut rx) = conn("alice");
    join(&state, &mut ctx, document_id).await;
    drain(&mut peer_rx);
    drain(&mut rx);

    // A forged created_by in the payload must not survive stamping.
    let data = json!({
        "kind": "rectangle", "x1": 0.0, "y1": 0.0, "x2": 10.0, "y2": 10.0,
        "created_by": Uuid::new_v4(),
    });
    let replies = process_inbound_text(&state, &mut ctx, &envelope_text("shape:add", None, data)).await;
    assert!(replies.is_empty(), "a successful add has no reply");

    let broadcast = recv(&mut peer_rx).await;
    assert_eq!(broadcast.kind, "shape:add");
    assert_eq!(broadcast.author_user_id, Some(ctx.identity.user_id));
    assert_eq!(
        broadcast.data.get("created_by").and_then(|v| v.as_str()),
        Some(ctx.identity.user_id.to_string().as_str())
    );
    assert_eq!(broadcast.data.get("z_index").and_then(serde_json::Value::as_i64), Some(0));
    assert_silent(&mut rx).await;

    let shape_id: Uuid = broadcast
        .data
        .get("id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .expect("broadcast should carry the shape id");
    let store_probe = Arc::clone(&store);
    wait_for(move || store_probe.shape(document_id, shape_id).is_some()).await;

    let stored = store.shape(document_id, shape_id).expect("shape should be durable");
    assert_eq!(stored.created_by, ctx.identity.user_id);
}

#[tokio::test]
async fn shape_update_merges_and_broadcasts_the_result() {
    let (state, store) = test_app_state();
    let document_id = Uuid::new_v4();
    let shape = seed_shape(document_id, 0, 100);
    store.insert_shape(&shape).await.expect("seed should succeed");

    let mut peer_rx = join_room_raw(&state, document_id, Uuid::new_v4(), Uuid::new_v4(), "bob").await;
    let (mut ctx, mut rx) = conn("alice");
    join(&state, &mut ctx, document_id).await;
    drain(&mut peer_rx);
    drain(&mut rx);

    let data = json!({ "id": shape.id, "x2": 50.0 });
    let replies = process_inbound_text(&state, &mut ctx, &envelope_text("shape:update", None, data)).await;
    assert!(replies.is_empty());

    let broadcast = recv(&mut peer_rx).await;
    assert_eq!(broadcast.kind, "shape:update");
    assert_eq!(broadcast.data.get("x2").and_then(serde_json::Value::as_f64), Some(50.0));
    assert_eq!(broadcast.data.get("stroke_color").and_then(|v| v.as_str()), Some("#ff0000"));

    let stored = store.shape(document_id, shape.id).expect("shape should remain stored");
    assert_eq!(stored.geometry, Geometry::Rectangle { x1: 0.0, y1: 0.0, x2: 50.0, y2: 10.0 });
}

#[tokio::test]
async fn updating_an_unknown_shape_is_an_error_with_no_broadcast() {
    let (state, _store) = test_app_state();
    let document_id = Uuid::new_v4();
    let mut peer_rx = join_room_raw(&state, document_id, Uuid::new_v4(), Uuid::new_v4(), "bob").await;

    let (mut ctx, _rx) = conn("alice");
    join(&state, &mut ctx, document_id).await;
    drain(&mut peer_rx);

    let data = json!({ "id": Uuid::new_v4(), "x2": 50.0 });
    let replies = process_inbound_text(&state, &mut ctx, &envelope_text("shape:update", None, data)).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(error_code_of(&replies[0]), "E_SHAPE_NOT_FOUND");
    assert_silent(&mut peer_rx).await;
}

#[tokio::test]
async fn shape_update_outlives_a_store_outage() {
    let (state, store) = test_app_state();
    let document_id = Uuid::new_v4();
    let shape = seed_shape(document_id, 0, 100);
    store.insert_shape(&shape).await.expect("seed should succeed");

    let mut peer_rx = join_room_raw(&state, document_id, Uuid::new_v4(), Uuid::new_v4(), "bob").await;
    let (mut ctx, _rx) = conn("alice");
    join(&state, &mut ctx, document_id).await;
    drain(&mut peer_rx);

    store.set_fail(true);
    let data = json!({ "id": shape.id, "x2": 50.0 });
    let replies = process_inbound_text(&state, &mut ctx, &envelope_text("shape:update", None, data)).await;

    // The sender learns the write did not stick, and can retry.
    assert_eq!(replies.len(), 1);
    assert_eq!(error_code_of(&replies[0]), "E_PERSISTENCE");
    assert_eq!(replies[0].data.get(DATA_RETRYABLE).and_then(serde_json::Value::as_bool), Some(true));

    // Peers still converge on the live canvas via the stamped partial.
    let partial = recv(&mut peer_rx).await;
    assert_eq!(partial.kind, "shape:update");
    assert_eq!(partial.data.get("x2").and_then(serde_json::Value::as_f64), Some(50.0));
    assert_eq!(partial.author_user_id, Some(ctx.identity.user_id));
}

#[tokio::test]
async fn shape_delete_broadcasts_and_removes_the_shape() {
    let (state, store) = test_app_state();
    let document_id = Uuid::new_v4();
    let shape = seed_shape(document_id, 0, 100);
    store.insert_shape(&shape).await.expect("seed should succeed");

    let mut peer_rx = join_room_raw(&state, document_id, Uuid::new_v4(), Uuid::new_v4(), "bob").await;
    let (mut ctx, _rx) = conn("alice");
    join(&state, &mut ctx, document_id).await;
    drain(&mut peer_rx);

    let replies =
        process_inbound_text(&state, &mut ctx, &envelope_text("shape:delete", None, json!({ "id": shape.id }))).await;
    assert!(replies.is_empty());

    let broadcast = recv(&mut peer_rx).await;
    assert_eq!(broadcast.kind, "shape:delete");
    assert_eq!(
        broadcast.data.get("id").and_then(|v| v.as_str()),
        Some(shape.id.to_string().as_str())
    );

    let store_probe = Arc::clone(&store);
    wait_for(move || store_probe.shape(document_id, shape.id).is_none()).await;
}

// =============================================================================
// DRAW EVENTS AND CANVAS CLEAR
// =============================================================================

#[tokio::test]
async fn draw_events_broadcast_live_and_stage_for_persistence() {
    let (state, _store) = test_app_state();
    let document_id = Uuid::new_v4();
    let mut peer_rx = join_room_raw(&state, document_id, Uuid::new_v4(), Uuid::new_v4(), "bob").await;

    let (mut ctx, mut rx) = conn("alice");
    join(&state, &mut ctx, document_id).await;
    drain(&mut peer_rx);
    drain(&mut rx);

    let data = json!({ "points": [[0.0, 0.0], [5.0, 5.0]] });
    let replies = process_inbound_text(&state, &mut ctx, &envelope_text("draw:event", None, data)).await;
    assert!(replies.is_empty());

    let live = recv(&mut peer_rx).await;
    assert_eq!(live.kind, "draw:event");
    assert_eq!(live.author_user_id, Some(ctx.identity.user_id));
    assert_silent(&mut rx).await;

    assert_eq!(state.draw_buffer.queued(document_id), 1);
}

#[tokio::test]
async fn canvas_clear_wipes_durable_and_staged_state() {
    let (state, store) = test_app_state();
    let document_id = Uuid::new_v4();

    for i in 0..5 {
        store
            .insert_shape(&seed_shape(document_id, i, i64::from(i)))
            .await
            .expect("seed should succeed");
    }
    let durable: Vec<DrawEvent> = (0..200).map(|ts| seed_event(document_id, ts)).collect();
    store
        .insert_draw_events_bulk(document_id, &durable)
        .await
        .expect("seed should succeed");
    for ts in 0..10 {
        draw_buffer::append(&state, seed_event(document_id, ts))
            .await
            .expect("staging should succeed");
    }

    let mut peer_rx = join_room_raw(&state, document_id, Uuid::new_v4(), Uuid::new_v4(), "bob").await;
    let (mut ctx, _rx) = conn("alice");
    join(&state, &mut ctx, document_id).await;
    drain(&mut peer_rx);

    let replies = process_inbound_text(&state, &mut ctx, &envelope_text("canvas:clear", None, json!({}))).await;
    assert!(replies.is_empty());

    let broadcast = recv(&mut peer_rx).await;
    assert_eq!(broadcast.kind, "canvas:clear");
    assert_silent(&mut peer_rx).await;

    assert_eq!(store.shape_count_now(document_id), 0);
    assert_eq!(store.draw_event_count(document_id), 0);
    assert_eq!(state.draw_buffer.queued(document_id), 0);
}

// =============================================================================
// CURSOR AND CHAT
// =============================================================================

#[tokio::test]
async fn cursor_moves_reach_peers_but_never_echo() {
    let (state, _store) = test_app_state();
    let document_id = Uuid::new_v4();
    let mut peer_rx = join_room_raw(&state, document_id, Uuid::new_v4(), Uuid::new_v4(), "bob").await;

    let (mut ctx, mut rx) = conn("alice");
    join(&state, &mut ctx, document_id).await;
    drain(&mut peer_rx);
    drain(&mut rx);

    let data = json!({ "x": 120.5, "y": 44.0 });
    let replies = process_inbound_text(&state, &mut ctx, &envelope_text("cursor:move", None, data)).await;
    assert!(replies.is_empty());

    let cursor = recv(&mut peer_rx).await;
    assert_eq!(cursor.kind, "cursor:move");
    assert_eq!(cursor.data.get("x").and_then(serde_json::Value::as_f64), Some(120.5));
    assert_silent(&mut rx).await;
}

#[tokio::test]
async fn chat_echoes_to_everyone_including_the_sender() {
    let (state, _store) = test_app_state();
    let document_id = Uuid::new_v4();
    let mut peer_rx = join_room_raw(&state, document_id, Uuid::new_v4(), Uuid::new_v4(), "bob").await;

    let (mut ctx, mut rx) = conn("alice");
    join(&state, &mut ctx, document_id).await;
    drain(&mut peer_rx);
    drain(&mut rx);

    let data = json!({ "message": "  hello room  " });
    let replies = process_inbound_text(&state, &mut ctx, &envelope_text("chat:message", None, data)).await;
    assert!(replies.is_empty());

    for receiver in [&mut peer_rx, &mut rx] {
        let chat = recv(receiver).await;
        assert_eq!(chat.kind, "chat:message");
        assert_eq!(chat.data.get("message").and_then(|v| v.as_str()), Some("hello room"));
        assert_eq!(chat.data.get("username").and_then(|v| v.as_str()), Some("alice"));
    }
}

#[tokio::test]
async fn blank_chat_messages_are_rejected() {
    let (state, _store) = test_app_state();
    let document_id = Uuid::new_v4();
    let (mut ctx, _rx) = conn("alice");
    join(&state, &mut ctx, document_id).await;

    let data = json!({ "message": "   " });
    let replies = process_inbound_text(&state, &mut ctx, &envelope_text("chat:message", None, data)).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(error_code_of(&replies[0]), "E_VALIDATION");
}

// =============================================================================
// DISCONNECT
// =============================================================================

#[tokio::test]
async fn leaving_notifies_peers_exactly_once() {
    let (state, _store) = test_app_state();
    let document_id = Uuid::new_v4();
    let mut peer_rx = join_room_raw(&state, document_id, Uuid::new_v4(), Uuid::new_v4(), "bob").await;

    let (mut ctx, _rx) = conn("alice");
    join(&state, &mut ctx, document_id).await;
    drain(&mut peer_rx);

    leave_current(&state, &mut ctx).await;

    let left = recv(&mut peer_rx).await;
    assert_eq!(left.kind, "member:left");
    assert_eq!(left.data.get("username").and_then(|v| v.as_str()), Some("alice"));
    let list = recv(&mut peer_rx).await;
    assert_eq!(list.kind, "member:list");

    // Running the teardown again is a no-op.
    leave_current(&state, &mut ctx).await;
    assert_silent(&mut peer_rx).await;
}

#[tokio::test]
async fn two_clients_converge_on_the_same_canvas() {
    let (state, store) = test_app_state();
    let document_id = Uuid::new_v4();

    let (mut alice, mut alice_rx) = conn("alice");
    join(&state, &mut alice, document_id).await;
    drain(&mut alice_rx);

    let data = json!({ "kind": "ellipse", "x1": 0.0, "y1": 0.0, "x2": 30.0, "y2": 20.0 });
    process_inbound_text(&state, &mut alice, &envelope_text("shape:add", None, data)).await;
    let store_probe = Arc::clone(&store);
    wait_for(move || store_probe.shape_count_now(document_id) == 1).await;

    let (mut bob, mut bob_rx) = conn("bob");
    let replies = join(&state, &mut bob, document_id).await;
    let shapes = replies[0].data.get("shapes").and_then(|v| v.as_array()).expect("snapshot should list shapes");
    assert_eq!(shapes.len(), 1);
    let shape_id = shapes[0].get("id").and_then(|v| v.as_str()).expect("shape should have an id").to_owned();
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    process_inbound_text(&state, &mut bob, &envelope_text("shape:delete", None, json!({ "id": shape_id }))).await;

    let seen = recv(&mut alice_rx).await;
    assert_eq!(seen.kind, "shape:delete");

    let id: Uuid = shape_id.parse().expect("id should be a uuid");
    let store_probe = Arc::clone(&store);
    wait_for(move || store_probe.shape(document_id, id).is_none()).await;
}

// =============================================================================
// END TO END OVER A REAL SOCKET
// =============================================================================

#[tokio::test]
async fn websocket_upgrade_join_and_snapshot_over_the_wire() {
    let (state, _store, _identity) = test_app_state_with_user("token123", "alice");
    let app = crate::routes::app(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("should bind an ephemeral port");
    let addr = listener.local_addr().expect("listener should have an address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server should run");
    });

    let (mut ws, _) = connect_async(format!("ws://{addr}/api/ws?token=token123"))
        .await
        .expect("upgrade should succeed with a valid token");

    let document_id = Uuid::new_v4();
    ws.send(tungstenite::Message::Text(
        envelope_text("join", Some(document_id), json!({})).into(),
    ))
    .await
    .expect("join should send");

    let snapshot = next_envelope(&mut ws).await;
    assert_eq!(snapshot.kind, "state:snapshot");
    assert_eq!(snapshot.document_id, Some(document_id));

    let list = next_envelope(&mut ws).await;
    assert_eq!(list.kind, "member:list");
}

#[tokio::test]
async fn websocket_upgrade_is_refused_without_a_valid_token() {
    let (state, _store) = test_app_state();
    let app = crate::routes::app(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("should bind an ephemeral port");
    let addr = listener.local_addr().expect("listener should have an address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server should run");
    });

    let err = connect_async(format!("ws://{addr}/api/ws?token=bogus"))
        .await
        .expect_err("upgrade should be refused");
    match err {
        tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), axum::http::StatusCode::UNAUTHORIZED);
        }
        other => panic!("expected an http rejection, got {other:?}"),
    }
}

async fn next_envelope<S>(ws: &mut S) -> Envelope
where
    S: Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("should receive a frame in time")
            .expect("stream should stay open")
            .expect("frame should be well formed");
        match msg {
            tungstenite::Message::Text(text) => {
                return serde_json::from_str(&text).expect("frame should be an envelope");
            }
            tungstenite::Message::Ping(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

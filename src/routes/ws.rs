//! WebSocket handler — the event router.
//!
//! DESIGN
//! ======
//! On upgrade the session token is verified, a client ID is generated, and
//! the connection enters a `select!` loop:
//! - Inbound client envelopes → parse + dispatch by kind
//! - Envelopes broadcast by room peers → forward to this client
//! - Ping ticker → liveness probe, disconnect on missed pongs
//!
//! Handler functions are pure business logic — they validate, mutate state,
//! and return an `Outcome`. The dispatch layer owns fan-out: reply to the
//! sender, broadcast to peers, broadcast to the whole room.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade with `?token=` → verify → run loop
//! 2. Client sends `join` → `state:snapshot` back, `member:joined` to peers
//! 3. Drawing operations broadcast live, persist off the hot path
//! 4. Close or pong timeout → `member:left` + refreshed `member:list`

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::message::{Data, Envelope, KIND_ERROR, now_ms};
use crate::services::canvas::{CanvasError, DrawEvent};
use crate::services::session::Identity;
use crate::services::{draw_buffer, room};
use crate::shape::{self, Shape};
use crate::state::{AppState, Member};

const DEFAULT_PING_INTERVAL_SECS: u64 = 30;
const DEFAULT_PONG_TIMEOUT_SECS: u64 = 75;

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

// =============================================================================
// CONNECTION CONTEXT
// =============================================================================

/// Per-connection state. A connection holds one verified identity and is
/// joined to at most one document at a time.
struct ConnCtx {
    client_id: Uuid,
    identity: Identity,
    current_document: Option<Uuid>,
    /// Sender half of this connection's broadcast channel; clones of it
    /// live in every room this connection joins.
    tx: mpsc::Sender<Envelope>,
}

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. The dispatch layer uses this to
/// decide who receives what — handlers never touch the socket.
#[derive(Default)]
struct Outcome {
    /// Sent to the sender over its own socket.
    reply: Vec<Envelope>,
    /// Broadcast to room members excluding the sender.
    peers: Vec<Envelope>,
    /// Broadcast to all room members including the sender (chat only).
    everyone: Vec<Envelope>,
}

impl Outcome {
    fn reply(envelope: Envelope) -> Self {
        Self { reply: vec![envelope], ..Self::default() }
    }

    fn peers(envelope: Envelope) -> Self {
        Self { peers: vec![envelope], ..Self::default() }
    }

    fn everyone(envelope: Envelope) -> Self {
        Self { everyone: vec![envelope], ..Self::default() }
    }
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = params.get("token") else {
        return (StatusCode::UNAUTHORIZED, "token required").into_response();
    };

    let identity = match state.auth.verify(token).await {
        Ok(Some(identity)) => identity,
        Ok(None) => return (StatusCode::UNAUTHORIZED, "invalid or expired token").into_response(),
        Err(e) => {
            error!(error = %e, "ws token verification failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "token verification error").into_response();
        }
    };

    ws.on_upgrade(move |socket| run_ws(socket, state, identity))
}

// =============================================================================
// CONNECTION LOOP
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, identity: Identity) {
    let client_id = Uuid::new_v4();
    let (client_tx, mut client_rx) = mpsc::channel::<Envelope>(256);
    let mut ctx = ConnCtx { client_id, identity, current_document: None, tx: client_tx };

    info!(%client_id, user_id = %ctx.identity.user_id, "ws: client connected");

    let ping_interval = Duration::from_secs(env_parse("WS_PING_INTERVAL_SECS", DEFAULT_PING_INTERVAL_SECS));
    let pong_timeout = Duration::from_secs(env_parse("WS_PONG_TIMEOUT_SECS", DEFAULT_PONG_TIMEOUT_SECS));
    let mut ping_timer = tokio::time::interval(ping_interval);
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies = process_inbound_text(&state, &mut ctx, &text).await;
                        if send_all(&mut socket, replies).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) => {
                        last_pong = Instant::now();
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(envelope) = client_rx.recv() => {
                if send_envelope(&mut socket, &envelope).await.is_err() {
                    break;
                }
            }
            _ = ping_timer.tick() => {
                if last_pong.elapsed() > pong_timeout {
                    info!(%client_id, "ws: pong timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    leave_current(&state, &mut ctx).await;
    info!(%client_id, "ws: client disconnected");
}

/// Part the current document, if any. Broadcasts `member:left` and a
/// refreshed `member:list` only when this was the user's last connection.
/// Safe to run more than once.
async fn leave_current(state: &AppState, ctx: &mut ConnCtx) {
    let Some(document_id) = ctx.current_document.take() else {
        return;
    };

    let Some(member) = room::leave(state, document_id, ctx.client_id).await else {
        return;
    };

    let left = Envelope::new("member:left", Data::new())
        .with_document_id(document_id)
        .with_author(member.user_id)
        .with_data("user_id", serde_json::json!(member.user_id))
        .with_data("username", member.username);
    room::broadcast(state, document_id, &left, None).await;

    let members = room::list_members(state, document_id).await;
    let list = member_list_envelope(document_id, &members);
    room::broadcast(state, document_id, &list, None).await;
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Parse and process one inbound text envelope, returning envelopes for the
/// sender. Transport-free so tests exercise dispatch and broadcast behavior
/// without a socket.
async fn process_inbound_text(state: &AppState, ctx: &mut ConnCtx, text: &str) -> Vec<Envelope> {
    let mut req: Envelope = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(client_id = %ctx.client_id, error = %e, "ws: invalid inbound envelope");
            return vec![Envelope::error("parse", format!("invalid json: {e}"))];
        }
    };

    // Authorship and time come from the server; client-supplied values are
    // overwritten before any handler runs.
    req.author_user_id = Some(ctx.identity.user_id);
    req.ts = now_ms();

    let high_frequency = matches!(req.kind.as_str(), "cursor:move" | "draw:event");
    if !high_frequency {
        info!(client_id = %ctx.client_id, id = %req.id, kind = %req.kind, "ws: recv envelope");
    }

    let result = match req.kind.as_str() {
        "join" => handle_join(state, ctx, &req).await,
        "shape:add" | "shape:update" | "shape:delete" => handle_shape(state, ctx, &req).await,
        "canvas:clear" => handle_canvas_clear(state, ctx, &req).await,
        "draw:event" => handle_draw_event(state, ctx, &req).await,
        "cursor:move" => Ok(handle_cursor(ctx, &req)),
        "chat:message" => handle_chat(ctx, &req),
        other => Err(Envelope::error(other, format!("unknown kind: {other}"))),
    };

    match result {
        Ok(outcome) => {
            if let Some(document_id) = ctx.current_document {
                for envelope in outcome.peers {
                    room::broadcast(state, document_id, &envelope, Some(ctx.client_id)).await;
                }
                for envelope in outcome.everyone {
                    room::broadcast(state, document_id, &envelope, None).await;
                }
            }
            outcome.reply
        }
        Err(err_envelope) => vec![err_envelope],
    }
}

// =============================================================================
// JOIN HANDLER
// =============================================================================

async fn handle_join(state: &AppState, ctx: &mut ConnCtx, req: &Envelope) -> Result<Outcome, Envelope> {
    let Some(document_id) = req.document_id.or_else(|| data_uuid(&req.data, "document_id")) else {
        return Err(Envelope::error("join", "document_id required"));
    };

    // Joining a second document parts the first.
    leave_current(state, ctx).await;

    room::join(
        state,
        document_id,
        ctx.client_id,
        ctx.identity.user_id,
        &ctx.identity.username,
        ctx.tx.clone(),
    )
    .await;

    let snapshot = match state.store.document_snapshot(document_id).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, %document_id, "snapshot fetch failed");
            room::leave(state, document_id, ctx.client_id).await;
            return Err(Envelope::error_from("join", &e).with_document_id(document_id));
        }
    };
    ctx.current_document = Some(document_id);

    let members = room::list_members(state, document_id).await;

    let mut snapshot_data = Data::new();
    snapshot_data.insert("shapes".into(), serde_json::to_value(&snapshot.shapes).unwrap_or_default());
    snapshot_data.insert(
        "draw_events".into(),
        serde_json::to_value(&snapshot.draw_events).unwrap_or_default(),
    );
    snapshot_data.insert("members".into(), serde_json::to_value(&members).unwrap_or_default());
    snapshot_data.insert("last_modified".into(), serde_json::json!(snapshot.last_modified));
    let reply = Envelope::new("state:snapshot", snapshot_data).with_document_id(document_id);

    let joined = Envelope::new("member:joined", Data::new())
        .with_document_id(document_id)
        .with_author(ctx.identity.user_id)
        .with_data("user_id", serde_json::json!(ctx.identity.user_id))
        .with_data("username", ctx.identity.username.clone());

    Ok(Outcome {
        reply: vec![reply],
        peers: vec![joined],
        everyone: vec![member_list_envelope(document_id, &members)],
    })
}

// =============================================================================
// SHAPE HANDLERS
// =============================================================================

async fn handle_shape(state: &AppState, ctx: &ConnCtx, req: &Envelope) -> Result<Outcome, Envelope> {
    let Some(document_id) = ctx.current_document else {
        return Err(Envelope::error(&req.kind, "must join a document first"));
    };

    let op = req.kind.split_once(':').map_or("", |(_, op)| op);
    match op {
        "add" => {
            let new_shape = shape::parse_new_shape(&req.data).map_err(|e| Envelope::error_from(&req.kind, &e))?;

            // Best effort: a count failure degrades z-order, not the add.
            let z_index = match state.store.shape_count(document_id).await {
                Ok(n) => i32::try_from(n).unwrap_or(i32::MAX),
                Err(e) => {
                    warn!(error = %e, %document_id, "shape count failed, z-order fallback");
                    0
                }
            };

            let stamped = Shape {
                id: Uuid::new_v4(),
                document_id,
                created_by: ctx.identity.user_id,
                geometry: new_shape.geometry,
                stroke_color: new_shape.stroke_color,
                stroke_opacity: new_shape.stroke_opacity,
                fill_color: new_shape.fill_color,
                fill_opacity: new_shape.fill_opacity,
                stroke_width: new_shape.stroke_width,
                label: new_shape.label,
                z_index,
                created_at: req.ts,
                updated_at: req.ts,
            };

            let broadcast = Envelope::new("shape:add", stamped.to_data())
                .with_document_id(document_id)
                .with_author(ctx.identity.user_id);

            persist_shape_add(state, ctx, stamped);
            Ok(Outcome::peers(broadcast))
        }
        "update" => {
            let Some(shape_id) = data_uuid(&req.data, "id") else {
                return Err(Envelope::error(&req.kind, "id required"));
            };

            match state.store.update_shape(document_id, shape_id, &req.data, req.ts).await {
                Ok(merged) => {
                    touch_fire_and_forget(state, document_id, req.ts);
                    let broadcast = Envelope::new("shape:update", merged.to_data())
                        .with_document_id(document_id)
                        .with_author(ctx.identity.user_id);
                    Ok(Outcome::peers(broadcast))
                }
                Err(e @ CanvasError::ShapeNotFound(_)) => {
                    Err(Envelope::error_from(&req.kind, &e).with_document_id(document_id))
                }
                Err(e) => {
                    // Store outage: peers still see the stamped partial so
                    // the live canvas converges; the sender learns the write
                    // did not stick.
                    warn!(error = %e, %shape_id, "shape update persist failed");
                    let mut partial = req.clone();
                    partial.document_id = Some(document_id);
                    Ok(Outcome {
                        reply: vec![Envelope::error_from(&req.kind, &e).with_document_id(document_id)],
                        peers: vec![partial],
                        everyone: vec![],
                    })
                }
            }
        }
        "delete" => {
            let Some(shape_id) = data_uuid(&req.data, "id") else {
                return Err(Envelope::error(&req.kind, "id required"));
            };

            let broadcast = Envelope::new("shape:delete", Data::new())
                .with_document_id(document_id)
                .with_author(ctx.identity.user_id)
                .with_data("id", serde_json::json!(shape_id));

            persist_shape_delete(state, ctx, document_id, shape_id, req.ts);
            Ok(Outcome::peers(broadcast))
        }
        _ => Err(Envelope::error(&req.kind, format!("unknown shape op: {op}"))),
    }
}

/// Persist an added shape off the hot path. A failure is logged and surfaced
/// to the sender as a retryable error; the broadcast already happened.
fn persist_shape_add(state: &AppState, ctx: &ConnCtx, stamped: Shape) {
    let state = state.clone();
    let tx = ctx.tx.clone();
    tokio::spawn(async move {
        let document_id = stamped.document_id;
        let ts = stamped.updated_at;
        if let Err(e) = state.store.insert_shape(&stamped).await {
            warn!(error = %e, shape_id = %stamped.id, "shape persist failed");
            let _ = tx.try_send(Envelope::error_from("shape:add", &e).with_document_id(document_id));
            return;
        }
        if let Err(e) = state.store.touch_last_modified(document_id, ts).await {
            warn!(error = %e, %document_id, "last_modified update failed");
        }
    });
}

fn persist_shape_delete(state: &AppState, ctx: &ConnCtx, document_id: Uuid, shape_id: Uuid, ts: i64) {
    let state = state.clone();
    let tx = ctx.tx.clone();
    tokio::spawn(async move {
        if let Err(e) = state.store.delete_shape(document_id, shape_id).await {
            warn!(error = %e, %shape_id, "shape delete persist failed");
            let _ = tx.try_send(Envelope::error_from("shape:delete", &e).with_document_id(document_id));
            return;
        }
        if let Err(e) = state.store.touch_last_modified(document_id, ts).await {
            warn!(error = %e, %document_id, "last_modified update failed");
        }
    });
}

fn touch_fire_and_forget(state: &AppState, document_id: Uuid, ts: i64) {
    let state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = state.store.touch_last_modified(document_id, ts).await {
            warn!(error = %e, %document_id, "last_modified update failed");
        }
    });
}

// =============================================================================
// CANVAS CLEAR HANDLER
// =============================================================================

async fn handle_canvas_clear(state: &AppState, ctx: &ConnCtx, req: &Envelope) -> Result<Outcome, Envelope> {
    let Some(document_id) = ctx.current_document else {
        return Err(Envelope::error(&req.kind, "must join a document first"));
    };

    // Staged-but-unflushed events die with the canvas.
    draw_buffer::reset(state, document_id);

    let clear = Envelope::new("canvas:clear", Data::new())
        .with_document_id(document_id)
        .with_author(ctx.identity.user_id);
    let mut outcome = Outcome::peers(clear);

    let result: Result<(), CanvasError> = async {
        state.store.delete_all_shapes(document_id).await?;
        state.store.delete_all_draw_events(document_id).await?;
        state.store.touch_last_modified(document_id, req.ts).await
    }
    .await;

    if let Err(e) = result {
        error!(error = %e, %document_id, "canvas clear persist failed");
        outcome
            .reply
            .push(Envelope::error_from(&req.kind, &e).with_document_id(document_id));
    }

    Ok(outcome)
}

// =============================================================================
// DRAW EVENT HANDLER
// =============================================================================

async fn handle_draw_event(state: &AppState, ctx: &ConnCtx, req: &Envelope) -> Result<Outcome, Envelope> {
    let Some(document_id) = ctx.current_document else {
        return Err(Envelope::error(&req.kind, "must join a document first"));
    };

    // Broadcast before staging so the live path is never behind a flush.
    let mut live = req.clone();
    live.document_id = Some(document_id);
    room::broadcast(state, document_id, &live, Some(ctx.client_id)).await;

    let event = DrawEvent {
        id: req.id,
        document_id,
        created_by: ctx.identity.user_id,
        payload: serde_json::to_value(&req.data).unwrap_or_default(),
        ts: req.ts,
    };

    if let Err(e) = draw_buffer::append(state, event).await {
        warn!(error = %e, %document_id, "draw-event flush failed");
        return Ok(Outcome::reply(
            Envelope::error_from(&req.kind, &e).with_document_id(document_id),
        ));
    }

    Ok(Outcome::default())
}

// =============================================================================
// CURSOR HANDLER
// =============================================================================

fn handle_cursor(ctx: &ConnCtx, req: &Envelope) -> Outcome {
    // Cursor moves before joining are silently ignored.
    let Some(document_id) = ctx.current_document else {
        return Outcome::default();
    };

    let mut envelope = req.clone();
    envelope.document_id = Some(document_id);
    Outcome::peers(envelope)
}

// =============================================================================
// CHAT HANDLER
// =============================================================================

fn handle_chat(ctx: &ConnCtx, req: &Envelope) -> Result<Outcome, Envelope> {
    let Some(document_id) = ctx.current_document else {
        return Err(Envelope::error(&req.kind, "must join a document first"));
    };

    let message = req
        .data
        .get("message")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .unwrap_or("");
    if message.is_empty() {
        return Err(Envelope::error(&req.kind, "message required"));
    }

    // The one self-echoing operation: the sender renders its own chat line
    // from the broadcast, same as everyone else.
    let envelope = Envelope::new("chat:message", Data::new())
        .with_document_id(document_id)
        .with_author(ctx.identity.user_id)
        .with_data("message", message)
        .with_data("username", ctx.identity.username.clone());
    Ok(Outcome::everyone(envelope))
}

// =============================================================================
// HELPERS
// =============================================================================

fn data_uuid(data: &Data, key: &str) -> Option<Uuid> {
    data.get(key)
        .and_then(serde_json::Value::as_str)
        .and_then(|s| s.parse().ok())
}

fn member_list_envelope(document_id: Uuid, members: &[Member]) -> Envelope {
    Envelope::new("member:list", Data::new())
        .with_document_id(document_id)
        .with_data("members", serde_json::to_value(members).unwrap_or_default())
}

async fn send_all(socket: &mut WebSocket, envelopes: Vec<Envelope>) -> Result<(), ()> {
    for envelope in envelopes {
        send_envelope(socket, &envelope).await?;
    }
    Ok(())
}

async fn send_envelope(socket: &mut WebSocket, envelope: &Envelope) -> Result<(), ()> {
    let json = match serde_json::to_string(envelope) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize envelope");
            return Err(());
        }
    };

    if envelope.kind == KIND_ERROR {
        let code = envelope
            .data
            .get(crate::message::DATA_CODE)
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        let message = envelope
            .data
            .get(crate::message::DATA_MESSAGE)
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        warn!(id = %envelope.id, code, message, "ws: send error envelope");
    }

    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;

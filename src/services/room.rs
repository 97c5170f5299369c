//! Room registry — membership and fan-out for document rooms.
//!
//! DESIGN
//! ======
//! A room is the set of connections currently joined to one document. The
//! registry is process-wide in-memory state, mutated only through these
//! functions by the event router; transport code never touches it. Rooms
//! hold membership and sender handles only — shapes live in the canvas
//! store — so an empty room is evicted immediately on last leave.

use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::message::Envelope;
use crate::state::{AppState, Member, RoomClient, RoomState};

// =============================================================================
// JOIN / LEAVE
// =============================================================================

/// Idempotent membership upsert. A user already in the room keeps their
/// original `joined_at`; a second connection for the same user shares the
/// membership record.
pub async fn join(
    state: &AppState,
    document_id: Uuid,
    client_id: Uuid,
    user_id: Uuid,
    username: &str,
    tx: mpsc::Sender<Envelope>,
) {
    let mut rooms = state.rooms.write().await;
    let room = rooms.entry(document_id).or_insert_with(RoomState::new);

    room.clients.insert(client_id, RoomClient { user_id, tx });
    room.members.entry(user_id).or_insert_with(|| Member {
        user_id,
        username: username.to_owned(),
        joined_at: crate::message::now_ms(),
    });

    info!(%document_id, %client_id, %user_id, clients = room.clients.len(), "client joined room");
}

/// Remove a connection. Returns the departed member when this was the
/// user's last connection in the room (the caller broadcasts `member:left`
/// only in that case), `None` otherwise — including repeated calls, which
/// makes disconnect cleanup idempotent. Evicts the room once empty.
pub async fn leave(state: &AppState, document_id: Uuid, client_id: Uuid) -> Option<Member> {
    let mut rooms = state.rooms.write().await;
    let room = rooms.get_mut(&document_id)?;

    let departed = room.clients.remove(&client_id)?;
    info!(%document_id, %client_id, remaining = room.clients.len(), "client left room");

    let user_still_connected = room
        .clients
        .values()
        .any(|c| c.user_id == departed.user_id);
    let member = if user_still_connected {
        None
    } else {
        room.members.remove(&departed.user_id)
    };

    if room.clients.is_empty() {
        rooms.remove(&document_id);
        info!(%document_id, "evicted empty room");
    }

    member
}

// =============================================================================
// QUERIES
// =============================================================================

/// Membership snapshot, ordered by join time for stable display.
pub async fn list_members(state: &AppState, document_id: Uuid) -> Vec<Member> {
    let rooms = state.rooms.read().await;
    let Some(room) = rooms.get(&document_id) else {
        return Vec::new();
    };
    let mut members: Vec<Member> = room.members.values().cloned().collect();
    members.sort_by(|a, b| (a.joined_at, a.user_id).cmp(&(b.joined_at, b.user_id)));
    members
}

pub async fn is_empty(state: &AppState, document_id: Uuid) -> bool {
    let rooms = state.rooms.read().await;
    rooms.get(&document_id).is_none_or(|r| r.clients.is_empty())
}

// =============================================================================
// BROADCAST
// =============================================================================

/// Fan an envelope out to every connection in a room, optionally excluding
/// one (the sender, for everything but chat).
pub async fn broadcast(state: &AppState, document_id: Uuid, envelope: &Envelope, exclude: Option<Uuid>) {
    let rooms = state.rooms.read().await;
    let Some(room) = rooms.get(&document_id) else {
        return;
    };

    for (client_id, client) in &room.clients {
        if exclude == Some(*client_id) {
            continue;
        }
        // Best-effort: if a client's channel is full, skip it.
        let _ = client.tx.try_send(envelope.clone());
    }
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;

//! WebSocket handler — event relay and dispatch.
//!
//! DESIGN
//! ======
//! On upgrade, mints a connection handle and enters a `select!` loop:
//! - Inbound client events → parse + dispatch by `kind`
//! - Fanout events from room peers → forward to the client
//!
//! Dispatch owns all outbound concerns: replies go to the sender, notices go
//! to room peers through the broadcast router, and errors are always scoped
//! to the connection that caused them. By the time anything is broadcast the
//! originating store write has committed.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → send `connected` with `conn_id`
//! 2. `join` → snapshot to joiner, `member-joined` to peers
//! 3. Deck actions → store write, `<kind>-applied` to the whole room
//! 4. `leave` or socket close → durable-then-memory cleanup, `member-left`

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::event::{Data, Event, KIND_ERROR};
use crate::presence::ConnId;
use crate::services::broadcast;
use crate::services::lifecycle::{self, Connection, Phase};
use crate::services::store::{DeckAction, Role};
use crate::state::AppState;

/// Outbound queue depth per connection. A member that falls further behind
/// than this starts losing fanout events (best-effort delivery).
const OUTBOUND_QUEUE: usize = 256;

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState) {
    let conn_id = ConnId::new();

    // Per-connection channel for receiving fanout events from room peers.
    let (tx, mut rx) = mpsc::channel::<Event>(OUTBOUND_QUEUE);
    let mut conn = Connection::new(conn_id, tx);

    let welcome = Event::new("connected", Data::new()).with_data("conn_id", conn_id.to_string());
    if send_event(&mut socket, &welcome).await.is_err() {
        return;
    }
    info!(%conn_id, "ws: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies = process_event_text(&state, &mut conn, &text).await;
                        let mut failed = false;
                        for event in &replies {
                            if send_event(&mut socket, event).await.is_err() {
                                failed = true;
                                break;
                            }
                        }
                        // Voluntary leave closes the connection.
                        if failed || matches!(conn.phase, Phase::Closed) {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            maybe = rx.recv() => {
                let Some(event) = maybe else { break };
                let replaced = event.kind == "session-replaced";
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
                if replaced {
                    // A newer connection took over this participant's seat.
                    break;
                }
            }
        }
    }

    // Transport teardown. A connection that already left (or was displaced)
    // has no binding; disconnect is then a no-op and nothing is announced.
    conn.phase = conn.phase.on_transport_loss();
    if let Some(departure) = lifecycle::disconnect(&state, conn_id).await {
        let notice = member_left(departure.presentation_id, departure.session_id);
        broadcast::broadcast(&state, departure.presentation_id, &notice, None).await;
    }
    if let Ok(phase) = conn.phase.close() {
        conn.phase = phase;
    }
    info!(%conn_id, "ws: client disconnected");
}

// =============================================================================
// DISPATCH
// =============================================================================

async fn process_event_text(state: &AppState, conn: &mut Connection, text: &str) -> Vec<Event> {
    let req: Event = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(conn_id = %conn.conn_id, error = %e, "ws: invalid inbound event");
            let err = Event::new(KIND_ERROR, Data::new()).with_data("message", format!("invalid json: {e}"));
            return vec![err];
        }
    };
    process_event(state, conn, req).await
}

/// Dispatch one inbound event and return the events for the sender.
///
/// Kept free of socket concerns so tests can exercise join/leave/action
/// dispatch and fanout behavior end-to-end without a transport.
async fn process_event(state: &AppState, conn: &mut Connection, req: Event) -> Vec<Event> {
    // Any traffic from a joined connection is a heartbeat.
    if let Some((_, session_id)) = conn.joined() {
        lifecycle::touch_fire_and_forget(state, session_id);
    }

    match req.kind.as_str() {
        "join" => handle_join(state, conn, &req).await,
        "leave" => handle_leave(state, conn, &req).await,
        kind => match DeckAction::parse(kind, &req.data) {
            Some(Ok(action)) => handle_action(state, conn, &req, &action).await,
            Some(Err(msg)) => vec![req.error(msg)],
            None => vec![req.error(format!("unknown event kind: {kind}"))],
        },
    }
}

// =============================================================================
// JOIN / LEAVE
// =============================================================================

async fn handle_join(state: &AppState, conn: &mut Connection, req: &Event) -> Vec<Event> {
    let presentation_id = req.presentation_id.or_else(|| data_uuid(&req.data, "presentation_id"));
    let Some(presentation_id) = presentation_id else {
        return vec![req.error("presentation_id required")];
    };
    let Some(nickname) = req.data.get("nickname").and_then(|v| v.as_str()) else {
        return vec![req.error("nickname required")];
    };
    let role = req.data.get("role").and_then(|v| v.as_str()).and_then(Role::from_str);

    match lifecycle::join(state, conn, presentation_id, nickname, role).await {
        Ok(outcome) => {
            let notice = Event::new("member-joined", Data::new())
                .with_presentation_id(presentation_id)
                .with_data("session", serde_json::json!(outcome.session));
            broadcast::broadcast(state, presentation_id, &notice, Some(conn.conn_id)).await;

            let mut data = Data::new();
            data.insert("presentation".into(), serde_json::json!(outcome.snapshot.presentation));
            data.insert("slides".into(), serde_json::json!(outcome.snapshot.slides));
            data.insert("session".into(), serde_json::json!(outcome.session));
            data.insert("members".into(), serde_json::json!(outcome.members));
            vec![req.reply("joined", data).with_presentation_id(presentation_id)]
        }
        Err(e) => vec![req.error_from(&e)],
    }
}

async fn handle_leave(state: &AppState, conn: &mut Connection, req: &Event) -> Vec<Event> {
    match lifecycle::leave(state, conn).await {
        Ok(departure) => {
            // The leaver is already evicted; remaining members get the notice.
            let notice = member_left(departure.presentation_id, departure.session_id);
            broadcast::broadcast(state, departure.presentation_id, &notice, None).await;
            vec![
                req.reply("left", Data::new())
                    .with_presentation_id(departure.presentation_id),
            ]
        }
        Err(e) => vec![req.error_from(&e)],
    }
}

// =============================================================================
// DECK ACTIONS
// =============================================================================

async fn handle_action(state: &AppState, conn: &mut Connection, req: &Event, action: &DeckAction) -> Vec<Event> {
    let Some((presentation_id, _)) = conn.joined() else {
        return vec![req.error("must join a presentation first")];
    };

    match state.store.apply_action(presentation_id, action).await {
        Ok(delta) => {
            let mut data = Data::new();
            match delta {
                serde_json::Value::Object(map) => data.extend(map),
                other => {
                    data.insert("result".into(), other);
                }
            }
            let reply = req.applied(data).with_presentation_id(presentation_id);
            // Peers get an uncorrelated copy; the sender's carries parent_id.
            broadcast::broadcast(state, presentation_id, &reply.peer_copy(), Some(conn.conn_id)).await;
            vec![reply]
        }
        Err(e) => vec![req.error_from(&e)],
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn member_left(presentation_id: Uuid, session_id: Uuid) -> Event {
    Event::new("member-left", Data::new())
        .with_presentation_id(presentation_id)
        .with_data("session_id", session_id.to_string())
}

fn data_uuid(data: &Data, key: &str) -> Option<Uuid> {
    data.get(key).and_then(|v| v.as_str()).and_then(|s| s.parse().ok())
}

async fn send_event(socket: &mut WebSocket, event: &Event) -> Result<(), ()> {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize event");
            return Err(());
        }
    };
    if event.kind == KIND_ERROR {
        let message = event.data.get("message").and_then(|v| v.as_str()).unwrap_or("-");
        warn!(id = %event.id, message, "ws: send error event");
    }
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;

//! Broadcast router: room fanout over per-connection channels.
//!
//! DESIGN
//! ======
//! Fanout is best effort. Each member's channel is bounded; `try_send`
//! drops the event for a member whose queue is full or whose receiver is
//! gone rather than stalling the room. Membership is snapshotted under the
//! read lock and the sends happen after it is released, so a slow socket
//! never holds up presence mutations.
//!
//! Error events are never routed here: they stay scoped to the connection
//! whose request caused them.

use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::Event;
use crate::presence::ConnId;
use crate::state::AppState;

/// Deliver an event to every member of a room, minus `exclude` (normally
/// the originating connection, which gets a correlated reply instead).
/// A missing room means no members, not an error.
pub async fn broadcast(state: &AppState, presentation_id: Uuid, event: &Event, exclude: Option<ConnId>) {
    let senders = state.presence.read().await.senders(presentation_id);

    let mut delivered = 0usize;
    for (conn_id, tx) in senders {
        if Some(conn_id) == exclude {
            continue;
        }
        match tx.try_send(event.clone()) {
            Ok(()) => delivered += 1,
            Err(TrySendError::Full(_)) => {
                warn!(%conn_id, kind = %event.kind, "broadcast: member queue full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                // Receiver torn down; the disconnect path will evict it.
            }
        }
    }

    debug!(%presentation_id, kind = %event.kind, delivered, "broadcast: fanout");
}

#[cfg(test)]
#[path = "broadcast_test.rs"]
mod tests;
